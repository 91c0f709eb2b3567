/// Core types shared by every metadata component.
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Inode number of the filesystem root. Always present while the engine lives.
pub const ROOT_INODE: u32 = 1;

/// Chunk geometry. A chunk covers 64 MiB of file data.
pub const CHUNK_BITS: u32 = 26;
pub const CHUNK_SIZE: u64 = 1 << CHUNK_BITS;
pub const CHUNK_MASK: u64 = CHUNK_SIZE - 1;
/// Data block inside a chunk.
pub const BLOCK_SIZE: u64 = 0x10000;
/// Per-chunk header kept by chunkservers, accounted in `size`.
pub const CHUNK_HEADER_SIZE: u64 = 0x1400;

pub const MAX_FILE_INDEX: u32 = 0x7FFFFFFF;
pub const MAX_NAME_LENGTH: usize = 255;
pub const MAX_XATTR_NAME_LENGTH: usize = 255;
pub const MAX_XATTR_VALUE_LENGTH: usize = 65536;
pub const MAX_XATTR_LIST_LENGTH: usize = 65536;

pub const DEFAULT_GOAL: u8 = 1;
pub const DEFAULT_TRASHTIME: u32 = 86400;

/// Freed inode numbers are quarantined for this long before reuse.
pub const INODE_REUSE_DELAY: u32 = 86400;

/// Status of every engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FsStatus {
    Ok = 0,
    NotPermitted = 1,
    NotFound = 2,
    AccessDenied = 3,
    AlreadyExists = 4,
    InvalidArgument = 5,
    NotDirectory = 6,
    IsDirectory = 7,
    NotEmpty = 8,
    ReadOnlyFs = 9,
    QuotaExceeded = 10,
    IndexTooBig = 11,
    NoSuchChunk = 12,
    ChunkLocked = 13,
    Mismatch = 14,
    Delayed = 15,
    TempNotPossible = 16,
    BadMetadataChecksum = 17,
    IoError = 18,
    Waiting = 19,
    NotDone = 20,
    CantCreatePath = 21,
    Parse = 22,
}

impl FsStatus {
    pub fn is_ok(self) -> bool {
        self == FsStatus::Ok
    }
}

/// On-disk / changelog node type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum NodeType {
    File = b'f',
    Directory = b'd',
    Symlink = b'l',
    Fifo = b'q',
    BlockDev = b'b',
    CharDev = b'c',
    Socket = b's',
    Trash = b't',
    Reserved = b'r',
}

impl NodeType {
    pub fn is_file_kind(self) -> bool {
        matches!(self, NodeType::File | NodeType::Trash | NodeType::Reserved)
    }

    pub fn is_device(self) -> bool {
        matches!(self, NodeType::BlockDev | NodeType::CharDev)
    }
}

/// Policy for clearing set-uid/set-gid bits on ownership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SugidClearMode {
    Never = 0,
    Always = 1,
    Osx = 2,
    Bsd = 3,
    Ext = 4,
    Xfs = 5,
}

/// Which master instance this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Personality {
    /// Owns the namespace, emits changelog records.
    Master,
    /// Replays changelog records received from the master.
    Shadow,
}

/// setattr field selection mask.
pub const SET_MODE: u8 = 0x01;
pub const SET_UID: u8 = 0x02;
pub const SET_GID: u8 = 0x04;
pub const SET_MTIME_NOW: u8 = 0x08;
pub const SET_ATIME: u8 = 0x10;
pub const SET_MTIME: u8 = 0x20;
pub const SET_ATIME_NOW: u8 = 0x40;

/// Access mode bits used by `access` checks.
pub const MODE_MASK_R: u8 = 4;
pub const MODE_MASK_W: u8 = 2;
pub const MODE_MASK_X: u8 = 1;

/// Extra-attribute flags stored in bits 12..16 of `mode`.
pub const EATTR_NOOWNER: u16 = 0x01;
pub const EATTR_NOACACHE: u16 = 0x02;
pub const EATTR_NOECACHE: u16 = 0x04;
pub const EATTR_NODATACACHE: u16 = 0x08;

/// Recursive-operation mode: set / increase / decrease, optionally recursive.
pub const SMODE_SET: u8 = 0;
pub const SMODE_INCREASE: u8 = 1;
pub const SMODE_DECREASE: u8 = 2;
pub const SMODE_TMASK: u8 = 3;
pub const SMODE_RMASK: u8 = 4;

/// Session flags passed down from the session module.
pub const SESFLAG_READONLY: u8 = 0x01;
pub const SESFLAG_DYNAMICIP: u8 = 0x02;
pub const SESFLAG_IGNOREGID: u8 = 0x04;
pub const SESFLAG_MAPALL: u8 = 0x08;

/// Detached-listing type selector (trash/reserved browsing).
pub const DTYPE_TRASH: u8 = 1;
pub const DTYPE_RESERVED: u8 = 2;

/// Recursive aggregate kept per directory and reported by stat calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsRecord {
    pub inodes: u32,
    pub dirs: u32,
    pub files: u32,
    pub chunks: u32,
    pub length: u64,
    pub size: u64,
    pub realsize: u64,
}

impl StatsRecord {
    pub fn add(&mut self, other: &StatsRecord) {
        self.inodes = self.inodes.wrapping_add(other.inodes);
        self.dirs = self.dirs.wrapping_add(other.dirs);
        self.files = self.files.wrapping_add(other.files);
        self.chunks = self.chunks.wrapping_add(other.chunks);
        self.length = self.length.wrapping_add(other.length);
        self.size = self.size.wrapping_add(other.size);
        self.realsize = self.realsize.wrapping_add(other.realsize);
    }

    pub fn sub(&mut self, other: &StatsRecord) {
        self.inodes = self.inodes.wrapping_sub(other.inodes);
        self.dirs = self.dirs.wrapping_sub(other.dirs);
        self.files = self.files.wrapping_sub(other.files);
        self.chunks = self.chunks.wrapping_sub(other.chunks);
        self.length = self.length.wrapping_sub(other.length);
        self.size = self.size.wrapping_sub(other.size);
        self.realsize = self.realsize.wrapping_sub(other.realsize);
    }

    /// Delta between two snapshots of the same node.
    pub fn delta(new: &StatsRecord, old: &StatsRecord) -> StatsRecord {
        let mut d = *new;
        d.sub(old);
        d
    }
}

/// Attributes returned to the session layer by lookups and stat calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    pub inode: u32,
    pub node_type: u8,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub nlink: u32,
    pub length: u64,
    pub rdev: u32,
}

/// Per-request context: session root, session flags and (mapped) ids.
#[derive(Debug, Clone, Copy)]
pub struct FsContext {
    pub rootinode: u32,
    pub sesflags: u8,
    pub uid: u32,
    pub gid: u32,
    pub auid: u32,
    pub agid: u32,
    pub ts: u32,
}

impl FsContext {
    pub fn new(rootinode: u32, sesflags: u8, uid: u32, gid: u32, ts: u32) -> Self {
        FsContext { rootinode, sesflags, uid, gid, auid: uid, agid: gid, ts }
    }

    /// Context used by internal and replayed operations.
    pub fn internal(ts: u32) -> Self {
        FsContext { rootinode: ROOT_INODE, sesflags: 0, uid: 0, gid: 0, auid: 0, agid: 0, ts }
    }

    pub fn read_only(&self) -> bool {
        self.sesflags & SESFLAG_READONLY != 0
    }
}

/// States of the file side of an inode listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    GetCurrent,
    ForceRecalculate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn node_type_bytes_match_wire_format() {
        assert_eq!(u8::from(NodeType::File), b'f');
        assert_eq!(u8::from(NodeType::Trash), b't');
        assert_eq!(NodeType::try_from(b'd').unwrap(), NodeType::Directory);
        assert!(NodeType::try_from(b'x').is_err());
    }

    #[test]
    fn stats_delta_roundtrip() {
        let old = StatsRecord { inodes: 1, files: 1, length: 100, size: 4096, ..Default::default() };
        let new = StatsRecord { inodes: 1, files: 1, length: 50, size: 4096, ..Default::default() };
        let d = StatsRecord::delta(&new, &old);
        let mut restored = old;
        restored.add(&d);
        assert_eq!(restored, new);
    }
}
