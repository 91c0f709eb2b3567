/// Section-framed metadata image.
///
/// The on-disk layout is fixed for interoperability: an 8-byte magic, a
/// 16-byte preamble, then tagged sections each carrying an 8-byte label
/// and a 64-bit body length, closed by a literal EOF marker. Legacy
/// unsectioned images are still loadable and get rewritten in the
/// current format on the next dump.
use std::convert::TryFrom;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::*;
use zerocopy::byteorder::{U32, U64};
use zerocopy::{AsBytes, BigEndian, FromBytes, Unaligned};

use crate::meta_lib::codec::{put16, put32, put64, put8, read_exact_buf, Unpacker};
use crate::meta_lib::hashfn::{add_to_checksum, EDGE_CHECKSUM_SEED, NODE_CHECKSUM_SEED};
use crate::meta_lib::node::{edge_checksum, FsNode, Payload, TrashKey};
use crate::meta_lib::types::NodeType;
use crate::meta_lib::Engine;

pub const MAGIC_LEGACY_15: &[u8; 8] = b"MFSM 1.5";
pub const MAGIC_LEGACY_16: &[u8; 8] = b"MFSM 1.6";
pub const MAGIC_SECTIONED: &[u8; 8] = b"MFSM 2.0";
pub const MAGIC_WITH_LOCK_IDS: &[u8; 8] = b"LIZM 2.9";
pub const EOF_MARKER: &[u8; 16] = b"[MFS EOF MARKER]";

#[derive(AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct Preamble {
    maxnodeid: U32<BigEndian>,
    metaversion: U64<BigEndian>,
    nextsessionid: U32<BigEndian>,
}

#[derive(AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct SectionHeader {
    tag: [u8; 8],
    length: U64<BigEndian>,
}

fn store_node(buf: &mut Vec<u8>, node: &FsNode) {
    put8(buf, node.node_type.into());
    put32(buf, node.id);
    put8(buf, node.goal);
    put16(buf, node.mode);
    put32(buf, node.uid);
    put32(buf, node.gid);
    put32(buf, node.atime);
    put32(buf, node.mtime);
    put32(buf, node.ctime);
    put32(buf, node.trashtime);
    match &node.payload {
        Payload::Directory(_) | Payload::None => {}
        Payload::Device(rdev) => put32(buf, *rdev),
        Payload::Symlink(path) => {
            put32(buf, path.len() as u32);
            buf.extend_from_slice(path);
        }
        Payload::File(f) => {
            put64(buf, f.length);
            let ch = f.chunk_count();
            put32(buf, ch);
            put16(buf, f.sessions.len() as u16);
            for i in 0..ch as usize {
                put64(buf, f.chunks[i]);
            }
            for &session in &f.sessions {
                put32(buf, session);
            }
        }
    }
}

fn load_node(u: &mut Unpacker) -> Result<Option<FsNode>> {
    let type_byte = u.get8()?;
    if type_byte == 0 {
        return Ok(None);
    }
    let node_type = NodeType::try_from(type_byte)
        .map_err(|_| anyhow::anyhow!("unrecognized node type byte {:#x}", type_byte))?;
    let id = u.get32()?;
    let mut node = FsNode::new(id, node_type, 0);
    node.goal = u.get8()?;
    node.mode = u.get16()?;
    node.uid = u.get32()?;
    node.gid = u.get32()?;
    node.atime = u.get32()?;
    node.mtime = u.get32()?;
    node.ctime = u.get32()?;
    node.trashtime = u.get32()?;
    match node_type {
        NodeType::Directory | NodeType::Fifo | NodeType::Socket => {}
        NodeType::BlockDev | NodeType::CharDev => {
            node.payload = Payload::Device(u.get32()?);
        }
        NodeType::Symlink => {
            let pleng = u.get32()? as usize;
            node.payload = Payload::Symlink(u.get_bytes(pleng)?);
        }
        NodeType::File | NodeType::Trash | NodeType::Reserved => {
            let length = u.get64()?;
            let ch = u.get32()? as usize;
            let session_count = u.get16()? as usize;
            let mut chunks = Vec::with_capacity(ch);
            for _ in 0..ch {
                chunks.push(u.get64()?);
            }
            let mut sessions = Vec::with_capacity(session_count);
            for _ in 0..session_count {
                sessions.push(u.get32()?);
            }
            node.payload = Payload::File(crate::meta_lib::node::FileData { length, chunks, sessions });
        }
    }
    Ok(Some(node))
}

impl Engine {
    fn store_nodes(&self, buf: &mut Vec<u8>) {
        for node in self.nodes.values() {
            store_node(buf, node);
        }
        put8(buf, 0); // end marker
    }

    fn load_nodes(&mut self, u: &mut Unpacker) -> Result<()> {
        while let Some(node) = load_node(u)? {
            let id = node.id;
            if self.nodes.contains_key(&id) {
                bail!("duplicate inode {} in image", id);
            }
            self.inode_pool.mark_acquired(id);
            if id > self.maxnodeid {
                self.maxnodeid = id;
            }
            self.node_count += 1;
            if node.node_type == NodeType::Directory {
                self.dirnode_count += 1;
            }
            if node.node_type.is_file_kind() {
                self.filenode_count += 1;
                self.quotas.update_size(node.uid, node.gid, node.stats().size as i64);
            }
            self.quotas.register_inode(node.uid, node.gid);
            self.nodes.insert(id, node);
            self.update_node_checksum(id);
        }
        Ok(())
    }

    fn store_edges(&self, buf: &mut Vec<u8>) {
        // parents before children so subtree stats rebuild on load
        let mut stack = vec![crate::meta_lib::types::ROOT_INODE];
        while let Some(dir_id) = stack.pop() {
            if let Some(dir) = self.nodes.get(&dir_id).and_then(|n| n.dir()) {
                for (name, &child) in &dir.children {
                    put32(buf, dir_id);
                    put32(buf, child);
                    put16(buf, name.len() as u16);
                    buf.extend_from_slice(name);
                    if self.nodes.get(&child).map(|n| n.is_directory()).unwrap_or(false) {
                        stack.push(child);
                    }
                }
            }
        }
        for (key, path) in &self.trash {
            put32(buf, 0);
            put32(buf, key.id);
            put16(buf, path.len() as u16);
            buf.extend_from_slice(path);
        }
        for (&id, path) in &self.reserved {
            put32(buf, 0);
            put32(buf, id);
            put16(buf, path.len() as u16);
            buf.extend_from_slice(path);
        }
        // end marker
        put32(buf, 0);
        put32(buf, 0);
        put16(buf, 0);
    }

    fn load_edges(&mut self, u: &mut Unpacker) -> Result<()> {
        loop {
            let parent = u.get32()?;
            let child = u.get32()?;
            let nleng = u.get16()? as usize;
            if parent == 0 && child == 0 {
                return Ok(());
            }
            if nleng == 0 {
                bail!("edge {}->{} has an empty name", parent, child);
            }
            let name = u.get_bytes(nleng)?;
            let child_node = match self.nodes.get(&child) {
                Some(n) => n,
                None => bail!("edge {}->{}: child not found", parent, child),
            };
            if parent == 0 {
                let length = child_node.file().map(|f| f.length).unwrap_or(0);
                match child_node.node_type {
                    NodeType::Trash => {
                        let key = TrashKey::for_node(child_node);
                        add_to_checksum(&mut self.edges_checksum, edge_checksum(None, child, &name));
                        self.trash.insert(key, name);
                        self.trashspace += length;
                        self.trashnode_count += 1;
                    }
                    NodeType::Reserved => {
                        add_to_checksum(&mut self.edges_checksum, edge_checksum(None, child, &name));
                        self.reserved.insert(child, name);
                        self.reservedspace += length;
                        self.reservednode_count += 1;
                    }
                    other => bail!(
                        "edge 0->{}: bad child type {:?} for a detached edge",
                        child,
                        other
                    ),
                }
            } else {
                match self.nodes.get(&parent) {
                    Some(n) if n.is_directory() => {}
                    Some(_) => bail!("edge {}->{}: parent is not a directory", parent, child),
                    None => bail!("edge {}->{}: parent not found", parent, child),
                }
                self.link_node(0, parent, child, &name);
            }
        }
    }

    fn store_free(&self, buf: &mut Vec<u8>) {
        put32(buf, self.inode_pool.detained_count());
        for detained in self.inode_pool.detained() {
            put32(buf, detained.id);
            put32(buf, detained.ts);
        }
    }

    fn load_free(&mut self, u: &mut Unpacker) -> Result<()> {
        let count = u.get32()?;
        for _ in 0..count {
            let id = u.get32()?;
            let ts = u.get32()?;
            self.inode_pool.detain(id, ts);
        }
        Ok(())
    }

    fn store_locks(&self, buf: &mut Vec<u8>) {
        self.flock_locks.store(buf);
        self.posix_locks.store(buf);
    }

    fn load_locks(&mut self, u: &mut Unpacker) -> Result<()> {
        self.flock_locks.load(u)?;
        self.posix_locks.load(u)?;
        Ok(())
    }

    /// Writes the complete image in the current format.
    pub fn store_image(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(MAGIC_WITH_LOCK_IDS).context("writing image magic")?;
        let preamble = Preamble {
            maxnodeid: U32::new(self.maxnodeid),
            metaversion: U64::new(self.metaversion),
            nextsessionid: U32::new(self.nextsessionid),
        };
        w.write_all(preamble.as_bytes()).context("writing image preamble")?;

        let write_section = |w: &mut dyn Write, tag: &[u8; 8], body: &[u8]| -> Result<()> {
            let header = SectionHeader { tag: *tag, length: U64::new(body.len() as u64) };
            w.write_all(header.as_bytes())
                .and_then(|_| w.write_all(body))
                .with_context(|| format!("writing section {:?}", String::from_utf8_lossy(tag)))
        };

        let mut buf = Vec::new();
        self.store_nodes(&mut buf);
        write_section(w, b"NODE 1.0", &buf)?;
        buf.clear();
        self.store_edges(&mut buf);
        write_section(w, b"EDGE 1.0", &buf)?;
        buf.clear();
        self.store_free(&mut buf);
        write_section(w, b"FREE 1.0", &buf)?;
        buf.clear();
        self.xattrs.store(&mut buf);
        write_section(w, b"XATR 1.0", &buf)?;
        buf.clear();
        self.acls.store(&mut buf);
        write_section(w, b"ACLS 1.0", &buf)?;
        buf.clear();
        self.quotas.store(&mut buf);
        write_section(w, b"QUOT 1.1", &buf)?;
        buf.clear();
        self.store_locks(&mut buf);
        write_section(w, b"FLCK 1.0", &buf)?;
        buf.clear();
        self.chunks.store(&mut buf)?;
        write_section(w, b"CHNK 1.0", &buf)?;

        w.write_all(EOF_MARKER).context("writing EOF marker")?;
        Ok(())
    }

    /// Drops all current state before an image load.
    fn reset_for_load(&mut self) {
        self.nodes.clear();
        self.trash.clear();
        self.reserved.clear();
        self.inode_pool = crate::meta_lib::inode_pool::InodePool::new(crate::meta_lib::MAX_REGULAR_INODE);
        self.xattrs = crate::meta_lib::xattr::XattrStore::new();
        self.acls = crate::meta_lib::acl::AclStore::new();
        self.quotas = crate::meta_lib::quota::QuotaDatabase::new();
        self.flock_locks.clear();
        self.posix_locks.clear();
        self.tape_copies.clear();
        self.maxnodeid = 0;
        self.node_count = 0;
        self.dirnode_count = 0;
        self.filenode_count = 0;
        self.trashspace = 0;
        self.reservedspace = 0;
        self.trashnode_count = 0;
        self.reservednode_count = 0;
        self.nodes_checksum = NODE_CHECKSUM_SEED;
        self.edges_checksum = EDGE_CHECKSUM_SEED;
    }

    /// Loads an image in any supported format, replacing current state.
    pub fn load_image(&mut self, r: &mut impl Read, ignore_unknown: bool) -> Result<()> {
        let magic = read_exact_buf(r, 8).context("reading image magic")?;
        let (sectioned, lock_ids) = match <&[u8; 8]>::try_from(magic.as_slice()) {
            Ok(m) if m == MAGIC_LEGACY_15 || m == MAGIC_LEGACY_16 => (false, false),
            Ok(m) if m == MAGIC_SECTIONED => (true, false),
            Ok(m) if m == MAGIC_WITH_LOCK_IDS => (true, true),
            _ => bail!("unrecognized image signature {:?}", String::from_utf8_lossy(&magic)),
        };
        self.reset_for_load();

        let preamble_bytes = read_exact_buf(r, 16).context("reading image preamble")?;
        let preamble = Preamble::read_from(preamble_bytes.as_slice())
            .ok_or_else(|| anyhow::anyhow!("short image preamble"))?;
        self.maxnodeid = preamble.maxnodeid.get();
        self.metaversion = preamble.metaversion.get();
        self.nextsessionid = preamble.nextsessionid.get();

        if sectioned {
            self.load_sections(r, ignore_unknown, lock_ids)?;
        } else {
            info!("legacy unsectioned image, upgrading on next dump");
            let mut rest = Vec::new();
            r.read_to_end(&mut rest).context("reading legacy image body")?;
            let mut u = Unpacker::new(&rest);
            self.load_nodes(&mut u).context("loading nodes")?;
            self.load_edges(&mut u).context("loading edges")?;
            self.load_free(&mut u).context("loading free inodes")?;
            let remainder = u.get_bytes(u.remaining())?;
            self.chunks.load(&mut remainder.as_slice(), false).context("loading chunk registry")?;
        }

        if self.nodes.get(&crate::meta_lib::types::ROOT_INODE).map(|n| !n.is_directory()).unwrap_or(true) {
            bail!("image has no root directory");
        }
        info!(
            "image loaded: {} nodes, {} directories, {} files, metaversion {}",
            self.node_count, self.dirnode_count, self.filenode_count, self.metaversion
        );
        Ok(())
    }

    fn load_sections(&mut self, r: &mut impl Read, ignore_unknown: bool, lock_ids: bool) -> Result<()> {
        loop {
            let header_bytes = read_exact_buf(r, 16).context("reading section header")?;
            if header_bytes.as_slice() == EOF_MARKER {
                return Ok(());
            }
            let header = SectionHeader::read_from(header_bytes.as_slice())
                .ok_or_else(|| anyhow::anyhow!("short section header"))?;
            let body = read_exact_buf(r, header.length.get() as usize)
                .with_context(|| format!("reading section {:?}", String::from_utf8_lossy(&header.tag)))?;
            let mut u = Unpacker::new(&body);
            match &header.tag {
                b"NODE 1.0" => self.load_nodes(&mut u).context("loading nodes")?,
                b"EDGE 1.0" => self.load_edges(&mut u).context("loading edges")?,
                b"FREE 1.0" => self.load_free(&mut u).context("loading free inodes")?,
                b"XATR 1.0" => self.xattrs.load(&mut u).context("loading xattrs")?,
                b"ACLS 1.0" => self.acls.load(&mut u).context("loading acls")?,
                b"QUOT 1.1" => self.quotas.load(&mut u).context("loading quotas")?,
                b"FLCK 1.0" => self.load_locks(&mut u).context("loading file locks")?,
                b"CHNK 1.0" => self
                    .chunks
                    .load(&mut body.as_slice(), lock_ids)
                    .context("loading chunk registry")?,
                tag => {
                    let label = String::from_utf8_lossy(tag).into_owned();
                    if ignore_unknown {
                        warn!("skipping unknown section {:?} ({} bytes)", label, body.len());
                    } else {
                        bail!("unknown section {:?}; pass the ignore flag to skip it", label);
                    }
                }
            }
        }
    }
}

/// Reads just the metadata version from an image file.
pub fn read_image_version(path: &Path) -> Result<u64> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let _magic = read_exact_buf(&mut file, 8).context("reading image magic")?;
    let preamble_bytes = read_exact_buf(&mut file, 16).context("reading image preamble")?;
    let preamble = Preamble::read_from(preamble_bytes.as_slice())
        .ok_or_else(|| anyhow::anyhow!("short image preamble"))?;
    Ok(preamble.metaversion.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::types::{ChecksumMode, FsContext, Personality, ROOT_INODE};
    use crate::meta_lib::xattr::XATTR_SMODE_CREATE_ONLY;
    use crate::meta_lib::Engine;

    fn populated_engine() -> Engine {
        let mut fs = Engine::new_in_memory(Personality::Master);
        let c = FsContext::internal(100);
        let (dir, _) = fs.mkdir(&c, ROOT_INODE, b"projects", 0o755, 0).unwrap();
        let (f, _) = fs.mknod(&c, dir, b"data.bin", NodeType::File, 0o640, 0, 0).unwrap();
        fs.write_chunk(&c, f, 0, 1).unwrap();
        fs.write_chunk(&c, f, 2, 1).unwrap();
        fs.do_setlength(&c, f, 3 * crate::meta_lib::types::CHUNK_SIZE / 2).unwrap();
        fs.symlink(&c, dir, b"shortcut", b"data.bin").unwrap();
        fs.mknod(&c, dir, b"null", NodeType::CharDev, 0o666, 0, 0x0103).unwrap();
        fs.setxattr(&c, f, b"user.origin", b"unit-test", XATTR_SMODE_CREATE_ONLY).unwrap();
        fs.acquire(&c, f, 42).unwrap();
        // one file in trash
        let (victim, _) = fs.mknod(&c, dir, b"victim", NodeType::File, 0o644, 0, 0).unwrap();
        fs.unlink(&c, dir, b"victim").unwrap();
        assert_eq!(fs.node(victim).unwrap().node_type, NodeType::Trash);
        // a quarantined inode number
        let (gone, _) = fs.mknod(&c, dir, b"gone", NodeType::File, 0o644, 0, 0).unwrap();
        fs.settrashtime(&c, gone, 0, crate::meta_lib::types::SMODE_SET, 0, 10).unwrap();
        fs.unlink(&c, dir, b"gone").unwrap();
        // quota and locks
        fs.quota_set(
            &c,
            crate::meta_lib::quota::QuotaOwnerType::User,
            1000,
            crate::meta_lib::quota::QuotaRigor::Hard,
            crate::meta_lib::quota::QuotaResource::Size,
            1 << 30,
        )
        .unwrap();
        fs.posix_locks.exclusive(f, 0, 100, crate::meta_lib::locks::LockOwner { owner: 7, sessionid: 42 }, false);
        fs
    }

    #[test]
    fn image_roundtrip_preserves_checksum() {
        let mut fs = populated_engine();
        let mut image = Vec::new();
        fs.store_image(&mut image).unwrap();

        let mut restored = Engine::new_in_memory(Personality::Master);
        restored.load_image(&mut image.as_slice(), false).unwrap();
        assert_eq!(restored.metaversion(), fs.metaversion());
        assert_eq!(restored.info(), fs.info());
        assert_eq!(
            restored.checksum(ChecksumMode::ForceRecalculate),
            fs.checksum(ChecksumMode::ForceRecalculate)
        );
        // derived structures came back too
        assert_eq!(restored.readtrash(0, 10), fs.readtrash(0, 10));
        assert_eq!(restored.inode_pool.detained_count(), 1);
        assert_eq!(restored.posix_locks.active_ranges(3), fs.posix_locks.active_ranges(3));
    }

    #[test]
    fn image_roundtrip_preserves_dir_stats() {
        let mut fs = populated_engine();
        let c = FsContext::internal(200);
        let before = fs.get_dir_stats(&c, ROOT_INODE).unwrap();
        let mut image = Vec::new();
        fs.store_image(&mut image).unwrap();
        let mut restored = Engine::new_in_memory(Personality::Master);
        restored.load_image(&mut image.as_slice(), false).unwrap();
        assert_eq!(restored.get_dir_stats(&c, ROOT_INODE).unwrap(), before);
    }

    #[test]
    fn unknown_section_respects_ignore_flag() {
        let fs = populated_engine();
        let mut image = Vec::new();
        fs.store_image(&mut image).unwrap();
        // splice an unknown section right before the EOF marker
        let eof_at = image.len() - 16;
        let mut spliced = image[..eof_at].to_vec();
        let header = SectionHeader { tag: *b"FUNK 9.9", length: U64::new(4) };
        spliced.extend_from_slice(header.as_bytes());
        spliced.extend_from_slice(&[1, 2, 3, 4]);
        spliced.extend_from_slice(EOF_MARKER);

        let mut strict = Engine::new_in_memory(Personality::Master);
        assert!(strict.load_image(&mut spliced.as_slice(), false).is_err());
        let mut lax = Engine::new_in_memory(Personality::Master);
        lax.load_image(&mut spliced.as_slice(), true).unwrap();
        assert_eq!(lax.info().nodes, fs.info().nodes);
    }

    #[test]
    fn legacy_unsectioned_image_loads() {
        let mut fs = populated_engine();
        // hand-build the old format: magic, preamble, NODE/EDGE/FREE bodies
        // back to back, then the raw chunk registry
        let mut image = Vec::new();
        image.extend_from_slice(MAGIC_LEGACY_16);
        let preamble = Preamble {
            maxnodeid: U32::new(fs.maxnodeid),
            metaversion: U64::new(fs.metaversion),
            nextsessionid: U32::new(fs.nextsessionid),
        };
        image.extend_from_slice(preamble.as_bytes());
        let mut body = Vec::new();
        fs.store_nodes(&mut body);
        fs.store_edges(&mut body);
        fs.store_free(&mut body);
        image.extend_from_slice(&body);
        fs.chunks.store(&mut image).unwrap();

        let mut restored = Engine::new_in_memory(Personality::Master);
        restored.load_image(&mut image.as_slice(), false).unwrap();
        assert_eq!(restored.info(), fs.info());
        // xattrs, acls, quotas and locks did not exist in the old format
        assert_eq!(restored.listxattr(&FsContext::internal(0), 3).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn sectioned_image_without_lock_ids_loads() {
        let mut fs = populated_engine();
        let mut image = Vec::new();
        fs.store_image(&mut image).unwrap();
        image[..8].copy_from_slice(MAGIC_SECTIONED);
        let mut restored = Engine::new_in_memory(Personality::Master);
        restored.load_image(&mut image.as_slice(), false).unwrap();
        assert_eq!(restored.info(), fs.info());
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let fs = populated_engine();
        let mut image = Vec::new();
        fs.store_image(&mut image).unwrap();

        let mut bad_magic = image.clone();
        bad_magic[..8].copy_from_slice(b"NOTANIMG");
        let mut engine = Engine::new_in_memory(Personality::Master);
        assert!(engine.load_image(&mut bad_magic.as_slice(), false).is_err());

        let truncated = &image[..image.len() / 2];
        let mut engine = Engine::new_in_memory(Personality::Master);
        assert!(engine.load_image(&mut &truncated[..], false).is_err());
    }

    #[test]
    fn open_sessions_survive_the_image() {
        let fs = populated_engine();
        let mut image = Vec::new();
        fs.store_image(&mut image).unwrap();
        let mut restored = Engine::new_in_memory(Personality::Master);
        restored.load_image(&mut image.as_slice(), false).unwrap();
        let f = restored.lookup_child(restored.lookup_child(ROOT_INODE, b"projects").unwrap(), b"data.bin").unwrap();
        assert_eq!(restored.node(f).unwrap().file().unwrap().sessions, vec![42]);
    }

    #[test]
    fn version_peek_matches_full_load() {
        let fs = populated_engine();
        let dir = std::env::temp_dir().join(format!("metafs-store-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("metadata.mfs");
        let mut file = File::create(&path).unwrap();
        fs.store_image(&mut file).unwrap();
        drop(file);
        assert_eq!(read_image_version(&path).unwrap(), fs.metaversion());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
