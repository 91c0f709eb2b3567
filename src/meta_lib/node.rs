/// The namespace graph: inodes, edges, trash and reserved lists.
///
/// Nodes live in an arena keyed by inode number. Directory payloads own
/// their child edges (name -> inode); children keep a list of parent ids
/// for backlink traversal, so hard links are cheap in both directions.
use std::collections::BTreeMap;

use log::*;

use crate::meta_lib::acl::AclType;
use crate::meta_lib::hashfn::{
    add_to_checksum, hash_combine, hash_combine_bytes, remove_from_checksum, EDGE_CHECKSUM_SEED,
    NODE_CHECKSUM_SEED,
};
use crate::meta_lib::types::*;
use crate::meta_lib::Engine;

/// Trash entries are ordered by expiry deadline, ties broken by inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrashKey {
    pub deadline: u64,
    pub id: u32,
}

impl TrashKey {
    pub fn for_node(node: &FsNode) -> TrashKey {
        TrashKey { deadline: node.ctime as u64 + node.trashtime as u64, id: node.id }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DirData {
    pub children: BTreeMap<Vec<u8>, u32>,
    pub stats: StatsRecord,
    pub nlink: u32,
}

#[derive(Debug, Default, Clone)]
pub struct FileData {
    pub length: u64,
    /// Dense chunk table; 0 means a hole.
    pub chunks: Vec<u64>,
    /// Sessions currently holding this file open.
    pub sessions: Vec<u32>,
}

impl FileData {
    /// Index of the last nonzero chunk plus one.
    pub fn chunk_count(&self) -> u32 {
        let mut count = 0;
        for (i, &c) in self.chunks.iter().enumerate() {
            if c != 0 {
                count = i as u32 + 1;
            }
        }
        count
    }

    /// Number of nonzero chunks, disregarding holes.
    pub fn nonzero_chunks(&self) -> u32 {
        self.chunks.iter().filter(|&&c| c != 0).count() as u32
    }

    fn last_chunk_blocks(&self) -> u64 {
        let last_byte = self.length - 1;
        let last_byte_offset = last_byte % CHUNK_SIZE;
        last_byte_offset / BLOCK_SIZE + 1
    }

    fn last_chunk_nonempty(&self) -> bool {
        if self.chunks.is_empty() || self.length == 0 {
            return false;
        }
        let last_chunk = ((self.length - 1) >> CHUNK_BITS) as usize;
        last_chunk < self.chunks.len() && self.chunks[last_chunk] != 0
    }

    /// The "size" statistic: whole chunks plus the tail, with chunk headers.
    pub fn file_size(&self) -> u64 {
        let nonzero = self.nonzero_chunks() as u64;
        let mut size = nonzero * (CHUNK_SIZE + CHUNK_HEADER_SIZE);
        if self.last_chunk_nonempty() {
            size -= CHUNK_SIZE;
            size += self.last_chunk_blocks() * BLOCK_SIZE;
        }
        size
    }
}

#[derive(Debug, Clone)]
pub enum Payload {
    Directory(DirData),
    File(FileData),
    Symlink(Vec<u8>),
    Device(u32),
    /// FIFO and socket nodes carry no payload.
    None,
}

#[derive(Debug, Clone)]
pub struct FsNode {
    pub id: u32,
    pub node_type: NodeType,
    pub goal: u8,
    /// Low 12 bits: permissions and sugid/sticky. Bits 12..16: eattr flags.
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub trashtime: u32,
    pub parents: Vec<u32>,
    pub checksum: u64,
    pub payload: Payload,
}

impl FsNode {
    pub fn new_directory(id: u32, mode: u16, uid: u32, gid: u32, ts: u32) -> FsNode {
        FsNode {
            id,
            node_type: NodeType::Directory,
            goal: DEFAULT_GOAL,
            mode: mode & 0o7777,
            uid,
            gid,
            atime: ts,
            mtime: ts,
            ctime: ts,
            trashtime: DEFAULT_TRASHTIME,
            parents: Vec::new(),
            checksum: 0,
            payload: Payload::Directory(DirData { nlink: 2, ..Default::default() }),
        }
    }

    pub fn new(id: u32, node_type: NodeType, ts: u32) -> FsNode {
        let payload = match node_type {
            NodeType::Directory => Payload::Directory(DirData { nlink: 2, ..Default::default() }),
            NodeType::File | NodeType::Trash | NodeType::Reserved => {
                Payload::File(FileData::default())
            }
            NodeType::Symlink => Payload::Symlink(Vec::new()),
            NodeType::BlockDev | NodeType::CharDev => Payload::Device(0),
            NodeType::Fifo | NodeType::Socket => Payload::None,
        };
        FsNode {
            id,
            node_type,
            goal: DEFAULT_GOAL,
            mode: 0,
            uid: 0,
            gid: 0,
            atime: ts,
            mtime: ts,
            ctime: ts,
            trashtime: DEFAULT_TRASHTIME,
            parents: Vec::new(),
            checksum: 0,
            payload,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.node_type == NodeType::Directory
    }

    pub fn is_file_kind(&self) -> bool {
        self.node_type.is_file_kind()
    }

    pub fn dir(&self) -> Option<&DirData> {
        match &self.payload {
            Payload::Directory(d) => Some(d),
            _ => None,
        }
    }

    pub fn dir_mut(&mut self) -> Option<&mut DirData> {
        match &mut self.payload {
            Payload::Directory(d) => Some(d),
            _ => None,
        }
    }

    pub fn file(&self) -> Option<&FileData> {
        match &self.payload {
            Payload::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileData> {
        match &mut self.payload {
            Payload::File(f) => Some(f),
            _ => None,
        }
    }

    /// Number of replicas implied by the goal, for the realsize statistic.
    fn goal_copies(&self) -> u64 {
        self.goal.max(1) as u64
    }

    pub fn stats(&self) -> StatsRecord {
        match &self.payload {
            Payload::Directory(d) => {
                let mut sr = d.stats;
                sr.inodes += 1;
                sr.dirs += 1;
                sr
            }
            Payload::File(f) => {
                let size = f.file_size();
                StatsRecord {
                    inodes: 1,
                    dirs: 0,
                    files: 1,
                    chunks: f.nonzero_chunks(),
                    length: f.length,
                    size,
                    realsize: size * self.goal_copies(),
                }
            }
            Payload::Symlink(path) => StatsRecord {
                inodes: 1,
                length: path.len() as u64,
                ..Default::default()
            },
            Payload::Device(_) | Payload::None => {
                StatsRecord { inodes: 1, ..Default::default() }
            }
        }
    }

    pub fn eattr(&self) -> u16 {
        self.mode >> 12
    }

    pub fn attributes(&self) -> Attributes {
        let (nlink, length, rdev) = match &self.payload {
            Payload::Directory(d) => (d.nlink, 0, 0),
            Payload::File(f) => (self.parents.len().max(1) as u32, f.length, 0),
            Payload::Symlink(path) => (self.parents.len().max(1) as u32, path.len() as u64, 0),
            Payload::Device(rdev) => (self.parents.len().max(1) as u32, 0, *rdev),
            Payload::None => (self.parents.len().max(1) as u32, 0, 0),
        };
        Attributes {
            inode: self.id,
            node_type: self.node_type.into(),
            mode: self.mode & 0o7777,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            nlink,
            length,
            rdev,
        }
    }
}

/// Rejects empty names, names over 255 bytes, ".", ".." and names
/// containing '/' or NUL.
pub fn name_check(name: &[u8]) -> FsStatus {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return FsStatus::InvalidArgument;
    }
    if name == b"." || name == b".." {
        return FsStatus::InvalidArgument;
    }
    if name.contains(&b'/') || name.contains(&0) {
        return FsStatus::InvalidArgument;
    }
    FsStatus::Ok
}

pub fn node_checksum(node: &FsNode) -> u64 {
    let mut seed = NODE_CHECKSUM_SEED;
    hash_combine(&mut seed, u8::from(node.node_type) as u64);
    hash_combine(&mut seed, node.id as u64);
    hash_combine(&mut seed, node.goal as u64);
    hash_combine(&mut seed, node.mode as u64);
    hash_combine(&mut seed, node.uid as u64);
    hash_combine(&mut seed, node.gid as u64);
    hash_combine(&mut seed, node.atime as u64);
    hash_combine(&mut seed, node.mtime as u64);
    hash_combine(&mut seed, node.ctime as u64);
    hash_combine(&mut seed, node.trashtime as u64);
    match &node.payload {
        Payload::Device(rdev) => hash_combine(&mut seed, *rdev as u64),
        Payload::Symlink(path) => hash_combine_bytes(&mut seed, path),
        Payload::File(f) => {
            hash_combine(&mut seed, f.length);
            let first = f.chunks.first().copied().unwrap_or(0);
            hash_combine(&mut seed, if f.length == 0 { 0 } else { first });
            let last = if f.length == 0 {
                0
            } else {
                let idx = ((f.length - 1) >> CHUNK_BITS) as usize;
                if idx < f.chunks.len() { f.chunks[idx] } else { 0 }
            };
            hash_combine(&mut seed, last);
        }
        Payload::Directory(_) | Payload::None => {}
    }
    seed
}

/// Hash of an edge; detached (trash/reserved) edges have no parent.
pub fn edge_checksum(parent: Option<u32>, child: u32, name: &[u8]) -> u64 {
    let mut seed = EDGE_CHECKSUM_SEED;
    if let Some(parent) = parent {
        hash_combine(&mut seed, parent as u64);
    }
    hash_combine(&mut seed, child as u64);
    hash_combine_bytes(&mut seed, name);
    seed
}

impl Engine {
    pub fn node(&self, id: u32) -> Option<&FsNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_mut(&mut self, id: u32) -> Option<&mut FsNode> {
        self.nodes.get_mut(&id)
    }

    pub fn lookup_child(&self, dir_id: u32, name: &[u8]) -> Option<u32> {
        self.node(dir_id)?.dir()?.children.get(name).copied()
    }

    pub(crate) fn get_stats(&self, id: u32) -> StatsRecord {
        self.node(id).map(|n| n.stats()).unwrap_or_default()
    }

    /// Applies a stats delta to a directory and all its ancestors.
    pub(crate) fn add_stats(&mut self, parent_id: u32, sr: &StatsRecord) {
        let mut stack = vec![parent_id];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(&id) {
                if let Some(dir) = node.dir_mut() {
                    dir.stats.add(sr);
                }
                if id != ROOT_INODE {
                    stack.extend(node.parents.iter().copied());
                }
            }
        }
    }

    pub(crate) fn sub_stats(&mut self, parent_id: u32, sr: &StatsRecord) {
        let mut stack = vec![parent_id];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(&id) {
                if let Some(dir) = node.dir_mut() {
                    dir.stats.sub(sr);
                }
                if id != ROOT_INODE {
                    stack.extend(node.parents.iter().copied());
                }
            }
        }
    }

    /// Replaces a node's old contribution with its new one on every ancestor.
    pub(crate) fn add_sub_stats(&mut self, parent_id: u32, new: &StatsRecord, old: &StatsRecord) {
        let delta = StatsRecord::delta(new, old);
        self.add_stats(parent_id, &delta);
    }

    /// Propagates a stats change of `id` to all its parents.
    pub(crate) fn propagate_stats(&mut self, id: u32, new: &StatsRecord, old: &StatsRecord) {
        let parents = self.node(id).map(|n| n.parents.clone()).unwrap_or_default();
        for parent in parents {
            self.add_sub_stats(parent, new, old);
        }
    }

    pub(crate) fn next_inode(&mut self, ts: u32, req_inode: u32) -> u32 {
        let id = if req_inode != 0 && self.inode_pool.mark_acquired(req_inode) {
            req_inode
        } else {
            self.inode_pool.acquire(ts)
        };
        if id > self.maxnodeid {
            self.maxnodeid = id;
        }
        id
    }

    /// Adds the edge parent/name -> child and maintains every derived value.
    /// `ts == 0` skips the time updates (image load path).
    pub(crate) fn link_node(&mut self, ts: u32, parent_id: u32, child_id: u32, name: &[u8]) {
        let child_is_dir;
        let sr;
        {
            let child = match self.nodes.get_mut(&child_id) {
                Some(c) => c,
                None => return,
            };
            child_is_dir = child.is_directory();
            sr = child.stats();
            child.parents.push(parent_id);
            if ts > 0 {
                child.ctime = ts;
            }
        }
        if let Some(parent) = self.nodes.get_mut(&parent_id) {
            if let Some(dir) = parent.dir_mut() {
                dir.children.insert(name.to_vec(), child_id);
                if child_is_dir {
                    dir.nlink += 1;
                }
            }
            if ts > 0 {
                parent.mtime = ts;
                parent.ctime = ts;
            }
        }
        add_to_checksum(&mut self.edges_checksum, edge_checksum(Some(parent_id), child_id, name));
        self.add_stats(parent_id, &sr);
        if ts > 0 {
            self.update_node_checksum(parent_id);
            self.update_node_checksum(child_id);
        }
    }

    /// Removes the edge parent/name -> child; the inverse of `link_node`.
    pub(crate) fn remove_edge(&mut self, ts: u32, parent_id: u32, name: &[u8], child_id: u32) {
        let child_is_dir;
        let sr;
        {
            let child = match self.nodes.get_mut(&child_id) {
                Some(c) => c,
                None => return,
            };
            child_is_dir = child.is_directory();
            sr = child.stats();
            if let Some(pos) = child.parents.iter().position(|&p| p == parent_id) {
                child.parents.remove(pos);
            }
            child.ctime = ts;
        }
        if let Some(parent) = self.nodes.get_mut(&parent_id) {
            if let Some(dir) = parent.dir_mut() {
                dir.children.remove(name);
                if child_is_dir {
                    dir.nlink -= 1;
                }
            }
            parent.mtime = ts;
            parent.ctime = ts;
        }
        remove_from_checksum(
            &mut self.edges_checksum,
            edge_checksum(Some(parent_id), child_id, name),
        );
        self.sub_stats(parent_id, &sr);
        self.update_node_checksum(parent_id);
        self.update_node_checksum(child_id);
    }

    /// Creates a node under `parent_id` and links it. Inherits goal and
    /// trashtime for files and directories, gid from setgid parents, and
    /// permissions from the parent's default ACL when present.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_node(
        &mut self,
        ts: u32,
        parent_id: u32,
        name: &[u8],
        node_type: NodeType,
        mode: u16,
        umask: u16,
        uid: u32,
        gid: u32,
        copysgid: bool,
        req_inode: u32,
    ) -> u32 {
        let id = self.next_inode(ts, req_inode);
        let (parent_goal, parent_trashtime, parent_mode, parent_gid) = {
            let parent = &self.nodes[&parent_id];
            (parent.goal, parent.trashtime, parent.mode, parent.gid)
        };
        let mut node = FsNode::new(id, node_type, ts);
        if matches!(node_type, NodeType::Directory | NodeType::File) {
            node.goal = parent_goal;
            node.trashtime = parent_trashtime;
        }
        if node_type == NodeType::Directory {
            node.mode = (mode & 0o7777) | (parent_mode & 0xF000);
        } else {
            // everything except directories drops the no-entry-cache flag
            node.mode = (mode & 0o7777) | (parent_mode & 0xF000 & !(EATTR_NOECACHE << 12));
        }
        node.uid = uid;
        if parent_mode & 0o2000 != 0 {
            node.gid = parent_gid;
            if copysgid && node_type == NodeType::Directory {
                node.mode |= 0o2000;
            }
        } else {
            node.gid = gid;
        }
        // permissions from the parent's default ACL, umask otherwise
        let default_acl = self.acls.get(parent_id, AclType::Default).cloned();
        if let Some(dacl) = default_acl {
            let mut acl = dacl.clone();
            acl.owner_perm &= ((mode >> 6) & 7) as u8;
            match acl.mask {
                Some(m) => acl.mask = Some(m & ((mode >> 3) & 7) as u8),
                None => acl.group_perm &= ((mode >> 3) & 7) as u8,
            }
            acl.other_perm &= (mode & 7) as u8;
            node.mode = (node.mode & !0o777) | (acl.to_mode() & 0o777);
            if acl.is_extended() {
                self.acls.set(id, AclType::Access, acl);
            }
            if node_type == NodeType::Directory {
                self.acls.set(id, AclType::Default, dacl);
            }
        } else {
            node.mode &= !(umask & 0o777);
        }

        self.node_count += 1;
        if node_type == NodeType::Directory {
            self.dirnode_count += 1;
        }
        if node_type == NodeType::File {
            self.filenode_count += 1;
        }
        self.quotas.register_inode(node.uid, node.gid);
        self.nodes.insert(id, node);
        self.update_node_checksum(id);
        self.link_node(ts, parent_id, id, name);
        id
    }

    /// Destroys a node with no remaining references.
    pub(crate) fn remove_node(&mut self, ts: u32, id: u32) {
        let node = match self.nodes.get(&id) {
            Some(n) if n.parents.is_empty() => n,
            Some(_) => return,
            None => return,
        };
        let uid = node.uid;
        let gid = node.gid;
        let node_type = node.node_type;
        let goal = node.goal;
        let size = node.stats().size as i64;
        let chunk_ids: Vec<u64> = node.file().map(|f| f.chunks.clone()).unwrap_or_default();

        let checksum = node.checksum;
        if self.background.is_node_included(id) {
            remove_from_checksum(&mut self.background.nodes_checksum, checksum);
        }
        remove_from_checksum(&mut self.nodes_checksum, checksum);
        self.nodes.remove(&id);

        self.node_count -= 1;
        if node_type == NodeType::Directory {
            self.dirnode_count -= 1;
        }
        if node_type.is_file_kind() {
            self.filenode_count -= 1;
            self.quotas.update_size(uid, gid, -size);
            for chunk_id in chunk_ids {
                if chunk_id > 0 && self.chunks.delete_file(chunk_id, goal) != FsStatus::Ok {
                    error!("structure error - chunk {:016X} not found (inode: {})", chunk_id, id);
                }
            }
        }
        self.inode_pool.release(id, ts);
        for key in self.xattrs.inode_keys(id) {
            if let Some(hash) = self.xattrs.entry_hash(&key) {
                self.update_xattr_checksum(&key, hash, 0);
            }
        }
        self.xattrs.remove_inode(id);
        self.acls.remove_inode(id);
        self.quotas.unregister_inode(uid, gid);
        self.tape_copies.remove(&id);
    }

    /// Unlinks one edge; the child moves to trash, to reserved, or away.
    pub(crate) fn unlink_node(&mut self, ts: u32, parent_id: u32, name: &[u8], child_id: u32) {
        let mut path = Vec::new();
        {
            let child = match self.node(child_id) {
                Some(c) => c,
                None => return,
            };
            if child.parents.len() == 1 && child.node_type == NodeType::File {
                let keeps_data = child.trashtime > 0
                    || child.file().map(|f| !f.sessions.is_empty()).unwrap_or(false);
                if keeps_data {
                    path = self.get_path(parent_id, child_id);
                }
            }
        }
        self.remove_edge(ts, parent_id, name, child_id);
        let (has_parents, node_type, trashtime, length, has_sessions) = {
            let child = match self.node(child_id) {
                Some(c) => c,
                None => return,
            };
            (
                !child.parents.is_empty(),
                child.node_type,
                child.trashtime,
                child.file().map(|f| f.length).unwrap_or(0),
                child.file().map(|f| !f.sessions.is_empty()).unwrap_or(false),
            )
        };
        if has_parents {
            return;
        }
        if node_type == NodeType::File {
            if trashtime > 0 {
                if let Some(child) = self.node_mut(child_id) {
                    child.node_type = NodeType::Trash;
                    child.ctime = ts;
                }
                self.update_node_checksum(child_id);
                let key = TrashKey::for_node(&self.nodes[&child_id]);
                add_to_checksum(&mut self.edges_checksum, edge_checksum(None, child_id, &path));
                self.trash.insert(key, path);
                self.trashspace += length;
                self.trashnode_count += 1;
            } else if has_sessions {
                if let Some(child) = self.node_mut(child_id) {
                    child.node_type = NodeType::Reserved;
                }
                self.update_node_checksum(child_id);
                add_to_checksum(&mut self.edges_checksum, edge_checksum(None, child_id, &path));
                self.reserved.insert(child_id, path);
                self.reservedspace += length;
                self.reservednode_count += 1;
            } else {
                self.remove_node(ts, child_id);
            }
        } else {
            self.remove_node(ts, child_id);
        }
    }

    /// Expires or releases a detached node. Returns true when it was
    /// destroyed, false when a trash node still had open sessions and
    /// became reserved instead.
    pub(crate) fn purge_node(&mut self, ts: u32, id: u32) -> Option<bool> {
        let node = self.node(id)?;
        match node.node_type {
            NodeType::Trash => {
                let key = TrashKey::for_node(node);
                let length = node.file().map(|f| f.length).unwrap_or(0);
                let has_sessions = node.file().map(|f| !f.sessions.is_empty()).unwrap_or(false);
                let path = self.trash.remove(&key).unwrap_or_default();
                self.trashspace -= length;
                self.trashnode_count -= 1;
                if has_sessions {
                    if let Some(node) = self.node_mut(id) {
                        node.node_type = NodeType::Reserved;
                    }
                    self.update_node_checksum(id);
                    self.reserved.insert(id, path);
                    self.reservedspace += length;
                    self.reservednode_count += 1;
                    Some(false)
                } else {
                    remove_from_checksum(&mut self.edges_checksum, edge_checksum(None, id, &path));
                    if let Some(node) = self.node_mut(id) {
                        node.ctime = ts;
                    }
                    self.update_node_checksum(id);
                    self.remove_node(ts, id);
                    Some(true)
                }
            }
            NodeType::Reserved => {
                let length = node.file().map(|f| f.length).unwrap_or(0);
                let path = self.reserved.remove(&id).unwrap_or_default();
                remove_from_checksum(&mut self.edges_checksum, edge_checksum(None, id, &path));
                self.reservedspace -= length;
                self.reservednode_count -= 1;
                if let Some(node) = self.node_mut(id) {
                    node.ctime = ts;
                }
                self.update_node_checksum(id);
                self.remove_node(ts, id);
                Some(true)
            }
            _ => None,
        }
    }

    /// Moves a trashed file back into the namespace along its stored path,
    /// creating missing directories.
    pub(crate) fn undel_node(&mut self, ts: u32, id: u32) -> FsStatus {
        let (key, path) = {
            let node = match self.node(id) {
                Some(n) if n.node_type == NodeType::Trash => n,
                _ => return FsStatus::InvalidArgument,
            };
            let key = TrashKey::for_node(node);
            match self.trash.get(&key) {
                Some(p) => (key, p.clone()),
                None => return FsStatus::CantCreatePath,
            }
        };
        let parts = match split_undel_path(&path) {
            Some(parts) => parts,
            None => return FsStatus::CantCreatePath,
        };
        let (uid, gid, length) = {
            let node = &self.nodes[&id];
            (node.uid, node.gid, node.file().map(|f| f.length).unwrap_or(0))
        };
        // walk the path, creating directories as needed
        let mut dir_id = ROOT_INODE;
        for part in &parts[..parts.len() - 1] {
            match self.lookup_child(dir_id, part) {
                Some(next) => {
                    if !self.nodes[&next].is_directory() {
                        return FsStatus::CantCreatePath;
                    }
                    dir_id = next;
                }
                None => {
                    dir_id = self.create_node(
                        ts,
                        dir_id,
                        part,
                        NodeType::Directory,
                        0o755,
                        0,
                        uid,
                        gid,
                        false,
                        0,
                    );
                }
            }
        }
        let leaf = &parts[parts.len() - 1];
        if self.lookup_child(dir_id, leaf).is_some() {
            return FsStatus::AlreadyExists;
        }
        self.trash.remove(&key);
        remove_from_checksum(&mut self.edges_checksum, edge_checksum(None, id, &path));
        self.trashspace -= length;
        self.trashnode_count -= 1;
        if let Some(node) = self.node_mut(id) {
            node.node_type = NodeType::File;
            node.ctime = ts;
        }
        self.update_node_checksum(id);
        self.link_node(ts, dir_id, id, leaf);
        FsStatus::Ok
    }

    /// Full path of `child` seen from the root, via its first parent chain.
    pub(crate) fn get_path(&self, parent_id: u32, child_id: u32) -> Vec<u8> {
        let mut segments: Vec<Vec<u8>> = Vec::new();
        let mut current = child_id;
        let mut parent = parent_id;
        loop {
            let name = match self.node(parent).and_then(|p| p.dir()).and_then(|d| {
                d.children.iter().find(|(_, &id)| id == current).map(|(n, _)| n.clone())
            }) {
                Some(n) => n,
                None => break,
            };
            segments.push(name);
            if parent == ROOT_INODE {
                break;
            }
            current = parent;
            parent = match self.node(parent).and_then(|n| n.parents.first().copied()) {
                Some(p) => p,
                None => break,
            };
        }
        let mut path = Vec::new();
        for segment in segments.iter().rev() {
            path.push(b'/');
            path.extend_from_slice(segment);
        }
        path
    }

    /// True if `ancestor` lies on a parent path of `node`.
    pub(crate) fn is_ancestor(&self, ancestor_id: u32, node_id: u32) -> bool {
        let mut stack: Vec<u32> = match self.node(node_id) {
            Some(n) => n.parents.clone(),
            None => return false,
        };
        let mut seen = Vec::new();
        while let Some(id) = stack.pop() {
            if id == ancestor_id {
                return true;
            }
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            if let Some(n) = self.node(id) {
                stack.extend(n.parents.iter().copied());
            }
        }
        false
    }

    /// Ancestor check that also accepts detached (trash/reserved) nodes,
    /// used when a session is rooted in a subdirectory.
    pub(crate) fn is_ancestor_or_detached(&self, root_id: u32, node_id: u32) -> bool {
        match self.node(node_id) {
            Some(n) if matches!(n.node_type, NodeType::Trash | NodeType::Reserved) => true,
            Some(_) => root_id == node_id || self.is_ancestor(root_id, node_id),
            None => false,
        }
    }

    /// Classic permission check, overridden by an access ACL when present.
    pub(crate) fn has_access(&self, node: &FsNode, uid: u32, gid: u32, want: u8) -> bool {
        if uid == 0 {
            return true;
        }
        if let Some(acl) = self.acls.get(node.id, AclType::Access) {
            return acl.allowed(uid, gid, node.uid, node.gid, want);
        }
        let mode = node.mode;
        let perm = if uid == node.uid {
            (mode >> 6) & 7
        } else if gid == node.gid {
            (mode >> 3) & 7
        } else {
            mode & 7
        };
        perm as u8 & want == want
    }

    /// Sticky-bit rule: only root, the parent owner or the node owner may
    /// unlink/rename inside a sticky directory.
    pub(crate) fn sticky_access(&self, parent: &FsNode, node: &FsNode, uid: u32) -> bool {
        if uid == 0 || parent.mode & 0o1000 == 0 {
            return true;
        }
        uid == parent.uid || uid == node.uid
    }

    /// Changes the file length, releasing chunks past the new end.
    pub(crate) fn set_length(&mut self, id: u32, length: u64) {
        let old_stats = self.get_stats(id);
        let (goal, released): (u8, Vec<u64>) = {
            let node = match self.node_mut(id) {
                Some(n) => n,
                None => return,
            };
            let goal = node.goal;
            let node_type = node.node_type;
            let (old_length, released) = match node.file_mut() {
                Some(f) => {
                    let old_length = f.length;
                    f.length = length;
                    let chunks = if length > 0 {
                        (((length - 1) >> CHUNK_BITS) + 1) as usize
                    } else {
                        0
                    };
                    let mut released = Vec::new();
                    if chunks < f.chunks.len() {
                        released = f.chunks.split_off(chunks);
                    }
                    (old_length, released)
                }
                None => return,
            };
            match node_type {
                NodeType::Trash => {
                    self.trashspace = self.trashspace - old_length + length;
                }
                NodeType::Reserved => {
                    self.reservedspace = self.reservedspace - old_length + length;
                }
                _ => {}
            }
            (goal, released)
        };
        for chunk_id in released {
            if chunk_id > 0 && self.chunks.delete_file(chunk_id, goal) != FsStatus::Ok {
                error!("structure error - chunk {:016X} not found (inode: {})", chunk_id, id);
            }
        }
        let new_stats = self.get_stats(id);
        let (uid, gid) = {
            let n = &self.nodes[&id];
            (n.uid, n.gid)
        };
        self.quotas.update_size(uid, gid, new_stats.size as i64 - old_stats.size as i64);
        self.propagate_stats(id, &new_stats, &old_stats);
        self.update_node_checksum(id);
    }

    /// Appends all chunks of `src` to `dst` (both must be file kinds).
    pub(crate) fn append_chunks(&mut self, ts: u32, dst_id: u32, src_id: u32) -> FsStatus {
        let (src_chunks_vec, src_length, src_count) = match self.node(src_id).and_then(|n| n.file()) {
            Some(f) => (f.chunks.clone(), f.length, f.chunk_count()),
            None => return FsStatus::NotPermitted,
        };
        if src_chunks_vec.is_empty() {
            return FsStatus::Ok;
        }
        let old_stats = self.get_stats(dst_id);
        let (dst_goal, dst_type, dst_count) = {
            let node = match self.node(dst_id) {
                Some(n) => n,
                None => return FsStatus::NotFound,
            };
            match node.file() {
                Some(f) => (node.goal, node.node_type, f.chunk_count()),
                None => return FsStatus::NotPermitted,
            }
        };
        if src_count as u64 + dst_count as u64 > MAX_FILE_INDEX as u64 + 1 {
            return FsStatus::IndexTooBig;
        }
        let result_chunks = (src_count + dst_count) as usize;
        let new_length = ((dst_count as u64) << CHUNK_BITS) + src_length;
        {
            let node = match self.node_mut(dst_id) {
                Some(n) => n,
                None => return FsStatus::NotFound,
            };
            let old_length = node.file().map(|f| f.length).unwrap_or(0);
            if let Some(f) = node.file_mut() {
                let new_size = chunk_table_size(result_chunks as u32) as usize;
                if new_size > f.chunks.len() {
                    f.chunks.resize(new_size, 0);
                }
                for i in 0..src_count as usize {
                    f.chunks[dst_count as usize + i] = src_chunks_vec[i];
                }
                f.length = new_length;
            }
            node.mtime = ts;
            node.atime = ts;
            match dst_type {
                NodeType::Trash => self.trashspace = self.trashspace - old_length + new_length,
                NodeType::Reserved => {
                    self.reservedspace = self.reservedspace - old_length + new_length
                }
                _ => {}
            }
        }
        for &chunk_id in src_chunks_vec.iter().take(src_count as usize) {
            if chunk_id > 0 && self.chunks.add_file(chunk_id, dst_goal) != FsStatus::Ok {
                error!("structure error - chunk {:016X} not found (inode: {})", chunk_id, src_id);
            }
        }
        let new_stats = self.get_stats(dst_id);
        let (uid, gid) = {
            let n = &self.nodes[&dst_id];
            (n.uid, n.gid)
        };
        self.quotas.update_size(uid, gid, new_stats.size as i64 - old_stats.size as i64);
        self.propagate_stats(dst_id, &new_stats, &old_stats);
        if let Some(src) = self.node_mut(src_id) {
            src.atime = ts;
        }
        self.update_node_checksum(src_id);
        self.update_node_checksum(dst_id);
        FsStatus::Ok
    }

    /// Moves every chunk reference of a file to a new goal.
    pub(crate) fn change_file_goal(&mut self, id: u32, goal: u8) {
        let old_stats = self.get_stats(id);
        let (old_goal, chunk_ids) = {
            let node = match self.node_mut(id) {
                Some(n) => n,
                None => return,
            };
            let old_goal = node.goal;
            node.goal = goal;
            (old_goal, node.file().map(|f| f.chunks.clone()).unwrap_or_default())
        };
        for chunk_id in chunk_ids {
            if chunk_id > 0 {
                self.chunks.change_goal(chunk_id, old_goal, goal);
            }
        }
        let new_stats = self.get_stats(id);
        self.propagate_stats(id, &new_stats, &old_stats);
        self.update_node_checksum(id);
    }

    /// Keeps the trash map key in sync when a trashed node's ctime moves.
    pub(crate) fn update_ctime(&mut self, id: u32, ctime: u32) {
        let node = match self.node(id) {
            Some(n) => n,
            None => return,
        };
        if node.node_type == NodeType::Trash && node.ctime != ctime {
            let old_key = TrashKey::for_node(node);
            if let Some(path) = self.trash.remove(&old_key) {
                if let Some(node) = self.node_mut(id) {
                    node.ctime = ctime;
                }
                let new_key = TrashKey::for_node(&self.nodes[&id]);
                self.trash.insert(new_key, path);
                return;
            }
        }
        if let Some(node) = self.node_mut(id) {
            node.ctime = ctime;
        }
    }
}

/// Growth policy of the per-file chunk table.
pub fn chunk_table_size(required: u32) -> u32 {
    if required <= 8 {
        required
    } else if required <= 64 {
        ((required - 1) & 0xFFFFFFF8) + 8
    } else {
        ((required - 1) & 0xFFFFFFC0) + 64
    }
}

fn split_undel_path(path: &[u8]) -> Option<Vec<Vec<u8>>> {
    let trimmed: &[u8] = {
        let mut p = path;
        while p.first() == Some(&b'/') {
            p = &p[1..];
        }
        p
    };
    if trimmed.is_empty() {
        return None;
    }
    let mut parts = Vec::new();
    for part in trimmed.split(|&b| b == b'/') {
        if name_check(part) != FsStatus::Ok {
            return None;
        }
        parts.push(part.to_vec());
    }
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_table_growth_policy() {
        assert_eq!(chunk_table_size(1), 1);
        assert_eq!(chunk_table_size(8), 8);
        assert_eq!(chunk_table_size(9), 16);
        assert_eq!(chunk_table_size(16), 16);
        assert_eq!(chunk_table_size(17), 24);
        assert_eq!(chunk_table_size(64), 64);
        assert_eq!(chunk_table_size(65), 128);
        assert_eq!(chunk_table_size(129), 192);
    }

    #[test]
    fn name_check_rules() {
        assert_eq!(name_check(b"ok-name"), FsStatus::Ok);
        assert_eq!(name_check(b""), FsStatus::InvalidArgument);
        assert_eq!(name_check(b"."), FsStatus::InvalidArgument);
        assert_eq!(name_check(b".."), FsStatus::InvalidArgument);
        assert_eq!(name_check(b"a/b"), FsStatus::InvalidArgument);
        assert_eq!(name_check(b"a\0b"), FsStatus::InvalidArgument);
        assert_eq!(name_check(&[b'x'; 255]), FsStatus::Ok);
        assert_eq!(name_check(&[b'x'; 256]), FsStatus::InvalidArgument);
        assert_eq!(name_check(b"..."), FsStatus::Ok);
    }

    #[test]
    fn file_size_accounts_for_tail_blocks() {
        let mut f = FileData::default();
        assert_eq!(f.file_size(), 0);
        f.chunks = vec![7];
        f.length = 100;
        // one block of the single chunk plus its header
        assert_eq!(f.file_size(), CHUNK_HEADER_SIZE + BLOCK_SIZE);
        f.length = CHUNK_SIZE;
        assert_eq!(f.file_size(), CHUNK_HEADER_SIZE + CHUNK_SIZE);
    }

    #[test]
    fn sparse_holes_are_not_counted() {
        let mut f = FileData::default();
        f.chunks = vec![0, 5, 0, 9];
        f.length = 4 * CHUNK_SIZE;
        assert_eq!(f.nonzero_chunks(), 2);
        assert_eq!(f.chunk_count(), 4);
    }

    #[test]
    fn node_checksum_depends_on_chunk_edges() {
        let mut node = FsNode::new(5, NodeType::File, 100);
        node.file_mut().unwrap().length = 3 * CHUNK_SIZE;
        node.file_mut().unwrap().chunks = vec![1, 2, 3];
        let a = node_checksum(&node);
        node.file_mut().unwrap().chunks = vec![1, 9, 3];
        // middle chunk is not part of the hash
        assert_eq!(node_checksum(&node), a);
        node.file_mut().unwrap().chunks = vec![1, 9, 4];
        assert_ne!(node_checksum(&node), a);
    }

    #[test]
    fn trash_key_ordering() {
        let a = TrashKey { deadline: 10, id: 5 };
        let b = TrashKey { deadline: 10, id: 6 };
        let c = TrashKey { deadline: 11, id: 1 };
        assert!(a < b && b < c);
    }

    #[test]
    fn split_undel_path_validates_parts() {
        assert_eq!(
            split_undel_path(b"/a/b/c").unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        assert!(split_undel_path(b"//a").is_none());
        assert!(split_undel_path(b"/a/../b").is_none());
        assert!(split_undel_path(b"/").is_none());
        assert!(split_undel_path(b"").is_none());
    }
}
