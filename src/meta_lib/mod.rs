/// Metadata engine of the distributed filesystem master.
///
/// All state lives in a single owned `Engine`; operations are methods.
/// The process is single threaded, so linearizability of mutations comes
/// from the event loop, not from locks.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use log::*;

pub mod acl;
pub mod changelog;
pub mod checksum;
pub mod chunks;
pub mod codec;
pub mod config;
pub mod dumper;
pub mod hashfn;
pub mod inode_pool;
pub mod locks;
pub mod node;
pub mod ops;
pub mod quota;
pub mod store;
pub mod tasks;
pub mod types;
pub mod xattr;

use acl::AclStore;
use changelog::ChangelogWriter;
use checksum::ChecksumBackgroundUpdater;
use chunks::{ChunkModule, InMemoryChunks};
use config::EngineConfig;
use inode_pool::InodePool;
use locks::FileLockTable;
use node::{FsNode, TrashKey};
use quota::QuotaDatabase;
use tasks::TaskManager;
use types::{Personality, ROOT_INODE};
use xattr::XattrStore;

/// Inode numbers above this are reserved for special purposes.
pub const MAX_REGULAR_INODE: u32 = 0x7FFFFFFF;

/// State of a file copy on a tape server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeCopyState {
    Invalid,
    Creating,
    Ok,
}

#[derive(Debug, Clone, Copy)]
pub struct TapeCopy {
    pub tapeserver: u32,
    pub state: TapeCopyState,
}

pub struct Engine {
    pub(crate) nodes: BTreeMap<u32, FsNode>,
    pub(crate) trash: BTreeMap<TrashKey, Vec<u8>>,
    pub(crate) reserved: BTreeMap<u32, Vec<u8>>,
    pub(crate) inode_pool: InodePool,
    pub(crate) xattrs: XattrStore,
    pub(crate) acls: AclStore,
    pub(crate) quotas: QuotaDatabase,
    pub(crate) flock_locks: FileLockTable,
    pub(crate) posix_locks: FileLockTable,
    pub(crate) tape_copies: BTreeMap<u32, Vec<TapeCopy>>,
    pub(crate) tasks: TaskManager,
    pub(crate) chunks: Box<dyn ChunkModule>,
    pub(crate) goal_definitions: BTreeMap<u8, String>,

    pub(crate) maxnodeid: u32,
    pub(crate) metaversion: u64,
    pub(crate) nextsessionid: u32,
    pub(crate) node_count: u32,
    pub(crate) dirnode_count: u32,
    pub(crate) filenode_count: u32,
    pub(crate) trashspace: u64,
    pub(crate) reservedspace: u64,
    pub(crate) trashnode_count: u32,
    pub(crate) reservednode_count: u32,

    pub(crate) nodes_checksum: u64,
    pub(crate) edges_checksum: u64,
    pub(crate) background: ChecksumBackgroundUpdater,
    pub(crate) checksum_last_emitted: u64,

    pub(crate) personality: Personality,
    pub config: EngineConfig,
    pub changelog: ChangelogWriter,
}

/// Counters reported by the info call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    pub metaversion: u64,
    pub nodes: u32,
    pub dirnodes: u32,
    pub filenodes: u32,
    pub trashnodes: u32,
    pub reservednodes: u32,
    pub trashspace: u64,
    pub reservedspace: u64,
}

impl Engine {
    /// Fresh engine containing only the root directory.
    pub fn new(personality: Personality, config: EngineConfig, chunks: Box<dyn ChunkModule>) -> Self {
        let changelog = match personality {
            Personality::Master => ChangelogWriter::new(&config.data_path),
            Personality::Shadow => ChangelogWriter::in_memory(),
        };
        let mut engine = Engine {
            nodes: BTreeMap::new(),
            trash: BTreeMap::new(),
            reserved: BTreeMap::new(),
            inode_pool: InodePool::new(MAX_REGULAR_INODE),
            xattrs: XattrStore::new(),
            acls: AclStore::new(),
            quotas: QuotaDatabase::new(),
            flock_locks: FileLockTable::new(),
            posix_locks: FileLockTable::new(),
            tape_copies: BTreeMap::new(),
            tasks: TaskManager::new(),
            chunks,
            goal_definitions: default_goal_definitions(),
            maxnodeid: 0,
            metaversion: 0,
            nextsessionid: 1,
            node_count: 0,
            dirnode_count: 0,
            filenode_count: 0,
            trashspace: 0,
            reservedspace: 0,
            trashnode_count: 0,
            reservednode_count: 0,
            nodes_checksum: hashfn::NODE_CHECKSUM_SEED,
            edges_checksum: hashfn::EDGE_CHECKSUM_SEED,
            background: ChecksumBackgroundUpdater::new(),
            checksum_last_emitted: 0,
            personality,
            config,
            changelog,
        };
        engine.create_root();
        engine
    }

    /// In-memory master with the default config, used by tests.
    pub fn new_in_memory(personality: Personality) -> Self {
        let mut engine = Engine::new(
            personality,
            EngineConfig::default(),
            Box::new(InMemoryChunks::new()),
        );
        engine.changelog = ChangelogWriter::in_memory();
        engine
    }

    fn create_root(&mut self) {
        let ts = 0;
        let mut root = FsNode::new_directory(ROOT_INODE, 0o777, 0, 0, ts);
        root.trashtime = types::DEFAULT_TRASHTIME;
        self.inode_pool.mark_acquired(ROOT_INODE);
        self.maxnodeid = ROOT_INODE;
        self.node_count = 1;
        self.dirnode_count = 1;
        self.quotas.register_inode(root.uid, root.gid);
        self.nodes.insert(ROOT_INODE, root);
        self.update_node_checksum(ROOT_INODE);
    }

    pub fn personality(&self) -> Personality {
        self.personality
    }

    pub fn is_master(&self) -> bool {
        self.personality == Personality::Master
    }

    pub fn metaversion(&self) -> u64 {
        self.metaversion
    }

    pub fn tasks_available(&self) -> bool {
        self.tasks.work_available()
    }

    /// BSD-style whole-file locks, driven by the session module.
    pub fn flock_table(&mut self) -> &mut FileLockTable {
        &mut self.flock_locks
    }

    /// POSIX record locks, driven by the session module.
    pub fn posix_table(&mut self) -> &mut FileLockTable {
        &mut self.posix_locks
    }

    pub fn tape_copies(&self, inode: u32) -> &[TapeCopy] {
        self.tape_copies.get(&inode).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set_tape_copy(&mut self, inode: u32, tapeserver: u32, state: TapeCopyState) {
        let copies = self.tape_copies.entry(inode).or_default();
        match copies.iter_mut().find(|c| c.tapeserver == tapeserver) {
            Some(copy) => copy.state = state,
            None => copies.push(TapeCopy { tapeserver, state }),
        }
    }

    /// Drops invalid tape copies of an inode. The cleanup is explicit:
    /// entries are erased as soon as a tape server reports them broken.
    pub fn prune_tape_copies(&mut self, inode: u32) {
        if let Some(copies) = self.tape_copies.get_mut(&inode) {
            copies.retain(|c| c.state != TapeCopyState::Invalid);
            if copies.is_empty() {
                self.tape_copies.remove(&inode);
            }
        }
    }

    pub fn checksum_recalculation_in_progress(&self) -> bool {
        self.background.in_progress()
    }

    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            metaversion: self.metaversion,
            nodes: self.node_count,
            dirnodes: self.dirnode_count,
            filenodes: self.filenode_count,
            trashnodes: self.trashnode_count,
            reservednodes: self.reservednode_count,
            trashspace: self.trashspace,
            reservedspace: self.reservedspace,
        }
    }

    /// Resolves a goal id against the definitions table.
    pub fn goal_name(&self, goal: u8) -> &str {
        self.goal_definitions.get(&goal).map(String::as_str).unwrap_or("?")
    }

    /// Loads `id name` pairs from the custom goals file.
    pub fn load_goal_definitions(&mut self, path: &Path) -> Result<()> {
        let mut text = String::new();
        File::open(path)
            .and_then(|mut f| f.read_to_string(&mut text))
            .with_context(|| format!("reading goal definitions from {}", path.display()))?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match (parts.next().and_then(|s| s.parse::<u8>().ok()), parts.next()) {
                (Some(id), Some(name)) if (1..=40).contains(&id) => {
                    self.goal_definitions.insert(id, name.to_string());
                }
                _ => warn!("goal definitions: skipping malformed line {:?}", line),
            }
        }
        info!("loaded {} goal definitions", self.goal_definitions.len());
        Ok(())
    }
}

fn default_goal_definitions() -> BTreeMap<u8, String> {
    (1..=9).map(|id| (id, id.to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_engine_has_only_root() {
        let engine = Engine::new_in_memory(Personality::Master);
        let info = engine.info();
        assert_eq!(info.nodes, 1);
        assert_eq!(info.dirnodes, 1);
        assert_eq!(info.filenodes, 0);
        assert_eq!(engine.metaversion(), 0);
        assert!(engine.nodes.contains_key(&ROOT_INODE));
    }

    #[test]
    fn default_goals_cover_one_to_nine() {
        let engine = Engine::new_in_memory(Personality::Master);
        assert_eq!(engine.goal_name(1), "1");
        assert_eq!(engine.goal_name(9), "9");
        assert_eq!(engine.goal_name(10), "?");
    }

    #[test]
    fn tape_copies_prune_drops_invalid_entries() {
        let mut engine = Engine::new_in_memory(Personality::Master);
        engine.set_tape_copy(5, 1, TapeCopyState::Creating);
        engine.set_tape_copy(5, 2, TapeCopyState::Ok);
        engine.set_tape_copy(5, 1, TapeCopyState::Invalid);
        assert_eq!(engine.tape_copies(5).len(), 2);
        engine.prune_tape_copies(5);
        assert_eq!(engine.tape_copies(5).len(), 1);
        assert_eq!(engine.tape_copies(5)[0].tapeserver, 2);
    }
}
