/// Metadata digests: O(1) incremental updates plus a background sweep
/// that recomputes everything from scratch while mutations continue.
use log::*;

use crate::meta_lib::hashfn::{
    add_to_checksum, hash_combine, remove_from_checksum, CHECKSUM_BASE, EDGE_CHECKSUM_SEED,
    NODE_CHECKSUM_SEED, XATTR_CHECKSUM_SEED,
};
use crate::meta_lib::node::{edge_checksum, node_checksum};
use crate::meta_lib::types::ChecksumMode;
use crate::meta_lib::Engine;

/// Steps of the background recomputation, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecalculationStep {
    None,
    Nodes,
    Xattrs,
    Chunks,
    Done,
}

pub struct ChecksumBackgroundUpdater {
    step: RecalculationStep,
    /// Next inode to visit while in the Nodes step.
    node_position: u32,
    /// Next xattr key to visit while in the Xattrs step.
    xattr_position: Option<(u32, Vec<u8>)>,
    speed_limit: u32,
    pub(crate) nodes_checksum: u64,
    pub(crate) xattr_checksum: u64,
    pub(crate) chunks_checksum: u64,
}

impl ChecksumBackgroundUpdater {
    pub fn new() -> Self {
        ChecksumBackgroundUpdater {
            step: RecalculationStep::None,
            node_position: 0,
            xattr_position: None,
            speed_limit: 100,
            nodes_checksum: NODE_CHECKSUM_SEED,
            xattr_checksum: XATTR_CHECKSUM_SEED,
            chunks_checksum: 0,
        }
    }

    pub fn set_speed_limit(&mut self, limit: u32) {
        self.speed_limit = limit.max(1);
    }

    pub fn start(&mut self) -> bool {
        if self.step != RecalculationStep::None {
            return false;
        }
        self.step = RecalculationStep::Nodes;
        self.node_position = 0;
        self.xattr_position = None;
        self.nodes_checksum = NODE_CHECKSUM_SEED;
        self.xattr_checksum = XATTR_CHECKSUM_SEED;
        self.chunks_checksum = 0;
        true
    }

    pub fn in_progress(&self) -> bool {
        self.step != RecalculationStep::None
    }

    pub fn step(&self) -> RecalculationStep {
        self.step
    }

    fn reset(&mut self) {
        self.step = RecalculationStep::None;
        self.node_position = 0;
        self.xattr_position = None;
        self.nodes_checksum = NODE_CHECKSUM_SEED;
        self.xattr_checksum = XATTR_CHECKSUM_SEED;
        self.chunks_checksum = 0;
    }

    /// A node already swept by the background pass must have its updates
    /// mirrored into the shadow digest.
    pub fn is_node_included(&self, id: u32) -> bool {
        match self.step {
            RecalculationStep::None => false,
            RecalculationStep::Nodes => id < self.node_position,
            _ => true,
        }
    }

    pub fn is_xattr_included(&self, key: &(u32, Vec<u8>)) -> bool {
        match self.step {
            RecalculationStep::None | RecalculationStep::Nodes => false,
            RecalculationStep::Xattrs => match &self.xattr_position {
                Some(pos) => key < pos,
                None => false,
            },
            _ => true,
        }
    }
}

impl Default for ChecksumBackgroundUpdater {
    fn default() -> Self {
        ChecksumBackgroundUpdater::new()
    }
}

impl Engine {
    /// Recomputes one node's hash and folds the change into the digests.
    pub(crate) fn update_node_checksum(&mut self, id: u32) {
        let new_hash = match self.nodes.get(&id) {
            Some(node) => node_checksum(node),
            None => return,
        };
        let included = self.background.is_node_included(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            if included {
                remove_from_checksum(&mut self.background.nodes_checksum, node.checksum);
            }
            remove_from_checksum(&mut self.nodes_checksum, node.checksum);
            node.checksum = new_hash;
            add_to_checksum(&mut self.nodes_checksum, new_hash);
            if included {
                add_to_checksum(&mut self.background.nodes_checksum, new_hash);
            }
        }
    }

    /// Folds an xattr change into the digests. Called with the entry hash
    /// before and after a mutation (0 for none).
    pub(crate) fn update_xattr_checksum(&mut self, key: &(u32, Vec<u8>), old_hash: u64, new_hash: u64) {
        if self.background.is_xattr_included(key) {
            if old_hash != 0 {
                remove_from_checksum(&mut self.background.xattr_checksum, old_hash);
            }
            if new_hash != 0 {
                add_to_checksum(&mut self.background.xattr_checksum, new_hash);
            }
        }
    }

    fn recalculate_nodes_checksum(&mut self) {
        self.nodes_checksum = NODE_CHECKSUM_SEED;
        let ids: Vec<u32> = self.nodes.keys().copied().collect();
        for id in ids {
            if let Some(node) = self.nodes.get_mut(&id) {
                let hash = node_checksum(node);
                node.checksum = hash;
                add_to_checksum(&mut self.nodes_checksum, hash);
            }
        }
    }

    fn recalculate_edges_checksum(&mut self) {
        let mut sum = EDGE_CHECKSUM_SEED;
        for (id, node) in &self.nodes {
            if let Some(dir) = node.dir() {
                for (name, &child) in &dir.children {
                    add_to_checksum(&mut sum, edge_checksum(Some(*id), child, name));
                }
            }
        }
        for (key, path) in &self.trash {
            add_to_checksum(&mut sum, edge_checksum(None, key.id, path));
        }
        for (&id, path) in &self.reserved {
            add_to_checksum(&mut sum, edge_checksum(None, id, path));
        }
        self.edges_checksum = sum;
    }

    /// The global digest. `ForceRecalculate` rebuilds every component first.
    pub fn checksum(&mut self, mode: ChecksumMode) -> u64 {
        if mode == ChecksumMode::ForceRecalculate {
            self.recalculate_nodes_checksum();
            self.recalculate_edges_checksum();
            self.xattrs.recalculate_checksum();
        }
        let mut sum = CHECKSUM_BASE;
        hash_combine(&mut sum, self.maxnodeid as u64);
        hash_combine(&mut sum, self.metaversion);
        hash_combine(&mut sum, self.nextsessionid as u64);
        hash_combine(&mut sum, self.nodes_checksum);
        hash_combine(&mut sum, self.edges_checksum);
        hash_combine(&mut sum, self.xattrs.checksum);
        hash_combine(&mut sum, self.quotas.checksum());
        hash_combine(&mut sum, self.chunks.checksum(mode));
        sum
    }

    /// Kicks off the background recomputation.
    pub fn start_checksum_recalculation(&mut self) -> bool {
        let speed = self.config.checksum_recalculation_speed;
        self.background.set_speed_limit(speed);
        if self.background.start() {
            debug!("background checksum recalculation started");
            true
        } else {
            false
        }
    }

    /// Runs one bounded slice of the background recomputation.
    /// Returns true while more work remains.
    pub fn background_checksum_step(&mut self) -> bool {
        let budget = self.background.speed_limit();
        match self.background.step() {
            RecalculationStep::None => false,
            RecalculationStep::Nodes => {
                let start = self.background.node_position;
                let ids: Vec<u32> = self
                    .nodes
                    .range(start..)
                    .take(budget as usize)
                    .map(|(&id, _)| id)
                    .collect();
                if ids.is_empty() {
                    self.background.step = RecalculationStep::Xattrs;
                    return true;
                }
                for id in &ids {
                    // recompute under the background digest; mutators keep it
                    // current for everything already visited
                    let hash = self.nodes.get(id).map(node_checksum).unwrap_or(0);
                    if let Some(node) = self.nodes.get_mut(id) {
                        remove_from_checksum(&mut self.nodes_checksum, node.checksum);
                        node.checksum = hash;
                        add_to_checksum(&mut self.nodes_checksum, hash);
                    }
                    add_to_checksum(&mut self.background.nodes_checksum, hash);
                }
                self.background.node_position = ids.last().map(|&id| id + 1).unwrap_or(u32::MAX);
                true
            }
            RecalculationStep::Xattrs => {
                let keys = self.xattrs.keys_from(self.background.xattr_position.as_ref());
                let slice: Vec<(u32, Vec<u8>)> = keys.into_iter().take(budget as usize + 1).collect();
                if slice.is_empty() {
                    self.background.step = RecalculationStep::Chunks;
                    return true;
                }
                for key in slice.iter().take(budget as usize) {
                    if let Some(hash) = self.xattrs.entry_hash(key) {
                        add_to_checksum(&mut self.background.xattr_checksum, hash);
                    }
                }
                if slice.len() > budget as usize {
                    self.background.xattr_position = Some(slice[budget as usize].clone());
                } else {
                    self.background.step = RecalculationStep::Chunks;
                }
                true
            }
            RecalculationStep::Chunks => {
                // the chunk module recomputes its own digest in one call
                self.background.chunks_checksum = self.chunks.checksum(ChecksumMode::ForceRecalculate);
                self.background.step = RecalculationStep::Done;
                true
            }
            RecalculationStep::Done => {
                self.finish_checksum_recalculation();
                false
            }
        }
    }

    fn finish_checksum_recalculation(&mut self) {
        if self.background.nodes_checksum != self.nodes_checksum {
            warn!("nodes checksum mismatch found, replacing with the recalculated value");
            self.nodes_checksum = self.background.nodes_checksum;
        }
        if self.background.xattr_checksum != self.xattrs.checksum {
            warn!("xattr checksum mismatch found, replacing with the recalculated value");
            self.xattrs.checksum = self.background.xattr_checksum;
        }
        self.background.reset();
        debug!("background checksum recalculation finished");
    }
}

impl ChecksumBackgroundUpdater {
    fn speed_limit(&self) -> u32 {
        self.speed_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::types::Personality;

    #[test]
    fn start_twice_is_refused() {
        let mut updater = ChecksumBackgroundUpdater::new();
        assert!(updater.start());
        assert!(!updater.start());
    }

    #[test]
    fn inclusion_watermark() {
        let mut updater = ChecksumBackgroundUpdater::new();
        assert!(!updater.is_node_included(1));
        updater.start();
        updater.node_position = 10;
        assert!(updater.is_node_included(9));
        assert!(!updater.is_node_included(10));
        updater.step = RecalculationStep::Chunks;
        assert!(updater.is_node_included(10));
    }

    #[test]
    fn background_pass_confirms_live_digest() {
        let mut engine = Engine::new_in_memory(Personality::Master);
        // a small tree so the sweep takes several steps
        let ctx = crate::meta_lib::types::FsContext::internal(100);
        for i in 0..10 {
            let name = format!("dir{}", i);
            engine.mkdir(&ctx, crate::meta_lib::types::ROOT_INODE, name.as_bytes(), 0o755, 0).unwrap();
        }
        let live_nodes = engine.nodes_checksum;
        engine.background.set_speed_limit(3);
        assert!(engine.background.start());
        while engine.background_checksum_step() {}
        // digest survived the recalculation untouched
        assert_eq!(engine.nodes_checksum, live_nodes);
        assert!(!engine.background.in_progress());
    }

    #[test]
    fn mutation_during_background_pass_is_tracked() {
        let mut engine = Engine::new_in_memory(Personality::Master);
        let ctx = crate::meta_lib::types::FsContext::internal(100);
        for i in 0..20 {
            let name = format!("d{:02}", i);
            engine.mkdir(&ctx, crate::meta_lib::types::ROOT_INODE, name.as_bytes(), 0o755, 0).unwrap();
        }
        engine.background.set_speed_limit(5);
        assert!(engine.background.start());
        // run one slice, then mutate on both sides of the watermark:
        // destroy a not-yet-visited node and create a fresh one
        assert!(engine.background_checksum_step());
        let ctx2 = crate::meta_lib::types::FsContext::internal(200);
        engine.rmdir(&ctx2, crate::meta_lib::types::ROOT_INODE, b"d19").unwrap();
        engine.mkdir(&ctx2, crate::meta_lib::types::ROOT_INODE, b"late", 0o700, 0).unwrap();
        while engine.background_checksum_step() {}
        let live = engine.nodes_checksum;
        engine.recalculate_nodes_checksum();
        assert_eq!(engine.nodes_checksum, live);
    }
}
