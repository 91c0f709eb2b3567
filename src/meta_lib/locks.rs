/// Per-inode interval locks (POSIX record locks and flock emulation).
///
/// Active locks are kept as a minimal set of pairwise-disjoint ranges
/// sorted by start offset. Requests that cannot be applied are queued
/// per inode in arrival order unless the caller asked for nonblocking.
use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::meta_lib::codec::{put32, put64, put8, Unpacker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockOwner {
    pub owner: u64,
    pub sessionid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Unlock,
    Shared,
    Exclusive,
}

impl LockType {
    fn to_byte(self) -> u8 {
        match self {
            LockType::Unlock => 1,
            LockType::Shared => 2,
            LockType::Exclusive => 3,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            1 => LockType::Unlock,
            2 => LockType::Shared,
            3 => LockType::Exclusive,
            _ => bail!("bad lock type byte {:#x}", b),
        })
    }
}

/// Half-open interval [start, end) with its type and owner set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRange {
    pub lock_type: LockType,
    pub start: u64,
    pub end: u64,
    pub owners: Vec<LockOwner>,
}

impl LockRange {
    pub fn new(lock_type: LockType, start: u64, end: u64, owner: LockOwner) -> Self {
        LockRange { lock_type, start, end, owners: vec![owner] }
    }

    pub fn overlaps(&self, other: &LockRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True when the ranges touch end-to-start.
    pub fn sticks(&self, other: &LockRange) -> bool {
        self.start == other.end || other.start == self.end
    }

    pub fn shared(&self) -> bool {
        self.lock_type == LockType::Shared
    }

    pub fn unlocking(&self) -> bool {
        self.lock_type == LockType::Unlock || self.owners.is_empty()
    }

    /// Only meaningful for freshly built requests, which carry one owner.
    fn sole_owner(&self) -> LockOwner {
        debug_assert_eq!(self.owners.len(), 1);
        self.owners[0]
    }

    pub fn has_owner(&self, candidate: &LockOwner) -> bool {
        self.owners.binary_search(candidate).is_ok()
    }

    fn erase_owner(&mut self, candidate: &LockOwner) {
        if let Ok(pos) = self.owners.binary_search(candidate) {
            self.owners.remove(pos);
        }
    }

    fn add_owners(&mut self, other: &[LockOwner]) {
        for owner in other {
            if let Err(pos) = self.owners.binary_search(owner) {
                self.owners.insert(pos, *owner);
            }
        }
    }
}

/// Disjoint sorted set of applied ranges for one inode.
#[derive(Debug, Default, Clone)]
pub struct LockRanges {
    data: Vec<LockRange>,
}

impl LockRanges {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn ranges(&self) -> &[LockRange] {
        &self.data
    }

    /// Checks if the request can coexist with every overlapping range:
    /// both shared, same owner set, or the request is an unlock.
    pub fn fits(&self, range: &LockRange) -> bool {
        self.find_collision(range).is_none()
    }

    pub fn find_collision(&self, range: &LockRange) -> Option<&LockRange> {
        for other in &self.data {
            if !range.overlaps(other) {
                continue;
            }
            if range.unlocking() && other.has_owner(&range.sole_owner()) {
                continue;
            }
            if (!range.shared() || !other.shared()) && other.owners != range.owners {
                return Some(other);
            }
        }
        None
    }

    /// Inserts the range, splitting and coalescing neighbours.
    /// The caller must have checked `fits` first.
    pub fn insert(&mut self, mut range: LockRange) {
        let mut i = 0;
        while i < self.data.len() && range.end > range.start {
            if self.data[i].end <= range.start && !range.sticks(&self.data[i]) {
                i += 1;
                continue;
            }
            if self.data[i].start > range.end {
                break;
            }
            let same_owners = range.owners == self.data[i].owners;

            // adjacent same-type same-owners ranges coalesce
            if range.sticks(&self.data[i])
                && !range.overlaps(&self.data[i])
                && same_owners
                && range.lock_type == self.data[i].lock_type
            {
                range.start = range.start.min(self.data[i].start);
                range.end = range.end.max(self.data[i].end);
                self.data.remove(i);
                continue;
            }
            if !range.overlaps(&self.data[i]) {
                i += 1;
                continue;
            }

            if range.start < self.data[i].start {
                // peel off the part of the request before the neighbour,
                // then reprocess the neighbour with aligned starts
                let mut head = range.clone();
                head.end = self.data[i].start;
                range.start = self.data[i].start;
                if !head.unlocking() {
                    self.data.insert(i, head);
                    i += 1;
                }
            } else if range.start == self.data[i].start {
                if range.end < self.data[i].end {
                    // request covers a prefix of the neighbour: split it
                    let mut head = self.data[i].clone();
                    head.end = range.end;
                    self.data[i].start = range.end;
                    if same_owners {
                        head.lock_type = range.lock_type;
                    } else if range.unlocking() {
                        head.erase_owner(&range.sole_owner());
                    } else {
                        head.add_owners(&range.owners);
                    }
                    range.start = self.data[i].end;
                    if head.unlocking() {
                        // nothing left of the split-off part
                    } else {
                        self.data.insert(i, head);
                        i += 1;
                    }
                } else {
                    // request swallows the neighbour
                    if same_owners {
                        self.data[i].lock_type = range.lock_type;
                    } else if range.unlocking() {
                        let owner = range.sole_owner();
                        self.data[i].erase_owner(&owner);
                    } else {
                        let owners = range.owners.clone();
                        self.data[i].add_owners(&owners);
                    }
                    range.start = self.data[i].end;
                    if self.data[i].unlocking() {
                        self.data.remove(i);
                    } else {
                        i += 1;
                    }
                }
            } else {
                // neighbour starts earlier: peel off its head
                let mut head = self.data[i].clone();
                head.end = range.start;
                self.data[i].start = range.start;
                self.data.insert(i, head);
                i += 1;
            }
        }
        if range.end > range.start && !range.unlocking() {
            let pos = self.data.iter().position(|r| r.start > range.start).unwrap_or(self.data.len());
            self.data.insert(pos, range);
        }
        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.data.len() {
            if self.data[i].end == self.data[i + 1].start
                && self.data[i].lock_type == self.data[i + 1].lock_type
                && self.data[i].owners == self.data[i + 1].owners
            {
                self.data[i].end = self.data[i + 1].end;
                self.data.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

/// All interval locks of one lock family (posix or flock).
#[derive(Default)]
pub struct FileLockTable {
    active: BTreeMap<u32, LockRanges>,
    pending: BTreeMap<u32, Vec<LockRange>>,
}

impl FileLockTable {
    pub fn new() -> Self {
        FileLockTable::default()
    }

    /// Tries to place the lock; queues it when blocked unless nonblocking.
    pub fn apply(&mut self, inode: u32, lock: LockRange, nonblocking: bool) -> bool {
        let ranges = self.active.entry(inode).or_default();
        if ranges.fits(&lock) {
            ranges.insert(lock);
            if ranges.is_empty() {
                self.active.remove(&inode);
            }
            return true;
        }
        if !nonblocking {
            self.enqueue(inode, lock);
        }
        false
    }

    pub fn shared(&mut self, inode: u32, start: u64, end: u64, owner: LockOwner, nonblocking: bool) -> bool {
        self.apply(inode, LockRange::new(LockType::Shared, start, end, owner), nonblocking)
    }

    pub fn exclusive(&mut self, inode: u32, start: u64, end: u64, owner: LockOwner, nonblocking: bool) -> bool {
        self.apply(inode, LockRange::new(LockType::Exclusive, start, end, owner), nonblocking)
    }

    pub fn unlock(&mut self, inode: u32, start: u64, end: u64, owner: LockOwner) -> bool {
        self.apply(inode, LockRange::new(LockType::Unlock, start, end, owner), false)
    }

    pub fn find_collision(&self, inode: u32, lock: &LockRange) -> Option<LockRange> {
        self.active.get(&inode).and_then(|r| r.find_collision(lock)).cloned()
    }

    fn enqueue(&mut self, inode: u32, lock: LockRange) {
        self.pending.entry(inode).or_default().push(lock);
    }

    /// Pulls queued locks overlapping the just-unlocked window, in arrival
    /// order. Callers retry `apply` on each and may re-queue.
    pub fn gather_candidates(&mut self, inode: u32, start: u64, end: u64) -> Vec<LockRange> {
        let mut result = Vec::new();
        if let Some(queue) = self.pending.get_mut(&inode) {
            let mut i = 0;
            while i < queue.len() {
                if queue[i].start < end && start < queue[i].end {
                    result.push(queue.remove(i));
                } else {
                    i += 1;
                }
            }
            if queue.is_empty() {
                self.pending.remove(&inode);
            }
        }
        result
    }

    /// Removes all locks (active and pending) owned by a session, returning
    /// the affected window per inode so candidates can be retried.
    pub fn remove_session(&mut self, sessionid: u32) -> Vec<(u32, u64, u64)> {
        let mut affected = Vec::new();
        let inodes: Vec<u32> = self.active.keys().copied().collect();
        for inode in inodes {
            let mut start = u64::MAX;
            let mut end = 0;
            if let Some(ranges) = self.active.get_mut(&inode) {
                ranges.data.retain_mut(|range| {
                    let before = range.owners.len();
                    range.owners.retain(|o| o.sessionid != sessionid);
                    if range.owners.len() != before {
                        start = start.min(range.start);
                        end = end.max(range.end);
                    }
                    !range.owners.is_empty()
                });
                if ranges.is_empty() {
                    self.active.remove(&inode);
                }
            }
            if start < end {
                affected.push((inode, start, end));
            }
        }
        let pending_inodes: Vec<u32> = self.pending.keys().copied().collect();
        for inode in pending_inodes {
            if let Some(queue) = self.pending.get_mut(&inode) {
                queue.retain(|l| l.owners.iter().all(|o| o.sessionid != sessionid));
                if queue.is_empty() {
                    self.pending.remove(&inode);
                }
            }
        }
        affected
    }

    pub fn active_ranges(&self, inode: u32) -> &[LockRange] {
        self.active.get(&inode).map(|r| r.ranges()).unwrap_or(&[])
    }

    pub fn pending_count(&self, inode: u32) -> usize {
        self.pending.get(&inode).map(|q| q.len()).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.pending.clear();
    }

    pub fn store(&self, buf: &mut Vec<u8>) {
        for (&inode, ranges) in &self.active {
            for range in ranges.ranges() {
                put32(buf, inode);
                put8(buf, range.lock_type.to_byte());
                put64(buf, range.start);
                put64(buf, range.end);
                put32(buf, range.owners.len() as u32);
                for owner in &range.owners {
                    put64(buf, owner.owner);
                    put32(buf, owner.sessionid);
                }
            }
        }
        put32(buf, 0); // end marker
    }

    pub fn load(&mut self, u: &mut Unpacker) -> Result<()> {
        loop {
            let inode = u.get32()?;
            if inode == 0 {
                return Ok(());
            }
            let lock_type = LockType::from_byte(u.get8()?)?;
            let start = u.get64()?;
            let end = u.get64()?;
            if end <= start {
                bail!("lock range for inode {} is empty", inode);
            }
            let owner_count = u.get32()?;
            let mut owners = Vec::with_capacity(owner_count as usize);
            for _ in 0..owner_count {
                let owner = u.get64()?;
                let sessionid = u.get32()?;
                owners.push(LockOwner { owner, sessionid });
            }
            owners.sort();
            self.active
                .entry(inode)
                .or_default()
                .data
                .push(LockRange { lock_type, start, end, owners });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(n: u64) -> LockOwner {
        LockOwner { owner: n, sessionid: n as u32 }
    }

    fn assert_disjoint_and_minimal(ranges: &[LockRange]) {
        for w in ranges.windows(2) {
            assert!(w[0].end <= w[1].start, "ranges overlap: {:?}", w);
            if w[0].end == w[1].start {
                assert!(
                    w[0].lock_type != w[1].lock_type || w[0].owners != w[1].owners,
                    "adjacent ranges not coalesced: {:?}",
                    w
                );
            }
        }
    }

    #[test]
    fn nonblocking_conflict_is_rejected_not_queued() {
        let mut t = FileLockTable::new();
        assert!(t.exclusive(3, 0, 10, owner(1), false));
        assert!(!t.shared(3, 5, 15, owner(2), true));
        assert_eq!(t.pending_count(3), 0);
        // unlocking frees nothing to retry
        assert!(t.unlock(3, 0, 10, owner(1)));
        assert!(t.gather_candidates(3, 0, 10).is_empty());
    }

    #[test]
    fn blocking_conflict_queues_and_applies_after_unlock() {
        let mut t = FileLockTable::new();
        assert!(t.exclusive(3, 0, 10, owner(1), false));
        assert!(!t.shared(3, 5, 15, owner(2), false));
        assert_eq!(t.pending_count(3), 1);
        assert!(t.unlock(3, 0, 10, owner(1)));
        let candidates = t.gather_candidates(3, 0, 10);
        assert_eq!(candidates.len(), 1);
        for lock in candidates {
            assert!(t.apply(3, lock, false));
        }
        assert_eq!(t.active_ranges(3).len(), 1);
        assert_eq!(t.active_ranges(3)[0].lock_type, LockType::Shared);
    }

    #[test]
    fn shared_locks_overlap_and_merge_owner_sets() {
        let mut t = FileLockTable::new();
        assert!(t.shared(3, 0, 10, owner(1), false));
        assert!(t.shared(3, 5, 15, owner(2), false));
        let ranges = t.active_ranges(3);
        assert_disjoint_and_minimal(ranges);
        // middle part carries both owners
        let middle = ranges.iter().find(|r| r.start == 5 && r.end == 10).unwrap();
        assert_eq!(middle.owners.len(), 2);
    }

    #[test]
    fn same_owner_upgrade_in_the_middle_splits() {
        let mut t = FileLockTable::new();
        assert!(t.shared(3, 0, 30, owner(1), false));
        assert!(t.exclusive(3, 10, 20, owner(1), false));
        let ranges = t.active_ranges(3);
        assert_disjoint_and_minimal(ranges);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[1].lock_type, LockType::Exclusive);
        assert_eq!((ranges[1].start, ranges[1].end), (10, 20));
    }

    #[test]
    fn adjacent_same_type_same_owner_coalesce() {
        let mut t = FileLockTable::new();
        assert!(t.exclusive(3, 0, 10, owner(1), false));
        assert!(t.exclusive(3, 10, 20, owner(1), false));
        let ranges = t.active_ranges(3);
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start, ranges[0].end), (0, 20));
    }

    #[test]
    fn partial_unlock_leaves_the_rest() {
        let mut t = FileLockTable::new();
        assert!(t.exclusive(3, 0, 30, owner(1), false));
        assert!(t.unlock(3, 10, 20, owner(1)));
        let ranges = t.active_ranges(3);
        assert_disjoint_and_minimal(ranges);
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].start, ranges[0].end), (0, 10));
        assert_eq!((ranges[1].start, ranges[1].end), (20, 30));
    }

    #[test]
    fn unlock_removes_only_this_owner_from_shared_range() {
        let mut t = FileLockTable::new();
        assert!(t.shared(3, 0, 10, owner(1), false));
        assert!(t.shared(3, 0, 10, owner(2), false));
        assert!(t.unlock(3, 0, 10, owner(1)));
        let ranges = t.active_ranges(3);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].owners, vec![owner(2)]);
    }

    #[test]
    fn remove_session_reports_affected_windows() {
        let mut t = FileLockTable::new();
        assert!(t.exclusive(3, 0, 10, owner(1), false));
        assert!(t.exclusive(4, 20, 40, owner(1), false));
        assert!(t.exclusive(4, 50, 60, owner(2), false));
        let affected = t.remove_session(1);
        assert_eq!(affected, vec![(3, 0, 10), (4, 20, 40)]);
        assert!(t.active_ranges(3).is_empty());
        assert_eq!(t.active_ranges(4).len(), 1);
    }

    #[test]
    fn unlock_wider_than_existing_removes_it() {
        let mut t = FileLockTable::new();
        assert!(t.exclusive(3, 5, 10, owner(1), false));
        assert!(t.unlock(3, 0, 20, owner(1)));
        assert!(t.active_ranges(3).is_empty());
    }

    #[test]
    fn read_hole_punching() {
        let mut t = FileLockTable::new();
        assert!(t.exclusive(3, 0, 100, owner(1), false));
        assert!(!t.shared(3, 30, 60, owner(2), true));
        // downgrade part of the exclusive lock to shared
        assert!(t.shared(3, 40, 50, owner(1), false));
        assert!(!t.shared(3, 30, 60, owner(2), true));
        assert!(t.shared(3, 30, 60, owner(1), false));
        assert!(t.shared(3, 30, 60, owner(2), true));
        assert!(!t.exclusive(3, 30, 60, owner(2), true));
        assert_disjoint_and_minimal(t.active_ranges(3));
    }

    #[test]
    fn store_load_roundtrip() {
        let mut t = FileLockTable::new();
        assert!(t.shared(3, 0, 10, owner(1), false));
        assert!(t.shared(3, 0, 10, owner(2), false));
        assert!(t.exclusive(7, 100, u64::MAX, owner(9), false));
        let mut buf = Vec::new();
        t.store(&mut buf);

        let mut restored = FileLockTable::new();
        restored.load(&mut Unpacker::new(&buf)).unwrap();
        assert_eq!(restored.active_ranges(3), t.active_ranges(3));
        assert_eq!(restored.active_ranges(7), t.active_ranges(7));
    }
}
