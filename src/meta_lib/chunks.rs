/// Boundary to the chunk module.
///
/// The core only records chunk ids inside file nodes and keeps the chunk
/// module informed about per-goal references. Everything else (placement,
/// replication, versions kept on chunkservers) lives behind this trait.
use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use log::*;

use crate::meta_lib::codec::{put32, put64, Unpacker};
use crate::meta_lib::hashfn::{add_to_checksum, hash_combine};
use crate::meta_lib::types::{ChecksumMode, FsStatus};

pub trait ChunkModule {
    /// Registers one more file reference under the given goal.
    fn add_file(&mut self, chunk_id: u64, goal: u8) -> FsStatus;

    /// Drops one file reference held under the given goal.
    fn delete_file(&mut self, chunk_id: u64, goal: u8) -> FsStatus;

    /// Moves one reference from `old_goal` to `new_goal`.
    fn change_goal(&mut self, chunk_id: u64, old_goal: u8, new_goal: u8) -> FsStatus;

    /// Write path: allocates or copies a chunk for modification and locks it.
    /// Returns (chunk id, opflag: 1 when a new chunk was created).
    fn multi_modify(
        &mut self,
        old_chunk_id: u64,
        lock_id: u32,
        goal: u8,
        quota_exceeded: bool,
    ) -> Result<(u64, u8), FsStatus>;

    /// Truncate path; may return `Delayed` while chunkservers shorten the chunk.
    fn multi_truncate(
        &mut self,
        old_chunk_id: u64,
        lock_id: u32,
        goal: u8,
        quota_exceeded: bool,
    ) -> Result<u64, FsStatus>;

    /// Shadow-side counterpart of `multi_modify`/`multi_truncate`.
    fn apply_modification(
        &mut self,
        ts: u32,
        old_chunk_id: u64,
        lock_id: u32,
        goal: u8,
        increase_version: bool,
    ) -> Result<u64, FsStatus>;

    fn unlock(&mut self, chunk_id: u64) -> FsStatus;

    fn exists(&self, chunk_id: u64) -> bool;

    /// Repair: returns the new version when the chunk could be fixed.
    fn repair(&mut self, goal: u8, chunk_id: u64) -> Option<u32>;

    fn set_version(&mut self, chunk_id: u64, version: u32) -> FsStatus;

    fn increase_version(&mut self, chunk_id: u64) -> FsStatus;

    fn set_next_id(&mut self, next_id: u64) -> FsStatus;

    fn checksum(&self, mode: ChecksumMode) -> u64;

    fn store(&self, w: &mut dyn Write) -> Result<()>;

    fn load(&mut self, r: &mut dyn Read, load_lock_ids: bool) -> Result<()>;
}

const CHUNK_DIGEST_SEED: u64 = 0x7c9a40fbd1876e3f;

#[derive(Debug, Default, Clone)]
struct ChunkInfo {
    version: u32,
    lock_id: u32,
    /// file reference count per goal id
    refs: BTreeMap<u8, u32>,
}

/// Reference-counting chunk registry used by tests and the stand-alone
/// binary; a production deployment wires the chunkserver coordinator here.
pub struct InMemoryChunks {
    next_id: u64,
    chunks: BTreeMap<u64, ChunkInfo>,
}

impl Default for InMemoryChunks {
    fn default() -> Self {
        InMemoryChunks { next_id: 1, chunks: BTreeMap::new() }
    }
}

impl InMemoryChunks {
    pub fn new() -> Self {
        InMemoryChunks::default()
    }

    fn entry(&mut self, chunk_id: u64) -> Option<&mut ChunkInfo> {
        self.chunks.get_mut(&chunk_id)
    }

    fn create(&mut self, goal: u8, lock_id: u32) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let mut info = ChunkInfo { version: 1, lock_id, ..Default::default() };
        *info.refs.entry(goal).or_insert(0) += 1;
        self.chunks.insert(id, info);
        id
    }

    fn drop_if_unreferenced(&mut self, chunk_id: u64) {
        if let Some(info) = self.chunks.get(&chunk_id) {
            if info.refs.values().all(|&n| n == 0) {
                self.chunks.remove(&chunk_id);
            }
        }
    }
}

impl ChunkModule for InMemoryChunks {
    fn add_file(&mut self, chunk_id: u64, goal: u8) -> FsStatus {
        match self.entry(chunk_id) {
            Some(info) => {
                *info.refs.entry(goal).or_insert(0) += 1;
                FsStatus::Ok
            }
            None => FsStatus::NoSuchChunk,
        }
    }

    fn delete_file(&mut self, chunk_id: u64, goal: u8) -> FsStatus {
        match self.entry(chunk_id) {
            Some(info) => match info.refs.get_mut(&goal) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    if *n == 0 {
                        info.refs.remove(&goal);
                    }
                    self.drop_if_unreferenced(chunk_id);
                    FsStatus::Ok
                }
                _ => FsStatus::NoSuchChunk,
            },
            None => FsStatus::NoSuchChunk,
        }
    }

    fn change_goal(&mut self, chunk_id: u64, old_goal: u8, new_goal: u8) -> FsStatus {
        let status = self.delete_file(chunk_id, old_goal);
        if status != FsStatus::Ok {
            return status;
        }
        self.add_file(chunk_id, new_goal)
    }

    fn multi_modify(
        &mut self,
        old_chunk_id: u64,
        lock_id: u32,
        goal: u8,
        quota_exceeded: bool,
    ) -> Result<(u64, u8), FsStatus> {
        if old_chunk_id == 0 {
            if quota_exceeded {
                return Err(FsStatus::QuotaExceeded);
            }
            return Ok((self.create(goal, lock_id), 1));
        }
        let info = self.entry(old_chunk_id).ok_or(FsStatus::NoSuchChunk)?;
        if info.lock_id != 0 && info.lock_id != lock_id {
            return Err(FsStatus::ChunkLocked);
        }
        info.lock_id = lock_id;
        info.version += 1;
        Ok((old_chunk_id, 0))
    }

    fn multi_truncate(
        &mut self,
        old_chunk_id: u64,
        lock_id: u32,
        _goal: u8,
        quota_exceeded: bool,
    ) -> Result<u64, FsStatus> {
        if quota_exceeded {
            return Err(FsStatus::QuotaExceeded);
        }
        let info = self.entry(old_chunk_id).ok_or(FsStatus::NoSuchChunk)?;
        if info.lock_id != 0 && info.lock_id != lock_id {
            return Err(FsStatus::ChunkLocked);
        }
        info.lock_id = lock_id;
        info.version += 1;
        Ok(old_chunk_id)
    }

    fn apply_modification(
        &mut self,
        _ts: u32,
        old_chunk_id: u64,
        lock_id: u32,
        goal: u8,
        increase_version: bool,
    ) -> Result<u64, FsStatus> {
        if old_chunk_id == 0 {
            return Ok(self.create(goal, lock_id));
        }
        let info = self.entry(old_chunk_id).ok_or(FsStatus::NoSuchChunk)?;
        info.lock_id = lock_id;
        if increase_version {
            info.version += 1;
        }
        Ok(old_chunk_id)
    }

    fn unlock(&mut self, chunk_id: u64) -> FsStatus {
        match self.entry(chunk_id) {
            Some(info) => {
                info.lock_id = 0;
                FsStatus::Ok
            }
            None => FsStatus::NoSuchChunk,
        }
    }

    fn exists(&self, chunk_id: u64) -> bool {
        self.chunks.contains_key(&chunk_id)
    }

    fn repair(&mut self, _goal: u8, chunk_id: u64) -> Option<u32> {
        self.chunks.get_mut(&chunk_id).map(|info| {
            info.version += 1;
            info.version
        })
    }

    fn set_version(&mut self, chunk_id: u64, version: u32) -> FsStatus {
        match self.entry(chunk_id) {
            Some(info) => {
                info.version = version;
                FsStatus::Ok
            }
            None => FsStatus::NoSuchChunk,
        }
    }

    fn increase_version(&mut self, chunk_id: u64) -> FsStatus {
        match self.entry(chunk_id) {
            Some(info) => {
                info.version += 1;
                FsStatus::Ok
            }
            None => FsStatus::NoSuchChunk,
        }
    }

    fn set_next_id(&mut self, next_id: u64) -> FsStatus {
        if next_id < self.next_id {
            warn!("chunk registry: refusing to move next id back from {} to {}", self.next_id, next_id);
            return FsStatus::Mismatch;
        }
        self.next_id = next_id;
        FsStatus::Ok
    }

    fn checksum(&self, _mode: ChecksumMode) -> u64 {
        let mut sum = CHUNK_DIGEST_SEED;
        for (&id, info) in &self.chunks {
            let mut h = CHUNK_DIGEST_SEED;
            hash_combine(&mut h, id);
            hash_combine(&mut h, info.version as u64);
            for (&goal, &refs) in &info.refs {
                hash_combine(&mut h, goal as u64);
                hash_combine(&mut h, refs as u64);
            }
            add_to_checksum(&mut sum, h);
        }
        let mut h = CHUNK_DIGEST_SEED;
        hash_combine(&mut h, self.next_id);
        add_to_checksum(&mut sum, h);
        sum
    }

    fn store(&self, w: &mut dyn Write) -> Result<()> {
        let mut buf = Vec::new();
        put64(&mut buf, self.next_id);
        put32(&mut buf, self.chunks.len() as u32);
        for (&id, info) in &self.chunks {
            put64(&mut buf, id);
            put32(&mut buf, info.version);
            put32(&mut buf, info.lock_id);
            put32(&mut buf, info.refs.len() as u32);
            for (&goal, &refs) in &info.refs {
                buf.push(goal);
                put32(&mut buf, refs);
            }
        }
        w.write_all(&buf).context("writing chunk registry")
    }

    fn load(&mut self, r: &mut dyn Read, load_lock_ids: bool) -> Result<()> {
        let mut data = Vec::new();
        r.read_to_end(&mut data).context("reading chunk registry")?;
        let mut u = Unpacker::new(&data);
        self.chunks.clear();
        self.next_id = u.get64()?;
        let count = u.get32()?;
        for _ in 0..count {
            let id = u.get64()?;
            let version = u.get32()?;
            let lock_id = u.get32()?;
            let goals = u.get32()?;
            let mut info = ChunkInfo {
                version,
                lock_id: if load_lock_ids { lock_id } else { 0 },
                ..Default::default()
            };
            for _ in 0..goals {
                let goal = u.get8()?;
                let refs = u.get32()?;
                info.refs.insert(goal, refs);
            }
            if self.chunks.insert(id, info).is_some() {
                bail!("duplicate chunk {} in registry image", id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_path_creates_then_modifies() {
        let mut chunks = InMemoryChunks::new();
        let (id, opflag) = chunks.multi_modify(0, 10, 1, false).unwrap();
        assert_eq!(opflag, 1);
        assert!(chunks.exists(id));
        assert_eq!(chunks.unlock(id), FsStatus::Ok);
        let (id2, opflag2) = chunks.multi_modify(id, 11, 1, false).unwrap();
        assert_eq!(id2, id);
        assert_eq!(opflag2, 0);
    }

    #[test]
    fn refcounts_drop_chunk_at_zero() {
        let mut chunks = InMemoryChunks::new();
        let (id, _) = chunks.multi_modify(0, 1, 2, false).unwrap();
        assert_eq!(chunks.add_file(id, 2), FsStatus::Ok);
        assert_eq!(chunks.delete_file(id, 2), FsStatus::Ok);
        assert!(chunks.exists(id));
        assert_eq!(chunks.delete_file(id, 2), FsStatus::Ok);
        assert!(!chunks.exists(id));
    }

    #[test]
    fn quota_blocks_new_chunk_only() {
        let mut chunks = InMemoryChunks::new();
        assert_eq!(chunks.multi_modify(0, 1, 1, true).unwrap_err(), FsStatus::QuotaExceeded);
        let (id, _) = chunks.multi_modify(0, 1, 1, false).unwrap();
        chunks.unlock(id);
        // rewriting an existing chunk is allowed over quota
        assert!(chunks.multi_modify(id, 1, 1, true).is_ok());
    }

    #[test]
    fn store_load_keeps_checksum() {
        let mut chunks = InMemoryChunks::new();
        for _ in 0..5 {
            let (id, _) = chunks.multi_modify(0, 0, 1, false).unwrap();
            chunks.unlock(id);
        }
        let mut buf = Vec::new();
        chunks.store(&mut buf).unwrap();

        let mut restored = InMemoryChunks::new();
        restored.load(&mut buf.as_slice(), true).unwrap();
        assert_eq!(restored.checksum(ChecksumMode::GetCurrent), chunks.checksum(ChecksumMode::GetCurrent));
    }

    #[test]
    fn lock_id_guards_modification() {
        let mut chunks = InMemoryChunks::new();
        let (id, _) = chunks.multi_modify(0, 7, 1, false).unwrap();
        assert_eq!(chunks.multi_modify(id, 8, 1, false).unwrap_err(), FsStatus::ChunkLocked);
        chunks.unlock(id);
        assert!(chunks.multi_modify(id, 8, 1, false).is_ok());
    }
}
