/// Per-user / per-group quota database.
///
/// Limits are kept separately from live usage counters; usage is rebuilt
/// from the node table at image load. A limit of 0 means "not set".
use std::collections::BTreeMap;

use anyhow::{bail, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::meta_lib::codec::{put32, put64, put8, Unpacker};
use crate::meta_lib::hashfn::{add_to_checksum, hash_combine, QUOTA_CHECKSUM_SEED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum QuotaOwnerType {
    User = b'u',
    Group = b'g',
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum QuotaRigor {
    Soft = b'S',
    Hard = b'H',
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum QuotaResource {
    Inodes = b'i',
    Size = b's',
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub soft_inodes: u64,
    pub hard_inodes: u64,
    pub soft_size: u64,
    pub hard_size: u64,
}

impl QuotaLimits {
    fn is_empty(&self) -> bool {
        *self == QuotaLimits::default()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QuotaUsage {
    pub inodes: u64,
    pub size: u64,
}

/// A limits row together with current usage, as reported to clients.
#[derive(Debug, Clone, Copy)]
pub struct QuotaEntry {
    pub owner_type: QuotaOwnerType,
    pub owner_id: u32,
    pub limits: QuotaLimits,
    pub usage: QuotaUsage,
}

#[derive(Default)]
pub struct QuotaDatabase {
    limits: BTreeMap<(QuotaOwnerType, u32), QuotaLimits>,
    usage: BTreeMap<(QuotaOwnerType, u32), QuotaUsage>,
}

impl QuotaDatabase {
    pub fn new() -> Self {
        QuotaDatabase::default()
    }

    pub fn set_limit(
        &mut self,
        owner_type: QuotaOwnerType,
        owner_id: u32,
        rigor: QuotaRigor,
        resource: QuotaResource,
        limit: u64,
    ) {
        let entry = self.limits.entry((owner_type, owner_id)).or_default();
        match (rigor, resource) {
            (QuotaRigor::Soft, QuotaResource::Inodes) => entry.soft_inodes = limit,
            (QuotaRigor::Hard, QuotaResource::Inodes) => entry.hard_inodes = limit,
            (QuotaRigor::Soft, QuotaResource::Size) => entry.soft_size = limit,
            (QuotaRigor::Hard, QuotaResource::Size) => entry.hard_size = limit,
        }
        if entry.is_empty() {
            self.limits.remove(&(owner_type, owner_id));
        }
    }

    pub fn get_limits(&self, owner_type: QuotaOwnerType, owner_id: u32) -> QuotaLimits {
        self.limits.get(&(owner_type, owner_id)).copied().unwrap_or_default()
    }

    pub fn get_usage(&self, owner_type: QuotaOwnerType, owner_id: u32) -> QuotaUsage {
        self.usage.get(&(owner_type, owner_id)).copied().unwrap_or_default()
    }

    pub fn entries(&self) -> Vec<QuotaEntry> {
        self.limits
            .iter()
            .map(|(&(owner_type, owner_id), &limits)| QuotaEntry {
                owner_type,
                owner_id,
                limits,
                usage: self.usage.get(&(owner_type, owner_id)).copied().unwrap_or_default(),
            })
            .collect()
    }

    pub fn register_inode(&mut self, uid: u32, gid: u32) {
        self.update_inodes(uid, gid, 1);
    }

    pub fn unregister_inode(&mut self, uid: u32, gid: u32) {
        self.update_inodes(uid, gid, -1);
    }

    fn update_inodes(&mut self, uid: u32, gid: u32, delta: i64) {
        for key in [(QuotaOwnerType::User, uid), (QuotaOwnerType::Group, gid)] {
            let u = self.usage.entry(key).or_default();
            u.inodes = u.inodes.wrapping_add(delta as u64);
        }
    }

    pub fn update_size(&mut self, uid: u32, gid: u32, delta: i64) {
        for key in [(QuotaOwnerType::User, uid), (QuotaOwnerType::Group, gid)] {
            let u = self.usage.entry(key).or_default();
            u.size = u.size.wrapping_add(delta as u64);
        }
    }

    /// Hard inode limit reached for the user or its group.
    pub fn inode_quota_exceeded(&self, uid: u32, gid: u32) -> bool {
        self.exceeded(uid, gid, |l, u| l.hard_inodes != 0 && u.inodes >= l.hard_inodes)
    }

    /// Hard byte limit reached for the user or its group.
    pub fn size_quota_exceeded(&self, uid: u32, gid: u32) -> bool {
        self.exceeded(uid, gid, |l, u| l.hard_size != 0 && u.size >= l.hard_size)
    }

    fn exceeded(&self, uid: u32, gid: u32, pred: impl Fn(&QuotaLimits, &QuotaUsage) -> bool) -> bool {
        for key in [(QuotaOwnerType::User, uid), (QuotaOwnerType::Group, gid)] {
            if let Some(limits) = self.limits.get(&key) {
                let usage = self.usage.get(&key).copied().unwrap_or_default();
                if pred(limits, &usage) {
                    return true;
                }
            }
        }
        false
    }

    /// Digest over the limit rows; usage is derived state and not hashed.
    pub fn checksum(&self) -> u64 {
        let mut sum = QUOTA_CHECKSUM_SEED;
        for (&(owner_type, owner_id), limits) in &self.limits {
            let mut h = QUOTA_CHECKSUM_SEED;
            hash_combine(&mut h, u8::from(owner_type) as u64);
            hash_combine(&mut h, owner_id as u64);
            hash_combine(&mut h, limits.soft_inodes);
            hash_combine(&mut h, limits.hard_inodes);
            hash_combine(&mut h, limits.soft_size);
            hash_combine(&mut h, limits.hard_size);
            add_to_checksum(&mut sum, h);
        }
        sum
    }

    pub fn store(&self, buf: &mut Vec<u8>) {
        put32(buf, self.limits.len() as u32);
        for (&(owner_type, owner_id), limits) in &self.limits {
            put8(buf, owner_type.into());
            put32(buf, owner_id);
            put64(buf, limits.soft_inodes);
            put64(buf, limits.hard_inodes);
            put64(buf, limits.soft_size);
            put64(buf, limits.hard_size);
        }
    }

    pub fn load(&mut self, u: &mut Unpacker) -> Result<()> {
        let count = u.get32()?;
        for _ in 0..count {
            let raw_type = u.get8()?;
            let owner_type = match QuotaOwnerType::try_from(raw_type) {
                Ok(t) => t,
                Err(_) => bail!("bad quota owner type byte {:#x}", raw_type),
            };
            let owner_id = u.get32()?;
            let limits = QuotaLimits {
                soft_inodes: u.get64()?,
                hard_inodes: u.get64()?,
                soft_size: u.get64()?,
                hard_size: u.get64()?,
            };
            if !limits.is_empty() {
                self.limits.insert((owner_type, owner_id), limits);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_limit_blocks_soft_does_not() {
        let mut db = QuotaDatabase::new();
        db.set_limit(QuotaOwnerType::User, 1000, QuotaRigor::Soft, QuotaResource::Inodes, 1);
        db.register_inode(1000, 1000);
        db.register_inode(1000, 1000);
        assert!(!db.inode_quota_exceeded(1000, 1000));

        db.set_limit(QuotaOwnerType::User, 1000, QuotaRigor::Hard, QuotaResource::Inodes, 2);
        assert!(db.inode_quota_exceeded(1000, 1000));
    }

    #[test]
    fn group_limit_counts_too() {
        let mut db = QuotaDatabase::new();
        db.set_limit(QuotaOwnerType::Group, 5, QuotaRigor::Hard, QuotaResource::Size, 100);
        db.update_size(1, 5, 100);
        assert!(db.size_quota_exceeded(2, 5));
        assert!(!db.size_quota_exceeded(2, 6));
    }

    #[test]
    fn clearing_all_limits_drops_the_row() {
        let mut db = QuotaDatabase::new();
        db.set_limit(QuotaOwnerType::User, 1, QuotaRigor::Hard, QuotaResource::Size, 10);
        assert_eq!(db.entries().len(), 1);
        db.set_limit(QuotaOwnerType::User, 1, QuotaRigor::Hard, QuotaResource::Size, 0);
        assert!(db.entries().is_empty());
    }

    #[test]
    fn checksum_tracks_limits_not_usage() {
        let mut db = QuotaDatabase::new();
        let base = db.checksum();
        db.update_size(1, 1, 4096);
        assert_eq!(db.checksum(), base);
        db.set_limit(QuotaOwnerType::User, 1, QuotaRigor::Soft, QuotaResource::Size, 10);
        assert_ne!(db.checksum(), base);
    }

    #[test]
    fn store_load_roundtrip() {
        let mut db = QuotaDatabase::new();
        db.set_limit(QuotaOwnerType::User, 1000, QuotaRigor::Hard, QuotaResource::Inodes, 50);
        db.set_limit(QuotaOwnerType::Group, 7, QuotaRigor::Soft, QuotaResource::Size, 1 << 30);
        let mut buf = Vec::new();
        db.store(&mut buf);

        let mut restored = QuotaDatabase::new();
        restored.load(&mut Unpacker::new(&buf)).unwrap();
        assert_eq!(restored.get_limits(QuotaOwnerType::User, 1000).hard_inodes, 50);
        assert_eq!(restored.get_limits(QuotaOwnerType::Group, 7).soft_size, 1 << 30);
        assert_eq!(restored.checksum(), db.checksum());
    }
}
