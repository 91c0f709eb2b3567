/// Extended-attribute store.
///
/// Entries are indexed twice: by (inode, name) for point lookups and by
/// inode with running name/value length sums, so listxattr limits can be
/// enforced without walking the values.
use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};

use crate::meta_lib::codec::{put32, put8, Unpacker};
use crate::meta_lib::hashfn::{
    add_to_checksum, hash_combine, hash_combine_bytes, remove_from_checksum, XATTR_CHECKSUM_SEED,
};
use crate::meta_lib::types::{
    FsStatus, MAX_XATTR_LIST_LENGTH, MAX_XATTR_NAME_LENGTH, MAX_XATTR_VALUE_LENGTH,
};

/// setxattr modes, matching the wire protocol values.
pub const XATTR_SMODE_CREATE_OR_REPLACE: u8 = 0;
pub const XATTR_SMODE_CREATE_ONLY: u8 = 1;
pub const XATTR_SMODE_REPLACE_ONLY: u8 = 2;
pub const XATTR_SMODE_REMOVE: u8 = 3;

#[derive(Debug, Default, Clone, Copy)]
struct InodeSums {
    name_length: u32,
    value_length: u32,
}

#[derive(Default)]
pub struct XattrStore {
    data: BTreeMap<(u32, Vec<u8>), Vec<u8>>,
    names: BTreeMap<u32, BTreeSet<Vec<u8>>>,
    sums: BTreeMap<u32, InodeSums>,
    pub checksum: u64,
}

fn entry_checksum(inode: u32, name: &[u8], value: &[u8]) -> u64 {
    let mut h = XATTR_CHECKSUM_SEED;
    hash_combine(&mut h, inode as u64);
    hash_combine_bytes(&mut h, name);
    hash_combine_bytes(&mut h, value);
    h
}

pub fn name_check(name: &[u8]) -> FsStatus {
    if name.is_empty() || name.len() > MAX_XATTR_NAME_LENGTH {
        return FsStatus::InvalidArgument;
    }
    if name.contains(&0) {
        return FsStatus::InvalidArgument;
    }
    FsStatus::Ok
}

impl XattrStore {
    pub fn new() -> Self {
        XattrStore { checksum: XATTR_CHECKSUM_SEED, ..Default::default() }
    }

    pub fn get(&self, inode: u32, name: &[u8]) -> Result<&[u8], FsStatus> {
        match self.data.get(&(inode, name.to_vec())) {
            Some(v) => Ok(v),
            None => Err(FsStatus::NotFound),
        }
    }

    pub fn set(&mut self, inode: u32, name: &[u8], value: &[u8], mode: u8) -> FsStatus {
        if value.len() > MAX_XATTR_VALUE_LENGTH {
            return FsStatus::InvalidArgument;
        }
        let key = (inode, name.to_vec());
        let exists = self.data.contains_key(&key);
        match mode {
            XATTR_SMODE_CREATE_ONLY if exists => return FsStatus::AlreadyExists,
            XATTR_SMODE_REPLACE_ONLY | XATTR_SMODE_REMOVE if !exists => {
                return FsStatus::NotFound;
            }
            XATTR_SMODE_CREATE_OR_REPLACE | XATTR_SMODE_CREATE_ONLY | XATTR_SMODE_REPLACE_ONLY
            | XATTR_SMODE_REMOVE => {}
            _ => return FsStatus::InvalidArgument,
        }

        if mode == XATTR_SMODE_REMOVE {
            self.remove_entry(inode, name);
            return FsStatus::Ok;
        }

        if !exists {
            let sums = self.sums.entry(inode).or_default();
            let new_names = sums.name_length as usize + name.len() + 1;
            if new_names > MAX_XATTR_LIST_LENGTH {
                return FsStatus::InvalidArgument;
            }
            sums.name_length = new_names as u32;
            sums.value_length += value.len() as u32;
            self.names.entry(inode).or_default().insert(name.to_vec());
        } else if let Some(old) = self.data.get(&key) {
            let old_hash = entry_checksum(inode, name, old);
            let old_len = old.len();
            let sums = self.sums.entry(inode).or_default();
            sums.value_length = sums.value_length - old_len as u32 + value.len() as u32;
            remove_from_checksum(&mut self.checksum, old_hash);
        }
        add_to_checksum(&mut self.checksum, entry_checksum(inode, name, value));
        self.data.insert(key, value.to_vec());
        FsStatus::Ok
    }

    fn remove_entry(&mut self, inode: u32, name: &[u8]) {
        if let Some(value) = self.data.remove(&(inode, name.to_vec())) {
            remove_from_checksum(&mut self.checksum, entry_checksum(inode, name, &value));
            if let Some(sums) = self.sums.get_mut(&inode) {
                sums.name_length -= name.len() as u32 + 1;
                sums.value_length -= value.len() as u32;
            }
            if let Some(names) = self.names.get_mut(&inode) {
                names.remove(name);
                if names.is_empty() {
                    self.names.remove(&inode);
                    self.sums.remove(&inode);
                }
            }
        }
    }

    /// NUL-separated name list, as returned by listxattr.
    pub fn list(&self, inode: u32) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(names) = self.names.get(&inode) {
            for name in names {
                out.extend_from_slice(name);
                out.push(0);
            }
        }
        out
    }

    pub fn list_length(&self, inode: u32) -> u32 {
        self.sums.get(&inode).map(|s| s.name_length).unwrap_or(0)
    }

    /// Drops every attribute of a destroyed inode.
    pub fn remove_inode(&mut self, inode: u32) {
        let names: Vec<Vec<u8>> = self
            .names
            .get(&inode)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for name in names {
            self.remove_entry(inode, &name);
        }
    }

    pub fn recalculate_checksum(&mut self) {
        self.checksum = XATTR_CHECKSUM_SEED;
        for ((inode, name), value) in &self.data {
            add_to_checksum(&mut self.checksum, entry_checksum(*inode, name, value));
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (u32, &[u8], &[u8])> {
        self.data.iter().map(|((inode, name), value)| (*inode, name.as_slice(), value.as_slice()))
    }

    /// All entry keys of one inode.
    pub fn inode_keys(&self, inode: u32) -> Vec<(u32, Vec<u8>)> {
        self.names
            .get(&inode)
            .map(|set| set.iter().map(|name| (inode, name.clone())).collect())
            .unwrap_or_default()
    }

    /// Entry keys at or after `from`, for the background checksum sweep.
    pub fn keys_from(&self, from: Option<&(u32, Vec<u8>)>) -> Vec<(u32, Vec<u8>)> {
        match from {
            Some(k) => self.data.range(k.clone()..).map(|(k, _)| k.clone()).collect(),
            None => self.data.keys().cloned().collect(),
        }
    }

    pub fn entry_hash(&self, key: &(u32, Vec<u8>)) -> Option<u64> {
        self.data.get(key).map(|value| entry_checksum(key.0, &key.1, value))
    }

    pub fn store(&self, buf: &mut Vec<u8>) {
        for ((inode, name), value) in &self.data {
            put32(buf, *inode);
            put8(buf, name.len() as u8);
            put32(buf, value.len() as u32);
            buf.extend_from_slice(name);
            buf.extend_from_slice(value);
        }
        // zero header ends the section
        put32(buf, 0);
        put8(buf, 0);
        put32(buf, 0);
    }

    pub fn load(&mut self, u: &mut Unpacker) -> Result<()> {
        loop {
            let inode = u.get32()?;
            let name_len = u.get8()? as usize;
            let value_len = u.get32()? as usize;
            if inode == 0 && name_len == 0 && value_len == 0 {
                return Ok(());
            }
            if name_len == 0 {
                bail!("xattr entry for inode {} has empty name", inode);
            }
            let name = u.get_bytes(name_len)?;
            let value = u.get_bytes(value_len)?;
            let status = self.set(inode, &name, &value, XATTR_SMODE_CREATE_ONLY);
            if status != FsStatus::Ok {
                bail!("duplicate xattr entry for inode {}", inode);
            }
        }
    }
}
