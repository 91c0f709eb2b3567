/// POSIX access-control lists attached to inodes.
///
/// Each inode can carry an access ACL and, for directories, a default
/// ACL inherited by new children. ACLs are serialized textually for
/// changelog records and in binary for the image.
use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::meta_lib::codec::{put32, put8, Unpacker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AclType {
    Access = b'a',
    Default = b'd',
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessControlList {
    pub owner_perm: u8,
    pub group_perm: u8,
    pub other_perm: u8,
    /// 0..=7, or `None` when the ACL has no mask entry.
    pub mask: Option<u8>,
    pub named_users: BTreeMap<u32, u8>,
    pub named_groups: BTreeMap<u32, u8>,
}

impl AccessControlList {
    pub fn from_mode(mode: u16) -> Self {
        AccessControlList {
            owner_perm: ((mode >> 6) & 7) as u8,
            group_perm: ((mode >> 3) & 7) as u8,
            other_perm: (mode & 7) as u8,
            ..Default::default()
        }
    }

    pub fn is_extended(&self) -> bool {
        self.mask.is_some() || !self.named_users.is_empty() || !self.named_groups.is_empty()
    }

    fn effective(&self, perm: u8) -> u8 {
        match self.mask {
            Some(mask) => perm & mask,
            None => perm,
        }
    }

    /// POSIX acl_access algorithm with a single supplementary gid.
    pub fn allowed(&self, uid: u32, gid: u32, owner_uid: u32, owner_gid: u32, want: u8) -> bool {
        if uid == owner_uid {
            return self.owner_perm & want == want;
        }
        if let Some(&perm) = self.named_users.get(&uid) {
            return self.effective(perm) & want == want;
        }
        let mut group_matched = false;
        if gid == owner_gid {
            group_matched = true;
            if self.effective(self.group_perm) & want == want {
                return true;
            }
        }
        if let Some(&perm) = self.named_groups.get(&gid) {
            group_matched = true;
            if self.effective(perm) & want == want {
                return true;
            }
        }
        if group_matched {
            return false;
        }
        self.other_perm & want == want
    }

    /// Mode bits implied by this ACL (used when inheriting from defaults).
    pub fn to_mode(&self) -> u16 {
        let group = self.mask.unwrap_or(self.group_perm);
        ((self.owner_perm as u16) << 6) | ((group as u16) << 3) | self.other_perm as u16
    }

    pub fn store(&self, buf: &mut Vec<u8>) {
        put8(buf, self.owner_perm);
        put8(buf, self.group_perm);
        put8(buf, self.other_perm);
        put8(buf, self.mask.map(|m| m | 0x80).unwrap_or(0));
        put32(buf, self.named_users.len() as u32);
        for (&id, &perm) in &self.named_users {
            put32(buf, id);
            put8(buf, perm);
        }
        put32(buf, self.named_groups.len() as u32);
        for (&id, &perm) in &self.named_groups {
            put32(buf, id);
            put8(buf, perm);
        }
    }

    pub fn load(u: &mut Unpacker) -> Result<Self> {
        let mut acl = AccessControlList {
            owner_perm: u.get8()? & 7,
            group_perm: u.get8()? & 7,
            other_perm: u.get8()? & 7,
            ..Default::default()
        };
        let mask = u.get8()?;
        if mask & 0x80 != 0 {
            acl.mask = Some(mask & 7);
        }
        let users = u.get32()?;
        for _ in 0..users {
            let id = u.get32()?;
            let perm = u.get8()? & 7;
            acl.named_users.insert(id, perm);
        }
        let groups = u.get32()?;
        for _ in 0..groups {
            let id = u.get32()?;
            let perm = u.get8()? & 7;
            acl.named_groups.insert(id, perm);
        }
        Ok(acl)
    }

    /// Parses the textual form emitted by `Display`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split('|');
        let head = match parts.next() {
            Some(h) if h.len() == 3 => h,
            _ => bail!("bad acl string {:?}", text),
        };
        let digit = |c: char| -> Result<u8> {
            match c.to_digit(8) {
                Some(d) => Ok(d as u8),
                None => bail!("bad acl permission digit in {:?}", text),
            }
        };
        let mut chars = head.chars();
        let mut acl = AccessControlList {
            owner_perm: digit(chars.next().unwrap_or('0'))?,
            group_perm: digit(chars.next().unwrap_or('0'))?,
            other_perm: digit(chars.next().unwrap_or('0'))?,
            ..Default::default()
        };
        for part in parts {
            if let Some(rest) = part.strip_prefix('m') {
                acl.mask = Some(digit(rest.chars().next().unwrap_or('0'))?);
            } else if let Some(rest) = part.strip_prefix('u') {
                let (id, perm) = split_entry(rest, text)?;
                acl.named_users.insert(id, perm);
            } else if let Some(rest) = part.strip_prefix('g') {
                let (id, perm) = split_entry(rest, text)?;
                acl.named_groups.insert(id, perm);
            } else {
                bail!("bad acl entry {:?} in {:?}", part, text);
            }
        }
        Ok(acl)
    }
}

fn split_entry(rest: &str, full: &str) -> Result<(u32, u8)> {
    match rest.split_once(':') {
        Some((id, perm)) => {
            let id: u32 = id.parse()?;
            let perm = match perm.chars().next().and_then(|c| c.to_digit(8)) {
                Some(p) => p as u8,
                None => bail!("bad acl entry perm in {:?}", full),
            };
            Ok((id, perm))
        }
        None => bail!("bad acl entry {:?} in {:?}", rest, full),
    }
}

impl fmt::Display for AccessControlList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.owner_perm, self.group_perm, self.other_perm)?;
        if let Some(mask) = self.mask {
            write!(f, "|m{}", mask)?;
        }
        for (id, perm) in &self.named_users {
            write!(f, "|u{}:{}", id, perm)?;
        }
        for (id, perm) in &self.named_groups {
            write!(f, "|g{}:{}", id, perm)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct AclStore {
    entries: BTreeMap<(u32, AclType), AccessControlList>,
}

impl AclStore {
    pub fn new() -> Self {
        AclStore::default()
    }

    pub fn get(&self, inode: u32, acl_type: AclType) -> Option<&AccessControlList> {
        self.entries.get(&(inode, acl_type))
    }

    pub fn set(&mut self, inode: u32, acl_type: AclType, acl: AccessControlList) {
        self.entries.insert((inode, acl_type), acl);
    }

    pub fn remove(&mut self, inode: u32, acl_type: AclType) -> bool {
        self.entries.remove(&(inode, acl_type)).is_some()
    }

    pub fn remove_inode(&mut self, inode: u32) {
        self.entries.remove(&(inode, AclType::Access));
        self.entries.remove(&(inode, AclType::Default));
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, AclType, &AccessControlList)> {
        self.entries.iter().map(|(&(inode, t), acl)| (inode, t, acl))
    }

    pub fn store(&self, buf: &mut Vec<u8>) {
        for (&(inode, acl_type), acl) in &self.entries {
            put32(buf, inode);
            put8(buf, acl_type.into());
            acl.store(buf);
        }
        put32(buf, 0); // end marker
    }

    pub fn load(&mut self, u: &mut Unpacker) -> Result<()> {
        loop {
            let inode = u.get32()?;
            if inode == 0 {
                return Ok(());
            }
            let raw = u.get8()?;
            let acl_type = match AclType::try_from(raw) {
                Ok(t) => t,
                Err(_) => bail!("bad acl type byte {:#x} for inode {}", raw, inode),
            };
            let acl = AccessControlList::load(u)?;
            self.entries.insert((inode, acl_type), acl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extended_acl() -> AccessControlList {
        let mut acl = AccessControlList::from_mode(0o754);
        acl.mask = Some(5);
        acl.named_users.insert(1000, 7);
        acl.named_groups.insert(50, 6);
        acl
    }

    #[test]
    fn named_user_is_masked() {
        let acl = extended_acl();
        // named user has rwx but mask cuts it to r-x
        assert!(acl.allowed(1000, 99, 0, 0, 5));
        assert!(!acl.allowed(1000, 99, 0, 0, 2));
    }

    #[test]
    fn owner_bypasses_mask() {
        let acl = extended_acl();
        assert!(acl.allowed(0, 0, 0, 0, 7));
    }

    #[test]
    fn group_mismatch_falls_through_to_other() {
        let acl = extended_acl();
        // other = 4
        assert!(acl.allowed(42, 42, 0, 0, 4));
        assert!(!acl.allowed(42, 42, 0, 0, 2));
        // matching group that denies does not fall through
        assert!(!acl.allowed(42, 50, 0, 0, 1));
    }

    #[test]
    fn text_roundtrip() {
        for acl in [AccessControlList::from_mode(0o640), extended_acl()] {
            let text = acl.to_string();
            let parsed = AccessControlList::parse(&text).unwrap();
            assert_eq!(parsed, acl);
        }
        assert!(AccessControlList::parse("zz").is_err());
        assert!(AccessControlList::parse("754|x9").is_err());
    }

    #[test]
    fn store_load_roundtrip() {
        let mut store = AclStore::new();
        store.set(5, AclType::Access, extended_acl());
        store.set(5, AclType::Default, AccessControlList::from_mode(0o777));
        store.set(9, AclType::Access, AccessControlList::from_mode(0o600));
        let mut buf = Vec::new();
        store.store(&mut buf);

        let mut restored = AclStore::new();
        restored.load(&mut Unpacker::new(&buf)).unwrap();
        assert_eq!(restored.get(5, AclType::Access), Some(&extended_acl()));
        assert_eq!(
            restored.get(5, AclType::Default),
            Some(&AccessControlList::from_mode(0o777))
        );
        assert!(restored.get(9, AclType::Default).is_none());
    }
}
