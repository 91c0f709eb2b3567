/// Operation layer: the public entry points of the engine.
///
/// Every mutating operation validates its input, checks permissions and
/// quotas, performs the change through the graph helpers, refreshes the
/// digests and emits exactly one changelog record. The matching apply_*
/// functions replay records on a shadow, verifying every value the master
/// computed independently.
use std::convert::TryFrom;

use log::*;

use crate::meta_lib::acl::{AccessControlList, AclType};
use crate::meta_lib::changelog::ChangelogEntry;
use crate::meta_lib::codec::{escape_name, unescape_name};
use crate::meta_lib::node::{chunk_table_size, edge_checksum, name_check, TrashKey};
use crate::meta_lib::quota::{QuotaEntry, QuotaOwnerType, QuotaResource, QuotaRigor};
use crate::meta_lib::tasks::{new_visit_stats, SetGoalTask, SetTrashtimeTask, SnapshotTask};
use crate::meta_lib::types::*;
use crate::meta_lib::xattr;
use crate::meta_lib::Engine;

/// One readdir row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub inode: u32,
    pub node_type: u8,
    pub attributes: Option<Attributes>,
}

/// Result of cloning a single node during a snapshot.
pub struct CloneResult {
    pub dst_inode: u32,
    pub children: Vec<(u32, Vec<u8>)>,
}

/// Result of a repair pass over one file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairResult {
    pub not_changed: u32,
    pub erased: u32,
    pub repaired: u32,
}

impl Engine {
    // ------------------------------------------------------------------
    // changelog plumbing
    // ------------------------------------------------------------------

    /// Assigns the next version to a formatted record and appends it.
    pub(crate) fn emit_changelog(&mut self, ts: u32, payload: &str) {
        let version = self.metaversion;
        self.metaversion += 1;
        self.changelog.append(version, &format!("{}|{}", ts, payload));
        self.maybe_emit_checksum(ts);
    }

    /// Every `checksum_interval` mutations the master publishes its digest
    /// so shadows can verify they diverged from nothing.
    fn maybe_emit_checksum(&mut self, ts: u32) {
        let interval = self.config.checksum_interval as u64;
        if interval == 0 || self.metaversion <= self.checksum_last_emitted + interval {
            return;
        }
        if self.background.in_progress() {
            return;
        }
        self.checksum_last_emitted = self.metaversion;
        let digest = self.checksum(ChecksumMode::GetCurrent);
        let version = self.metaversion;
        self.metaversion += 1;
        self.changelog.append(
            version,
            &format!("{}|CHECKSUM({}):{}", ts, env!("CARGO_PKG_VERSION"), digest),
        );
    }

    // ------------------------------------------------------------------
    // resolution helpers
    // ------------------------------------------------------------------

    /// Maps a client inode through the session root and checks reachability.
    fn resolve(&self, ctx: &FsContext, inode: u32) -> Result<u32, FsStatus> {
        if ctx.rootinode == ROOT_INODE {
            return match self.node(inode) {
                Some(_) => Ok(inode),
                None => Err(FsStatus::NotFound),
            };
        }
        if ctx.rootinode == 0 {
            // meta-session: only detached nodes are visible
            let node = self.node(inode).ok_or(FsStatus::NotFound)?;
            return match node.node_type {
                NodeType::Trash | NodeType::Reserved => Ok(inode),
                _ => Err(FsStatus::NotPermitted),
            };
        }
        let root = self.node(ctx.rootinode).ok_or(FsStatus::NotFound)?;
        if !root.is_directory() {
            return Err(FsStatus::NotFound);
        }
        let inode = if inode == ROOT_INODE { ctx.rootinode } else { inode };
        if self.node(inode).is_none() {
            return Err(FsStatus::NotFound);
        }
        if inode != ctx.rootinode && !self.is_ancestor_or_detached(ctx.rootinode, inode) {
            return Err(FsStatus::NotPermitted);
        }
        Ok(inode)
    }

    fn resolve_dir(&self, ctx: &FsContext, inode: u32) -> Result<u32, FsStatus> {
        let id = self.resolve(ctx, inode)?;
        match self.node(id) {
            Some(n) if n.is_directory() => Ok(id),
            Some(_) => Err(FsStatus::NotDirectory),
            None => Err(FsStatus::NotFound),
        }
    }

    fn check_access(&self, ctx: &FsContext, id: u32, want: u8) -> Result<(), FsStatus> {
        let node = self.node(id).ok_or(FsStatus::NotFound)?;
        if self.has_access(node, ctx.uid, ctx.gid, want) {
            Ok(())
        } else {
            Err(FsStatus::AccessDenied)
        }
    }

    fn require_writable(&self, ctx: &FsContext) -> Result<(), FsStatus> {
        if ctx.read_only() {
            Err(FsStatus::ReadOnlyFs)
        } else {
            Ok(())
        }
    }

    /// Refreshes atime and logs it, unless disabled by configuration.
    fn update_atime(&mut self, id: u32, ts: u32) {
        if self.config.no_atime {
            return;
        }
        let needs_update = self.node(id).map(|n| n.atime != ts).unwrap_or(false);
        if needs_update {
            if let Some(node) = self.node_mut(id) {
                node.atime = ts;
            }
            self.update_node_checksum(id);
            self.emit_changelog(ts, &format!("ACCESS({})", id));
        }
    }

    // ------------------------------------------------------------------
    // lookups and attributes
    // ------------------------------------------------------------------

    pub fn lookup(&self, ctx: &FsContext, parent: u32, name: &[u8]) -> Result<(u32, Attributes), FsStatus> {
        let dir_id = self.resolve_dir(ctx, parent)?;
        self.check_access(ctx, dir_id, MODE_MASK_X)?;
        let target = if name == b"." {
            dir_id
        } else if name == b".." {
            if dir_id == ctx.rootinode || dir_id == ROOT_INODE {
                dir_id
            } else {
                self.node(dir_id)
                    .and_then(|n| n.parents.first().copied())
                    .unwrap_or(dir_id)
            }
        } else {
            if name_check(name) != FsStatus::Ok {
                return Err(FsStatus::InvalidArgument);
            }
            self.lookup_child(dir_id, name).ok_or(FsStatus::NotFound)?
        };
        let node = self.node(target).ok_or(FsStatus::NotFound)?;
        Ok((target, node.attributes()))
    }

    pub fn getattr(&self, ctx: &FsContext, inode: u32) -> Result<Attributes, FsStatus> {
        let id = self.resolve(ctx, inode)?;
        Ok(self.node(id).ok_or(FsStatus::NotFound)?.attributes())
    }

    pub fn access(&self, ctx: &FsContext, inode: u32, modemask: u8) -> Result<(), FsStatus> {
        let id = self.resolve(ctx, inode)?;
        self.check_access(ctx, id, modemask)
    }

    /// The setattr operation. `attrmode` carries permissions only.
    #[allow(clippy::too_many_arguments)]
    pub fn setattr(
        &mut self,
        ctx: &FsContext,
        inode: u32,
        setmask: u8,
        attrmode: u16,
        attruid: u32,
        attrgid: u32,
        attratime: u32,
        attrmtime: u32,
    ) -> Result<Attributes, FsStatus> {
        self.require_writable(ctx)?;
        let id = self.resolve(ctx, inode)?;
        let ts = ctx.ts;
        let mut attrmode = attrmode;
        {
            let node = self.node(id).ok_or(FsStatus::NotFound)?;
            if ctx.uid != 0 && ctx.sesflags & SESFLAG_MAPALL != 0 && setmask & (SET_UID | SET_GID) != 0 {
                return Err(FsStatus::NotPermitted);
            }
            let owner_relaxed = node.eattr() & EATTR_NOOWNER != 0;
            if !owner_relaxed && ctx.uid != 0 && ctx.uid != node.uid {
                if setmask & (SET_MODE | SET_UID | SET_GID) != 0 {
                    return Err(FsStatus::NotPermitted);
                }
                if setmask & SET_ATIME != 0 && setmask & SET_ATIME_NOW == 0 {
                    return Err(FsStatus::NotPermitted);
                }
                if setmask & SET_MTIME != 0 && setmask & SET_MTIME_NOW == 0 {
                    return Err(FsStatus::NotPermitted);
                }
                if setmask & (SET_ATIME_NOW | SET_MTIME_NOW) != 0
                    && !self.has_access(node, ctx.uid, ctx.gid, MODE_MASK_W)
                {
                    return Err(FsStatus::AccessDenied);
                }
            }
            if ctx.uid != 0 && ctx.uid != attruid && setmask & SET_UID != 0 {
                return Err(FsStatus::NotPermitted);
            }
            if ctx.sesflags & SESFLAG_IGNOREGID == 0
                && ctx.uid != 0
                && ctx.gid != attrgid
                && setmask & SET_GID != 0
            {
                return Err(FsStatus::NotPermitted);
            }
        }
        // chown+chmod together means the kernel already cleared sugid bits;
        // keep ours and do the clearing ourselves below
        if setmask & (SET_UID | SET_GID) != 0 && setmask & SET_MODE != 0 {
            let mode = self.node(id).map(|n| n.mode).unwrap_or(0);
            attrmode |= mode & 0o6000;
        }
        let sugid_mode = self.config.sugid_clear_mode;
        {
            let uid = ctx.uid;
            let node = self.node_mut(id).ok_or(FsStatus::NotFound)?;
            if node.mode & 0o6000 != 0 && setmask & (SET_UID | SET_GID) != 0 {
                match sugid_mode {
                    SugidClearMode::Always => {
                        node.mode &= 0o171777;
                        attrmode &= 0o1777;
                    }
                    SugidClearMode::Osx => {
                        if uid != 0 {
                            node.mode &= 0o171777;
                            attrmode &= 0o1777;
                        }
                    }
                    SugidClearMode::Bsd => {
                        if uid != 0 && setmask & SET_GID != 0 && node.gid != attrgid {
                            node.mode &= 0o171777;
                            attrmode &= 0o1777;
                        }
                    }
                    SugidClearMode::Ext => {
                        if node.node_type != NodeType::Directory {
                            if node.mode & 0o10 != 0 {
                                node.mode &= 0o171777;
                                attrmode &= 0o1777;
                            } else {
                                node.mode &= 0o173777;
                                attrmode &= 0o3777;
                            }
                        }
                    }
                    SugidClearMode::Xfs => {
                        if node.node_type != NodeType::Directory {
                            if node.mode & 0o10 != 0 {
                                node.mode &= 0o171777;
                                attrmode &= 0o1777;
                            } else {
                                node.mode &= 0o173777;
                                attrmode &= 0o3777;
                            }
                        } else if uid != 0 {
                            node.mode &= 0o171777;
                            attrmode &= 0o1777;
                        }
                    }
                    SugidClearMode::Never => {}
                }
            }
            if setmask & SET_MODE != 0 {
                node.mode = (attrmode & 0o7777) | (node.mode & 0xF000);
            }
        }
        if setmask & (SET_UID | SET_GID) != 0 {
            let (old_uid, old_gid, size) = {
                let node = &self.nodes[&id];
                (node.uid, node.gid, if node.is_file_kind() { node.stats().size as i64 } else { 0 })
            };
            let new_uid = if setmask & SET_UID != 0 { attruid } else { old_uid };
            let new_gid = if setmask & SET_GID != 0 { attrgid } else { old_gid };
            if new_uid != old_uid || new_gid != old_gid {
                self.quotas.unregister_inode(old_uid, old_gid);
                self.quotas.update_size(old_uid, old_gid, -size);
                self.quotas.register_inode(new_uid, new_gid);
                self.quotas.update_size(new_uid, new_gid, size);
                if let Some(node) = self.node_mut(id) {
                    node.uid = new_uid;
                    node.gid = new_gid;
                }
            }
        }
        {
            let ts = ctx.ts;
            let node = self.node_mut(id).ok_or(FsStatus::NotFound)?;
            if setmask & SET_ATIME_NOW != 0 {
                node.atime = ts;
            } else if setmask & SET_ATIME != 0 {
                node.atime = attratime;
            }
            if setmask & SET_MTIME_NOW != 0 {
                node.mtime = ts;
            } else if setmask & SET_MTIME != 0 {
                node.mtime = attrmtime;
            }
        }
        let record = {
            let node = &self.nodes[&id];
            format!(
                "ATTR({},{},{},{},{},{})",
                id,
                node.mode & 0o7777,
                node.uid,
                node.gid,
                node.atime,
                node.mtime
            )
        };
        self.emit_changelog(ts, &record);
        self.update_ctime(id, ts);
        self.update_node_checksum(id);
        Ok(self.nodes[&id].attributes())
    }

    // ------------------------------------------------------------------
    // namespace mutations
    // ------------------------------------------------------------------

    fn create_checks(
        &self,
        ctx: &FsContext,
        parent: u32,
        name: &[u8],
    ) -> Result<u32, FsStatus> {
        self.require_writable(ctx)?;
        if name_check(name) != FsStatus::Ok {
            return Err(FsStatus::InvalidArgument);
        }
        let dir_id = self.resolve_dir(ctx, parent)?;
        self.check_access(ctx, dir_id, MODE_MASK_W | MODE_MASK_X)?;
        if self.lookup_child(dir_id, name).is_some() {
            return Err(FsStatus::AlreadyExists);
        }
        if self.quotas.inode_quota_exceeded(ctx.uid, ctx.gid) {
            return Err(FsStatus::QuotaExceeded);
        }
        Ok(dir_id)
    }

    pub fn mknod(
        &mut self,
        ctx: &FsContext,
        parent: u32,
        name: &[u8],
        node_type: NodeType,
        mode: u16,
        umask: u16,
        rdev: u32,
    ) -> Result<(u32, Attributes), FsStatus> {
        if !matches!(
            node_type,
            NodeType::File | NodeType::Socket | NodeType::Fifo | NodeType::BlockDev | NodeType::CharDev
        ) {
            return Err(FsStatus::InvalidArgument);
        }
        let dir_id = self.create_checks(ctx, parent, name)?;
        let id = self.create_node(ctx.ts, dir_id, name, node_type, mode, umask, ctx.uid, ctx.gid, false, 0);
        if node_type.is_device() {
            if let Some(node) = self.node_mut(id) {
                node.payload = crate::meta_lib::node::Payload::Device(rdev);
            }
            self.update_node_checksum(id);
        }
        let record = {
            let node = &self.nodes[&id];
            format!(
                "CREATE({},{},{},{},{},{},{}):{}",
                dir_id,
                escape_name(name),
                u8::from(node_type) as char,
                node.mode & 0o7777,
                ctx.uid,
                ctx.gid,
                rdev,
                id
            )
        };
        self.emit_changelog(ctx.ts, &record);
        Ok((id, self.nodes[&id].attributes()))
    }

    pub fn mkdir(
        &mut self,
        ctx: &FsContext,
        parent: u32,
        name: &[u8],
        mode: u16,
        umask: u16,
    ) -> Result<(u32, Attributes), FsStatus> {
        let dir_id = self.create_checks(ctx, parent, name)?;
        let id = self.create_node(
            ctx.ts,
            dir_id,
            name,
            NodeType::Directory,
            mode,
            umask,
            ctx.uid,
            ctx.gid,
            true,
            0,
        );
        let record = {
            let node = &self.nodes[&id];
            format!(
                "CREATE({},{},d,{},{},{},0):{}",
                dir_id,
                escape_name(name),
                node.mode & 0o7777,
                ctx.uid,
                ctx.gid,
                id
            )
        };
        self.emit_changelog(ctx.ts, &record);
        Ok((id, self.nodes[&id].attributes()))
    }

    pub fn symlink(
        &mut self,
        ctx: &FsContext,
        parent: u32,
        name: &[u8],
        target: &[u8],
    ) -> Result<(u32, Attributes), FsStatus> {
        if target.is_empty() || target.contains(&0) {
            return Err(FsStatus::InvalidArgument);
        }
        let dir_id = self.create_checks(ctx, parent, name)?;
        let id = self.create_node(
            ctx.ts,
            dir_id,
            name,
            NodeType::Symlink,
            0o777,
            0,
            ctx.uid,
            ctx.gid,
            false,
            0,
        );
        let old_stats = self.get_stats(id);
        if let Some(node) = self.node_mut(id) {
            node.payload = crate::meta_lib::node::Payload::Symlink(target.to_vec());
        }
        let new_stats = self.get_stats(id);
        self.propagate_stats(id, &new_stats, &old_stats);
        self.update_node_checksum(id);
        let record = format!(
            "SYMLINK({},{},{},{},{}):{}",
            dir_id,
            escape_name(name),
            escape_name(target),
            ctx.uid,
            ctx.gid,
            id
        );
        self.emit_changelog(ctx.ts, &record);
        Ok((id, self.nodes[&id].attributes()))
    }

    pub fn readlink(&mut self, ctx: &FsContext, inode: u32) -> Result<Vec<u8>, FsStatus> {
        let id = self.resolve(ctx, inode)?;
        let path = match self.node(id).map(|n| (&n.payload, n.node_type)) {
            Some((crate::meta_lib::node::Payload::Symlink(path), _)) => path.clone(),
            Some(_) => return Err(FsStatus::InvalidArgument),
            None => return Err(FsStatus::NotFound),
        };
        self.update_atime(id, ctx.ts);
        Ok(path)
    }

    pub fn unlink(&mut self, ctx: &FsContext, parent: u32, name: &[u8]) -> Result<u32, FsStatus> {
        self.unlink_common(ctx, parent, name, false)
    }

    pub fn rmdir(&mut self, ctx: &FsContext, parent: u32, name: &[u8]) -> Result<u32, FsStatus> {
        self.unlink_common(ctx, parent, name, true)
    }

    fn unlink_common(
        &mut self,
        ctx: &FsContext,
        parent: u32,
        name: &[u8],
        expect_dir: bool,
    ) -> Result<u32, FsStatus> {
        self.require_writable(ctx)?;
        if name_check(name) != FsStatus::Ok {
            return Err(FsStatus::InvalidArgument);
        }
        let dir_id = self.resolve_dir(ctx, parent)?;
        self.check_access(ctx, dir_id, MODE_MASK_W | MODE_MASK_X)?;
        let child_id = self.lookup_child(dir_id, name).ok_or(FsStatus::NotFound)?;
        {
            let parent_node = self.node(dir_id).ok_or(FsStatus::NotFound)?;
            let child = self.node(child_id).ok_or(FsStatus::NotFound)?;
            if !self.sticky_access(parent_node, child, ctx.uid) {
                return Err(FsStatus::NotPermitted);
            }
            if expect_dir {
                if !child.is_directory() {
                    return Err(FsStatus::NotDirectory);
                }
                if child.dir().map(|d| !d.children.is_empty()).unwrap_or(false) {
                    return Err(FsStatus::NotEmpty);
                }
            } else if child.is_directory() {
                return Err(FsStatus::IsDirectory);
            }
        }
        self.unlink_node(ctx.ts, dir_id, name, child_id);
        self.emit_changelog(
            ctx.ts,
            &format!("UNLINK({},{}):{}", dir_id, escape_name(name), child_id),
        );
        Ok(child_id)
    }

    pub fn link(
        &mut self,
        ctx: &FsContext,
        inode: u32,
        dst_parent: u32,
        dst_name: &[u8],
    ) -> Result<(u32, Attributes), FsStatus> {
        self.require_writable(ctx)?;
        if name_check(dst_name) != FsStatus::Ok {
            return Err(FsStatus::InvalidArgument);
        }
        let id = self.resolve(ctx, inode)?;
        {
            let node = self.node(id).ok_or(FsStatus::NotFound)?;
            if node.is_directory() {
                return Err(FsStatus::NotPermitted);
            }
            if matches!(node.node_type, NodeType::Trash | NodeType::Reserved) {
                return Err(FsStatus::NotPermitted);
            }
        }
        let dir_id = self.resolve_dir(ctx, dst_parent)?;
        self.check_access(ctx, dir_id, MODE_MASK_W | MODE_MASK_X)?;
        if self.lookup_child(dir_id, dst_name).is_some() {
            return Err(FsStatus::AlreadyExists);
        }
        self.link_node(ctx.ts, dir_id, id, dst_name);
        self.emit_changelog(
            ctx.ts,
            &format!("LINK({},{},{})", id, dir_id, escape_name(dst_name)),
        );
        Ok((id, self.nodes[&id].attributes()))
    }

    pub fn rename(
        &mut self,
        ctx: &FsContext,
        src_parent: u32,
        src_name: &[u8],
        dst_parent: u32,
        dst_name: &[u8],
    ) -> Result<u32, FsStatus> {
        self.require_writable(ctx)?;
        if name_check(dst_name) != FsStatus::Ok {
            return Err(FsStatus::InvalidArgument);
        }
        let src_dir = self.resolve_dir(ctx, src_parent)?;
        let dst_dir = self.resolve_dir(ctx, dst_parent)?;
        self.check_access(ctx, src_dir, MODE_MASK_W | MODE_MASK_X)?;
        self.check_access(ctx, dst_dir, MODE_MASK_W | MODE_MASK_X)?;
        let node_id = self.lookup_child(src_dir, src_name).ok_or(FsStatus::NotFound)?;
        {
            let src_dir_node = self.node(src_dir).ok_or(FsStatus::NotFound)?;
            let node = self.node(node_id).ok_or(FsStatus::NotFound)?;
            if !self.sticky_access(src_dir_node, node, ctx.uid) {
                return Err(FsStatus::NotPermitted);
            }
            // a directory cannot be moved into its own subtree
            if node.is_directory() && (node_id == dst_dir || self.is_ancestor(node_id, dst_dir)) {
                return Err(FsStatus::InvalidArgument);
            }
        }
        if let Some(existing) = self.lookup_child(dst_dir, dst_name) {
            if existing == node_id {
                return Ok(node_id);
            }
            {
                let dst_dir_node = self.node(dst_dir).ok_or(FsStatus::NotFound)?;
                let dst_node = self.node(existing).ok_or(FsStatus::NotFound)?;
                if !self.sticky_access(dst_dir_node, dst_node, ctx.uid) {
                    return Err(FsStatus::NotPermitted);
                }
                let src_is_dir = self.node(node_id).map(|n| n.is_directory()).unwrap_or(false);
                if dst_node.is_directory() {
                    if !src_is_dir {
                        return Err(FsStatus::IsDirectory);
                    }
                    if dst_node.dir().map(|d| !d.children.is_empty()).unwrap_or(false) {
                        return Err(FsStatus::NotEmpty);
                    }
                } else if src_is_dir {
                    return Err(FsStatus::NotDirectory);
                }
            }
            self.unlink_node(ctx.ts, dst_dir, dst_name, existing);
        }
        self.remove_edge(ctx.ts, src_dir, src_name, node_id);
        self.link_node(ctx.ts, dst_dir, node_id, dst_name);
        self.emit_changelog(
            ctx.ts,
            &format!(
                "MOVE({},{},{},{}):{}",
                src_dir,
                escape_name(src_name),
                dst_dir,
                escape_name(dst_name),
                node_id
            ),
        );
        Ok(node_id)
    }

    pub fn readdir(
        &mut self,
        ctx: &FsContext,
        inode: u32,
        first_entry: u64,
        max_entries: u64,
        with_attributes: bool,
    ) -> Result<Vec<DirEntry>, FsStatus> {
        let dir_id = self.resolve_dir(ctx, inode)?;
        self.check_access(ctx, dir_id, MODE_MASK_R)?;
        let mut entries = Vec::new();
        let parent_id = if dir_id == ctx.rootinode || dir_id == ROOT_INODE {
            dir_id
        } else {
            self.node(dir_id).and_then(|n| n.parents.first().copied()).unwrap_or(dir_id)
        };
        let dir_node = self.node(dir_id).ok_or(FsStatus::NotFound)?;
        let dir_data = dir_node.dir().ok_or(FsStatus::NotDirectory)?;
        let make_attrs = |id: u32| -> Option<Attributes> {
            if with_attributes {
                self.node(id).map(|n| n.attributes())
            } else {
                None
            }
        };
        let mut index = 0u64;
        let mut remaining = max_entries;
        let specials = [(b".".to_vec(), dir_id), (b"..".to_vec(), parent_id)];
        for (name, id) in specials {
            if index >= first_entry && remaining > 0 {
                entries.push(DirEntry {
                    name,
                    inode: id,
                    node_type: NodeType::Directory.into(),
                    attributes: make_attrs(id),
                });
                remaining -= 1;
            }
            index += 1;
        }
        for (name, &child) in &dir_data.children {
            if remaining == 0 {
                break;
            }
            if index >= first_entry {
                let node_type =
                    self.node(child).map(|n| u8::from(n.node_type)).unwrap_or(b'f');
                entries.push(DirEntry {
                    name: name.clone(),
                    inode: child,
                    node_type,
                    attributes: make_attrs(child),
                });
                remaining -= 1;
            }
            index += 1;
        }
        self.update_atime(dir_id, ctx.ts);
        Ok(entries)
    }

    pub fn get_dir_stats(&self, ctx: &FsContext, inode: u32) -> Result<StatsRecord, FsStatus> {
        let dir_id = self.resolve_dir(ctx, inode)?;
        Ok(self.node(dir_id).map(|n| n.stats()).unwrap_or_default())
    }

    // ------------------------------------------------------------------
    // open files and sessions
    // ------------------------------------------------------------------

    /// Allocates a session id for a freshly connected client.
    pub fn new_session(&mut self, ts: u32) -> u32 {
        self.emit_changelog(ts, &format!("SESSION():{}", self.nextsessionid));
        let id = self.nextsessionid;
        self.nextsessionid += 1;
        id
    }

    /// Access checks for open; optionally triggers automatic repair.
    pub fn open_check(&mut self, ctx: &FsContext, inode: u32, want: u8) -> Result<Attributes, FsStatus> {
        let id = self.resolve(ctx, inode)?;
        {
            let node = self.node(id).ok_or(FsStatus::NotFound)?;
            if !node.is_file_kind() {
                return Err(FsStatus::NotPermitted);
            }
            if ctx.read_only() && want & MODE_MASK_W != 0 {
                return Err(FsStatus::ReadOnlyFs);
            }
        }
        self.check_access(ctx, id, want)?;
        if self.config.magic_auto_file_repair {
            let missing = self
                .node(id)
                .and_then(|n| n.file())
                .map(|f| f.chunks.iter().any(|&c| c != 0 && !self.chunks.exists(c)))
                .unwrap_or(false);
            if missing {
                info!("auto repair of inode {}", id);
                let _ = self.repair(ctx, id);
            }
        }
        Ok(self.nodes[&id].attributes())
    }

    pub fn acquire(&mut self, ctx: &FsContext, inode: u32, sessionid: u32) -> Result<(), FsStatus> {
        let id = self.resolve(ctx, inode)?;
        {
            let node = self.node_mut(id).ok_or(FsStatus::NotFound)?;
            if !node.node_type.is_file_kind() {
                return Err(FsStatus::NotPermitted);
            }
            let file = node.file_mut().ok_or(FsStatus::NotPermitted)?;
            if file.sessions.contains(&sessionid) {
                return Err(FsStatus::InvalidArgument);
            }
            file.sessions.push(sessionid);
        }
        self.emit_changelog(ctx.ts, &format!("ACQUIRE({},{})", id, sessionid));
        Ok(())
    }

    pub fn release(&mut self, ctx: &FsContext, inode: u32, sessionid: u32) -> Result<(), FsStatus> {
        let id = self.resolve(ctx, inode)?;
        let became_empty;
        let is_reserved;
        {
            let node = self.node_mut(id).ok_or(FsStatus::NotFound)?;
            is_reserved = node.node_type == NodeType::Reserved;
            let file = node.file_mut().ok_or(FsStatus::NotPermitted)?;
            match file.sessions.iter().position(|&s| s == sessionid) {
                Some(pos) => {
                    file.sessions.remove(pos);
                }
                None => return Err(FsStatus::InvalidArgument),
            }
            became_empty = file.sessions.is_empty();
        }
        self.emit_changelog(ctx.ts, &format!("RELEASE({},{})", id, sessionid));
        if is_reserved && became_empty {
            self.purge_node(ctx.ts, id);
        }
        Ok(())
    }

    /// Removes a disconnected session everywhere: open files and locks.
    pub fn drop_session(&mut self, ts: u32, sessionid: u32) {
        let open: Vec<u32> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.file().map(|f| f.sessions.contains(&sessionid)).unwrap_or(false))
            .map(|(&id, _)| id)
            .collect();
        let ctx = FsContext::internal(ts);
        for inode in open {
            let _ = self.release(&ctx, inode, sessionid);
        }
        self.posix_locks.remove_session(sessionid);
        self.flock_locks.remove_session(sessionid);
    }

    // ------------------------------------------------------------------
    // chunk I/O
    // ------------------------------------------------------------------

    pub fn read_chunk(&mut self, ctx: &FsContext, inode: u32, index: u32) -> Result<(u64, u64), FsStatus> {
        let id = self.resolve(ctx, inode)?;
        let (chunk_id, length) = {
            let node = self.node(id).ok_or(FsStatus::NotFound)?;
            let file = node.file().ok_or(FsStatus::NotPermitted)?;
            if index > MAX_FILE_INDEX {
                return Err(FsStatus::IndexTooBig);
            }
            let chunk_id = file.chunks.get(index as usize).copied().unwrap_or(0);
            (chunk_id, file.length)
        };
        self.update_atime(id, ctx.ts);
        Ok((chunk_id, length))
    }

    /// Prepares a chunk for writing, growing the chunk table as needed.
    /// Returns (chunk id, file length, opflag).
    pub fn write_chunk(
        &mut self,
        ctx: &FsContext,
        inode: u32,
        index: u32,
        lock_id: u32,
    ) -> Result<(u64, u64, u8), FsStatus> {
        self.require_writable(ctx)?;
        let id = self.resolve(ctx, inode)?;
        if index > MAX_FILE_INDEX {
            return Err(FsStatus::IndexTooBig);
        }
        let old_stats = self.get_stats(id);
        let (goal, uid, gid, old_chunk) = {
            let node = self.node(id).ok_or(FsStatus::NotFound)?;
            let file = node.file().ok_or(FsStatus::NotPermitted)?;
            let old_chunk = file.chunks.get(index as usize).copied().unwrap_or(0);
            (node.goal, node.uid, node.gid, old_chunk)
        };
        let quota_exceeded = self.quotas.size_quota_exceeded(uid, gid);
        let (new_chunk, opflag) = self.chunks.multi_modify(old_chunk, lock_id, goal, quota_exceeded)?;
        let length = {
            let ts = ctx.ts;
            let node = self.node_mut(id).ok_or(FsStatus::NotFound)?;
            node.mtime = ts;
            node.ctime = ts;
            let file = node.file_mut().ok_or(FsStatus::NotPermitted)?;
            if file.chunks.len() <= index as usize {
                file.chunks.resize(chunk_table_size(index + 1) as usize, 0);
            }
            file.chunks[index as usize] = new_chunk;
            file.length
        };
        let new_stats = self.get_stats(id);
        self.quotas.update_size(uid, gid, new_stats.size as i64 - old_stats.size as i64);
        self.propagate_stats(id, &new_stats, &old_stats);
        self.update_node_checksum(id);
        self.emit_changelog(
            ctx.ts,
            &format!("WRITE({},{},{},{}):{}", id, index, opflag, lock_id, new_chunk),
        );
        Ok((new_chunk, length, opflag))
    }

    /// First phase of truncate. When the tail chunk must be shortened on
    /// the chunkservers this returns `Delayed` with the locked chunk id.
    pub fn try_setlength(
        &mut self,
        ctx: &FsContext,
        inode: u32,
        length: u64,
        opened: bool,
        lock_id: u32,
    ) -> Result<(Attributes, Option<u64>), FsStatus> {
        self.require_writable(ctx)?;
        let id = self.resolve(ctx, inode)?;
        {
            let node = self.node(id).ok_or(FsStatus::NotFound)?;
            if !node.is_file_kind() {
                return Err(FsStatus::NotPermitted);
            }
            if !opened && !self.has_access(node, ctx.uid, ctx.gid, MODE_MASK_W) {
                return Err(FsStatus::AccessDenied);
            }
        }
        if length & CHUNK_MASK != 0 {
            let index = (length >> CHUNK_BITS) as usize;
            let (old_chunk, goal, uid, gid) = {
                let node = self.node(id).ok_or(FsStatus::NotFound)?;
                let file = node.file().ok_or(FsStatus::NotPermitted)?;
                (
                    file.chunks.get(index).copied().unwrap_or(0),
                    node.goal,
                    node.uid,
                    node.gid,
                )
            };
            if old_chunk > 0 {
                let quota_exceeded = self.quotas.size_quota_exceeded(uid, gid);
                let new_chunk = self.chunks.multi_truncate(old_chunk, lock_id, goal, quota_exceeded)?;
                if let Some(node) = self.node_mut(id) {
                    if let Some(file) = node.file_mut() {
                        file.chunks[index] = new_chunk;
                    }
                }
                self.update_node_checksum(id);
                self.emit_changelog(
                    ctx.ts,
                    &format!("TRUNC({},{},{}):{}", id, index, lock_id, new_chunk),
                );
                return Ok((Attributes::default(), Some(new_chunk)));
            }
        }
        Ok((self.nodes[&id].attributes(), None))
    }

    /// Second phase of truncate: commits the new length.
    pub fn do_setlength(&mut self, ctx: &FsContext, inode: u32, length: u64) -> Result<Attributes, FsStatus> {
        self.require_writable(ctx)?;
        let id = self.resolve(ctx, inode)?;
        {
            let node = self.node(id).ok_or(FsStatus::NotFound)?;
            if !node.is_file_kind() {
                return Err(FsStatus::NotPermitted);
            }
            let quota_would_grow = length > node.file().map(|f| f.length).unwrap_or(0);
            if quota_would_grow && self.quotas.size_quota_exceeded(node.uid, node.gid) {
                return Err(FsStatus::QuotaExceeded);
            }
        }
        self.set_length(id, length);
        let record = {
            let node = &self.nodes[&id];
            format!("LENGTH({},{})", id, node.file().map(|f| f.length).unwrap_or(0))
        };
        self.emit_changelog(ctx.ts, &record);
        if let Some(node) = self.node_mut(id) {
            node.mtime = ctx.ts;
        }
        self.update_ctime(id, ctx.ts);
        self.update_node_checksum(id);
        Ok(self.nodes[&id].attributes())
    }

    /// Final phase of truncate: unlocks the chunk shortened by phase one.
    pub fn end_setlength(&mut self, ts: u32, chunk_id: u64) -> FsStatus {
        self.emit_changelog(ts, &format!("UNLOCK({})", chunk_id));
        self.chunks.unlock(chunk_id)
    }

    /// Forwards a chunk-counter bump from the chunk module to the log.
    pub fn set_next_chunk_id(&mut self, ts: u32, next_id: u64) -> FsStatus {
        let status = self.chunks.set_next_id(next_id);
        if status == FsStatus::Ok {
            self.emit_changelog(ts, &format!("NEXTCHUNKID({})", next_id));
        }
        status
    }

    pub fn append(&mut self, ctx: &FsContext, dst_inode: u32, src_inode: u32) -> Result<(), FsStatus> {
        self.require_writable(ctx)?;
        let dst = self.resolve(ctx, dst_inode)?;
        let src = self.resolve(ctx, src_inode)?;
        if dst == src {
            return Err(FsStatus::InvalidArgument);
        }
        {
            let dst_node = self.node(dst).ok_or(FsStatus::NotFound)?;
            let src_node = self.node(src).ok_or(FsStatus::NotFound)?;
            if !dst_node.is_file_kind() || !src_node.is_file_kind() {
                return Err(FsStatus::NotPermitted);
            }
            if !self.has_access(dst_node, ctx.uid, ctx.gid, MODE_MASK_W)
                || !self.has_access(src_node, ctx.uid, ctx.gid, MODE_MASK_R)
            {
                return Err(FsStatus::AccessDenied);
            }
            if self.quotas.size_quota_exceeded(dst_node.uid, dst_node.gid) {
                return Err(FsStatus::QuotaExceeded);
            }
        }
        let status = self.append_chunks(ctx.ts, dst, src);
        if status != FsStatus::Ok {
            return Err(status);
        }
        self.emit_changelog(ctx.ts, &format!("APPEND({},{})", dst, src));
        Ok(())
    }

    /// Drops or fixes broken chunk references of a file.
    pub fn repair(&mut self, ctx: &FsContext, inode: u32) -> Result<RepairResult, FsStatus> {
        self.require_writable(ctx)?;
        let id = self.resolve(ctx, inode)?;
        let (goal, chunk_list) = {
            let node = self.node(id).ok_or(FsStatus::NotFound)?;
            let file = node.file().ok_or(FsStatus::NotPermitted)?;
            (node.goal, file.chunks.clone())
        };
        let mut result = RepairResult::default();
        for (index, &chunk_id) in chunk_list.iter().enumerate() {
            if chunk_id == 0 {
                continue;
            }
            if !self.chunks.exists(chunk_id) {
                if let Some(node) = self.node_mut(id) {
                    if let Some(file) = node.file_mut() {
                        file.chunks[index] = 0;
                    }
                }
                result.erased += 1;
                self.emit_changelog(ctx.ts, &format!("REPAIR({},{}):0", id, index));
            } else if let Some(version) = self.chunks.repair(goal, chunk_id) {
                result.repaired += 1;
                self.emit_changelog(ctx.ts, &format!("REPAIR({},{}):{}", id, index, version));
            } else {
                result.not_changed += 1;
            }
        }
        if result.erased > 0 || result.repaired > 0 {
            if let Some(node) = self.node_mut(id) {
                node.mtime = ctx.ts;
            }
            self.update_ctime(id, ctx.ts);
            self.update_node_checksum(id);
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // goal / trashtime / eattr
    // ------------------------------------------------------------------

    /// Per-goal file and directory counts of a subtree.
    pub fn getgoal(
        &self,
        ctx: &FsContext,
        inode: u32,
        recursive: bool,
    ) -> Result<(Vec<(u8, u32)>, Vec<(u8, u32)>), FsStatus> {
        let id = self.resolve(ctx, inode)?;
        let mut files = std::collections::BTreeMap::new();
        let mut dirs = std::collections::BTreeMap::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.node(current) {
                if node.is_file_kind() {
                    *files.entry(node.goal).or_insert(0u32) += 1;
                } else if node.is_directory() {
                    *dirs.entry(node.goal).or_insert(0u32) += 1;
                    if recursive {
                        stack.extend(node.dir().map(|d| d.children.values().copied()).into_iter().flatten());
                    }
                }
            }
        }
        Ok((files.into_iter().collect(), dirs.into_iter().collect()))
    }

    pub fn gettrashtime(
        &self,
        ctx: &FsContext,
        inode: u32,
        recursive: bool,
    ) -> Result<(Vec<(u32, u32)>, Vec<(u32, u32)>), FsStatus> {
        let id = self.resolve(ctx, inode)?;
        let mut files = std::collections::BTreeMap::new();
        let mut dirs = std::collections::BTreeMap::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.node(current) {
                if node.is_file_kind() {
                    *files.entry(node.trashtime).or_insert(0u32) += 1;
                } else if node.is_directory() {
                    *dirs.entry(node.trashtime).or_insert(0u32) += 1;
                    if recursive {
                        stack.extend(node.dir().map(|d| d.children.values().copied()).into_iter().flatten());
                    }
                }
            }
        }
        Ok((files.into_iter().collect(), dirs.into_iter().collect()))
    }

    pub fn geteattr(
        &self,
        ctx: &FsContext,
        inode: u32,
        recursive: bool,
    ) -> Result<(Vec<(u16, u32)>, Vec<(u16, u32)>), FsStatus> {
        let id = self.resolve(ctx, inode)?;
        let mut files = std::collections::BTreeMap::new();
        let mut dirs = std::collections::BTreeMap::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.node(current) {
                if node.is_directory() {
                    *dirs.entry(node.eattr()).or_insert(0u32) += 1;
                    if recursive {
                        stack.extend(node.dir().map(|d| d.children.values().copied()).into_iter().flatten());
                    }
                } else {
                    *files.entry(node.eattr()).or_insert(0u32) += 1;
                }
            }
        }
        Ok((files.into_iter().collect(), dirs.into_iter().collect()))
    }

    /// Submits a (possibly recursive) goal change as a background job.
    pub fn setgoal(
        &mut self,
        ctx: &FsContext,
        inode: u32,
        goal: u8,
        smode: u8,
        job_id: u32,
        initial_batch: u32,
    ) -> Result<FsStatus, FsStatus> {
        self.require_writable(ctx)?;
        if !(1..=40).contains(&goal) {
            return Err(FsStatus::InvalidArgument);
        }
        let id = self.resolve(ctx, inode)?;
        let stats = new_visit_stats();
        let goal_name = self.goal_name(goal).to_string();
        let task = SetGoalTask::new(vec![id], ctx.uid, goal, smode, stats);
        let status = self.submit_task(
            job_id,
            ctx.ts,
            initial_batch,
            Box::new(task),
            SetGoalTask::describe(id, &goal_name),
            None,
        );
        Ok(status)
    }

    pub fn settrashtime(
        &mut self,
        ctx: &FsContext,
        inode: u32,
        trashtime: u32,
        smode: u8,
        job_id: u32,
        initial_batch: u32,
    ) -> Result<FsStatus, FsStatus> {
        self.require_writable(ctx)?;
        let id = self.resolve(ctx, inode)?;
        let stats = new_visit_stats();
        let task = SetTrashtimeTask::new(vec![id], ctx.uid, trashtime, smode, stats);
        let status = self.submit_task(
            job_id,
            ctx.ts,
            initial_batch,
            Box::new(task),
            SetTrashtimeTask::describe(id, trashtime),
            None,
        );
        Ok(status)
    }

    /// Immediate recursive eattr change; emits one aggregated record.
    pub fn seteattr(
        &mut self,
        ctx: &FsContext,
        inode: u32,
        eattr: u16,
        smode: u8,
    ) -> Result<(u32, u32, u32), FsStatus> {
        self.require_writable(ctx)?;
        if eattr & !0x0F != 0 {
            return Err(FsStatus::InvalidArgument);
        }
        let id = self.resolve(ctx, inode)?;
        let (changed, not_changed, not_permitted) =
            self.seteattr_recursive(id, ctx.uid, eattr, smode, ctx.ts);
        if smode & SMODE_RMASK == 0 && not_permitted > 0 {
            return Err(FsStatus::NotPermitted);
        }
        self.emit_changelog(
            ctx.ts,
            &format!(
                "SETEATTR({},{},{},{}):{},{},{}",
                id, ctx.uid, eattr, smode, changed, not_changed, not_permitted
            ),
        );
        Ok((changed, not_changed, not_permitted))
    }

    pub(crate) fn seteattr_recursive(
        &mut self,
        id: u32,
        uid: u32,
        eattr: u16,
        smode: u8,
        ts: u32,
    ) -> (u32, u32, u32) {
        let mut changed = 0;
        let mut not_changed = 0;
        let mut not_permitted = 0;
        let mut stack = vec![id];
        let recursive = smode & SMODE_RMASK != 0;
        while let Some(current) = stack.pop() {
            let node = match self.node(current) {
                Some(n) => n,
                None => continue,
            };
            let is_dir = node.is_directory();
            let owner_ok = node.eattr() & EATTR_NOOWNER != 0 || uid == 0 || node.uid == uid;
            if !owner_ok {
                not_permitted += 1;
            } else {
                let old = node.eattr();
                let new = match smode & SMODE_TMASK {
                    SMODE_INCREASE => old | eattr,
                    SMODE_DECREASE => old & !eattr,
                    _ => eattr,
                };
                if new == old {
                    not_changed += 1;
                } else {
                    if let Some(n) = self.node_mut(current) {
                        n.mode = (n.mode & 0o7777) | (new << 12);
                    }
                    self.update_ctime(current, ts);
                    self.update_node_checksum(current);
                    changed += 1;
                }
            }
            if recursive && is_dir {
                if let Some(children) = self.node(current).and_then(|n| n.dir()) {
                    stack.extend(children.children.values().copied());
                }
            }
        }
        (changed, not_changed, not_permitted)
    }

    // ------------------------------------------------------------------
    // snapshot
    // ------------------------------------------------------------------

    /// Clones one node into `dst_parent`/`name`. Directories merge into an
    /// existing directory of the same name; files require `can_overwrite`.
    pub(crate) fn clone_node(
        &mut self,
        ts: u32,
        src_id: u32,
        dst_parent: u32,
        name: &[u8],
        req_inode: u32,
        can_overwrite: bool,
    ) -> Result<CloneResult, FsStatus> {
        let src_type = self.node(src_id).ok_or(FsStatus::NotFound)?.node_type;
        if self.node(dst_parent).map(|n| !n.is_directory()).unwrap_or(true) {
            return Err(FsStatus::NotDirectory);
        }
        let existing = self.lookup_child(dst_parent, name);
        let dst_id = match existing {
            Some(existing_id) => {
                let existing_is_dir =
                    self.node(existing_id).map(|n| n.is_directory()).unwrap_or(false);
                if src_type == NodeType::Directory && existing_is_dir {
                    existing_id
                } else if !can_overwrite {
                    return Err(FsStatus::AlreadyExists);
                } else if existing_is_dir || src_type == NodeType::Directory {
                    return Err(FsStatus::NotPermitted);
                } else {
                    self.unlink_node(ts, dst_parent, name, existing_id);
                    self.clone_fresh(ts, src_id, dst_parent, name, req_inode)?
                }
            }
            None => self.clone_fresh(ts, src_id, dst_parent, name, req_inode)?,
        };
        let children = if src_type == NodeType::Directory {
            self.node(src_id)
                .and_then(|n| n.dir())
                .map(|d| d.children.iter().map(|(n, &id)| (id, n.clone())).collect())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(CloneResult { dst_inode: dst_id, children })
    }

    /// Creates the copy itself: attributes, payload and chunk references.
    fn clone_fresh(
        &mut self,
        ts: u32,
        src_id: u32,
        dst_parent: u32,
        name: &[u8],
        req_inode: u32,
    ) -> Result<u32, FsStatus> {
        let src = self.node(src_id).ok_or(FsStatus::NotFound)?.clone();
        if self.quotas.inode_quota_exceeded(src.uid, src.gid) {
            return Err(FsStatus::QuotaExceeded);
        }
        let node_type = if src.node_type.is_file_kind() { NodeType::File } else { src.node_type };
        let id = self.next_inode(ts, req_inode);
        let mut node = crate::meta_lib::node::FsNode::new(id, node_type, ts);
        node.goal = src.goal;
        node.trashtime = src.trashtime;
        node.mode = src.mode;
        node.uid = src.uid;
        node.gid = src.gid;
        node.atime = src.atime;
        node.mtime = src.mtime;
        match (&src.payload, node_type) {
            (crate::meta_lib::node::Payload::File(f), NodeType::File) => {
                let mut copy = f.clone();
                copy.sessions.clear();
                for &chunk_id in &copy.chunks {
                    if chunk_id > 0 && self.chunks.add_file(chunk_id, src.goal) != FsStatus::Ok {
                        error!(
                            "structure error - chunk {:016X} not found (inode: {})",
                            chunk_id, src_id
                        );
                    }
                }
                node.payload = crate::meta_lib::node::Payload::File(copy);
            }
            (crate::meta_lib::node::Payload::Symlink(path), _) => {
                node.payload = crate::meta_lib::node::Payload::Symlink(path.clone());
            }
            (crate::meta_lib::node::Payload::Device(rdev), _) => {
                node.payload = crate::meta_lib::node::Payload::Device(*rdev);
            }
            _ => {}
        }
        self.node_count += 1;
        if node_type == NodeType::Directory {
            self.dirnode_count += 1;
        }
        if node_type == NodeType::File {
            self.filenode_count += 1;
        }
        self.quotas.register_inode(node.uid, node.gid);
        if node_type == NodeType::File {
            let size = node.stats().size as i64;
            self.quotas.update_size(node.uid, node.gid, size);
        }
        self.nodes.insert(id, node);
        self.update_node_checksum(id);
        self.link_node(ts, dst_parent, id, name);
        // the clone inherits extended attributes of the source
        let copied: Vec<(Vec<u8>, Vec<u8>)> = self
            .xattrs
            .entries()
            .filter(|(inode, _, _)| *inode == src_id)
            .map(|(_, n, v)| (n.to_vec(), v.to_vec()))
            .collect();
        for (xname, xvalue) in copied {
            self.xattr_set_internal(id, &xname, &xvalue, xattr::XATTR_SMODE_CREATE_OR_REPLACE);
        }
        Ok(id)
    }

    /// Snapshot entry point: validates, then submits the clone job.
    #[allow(clippy::too_many_arguments)]
    pub fn snapshot(
        &mut self,
        ctx: &FsContext,
        src_inode: u32,
        dst_parent: u32,
        dst_name: &[u8],
        can_overwrite: bool,
        job_id: u32,
        initial_batch: u32,
    ) -> Result<FsStatus, FsStatus> {
        self.require_writable(ctx)?;
        if name_check(dst_name) != FsStatus::Ok {
            return Err(FsStatus::InvalidArgument);
        }
        let src = self.resolve(ctx, src_inode)?;
        let dst_dir = self.resolve_dir(ctx, dst_parent)?;
        self.check_access(ctx, src, MODE_MASK_R)?;
        self.check_access(ctx, dst_dir, MODE_MASK_W | MODE_MASK_X)?;
        {
            let src_node = self.node(src).ok_or(FsStatus::NotFound)?;
            if src_node.is_directory() && (src == dst_dir || self.is_ancestor(src, dst_dir)) {
                return Err(FsStatus::InvalidArgument);
            }
        }
        if self.quotas.inode_quota_exceeded(ctx.uid, ctx.gid)
            || self.quotas.size_quota_exceeded(ctx.uid, ctx.gid)
        {
            return Err(FsStatus::QuotaExceeded);
        }
        let task = SnapshotTask::new(
            vec![(src, dst_name.to_vec())],
            dst_dir,
            0,
            can_overwrite,
            true,
            true,
        );
        let status = self.submit_task(
            job_id,
            ctx.ts,
            initial_batch,
            Box::new(task),
            SnapshotTask::describe(src, dst_name),
            None,
        );
        Ok(status)
    }

    // ------------------------------------------------------------------
    // trash and reserved
    // ------------------------------------------------------------------

    /// Detached-file listing: (inode, stored path) pairs.
    pub fn readtrash(&self, off: u32, max_entries: u32) -> Vec<(u32, Vec<u8>)> {
        self.trash
            .iter()
            .skip(off as usize)
            .take(max_entries as usize)
            .map(|(key, path)| (key.id, path.clone()))
            .collect()
    }

    pub fn readreserved(&self, off: u32, max_entries: u32) -> Vec<(u32, Vec<u8>)> {
        self.reserved
            .iter()
            .skip(off as usize)
            .take(max_entries as usize)
            .map(|(&id, path)| (id, path.clone()))
            .collect()
    }

    pub fn getdetachedattr(&self, inode: u32, dtype: u8) -> Result<Attributes, FsStatus> {
        let node = self.node(inode).ok_or(FsStatus::NotFound)?;
        match (node.node_type, dtype) {
            (NodeType::Trash, DTYPE_TRASH) | (NodeType::Reserved, DTYPE_RESERVED) => {
                Ok(node.attributes())
            }
            (NodeType::Trash, _) | (NodeType::Reserved, _) if dtype == 0 => Ok(node.attributes()),
            _ => Err(FsStatus::NotFound),
        }
    }

    pub fn gettrashpath(&self, inode: u32) -> Result<Vec<u8>, FsStatus> {
        let node = self.node(inode).ok_or(FsStatus::NotFound)?;
        if node.node_type != NodeType::Trash {
            return Err(FsStatus::NotFound);
        }
        let key = TrashKey::for_node(node);
        self.trash.get(&key).cloned().ok_or(FsStatus::NotFound)
    }

    pub fn settrashpath(&mut self, ctx: &FsContext, inode: u32, path: &[u8]) -> Result<(), FsStatus> {
        self.require_writable(ctx)?;
        if path.is_empty() || path.contains(&0) {
            return Err(FsStatus::InvalidArgument);
        }
        let key = {
            let node = self.node(inode).ok_or(FsStatus::NotFound)?;
            if node.node_type != NodeType::Trash {
                return Err(FsStatus::NotFound);
            }
            TrashKey::for_node(node)
        };
        let old_path = self.trash.get(&key).cloned().ok_or(FsStatus::NotFound)?;
        crate::meta_lib::hashfn::remove_from_checksum(
            &mut self.edges_checksum,
            edge_checksum(None, inode, &old_path),
        );
        crate::meta_lib::hashfn::add_to_checksum(
            &mut self.edges_checksum,
            edge_checksum(None, inode, path),
        );
        self.trash.insert(key, path.to_vec());
        self.emit_changelog(ctx.ts, &format!("SETPATH({},{})", inode, escape_name(path)));
        Ok(())
    }

    pub fn undel(&mut self, ctx: &FsContext, inode: u32) -> Result<(), FsStatus> {
        self.require_writable(ctx)?;
        let status = self.undel_node(ctx.ts, inode);
        if status != FsStatus::Ok {
            return Err(status);
        }
        self.emit_changelog(ctx.ts, &format!("UNDEL({})", inode));
        Ok(())
    }

    pub fn purge(&mut self, ctx: &FsContext, inode: u32) -> Result<(), FsStatus> {
        self.require_writable(ctx)?;
        {
            let node = self.node(inode).ok_or(FsStatus::NotFound)?;
            if node.node_type != NodeType::Trash {
                return Err(FsStatus::InvalidArgument);
            }
        }
        self.purge_node(ctx.ts, inode);
        self.emit_changelog(ctx.ts, &format!("PURGE({})", inode));
        Ok(())
    }

    // ------------------------------------------------------------------
    // xattr / acl / quota
    // ------------------------------------------------------------------

    pub fn getxattr(&self, ctx: &FsContext, inode: u32, name: &[u8]) -> Result<Vec<u8>, FsStatus> {
        let id = self.resolve(ctx, inode)?;
        if xattr::name_check(name) != FsStatus::Ok {
            return Err(FsStatus::InvalidArgument);
        }
        self.check_access(ctx, id, MODE_MASK_R)?;
        Ok(self.xattrs.get(id, name)?.to_vec())
    }

    pub fn listxattr(&self, ctx: &FsContext, inode: u32) -> Result<Vec<u8>, FsStatus> {
        let id = self.resolve(ctx, inode)?;
        self.check_access(ctx, id, MODE_MASK_R)?;
        Ok(self.xattrs.list(id))
    }

    pub fn setxattr(
        &mut self,
        ctx: &FsContext,
        inode: u32,
        name: &[u8],
        value: &[u8],
        mode: u8,
    ) -> Result<(), FsStatus> {
        self.require_writable(ctx)?;
        let id = self.resolve(ctx, inode)?;
        if xattr::name_check(name) != FsStatus::Ok {
            return Err(FsStatus::InvalidArgument);
        }
        self.check_access(ctx, id, MODE_MASK_W)?;
        let status = self.xattr_set_internal(id, name, value, mode);
        if status != FsStatus::Ok {
            return Err(status);
        }
        self.update_ctime(id, ctx.ts);
        self.update_node_checksum(id);
        self.emit_changelog(
            ctx.ts,
            &format!(
                "SETXATTR({},{},{},{})",
                id,
                escape_name(name),
                escape_name(value),
                mode
            ),
        );
        Ok(())
    }

    /// Applies an xattr mutation while keeping the background digest in step.
    pub(crate) fn xattr_set_internal(&mut self, inode: u32, name: &[u8], value: &[u8], mode: u8) -> FsStatus {
        let key = (inode, name.to_vec());
        let old_hash = self.xattrs.entry_hash(&key).unwrap_or(0);
        let status = self.xattrs.set(inode, name, value, mode);
        if status == FsStatus::Ok {
            let new_hash = self.xattrs.entry_hash(&key).unwrap_or(0);
            self.update_xattr_checksum(&key, old_hash, new_hash);
        }
        status
    }

    pub fn getacl(&self, ctx: &FsContext, inode: u32, acl_type: AclType) -> Result<AccessControlList, FsStatus> {
        let id = self.resolve(ctx, inode)?;
        self.acls.get(id, acl_type).cloned().ok_or(FsStatus::NotFound)
    }

    pub fn setacl(
        &mut self,
        ctx: &FsContext,
        inode: u32,
        acl_type: AclType,
        acl: AccessControlList,
    ) -> Result<(), FsStatus> {
        self.require_writable(ctx)?;
        let id = self.resolve(ctx, inode)?;
        {
            let node = self.node(id).ok_or(FsStatus::NotFound)?;
            if ctx.uid != 0 && ctx.uid != node.uid {
                return Err(FsStatus::NotPermitted);
            }
            if acl_type == AclType::Default && !node.is_directory() {
                return Err(FsStatus::NotPermitted);
            }
        }
        if acl_type == AclType::Access {
            // the file mode mirrors the ACL's owner/group/other entries
            let perms = acl.to_mode();
            if let Some(node) = self.node_mut(id) {
                node.mode = (node.mode & !0o777) | (perms & 0o777);
            }
        }
        let text = acl.to_string();
        self.acls.set(id, acl_type, acl);
        self.update_ctime(id, ctx.ts);
        self.update_node_checksum(id);
        self.emit_changelog(
            ctx.ts,
            &format!("SETACL({},{},{})", id, u8::from(acl_type) as char, text),
        );
        Ok(())
    }

    pub fn deleteacl(&mut self, ctx: &FsContext, inode: u32, acl_type: AclType) -> Result<(), FsStatus> {
        self.require_writable(ctx)?;
        let id = self.resolve(ctx, inode)?;
        {
            let node = self.node(id).ok_or(FsStatus::NotFound)?;
            if ctx.uid != 0 && ctx.uid != node.uid {
                return Err(FsStatus::NotPermitted);
            }
        }
        self.acls.remove(id, acl_type);
        self.update_ctime(id, ctx.ts);
        self.update_node_checksum(id);
        self.emit_changelog(
            ctx.ts,
            &format!("SETACL({},{},-)", id, u8::from(acl_type) as char),
        );
        Ok(())
    }

    pub fn quota_get(&self, ctx: &FsContext, owner_type: QuotaOwnerType, owner_id: u32) -> Result<QuotaEntry, FsStatus> {
        if ctx.uid != 0 {
            let owned = match owner_type {
                QuotaOwnerType::User => owner_id == ctx.uid,
                QuotaOwnerType::Group => owner_id == ctx.gid,
            };
            if !owned {
                return Err(FsStatus::NotPermitted);
            }
        }
        Ok(QuotaEntry {
            owner_type,
            owner_id,
            limits: self.quotas.get_limits(owner_type, owner_id),
            usage: self.quotas.get_usage(owner_type, owner_id),
        })
    }

    pub fn quota_get_all(&self, ctx: &FsContext) -> Result<Vec<QuotaEntry>, FsStatus> {
        if ctx.uid != 0 {
            return Err(FsStatus::NotPermitted);
        }
        Ok(self.quotas.entries())
    }

    pub fn quota_set(
        &mut self,
        ctx: &FsContext,
        owner_type: QuotaOwnerType,
        owner_id: u32,
        rigor: QuotaRigor,
        resource: QuotaResource,
        limit: u64,
    ) -> Result<(), FsStatus> {
        self.require_writable(ctx)?;
        if ctx.uid != 0 {
            return Err(FsStatus::NotPermitted);
        }
        self.quotas.set_limit(owner_type, owner_id, rigor, resource, limit);
        self.emit_changelog(
            ctx.ts,
            &format!(
                "SETQUOTA({},{},{},{},{})",
                u8::from(owner_type) as char,
                u8::from(rigor) as char,
                u8::from(resource) as char,
                owner_id,
                limit
            ),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // periodic work
    // ------------------------------------------------------------------

    /// Destroys expired trash entries; files still open become reserved.
    pub fn periodic_empty_trash(&mut self, ts: u32) -> u32 {
        let due: Vec<TrashKey> = self
            .trash
            .range(..TrashKey { deadline: ts as u64, id: 0 })
            .map(|(&key, _)| key)
            .collect();
        let mut purged = 0;
        for key in due {
            if self.node(key.id).is_none() {
                self.trash.remove(&key);
                continue;
            }
            self.purge_node(ts, key.id);
            self.emit_changelog(ts, &format!("PURGE({})", key.id));
            purged += 1;
        }
        purged
    }

    /// Clears reserved files whose sessions all vanished.
    pub fn periodic_empty_reserved(&mut self, ts: u32) -> u32 {
        let stale: Vec<u32> = self
            .reserved
            .keys()
            .copied()
            .filter(|id| {
                self.node(*id)
                    .and_then(|n| n.file())
                    .map(|f| f.sessions.is_empty())
                    .unwrap_or(true)
            })
            .collect();
        let mut purged = 0;
        for id in stale {
            self.purge_node(ts, id);
            self.emit_changelog(ts, &format!("PURGE({})", id));
            purged += 1;
        }
        purged
    }

    // ------------------------------------------------------------------
    // changelog replay
    // ------------------------------------------------------------------

    /// Applies one changelog entry on a shadow or during recovery.
    /// Entries older than the current version are skipped; a version gap
    /// means the changelog stream is unusable.
    pub fn apply_entry(&mut self, entry: &ChangelogEntry) -> FsStatus {
        if entry.version < self.metaversion {
            return FsStatus::Ok;
        }
        if entry.version > self.metaversion {
            error!(
                "changelog version gap: expected {}, got {}",
                self.metaversion, entry.version
            );
            return FsStatus::Mismatch;
        }
        let status = self.dispatch_apply(entry);
        if status != FsStatus::Ok {
            error!("applying {:?} failed: {:?}", entry.op, status);
        }
        status
    }

    fn dispatch_apply(&mut self, e: &ChangelogEntry) -> FsStatus {
        let r = match e.op.as_str() {
            "ACCESS" => self.apply_access(e),
            "ACQUIRE" => self.apply_acquire(e),
            "APPEND" => self.apply_append(e),
            "ATTR" => self.apply_attr(e),
            "CHECKSUM" => self.apply_checksum(e),
            "CLONE" => self.apply_clone(e),
            "CREATE" => self.apply_create(e),
            "EMPTYRESERVED" | "EMPTYTRASH" | "FREEINODES" => {
                // deprecated periodic records from old masters
                self.metaversion += 1;
                Ok(())
            }
            "INCVERSION" => self.apply_incversion(e),
            "LENGTH" => self.apply_length(e),
            "LINK" => self.apply_link(e),
            "MOVE" => self.apply_move(e),
            "NEXTCHUNKID" => self.apply_nextchunkid(e),
            "PURGE" => self.apply_purge(e),
            "RELEASE" => self.apply_release(e),
            "REPAIR" => self.apply_repair(e),
            "SESSION" => self.apply_session(e),
            "SETACL" => self.apply_setacl(e),
            "SETEATTR" => self.apply_seteattr(e),
            "SETGOAL" => self.apply_setgoal(e),
            "SETPATH" => self.apply_setpath(e),
            "SETQUOTA" => self.apply_setquota(e),
            "SETTRASHTIME" => self.apply_settrashtime(e),
            "SETXATTR" => self.apply_setxattr(e),
            "SYMLINK" => self.apply_symlink(e),
            "TRUNC" => self.apply_trunc(e),
            "UNDEL" => self.apply_undel(e),
            "UNLINK" => self.apply_unlink(e),
            "UNLOCK" => self.apply_unlock(e),
            "WRITE" => self.apply_write(e),
            _ => Err(FsStatus::InvalidArgument),
        };
        match r {
            Ok(()) => FsStatus::Ok,
            Err(status) => status,
        }
    }

    fn apply_access(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let node = self.node_mut(inode).ok_or(FsStatus::NotFound)?;
        node.atime = e.ts;
        self.update_node_checksum(inode);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_attr(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let mode = arg_u32(e, 1)? as u16;
        let uid = arg_u32(e, 2)?;
        let gid = arg_u32(e, 3)?;
        let atime = arg_u32(e, 4)?;
        let mtime = arg_u32(e, 5)?;
        if mode > 0o7777 {
            return Err(FsStatus::InvalidArgument);
        }
        let (old_uid, old_gid, size) = {
            let node = self.node(inode).ok_or(FsStatus::NotFound)?;
            (node.uid, node.gid, if node.is_file_kind() { node.stats().size as i64 } else { 0 })
        };
        if old_uid != uid || old_gid != gid {
            self.quotas.unregister_inode(old_uid, old_gid);
            self.quotas.update_size(old_uid, old_gid, -size);
            self.quotas.register_inode(uid, gid);
            self.quotas.update_size(uid, gid, size);
        }
        {
            let node = self.node_mut(inode).ok_or(FsStatus::NotFound)?;
            node.mode = mode | (node.mode & 0xF000);
            node.uid = uid;
            node.gid = gid;
            node.atime = atime;
            node.mtime = mtime;
        }
        self.update_ctime(inode, e.ts);
        self.update_node_checksum(inode);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_create(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let parent = arg_u32(e, 0)?;
        let name = arg_name(e, 1)?;
        let type_byte = e.args.get(2).and_then(|s| s.bytes().next()).ok_or(FsStatus::Parse)?;
        let node_type = NodeType::try_from(type_byte).map_err(|_| FsStatus::Parse)?;
        let mode = arg_u32(e, 3)? as u16;
        let uid = arg_u32(e, 4)?;
        let gid = arg_u32(e, 5)?;
        let rdev = arg_u32(e, 6)?;
        let expected = result_u32(e)?;
        if self.node(parent).map(|n| !n.is_directory()).unwrap_or(true) {
            return Err(FsStatus::NotDirectory);
        }
        if self.lookup_child(parent, &name).is_some() {
            return Err(FsStatus::AlreadyExists);
        }
        let id = self.create_node(e.ts, parent, &name, node_type, mode, 0, uid, gid, false, expected);
        // replay must not re-apply the umask: the record carries final bits
        if let Some(node) = self.node_mut(id) {
            node.mode = (mode & 0o7777) | (node.mode & 0xF000);
            if node_type.is_device() {
                node.payload = crate::meta_lib::node::Payload::Device(rdev);
            }
        }
        self.update_node_checksum(id);
        if id != expected {
            return Err(FsStatus::Mismatch);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_symlink(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let parent = arg_u32(e, 0)?;
        let name = arg_name(e, 1)?;
        let target = arg_name(e, 2)?;
        let uid = arg_u32(e, 3)?;
        let gid = arg_u32(e, 4)?;
        let expected = result_u32(e)?;
        if self.lookup_child(parent, &name).is_some() {
            return Err(FsStatus::AlreadyExists);
        }
        let id = self.create_node(e.ts, parent, &name, NodeType::Symlink, 0o777, 0, uid, gid, false, expected);
        let old_stats = self.get_stats(id);
        if let Some(node) = self.node_mut(id) {
            node.payload = crate::meta_lib::node::Payload::Symlink(target.clone());
        }
        let new_stats = self.get_stats(id);
        self.propagate_stats(id, &new_stats, &old_stats);
        self.update_node_checksum(id);
        if id != expected {
            return Err(FsStatus::Mismatch);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_unlink(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let parent = arg_u32(e, 0)?;
        let name = arg_name(e, 1)?;
        let expected = result_u32(e)?;
        let child = self.lookup_child(parent, &name).ok_or(FsStatus::NotFound)?;
        if child != expected {
            return Err(FsStatus::Mismatch);
        }
        self.unlink_node(e.ts, parent, &name, child);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_move(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let src_parent = arg_u32(e, 0)?;
        let src_name = arg_name(e, 1)?;
        let dst_parent = arg_u32(e, 2)?;
        let dst_name = arg_name(e, 3)?;
        let expected = result_u32(e)?;
        let node_id = self.lookup_child(src_parent, &src_name).ok_or(FsStatus::NotFound)?;
        if node_id != expected {
            return Err(FsStatus::Mismatch);
        }
        if let Some(existing) = self.lookup_child(dst_parent, &dst_name) {
            self.unlink_node(e.ts, dst_parent, &dst_name, existing);
        }
        self.remove_edge(e.ts, src_parent, &src_name, node_id);
        self.link_node(e.ts, dst_parent, node_id, &dst_name);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_link(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let parent = arg_u32(e, 1)?;
        let name = arg_name(e, 2)?;
        if self.node(inode).is_none() {
            return Err(FsStatus::NotFound);
        }
        if self.lookup_child(parent, &name).is_some() {
            return Err(FsStatus::AlreadyExists);
        }
        self.link_node(e.ts, parent, inode, &name);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_length(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let length = arg_u64(e, 1)?;
        {
            let node = self.node(inode).ok_or(FsStatus::NotFound)?;
            if !node.is_file_kind() {
                return Err(FsStatus::InvalidArgument);
            }
        }
        self.set_length(inode, length);
        if let Some(node) = self.node_mut(inode) {
            node.mtime = e.ts;
        }
        self.update_ctime(inode, e.ts);
        self.update_node_checksum(inode);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_trunc(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let index = arg_u32(e, 1)? as usize;
        let lock_id = arg_u32(e, 2)?;
        let expected = result_u64(e)?;
        let (goal, old_chunk) = {
            let node = self.node(inode).ok_or(FsStatus::NotFound)?;
            let file = node.file().ok_or(FsStatus::InvalidArgument)?;
            if index >= file.chunks.len() {
                return Err(FsStatus::InvalidArgument);
            }
            (node.goal, file.chunks[index])
        };
        if old_chunk == 0 {
            return Err(FsStatus::NoSuchChunk);
        }
        let new_chunk = self.chunks.apply_modification(e.ts, old_chunk, lock_id, goal, true)?;
        if new_chunk != expected {
            return Err(FsStatus::Mismatch);
        }
        if let Some(node) = self.node_mut(inode) {
            if let Some(file) = node.file_mut() {
                file.chunks[index] = new_chunk;
            }
        }
        self.update_node_checksum(inode);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_unlock(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let chunk_id = arg_u64(e, 0)?;
        let status = self.chunks.unlock(chunk_id);
        if status != FsStatus::Ok {
            return Err(status);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_write(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let index = arg_u32(e, 1)?;
        let opflag = arg_u32(e, 2)? as u8;
        let lock_id = arg_u32(e, 3)?;
        let expected = result_u64(e)?;
        if index > MAX_FILE_INDEX {
            return Err(FsStatus::IndexTooBig);
        }
        let old_stats = self.get_stats(inode);
        let (goal, uid, gid, old_chunk) = {
            let node = self.node(inode).ok_or(FsStatus::NotFound)?;
            let file = node.file().ok_or(FsStatus::InvalidArgument)?;
            (node.goal, node.uid, node.gid, file.chunks.get(index as usize).copied().unwrap_or(0))
        };
        let new_chunk = self
            .chunks
            .apply_modification(e.ts, old_chunk, lock_id, goal, opflag == 0)?;
        if new_chunk != expected {
            return Err(FsStatus::Mismatch);
        }
        {
            let node = self.node_mut(inode).ok_or(FsStatus::NotFound)?;
            node.mtime = e.ts;
            node.ctime = e.ts;
            if let Some(file) = node.file_mut() {
                if file.chunks.len() <= index as usize {
                    file.chunks.resize(chunk_table_size(index + 1) as usize, 0);
                }
                file.chunks[index as usize] = new_chunk;
            }
        }
        let new_stats = self.get_stats(inode);
        self.quotas.update_size(uid, gid, new_stats.size as i64 - old_stats.size as i64);
        self.propagate_stats(inode, &new_stats, &old_stats);
        self.update_node_checksum(inode);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_append(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let dst = arg_u32(e, 0)?;
        let src = arg_u32(e, 1)?;
        let status = self.append_chunks(e.ts, dst, src);
        if status != FsStatus::Ok {
            return Err(status);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_acquire(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let sessionid = arg_u32(e, 1)?;
        let node = self.node_mut(inode).ok_or(FsStatus::NotFound)?;
        let file = node.file_mut().ok_or(FsStatus::InvalidArgument)?;
        if file.sessions.contains(&sessionid) {
            return Err(FsStatus::InvalidArgument);
        }
        file.sessions.push(sessionid);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_release(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let sessionid = arg_u32(e, 1)?;
        let (is_reserved, became_empty) = {
            let node = self.node_mut(inode).ok_or(FsStatus::NotFound)?;
            let is_reserved = node.node_type == NodeType::Reserved;
            let file = node.file_mut().ok_or(FsStatus::InvalidArgument)?;
            match file.sessions.iter().position(|&s| s == sessionid) {
                Some(pos) => {
                    file.sessions.remove(pos);
                }
                None => return Err(FsStatus::InvalidArgument),
            }
            (is_reserved, file.sessions.is_empty())
        };
        self.metaversion += 1;
        if is_reserved && became_empty {
            self.purge_node(e.ts, inode);
        }
        Ok(())
    }

    fn apply_session(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let expected = result_u32(e)?;
        if expected != self.nextsessionid {
            return Err(FsStatus::Mismatch);
        }
        self.nextsessionid += 1;
        self.metaversion += 1;
        Ok(())
    }

    fn apply_purge(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        self.purge_node(e.ts, inode).ok_or(FsStatus::NotFound)?;
        self.metaversion += 1;
        Ok(())
    }

    fn apply_undel(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let status = self.undel_node(e.ts, inode);
        if status != FsStatus::Ok {
            return Err(status);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_setpath(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let path = arg_name(e, 1)?;
        let key = {
            let node = self.node(inode).ok_or(FsStatus::NotFound)?;
            if node.node_type != NodeType::Trash {
                return Err(FsStatus::InvalidArgument);
            }
            TrashKey::for_node(node)
        };
        let old_path = self.trash.get(&key).cloned().ok_or(FsStatus::NotFound)?;
        crate::meta_lib::hashfn::remove_from_checksum(
            &mut self.edges_checksum,
            edge_checksum(None, inode, &old_path),
        );
        crate::meta_lib::hashfn::add_to_checksum(
            &mut self.edges_checksum,
            edge_checksum(None, inode, &path),
        );
        self.trash.insert(key, path);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_setgoal(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let uid = arg_u32(e, 1)?;
        let goal = arg_u32(e, 2)? as u8;
        let smode = arg_u32(e, 3)? as u8;
        let expected = result_u32(e)? as usize;
        let result = self
            .setgoal_visit(inode, uid, goal, smode, e.ts)
            .ok_or(FsStatus::InvalidArgument)?;
        if result != expected {
            return Err(FsStatus::Mismatch);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_settrashtime(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let uid = arg_u32(e, 1)?;
        let trashtime = arg_u32(e, 2)?;
        let smode = arg_u32(e, 3)? as u8;
        let expected = result_u32(e)? as usize;
        let result = self
            .settrashtime_visit(inode, uid, trashtime, smode, e.ts)
            .ok_or(FsStatus::InvalidArgument)?;
        if result != expected {
            return Err(FsStatus::Mismatch);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_seteattr(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let uid = arg_u32(e, 1)?;
        let eattr = arg_u32(e, 2)? as u16;
        let smode = arg_u32(e, 3)? as u8;
        let expected = match &e.result {
            Some(r) => r.clone(),
            None => return Err(FsStatus::Parse),
        };
        let (changed, not_changed, not_permitted) =
            self.seteattr_recursive(inode, uid, eattr, smode, e.ts);
        if format!("{},{},{}", changed, not_changed, not_permitted) != expected {
            return Err(FsStatus::Mismatch);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_setxattr(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let name = arg_name(e, 1)?;
        let value = arg_name(e, 2)?;
        let mode = arg_u32(e, 3)? as u8;
        let status = self.xattr_set_internal(inode, &name, &value, mode);
        if status != FsStatus::Ok {
            return Err(status);
        }
        self.update_ctime(inode, e.ts);
        self.update_node_checksum(inode);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_setacl(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let type_byte = e.args.get(1).and_then(|s| s.bytes().next()).ok_or(FsStatus::Parse)?;
        let acl_type = AclType::try_from(type_byte).map_err(|_| FsStatus::Parse)?;
        let text = e.args.get(2).ok_or(FsStatus::Parse)?;
        if self.node(inode).is_none() {
            return Err(FsStatus::NotFound);
        }
        if text == "-" {
            self.acls.remove(inode, acl_type);
        } else {
            let acl = AccessControlList::parse(text).map_err(|_| FsStatus::Parse)?;
            if acl_type == AclType::Access {
                let perms = acl.to_mode();
                if let Some(node) = self.node_mut(inode) {
                    node.mode = (node.mode & !0o777) | (perms & 0o777);
                }
            }
            self.acls.set(inode, acl_type, acl);
        }
        self.update_ctime(inode, e.ts);
        self.update_node_checksum(inode);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_setquota(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let owner_type = e
            .args
            .first()
            .and_then(|s| s.bytes().next())
            .and_then(|b| QuotaOwnerType::try_from(b).ok())
            .ok_or(FsStatus::Parse)?;
        let rigor = e
            .args
            .get(1)
            .and_then(|s| s.bytes().next())
            .and_then(|b| QuotaRigor::try_from(b).ok())
            .ok_or(FsStatus::Parse)?;
        let resource = e
            .args
            .get(2)
            .and_then(|s| s.bytes().next())
            .and_then(|b| QuotaResource::try_from(b).ok())
            .ok_or(FsStatus::Parse)?;
        let owner_id = arg_u32(e, 3)?;
        let limit = arg_u64(e, 4)?;
        self.quotas.set_limit(owner_type, owner_id, rigor, resource, limit);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_clone(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let src = arg_u32(e, 0)?;
        let dst_parent = arg_u32(e, 1)?;
        let dst_inode = arg_u32(e, 2)?;
        let name = arg_name(e, 3)?;
        let can_overwrite = arg_u32(e, 4)? != 0;
        let cloned = self.clone_node(e.ts, src, dst_parent, &name, dst_inode, can_overwrite)?;
        if dst_inode != 0 && cloned.dst_inode != dst_inode {
            return Err(FsStatus::Mismatch);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_repair(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let inode = arg_u32(e, 0)?;
        let index = arg_u32(e, 1)? as usize;
        let version = result_u32(e)?;
        let chunk_id = {
            let node = self.node(inode).ok_or(FsStatus::NotFound)?;
            let file = node.file().ok_or(FsStatus::InvalidArgument)?;
            file.chunks.get(index).copied().ok_or(FsStatus::NoSuchChunk)?
        };
        if version == 0 {
            if let Some(node) = self.node_mut(inode) {
                if let Some(file) = node.file_mut() {
                    file.chunks[index] = 0;
                }
            }
            if chunk_id != 0 {
                let goal = self.nodes[&inode].goal;
                let _ = self.chunks.delete_file(chunk_id, goal);
            }
        } else {
            let status = self.chunks.set_version(chunk_id, version);
            if status != FsStatus::Ok {
                return Err(status);
            }
        }
        if let Some(node) = self.node_mut(inode) {
            node.mtime = e.ts;
        }
        self.update_ctime(inode, e.ts);
        self.update_node_checksum(inode);
        self.metaversion += 1;
        Ok(())
    }

    fn apply_nextchunkid(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let next = arg_u64(e, 0)?;
        let status = self.chunks.set_next_id(next);
        if status != FsStatus::Ok {
            return Err(status);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_incversion(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let chunk_id = arg_u64(e, 0)?;
        let status = self.chunks.increase_version(chunk_id);
        if status != FsStatus::Ok {
            return Err(status);
        }
        self.metaversion += 1;
        Ok(())
    }

    fn apply_checksum(&mut self, e: &ChangelogEntry) -> Result<(), FsStatus> {
        let expected: u64 = match &e.result {
            Some(r) => r.parse().map_err(|_| FsStatus::Parse)?,
            None => return Err(FsStatus::Parse),
        };
        if self.config.disable_checksum_verification {
            self.metaversion += 1;
            return Ok(());
        }
        // the master computed the digest before assigning this record's
        // version, so compare before moving past it
        let actual = self.checksum(ChecksumMode::GetCurrent);
        if actual != expected {
            warn!(
                "metadata checksum mismatch at version {}: master {}, local {}",
                e.version, expected, actual
            );
            return Err(FsStatus::BadMetadataChecksum);
        }
        self.metaversion += 1;
        Ok(())
    }
}

fn arg_u32(e: &ChangelogEntry, index: usize) -> Result<u32, FsStatus> {
    e.args.get(index).and_then(|s| s.parse().ok()).ok_or(FsStatus::Parse)
}

fn arg_u64(e: &ChangelogEntry, index: usize) -> Result<u64, FsStatus> {
    e.args.get(index).and_then(|s| s.parse().ok()).ok_or(FsStatus::Parse)
}

fn arg_name(e: &ChangelogEntry, index: usize) -> Result<Vec<u8>, FsStatus> {
    let raw = e.args.get(index).ok_or(FsStatus::Parse)?;
    unescape_name(raw).map_err(|_| FsStatus::Parse)
}

fn result_u32(e: &ChangelogEntry) -> Result<u32, FsStatus> {
    e.result.as_ref().and_then(|s| s.parse().ok()).ok_or(FsStatus::Parse)
}

fn result_u64(e: &ChangelogEntry) -> Result<u64, FsStatus> {
    e.result.as_ref().and_then(|s| s.parse().ok()).ok_or(FsStatus::Parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::types::Personality;
    use crate::meta_lib::Engine;

    fn master() -> Engine {
        Engine::new_in_memory(Personality::Master)
    }

    fn ctx(ts: u32) -> FsContext {
        FsContext::internal(ts)
    }

    fn user_ctx(uid: u32, gid: u32, ts: u32) -> FsContext {
        FsContext::new(ROOT_INODE, 0, uid, gid, ts)
    }

    #[test]
    fn fresh_start_single_file() {
        let mut fs = master();
        let c = ctx(100);
        let (dir, _) = fs.mkdir(&c, ROOT_INODE, b"a", 0o755, 0).unwrap();
        assert_eq!(dir, 2);
        assert_eq!(fs.info().nodes, 2);
        assert_eq!(fs.info().dirnodes, 2);

        let uc = user_ctx(1000, 1000, 101);
        let (file, attrs) = fs.mknod(&uc, dir, b"f", NodeType::File, 0o644, 0, 0).unwrap();
        assert_eq!(file, 3);
        assert_eq!(attrs.uid, 1000);
        assert_eq!(fs.info().filenodes, 1);

        let (chunk, _, opflag) = fs.write_chunk(&uc, file, 0, 1).unwrap();
        assert!(chunk > 0);
        assert_eq!(opflag, 1);
        fs.do_setlength(&uc, file, 100).unwrap();
        assert_eq!(fs.end_setlength(102, chunk), FsStatus::Ok);
        assert_eq!(fs.node(file).unwrap().file().unwrap().length, 100);

        // trashtime 0 destroys immediately
        fs.settrashtime(&uc, file, 0, SMODE_SET, 0, 10).unwrap();
        fs.unlink(&uc, dir, b"f").unwrap();
        assert!(fs.node(file).is_none());
        assert_eq!(fs.info().filenodes, 0);
        assert_eq!(fs.inode_pool.detained_count(), 1);
    }

    #[test]
    fn trash_lifecycle() {
        let mut fs = master();
        let c = ctx(1000);
        let (dir, _) = fs.mkdir(&c, ROOT_INODE, b"d", 0o755, 0).unwrap();
        let (file, _) = fs.mknod(&c, dir, b"victim", NodeType::File, 0o644, 0, 0).unwrap();
        // default trashtime is inherited (86400)
        fs.unlink(&c, dir, b"victim").unwrap();
        let node = fs.node(file).unwrap();
        assert_eq!(node.node_type, NodeType::Trash);
        assert_eq!(fs.info().trashnodes, 1);
        assert_eq!(fs.readtrash(0, 10).len(), 1);
        assert_eq!(fs.readtrash(0, 10)[0].1, b"/d/victim".to_vec());

        // not yet expired
        assert_eq!(fs.periodic_empty_trash(1000 + 86400), 0);
        // expired now
        assert_eq!(fs.periodic_empty_trash(1001 + 86400), 1);
        assert!(fs.node(file).is_none());
        assert_eq!(fs.info().trashnodes, 0);
        assert_eq!(fs.info().trashspace, 0);
    }

    #[test]
    fn trash_expiry_keeps_open_files_reserved() {
        let mut fs = master();
        let c = ctx(1000);
        let (file, _) = fs.mknod(&c, ROOT_INODE, b"f", NodeType::File, 0o644, 0, 0).unwrap();
        fs.acquire(&c, file, 7).unwrap();
        fs.unlink(&c, ROOT_INODE, b"f").unwrap();
        assert_eq!(fs.node(file).unwrap().node_type, NodeType::Trash);
        assert_eq!(fs.periodic_empty_trash(1001 + 86400), 1);
        // still open: became reserved instead of dying
        assert_eq!(fs.node(file).unwrap().node_type, NodeType::Reserved);
        assert_eq!(fs.info().reservednodes, 1);
        // last release destroys it
        fs.release(&ctx(2000), file, 7).unwrap();
        assert!(fs.node(file).is_none());
        assert_eq!(fs.info().reservednodes, 0);
    }

    #[test]
    fn sticky_rename_denied_for_third_party() {
        let mut fs = master();
        let c = ctx(10);
        let (dir, _) = fs.mkdir(&c, ROOT_INODE, b"tmp", 0o1777, 0).unwrap();
        {
            // make the sticky dir owned by uid 1000
            let uc = user_ctx(0, 0, 11);
            fs.setattr(&uc, dir, SET_UID | SET_GID, 0, 1000, 1000, 0, 0).unwrap();
        }
        let owner = user_ctx(2000, 2000, 12);
        let (file, _) = fs.mknod(&owner, dir, b"f", NodeType::File, 0o644, 0, 0).unwrap();

        let outsider = user_ctx(3000, 3000, 13);
        assert_eq!(
            fs.rename(&outsider, dir, b"f", dir, b"g").unwrap_err(),
            FsStatus::NotPermitted
        );
        // the file owner may rename inside the sticky dir
        assert_eq!(fs.rename(&owner, dir, b"f", dir, b"g").unwrap(), file);
        assert_eq!(fs.lookup_child(dir, b"g"), Some(file));
    }

    #[test]
    fn rename_replaces_files_but_not_full_dirs() {
        let mut fs = master();
        let c = ctx(10);
        let (a, _) = fs.mkdir(&c, ROOT_INODE, b"a", 0o755, 0).unwrap();
        let (b, _) = fs.mkdir(&c, ROOT_INODE, b"b", 0o755, 0).unwrap();
        fs.mknod(&c, b, b"x", NodeType::File, 0o644, 0, 0).unwrap();
        // dst dir not empty
        assert_eq!(
            fs.rename(&c, ROOT_INODE, b"a", ROOT_INODE, b"b").unwrap_err(),
            FsStatus::NotEmpty
        );
        // file over file works
        let (f1, _) = fs.mknod(&c, ROOT_INODE, b"f1", NodeType::File, 0o644, 0, 0).unwrap();
        let (f2, _) = fs.mknod(&c, ROOT_INODE, b"f2", NodeType::File, 0o644, 0, 0).unwrap();
        assert_eq!(fs.rename(&c, ROOT_INODE, b"f1", ROOT_INODE, b"f2").unwrap(), f1);
        assert!(fs.node(f2).is_none());
        // dir into own subtree is refused
        let (inner, _) = fs.mkdir(&c, a, b"inner", 0o755, 0).unwrap();
        assert_eq!(
            fs.rename(&c, ROOT_INODE, b"a", inner, b"loop").unwrap_err(),
            FsStatus::InvalidArgument
        );
    }

    #[test]
    fn nlink_tracks_subdirectories() {
        let mut fs = master();
        let c = ctx(10);
        let (dir, _) = fs.mkdir(&c, ROOT_INODE, b"d", 0o755, 0).unwrap();
        assert_eq!(fs.node(dir).unwrap().dir().unwrap().nlink, 2);
        let (s1, _) = fs.mkdir(&c, dir, b"s1", 0o755, 0).unwrap();
        fs.mkdir(&c, dir, b"s2", 0o755, 0).unwrap();
        fs.mknod(&c, dir, b"f", NodeType::File, 0o644, 0, 0).unwrap();
        assert_eq!(fs.node(dir).unwrap().dir().unwrap().nlink, 4);
        let _ = s1;
        fs.rmdir(&c, dir, b"s1").unwrap();
        assert_eq!(fs.node(dir).unwrap().dir().unwrap().nlink, 3);
    }

    #[test]
    fn dir_stats_fold_over_children() {
        let mut fs = master();
        let c = ctx(10);
        let (a, _) = fs.mkdir(&c, ROOT_INODE, b"a", 0o755, 0).unwrap();
        let (b, _) = fs.mkdir(&c, a, b"b", 0o755, 0).unwrap();
        let (f, _) = fs.mknod(&c, b, b"f", NodeType::File, 0o644, 0, 0).unwrap();
        fs.write_chunk(&c, f, 0, 1).unwrap();
        fs.do_setlength(&c, f, 1234).unwrap();

        let root_stats = fs.get_dir_stats(&c, ROOT_INODE).unwrap();
        assert_eq!(root_stats.files, 1);
        assert_eq!(root_stats.dirs, 3); // root + a + b
        assert_eq!(root_stats.length, 1234);
        let a_stats = fs.get_dir_stats(&c, a).unwrap();
        assert_eq!(a_stats.files, 1);
        assert_eq!(a_stats.dirs, 2);

        fs.unlink(&c, b, b"f").unwrap();
        let root_stats = fs.get_dir_stats(&c, ROOT_INODE).unwrap();
        assert_eq!(root_stats.files, 0);
        assert_eq!(root_stats.length, 0);
    }

    #[test]
    fn hard_links_count_all_parents() {
        let mut fs = master();
        let c = ctx(10);
        let (a, _) = fs.mkdir(&c, ROOT_INODE, b"a", 0o755, 0).unwrap();
        let (f, _) = fs.mknod(&c, ROOT_INODE, b"f", NodeType::File, 0o644, 0, 0).unwrap();
        fs.link(&c, f, a, b"hard").unwrap();
        assert_eq!(fs.node(f).unwrap().parents.len(), 2);
        // unlinking one name keeps the file alive
        fs.unlink(&c, ROOT_INODE, b"f").unwrap();
        assert_eq!(fs.node(f).unwrap().node_type, NodeType::File);
        fs.unlink(&c, a, b"hard").unwrap();
        // trashtime default: file parked in trash now
        assert_eq!(fs.node(f).unwrap().node_type, NodeType::Trash);
    }

    #[test]
    fn write_chunk_grows_table_per_policy() {
        let mut fs = master();
        let c = ctx(10);
        let (f, _) = fs.mknod(&c, ROOT_INODE, b"f", NodeType::File, 0o644, 0, 0).unwrap();
        fs.write_chunk(&c, f, 0, 1).unwrap();
        assert_eq!(fs.node(f).unwrap().file().unwrap().chunks.len(), 1);
        fs.write_chunk(&c, f, 5, 1).unwrap();
        assert_eq!(fs.node(f).unwrap().file().unwrap().chunks.len(), 6);
        fs.write_chunk(&c, f, 8, 1).unwrap();
        assert_eq!(fs.node(f).unwrap().file().unwrap().chunks.len(), 16);
        fs.write_chunk(&c, f, 70, 1).unwrap();
        assert_eq!(fs.node(f).unwrap().file().unwrap().chunks.len(), 128);
    }

    #[test]
    fn quota_blocks_create_and_setlength() {
        let mut fs = master();
        let root = ctx(10);
        fs.quota_set(&root, QuotaOwnerType::User, 1000, QuotaRigor::Hard, QuotaResource::Inodes, 2)
            .unwrap();
        let uc = user_ctx(1000, 1000, 11);
        fs.mknod(&uc, ROOT_INODE, b"f1", NodeType::File, 0o644, 0, 0).unwrap();
        let (f2, _) = fs.mknod(&uc, ROOT_INODE, b"f2", NodeType::File, 0o644, 0, 0).unwrap();
        assert_eq!(
            fs.mknod(&uc, ROOT_INODE, b"f3", NodeType::File, 0o644, 0, 0).unwrap_err(),
            FsStatus::QuotaExceeded
        );

        fs.quota_set(&root, QuotaOwnerType::User, 1000, QuotaRigor::Hard, QuotaResource::Size, 1)
            .unwrap();
        fs.write_chunk(&uc, f2, 0, 1).unwrap();
        // usage is now past the 1-byte hard limit
        let before = fs.node(f2).unwrap().file().unwrap().length;
        assert_eq!(fs.do_setlength(&uc, f2, 1 << 30).unwrap_err(), FsStatus::QuotaExceeded);
        assert_eq!(fs.node(f2).unwrap().file().unwrap().length, before);
    }

    #[test]
    fn xattr_modes_and_listing() {
        let mut fs = master();
        let c = ctx(10);
        let (f, _) = fs.mknod(&c, ROOT_INODE, b"f", NodeType::File, 0o644, 0, 0).unwrap();
        assert_eq!(
            fs.setxattr(&c, f, b"user.a", b"1", xattr::XATTR_SMODE_REPLACE_ONLY).unwrap_err(),
            FsStatus::NotFound
        );
        fs.setxattr(&c, f, b"user.a", b"1", xattr::XATTR_SMODE_CREATE_ONLY).unwrap();
        assert_eq!(
            fs.setxattr(&c, f, b"user.a", b"2", xattr::XATTR_SMODE_CREATE_ONLY).unwrap_err(),
            FsStatus::AlreadyExists
        );
        assert_eq!(fs.getxattr(&c, f, b"user.a").unwrap(), b"1");
        assert_eq!(fs.listxattr(&c, f).unwrap(), b"user.a\0".to_vec());
    }

    #[test]
    fn undel_restores_along_stored_path() {
        let mut fs = master();
        let c = ctx(10);
        let (dir, _) = fs.mkdir(&c, ROOT_INODE, b"docs", 0o755, 0).unwrap();
        let (f, _) = fs.mknod(&c, dir, b"report", NodeType::File, 0o644, 0, 0).unwrap();
        fs.unlink(&c, dir, b"report").unwrap();
        // remove the directory so undel has to recreate it
        fs.rmdir(&c, ROOT_INODE, b"docs").unwrap();
        fs.undel(&ctx(20), f).unwrap();
        let restored_dir = fs.lookup_child(ROOT_INODE, b"docs").unwrap();
        assert_eq!(fs.lookup_child(restored_dir, b"report"), Some(f));
        assert_eq!(fs.node(f).unwrap().node_type, NodeType::File);
        assert_eq!(fs.info().trashnodes, 0);
    }

    #[test]
    fn snapshot_clones_subtree() {
        let mut fs = master();
        let c = ctx(10);
        let (src, _) = fs.mkdir(&c, ROOT_INODE, b"src", 0o755, 0).unwrap();
        let (f, _) = fs.mknod(&c, src, b"data", NodeType::File, 0o644, 0, 0).unwrap();
        fs.write_chunk(&c, f, 0, 1).unwrap();
        fs.do_setlength(&c, f, 42).unwrap();
        fs.setxattr(&c, f, b"user.tag", b"v", xattr::XATTR_SMODE_CREATE_ONLY).unwrap();

        let status = fs.snapshot(&c, src, ROOT_INODE, b"copy", false, 0, 1000).unwrap();
        assert_eq!(status, FsStatus::Ok);
        let copy = fs.lookup_child(ROOT_INODE, b"copy").unwrap();
        let copy_f = fs.lookup_child(copy, b"data").unwrap();
        assert_ne!(copy_f, f);
        assert_eq!(fs.node(copy_f).unwrap().file().unwrap().length, 42);
        assert_eq!(
            fs.node(copy_f).unwrap().file().unwrap().chunks,
            fs.node(f).unwrap().file().unwrap().chunks
        );
        assert_eq!(fs.getxattr(&c, copy_f, b"user.tag").unwrap(), b"v");
        // snapshotting a dir into its own subtree is refused
        assert_eq!(
            fs.snapshot(&c, src, src, b"again", false, 1, 1000).unwrap_err(),
            FsStatus::InvalidArgument
        );
    }

    #[test]
    fn append_moves_chunks_and_length() {
        let mut fs = master();
        let c = ctx(10);
        let (dst, _) = fs.mknod(&c, ROOT_INODE, b"dst", NodeType::File, 0o644, 0, 0).unwrap();
        let (src, _) = fs.mknod(&c, ROOT_INODE, b"src", NodeType::File, 0o644, 0, 0).unwrap();
        fs.write_chunk(&c, dst, 0, 1).unwrap();
        fs.do_setlength(&c, dst, 10).unwrap();
        fs.write_chunk(&c, src, 0, 2).unwrap();
        fs.do_setlength(&c, src, 20).unwrap();
        fs.append(&c, dst, src).unwrap();
        let file = fs.node(dst).unwrap().file().unwrap().clone();
        // dst keeps its chunk rounded up to a chunk boundary plus src data
        assert_eq!(file.length, CHUNK_SIZE + 20);
        assert_eq!(file.chunk_count(), 2);
    }

    #[test]
    fn setattr_ext_sugid_clearing() {
        let mut fs = master();
        let c = ctx(10);
        let (f, _) = fs.mknod(&c, ROOT_INODE, b"f", NodeType::File, 0o755, 0, 0).unwrap();
        // give it setuid+setgid with group-exec set
        fs.setattr(&c, f, SET_MODE, 0o6775, 0, 0, 0, 0).unwrap();
        assert_eq!(fs.node(f).unwrap().mode & 0o7777, 0o6775);
        // chown clears both bits under the ext policy
        fs.setattr(&c, f, SET_UID, 0, 1000, 0, 0, 0).unwrap();
        assert_eq!(fs.node(f).unwrap().mode & 0o6000, 0);
    }

    #[test]
    fn setattr_never_mode_keeps_sugid() {
        let mut fs = master();
        fs.config.sugid_clear_mode = SugidClearMode::Never;
        let c = ctx(10);
        let (f, _) = fs.mknod(&c, ROOT_INODE, b"f", NodeType::File, 0o755, 0, 0).unwrap();
        fs.setattr(&c, f, SET_MODE, 0o6755, 0, 0, 0, 0).unwrap();
        fs.setattr(&c, f, SET_UID, 0, 1000, 0, 0, 0).unwrap();
        assert_eq!(fs.node(f).unwrap().mode & 0o6000, 0o6000);
    }

    #[test]
    fn readdir_lists_dot_entries_and_children() {
        let mut fs = master();
        let c = ctx(10);
        let (dir, _) = fs.mkdir(&c, ROOT_INODE, b"d", 0o755, 0).unwrap();
        fs.mknod(&c, dir, b"beta", NodeType::File, 0o644, 0, 0).unwrap();
        fs.mknod(&c, dir, b"alpha", NodeType::File, 0o644, 0, 0).unwrap();
        let entries = fs.readdir(&c, dir, 0, 100, false).unwrap();
        let names: Vec<&[u8]> = entries.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, vec![b".".as_ref(), b"..", b"alpha", b"beta"]);
        // cookie-based continuation
        let tail = fs.readdir(&c, dir, 3, 100, false).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].name, b"beta".to_vec());
    }

    #[test]
    fn lookup_dot_dot_resolves_parent() {
        let mut fs = master();
        let c = ctx(10);
        let (a, _) = fs.mkdir(&c, ROOT_INODE, b"a", 0o755, 0).unwrap();
        let (b, _) = fs.mkdir(&c, a, b"b", 0o755, 0).unwrap();
        assert_eq!(fs.lookup(&c, b, b"..").unwrap().0, a);
        assert_eq!(fs.lookup(&c, ROOT_INODE, b"..").unwrap().0, ROOT_INODE);
        assert_eq!(fs.lookup(&c, a, b".").unwrap().0, a);
    }

    #[test]
    fn session_root_confines_namespace() {
        let mut fs = master();
        let c = ctx(10);
        let (jail, _) = fs.mkdir(&c, ROOT_INODE, b"jail", 0o755, 0).unwrap();
        let (inside, _) = fs.mknod(&c, jail, b"in", NodeType::File, 0o644, 0, 0).unwrap();
        let (outside, _) = fs.mknod(&c, ROOT_INODE, b"out", NodeType::File, 0o644, 0, 0).unwrap();
        let jailed = FsContext { rootinode: jail, ..ctx(11) };
        assert!(fs.getattr(&jailed, inside).is_ok());
        assert_eq!(fs.getattr(&jailed, outside).unwrap_err(), FsStatus::NotPermitted);
        // inode 1 maps to the session root
        assert_eq!(fs.getattr(&jailed, ROOT_INODE).unwrap().inode, jail);
    }

    #[test]
    fn replay_reproduces_master_state() {
        let mut master_fs = master();
        let c = ctx(100);
        let (dir, _) = master_fs.mkdir(&c, ROOT_INODE, b"a", 0o755, 0).unwrap();
        let uc = user_ctx(1000, 1000, 101);
        let (f, _) = master_fs.mknod(&uc, dir, b"f", NodeType::File, 0o644, 0, 0).unwrap();
        master_fs.write_chunk(&uc, f, 0, 1).unwrap();
        master_fs.do_setlength(&uc, f, 5000).unwrap();
        master_fs.symlink(&uc, dir, b"l", b"../target").unwrap();
        master_fs.setxattr(&uc, f, b"user.k", b"v", xattr::XATTR_SMODE_CREATE_ONLY).unwrap();
        master_fs.rename(&uc, dir, b"f", ROOT_INODE, b"moved").unwrap();
        master_fs.unlink(&uc, ROOT_INODE, b"moved").unwrap();

        let mut shadow = Engine::new_in_memory(Personality::Shadow);
        for (_, line) in master_fs.changelog.drain_pending() {
            let entry = ChangelogEntry::parse(&line).unwrap();
            assert_eq!(shadow.apply_entry(&entry), FsStatus::Ok, "line {}", line);
        }
        assert_eq!(shadow.metaversion(), master_fs.metaversion());
        assert_eq!(
            shadow.checksum(ChecksumMode::ForceRecalculate),
            master_fs.checksum(ChecksumMode::ForceRecalculate)
        );
    }

    #[test]
    fn replay_skips_old_and_rejects_gaps() {
        let mut master_fs = master();
        let c = ctx(100);
        master_fs.mkdir(&c, ROOT_INODE, b"a", 0o755, 0).unwrap();
        master_fs.mkdir(&c, ROOT_INODE, b"b", 0o755, 0).unwrap();
        let lines: Vec<String> =
            master_fs.changelog.drain_pending().into_iter().map(|(_, l)| l).collect();

        let mut shadow = Engine::new_in_memory(Personality::Shadow);
        let first = ChangelogEntry::parse(&lines[0]).unwrap();
        assert_eq!(shadow.apply_entry(&first), FsStatus::Ok);
        // replaying the same record again is a no-op
        assert_eq!(shadow.apply_entry(&first), FsStatus::Ok);
        assert_eq!(shadow.metaversion(), 1);
        // skipping a version is a hard error
        let mut gapped = ChangelogEntry::parse(&lines[1]).unwrap();
        gapped.version += 5;
        assert_eq!(shadow.apply_entry(&gapped), FsStatus::Mismatch);
    }

    #[test]
    fn checksum_records_are_emitted_periodically() {
        let mut fs = master();
        fs.config.checksum_interval = 5;
        let c = ctx(100);
        for i in 0..10 {
            let name = format!("d{}", i);
            fs.mkdir(&c, ROOT_INODE, name.as_bytes(), 0o755, 0).unwrap();
        }
        let lines: Vec<String> = fs.changelog.drain_pending().into_iter().map(|(_, l)| l).collect();
        assert!(lines.iter().any(|l| l.contains("|CHECKSUM(")));

        // a shadow replaying the stream passes the digest checks
        let mut shadow = Engine::new_in_memory(Personality::Shadow);
        shadow.config.checksum_interval = 5;
        for line in &lines {
            let entry = ChangelogEntry::parse(line).unwrap();
            assert_eq!(shadow.apply_entry(&entry), FsStatus::Ok, "line {}", line);
        }
    }

    #[test]
    fn seteattr_recursive_counts() {
        let mut fs = master();
        let c = ctx(10);
        let (dir, _) = fs.mkdir(&c, ROOT_INODE, b"d", 0o755, 0).unwrap();
        fs.mknod(&c, dir, b"f1", NodeType::File, 0o644, 0, 0).unwrap();
        fs.mknod(&c, dir, b"f2", NodeType::File, 0o644, 0, 0).unwrap();
        let (changed, not_changed, not_permitted) = fs
            .seteattr(&c, dir, EATTR_NOOWNER, SMODE_SET | SMODE_RMASK)
            .unwrap();
        assert_eq!((changed, not_changed, not_permitted), (3, 0, 0));
        assert_eq!(fs.node(dir).unwrap().eattr(), EATTR_NOOWNER);
    }

    #[test]
    fn acl_overrides_classic_triad() {
        let mut fs = master();
        let c = ctx(10);
        let (f, _) = fs.mknod(&c, ROOT_INODE, b"f", NodeType::File, 0o600, 0, 0).unwrap();
        let outsider = user_ctx(2000, 2000, 11);
        assert_eq!(fs.access(&outsider, f, MODE_MASK_R).unwrap_err(), FsStatus::AccessDenied);
        let mut acl = AccessControlList::from_mode(0o600);
        acl.named_users.insert(2000, 4);
        acl.mask = Some(7);
        fs.setacl(&c, f, AclType::Access, acl).unwrap();
        assert!(fs.access(&outsider, f, MODE_MASK_R).is_ok());
        assert_eq!(fs.access(&outsider, f, MODE_MASK_W).unwrap_err(), FsStatus::AccessDenied);
    }

    #[test]
    fn repair_erases_missing_chunks() {
        let mut fs = master();
        let c = ctx(10);
        let (f, _) = fs.mknod(&c, ROOT_INODE, b"f", NodeType::File, 0o644, 0, 0).unwrap();
        let (chunk, _, _) = fs.write_chunk(&c, f, 0, 1).unwrap();
        fs.end_setlength(11, chunk);
        // break the reference behind the engine's back
        fs.chunks.delete_file(chunk, 1);
        let result = fs.repair(&c, f).unwrap();
        assert_eq!(result.erased, 1);
        assert_eq!(fs.node(f).unwrap().file().unwrap().chunks[0], 0);
    }
}
