/// Image dump lifecycle: background dump process, backup rotation,
/// the data-directory lockfile and emergency fallback stores.
///
/// A background dump forks a child that inherits a copy-on-write snapshot
/// of the whole engine, writes `metadata.mfs.tmp` and exits. The parent
/// keeps serving and promotes the file on the child's success. Only one
/// dump may run at a time.
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use fork::{fork, Fork};
use log::*;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use retry::delay::Fixed;
use retry::retry;

use crate::meta_lib::types::FsStatus;
use crate::meta_lib::Engine;

pub const METADATA_FILENAME: &str = "metadata.mfs";
pub const METADATA_TMP_FILENAME: &str = "metadata.mfs.tmp";
pub const METADATA_EMERGENCY_FILENAME: &str = "metadata.mfs.emergency";
pub const LOCK_FILENAME: &str = "metadata.mfs.lock";
const QUICK_STOP_PREFIX: &str = "quick_stop: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    /// Fork a child; the parent keeps serving.
    Background,
    /// Write synchronously; used at shutdown.
    Foreground,
}

/// What the lockfile said at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No lock was present.
    Clean,
    /// Previous instance requested a quick stop at this version;
    /// changelogs past it must be replayed.
    QuickStop(u64),
    /// A stale lock was swallowed because auto-recovery is enabled.
    Recovered,
}

pub struct MetadataDumper {
    data_path: PathBuf,
    keep_previous: u32,
    disabled: bool,
    child: Option<Pid>,
}

impl MetadataDumper {
    pub fn new(data_path: &Path, keep_previous: u32, disabled: bool) -> Self {
        if disabled {
            warn!("metadata dumps are disabled by configuration");
        }
        MetadataDumper {
            data_path: data_path.to_path_buf(),
            keep_previous: keep_previous.max(1),
            disabled,
            child: None,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.child.is_some()
    }

    fn metadata_path(&self) -> PathBuf {
        self.data_path.join(METADATA_FILENAME)
    }

    fn tmp_path(&self) -> PathBuf {
        self.data_path.join(METADATA_TMP_FILENAME)
    }

    /// Promotes metadata.mfs.tmp, rotating older copies away.
    fn commit(&self) -> Result<()> {
        let last = self.data_path.join(format!("{}.{}", METADATA_FILENAME, self.keep_previous));
        if last.exists() {
            fs::remove_file(&last).with_context(|| format!("removing {}", last.display()))?;
        }
        for n in (1..self.keep_previous).rev() {
            let from = self.data_path.join(format!("{}.{}", METADATA_FILENAME, n));
            let to = self.data_path.join(format!("{}.{}", METADATA_FILENAME, n + 1));
            if from.exists() {
                fs::rename(&from, &to)
                    .with_context(|| format!("rotating {} -> {}", from.display(), to.display()))?;
            }
        }
        let current = self.metadata_path();
        if current.exists() {
            let backup = self.data_path.join(format!("{}.1", METADATA_FILENAME));
            fs::rename(&current, &backup)
                .with_context(|| format!("rotating {} -> {}", current.display(), backup.display()))?;
        }
        fs::rename(self.tmp_path(), &current)
            .with_context(|| format!("promoting {}", current.display()))?;
        info!("metadata image committed at {}", Utc::now().to_rfc3339());
        Ok(())
    }

    /// Checks whether the background child finished and promotes its work.
    /// Call this from the event loop tick.
    pub fn poll(&mut self) -> Result<()> {
        let pid = match self.child {
            Some(pid) => pid,
            None => return Ok(()),
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(()),
            Ok(WaitStatus::Exited(_, 0)) => {
                self.child = None;
                self.commit()
            }
            Ok(status) => {
                self.child = None;
                bail!("background dump child failed: {:?}", status);
            }
            Err(e) => {
                self.child = None;
                bail!("waiting for dump child: {}", e);
            }
        }
    }
}

fn dump_to_tmp(engine: &Engine, tmp: &Path) -> Result<()> {
    let file = File::create(tmp).with_context(|| format!("creating {}", tmp.display()))?;
    let mut writer = BufWriter::new(file);
    engine.store_image(&mut writer)?;
    writer.flush().context("flushing image")?;
    Ok(())
}

impl Engine {
    /// Writes a full image. Rotates the changelog first so records made
    /// after the snapshot land in a fresh file.
    pub fn store_all(&mut self, dumper: &mut MetadataDumper, kind: DumpKind) -> Result<FsStatus> {
        if dumper.disabled {
            debug!("metadata dump skipped: dumps disabled");
            return Ok(FsStatus::Ok);
        }
        if dumper.in_progress() {
            return Ok(FsStatus::TempNotPossible);
        }
        self.changelog.rotate()?;
        let tmp = dumper.tmp_path();
        match kind {
            DumpKind::Foreground => {
                if let Err(e) = dump_to_tmp(self, &tmp) {
                    error!("foreground dump failed: {:#}", e);
                    self.emergency_store()?;
                    return Ok(FsStatus::IoError);
                }
                dumper.commit()?;
                Ok(FsStatus::Ok)
            }
            DumpKind::Background => match fork() {
                Ok(Fork::Parent(child)) => {
                    debug!("background dump child running at pid {}", child);
                    dumper.child = Some(Pid::from_raw(child));
                    Ok(FsStatus::Ok)
                }
                Ok(Fork::Child) => {
                    // copy-on-write snapshot of the whole engine
                    let code = match dump_to_tmp(self, &tmp) {
                        Ok(()) => 0,
                        Err(e) => {
                            error!("background dump failed: {:#}", e);
                            1
                        }
                    };
                    std::process::exit(code);
                }
                Err(e) => {
                    warn!("cannot fork for background dump ({}), dumping in foreground", e);
                    dump_to_tmp(self, &tmp)?;
                    dumper.commit()?;
                    Ok(FsStatus::Ok)
                }
            },
        }
    }

    /// Last-resort image writes to a ranked list of fallback directories.
    pub fn emergency_store(&self) -> Result<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(home) = std::env::var("HOME") {
            candidates.push(PathBuf::from(home));
        }
        candidates.push(std::env::temp_dir());
        candidates.push(PathBuf::from("/var/tmp"));
        for dir in candidates {
            let target = dir.join(METADATA_EMERGENCY_FILENAME);
            let attempt = retry(Fixed::from_millis(200).take(2), || dump_to_tmp(self, &target));
            match attempt {
                Ok(()) => {
                    warn!("emergency metadata image written to {}", target.display());
                    return Ok(target);
                }
                Err(e) => {
                    warn!("emergency store to {} failed: {}", target.display(), e);
                }
            }
        }
        bail!("impossible to write the emergency metadata image anywhere");
    }
}

/// Takes the data-directory lock. Refuses to start over a live lock
/// unless auto-recovery is configured.
pub fn acquire_lock(data_path: &Path, auto_recovery: bool) -> Result<LockState> {
    let lock_path = data_path.join(LOCK_FILENAME);
    let mut state = LockState::Clean;
    if lock_path.exists() {
        let mut content = String::new();
        File::open(&lock_path)
            .and_then(|mut f| f.read_to_string(&mut content))
            .with_context(|| format!("reading {}", lock_path.display()))?;
        let content = content.trim();
        if let Some(version) = content.strip_prefix(QUICK_STOP_PREFIX) {
            let version: u64 = version
                .parse()
                .with_context(|| format!("bad quick-stop sentinel {:?}", content))?;
            info!("previous instance quick-stopped at version {}", version);
            state = LockState::QuickStop(version);
        } else if auto_recovery {
            warn!("stale lock {} (pid {}), swallowing for auto-recovery", lock_path.display(), content);
            state = LockState::Recovered;
        } else {
            bail!(
                "data directory is locked by pid {}; remove {} or enable AUTO_RECOVERY",
                content,
                lock_path.display()
            );
        }
        fs::remove_file(&lock_path).with_context(|| format!("removing {}", lock_path.display()))?;
    }
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
        .with_context(|| format!("creating {}", lock_path.display()))?;
    write!(file, "{}", std::process::id()).context("writing lockfile")?;
    Ok(state)
}

/// Removes the lock at clean shutdown.
pub fn release_lock(data_path: &Path) -> Result<()> {
    let lock_path = data_path.join(LOCK_FILENAME);
    fs::remove_file(&lock_path).with_context(|| format!("removing {}", lock_path.display()))
}

/// Replaces the lock with a quick-stop sentinel: the next start must
/// replay changelogs past `version` instead of trusting the last image.
pub fn write_quick_stop(data_path: &Path, version: u64) -> Result<()> {
    let lock_path = data_path.join(LOCK_FILENAME);
    let mut file = File::create(&lock_path).with_context(|| format!("creating {}", lock_path.display()))?;
    writeln!(file, "{}{}", QUICK_STOP_PREFIX, version).context("writing quick-stop sentinel")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta_lib::types::{ChecksumMode, FsContext, NodeType, Personality, ROOT_INODE};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("metafs-dumper-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn engine_with_files(count: u32) -> Engine {
        let mut fs = Engine::new_in_memory(Personality::Master);
        let c = FsContext::internal(50);
        for i in 0..count {
            let name = format!("file{}", i);
            fs.mknod(&c, ROOT_INODE, name.as_bytes(), NodeType::File, 0o644, 0, 0).unwrap();
        }
        fs
    }

    #[test]
    fn foreground_dump_and_rotation() {
        let dir = temp_dir("fg");
        let mut fs = engine_with_files(3);
        let mut dumper = MetadataDumper::new(&dir, 2, false);
        assert_eq!(fs.store_all(&mut dumper, DumpKind::Foreground).unwrap(), FsStatus::Ok);
        assert!(dir.join(METADATA_FILENAME).exists());

        let c = FsContext::internal(60);
        fs.mknod(&c, ROOT_INODE, b"later", NodeType::File, 0o644, 0, 0).unwrap();
        assert_eq!(fs.store_all(&mut dumper, DumpKind::Foreground).unwrap(), FsStatus::Ok);
        assert!(dir.join("metadata.mfs.1").exists());
        assert_eq!(fs.store_all(&mut dumper, DumpKind::Foreground).unwrap(), FsStatus::Ok);
        assert!(dir.join("metadata.mfs.2").exists());
        // keep_previous = 2 caps the chain
        assert!(!dir.join("metadata.mfs.3").exists());

        // the latest image loads back with the same digest
        let mut restored = Engine::new_in_memory(Personality::Master);
        let mut file = File::open(dir.join(METADATA_FILENAME)).unwrap();
        restored.load_image(&mut file, false).unwrap();
        assert_eq!(
            restored.checksum(ChecksumMode::ForceRecalculate),
            fs.checksum(ChecksumMode::ForceRecalculate)
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn disabled_dumper_writes_nothing() {
        let dir = temp_dir("off");
        let mut fs = engine_with_files(1);
        let mut dumper = MetadataDumper::new(&dir, 1, true);
        assert_eq!(fs.store_all(&mut dumper, DumpKind::Foreground).unwrap(), FsStatus::Ok);
        assert!(!dir.join(METADATA_FILENAME).exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn lockfile_guards_the_data_directory() {
        let dir = temp_dir("lock");
        assert_eq!(acquire_lock(&dir, false).unwrap(), LockState::Clean);
        // a second instance must refuse
        assert!(acquire_lock(&dir, false).is_err());
        // but auto-recovery swallows the stale lock
        assert_eq!(acquire_lock(&dir, true).unwrap(), LockState::Recovered);
        release_lock(&dir).unwrap();
        assert!(!dir.join(LOCK_FILENAME).exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn quick_stop_sentinel_roundtrip() {
        let dir = temp_dir("qs");
        write_quick_stop(&dir, 12345).unwrap();
        assert_eq!(acquire_lock(&dir, false).unwrap(), LockState::QuickStop(12345));
        release_lock(&dir).unwrap();
        fs::remove_dir_all(&dir).unwrap();
    }
}
