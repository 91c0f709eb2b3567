//! A shadow replaying the master's changelog must end up byte-identical,
//! as witnessed by the force-recalculated digest.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use metafs::changelog::ChangelogEntry;
use metafs::types::{ChecksumMode, FsContext, FsStatus, NodeType, Personality, ROOT_INODE, SMODE_SET};
use metafs::xattr::XATTR_SMODE_CREATE_OR_REPLACE;
use metafs::Engine;

fn drain_and_apply(master: &mut Engine, shadow: &mut Engine) {
    for (_, line) in master.changelog.drain_pending() {
        let entry = ChangelogEntry::parse(&line).expect(&line);
        let status = shadow.apply_entry(&entry);
        assert_eq!(status, FsStatus::Ok, "applying {:?}", line);
    }
}

fn assert_in_sync(master: &mut Engine, shadow: &mut Engine) {
    assert_eq!(shadow.metaversion(), master.metaversion());
    assert_eq!(shadow.info(), master.info());
    assert_eq!(
        shadow.checksum(ChecksumMode::ForceRecalculate),
        master.checksum(ChecksumMode::ForceRecalculate)
    );
}

#[test]
fn mixed_workload_replays_identically() {
    let mut master = Engine::new_in_memory(Personality::Master);
    let mut shadow = Engine::new_in_memory(Personality::Shadow);
    let c = FsContext::internal(1000);

    let (docs, _) = master.mkdir(&c, ROOT_INODE, b"docs", 0o755, 0o022).unwrap();
    let (work, _) = master.mkdir(&c, ROOT_INODE, b"work", 0o750, 0o022).unwrap();
    let (report, _) = master.mknod(&c, docs, b"report", NodeType::File, 0o644, 0o022, 0).unwrap();
    master.symlink(&c, work, b"latest", b"../docs/report").unwrap();
    master.mknod(&c, work, b"tty", NodeType::CharDev, 0o600, 0, 0x0501).unwrap();

    let (chunk, _, _) = master.write_chunk(&c, report, 0, 1).unwrap();
    master.do_setlength(&c, report, 9000).unwrap();
    master.end_setlength(1001, chunk);
    master.setxattr(&c, report, b"user.lang", b"en", XATTR_SMODE_CREATE_OR_REPLACE).unwrap();
    master.link(&c, report, work, b"report-link").unwrap();
    master.rename(&c, docs, b"report", docs, b"report-v2").unwrap();

    let session = master.new_session(1002);
    master.acquire(&c, report, session).unwrap();
    master.unlink(&c, docs, b"report-v2").unwrap();
    master.unlink(&c, work, b"report-link").unwrap();
    // file is open, so it parks in trash keyed by its trashtime
    master.settrashpath(&c, report, b"recovered/report").unwrap();
    drain_and_apply(&mut master, &mut shadow);
    assert_in_sync(&mut master, &mut shadow);

    // expiry converts the open file to reserved, release destroys it
    let expiry = 1000 + 86400 + 10;
    master.periodic_empty_trash(expiry);
    master.release(&FsContext::internal(expiry), report, session).unwrap();
    drain_and_apply(&mut master, &mut shadow);
    assert_in_sync(&mut master, &mut shadow);
}

#[test]
fn snapshot_and_recursive_jobs_replay_identically() {
    let mut master = Engine::new_in_memory(Personality::Master);
    let mut shadow = Engine::new_in_memory(Personality::Shadow);
    let c = FsContext::internal(2000);

    let (tree, _) = master.mkdir(&c, ROOT_INODE, b"tree", 0o755, 0).unwrap();
    let (sub, _) = master.mkdir(&c, tree, b"sub", 0o755, 0).unwrap();
    for (dir, name) in [(tree, "a"), (tree, "b"), (sub, "c")] {
        let (f, _) = master.mknod(&c, dir, name.as_bytes(), NodeType::File, 0o644, 0, 0).unwrap();
        let (chunk, _, _) = master.write_chunk(&c, f, 0, 1).unwrap();
        master.do_setlength(&c, f, 100).unwrap();
        master.end_setlength(2001, chunk);
    }

    let status = master.snapshot(&c, tree, ROOT_INODE, b"backup", false, 0, 1000).unwrap();
    assert_eq!(status, FsStatus::Ok);
    let status = master.setgoal(&c, tree, 3, SMODE_SET | metafs::types::SMODE_RMASK, 1, 1000).unwrap();
    assert_eq!(status, FsStatus::Ok);
    let status = master
        .settrashtime(&c, tree, 3600, SMODE_SET | metafs::types::SMODE_RMASK, 2, 1000)
        .unwrap();
    assert_eq!(status, FsStatus::Ok);
    master.seteattr(&c, tree, metafs::types::EATTR_NOOWNER, SMODE_SET | metafs::types::SMODE_RMASK)
        .unwrap();

    drain_and_apply(&mut master, &mut shadow);
    assert_in_sync(&mut master, &mut shadow);
    // spot check: the clone exists on the shadow with the same chunks
    let backup = shadow.lookup_child(ROOT_INODE, b"backup").unwrap();
    let a = shadow.lookup_child(backup, b"a").unwrap();
    assert_eq!(shadow.node(a).unwrap().file().unwrap().length, 100);
}

#[test]
fn randomized_workloads_replay_identically() {
    for seed in [7u64, 40, 1234] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut master = Engine::new_in_memory(Personality::Master);
        master.config.checksum_interval = 20;
        let mut shadow = Engine::new_in_memory(Personality::Shadow);
        shadow.config.checksum_interval = 20;

        let mut dirs = vec![ROOT_INODE];
        let mut files: Vec<(u32, u32)> = Vec::new(); // (parent, inode)
        let mut counter = 0u32;

        for step in 0..400 {
            let ts = 3000 + step;
            let c = FsContext::internal(ts);
            counter += 1;
            match rng.gen_range(0..10) {
                0 => {
                    let parent = dirs[rng.gen_range(0..dirs.len())];
                    let name = format!("d{}", counter);
                    if let Ok((id, _)) = master.mkdir(&c, parent, name.as_bytes(), 0o755, 0) {
                        dirs.push(id);
                    }
                }
                1 | 2 => {
                    let parent = dirs[rng.gen_range(0..dirs.len())];
                    let name = format!("f{}", counter);
                    if let Ok((id, _)) =
                        master.mknod(&c, parent, name.as_bytes(), NodeType::File, 0o644, 0, 0)
                    {
                        files.push((parent, id));
                    }
                }
                3 | 4 => {
                    if !files.is_empty() {
                        let (_, id) = files[rng.gen_range(0..files.len())];
                        let index = rng.gen_range(0..4);
                        if let Ok((chunk, _, _)) = master.write_chunk(&c, id, index, 1) {
                            master.end_setlength(ts, chunk);
                        }
                    }
                }
                5 => {
                    if !files.is_empty() {
                        let (_, id) = files[rng.gen_range(0..files.len())];
                        let length = rng.gen_range(0..200_000_000u64);
                        let _ = master.do_setlength(&c, id, length);
                    }
                }
                6 => {
                    if !files.is_empty() {
                        let pos = rng.gen_range(0..files.len());
                        let (parent, id) = files[pos];
                        // unlink by looking the name up again
                        let name = master
                            .readdir(&c, parent, 2, 10_000, false)
                            .ok()
                            .and_then(|entries| {
                                entries.into_iter().find(|e| e.inode == id).map(|e| e.name)
                            });
                        if let Some(name) = name {
                            if master.unlink(&c, parent, &name).is_ok() {
                                files.remove(pos);
                            }
                        }
                    }
                }
                7 => {
                    if !files.is_empty() {
                        let (_, id) = files[rng.gen_range(0..files.len())];
                        let name = format!("x{}", counter);
                        let _ = master.setxattr(
                            &c,
                            id,
                            format!("user.{}", name).as_bytes(),
                            name.as_bytes(),
                            XATTR_SMODE_CREATE_OR_REPLACE,
                        );
                    }
                }
                8 => {
                    if !files.is_empty() {
                        let (_, id) = files[rng.gen_range(0..files.len())];
                        let target = dirs[rng.gen_range(0..dirs.len())];
                        let _ = master.link(&c, id, target, format!("l{}", counter).as_bytes());
                    }
                }
                _ => {
                    let _ = master.periodic_empty_trash(ts);
                }
            }
        }

        drain_and_apply(&mut master, &mut shadow);
        assert_in_sync(&mut master, &mut shadow);
    }
}

#[test]
fn shadow_resync_from_image_midstream() {
    let mut master = Engine::new_in_memory(Personality::Master);
    let c = FsContext::internal(4000);
    let (dir, _) = master.mkdir(&c, ROOT_INODE, b"data", 0o755, 0).unwrap();
    for i in 0..5 {
        master.mknod(&c, dir, format!("f{}", i).as_bytes(), NodeType::File, 0o644, 0, 0).unwrap();
    }
    let early_lines: Vec<(u64, String)> = master.changelog.drain_pending();

    // shadow joins late: it downloads the image instead of the old records
    let mut image = Vec::new();
    master.store_image(&mut image).unwrap();
    let mut shadow = Engine::new_in_memory(Personality::Shadow);
    shadow.load_image(&mut image.as_slice(), false).unwrap();

    // stale records are skipped, fresh ones apply
    for (_, line) in early_lines {
        let entry = ChangelogEntry::parse(&line).unwrap();
        assert_eq!(shadow.apply_entry(&entry), FsStatus::Ok);
    }
    master.mknod(&c, dir, b"late", NodeType::File, 0o644, 0, 0).unwrap();
    for (_, line) in master.changelog.drain_pending() {
        let entry = ChangelogEntry::parse(&line).unwrap();
        assert_eq!(shadow.apply_entry(&entry), FsStatus::Ok);
    }
    assert_eq!(shadow.metaversion(), master.metaversion());
    assert_eq!(
        shadow.checksum(ChecksumMode::ForceRecalculate),
        master.checksum(ChecksumMode::ForceRecalculate)
    );
}
