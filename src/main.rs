use std::env::set_var;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::{arg, command, ArgAction};
use fork::{fork, Fork};
use log::*;
use nix::sys::signal;

use metafs::changelog::{read_changelog, CHANGELOG_FILENAME};
use metafs::chunks::InMemoryChunks;
use metafs::config::EngineConfig;
use metafs::dumper::{
    acquire_lock, release_lock, write_quick_stop, DumpKind, LockState, MetadataDumper,
    METADATA_FILENAME,
};
use metafs::types::{FsStatus, Personality};
use metafs::Engine;

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_: i32) {
    TERMINATE.store(true, Ordering::SeqCst);
}

fn main_time() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

fn install_signal_handlers() {
    let action = signal::SigAction::new(
        signal::SigHandler::Handler(signal_handler),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    for sig in [signal::SIGINT, signal::SIGTERM] {
        unsafe {
            if let Err(e) = signal::sigaction(sig, &action) {
                warn!("cannot install handler for {:?}: {}", sig, e);
            }
        }
    }
}

/// Replays every changelog file found in the data directory, oldest first.
fn replay_changelogs(engine: &mut Engine, data_path: &Path) -> Result<()> {
    let files = [
        data_path.join(format!("{}.2", CHANGELOG_FILENAME)),
        data_path.join(format!("{}.1", CHANGELOG_FILENAME)),
        data_path.join(CHANGELOG_FILENAME),
    ];
    for path in files {
        if !path.exists() {
            continue;
        }
        info!("replaying {}", path.display());
        let entries = read_changelog(&path)?;
        for entry in entries {
            let status = engine.apply_entry(&entry);
            if status != FsStatus::Ok {
                bail!(
                    "replay of {} stopped at version {}: {:?}",
                    path.display(),
                    entry.version,
                    status
                );
            }
        }
    }
    info!("replay done, metadata version {}", engine.metaversion());
    Ok(())
}

fn load_or_create(engine: &mut Engine, data_path: &Path, ignore_unknown: bool) -> Result<()> {
    let image = data_path.join(METADATA_FILENAME);
    if image.exists() {
        let mut file = std::fs::File::open(&image)
            .with_context(|| format!("opening {}", image.display()))?;
        engine.load_image(&mut file, ignore_unknown)?;
    } else {
        info!("no metadata image in {}, starting with an empty filesystem", data_path.display());
    }
    replay_changelogs(engine, data_path)
}

fn run_master(mut engine: Engine, data_path: PathBuf) -> Result<()> {
    let mut dumper = MetadataDumper::new(
        &data_path,
        engine.config.back_meta_keep_previous,
        engine.config.magic_disable_metadata_dumps,
    );
    let empty_trash_period = engine.config.empty_trash_period.max(1);
    let empty_reserved_period = engine.config.empty_reserved_period.max(1);
    let task_batch = engine.config.task_batch_size;
    let dump_period = 3600;

    let mut last_trash_sweep = main_time();
    let mut last_reserved_sweep = main_time();
    let mut last_dump = main_time();

    info!("master event loop running");
    while !TERMINATE.load(Ordering::SeqCst) {
        let ts = main_time();

        if let Err(e) = dumper.poll() {
            error!("background dump failed: {:#}", e);
            if let Err(e) = engine.emergency_store() {
                error!("{:#}", e);
            }
        }
        if engine.tasks_available() {
            engine.process_jobs(ts, task_batch);
        }
        if engine.checksum_recalculation_in_progress() {
            engine.background_checksum_step();
        }
        if ts.saturating_sub(last_trash_sweep) >= empty_trash_period {
            last_trash_sweep = ts;
            let purged = engine.periodic_empty_trash(ts);
            if purged > 0 {
                debug!("trash sweep purged {} files", purged);
            }
        }
        if ts.saturating_sub(last_reserved_sweep) >= empty_reserved_period {
            last_reserved_sweep = ts;
            engine.periodic_empty_reserved(ts);
        }
        if ts.saturating_sub(last_dump) >= dump_period {
            last_dump = ts;
            match engine.store_all(&mut dumper, DumpKind::Background) {
                Ok(FsStatus::TempNotPossible) => warn!("dump already in progress"),
                Ok(_) => {}
                Err(e) => error!("cannot start background dump: {:#}", e),
            }
        }
        engine.changelog.flush().ok();
        // metalogger broadcast would drain here; without peers the buffered
        // lines are dropped once written to disk
        engine.changelog.drain_pending();

        std::thread::sleep(Duration::from_millis(100));
    }

    info!("terminating, writing the final metadata image");
    match engine.store_all(&mut dumper, DumpKind::Foreground) {
        Ok(FsStatus::Ok) => release_lock(&data_path),
        _ => {
            // dump failed or was disabled: leave a sentinel so the next
            // start replays the changelogs
            write_quick_stop(&data_path, engine.metaversion())
        }
    }
}

fn main() -> Result<()> {
    let matches = command!()
        .arg(arg!(-d --data <DIR> "Data directory (image, changelogs, lock)")
            .required(false)
            .default_value("."))
        .arg(arg!(-p --personality <KIND> "master or shadow")
            .required(false)
            .default_value("master"))
        .arg(arg!(-f --front "Keep the daemon running in front").action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
            .action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--ignore_unknown_sections "Skip unknown image sections instead of failing")
            .action(ArgAction::SetTrue)
            .required(false))
        .arg(arg!(--auto_recovery "Swallow a stale lock and replay changelogs")
            .action(ArgAction::SetTrue)
            .required(false))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let data_path = PathBuf::from(matches.get_one::<String>("data").expect("has default"));
    let personality = match matches.get_one::<String>("personality").map(String::as_str) {
        Some("master") | None => Personality::Master,
        Some("shadow") => Personality::Shadow,
        Some(other) => bail!("unknown personality {:?}", other),
    };
    let mut config = EngineConfig::from_env();
    config.data_path = data_path.clone();
    if matches.get_flag("auto_recovery") {
        config.auto_recovery = true;
    }
    let ignore_unknown = matches.get_flag("ignore_unknown_sections");

    if !matches.get_flag("front") {
        match fork() {
            Ok(Fork::Parent(child)) => {
                info!("daemon running at pid {}", child);
                return Ok(());
            }
            Ok(Fork::Child) => {}
            Err(e) => bail!("fork returned error {}", e),
        }
    }
    install_signal_handlers();

    let lock_state = acquire_lock(&data_path, config.auto_recovery)?;
    let mut engine = Engine::new(personality, config, Box::new(InMemoryChunks::new()));
    if let Some(goals) = engine.config.custom_goals_filename.clone() {
        engine.load_goal_definitions(&goals)?;
    }

    if let Err(e) = load_or_create(&mut engine, &data_path, ignore_unknown) {
        release_lock(&data_path).ok();
        return Err(e);
    }
    if let LockState::QuickStop(version) = lock_state {
        if engine.metaversion() < version {
            release_lock(&data_path).ok();
            bail!(
                "quick-stop sentinel expects version {} but changelogs only reached {}",
                version,
                engine.metaversion()
            );
        }
    }

    match personality {
        Personality::Master => run_master(engine, data_path),
        Personality::Shadow => {
            // the shadow stays passive until a master link feeds it records;
            // that link lives in the session module, outside this binary
            info!("shadow loaded at version {}, waiting for records", engine.metaversion());
            while !TERMINATE.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }
            release_lock(&data_path)
        }
    }
}
