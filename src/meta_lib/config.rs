/// Engine options, read from the environment with CLI overrides.
use std::env;
use std::path::PathBuf;

use log::*;

use crate::meta_lib::types::SugidClearMode;

pub const DEFAULT_CHECKSUM_INTERVAL: u32 = 50;
pub const DEFAULT_RECALCULATION_SPEED: u32 = 100;
pub const DEFAULT_EMPTY_TRASH_PERIOD: u32 = 300;
pub const DEFAULT_EMPTY_RESERVED_PERIOD: u32 = 60;
pub const DEFAULT_FREE_INODES_PERIOD: u32 = 60;
pub const DEFAULT_TASK_BATCH_SIZE: u32 = 1000;
pub const MAX_KEEP_PREVIOUS: u32 = 99;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_path: PathBuf,
    pub auto_recovery: bool,
    pub disable_checksum_verification: bool,
    pub magic_auto_file_repair: bool,
    pub no_atime: bool,
    pub back_meta_keep_previous: u32,
    pub checksum_interval: u32,
    pub checksum_recalculation_speed: u32,
    pub empty_trash_period: u32,
    pub empty_reserved_period: u32,
    pub free_inodes_period: u32,
    pub task_batch_size: u32,
    pub custom_goals_filename: Option<PathBuf>,
    pub magic_disable_metadata_dumps: bool,
    pub sugid_clear_mode: SugidClearMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_path: PathBuf::from("."),
            auto_recovery: false,
            disable_checksum_verification: false,
            magic_auto_file_repair: false,
            no_atime: false,
            back_meta_keep_previous: 1,
            checksum_interval: DEFAULT_CHECKSUM_INTERVAL,
            checksum_recalculation_speed: DEFAULT_RECALCULATION_SPEED,
            empty_trash_period: DEFAULT_EMPTY_TRASH_PERIOD,
            empty_reserved_period: DEFAULT_EMPTY_RESERVED_PERIOD,
            free_inodes_period: DEFAULT_FREE_INODES_PERIOD,
            task_batch_size: DEFAULT_TASK_BATCH_SIZE,
            custom_goals_filename: None,
            magic_disable_metadata_dumps: false,
            sugid_clear_mode: SugidClearMode::Ext,
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match env::var(name) {
        Ok(v) => match v.parse() {
            Ok(n) => n,
            Err(_) => {
                warn!("{}: bad value {:?}, using {}", name, v, default);
                default
            }
        },
        Err(_) => default,
    }
}

impl EngineConfig {
    /// Reads all recognized options from the environment.
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        let keep = env_u32("BACK_META_KEEP_PREVIOUS", defaults.back_meta_keep_previous);
        let sugid = match env::var("SUGID_CLEAR_MODE").ok().as_deref() {
            Some("NEVER") => SugidClearMode::Never,
            Some("ALWAYS") => SugidClearMode::Always,
            Some("OSX") => SugidClearMode::Osx,
            Some("BSD") => SugidClearMode::Bsd,
            Some("EXT") | None => SugidClearMode::Ext,
            Some("XFS") => SugidClearMode::Xfs,
            Some(other) => {
                warn!("SUGID_CLEAR_MODE: unknown mode {:?}, using EXT", other);
                SugidClearMode::Ext
            }
        };
        EngineConfig {
            data_path: env::var("DATA_PATH").map(PathBuf::from).unwrap_or(defaults.data_path),
            auto_recovery: env_bool("AUTO_RECOVERY", defaults.auto_recovery),
            disable_checksum_verification: env_bool(
                "DISABLE_METADATA_CHECKSUM_VERIFICATION",
                defaults.disable_checksum_verification,
            ),
            magic_auto_file_repair: env_bool("MAGIC_AUTO_FILE_REPAIR", defaults.magic_auto_file_repair),
            no_atime: env_bool("NO_ATIME", defaults.no_atime),
            back_meta_keep_previous: keep.min(MAX_KEEP_PREVIOUS),
            checksum_interval: env_u32("METADATA_CHECKSUM_INTERVAL", defaults.checksum_interval),
            checksum_recalculation_speed: env_u32(
                "METADATA_CHECKSUM_RECALCULATION_SPEED",
                defaults.checksum_recalculation_speed,
            ),
            empty_trash_period: env_u32("EMPTY_TRASH_PERIOD", defaults.empty_trash_period),
            empty_reserved_period: env_u32(
                "EMPTY_RESERVED_INODES_PERIOD",
                defaults.empty_reserved_period,
            ),
            free_inodes_period: env_u32("FREE_INODES_PERIOD", defaults.free_inodes_period),
            task_batch_size: env_u32("TASK_BATCH_SIZE", defaults.task_batch_size),
            custom_goals_filename: env::var("CUSTOM_GOALS_FILENAME").ok().map(PathBuf::from),
            magic_disable_metadata_dumps: env_bool("MAGIC_DISABLE_METADATA_DUMPS", false),
            sugid_clear_mode: sugid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = EngineConfig::default();
        assert!(!c.auto_recovery);
        assert_eq!(c.checksum_interval, DEFAULT_CHECKSUM_INTERVAL);
        assert_eq!(c.sugid_clear_mode, SugidClearMode::Ext);
        assert!(c.back_meta_keep_previous <= MAX_KEEP_PREVIOUS);
    }
}
