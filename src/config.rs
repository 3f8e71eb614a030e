use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IdError, Result};
use crate::mutator::SpoofMode;

/// Upper bound on the adapter settle delay. Disable/enable cycles never wait longer.
pub const MAX_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Seven days between automatic backups.
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub mutation: MutationConfig,
    #[serde(default)]
    pub revert: RevertConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
}

impl Config {
    pub fn load(explicit_path: Option<&Path>, root: &Path) -> Result<Self> {
        let mut config = Self::default();

        let explicit = explicit_path
            .map(PathBuf::from)
            .or_else(|| std::env::var("IDSWAP_CONFIG").ok().map(PathBuf::from));

        if let Some(path) = explicit {
            if let Some(patch) = Self::load_patch(&path)? {
                config.merge_patch(patch);
            }
        } else {
            if let Some(global) = Self::load_global()? {
                config.merge_patch(global);
            }
            if let Some(project) = Self::load_project(root)? {
                config.merge_patch(project);
            }
        }

        config.apply_env_overrides()?;
        config.mutation.settle_delay = config.mutation.settle_delay.min(MAX_SETTLE_DELAY);

        Ok(config)
    }

    /// Resolve the data root: `IDSWAP_ROOT`, else `<data_dir>/idswap`.
    pub fn default_root() -> Result<PathBuf> {
        if let Some(root) = env_string("IDSWAP_ROOT") {
            return Ok(PathBuf::from(root));
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| IdError::Config("data directory not found".to_string()))?;
        Ok(data_dir.join("idswap"))
    }

    #[must_use]
    pub fn db_path(&self, root: &Path) -> PathBuf {
        root.join(&self.journal.db_file)
    }

    #[must_use]
    pub fn backup_dir(&self, root: &Path) -> PathBuf {
        if self.journal.backup_dir.as_os_str().is_empty() {
            root.join("backups")
        } else {
            root.join(&self.journal.backup_dir)
        }
    }

    #[must_use]
    pub fn script_dir(&self, root: &Path) -> PathBuf {
        if self.revert.script_dir.as_os_str().is_empty() {
            root.join("revert")
        } else {
            root.join(&self.revert.script_dir)
        }
    }

    fn load_global() -> Result<Option<ConfigPatch>> {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(None);
        };
        Self::load_patch(&config_dir.join("idswap/config.toml"))
    }

    fn load_project(root: &Path) -> Result<Option<ConfigPatch>> {
        Self::load_patch(&root.join("config.toml"))
    }

    fn load_patch(path: &Path) -> Result<Option<ConfigPatch>> {
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|err| IdError::Config(format!("read config {}: {err}", path.display())))?;
        let patch = toml::from_str(&raw)
            .map_err(|err| IdError::Config(format!("parse config {}: {err}", path.display())))?;
        Ok(Some(patch))
    }

    fn merge_patch(&mut self, patch: ConfigPatch) {
        if let Some(patch) = patch.journal {
            self.journal.merge(patch);
        }
        if let Some(patch) = patch.mutation {
            self.mutation.merge(patch);
        }
        if let Some(patch) = patch.revert {
            self.revert.merge(patch);
        }
        if let Some(patch) = patch.platform {
            self.platform.merge(patch);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(value) = env_string("IDSWAP_BACKEND") {
            self.platform.backend = parse_backend(&value)?;
        }
        if let Some(value) = env_u64("IDSWAP_SETTLE_DELAY_MS")? {
            self.mutation.settle_delay = Duration::from_millis(value);
        }
        if let Some(value) = env_u32("IDSWAP_RETENTION_DAYS")? {
            self.journal.retention_days = value;
        }
        if let Some(value) = env_bool("IDSWAP_AUTO_BACKUP")? {
            self.journal.auto_backup = value;
        }
        if let Some(days) = env_u64("IDSWAP_BACKUP_INTERVAL_DAYS")? {
            self.journal.backup_interval = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
        }
        if let Some(value) = env_string("IDSWAP_BACKUP_DIR") {
            self.journal.backup_dir = PathBuf::from(value);
        }
        if let Some(value) = env_string("IDSWAP_TASK_NAME") {
            if value.trim().is_empty() {
                return Err(IdError::Config("IDSWAP_TASK_NAME must not be empty".to_string()));
            }
            self.revert.task_name = value;
        }
        Ok(())
    }
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    pub db_file: PathBuf,
    /// Empty means `<root>/backups`.
    pub backup_dir: PathBuf,
    pub busy_timeout_ms: u64,
    pub backup_chunk_pages: i32,
    pub retention_days: u32,
    /// Take a verified backup on startup once `backup_interval` has elapsed.
    pub auto_backup: bool,
    #[serde(with = "humantime_serde")]
    pub backup_interval: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            db_file: PathBuf::from("journal.db"),
            backup_dir: PathBuf::new(),
            busy_timeout_ms: 2000,
            backup_chunk_pages: 1000,
            retention_days: 30,
            auto_backup: true,
            backup_interval: DEFAULT_BACKUP_INTERVAL,
        }
    }
}

impl JournalConfig {
    fn merge(&mut self, patch: JournalPatch) {
        if let Some(value) = patch.db_file {
            self.db_file = value;
        }
        if let Some(value) = patch.backup_dir {
            self.backup_dir = value;
        }
        if let Some(value) = patch.busy_timeout_ms {
            self.busy_timeout_ms = value;
        }
        if let Some(value) = patch.backup_chunk_pages {
            self.backup_chunk_pages = value.max(1);
        }
        if let Some(value) = patch.retention_days {
            self.retention_days = value;
        }
        if let Some(value) = patch.auto_backup {
            self.auto_backup = value;
        }
        if let Some(value) = patch.backup_interval {
            self.backup_interval = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    pub default_mode: SpoofMode,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(1500),
            default_mode: SpoofMode::Ephemeral,
        }
    }
}

impl MutationConfig {
    fn merge(&mut self, patch: MutationPatch) {
        if let Some(value) = patch.settle_delay {
            self.settle_delay = value;
        }
        if let Some(value) = patch.default_mode {
            self.default_mode = value;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertConfig {
    pub task_name: String,
    /// Empty means `<root>/revert`.
    pub script_dir: PathBuf,
}

impl Default for RevertConfig {
    fn default() -> Self {
        Self {
            task_name: "idswap-revert".to_string(),
            script_dir: PathBuf::new(),
        }
    }
}

impl RevertConfig {
    fn merge(&mut self, patch: RevertPatch) {
        if let Some(value) = patch.task_name {
            self.task_name = value;
        }
        if let Some(value) = patch.script_dir {
            self.script_dir = value;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Windows tooling when present, otherwise an unavailable backend.
    #[default]
    Auto,
    Windows,
    Simulated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub backend: Backend,
}

impl PlatformConfig {
    fn merge(&mut self, patch: PlatformPatch) {
        if let Some(value) = patch.backend {
            self.backend = value;
        }
    }
}

// =============================================================================
// Patches
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    journal: Option<JournalPatch>,
    mutation: Option<MutationPatch>,
    revert: Option<RevertPatch>,
    platform: Option<PlatformPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct JournalPatch {
    db_file: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
    busy_timeout_ms: Option<u64>,
    backup_chunk_pages: Option<i32>,
    retention_days: Option<u32>,
    auto_backup: Option<bool>,
    #[serde(default, with = "humantime_serde")]
    backup_interval: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
struct MutationPatch {
    #[serde(default, with = "humantime_serde")]
    settle_delay: Option<Duration>,
    default_mode: Option<SpoofMode>,
}

#[derive(Debug, Default, Deserialize)]
struct RevertPatch {
    task_name: Option<String>,
    script_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct PlatformPatch {
    backend: Option<Backend>,
}

fn parse_backend(value: &str) -> Result<Backend> {
    match value.trim().to_lowercase().as_str() {
        "auto" => Ok(Backend::Auto),
        "windows" => Ok(Backend::Windows),
        "simulated" | "memory" => Ok(Backend::Simulated),
        other => Err(IdError::Config(format!("invalid backend: {other}"))),
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(IdError::Config(format!("invalid {key} value {other}"))),
        },
        Err(_) => Ok(None),
    }
}

fn env_u32(key: &str) -> Result<Option<u32>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u32>()
            .map(Some)
            .map_err(|err| IdError::Config(format!("invalid {key} value {value}: {err}"))),
        Err(_) => Ok(None),
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(value) => value
            .parse::<u64>()
            .map(Some)
            .map_err(|err| IdError::Config(format!("invalid {key} value {value}: {err}"))),
        Err(_) => Ok(None),
    }
}
