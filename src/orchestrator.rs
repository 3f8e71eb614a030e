//! Top-level owner of the journal, the platform and the revert scheduler.
//!
//! One [`Orchestrator`] exists per process. Opening it takes the instance
//! lock, recovers interrupted intents, absorbs a boot-time revert, closes
//! sessions left open by crashed processes, starts this process's session
//! and takes the scheduled backup when one is due.
//! [`Orchestrator::shutdown`] ends the session; dropping without it is
//! indistinguishable from a crash.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, StructuredError};
use crate::mutator::overrides::apply_overrides;
use crate::mutator::{
    IdentifierClass, IdentifierMutator, MutationOptions, MutationOutcome, Originals,
    RestoreReport, SpoofMode, SPOOF_MODE, SPOOF_OVERRIDES,
};
use crate::platform::{AdapterInfo, Platform, BASELINE_VALUES};
use crate::revert::{ApplyReport, RevertScheduler, RevertState};
use crate::storage::{
    BackupRecord, InstanceLock, MutationEntry, MutationJournal, MutationRecord, RegistryValue,
    Settings, Statistics,
};
use crate::worker::CancelToken;

/// What startup found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    pub session_id: String,
    /// Sessions a previous process left open.
    pub stale_sessions: usize,
    pub recovered_intents: usize,
    pub boot_revert_applied: bool,
    /// Newest backup before this start.
    pub last_backup: Option<BackupRecord>,
    /// Backup taken during this start because one was due.
    pub auto_backup: Option<BackupRecord>,
}

impl StartupReport {
    /// A previous run ended without a clean shutdown.
    #[must_use]
    pub const fn unclean_shutdown(&self) -> bool {
        self.stale_sessions > 0 || self.recovered_intents > 0
    }
}

/// Per-class progress of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchProgress {
    Started {
        index: usize,
        total: usize,
        class: String,
    },
    Finished {
        index: usize,
        total: usize,
        outcome: MutationOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub outcomes: Vec<MutationOutcome>,
    /// `completed` or `completed with issues`.
    pub summary: String,
    pub cancelled: bool,
    pub revert: Option<RevertState>,
    pub revert_error: Option<StructuredError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    pub report: RestoreReport,
    pub summary: String,
    pub revert: Option<RevertState>,
    pub revert_error: Option<StructuredError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub platform: String,
    pub adapters: Vec<AdapterInfo>,
    /// Hardware metadata with reporting overrides applied.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub session_id: String,
    pub mode: SpoofMode,
    pub platform: String,
    pub elevated: bool,
    pub schema_version: u32,
    pub open_sessions: usize,
    pub pending_originals: usize,
    pub overrides: usize,
    pub revert: RevertState,
    pub last_backup: Option<BackupRecord>,
    pub startup: StartupReport,
}

fn summary_text(clean: bool) -> String {
    let text = if clean { "completed" } else { "completed with issues" };
    text.to_string()
}

pub struct Orchestrator {
    config: Config,
    root: PathBuf,
    platform: Box<dyn Platform>,
    journal: MutationJournal,
    scheduler: RevertScheduler,
    session_id: String,
    session_started: DateTime<Utc>,
    startup: StartupReport,
    _lock: InstanceLock,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("root", &self.root)
            .field("platform", &self.platform.name())
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn open(config: Config, root: &Path, platform: Box<dyn Platform>) -> Result<Self> {
        let lock = InstanceLock::acquire(root)?;
        let mut journal = MutationJournal::open(
            config.db_path(root),
            Duration::from_millis(config.journal.busy_timeout_ms),
        )?;

        let recovered_intents = journal.recover_interrupted()?;
        let scheduler = RevertScheduler::new(&config, root);
        let boot_revert_applied = scheduler.reconcile(&mut journal, None)?;

        let stale_sessions = journal.count_open_sessions()?;
        if stale_sessions > 0 {
            warn!(stale_sessions, "previous run did not shut down cleanly");
            journal.close_stale_sessions(None)?;
        }
        let session_id = journal.start_session()?;
        let session_started = journal
            .session(&session_id)?
            .map_or_else(Utc::now, |s| s.started_at);
        let last_backup = journal.last_backup()?;

        info!(
            session_id = %session_id,
            platform = platform.name(),
            recovered_intents,
            boot_revert_applied,
            "orchestrator ready"
        );
        let startup = StartupReport {
            session_id: session_id.clone(),
            stale_sessions,
            recovered_intents,
            boot_revert_applied,
            last_backup,
            auto_backup: None,
        };
        let mut orchestrator = Self {
            config,
            root: root.to_path_buf(),
            platform,
            journal,
            scheduler,
            session_id,
            session_started,
            startup,
            _lock: lock,
        };
        orchestrator.startup.auto_backup = orchestrator.auto_backup();
        Ok(orchestrator)
    }

    /// Whether the scheduled backup is due: the newest backup is older than
    /// `backup_interval`, or there is none yet and the journal holds history.
    /// Never due after an unclean shutdown, so the last good backup stays
    /// the newest one.
    fn backup_due(&self) -> bool {
        if !self.config.journal.auto_backup || self.startup.unclean_shutdown() {
            return false;
        }
        match &self.startup.last_backup {
            Some(last) => Utc::now()
                .signed_duration_since(last.created_at)
                .to_std()
                .is_ok_and(|age| age >= self.config.journal.backup_interval),
            None => self.journal.statistics().is_ok_and(|stats| stats.total > 0),
        }
    }

    fn auto_backup(&mut self) -> Option<BackupRecord> {
        if !self.backup_due() {
            return None;
        }
        match self.create_backup(true, &mut |_| {}) {
            Ok(record) => {
                info!(path = %record.file_path.display(), "automatic backup created");
                Some(record)
            }
            Err(err) => {
                warn!(error = %err, "automatic backup failed");
                None
            }
        }
    }

    pub const fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub const fn journal(&self) -> &MutationJournal {
        &self.journal
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    pub const fn scheduler(&self) -> &RevertScheduler {
        &self.scheduler
    }

    pub fn mode(&self) -> SpoofMode {
        self.journal
            .get_setting(SPOOF_MODE, self.config.mutation.default_mode)
    }

    fn mutator(&mut self) -> IdentifierMutator<'_> {
        IdentifierMutator::new(
            self.platform.as_ref(),
            &mut self.journal,
            Some(&self.session_id),
            self.config.mutation.settle_delay,
        )
    }

    /// Bring the script and trigger in line with the mode and the originals.
    fn sync_revert(&mut self) -> Result<RevertState> {
        match self.mode() {
            SpoofMode::Ephemeral => self
                .scheduler
                .regenerate(&mut self.journal, self.platform.as_ref()),
            SpoofMode::Permanent => self.scheduler.clear(&mut self.journal, self.platform.as_ref()),
        }
    }

    fn sync_revert_reported(&mut self) -> (Option<RevertState>, Option<StructuredError>) {
        match self.sync_revert() {
            Ok(state) => (Some(state), None),
            Err(err) => {
                warn!(error = %err, "revert script could not be updated");
                (None, Some(err.to_structured()))
            }
        }
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Mutate `classes` in order. A failing class never stops the others;
    /// cancellation is honoured between classes.
    pub fn mutate_batch(
        &mut self,
        classes: &[IdentifierClass],
        options: &MutationOptions,
        observer: &mut dyn FnMut(BatchProgress),
        cancel: &CancelToken,
    ) -> BatchSummary {
        let total = classes.len();
        let mut outcomes = Vec::with_capacity(total);
        let mut cancelled = false;

        for (index, class) in classes.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(remaining = total - index, "batch cancelled");
                cancelled = true;
                break;
            }
            observer(BatchProgress::Started {
                index,
                total,
                class: class.to_string(),
            });
            let outcome = self.mutator().mutate(class, options, cancel);
            observer(BatchProgress::Finished {
                index,
                total,
                outcome: outcome.clone(),
            });
            outcomes.push(outcome);
        }

        // Only writes that reached the journal can have captured originals.
        let touches_resources = classes.iter().zip(&outcomes).any(|(class, outcome)| {
            !matches!(class, IdentifierClass::ReportingOverride(_)) && outcome.resource.is_some()
        });
        let (revert, revert_error) = if touches_resources && self.mode() == SpoofMode::Ephemeral {
            self.sync_revert_reported()
        } else {
            (None, None)
        };

        let clean = !cancelled && revert_error.is_none() && outcomes.iter().all(|o| o.success);
        BatchSummary {
            outcomes,
            summary: summary_text(clean),
            cancelled,
            revert,
            revert_error,
        }
    }

    pub fn mutate(&mut self, class: &IdentifierClass, options: &MutationOptions) -> BatchSummary {
        self.mutate_batch(
            std::slice::from_ref(class),
            options,
            &mut |_| {},
            &CancelToken::new(),
        )
    }

    /// Dry run: what each class would change.
    pub fn plan(
        &mut self,
        classes: &[IdentifierClass],
        options: &MutationOptions,
    ) -> Vec<MutationOutcome> {
        let mutator = self.mutator();
        classes.iter().map(|c| mutator.plan(c, options)).collect()
    }

    pub fn restore_all(&mut self) -> Result<RestoreSummary> {
        let report = self.mutator().restore_all()?;
        let (revert, revert_error) = self.sync_revert_reported();
        let clean = report.all_succeeded() && revert_error.is_none();
        Ok(RestoreSummary {
            report,
            summary: summary_text(clean),
            revert,
            revert_error,
        })
    }

    pub fn set_mode(&mut self, mode: SpoofMode) -> Result<RevertState> {
        let mut patch = Settings::new();
        patch.set(SPOOF_MODE, &mode)?;
        self.journal.save_settings(&patch)?;
        info!(%mode, "mode changed");
        self.sync_revert()
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    pub fn statistics(&self) -> Result<Statistics> {
        self.journal.statistics()
    }

    pub fn history(&self, limit: usize) -> Result<Vec<MutationRecord>> {
        self.journal.list_mutations(limit)
    }

    /// Hardware metadata as callers should see it: overrides win.
    pub fn machine_metadata(&self) -> Result<BTreeMap<String, String>> {
        let mut metadata = self.platform.read_machine_metadata()?;
        let overrides: BTreeMap<String, String> =
            self.journal.get_setting(SPOOF_OVERRIDES, BTreeMap::new());
        apply_overrides(&mut metadata, &overrides);
        Ok(metadata)
    }

    pub fn inventory(&self) -> Result<Inventory> {
        Ok(Inventory {
            platform: self.platform.name().to_string(),
            adapters: self.platform.list_active_adapters()?,
            metadata: self.machine_metadata()?,
        })
    }

    pub fn revert_state(&self) -> RevertState {
        self.scheduler.state(&self.journal, self.platform.as_ref())
    }

    pub fn status(&self) -> Result<Status> {
        let settings = self.journal.load_settings()?;
        let originals = Originals::load(&settings)?;
        let overrides: BTreeMap<String, String> =
            settings.get(SPOOF_OVERRIDES)?.unwrap_or_default();
        Ok(Status {
            session_id: self.session_id.clone(),
            mode: self.mode(),
            platform: self.platform.name().to_string(),
            elevated: self.platform.is_elevated(),
            schema_version: self.journal.schema_version(),
            open_sessions: self.journal.count_open_sessions()?,
            pending_originals: usize::from(originals.machine_guid.is_some())
                + originals.adapter_addresses.len()
                + originals.ip_configs.len(),
            overrides: overrides.len(),
            revert: self.revert_state(),
            last_backup: self.journal.last_backup()?,
            startup: self.startup.clone(),
        })
    }

    // =========================================================================
    // REVERT
    // =========================================================================

    pub fn regenerate_revert(&mut self) -> Result<RevertState> {
        self.sync_revert()
    }

    /// Execute the pending boot-time revert now.
    pub fn run_pending_revert(&mut self) -> Result<ApplyReport> {
        self.scheduler
            .run_pending(&mut self.journal, self.platform.as_ref(), Some(&self.session_id))
    }

    // =========================================================================
    // BACKUP
    // =========================================================================

    /// Snapshot inventory and the registry baseline into the journal, then
    /// back the journal up.
    pub fn create_backup(
        &mut self,
        verify: bool,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<BackupRecord> {
        let baseline = self.registry_baseline();
        if let Err(err) = self
            .journal
            .save_registry_snapshot(&baseline, Some(&self.session_id))
        {
            warn!(error = %err, "could not store registry baseline");
        }
        let snapshot = json!({
            "captured_at": Utc::now().to_rfc3339(),
            "platform": self.platform.name(),
            "adapters": self.platform.list_active_adapters().unwrap_or_default(),
            "metadata": self.machine_metadata().unwrap_or_default(),
        });
        if let Err(err) = self.journal.save_system_snapshot(&snapshot) {
            warn!(error = %err, "could not store system snapshot");
        }
        self.journal.create_backup(
            &self.config.backup_dir(&self.root),
            verify,
            self.config.journal.backup_chunk_pages,
            on_progress,
        )
    }

    /// Identity values present right now. Unreadable values are skipped.
    fn registry_baseline(&self) -> Vec<RegistryValue> {
        BASELINE_VALUES
            .iter()
            .filter_map(|(key_path, value_name)| {
                match self.platform.get(key_path, value_name) {
                    Ok(Some(value)) => Some(RegistryValue {
                        key_path: (*key_path).to_string(),
                        value_name: (*value_name).to_string(),
                        value: Some(value),
                    }),
                    Ok(None) => None,
                    Err(err) => {
                        debug!(key_path, value_name, error = %err, "baseline value unreadable");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn list_backups(&self, limit: usize) -> Result<Vec<BackupRecord>> {
        self.journal.list_backups(limit)
    }

    /// Swap in a backup, keep this process's session open, and bring the
    /// revert script in line with the restored originals.
    pub fn restore_backup(&mut self, path: &Path) -> Result<RevertState> {
        self.journal.restore_backup(path)?;
        self.journal
            .ensure_session(&self.session_id, self.session_started)?;
        self.journal.close_stale_sessions(Some(&self.session_id))?;
        self.journal.record_mutation(
            &MutationEntry::new(
                "journal",
                "backup_restore",
                None,
                Some(path.display().to_string()),
            )
            .in_session(Some(&self.session_id)),
        );
        self.sync_revert()
    }

    pub fn prune(&self, retention_days: Option<u32>) -> Result<usize> {
        self.journal
            .prune(retention_days.unwrap_or(self.config.journal.retention_days))
    }

    /// End the session cleanly and release the lock.
    pub fn shutdown(self) -> Result<()> {
        self.journal.end_session(&self.session_id)?;
        info!(session_id = %self.session_id, "session ended");
        Ok(())
    }
}
