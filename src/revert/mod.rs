//! Boot-time self-healing.
//!
//! While any ephemeral mutation is outstanding, an undo script sits on disk
//! with a startup trigger pointing at it. The script undoes every original,
//! drops a completion marker, unregisters itself and deletes itself; the
//! next process start sees the marker and clears the originals.

pub mod script;

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{IdError, Result};
use crate::mutator::{
    Originals, IP_ORIGINAL_CONFIGS, MAC_ORIGINAL_VALUES, ORIGINAL_MACHINE_GUID, SPOOF_OVERRIDES,
};
use crate::platform::{Platform, RegistrationKind};
use crate::storage::{MutationEntry, MutationJournal, Settings};

pub use script::{ApplyReport, RevertCommand, RevertPlan};

/// Settings key holding the hex SHA-256 of the script on disk.
pub const REVERT_SCRIPT_SHA256: &str = "revert_script_sha256";
pub const SCRIPT_FILENAME: &str = "revert.ps1";
pub const MARKER_FILENAME: &str = "revert.done";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RevertState {
    NoPendingRevert,
    PendingRevert {
        script: PathBuf,
        registered: Option<RegistrationKind>,
        digest: Option<String>,
    },
}

impl RevertState {
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::PendingRevert { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RevertScheduler {
    script_path: PathBuf,
    marker_path: PathBuf,
    task_name: String,
    settle_delay: Duration,
}

impl RevertScheduler {
    pub fn new(config: &Config, root: &Path) -> Self {
        let dir = config.script_dir(root);
        Self {
            script_path: dir.join(SCRIPT_FILENAME),
            marker_path: dir.join(MARKER_FILENAME),
            task_name: config.revert.task_name.clone(),
            settle_delay: config.mutation.settle_delay,
        }
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// The command a startup trigger runs.
    #[must_use]
    pub fn trigger_command(&self) -> String {
        format!(
            "powershell.exe -NoProfile -NonInteractive -ExecutionPolicy Bypass -File \"{}\"",
            self.script_path.display()
        )
    }

    #[must_use]
    pub fn plan(&self, originals: &Originals) -> RevertPlan {
        RevertPlan::from_originals(
            originals,
            &self.task_name,
            self.settle_delay,
            &self.marker_path,
            &self.script_path,
        )
    }

    /// Rebuild the script from the originals in settings and (re)register
    /// its trigger. With nothing to revert this is [`Self::clear`].
    pub fn regenerate(
        &self,
        journal: &mut MutationJournal,
        platform: &dyn Platform,
    ) -> Result<RevertState> {
        let originals = Originals::load(&journal.load_settings()?)?;
        if originals.is_empty() {
            return self.clear(journal, platform);
        }

        let rendered = self.plan(&originals).render()?;
        write_atomic(&self.script_path, rendered.as_bytes())?;
        let digest = hex::encode(Sha256::digest(rendered.as_bytes()));

        let mut patch = Settings::new();
        patch.set(REVERT_SCRIPT_SHA256, &digest)?;
        if let Err(err) = journal.save_settings(&patch) {
            warn!(error = %err, "could not store revert script digest");
        }

        let kind = self.register(platform)?;
        info!(
            script = %self.script_path.display(),
            registration = ?kind,
            "revert script regenerated"
        );
        Ok(RevertState::PendingRevert {
            script: self.script_path.clone(),
            registered: Some(kind),
            digest: Some(digest),
        })
    }

    /// Remove the script and its trigger.
    pub fn clear(
        &self,
        journal: &mut MutationJournal,
        platform: &dyn Platform,
    ) -> Result<RevertState> {
        platform
            .unregister(&self.task_name)
            .map_err(|err| IdError::ScheduleRegistrationFailed(format!("unregister: {err}")))?;
        remove_if_present(&self.script_path)?;
        if let Err(err) = journal.remove_settings(&[REVERT_SCRIPT_SHA256]) {
            warn!(error = %err, "could not clear revert script digest");
        }
        debug!(task = %self.task_name, "revert cleared");
        Ok(RevertState::NoPendingRevert)
    }

    /// Prefer a system startup task; fall back to a per-user auto-run
    /// entry. Both are removed first so at most one trigger exists.
    pub fn register(&self, platform: &dyn Platform) -> Result<RegistrationKind> {
        let command = self.trigger_command();
        platform
            .unregister(&self.task_name)
            .map_err(|err| IdError::ScheduleRegistrationFailed(format!("unregister: {err}")))?;

        if platform.is_elevated() {
            match platform.register_system_task(&self.task_name, &command) {
                Ok(()) => return Ok(RegistrationKind::SystemTask),
                Err(err) => {
                    warn!(error = %err, "system startup task refused; using per-user auto-run");
                }
            }
        }
        platform
            .register_user_autorun(&self.task_name, &command)
            .map(|()| RegistrationKind::UserAutorun)
            .map_err(|err| IdError::ScheduleRegistrationFailed(err.to_string()))
    }

    pub fn state(&self, journal: &MutationJournal, platform: &dyn Platform) -> RevertState {
        if !self.script_path.exists() {
            return RevertState::NoPendingRevert;
        }
        let registered = platform.query(&self.task_name).unwrap_or_else(|err| {
            debug!(error = %err, "could not query startup trigger");
            None
        });
        RevertState::PendingRevert {
            script: self.script_path.clone(),
            registered,
            digest: journal.get_setting(REVERT_SCRIPT_SHA256, None),
        }
    }

    /// Read back the plan embedded in the current script.
    pub fn load_plan(&self) -> Result<RevertPlan> {
        let text = fs::read_to_string(&self.script_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                IdError::NotFound(format!("no revert script at {}", self.script_path.display()))
            } else {
                err.into()
            }
        })?;
        RevertPlan::from_script(&text)
    }

    /// Run the pending revert now instead of at the next boot.
    pub fn run_pending(
        &self,
        journal: &mut MutationJournal,
        platform: &dyn Platform,
        session_id: Option<&str>,
    ) -> Result<ApplyReport> {
        let report = self.load_plan()?.apply(platform);
        if report.completed {
            self.reconcile(journal, session_id)?;
        }
        Ok(report)
    }

    /// Absorb a revert that ran while this application was not running.
    /// Reporting overrides end with the ephemeral session, like the
    /// identifiers the script restored.
    ///
    /// Returns `true` when the completion marker was found.
    pub fn reconcile(&self, journal: &mut MutationJournal, session_id: Option<&str>) -> Result<bool> {
        if !self.marker_path.exists() {
            return Ok(false);
        }
        journal.remove_settings(&[
            ORIGINAL_MACHINE_GUID,
            MAC_ORIGINAL_VALUES,
            IP_ORIGINAL_CONFIGS,
            SPOOF_OVERRIDES,
            REVERT_SCRIPT_SHA256,
        ])?;
        journal.record_mutation(
            &MutationEntry::new("revert", "boot_revert", None, Some("originals restored".to_string()))
                .in_session(session_id),
        );
        remove_if_present(&self.marker_path)?;
        info!("boot-time revert completed; originals cleared");
        Ok(true)
    }
}

/// Write to a sibling temp file, then rename over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| IdError::Config(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}
