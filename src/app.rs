//! Process-wide context shared by CLI commands.

use std::path::PathBuf;

use tracing::debug;

use crate::cli::Cli;
use crate::cli::progress::ProgressReporter;
use crate::config::Config;
use crate::error::{IdError, Result};
use crate::orchestrator::Orchestrator;
use crate::platform;
use crate::worker::{Job, JobResult, Worker};

pub struct AppContext {
    pub root: PathBuf,
    pub config: Config,
    pub robot_mode: bool,
    pub quiet: bool,
    pub progress: ProgressReporter,
    orchestrator: Option<Orchestrator>,
}

impl AppContext {
    /// Resolve root and config, pick the platform backend and open the
    /// orchestrator (lock, journal recovery, session).
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let root = Config::default_root()?;
        std::fs::create_dir_all(&root)?;
        let config = Config::load(cli.config.as_deref(), &root)?;
        let platform = platform::from_config(&config, &root)?;
        debug!(root = %root.display(), platform = platform.name(), "context ready");

        let orchestrator = Orchestrator::open(config.clone(), &root, platform)?;
        let progress = ProgressReporter::new(cli.robot, cli.quiet);
        let startup = orchestrator.startup_report();
        if startup.unclean_shutdown() {
            let hint = startup.last_backup.as_ref().map_or_else(
                || "no journal backup exists yet".to_string(),
                |b| {
                    format!(
                        "last backup: idswap backup restore {} --approve",
                        b.file_path.display()
                    )
                },
            );
            progress.warn(&format!(
                "previous run did not shut down cleanly ({} open sessions, {} interrupted writes); {hint}",
                startup.stale_sessions, startup.recovered_intents
            ));
        }

        Ok(Self {
            root,
            config,
            robot_mode: cli.robot,
            quiet: cli.quiet,
            progress,
            orchestrator: Some(orchestrator),
        })
    }

    pub fn orchestrator(&self) -> Result<&Orchestrator> {
        self.orchestrator.as_ref().ok_or_else(detached)
    }

    pub fn orchestrator_mut(&mut self) -> Result<&mut Orchestrator> {
        self.orchestrator.as_mut().ok_or_else(detached)
    }

    /// Run one job on the background worker, rendering its progress under
    /// `operation`, and take the orchestrator back afterwards.
    pub fn run_job(&mut self, job: Job, operation: &str) -> Result<JobResult> {
        let orchestrator = self.orchestrator.take().ok_or_else(detached)?;
        let mut worker = Worker::spawn(orchestrator)?;
        let (handle, mut observer) = self.progress.worker_observer(operation);

        let waited = worker
            .submit(job)
            .and_then(|id| worker.wait(id, &mut observer));
        self.orchestrator = Some(worker.join()?);

        match waited? {
            Ok(result) => {
                handle.finish_with_message(operation);
                Ok(result)
            }
            Err(err) => {
                handle.abandon_with_message(&err.message);
                Err(IdError::Job(err))
            }
        }
    }

    /// End the session cleanly. Skipping this is what a crash looks like.
    pub fn shutdown(mut self) -> Result<()> {
        match self.orchestrator.take() {
            Some(orchestrator) => orchestrator.shutdown(),
            None => Ok(()),
        }
    }
}

fn detached() -> IdError {
    IdError::Cancelled("orchestrator is owned by a running worker".to_string())
}
