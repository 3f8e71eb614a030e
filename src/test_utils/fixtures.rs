use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use crate::config::{Backend, Config};
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::platform::{MemoryPlatform, CURRENT_VERSION_KEY};
use crate::storage::MutationJournal;

pub const ADAPTER_ID: &str = "GUID-1";
pub const ADAPTER_ADDRESS: &str = "AA:BB:CC:11:22:33";
pub const MACHINE_GUID: &str = "11111111-2222-3333-4444-555555555555";

/// Elevated machine with one Ethernet adapter at 192.168.1.50/24.
pub fn standard_platform() -> MemoryPlatform {
    MemoryPlatform::new()
        .with_adapter(ADAPTER_ID, "Ethernet", ADAPTER_ADDRESS)
        .with_ipv4(ADAPTER_ID, "192.168.1.50", "255.255.255.0", Some("192.168.1.1"))
        .with_machine_guid(MACHINE_GUID)
        .with_value(CURRENT_VERSION_KEY, "ProductName", "Windows 10 Pro")
        .with_value(CURRENT_VERSION_KEY, "CurrentBuild", "19045")
        .with_metadata("BIOS.SerialNumber", "REAL-SERIAL")
}

/// Journal in its own temp directory.
pub struct TestJournal {
    pub dir: TempDir,
    pub journal: MutationJournal,
}

impl TestJournal {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        println!("[FIXTURE] Created journal directory: {:?}", dir.path());
        let journal = MutationJournal::open(dir.path().join("journal.db"), Duration::from_secs(5))
            .expect("Failed to open journal");
        Self { dir, journal }
    }
}

impl Default for TestJournal {
    fn default() -> Self {
        Self::new()
    }
}

/// Data root plus a platform that outlives individual orchestrators, so a
/// test can simulate restarts and crashes against the same machine.
/// Automatic backups are off unless a test turns them on.
pub struct TestMachine {
    pub root: TempDir,
    pub platform: MemoryPlatform,
    pub config: Config,
}

impl TestMachine {
    pub fn new() -> Self {
        Self::with_platform(standard_platform())
    }

    pub fn with_platform(platform: MemoryPlatform) -> Self {
        let root = TempDir::new().expect("Failed to create temp dir");
        println!("[FIXTURE] Created data root: {:?}", root.path());
        let mut config = Config::default();
        config.mutation.settle_delay = Duration::ZERO;
        config.platform.backend = Backend::Simulated;
        config.journal.auto_backup = false;
        Self {
            root,
            platform,
            config,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn try_open(&self) -> Result<Orchestrator> {
        Orchestrator::open(
            self.config.clone(),
            self.root.path(),
            Box::new(self.platform.clone()),
        )
    }

    /// Open an orchestrator, panicking on failure.
    pub fn open(&self) -> Orchestrator {
        self.try_open().expect("Failed to open orchestrator")
    }
}

impl Default for TestMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestMachine {
    fn drop(&mut self) {
        println!("[FIXTURE] Cleaning up data root: {:?}", self.root.path());
    }
}
