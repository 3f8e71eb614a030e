use std::path::PathBuf;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

/// Isolated data root for driving the binary against the simulated backend.
pub struct CliFixture {
    pub temp_dir: TempDir,
    pub root: PathBuf,
    test_name: String,
}

pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Parse stdout as the single robot-mode JSON document.
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.stdout).unwrap_or_else(|err| {
            panic!(
                "stdout is not JSON ({err})\nstdout:\n{}\nstderr:\n{}",
                self.stdout, self.stderr
            )
        })
    }
}

impl CliFixture {
    pub fn new(test_name: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("idswap");
        println!("[FIXTURE] {test_name}: root {}", root.display());
        Self {
            temp_dir,
            root,
            test_name: test_name.to_string(),
        }
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::cargo_bin("idswap").expect("binary built");
        cmd.env("HOME", self.temp_dir.path())
            .env("XDG_CONFIG_HOME", self.temp_dir.path().join("config"))
            .env("IDSWAP_ROOT", &self.root)
            .env("IDSWAP_CONFIG", self.root.join("config.toml"))
            .env("IDSWAP_BACKEND", "simulated")
            .env("IDSWAP_SETTLE_DELAY_MS", "0")
            .env("IDSWAP_AUTO_BACKUP", "false")
            .env_remove("RUST_LOG")
            .current_dir(self.temp_dir.path());
        cmd
    }

    pub fn run(&self, args: &[&str]) -> CommandOutput {
        println!("[CMD] {}: idswap {}", self.test_name, args.join(" "));
        let output = self.command().args(args).output().expect("Failed to run idswap");
        let result = CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        println!("[CMD] exit success: {}", result.success);
        result
    }

    /// Run in robot mode and require success.
    pub fn robot(&self, args: &[&str]) -> Value {
        let mut full = vec!["--robot"];
        full.extend_from_slice(args);
        let output = self.run(&full);
        assert!(
            output.success,
            "idswap {} failed\nstdout:\n{}\nstderr:\n{}",
            full.join(" "),
            output.stdout,
            output.stderr
        );
        output.json()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}
