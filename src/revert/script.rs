//! Boot-time revert plans.
//!
//! A [`RevertPlan`] is built wholesale from the originals in settings and
//! rendered as a PowerShell script that carries its own plan as a JSON
//! comment. Rendering has no clock or randomness in it, so equal plans give
//! byte-identical scripts.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IdError, Result};
use crate::mutator::{IpConfig, Originals};
use crate::platform::{
    resolve_adapter_path, Platform, PlatformResult, ADAPTER_ID_VALUE, MACHINE_GUID_KEY,
    MACHINE_GUID_VALUE, NETWORK_ADDRESS_VALUE, NETWORK_CLASS_KEY,
};

const PLAN_PREFIX: &str = "# plan: ";
const RUN_KEY: &str = r"HKCU:\Software\Microsoft\Windows\CurrentVersion\Run";

/// One idempotent undo step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RevertCommand {
    SetValue {
        path: String,
        name: String,
        value: String,
    },
    DeleteValue {
        path: String,
        name: String,
    },
    /// Restore an adapter's address override, resolving its key at run time.
    /// `value: None` removes the override.
    SetAdapterValue {
        stable_id: String,
        name: String,
        value: Option<String>,
    },
    RestoreIp {
        stable_id: String,
        config: IpConfig,
    },
    MarkCompleted {
        marker: PathBuf,
    },
    Unregister {
        name: String,
    },
    RemoveSelf {
        script: PathBuf,
    },
}

impl RevertCommand {
    const fn is_restore(&self) -> bool {
        matches!(
            self,
            Self::SetValue { .. }
                | Self::DeleteValue { .. }
                | Self::SetAdapterValue { .. }
                | Self::RestoreIp { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertPlan {
    pub task_name: String,
    pub settle_delay_ms: u64,
    pub commands: Vec<RevertCommand>,
}

/// What a replay did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub applied: usize,
    pub failures: Vec<String>,
    /// The completion marker was written and the trigger removed.
    pub completed: bool,
}

impl RevertPlan {
    pub fn from_originals(
        originals: &Originals,
        task_name: &str,
        settle_delay: Duration,
        marker: &Path,
        script: &Path,
    ) -> Self {
        let mut commands = Vec::new();

        if let Some(original) = &originals.machine_guid {
            commands.push(match &original.value {
                Some(value) => RevertCommand::SetValue {
                    path: MACHINE_GUID_KEY.to_string(),
                    name: MACHINE_GUID_VALUE.to_string(),
                    value: value.clone(),
                },
                None => RevertCommand::DeleteValue {
                    path: MACHINE_GUID_KEY.to_string(),
                    name: MACHINE_GUID_VALUE.to_string(),
                },
            });
        }
        for (stable_id, original) in &originals.adapter_addresses {
            commands.push(RevertCommand::SetAdapterValue {
                stable_id: stable_id.clone(),
                name: NETWORK_ADDRESS_VALUE.to_string(),
                value: original.value.clone(),
            });
        }
        for (stable_id, original) in &originals.ip_configs {
            commands.push(RevertCommand::RestoreIp {
                stable_id: stable_id.clone(),
                config: original.value.clone(),
            });
        }

        commands.push(RevertCommand::MarkCompleted {
            marker: marker.to_path_buf(),
        });
        commands.push(RevertCommand::Unregister {
            name: task_name.to_string(),
        });
        commands.push(RevertCommand::RemoveSelf {
            script: script.to_path_buf(),
        });

        Self {
            task_name: task_name.to_string(),
            settle_delay_ms: u64::try_from(settle_delay.as_millis()).unwrap_or(u64::MAX),
            commands,
        }
    }

    /// Number of commands that put a value back.
    #[must_use]
    pub fn restore_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_restore()).count()
    }

    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        out.push_str("# idswap boot-time revert\r\n");
        // Writing into a String cannot fail.
        let _ = write!(out, "{PLAN_PREFIX}{}\r\n", serde_json::to_string(self)?);
        out.push_str("$ErrorActionPreference = 'Stop'\r\n$failed = $false\r\n");

        let (restores, tail): (Vec<_>, Vec<_>) =
            self.commands.iter().partition(|c| c.is_restore());
        for command in restores {
            out.push_str("try {\r\n");
            for line in self.render_command(command) {
                let _ = write!(out, "    {line}\r\n");
            }
            out.push_str("} catch { $failed = $true }\r\n");
        }

        out.push_str("if (-not $failed) {\r\n");
        for command in tail {
            for line in self.render_command(command) {
                let _ = write!(out, "    {line}\r\n");
            }
        }
        out.push_str("}\r\n");
        Ok(out)
    }

    fn render_command(&self, command: &RevertCommand) -> Vec<String> {
        match command {
            RevertCommand::SetValue { path, name, value } => vec![format!(
                "Set-ItemProperty -Path 'HKLM:\\{}' -Name '{}' -Value '{}'",
                ps(path),
                ps(name),
                ps(value)
            )],
            RevertCommand::DeleteValue { path, name } => vec![format!(
                "Remove-ItemProperty -Path 'HKLM:\\{}' -Name '{}' -ErrorAction SilentlyContinue",
                ps(path),
                ps(name)
            )],
            RevertCommand::SetAdapterValue {
                stable_id,
                name,
                value,
            } => {
                let id = ps(stable_id);
                let write = match value {
                    Some(value) => format!(
                        "Set-ItemProperty -Path $key.PSPath -Name '{}' -Value '{}'",
                        ps(name),
                        ps(value)
                    ),
                    None => format!(
                        "Remove-ItemProperty -Path $key.PSPath -Name '{}' -ErrorAction SilentlyContinue",
                        ps(name)
                    ),
                };
                vec![
                    format!(
                        "$key = Get-ChildItem 'HKLM:\\{NETWORK_CLASS_KEY}' -ErrorAction SilentlyContinue | \
                         Where-Object {{ (Get-ItemProperty $_.PSPath -ErrorAction SilentlyContinue).{ADAPTER_ID_VALUE} -eq '{id}' }} | \
                         Select-Object -First 1"
                    ),
                    format!("if (-not $key) {{ throw 'adapter {id} not found' }}"),
                    write,
                    format!("$nic = Get-CimInstance Win32_NetworkAdapter -Filter \"GUID='{id}'\""),
                    format!(
                        "if ($nic) {{ Invoke-CimMethod -InputObject $nic -MethodName Disable | Out-Null; \
                         Start-Sleep -Milliseconds {}; \
                         Invoke-CimMethod -InputObject $nic -MethodName Enable | Out-Null }}",
                        self.settle_delay_ms
                    ),
                ]
            }
            RevertCommand::RestoreIp { stable_id, config } => {
                let id = ps(stable_id);
                let mut lines = vec![
                    format!(
                        "$cfg = Get-CimInstance Win32_NetworkAdapterConfiguration -Filter \"SettingID='{id}'\""
                    ),
                    format!("if (-not $cfg) {{ throw 'adapter {id} not found' }}"),
                ];
                match config {
                    IpConfig::Dhcp => {
                        lines.push("Invoke-CimMethod -InputObject $cfg -MethodName EnableDHCP | Out-Null".to_string());
                        lines.push("Invoke-CimMethod -InputObject $cfg -MethodName RenewDHCPLease | Out-Null".to_string());
                    }
                    IpConfig::Static { ip, mask, gateway } => {
                        lines.push(format!(
                            "Invoke-CimMethod -InputObject $cfg -MethodName EnableStatic -Arguments \
                             @{{IPAddress=[string[]]@('{}'); SubnetMask=[string[]]@('{}')}} | Out-Null",
                            ps(ip),
                            ps(mask)
                        ));
                        if let Some(gateway) = gateway {
                            lines.push(format!(
                                "Invoke-CimMethod -InputObject $cfg -MethodName SetGateways -Arguments \
                                 @{{DefaultIPGateway=[string[]]@('{}'); GatewayCostMetric=[uint16[]]@(1)}} | Out-Null",
                                ps(gateway)
                            ));
                        }
                    }
                }
                lines
            }
            RevertCommand::MarkCompleted { marker } => vec![format!(
                "New-Item -ItemType File -Force -Path '{}' | Out-Null",
                ps(&marker.display().to_string())
            )],
            RevertCommand::Unregister { name } => vec![
                format!("schtasks.exe /Delete /TN '{}' /F 2>$null | Out-Null", ps(name)),
                format!(
                    "Remove-ItemProperty -Path '{RUN_KEY}' -Name '{}' -ErrorAction SilentlyContinue",
                    ps(name)
                ),
            ],
            RevertCommand::RemoveSelf { script } => vec![format!(
                "Remove-Item -LiteralPath '{}' -Force -ErrorAction SilentlyContinue",
                ps(&script.display().to_string())
            )],
        }
    }

    /// Recover the plan embedded in a rendered script.
    pub fn from_script(text: &str) -> Result<Self> {
        let line = text
            .lines()
            .find_map(|line| line.strip_prefix(PLAN_PREFIX))
            .ok_or_else(|| IdError::ValidationFailed("revert script has no plan line".to_string()))?;
        serde_json::from_str(line.trim_end())
            .map_err(|err| IdError::ValidationFailed(format!("revert plan is unreadable: {err}")))
    }

    /// Execute the plan against the platform, the way the script would at
    /// boot. Restore failures are collected; the completion steps only run
    /// when every restore succeeded.
    pub fn apply<P: Platform + ?Sized>(&self, platform: &P) -> ApplyReport {
        let mut report = ApplyReport::default();
        for command in self.commands.iter().filter(|c| c.is_restore()) {
            match self.apply_restore(platform, command) {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    warn!(?command, error = %err, "revert step failed");
                    report.failures.push(err.to_string());
                }
            }
        }
        if !report.failures.is_empty() {
            return report;
        }

        for command in self.commands.iter().filter(|c| !c.is_restore()) {
            let result = match command {
                RevertCommand::MarkCompleted { marker } => write_marker(marker),
                RevertCommand::Unregister { name } => platform.unregister(name).map_err(IdError::from),
                RevertCommand::RemoveSelf { script } => remove_if_present(script),
                _ => Ok(()),
            };
            match result {
                Ok(()) => report.applied += 1,
                Err(err) => report.failures.push(err.to_string()),
            }
        }
        report.completed = report.failures.is_empty();
        debug!(applied = report.applied, completed = report.completed, "revert plan replayed");
        report
    }

    fn apply_restore<P: Platform + ?Sized>(
        &self,
        platform: &P,
        command: &RevertCommand,
    ) -> PlatformResult<()> {
        match command {
            RevertCommand::SetValue { path, name, value } => platform.set(path, name, value),
            RevertCommand::DeleteValue { path, name } => platform.delete(path, name),
            RevertCommand::SetAdapterValue {
                stable_id,
                name,
                value,
            } => {
                let path = resolve_adapter_path(platform, NETWORK_CLASS_KEY, stable_id)?;
                match value {
                    Some(value) => platform.set(&path, name, value)?,
                    None => platform.delete(&path, name)?,
                }
                platform.disable(stable_id)?;
                std::thread::sleep(Duration::from_millis(self.settle_delay_ms));
                platform.enable(stable_id)
            }
            RevertCommand::RestoreIp { stable_id, config } => match config {
                IpConfig::Dhcp => platform.enable_dhcp(stable_id),
                IpConfig::Static { ip, mask, gateway } => {
                    platform.set_static_ipv4(stable_id, ip, mask, gateway.as_deref())
                }
            },
            _ => Ok(()),
        }
    }
}

fn ps(value: &str) -> String {
    value.replace('\'', "''")
}

fn write_marker(marker: &Path) -> Result<()> {
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(marker, b"")?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}
