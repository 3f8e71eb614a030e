//! Windows backend built on the stock command-line tools.
//!
//! Registry access goes through `reg.exe`, inventory and adapter control
//! through PowerShell CIM cmdlets, startup tasks through `schtasks.exe`.
//! Tool discovery uses `which`, so on other hosts [`WindowsPlatform::detect`]
//! fails cleanly instead of spawning missing binaries.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, trace};

use super::{
    AdapterControl, AdapterInfo, InventoryQuery, KeyValueStore, Platform, PlatformError,
    PlatformResult, PrivilegeProbe, RegistrationKind, SchedulerRegistration,
};
use crate::mutator::address::format_mac;

const HKLM: &str = "HKLM";
const RUN_KEY: &str = r"HKCU\Software\Microsoft\Windows\CurrentVersion\Run";

#[derive(Debug, Clone)]
pub struct WindowsPlatform {
    reg: PathBuf,
    powershell: PathBuf,
    schtasks: PathBuf,
    net: PathBuf,
}

impl WindowsPlatform {
    /// Locate the required system tools.
    pub fn detect() -> PlatformResult<Self> {
        if !cfg!(windows) {
            return Err(PlatformError::Unavailable(
                "the windows backend only runs on Windows".to_string(),
            ));
        }
        let find = |name: &str| {
            which::which(name)
                .map_err(|err| PlatformError::Unavailable(format!("{name} not found: {err}")))
        };
        Ok(Self {
            reg: find("reg.exe")?,
            powershell: find("powershell.exe")?,
            schtasks: find("schtasks.exe")?,
            net: find("net.exe")?,
        })
    }

    fn run(&self, program: &PathBuf, args: &[&str]) -> PlatformResult<String> {
        trace!(program = %program.display(), ?args, "spawning");
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| {
                PlatformError::Unavailable(format!("failed to run {}: {err}", program.display()))
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Err(classify(&message))
        }
    }

    fn powershell(&self, script: &str) -> PlatformResult<String> {
        self.run(
            &self.powershell,
            &["-NoProfile", "-NonInteractive", "-Command", script],
        )
    }

    fn cim_method(&self, stable_id: &str, method: &str, arguments: Option<&str>) -> PlatformResult<()> {
        let args = arguments.map_or_else(String::new, |a| format!(" -Arguments {a}"));
        let script = format!(
            "$a = Get-CimInstance Win32_NetworkAdapterConfiguration -Filter \"SettingID='{id}'\"; \
             if (-not $a) {{ throw 'cannot find adapter {id}' }}; \
             $r = Invoke-CimMethod -InputObject $a -MethodName {method}{args}; \
             if ($r.ReturnValue -gt 1) {{ throw \"{method} returned $($r.ReturnValue)\" }}",
            id = escape_ps(stable_id),
        );
        self.powershell(&script).map(drop)
    }

    fn adapter_power(&self, stable_id: &str, method: &str) -> PlatformResult<()> {
        let script = format!(
            "$n = Get-CimInstance Win32_NetworkAdapter -Filter \"GUID='{id}'\"; \
             if (-not $n) {{ throw 'cannot find adapter {id}' }}; \
             Invoke-CimMethod -InputObject $n -MethodName {method} | Out-Null",
            id = escape_ps(stable_id),
        );
        self.powershell(&script).map(drop)
    }

    fn query_json<T: for<'de> Deserialize<'de>>(&self, script: &str) -> PlatformResult<Vec<T>> {
        let raw = self.powershell(&format!("{script} | ConvertTo-Json -Compress"))?;
        parse_json_list(&raw)
    }
}

fn hklm(path: &str) -> String {
    format!("{HKLM}\\{path}")
}

fn escape_ps(value: &str) -> String {
    value.replace('\'', "''")
}

fn classify(message: &str) -> PlatformError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("access is denied") || lower.contains("access denied") {
        PlatformError::AccessDenied(message.to_string())
    } else if lower.contains("unable to find") || lower.contains("cannot find") {
        PlatformError::NotFound(message.to_string())
    } else {
        PlatformError::Rejected(message.to_string())
    }
}

/// `ConvertTo-Json` emits a bare object for one result and nothing for none.
fn parse_json_list<T: for<'de> Deserialize<'de>>(raw: &str) -> PlatformResult<Vec<T>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| PlatformError::Rejected(format!("unparseable inventory: {err}")))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|err| PlatformError::Rejected(format!("unexpected inventory shape: {err}")))
        })
        .collect()
}

/// Value lines of `reg query` look like `    Name    REG_SZ    data`.
fn parse_reg_value(output: &str, name: &str) -> Option<String> {
    static LINE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = LINE
        .get_or_init(|| {
            Regex::new(r"^\s*(?P<name>\S.*?)\s{2,}REG_[A-Z_]+(?:\s{2,}(?P<data>.*?))?\s*$").ok()
        })
        .as_ref()?;
    output.lines().find_map(|line| {
        let caps = re.captures(line)?;
        if !caps["name"].eq_ignore_ascii_case(name) {
            return None;
        }
        Some(caps.name("data").map_or("", |m| m.as_str()).to_string())
    })
}

fn parse_reg_children(output: &str, parent: &str) -> Vec<String> {
    let prefix = format!("{}\\", parent.to_ascii_lowercase());
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.to_ascii_lowercase().starts_with(&prefix))
        .filter_map(|line| line.rsplit('\\').next().map(str::to_string))
        .collect()
}

#[derive(Debug, Deserialize)]
struct AdapterConfigRow {
    #[serde(rename = "SettingID")]
    setting_id: String,
    #[serde(rename = "Description", default)]
    description: Option<String>,
    #[serde(rename = "MACAddress", default)]
    mac_address: Option<String>,
    #[serde(rename = "IPAddress", default)]
    ip_address: Option<Vec<String>>,
    #[serde(rename = "IPSubnet", default)]
    ip_subnet: Option<Vec<String>>,
    #[serde(rename = "DefaultIPGateway", default)]
    default_gateway: Option<Vec<String>>,
    #[serde(rename = "DHCPEnabled", default)]
    dhcp_enabled: Option<bool>,
    #[serde(rename = "DNSServerSearchOrder", default)]
    dns_servers: Option<Vec<String>>,
}

impl From<AdapterConfigRow> for AdapterInfo {
    fn from(row: AdapterConfigRow) -> Self {
        let ipv4 = |values: Option<Vec<String>>| -> Vec<String> {
            values
                .unwrap_or_default()
                .into_iter()
                .filter(|v| v.parse::<std::net::Ipv4Addr>().is_ok())
                .collect()
        };
        let ip_addresses = ipv4(row.ip_address);
        Self {
            stable_id: row.setting_id,
            description: row.description.unwrap_or_default(),
            current_address: row.mac_address.as_deref().and_then(format_mac),
            ip_addresses,
            subnet_mask: ipv4(row.ip_subnet).into_iter().next(),
            gateway: ipv4(row.default_gateway).into_iter().next(),
            dhcp_enabled: row.dhcp_enabled.unwrap_or(false),
            dns_servers: ipv4(row.dns_servers),
        }
    }
}

impl KeyValueStore for WindowsPlatform {
    fn get(&self, path: &str, name: &str) -> PlatformResult<Option<String>> {
        match self.run(&self.reg, &["query", &hklm(path), "/v", name]) {
            Ok(output) => Ok(parse_reg_value(&output, name)),
            Err(PlatformError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn set(&self, path: &str, name: &str, value: &str) -> PlatformResult<()> {
        self.run(
            &self.reg,
            &["add", &hklm(path), "/v", name, "/t", "REG_SZ", "/d", value, "/f"],
        )
        .map(drop)
    }

    fn delete(&self, path: &str, name: &str) -> PlatformResult<()> {
        match self.run(&self.reg, &["delete", &hklm(path), "/v", name, "/f"]) {
            Ok(_) | Err(PlatformError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn list_children(&self, path: &str) -> PlatformResult<Vec<String>> {
        let full = hklm(path);
        let output = self.run(&self.reg, &["query", &full])?;
        Ok(parse_reg_children(&output, &full))
    }
}

impl InventoryQuery for WindowsPlatform {
    fn list_active_adapters(&self) -> PlatformResult<Vec<AdapterInfo>> {
        let rows: Vec<AdapterConfigRow> = self.query_json(
            "Get-CimInstance Win32_NetworkAdapterConfiguration -Filter IPEnabled=True | \
             Select-Object SettingID,Description,MACAddress,IPAddress,IPSubnet,DefaultIPGateway,DHCPEnabled,DNSServerSearchOrder",
        )?;
        debug!(count = rows.len(), "adapters enumerated");
        Ok(rows.into_iter().map(AdapterInfo::from).collect())
    }

    fn read_machine_metadata(&self) -> PlatformResult<BTreeMap<String, String>> {
        let queries = [
            ("BIOS", "Win32_BIOS", &["SerialNumber", "Manufacturer", "SMBIOSBIOSVersion"][..]),
            ("CPU", "Win32_Processor", &["ProcessorId", "Name"][..]),
            ("OS", "Win32_OperatingSystem", &["SerialNumber", "Caption", "Version"][..]),
        ];
        let mut metadata = BTreeMap::new();
        for (prefix, class, fields) in queries {
            let script = format!(
                "Get-CimInstance {class} | Select-Object -First 1 {}",
                fields.join(",")
            );
            let rows: Vec<BTreeMap<String, serde_json::Value>> = match self.query_json(&script) {
                Ok(rows) => rows,
                Err(err) => {
                    debug!(class, error = %err, "metadata query failed");
                    continue;
                }
            };
            for row in rows {
                for (field, value) in row {
                    let text = match value {
                        serde_json::Value::String(s) => s.trim().to_string(),
                        serde_json::Value::Null => continue,
                        other => other.to_string(),
                    };
                    metadata.insert(format!("{prefix}.{field}"), text);
                }
            }
        }
        Ok(metadata)
    }
}

impl AdapterControl for WindowsPlatform {
    fn disable(&self, stable_id: &str) -> PlatformResult<()> {
        self.adapter_power(stable_id, "Disable")
    }

    fn enable(&self, stable_id: &str) -> PlatformResult<()> {
        self.adapter_power(stable_id, "Enable")
    }

    fn set_static_ipv4(
        &self,
        stable_id: &str,
        ip: &str,
        mask: &str,
        gateway: Option<&str>,
    ) -> PlatformResult<()> {
        let arguments = format!(
            "@{{IPAddress=[string[]]@('{}'); SubnetMask=[string[]]@('{}')}}",
            escape_ps(ip),
            escape_ps(mask)
        );
        self.cim_method(stable_id, "EnableStatic", Some(&arguments))?;
        if let Some(gateway) = gateway {
            let arguments = format!(
                "@{{DefaultIPGateway=[string[]]@('{}'); GatewayCostMetric=[uint16[]]@(1)}}",
                escape_ps(gateway)
            );
            self.cim_method(stable_id, "SetGateways", Some(&arguments))?;
        }
        Ok(())
    }

    fn enable_dhcp(&self, stable_id: &str) -> PlatformResult<()> {
        self.cim_method(stable_id, "EnableDHCP", None)?;
        self.cim_method(stable_id, "RenewDHCPLease", None)
    }

    fn set_dns_servers(&self, stable_id: &str, servers: &[String]) -> PlatformResult<()> {
        let list = servers
            .iter()
            .map(|server| format!("'{}'", escape_ps(server)))
            .collect::<Vec<_>>()
            .join(",");
        let arguments = format!("@{{DNSServerSearchOrder=[string[]]@({list})}}");
        self.cim_method(stable_id, "SetDNSServerSearchOrder", Some(&arguments))
    }
}

impl PrivilegeProbe for WindowsPlatform {
    fn is_elevated(&self) -> bool {
        self.run(&self.net, &["session"]).is_ok()
    }
}

impl SchedulerRegistration for WindowsPlatform {
    fn register_system_task(&self, name: &str, command: &str) -> PlatformResult<()> {
        self.run(
            &self.schtasks,
            &[
                "/Create", "/TN", name, "/TR", command, "/SC", "ONSTART", "/RU", "SYSTEM", "/RL",
                "HIGHEST", "/F",
            ],
        )
        .map(drop)
    }

    fn register_user_autorun(&self, name: &str, command: &str) -> PlatformResult<()> {
        self.run(
            &self.reg,
            &["add", RUN_KEY, "/v", name, "/t", "REG_SZ", "/d", command, "/f"],
        )
        .map(drop)
    }

    fn unregister(&self, name: &str) -> PlatformResult<()> {
        match self.run(&self.schtasks, &["/Delete", "/TN", name, "/F"]) {
            Ok(_) | Err(PlatformError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        match self.run(&self.reg, &["delete", RUN_KEY, "/v", name, "/f"]) {
            Ok(_) | Err(PlatformError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn query(&self, name: &str) -> PlatformResult<Option<RegistrationKind>> {
        match self.run(&self.schtasks, &["/Query", "/TN", name]) {
            Ok(_) => return Ok(Some(RegistrationKind::SystemTask)),
            Err(PlatformError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        match self.run(&self.reg, &["query", RUN_KEY, "/v", name]) {
            Ok(output) if parse_reg_value(&output, name).is_some() => {
                Ok(Some(RegistrationKind::UserAutorun))
            }
            Ok(_) | Err(PlatformError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reg_value() {
        let output = "\r\nHKEY_LOCAL_MACHINE\\SOFTWARE\\Microsoft\\Cryptography\r\n    \
                      MachineGuid    REG_SZ    0f1e2d3c-aaaa-bbbb-cccc-123456789abc\r\n\r\n";
        assert_eq!(
            parse_reg_value(output, "machineguid").as_deref(),
            Some("0f1e2d3c-aaaa-bbbb-cccc-123456789abc")
        );
        assert_eq!(parse_reg_value(output, "Other"), None);
    }

    #[test]
    fn test_parse_reg_children() {
        let parent = r"HKLM\SYSTEM\Class\{x}";
        let output = "\r\nHKEY_LOCAL_MACHINE\\SYSTEM\\Class\\{x}\r\n    Class    REG_SZ    Net\r\n\
                      HKLM\\SYSTEM\\Class\\{x}\\0000\r\nHKLM\\SYSTEM\\Class\\{x}\\0001\r\n";
        assert_eq!(parse_reg_children(output, parent), vec!["0000", "0001"]);
    }

    #[test]
    fn test_classify_messages() {
        assert!(matches!(
            classify("ERROR: Access is denied."),
            PlatformError::AccessDenied(_)
        ));
        assert!(matches!(
            classify("ERROR: The system was unable to find the specified registry key or value."),
            PlatformError::NotFound(_)
        ));
        assert!(matches!(classify("something else"), PlatformError::Rejected(_)));
    }

    #[test]
    fn test_parse_single_adapter_object() {
        let raw = r#"{"SettingID":"{ABC}","Description":"Ethernet","MACAddress":"3c:52:82:4a:19:7e",
            "IPAddress":["192.168.1.50","fe80::1"],"IPSubnet":["255.255.255.0","64"],
            "DefaultIPGateway":["192.168.1.1"],"DHCPEnabled":true,
            "DNSServerSearchOrder":["192.168.1.1","fec0:0:0:ffff::1"]}"#;
        let rows: Vec<AdapterConfigRow> = parse_json_list(raw).unwrap();
        let info = AdapterInfo::from(rows.into_iter().next().unwrap());
        assert_eq!(info.stable_id, "{ABC}");
        assert_eq!(info.current_address.as_deref(), Some("3C:52:82:4A:19:7E"));
        assert_eq!(info.ip_addresses, vec!["192.168.1.50"]);
        assert_eq!(info.subnet_mask.as_deref(), Some("255.255.255.0"));
        assert_eq!(info.gateway.as_deref(), Some("192.168.1.1"));
        assert!(info.dhcp_enabled);
        assert_eq!(info.dns_servers, vec!["192.168.1.1"]);
    }

    #[test]
    fn test_parse_empty_inventory() {
        let rows: Vec<AdapterConfigRow> = parse_json_list("  ").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_escape_ps() {
        assert_eq!(escape_ps("it's"), "it''s");
    }

    #[cfg(not(windows))]
    #[test]
    fn test_detect_fails_off_windows() {
        assert!(matches!(
            WindowsPlatform::detect(),
            Err(PlatformError::Unavailable(_))
        ));
    }
}
