//! In-process platform backend.
//!
//! Models the registry, adapters, startup registrations and privilege of a
//! single machine. Tests drive it directly and inject faults; the
//! `simulated` backend persists its state as JSON so successive CLI runs see
//! the same machine.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    AdapterControl, AdapterInfo, InventoryQuery, KeyValueStore, Platform, PlatformError,
    PlatformResult, PrivilegeProbe, RegistrationKind, SchedulerRegistration, ADAPTER_ID_VALUE,
    CURRENT_VERSION_KEY, MACHINE_GUID_KEY, MACHINE_GUID_VALUE, NETWORK_ADDRESS_VALUE,
    NETWORK_CLASS_KEY,
};
use crate::error::{IdError, Result};
use crate::mutator::address::format_mac;

/// Failure switches for exercising error paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Faults {
    /// Every operation reports `Unavailable`; inventory is empty.
    pub unavailable: bool,
    /// Store writes and deletes are denied.
    pub deny_writes: bool,
    /// `set_static_ipv4` is rejected.
    pub reject_static_ip: bool,
    /// Adapters keep their hardware address whatever the override says.
    pub ignore_address_override: bool,
    /// System startup tasks cannot be created.
    pub deny_system_tasks: bool,
    /// Static and DHCP calls succeed but leave the IP configuration alone.
    pub ignore_ip_changes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryKey {
    display: String,
    values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimAdapter {
    info: AdapterInfo,
    hardware_address: String,
    dhcp_address: String,
    enabled: bool,
    key_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Registration {
    name: String,
    kind: RegistrationKind,
    command: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryState {
    keys: BTreeMap<String, RegistryKey>,
    adapters: Vec<SimAdapter>,
    metadata: BTreeMap<String, String>,
    registrations: Vec<Registration>,
    elevated: bool,
    faults: Faults,
    #[serde(default)]
    control_log: Vec<String>,
}

impl MemoryState {
    fn key_mut(&mut self, path: &str) -> &mut RegistryKey {
        self.keys
            .entry(normalize(path))
            .or_insert_with(|| RegistryKey {
                display: path.to_string(),
                values: BTreeMap::new(),
            })
    }

    fn value(&self, path: &str, name: &str) -> Option<String> {
        self.keys.get(&normalize(path)).and_then(|key| {
            key.values
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        })
    }

    fn adapter_mut(&mut self, stable_id: &str) -> PlatformResult<&mut SimAdapter> {
        self.adapters
            .iter_mut()
            .find(|a| a.info.stable_id.eq_ignore_ascii_case(stable_id))
            .ok_or_else(|| PlatformError::NotFound(format!("adapter {stable_id}")))
    }

    fn require_elevated(&self, what: &str) -> PlatformResult<()> {
        if self.elevated {
            Ok(())
        } else {
            Err(PlatformError::AccessDenied(format!("{what} requires elevation")))
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('\\').to_ascii_lowercase()
}

/// Shared, cloneable handle to one simulated machine.
#[derive(Debug, Clone)]
pub struct MemoryPlatform {
    state: Arc<Mutex<MemoryState>>,
    persist_path: Option<PathBuf>,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform {
    /// An elevated machine with no adapters and no machine id.
    #[must_use]
    pub fn new() -> Self {
        let mut state = MemoryState {
            elevated: true,
            ..MemoryState::default()
        };
        state.key_mut(NETWORK_CLASS_KEY);
        Self {
            state: Arc::new(Mutex::new(state)),
            persist_path: None,
        }
    }

    /// A backend with no platform support at all.
    #[must_use]
    pub fn unavailable() -> Self {
        let platform = Self::new();
        platform.state.lock().faults.unavailable = true;
        platform
    }

    /// A plausible single-adapter machine.
    #[must_use]
    pub fn seeded() -> Self {
        Self::new()
            .with_adapter(
                "{6B29FC40-CA47-1067-B31D-00DD010662DA}",
                "Intel(R) Ethernet Connection I219-V",
                "3C:52:82:4A:19:7E",
            )
            .with_ipv4(
                "{6B29FC40-CA47-1067-B31D-00DD010662DA}",
                "192.168.1.50",
                "255.255.255.0",
                Some("192.168.1.1"),
            )
            .with_dns(
                "{6B29FC40-CA47-1067-B31D-00DD010662DA}",
                &["192.168.1.1", "1.1.1.1"],
            )
            .with_machine_guid(&uuid::Uuid::new_v4().to_string())
            .with_value(CURRENT_VERSION_KEY, "ProductName", "Windows 10 Pro")
            .with_value(CURRENT_VERSION_KEY, "CurrentBuild", "19045")
            .with_value(CURRENT_VERSION_KEY, "InstallDate", "1672531200")
            .with_metadata("BIOS.SerialNumber", "PF2ABCDE")
            .with_metadata("CPU.ProcessorId", "BFEBFBFF000906EA")
            .with_metadata("OS.SerialNumber", "00330-80000-00000-AA123")
            .with_metadata("EFI.Number", "4C4C4544-0038-3510-8052-B4C04F4E3732")
    }

    /// Load a persisted machine, or seed and persist a new one.
    pub fn load_or_seed(path: &Path) -> Result<Self> {
        let platform = if path.exists() {
            let raw = fs::read_to_string(path)?;
            let state: MemoryState = serde_json::from_str(&raw).map_err(|err| {
                IdError::Config(format!("simulated platform state {}: {err}", path.display()))
            })?;
            Self {
                state: Arc::new(Mutex::new(state)),
                persist_path: Some(path.to_path_buf()),
            }
        } else {
            let mut seeded = Self::seeded();
            seeded.persist_path = Some(path.to_path_buf());
            seeded.save()?;
            seeded
        };
        Ok(platform)
    }

    #[must_use]
    pub fn with_adapter(self, stable_id: &str, description: &str, address: &str) -> Self {
        {
            let mut state = self.state.lock();
            let index = state.adapters.len();
            let key_path = format!("{NETWORK_CLASS_KEY}\\{index:04}");
            let key = state.key_mut(&key_path);
            key.values
                .insert(ADAPTER_ID_VALUE.to_string(), stable_id.to_string());
            key.values
                .insert("DriverDesc".to_string(), description.to_string());

            let ip = format!("192.168.1.{}", 50 + index);
            state.adapters.push(SimAdapter {
                info: AdapterInfo {
                    stable_id: stable_id.to_string(),
                    description: description.to_string(),
                    current_address: Some(address.to_string()),
                    ip_addresses: vec![ip.clone()],
                    subnet_mask: Some("255.255.255.0".to_string()),
                    gateway: Some("192.168.1.1".to_string()),
                    dhcp_enabled: true,
                    dns_servers: Vec::new(),
                },
                hardware_address: address.to_string(),
                dhcp_address: ip,
                enabled: true,
                key_path,
            });
        }
        self
    }

    /// Replace an adapter's IP configuration. An empty `ip` removes it.
    #[must_use]
    pub fn with_ipv4(self, stable_id: &str, ip: &str, mask: &str, gateway: Option<&str>) -> Self {
        {
            let mut state = self.state.lock();
            if let Ok(adapter) = state.adapter_mut(stable_id) {
                if ip.is_empty() {
                    adapter.info.ip_addresses.clear();
                    adapter.info.subnet_mask = None;
                } else {
                    adapter.info.ip_addresses = vec![ip.to_string()];
                    adapter.info.subnet_mask = Some(mask.to_string());
                    adapter.dhcp_address = ip.to_string();
                }
                adapter.info.gateway = gateway.map(str::to_string);
            }
        }
        self
    }

    #[must_use]
    pub fn with_dns(self, stable_id: &str, servers: &[&str]) -> Self {
        if let Ok(adapter) = self.state.lock().adapter_mut(stable_id) {
            adapter.info.dns_servers = servers.iter().map(|s| (*s).to_string()).collect();
        }
        self
    }

    #[must_use]
    pub fn with_machine_guid(self, guid: &str) -> Self {
        self.with_value(MACHINE_GUID_KEY, MACHINE_GUID_VALUE, guid)
    }

    #[must_use]
    pub fn with_value(self, path: &str, name: &str, value: &str) -> Self {
        self.state
            .lock()
            .key_mut(path)
            .values
            .insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_metadata(self, key: &str, value: &str) -> Self {
        self.state
            .lock()
            .metadata
            .insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_elevated(self, elevated: bool) -> Self {
        self.set_elevated(elevated);
        self
    }

    #[must_use]
    pub fn with_faults(self, faults: Faults) -> Self {
        self.set_faults(faults);
        self
    }

    pub fn set_elevated(&self, elevated: bool) {
        self.state.lock().elevated = elevated;
    }

    pub fn set_faults(&self, faults: Faults) {
        self.state.lock().faults = faults;
    }

    /// Every adapter, including disabled ones.
    #[must_use]
    pub fn adapter(&self, stable_id: &str) -> Option<AdapterInfo> {
        self.state
            .lock()
            .adapters
            .iter()
            .find(|a| a.info.stable_id.eq_ignore_ascii_case(stable_id))
            .map(|a| a.info.clone())
    }

    /// Registrations for `name`, as `(kind, command)`.
    #[must_use]
    pub fn registrations(&self, name: &str) -> Vec<(RegistrationKind, String)> {
        self.state
            .lock()
            .registrations
            .iter()
            .filter(|r| r.name == name)
            .map(|r| (r.kind, r.command.clone()))
            .collect()
    }

    /// Adapter control calls in order, e.g. `disable GUID-1`.
    #[must_use]
    pub fn control_log(&self) -> Vec<String> {
        self.state.lock().control_log.clone()
    }

    fn read<T>(&self, f: impl FnOnce(&MemoryState) -> PlatformResult<T>) -> PlatformResult<T> {
        let state = self.state.lock();
        if state.faults.unavailable {
            return Err(PlatformError::Unavailable("simulated platform disabled".to_string()));
        }
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut MemoryState) -> PlatformResult<T>) -> PlatformResult<T> {
        let result = {
            let mut state = self.state.lock();
            if state.faults.unavailable {
                return Err(PlatformError::Unavailable("simulated platform disabled".to_string()));
            }
            f(&mut state)
        };
        if result.is_ok() {
            if let Err(err) = self.save() {
                warn!(error = %err, "failed to persist simulated platform state");
            }
        }
        result
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&*self.state.lock())?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl KeyValueStore for MemoryPlatform {
    fn get(&self, path: &str, name: &str) -> PlatformResult<Option<String>> {
        self.read(|state| Ok(state.value(path, name)))
    }

    fn set(&self, path: &str, name: &str, value: &str) -> PlatformResult<()> {
        self.write(|state| {
            state.require_elevated(path)?;
            if state.faults.deny_writes {
                return Err(PlatformError::AccessDenied(format!("{path}\\{name}")));
            }
            let key = state.key_mut(path);
            key.values.retain(|k, _| !k.eq_ignore_ascii_case(name));
            key.values.insert(name.to_string(), value.to_string());
            Ok(())
        })
    }

    fn delete(&self, path: &str, name: &str) -> PlatformResult<()> {
        self.write(|state| {
            state.require_elevated(path)?;
            if state.faults.deny_writes {
                return Err(PlatformError::AccessDenied(format!("{path}\\{name}")));
            }
            if let Some(key) = state.keys.get_mut(&normalize(path)) {
                key.values.retain(|k, _| !k.eq_ignore_ascii_case(name));
            }
            Ok(())
        })
    }

    fn list_children(&self, path: &str) -> PlatformResult<Vec<String>> {
        self.read(|state| {
            let parent = normalize(path);
            if !state.keys.contains_key(&parent) {
                return Err(PlatformError::NotFound(path.to_string()));
            }
            let prefix = format!("{parent}\\");
            Ok(state
                .keys
                .iter()
                .filter_map(|(norm, key)| {
                    let rest = norm.strip_prefix(&prefix)?;
                    if rest.contains('\\') {
                        return None;
                    }
                    key.display.rsplit('\\').next().map(str::to_string)
                })
                .collect())
        })
    }
}

impl InventoryQuery for MemoryPlatform {
    fn list_active_adapters(&self) -> PlatformResult<Vec<AdapterInfo>> {
        let state = self.state.lock();
        if state.faults.unavailable {
            return Ok(Vec::new());
        }
        Ok(state
            .adapters
            .iter()
            .filter(|a| a.enabled && !a.info.ip_addresses.is_empty())
            .map(|a| a.info.clone())
            .collect())
    }

    fn read_machine_metadata(&self) -> PlatformResult<BTreeMap<String, String>> {
        let state = self.state.lock();
        if state.faults.unavailable {
            return Ok(BTreeMap::new());
        }
        Ok(state.metadata.clone())
    }
}

impl AdapterControl for MemoryPlatform {
    fn disable(&self, stable_id: &str) -> PlatformResult<()> {
        self.write(|state| {
            state.require_elevated("adapter disable")?;
            state.adapter_mut(stable_id)?.enabled = false;
            state.control_log.push(format!("disable {stable_id}"));
            Ok(())
        })
    }

    fn enable(&self, stable_id: &str) -> PlatformResult<()> {
        self.write(|state| {
            state.require_elevated("adapter enable")?;
            let ignore_override = state.faults.ignore_address_override;
            let key_path = state.adapter_mut(stable_id)?.key_path.clone();
            let override_value = state.value(&key_path, NETWORK_ADDRESS_VALUE);

            let adapter = state.adapter_mut(stable_id)?;
            adapter.enabled = true;
            adapter.info.current_address = match override_value.as_deref().and_then(format_mac) {
                Some(address) if !ignore_override => Some(address),
                _ => Some(adapter.hardware_address.clone()),
            };
            state.control_log.push(format!("enable {stable_id}"));
            Ok(())
        })
    }

    fn set_static_ipv4(
        &self,
        stable_id: &str,
        ip: &str,
        mask: &str,
        gateway: Option<&str>,
    ) -> PlatformResult<()> {
        self.write(|state| {
            state.require_elevated("static address assignment")?;
            if state.faults.reject_static_ip {
                return Err(PlatformError::Rejected(format!("EnableStatic {ip} on {stable_id}")));
            }
            let ignore = state.faults.ignore_ip_changes;
            let adapter = state.adapter_mut(stable_id)?;
            if !ignore {
                // EnableStatic drops the DNS search order.
                adapter.info.dns_servers.clear();
                adapter.info.ip_addresses = vec![ip.to_string()];
                adapter.info.subnet_mask = Some(mask.to_string());
                if let Some(gateway) = gateway {
                    adapter.info.gateway = Some(gateway.to_string());
                }
                adapter.info.dhcp_enabled = false;
            }
            state.control_log.push(format!("static {stable_id} {ip}"));
            Ok(())
        })
    }

    fn enable_dhcp(&self, stable_id: &str) -> PlatformResult<()> {
        self.write(|state| {
            state.require_elevated("DHCP renewal")?;
            let ignore = state.faults.ignore_ip_changes;
            let adapter = state.adapter_mut(stable_id)?;
            if !ignore {
                adapter.info.dhcp_enabled = true;
                adapter.info.ip_addresses = vec![adapter.dhcp_address.clone()];
                if adapter.info.subnet_mask.is_none() {
                    adapter.info.subnet_mask = Some("255.255.255.0".to_string());
                }
            }
            state.control_log.push(format!("dhcp {stable_id}"));
            Ok(())
        })
    }

    fn set_dns_servers(&self, stable_id: &str, servers: &[String]) -> PlatformResult<()> {
        self.write(|state| {
            state.require_elevated("DNS server assignment")?;
            state.adapter_mut(stable_id)?.info.dns_servers = servers.to_vec();
            state.control_log.push(format!("dns {stable_id}"));
            Ok(())
        })
    }
}

impl PrivilegeProbe for MemoryPlatform {
    fn is_elevated(&self) -> bool {
        let state = self.state.lock();
        state.elevated && !state.faults.unavailable
    }
}

impl SchedulerRegistration for MemoryPlatform {
    fn register_system_task(&self, name: &str, command: &str) -> PlatformResult<()> {
        self.write(|state| {
            state.require_elevated("system startup task")?;
            if state.faults.deny_system_tasks {
                return Err(PlatformError::AccessDenied(format!("task {name}")));
            }
            upsert_registration(state, name, RegistrationKind::SystemTask, command);
            Ok(())
        })
    }

    fn register_user_autorun(&self, name: &str, command: &str) -> PlatformResult<()> {
        self.write(|state| {
            upsert_registration(state, name, RegistrationKind::UserAutorun, command);
            Ok(())
        })
    }

    fn unregister(&self, name: &str) -> PlatformResult<()> {
        self.write(|state| {
            state.registrations.retain(|r| r.name != name);
            debug!(name, "registrations removed");
            Ok(())
        })
    }

    fn query(&self, name: &str) -> PlatformResult<Option<RegistrationKind>> {
        self.read(|state| {
            let kinds: Vec<_> = state
                .registrations
                .iter()
                .filter(|r| r.name == name)
                .map(|r| r.kind)
                .collect();
            Ok(kinds
                .iter()
                .copied()
                .find(|k| *k == RegistrationKind::SystemTask)
                .or_else(|| kinds.first().copied()))
        })
    }
}

fn upsert_registration(state: &mut MemoryState, name: &str, kind: RegistrationKind, command: &str) {
    state.registrations.retain(|r| !(r.name == name && r.kind == kind));
    state.registrations.push(Registration {
        name: name.to_string(),
        kind,
        command: command.to_string(),
    });
}

impl Platform for MemoryPlatform {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn is_available(&self) -> bool {
        !self.state.lock().faults.unavailable
    }
}
