//! OS-facing seams.
//!
//! The mutator never touches the OS directly. It goes through these traits:
//! a hierarchical key/value store, read-only inventory, adapter control,
//! a privilege check and startup-trigger registration. [`Platform`] bundles
//! them so the orchestrator can own one boxed backend.

pub mod memory;
pub mod windows;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Backend, Config};
use crate::error::{IdError, Result};

pub use memory::{Faults, MemoryPlatform};
pub use windows::WindowsPlatform;

/// Container whose children are the per-adapter configuration keys.
pub const NETWORK_CLASS_KEY: &str =
    r"SYSTEM\CurrentControlSet\Control\Class\{4d36e972-e325-11ce-bfc1-08002be10318}";
/// Field inside each adapter key holding its stable id.
pub const ADAPTER_ID_VALUE: &str = "NetCfgInstanceId";
/// Field inside each adapter key overriding the hardware address.
pub const NETWORK_ADDRESS_VALUE: &str = "NetworkAddress";
pub const MACHINE_GUID_KEY: &str = r"SOFTWARE\Microsoft\Cryptography";
pub const MACHINE_GUID_VALUE: &str = "MachineGuid";
pub const CURRENT_VERSION_KEY: &str = r"SOFTWARE\Microsoft\Windows NT\CurrentVersion";

/// Registry values captured as a baseline before every backup.
pub const BASELINE_VALUES: [(&str, &str); 4] = [
    (MACHINE_GUID_KEY, MACHINE_GUID_VALUE),
    (CURRENT_VERSION_KEY, "ProductName"),
    (CURRENT_VERSION_KEY, "CurrentBuild"),
    (CURRENT_VERSION_KEY, "InstallDate"),
];

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PlatformError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("platform unavailable: {0}")]
    Unavailable(String),
    #[error("rejected by platform: {0}")]
    Rejected(String),
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

impl From<PlatformError> for IdError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::NotFound(what) => Self::ResourceNotFound(what),
            PlatformError::AccessDenied(what) => Self::PermissionDenied(what),
            PlatformError::Unavailable(what) => Self::PlatformUnavailable(what),
            PlatformError::Rejected(what) => {
                Self::PlatformUnavailable(format!("rejected by platform: {what}"))
            }
        }
    }
}

/// A network adapter as reported by inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterInfo {
    /// GUID-like id that survives reboots and driver reloads.
    pub stable_id: String,
    pub description: String,
    /// Colon-separated uppercase hex, e.g. `AA:BB:CC:11:22:33`.
    pub current_address: Option<String>,
    pub ip_addresses: Vec<String>,
    pub subnet_mask: Option<String>,
    pub gateway: Option<String>,
    pub dhcp_enabled: bool,
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationKind {
    /// System-level startup task; runs without a user session.
    SystemTask,
    /// Per-user auto-run entry; runs at that user's next logon.
    UserAutorun,
}

/// Hierarchical key/value namespace with enumerable children.
pub trait KeyValueStore {
    fn get(&self, path: &str, name: &str) -> PlatformResult<Option<String>>;
    fn set(&self, path: &str, name: &str, value: &str) -> PlatformResult<()>;
    /// Deleting an absent value succeeds.
    fn delete(&self, path: &str, name: &str) -> PlatformResult<()>;
    fn list_children(&self, path: &str) -> PlatformResult<Vec<String>>;
}

/// Read-only hardware and adapter enumeration.
///
/// Both calls may return empty collections where the platform cannot answer.
pub trait InventoryQuery {
    fn list_active_adapters(&self) -> PlatformResult<Vec<AdapterInfo>>;
    fn read_machine_metadata(&self) -> PlatformResult<BTreeMap<String, String>>;
}

pub trait AdapterControl {
    fn disable(&self, stable_id: &str) -> PlatformResult<()>;
    fn enable(&self, stable_id: &str) -> PlatformResult<()>;
    fn set_static_ipv4(
        &self,
        stable_id: &str,
        ip: &str,
        mask: &str,
        gateway: Option<&str>,
    ) -> PlatformResult<()>;
    /// Switch to DHCP and renew the lease.
    fn enable_dhcp(&self, stable_id: &str) -> PlatformResult<()>;
    /// Replace the adapter's DNS server search order.
    fn set_dns_servers(&self, stable_id: &str, servers: &[String]) -> PlatformResult<()>;
}

pub trait PrivilegeProbe {
    fn is_elevated(&self) -> bool;
}

pub trait SchedulerRegistration {
    /// Create or overwrite a system startup task.
    fn register_system_task(&self, name: &str, command: &str) -> PlatformResult<()>;
    /// Create or overwrite a per-user auto-run entry.
    fn register_user_autorun(&self, name: &str, command: &str) -> PlatformResult<()>;
    /// Remove `name` from both mechanisms. Absent registrations are not an error.
    fn unregister(&self, name: &str) -> PlatformResult<()>;
    fn query(&self, name: &str) -> PlatformResult<Option<RegistrationKind>>;
}

/// Everything the orchestrator needs from the OS.
pub trait Platform:
    KeyValueStore + InventoryQuery + AdapterControl + PrivilegeProbe + SchedulerRegistration + Send
{
    fn name(&self) -> &'static str;

    /// `false` when the backend cannot reach the OS at all. Inventory then
    /// comes back empty rather than failing.
    fn is_available(&self) -> bool {
        true
    }
}

/// Map a stable adapter id to its configuration key by scanning the
/// container's children. Children that cannot be read are skipped.
pub fn resolve_adapter_path<S: KeyValueStore + ?Sized>(
    store: &S,
    container: &str,
    stable_id: &str,
) -> PlatformResult<String> {
    for child in store.list_children(container)? {
        let path = format!("{container}\\{child}");
        match store.get(&path, ADAPTER_ID_VALUE) {
            Ok(Some(id)) if id.eq_ignore_ascii_case(stable_id) => {
                debug!(stable_id, path = %path, "resolved adapter key");
                return Ok(path);
            }
            Ok(_) => {}
            Err(err) => debug!(path = %path, error = %err, "skipping unreadable adapter key"),
        }
    }
    Err(PlatformError::NotFound(format!("adapter key for {stable_id}")))
}

/// Build the platform backend selected by `config`.
///
/// `auto` picks the Windows tooling when present. Elsewhere it yields a
/// backend that reports itself unavailable for every operation.
pub fn from_config(config: &Config, root: &Path) -> Result<Box<dyn Platform>> {
    match config.platform.backend {
        Backend::Windows => Ok(Box::new(WindowsPlatform::detect()?)),
        Backend::Simulated => Ok(Box::new(MemoryPlatform::load_or_seed(
            &root.join("simulated_platform.json"),
        )?)),
        Backend::Auto => match WindowsPlatform::detect() {
            Ok(platform) => Ok(Box::new(platform)),
            Err(err) => {
                warn!(error = %err, "no supported platform backend; operations will report unavailable");
                Ok(Box::new(MemoryPlatform::unavailable()))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_adapters() -> MemoryPlatform {
        MemoryPlatform::new()
            .with_adapter("{AAAA-1}", "Ethernet", "AA:BB:CC:11:22:33")
            .with_adapter("GUID-1", "Wi-Fi", "AA:BB:CC:44:55:66")
    }

    #[test]
    fn test_resolve_adapter_path_matches_case_insensitively() {
        let platform = store_with_adapters();
        let path = resolve_adapter_path(&platform, NETWORK_CLASS_KEY, "guid-1").unwrap();
        assert!(path.starts_with(NETWORK_CLASS_KEY));
        assert_eq!(
            platform.get(&path, ADAPTER_ID_VALUE).unwrap().as_deref(),
            Some("GUID-1")
        );
    }

    #[test]
    fn test_resolve_adapter_path_not_found() {
        let platform = store_with_adapters();
        let err = resolve_adapter_path(&platform, NETWORK_CLASS_KEY, "GUID-404").unwrap_err();
        assert!(matches!(err, PlatformError::NotFound(_)));
    }

    #[test]
    fn test_resolve_does_not_depend_on_child_order() {
        let platform = MemoryPlatform::new()
            .with_adapter("GUID-B", "second", "AA:BB:CC:00:00:02")
            .with_adapter("GUID-A", "first", "AA:BB:CC:00:00:01");
        let a = resolve_adapter_path(&platform, NETWORK_CLASS_KEY, "GUID-A").unwrap();
        let b = resolve_adapter_path(&platform, NETWORK_CLASS_KEY, "GUID-B").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_platform_error_mapping() {
        assert!(matches!(
            IdError::from(PlatformError::AccessDenied("x".into())),
            IdError::PermissionDenied(_)
        ));
        assert!(matches!(
            IdError::from(PlatformError::NotFound("x".into())),
            IdError::ResourceNotFound(_)
        ));
        assert!(matches!(
            IdError::from(PlatformError::Unavailable("x".into())),
            IdError::PlatformUnavailable(_)
        ));
    }
}
