//! Identifier mutation.
//!
//! Every class follows the same sequence: resolve the live resource, read its
//! current value, journal the original and intended value, write, verify by
//! reading back, report. Failures come back inside [`MutationOutcome`]; the
//! mutator never aborts a batch.

pub mod address;
pub mod overrides;

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::MAX_SETTLE_DELAY;
use crate::error::{IdError, Result, StructuredError};
use crate::platform::{
    resolve_adapter_path, AdapterInfo, Platform, PlatformError, MACHINE_GUID_KEY,
    MACHINE_GUID_VALUE, NETWORK_ADDRESS_VALUE, NETWORK_CLASS_KEY,
};
use crate::storage::{MutationEntry, MutationIntent, MutationJournal, RegistryChange, Settings};
use crate::worker::CancelToken;

/// Settings key: original machine id, as `Original<Option<String>>`.
pub const ORIGINAL_MACHINE_GUID: &str = "original_machine_guid";
/// Settings key: stable id -> original raw address override.
pub const MAC_ORIGINAL_VALUES: &str = "mac_original_values";
/// Settings key: stable id -> original IP configuration.
pub const IP_ORIGINAL_CONFIGS: &str = "ip_original_configs";
/// Settings key: field -> reporting override.
pub const SPOOF_OVERRIDES: &str = "spoof_overrides";
pub const SPOOF_MODE: &str = "spoof_mode";

pub const RESTORE_CATEGORY: &str = "restore";
/// Recorded after an IP mutation fell back to a lease renewal.
pub const DHCP_RENEWED: &str = "DHCP renewed";

/// Whether mutations revert themselves at the next boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpoofMode {
    #[default]
    Ephemeral,
    Permanent,
}

impl fmt::Display for SpoofMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ephemeral => write!(f, "ephemeral"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

impl FromStr for SpoofMode {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ephemeral" | "temp" | "temporary" => Ok(Self::Ephemeral),
            "permanent" | "perm" => Ok(Self::Permanent),
            other => Err(IdError::ValidationFailed(format!("unknown mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "class", content = "field", rename_all = "snake_case")]
pub enum IdentifierClass {
    AdapterAddress,
    MachineId,
    NetworkAddress,
    /// Carries the canonical override field name.
    ReportingOverride(String),
}

impl IdentifierClass {
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::AdapterAddress => "adapter_address",
            Self::MachineId => "machine_id",
            Self::NetworkAddress => "network_address",
            Self::ReportingOverride(_) => "reporting_override",
        }
    }

    #[must_use]
    pub fn item(&self) -> &str {
        match self {
            Self::AdapterAddress => "mac_address",
            Self::MachineId => "machine_guid",
            Self::NetworkAddress => "ip_address",
            Self::ReportingOverride(field) => field,
        }
    }

    const fn needs_elevation(&self) -> bool {
        !matches!(self, Self::ReportingOverride(_))
    }
}

impl fmt::Display for IdentifierClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdapterAddress => write!(f, "adapter-address"),
            Self::MachineId => write!(f, "machine-id"),
            Self::NetworkAddress => write!(f, "network-address"),
            Self::ReportingOverride(field) => write!(f, "override:{field}"),
        }
    }
}

impl FromStr for IdentifierClass {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(field) = s.strip_prefix("override:") {
            return Ok(Self::ReportingOverride(
                overrides::canonical_field(field)?.to_string(),
            ));
        }
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "mac" | "adapter-address" => Ok(Self::AdapterAddress),
            "guid" | "machine-id" | "machine-guid" => Ok(Self::MachineId),
            "ip" | "network-address" => Ok(Self::NetworkAddress),
            _ => overrides::canonical_field(s)
                .map(|field| Self::ReportingOverride(field.to_string()))
                .map_err(|_| {
                    IdError::ValidationFailed(format!(
                        "unknown identifier class '{s}' (mac, guid, ip, override:<FIELD>)"
                    ))
                }),
        }
    }
}

/// Per-call knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOptions {
    /// Target adapter by stable id; defaults to the first active adapter.
    pub adapter: Option<String>,
    /// Explicit new value instead of a generated one.
    pub value: Option<String>,
}

/// What happened to one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub category: String,
    pub item: String,
    pub resource: Option<String>,
    pub success: bool,
    pub before: Option<String>,
    pub after: Option<String>,
    pub message: String,
    pub error: Option<StructuredError>,
    pub record_id: Option<i64>,
}

impl MutationOutcome {
    fn failed(category: &str, item: &str, before: Option<String>, err: &IdError) -> Self {
        Self {
            category: category.to_string(),
            item: item.to_string(),
            resource: None,
            success: false,
            before,
            after: None,
            message: err.to_string(),
            error: Some(err.to_structured()),
            record_id: None,
        }
    }
}

/// A journaled original and the session that captured it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Original<T> {
    pub value: T,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IpConfig {
    Dhcp,
    Static {
        ip: String,
        mask: String,
        gateway: Option<String>,
    },
}

/// Every original currently known, as stored in settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Originals {
    /// `value: None` means the id was absent before mutation.
    pub machine_guid: Option<Original<Option<String>>>,
    /// `value: None` means no address override was configured.
    pub adapter_addresses: BTreeMap<String, Original<Option<String>>>,
    pub ip_configs: BTreeMap<String, Original<IpConfig>>,
}

impl Originals {
    pub fn load(settings: &Settings) -> Result<Self> {
        Ok(Self {
            machine_guid: settings.get(ORIGINAL_MACHINE_GUID)?,
            adapter_addresses: settings.get(MAC_ORIGINAL_VALUES)?.unwrap_or_default(),
            ip_configs: settings.get(IP_ORIGINAL_CONFIGS)?.unwrap_or_default(),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.machine_guid.is_none() && self.adapter_addresses.is_empty() && self.ip_configs.is_empty()
    }
}

/// Result of [`IdentifierMutator::restore_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub outcomes: Vec<MutationOutcome>,
}

impl RestoreReport {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.success)
    }
}

enum Write {
    MachineId {
        value: String,
    },
    AdapterAddress {
        stable_id: String,
        path: String,
        raw: String,
    },
    StaticIp {
        stable_id: String,
        ip: String,
        mask: String,
        gateway: Option<String>,
        /// Re-applied after the static write, which drops them.
        dns: Vec<String>,
    },
    Dhcp {
        stable_id: String,
    },
    Override {
        field: String,
        value: String,
    },
}

/// A resolved, not yet executed mutation.
struct Prepared {
    resource: String,
    before: Option<String>,
    after: String,
    write: Write,
    originals: Settings,
    registry: Vec<RegistryChange>,
}

/// Runs mutations against a platform, journaling each one.
pub struct IdentifierMutator<'a> {
    platform: &'a dyn Platform,
    journal: &'a mut MutationJournal,
    session_id: Option<&'a str>,
    settle_delay: Duration,
}

impl<'a> IdentifierMutator<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        journal: &'a mut MutationJournal,
        session_id: Option<&'a str>,
        settle_delay: Duration,
    ) -> Self {
        Self {
            platform,
            journal,
            session_id,
            settle_delay: settle_delay.min(MAX_SETTLE_DELAY),
        }
    }

    /// Mutate one identifier class.
    pub fn mutate(
        &mut self,
        class: &IdentifierClass,
        options: &MutationOptions,
        cancel: &CancelToken,
    ) -> MutationOutcome {
        let prepared = match self.prepare(class, options) {
            Ok(prepared) => prepared,
            Err(err) => return self.reject(class, None, &err),
        };
        if cancel.is_cancelled() {
            let err = IdError::Cancelled(format!("{class} cancelled before writing"));
            return self.reject(class, prepared.before, &err);
        }
        if class.needs_elevation() && !self.platform.is_elevated() {
            let err = IdError::PermissionDenied(format!(
                "{class} requires an elevated process"
            ));
            return self.reject(class, prepared.before, &err);
        }

        if let Write::Override { field, value } = &prepared.write {
            return self.apply_override(class, &prepared, field, value);
        }

        let outcome = self.apply(class, &prepared);
        match (&prepared.write, outcome) {
            (Write::StaticIp { stable_id, .. }, Err(rejected)) => {
                info!(stable_id = %stable_id, reason = %rejected.message, "static assignment rejected; renewing DHCP lease");
                let fallback = Prepared {
                    resource: prepared.resource.clone(),
                    before: prepared.before.clone(),
                    after: DHCP_RENEWED.to_string(),
                    write: Write::Dhcp {
                        stable_id: stable_id.clone(),
                    },
                    originals: Settings::new(),
                    registry: Vec::new(),
                };
                self.apply(class, &fallback).unwrap_or_else(|outcome| outcome)
            }
            (_, Ok(outcome) | Err(outcome)) => outcome,
        }
    }

    /// Resolve and read without journaling or writing.
    pub fn plan(&self, class: &IdentifierClass, options: &MutationOptions) -> MutationOutcome {
        match self.prepare(class, options) {
            Ok(prepared) => MutationOutcome {
                category: class.category().to_string(),
                item: class.item().to_string(),
                resource: Some(prepared.resource),
                success: true,
                before: prepared.before,
                after: Some(prepared.after),
                message: "dry run".to_string(),
                error: None,
                record_id: None,
            },
            Err(err) => MutationOutcome::failed(class.category(), class.item(), None, &err),
        }
    }

    fn prepare(&self, class: &IdentifierClass, options: &MutationOptions) -> Result<Prepared> {
        match class {
            IdentifierClass::AdapterAddress => self.prepare_adapter_address(options),
            IdentifierClass::MachineId => self.prepare_machine_id(options),
            IdentifierClass::NetworkAddress => self.prepare_network_address(options),
            IdentifierClass::ReportingOverride(field) => self.prepare_override(field, options),
        }
    }

    fn prepare_adapter_address(&self, options: &MutationOptions) -> Result<Prepared> {
        let adapter = self.select_adapter(options, false)?;
        let path = resolve_adapter_path(self.platform, NETWORK_CLASS_KEY, &adapter.stable_id)?;
        let original_raw = self.platform.get(&path, NETWORK_ADDRESS_VALUE)?;
        let before = adapter
            .current_address
            .clone()
            .or_else(|| original_raw.as_deref().and_then(address::format_mac));

        let after = match &options.value {
            Some(requested) => address::validate_requested_mac(requested, before.as_deref())?,
            None => address::generate_mac(&mut rand::rng(), before.as_deref()),
        };

        let settings = self.journal.load_settings()?;
        let mut originals: BTreeMap<String, Original<Option<String>>> =
            settings.get(MAC_ORIGINAL_VALUES)?.unwrap_or_default();
        self.keep_first(&mut originals, &adapter.stable_id, original_raw.clone());
        let mut patch = Settings::new();
        patch.set(MAC_ORIGINAL_VALUES, &originals)?;

        let raw = address::compact_mac(&after);
        let registry = vec![RegistryChange::new(
            path.as_str(),
            NETWORK_ADDRESS_VALUE,
            original_raw,
            Some(raw.clone()),
        )];
        Ok(Prepared {
            resource: adapter.stable_id.clone(),
            before,
            write: Write::AdapterAddress {
                stable_id: adapter.stable_id,
                path,
                raw,
            },
            after,
            originals: patch,
            registry,
        })
    }

    fn prepare_machine_id(&self, options: &MutationOptions) -> Result<Prepared> {
        let before = self.platform.get(MACHINE_GUID_KEY, MACHINE_GUID_VALUE)?;
        let after = match &options.value {
            Some(requested) => uuid::Uuid::parse_str(requested)
                .map_err(|err| IdError::ValidationFailed(format!("not a GUID: {requested} ({err})")))?
                .to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        if before.as_deref().is_some_and(|b| b.eq_ignore_ascii_case(&after)) {
            return Err(IdError::ValidationFailed(format!(
                "{after} is already the machine id"
            )));
        }

        let settings = self.journal.load_settings()?;
        let existing: Option<Original<Option<String>>> = settings.get(ORIGINAL_MACHINE_GUID)?;
        let original = match existing {
            Some(original) if original.session_id.as_deref() == self.session_id => original,
            _ => Original {
                value: before.clone(),
                session_id: self.session_id.map(str::to_string),
            },
        };
        let mut patch = Settings::new();
        patch.set(ORIGINAL_MACHINE_GUID, &original)?;

        Ok(Prepared {
            resource: format!("{MACHINE_GUID_KEY}\\{MACHINE_GUID_VALUE}"),
            registry: vec![RegistryChange::new(
                MACHINE_GUID_KEY,
                MACHINE_GUID_VALUE,
                before.clone(),
                Some(after.clone()),
            )],
            before,
            write: Write::MachineId {
                value: after.clone(),
            },
            after,
            originals: patch,
        })
    }

    fn prepare_network_address(&self, options: &MutationOptions) -> Result<Prepared> {
        let adapter = self.select_adapter(options, true)?;
        let current: Option<Ipv4Addr> = adapter.ip_addresses.first().and_then(|ip| ip.parse().ok());
        let mask: Option<Ipv4Addr> = adapter.subnet_mask.as_deref().and_then(|m| m.parse().ok());
        let gateway: Option<Ipv4Addr> = adapter.gateway.as_deref().and_then(|g| g.parse().ok());

        let original = match (adapter.dhcp_enabled, current, mask) {
            (false, Some(ip), Some(mask)) => IpConfig::Static {
                ip: ip.to_string(),
                mask: mask.to_string(),
                gateway: gateway.map(|g| g.to_string()),
            },
            _ => IpConfig::Dhcp,
        };

        let target = match &options.value {
            Some(requested) => {
                let ip: Ipv4Addr = requested.parse().map_err(|_| {
                    IdError::ValidationFailed(format!("not an IPv4 address: {requested}"))
                })?;
                if Some(ip) == current {
                    return Err(IdError::ValidationFailed(format!(
                        "{ip} is already assigned"
                    )));
                }
                Some(ip)
            }
            None => current
                .zip(mask)
                .and_then(|(ip, mask)| address::next_static_address(ip, mask, gateway)),
        };

        let settings = self.journal.load_settings()?;
        let mut originals: BTreeMap<String, Original<IpConfig>> =
            settings.get(IP_ORIGINAL_CONFIGS)?.unwrap_or_default();
        self.keep_first(&mut originals, &adapter.stable_id, original);
        let mut patch = Settings::new();
        patch.set(IP_ORIGINAL_CONFIGS, &originals)?;

        let stable_id = adapter.stable_id.clone();
        let (write, after) = match target {
            Some(ip) => (
                Write::StaticIp {
                    stable_id,
                    ip: ip.to_string(),
                    mask: mask.map_or_else(|| "255.255.255.0".to_string(), |m| m.to_string()),
                    gateway: gateway.map(|g| g.to_string()),
                    dns: adapter.dns_servers.clone(),
                },
                ip.to_string(),
            ),
            None => (Write::Dhcp { stable_id }, DHCP_RENEWED.to_string()),
        };

        Ok(Prepared {
            resource: adapter.stable_id,
            before: current.map(|ip| ip.to_string()),
            after,
            write,
            originals: patch,
            registry: Vec::new(),
        })
    }

    fn prepare_override(&self, field: &str, options: &MutationOptions) -> Result<Prepared> {
        let field = overrides::canonical_field(field)?;
        let value = match &options.value {
            Some(value) if value.trim().is_empty() => {
                return Err(IdError::ValidationFailed(format!(
                    "override for {field} cannot be empty"
                )));
            }
            Some(value) => value.trim().to_string(),
            None => overrides::generate_override(&mut rand::rng(), field)?,
        };
        let current: BTreeMap<String, String> = self.journal.get_setting(SPOOF_OVERRIDES, BTreeMap::new());
        let before = match current.get(field) {
            Some(value) => Some(value.clone()),
            None => self.platform.read_machine_metadata()?.remove(field),
        };

        Ok(Prepared {
            resource: field.to_string(),
            before,
            after: value.clone(),
            write: Write::Override {
                field: field.to_string(),
                value,
            },
            originals: Settings::new(),
            registry: Vec::new(),
        })
    }

    fn select_adapter(&self, options: &MutationOptions, prefer_ip: bool) -> Result<AdapterInfo> {
        if !self.platform.is_available() {
            return Err(IdError::PlatformUnavailable(format!(
                "{} backend cannot enumerate adapters",
                self.platform.name()
            )));
        }
        let adapters = self.platform.list_active_adapters()?;
        let found = match &options.adapter {
            Some(id) => adapters
                .into_iter()
                .find(|a| a.stable_id.eq_ignore_ascii_case(id)),
            None if prefer_ip => adapters
                .iter()
                .find(|a| !a.ip_addresses.is_empty())
                .or_else(|| adapters.first())
                .cloned(),
            None => adapters.into_iter().find(|a| a.current_address.is_some()),
        };
        found.ok_or_else(|| {
            IdError::ResourceNotFound(options.adapter.as_ref().map_or_else(
                || "active network adapter".to_string(),
                |id| format!("active adapter {id}"),
            ))
        })
    }

    /// Within one session the first captured original wins; a later session
    /// replaces it with the then-current value.
    fn keep_first<T>(&self, originals: &mut BTreeMap<String, Original<T>>, key: &str, value: T) {
        let same_session = originals
            .get(key)
            .is_some_and(|o| o.session_id.as_deref() == self.session_id);
        if !same_session {
            originals.insert(
                key.to_string(),
                Original {
                    value,
                    session_id: self.session_id.map(str::to_string),
                },
            );
        }
    }

    /// Journal the intent, write, verify, complete. `Err` carries a failed
    /// outcome whose static write was rejected by the platform.
    fn apply(
        &mut self,
        class: &IdentifierClass,
        prepared: &Prepared,
    ) -> std::result::Result<MutationOutcome, MutationOutcome> {
        let intent = prepared.registry.iter().cloned().fold(
            MutationIntent::new(
                class.category(),
                class.item(),
                &prepared.resource,
                prepared.before.clone(),
                Some(prepared.after.clone()),
                self.session_id,
            ),
            MutationIntent::with_registry_write,
        );
        if let Err(err) = self.journal.begin_mutation(&intent, &prepared.originals) {
            let mut outcome =
                MutationOutcome::failed(class.category(), class.item(), prepared.before.clone(), &err);
            outcome.resource = Some(prepared.resource.clone());
            return Ok(outcome);
        }

        let written = self.write(&prepared.write);
        let rejected = matches!(written, Err(PlatformError::Rejected(_)));
        let result = written
            .map_err(IdError::from)
            .and_then(|()| self.verify(&prepared.write, &prepared.after));

        let error_text = result.as_ref().err().map(ToString::to_string);
        let record_id = match self
            .journal
            .complete_mutation(&intent.id, result.is_ok(), error_text.as_deref())
        {
            Ok(record) => Some(record.id),
            Err(err) => {
                warn!(intent = %intent.id, error = %err, "could not complete journal entry; it will be recovered at next start");
                None
            }
        };

        let outcome = match result {
            Ok(observed) => {
                info!(class = %class, resource = %prepared.resource, after = %observed, "mutation verified");
                MutationOutcome {
                    category: class.category().to_string(),
                    item: class.item().to_string(),
                    resource: Some(prepared.resource.clone()),
                    success: true,
                    before: prepared.before.clone(),
                    after: Some(observed),
                    message: format!("{} updated", class.item()),
                    error: None,
                    record_id,
                }
            }
            Err(err) => {
                warn!(class = %class, resource = %prepared.resource, error = %err, "mutation failed");
                let mut outcome = MutationOutcome::failed(
                    class.category(),
                    class.item(),
                    prepared.before.clone(),
                    &err,
                );
                outcome.resource = Some(prepared.resource.clone());
                outcome.record_id = record_id;
                if rejected {
                    return Err(outcome);
                }
                outcome
            }
        };
        Ok(outcome)
    }

    fn write(&self, write: &Write) -> std::result::Result<(), PlatformError> {
        match write {
            Write::MachineId { value } => {
                self.platform.set(MACHINE_GUID_KEY, MACHINE_GUID_VALUE, value)
            }
            Write::AdapterAddress {
                stable_id,
                path,
                raw,
            } => {
                self.platform.set(path, NETWORK_ADDRESS_VALUE, raw)?;
                self.cycle_adapter(stable_id)
            }
            Write::StaticIp {
                stable_id,
                ip,
                mask,
                gateway,
                dns,
            } => {
                self.platform
                    .set_static_ipv4(stable_id, ip, mask, gateway.as_deref())?;
                self.reapply_dns(stable_id, dns);
                Ok(())
            }
            Write::Dhcp { stable_id } => self.platform.enable_dhcp(stable_id),
            Write::Override { .. } => Ok(()),
        }
    }

    /// DNS failures never fail the address write.
    fn reapply_dns(&self, stable_id: &str, servers: &[String]) {
        if servers.is_empty() {
            return;
        }
        match self.platform.set_dns_servers(stable_id, servers) {
            Ok(()) => debug!(stable_id, count = servers.len(), "DNS servers re-applied"),
            Err(err) => warn!(stable_id, error = %err, "could not re-apply DNS servers"),
        }
    }

    /// Disable, settle, enable. The settle delay is bounded.
    fn cycle_adapter(&self, stable_id: &str) -> std::result::Result<(), PlatformError> {
        debug!(stable_id, delay_ms = self.settle_delay.as_millis(), "cycling adapter");
        self.platform.disable(stable_id)?;
        std::thread::sleep(self.settle_delay);
        self.platform.enable(stable_id)
    }

    /// Read back what was written. Returns the observed value.
    fn verify(&self, write: &Write, expected: &str) -> Result<String> {
        match write {
            Write::MachineId { value } => {
                let actual = self.platform.get(MACHINE_GUID_KEY, MACHINE_GUID_VALUE)?;
                match actual {
                    Some(actual) if actual.eq_ignore_ascii_case(value) => Ok(actual),
                    other => Err(IdError::WriteVerificationFailed {
                        expected: value.clone(),
                        actual: other.unwrap_or_else(|| "<absent>".to_string()),
                    }),
                }
            }
            Write::AdapterAddress {
                stable_id,
                path,
                raw,
            } => {
                let stored = self.platform.get(path, NETWORK_ADDRESS_VALUE)?;
                if stored.as_deref().map(address::compact_mac).as_deref() != Some(raw.as_str()) {
                    return Err(IdError::WriteVerificationFailed {
                        expected: expected.to_string(),
                        actual: stored.unwrap_or_else(|| "<absent>".to_string()),
                    });
                }
                let live = self.live_adapter(stable_id)?;
                match live.and_then(|a| a.current_address) {
                    Some(actual) if address::compact_mac(&actual) != *raw => {
                        Err(IdError::WriteVerificationFailed {
                            expected: expected.to_string(),
                            actual,
                        })
                    }
                    _ => Ok(expected.to_string()),
                }
            }
            Write::StaticIp { stable_id, ip, .. } => {
                let live = self.live_adapter(stable_id)?;
                let addresses = live.map(|a| a.ip_addresses).unwrap_or_default();
                if addresses.iter().any(|a| a == ip) {
                    Ok(ip.clone())
                } else {
                    Err(IdError::WriteVerificationFailed {
                        expected: ip.clone(),
                        actual: addresses.join(", "),
                    })
                }
            }
            Write::Dhcp { stable_id } => self
                .live_adapter(stable_id)?
                .filter(|a| a.dhcp_enabled)
                .and_then(|a| a.ip_addresses.into_iter().next())
                .ok_or_else(|| IdError::WriteVerificationFailed {
                    expected: "DHCP lease".to_string(),
                    actual: "no address".to_string(),
                }),
            Write::Override { value, .. } => Ok(value.clone()),
        }
    }

    fn live_adapter(&self, stable_id: &str) -> Result<Option<AdapterInfo>> {
        Ok(self
            .platform
            .list_active_adapters()?
            .into_iter()
            .find(|a| a.stable_id.eq_ignore_ascii_case(stable_id)))
    }

    fn apply_override(
        &mut self,
        class: &IdentifierClass,
        prepared: &Prepared,
        field: &str,
        value: &str,
    ) -> MutationOutcome {
        let mut current: BTreeMap<String, String> =
            self.journal.get_setting(SPOOF_OVERRIDES, BTreeMap::new());
        current.insert(field.to_string(), value.to_string());
        let mut patch = Settings::new();
        let saved = patch
            .set(SPOOF_OVERRIDES, &current)
            .and_then(|()| self.journal.save_settings(&patch));
        if let Err(err) = saved {
            let err = IdError::JournalUnavailable(format!("save override {field}: {err}"));
            return self.reject(class, prepared.before.clone(), &err);
        }

        let record_id = self.journal.record_mutation(
            &MutationEntry::new(
                class.category(),
                class.item(),
                prepared.before.clone(),
                Some(value.to_string()),
            )
            .in_session(self.session_id),
        );
        info!(field, "reporting override set");
        MutationOutcome {
            category: class.category().to_string(),
            item: class.item().to_string(),
            resource: Some(field.to_string()),
            success: true,
            before: prepared.before.clone(),
            after: Some(value.to_string()),
            message: format!("{field} override set"),
            error: None,
            record_id,
        }
    }

    /// Journal a failure that happened before any write.
    fn reject(
        &self,
        class: &IdentifierClass,
        before: Option<String>,
        err: &IdError,
    ) -> MutationOutcome {
        warn!(class = %class, error = %err, "mutation not attempted");
        let record_id = self.journal.record_mutation(
            &MutationEntry::new(class.category(), class.item(), before.clone(), None)
                .failed(err.to_string())
                .in_session(self.session_id),
        );
        let mut outcome = MutationOutcome::failed(class.category(), class.item(), before, err);
        outcome.record_id = record_id;
        outcome
    }

    // =========================================================================
    // RESTORE
    // =========================================================================

    /// Write every journaled original back, each independently, and clear
    /// the reporting overrides.
    pub fn restore_all(&mut self) -> Result<RestoreReport> {
        let settings = self.journal.load_settings()?;
        let mut originals = Originals::load(&settings)?;
        let overrides: BTreeMap<String, String> =
            settings.get(SPOOF_OVERRIDES)?.unwrap_or_default();
        let mut report = RestoreReport::default();

        if let Some(original) = originals.machine_guid.take() {
            let outcome = self.restore_machine_id(original.value.as_deref());
            if !outcome.success {
                originals.machine_guid = Some(original);
            }
            report.outcomes.push(outcome);
        }

        let adapters = std::mem::take(&mut originals.adapter_addresses);
        for (stable_id, original) in adapters {
            let outcome = self.restore_adapter_address(&stable_id, original.value.as_deref());
            if !outcome.success {
                originals.adapter_addresses.insert(stable_id, original);
            }
            report.outcomes.push(outcome);
        }

        let configs = std::mem::take(&mut originals.ip_configs);
        for (stable_id, original) in configs {
            let outcome = self.restore_ip(&stable_id, &original.value);
            if !outcome.success {
                originals.ip_configs.insert(stable_id, original);
            }
            report.outcomes.push(outcome);
        }

        if !overrides.is_empty() {
            let cleared = self.journal.remove_settings(&[SPOOF_OVERRIDES]);
            let outcome = self.finish_restore(
                "overrides_clear",
                SPOOF_OVERRIDES,
                Some(format!("{} override(s)", overrides.len())),
                None,
                cleared,
            );
            report.outcomes.push(outcome);
        }

        self.store_originals(&originals)?;
        Ok(report)
    }

    fn restore_machine_id(&self, original: Option<&str>) -> MutationOutcome {
        let current = self
            .platform
            .get(MACHINE_GUID_KEY, MACHINE_GUID_VALUE)
            .ok()
            .flatten();
        let result = match original {
            Some(value) => self.platform.set(MACHINE_GUID_KEY, MACHINE_GUID_VALUE, value),
            None => self.platform.delete(MACHINE_GUID_KEY, MACHINE_GUID_VALUE),
        }
        .map_err(IdError::from);
        self.audit_registry(
            RegistryChange::new(
                MACHINE_GUID_KEY,
                MACHINE_GUID_VALUE,
                current.clone(),
                original.map(str::to_string),
            ),
            result.is_ok(),
        );
        self.finish_restore(
            "machine_guid_restore",
            MACHINE_GUID_VALUE,
            current,
            original.map(str::to_string),
            result,
        )
    }

    fn restore_adapter_address(&self, stable_id: &str, original: Option<&str>) -> MutationOutcome {
        let before = self.live_adapter(stable_id).ok().flatten().and_then(|a| a.current_address);
        let result = (|| -> Result<Option<String>> {
            let path = resolve_adapter_path(self.platform, NETWORK_CLASS_KEY, stable_id)?;
            let current_raw = self.platform.get(&path, NETWORK_ADDRESS_VALUE).ok().flatten();
            let written = match original {
                Some(raw) => self.platform.set(&path, NETWORK_ADDRESS_VALUE, raw),
                None => self.platform.delete(&path, NETWORK_ADDRESS_VALUE),
            };
            self.audit_registry(
                RegistryChange::new(
                    path.as_str(),
                    NETWORK_ADDRESS_VALUE,
                    current_raw,
                    original.map(str::to_string),
                ),
                written.is_ok(),
            );
            written?;
            self.cycle_adapter(stable_id)?;
            Ok(self.live_adapter(stable_id)?.and_then(|a| a.current_address))
        })();
        match result {
            Ok(now) => {
                let restored = original
                    .and_then(address::format_mac)
                    .or(now)
                    .unwrap_or_else(|| "hardware default".to_string());
                self.finish_restore("mac_restore", stable_id, before, Some(restored), Ok(()))
            }
            Err(err) => self.finish_restore("mac_restore", stable_id, before, None, Err(err)),
        }
    }

    /// Write the original configuration back and read it back like a
    /// mutation would.
    fn restore_ip(&self, stable_id: &str, original: &IpConfig) -> MutationOutcome {
        let live = self.live_adapter(stable_id).ok().flatten();
        let before = live.as_ref().and_then(|a| a.ip_addresses.first().cloned());
        let (write, restored) = match original {
            IpConfig::Dhcp => (
                Write::Dhcp {
                    stable_id: stable_id.to_string(),
                },
                DHCP_RENEWED.to_string(),
            ),
            IpConfig::Static { ip, mask, gateway } => (
                Write::StaticIp {
                    stable_id: stable_id.to_string(),
                    ip: ip.clone(),
                    mask: mask.clone(),
                    gateway: gateway.clone(),
                    dns: live.map(|a| a.dns_servers).unwrap_or_default(),
                },
                ip.clone(),
            ),
        };
        let result = self
            .write(&write)
            .map_err(IdError::from)
            .and_then(|()| self.verify(&write, &restored))
            .map(drop);
        self.finish_restore("ip_restore", stable_id, before, Some(restored), result)
    }

    /// Restores write outside an intent; their audit rows never fail the restore.
    fn audit_registry(&self, change: RegistryChange, success: bool) {
        self.journal
            .record_registry_change(&change, success, self.session_id);
    }

    fn finish_restore(
        &self,
        item: &str,
        resource: &str,
        before: Option<String>,
        after: Option<String>,
        result: Result<()>,
    ) -> MutationOutcome {
        let mut entry = MutationEntry::new(RESTORE_CATEGORY, item, before.clone(), after.clone())
            .in_session(self.session_id);
        if let Err(err) = &result {
            entry = entry.failed(err.to_string());
        }
        let record_id = self.journal.record_mutation(&entry);
        match result {
            Ok(()) => {
                info!(item, resource, "restored");
                MutationOutcome {
                    category: RESTORE_CATEGORY.to_string(),
                    item: item.to_string(),
                    resource: Some(resource.to_string()),
                    success: true,
                    before,
                    after,
                    message: format!("{resource} restored"),
                    error: None,
                    record_id,
                }
            }
            Err(err) => {
                warn!(item, resource, error = %err, "restore failed");
                let mut outcome = MutationOutcome::failed(RESTORE_CATEGORY, item, before, &err);
                outcome.resource = Some(resource.to_string());
                outcome.record_id = record_id;
                outcome
            }
        }
    }

    /// Persist what is left of the originals; empty entries are removed.
    fn store_originals(&mut self, originals: &Originals) -> Result<()> {
        let mut patch = Settings::new();
        let mut cleared = Vec::new();
        match &originals.machine_guid {
            Some(original) => patch.set(ORIGINAL_MACHINE_GUID, original)?,
            None => cleared.push(ORIGINAL_MACHINE_GUID),
        }
        if originals.adapter_addresses.is_empty() {
            cleared.push(MAC_ORIGINAL_VALUES);
        } else {
            patch.set(MAC_ORIGINAL_VALUES, &originals.adapter_addresses)?;
        }
        if originals.ip_configs.is_empty() {
            cleared.push(IP_ORIGINAL_CONFIGS);
        } else {
            patch.set(IP_ORIGINAL_CONFIGS, &originals.ip_configs)?;
        }
        self.journal.save_settings(&patch)?;
        self.journal.remove_settings(&cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{Faults, KeyValueStore, MemoryPlatform};
    use crate::test_utils::fixtures::TestJournal;

    const GUID_1: &str = "GUID-1";

    fn platform() -> MemoryPlatform {
        MemoryPlatform::new()
            .with_adapter(GUID_1, "Ethernet", "AA:BB:CC:11:22:33")
            .with_ipv4(GUID_1, "192.168.1.50", "255.255.255.0", Some("192.168.1.1"))
            .with_machine_guid("11111111-2222-3333-4444-555555555555")
            .with_metadata("BIOS.SerialNumber", "REAL-SERIAL")
    }

    fn mutate(
        platform: &MemoryPlatform,
        journal: &mut MutationJournal,
        session: &str,
        class: &IdentifierClass,
    ) -> MutationOutcome {
        IdentifierMutator::new(platform, journal, Some(session), Duration::ZERO).mutate(
            class,
            &MutationOptions::default(),
            &CancelToken::new(),
        )
    }

    #[test]
    fn test_parse_identifier_class() {
        assert_eq!("mac".parse::<IdentifierClass>().unwrap(), IdentifierClass::AdapterAddress);
        assert_eq!("machine_id".parse::<IdentifierClass>().unwrap(), IdentifierClass::MachineId);
        assert_eq!("ip".parse::<IdentifierClass>().unwrap(), IdentifierClass::NetworkAddress);
        assert_eq!(
            "override:efi.number".parse::<IdentifierClass>().unwrap(),
            IdentifierClass::ReportingOverride("EFI.Number".to_string())
        );
        assert!("disk".parse::<IdentifierClass>().is_err());
        assert_eq!(IdentifierClass::AdapterAddress.to_string().parse::<IdentifierClass>().unwrap(),
                   IdentifierClass::AdapterAddress);
    }

    #[test]
    fn test_adapter_address_chained_history() {
        let platform = platform();
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();

        let first = mutate(&platform, &mut db.journal, &session, &IdentifierClass::AdapterAddress);
        assert!(first.success, "{first:?}");
        assert_eq!(first.before.as_deref(), Some("AA:BB:CC:11:22:33"));
        let new = first.after.clone().unwrap();
        assert!(address::is_locally_administered(&new));
        assert_ne!(new, "AA:BB:CC:11:22:33");
        assert_eq!(
            platform.adapter(GUID_1).unwrap().current_address.as_deref(),
            Some(new.as_str())
        );

        let second = mutate(&platform, &mut db.journal, &session, &IdentifierClass::AdapterAddress);
        assert!(second.success);
        let records = db.journal.list_mutations(10).unwrap();
        assert_eq!(records[1].item, "mac_address");
        assert_eq!(records[1].original_value.as_deref(), Some("AA:BB:CC:11:22:33"));
        assert_eq!(records[0].original_value, records[1].new_value);
        assert_eq!(
            platform.control_log(),
            vec!["disable GUID-1", "enable GUID-1", "disable GUID-1", "enable GUID-1"]
        );
    }

    #[test]
    fn test_first_original_wins_within_session() {
        let platform = platform();
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();

        mutate(&platform, &mut db.journal, &session, &IdentifierClass::MachineId);
        mutate(&platform, &mut db.journal, &session, &IdentifierClass::MachineId);

        let originals = Originals::load(&db.journal.load_settings().unwrap()).unwrap();
        assert_eq!(
            originals.machine_guid.unwrap().value.as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
    }

    #[test]
    fn test_later_session_overwrites_original() {
        let platform = platform();
        let mut db = TestJournal::new();
        let first_session = db.journal.start_session().unwrap();
        let first = mutate(&platform, &mut db.journal, &first_session, &IdentifierClass::MachineId);

        let second_session = db.journal.start_session().unwrap();
        mutate(&platform, &mut db.journal, &second_session, &IdentifierClass::MachineId);

        let originals = Originals::load(&db.journal.load_settings().unwrap()).unwrap();
        assert_eq!(originals.machine_guid.unwrap().value, first.after);
    }

    #[test]
    fn test_permission_denied_before_write() {
        let platform = platform().with_elevated(false);
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();

        let outcome = mutate(&platform, &mut db.journal, &session, &IdentifierClass::MachineId);
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.unwrap().code,
            crate::error::ErrorCode::PermissionDenied
        );
        assert_eq!(
            platform.get(MACHINE_GUID_KEY, MACHINE_GUID_VALUE).unwrap().as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
        let records = db.journal.list_mutations(10).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
    }

    #[test]
    fn test_verification_failure_when_driver_ignores_override() {
        let platform = platform().with_faults(Faults {
            ignore_address_override: true,
            ..Faults::default()
        });
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();

        let outcome = mutate(&platform, &mut db.journal, &session, &IdentifierClass::AdapterAddress);
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.unwrap().code,
            crate::error::ErrorCode::WriteVerificationFailed
        );
        assert!(db.journal.pending_intents().unwrap().is_empty());
    }

    #[test]
    fn test_static_ip_then_dhcp_fallback() {
        let platform = platform();
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();

        let outcome = mutate(&platform, &mut db.journal, &session, &IdentifierClass::NetworkAddress);
        assert!(outcome.success);
        assert_eq!(outcome.after.as_deref(), Some("192.168.1.51"));

        platform.set_faults(Faults {
            reject_static_ip: true,
            ..Faults::default()
        });
        let outcome = mutate(&platform, &mut db.journal, &session, &IdentifierClass::NetworkAddress);
        assert!(outcome.success, "{outcome:?}");
        let records = db.journal.list_mutations(2).unwrap();
        assert_eq!(records[0].new_value.as_deref(), Some(DHCP_RENEWED));
        assert!(records[0].success);
        assert!(!records[1].success);
    }

    #[test]
    fn test_override_is_settings_only() {
        let platform = platform();
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();
        let class = IdentifierClass::ReportingOverride("BIOS.SerialNumber".to_string());

        platform.set_elevated(false);
        let outcome = mutate(&platform, &mut db.journal, &session, &class);
        assert!(outcome.success);
        assert_eq!(outcome.before.as_deref(), Some("REAL-SERIAL"));
        let overrides: BTreeMap<String, String> =
            db.journal.get_setting(SPOOF_OVERRIDES, BTreeMap::new());
        assert!(overrides["BIOS.SerialNumber"].starts_with("PHANTOM-"));
    }

    #[test]
    fn test_cancelled_before_write() {
        let platform = platform();
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = IdentifierMutator::new(&platform, &mut db.journal, Some(&session), Duration::ZERO)
            .mutate(&IdentifierClass::MachineId, &MutationOptions::default(), &cancel);
        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().code, crate::error::ErrorCode::Cancelled);
        assert!(db.journal.load_settings().unwrap().get_value(ORIGINAL_MACHINE_GUID).is_none());
    }

    #[test]
    fn test_plan_does_not_touch_anything() {
        let platform = platform();
        let mut db = TestJournal::new();
        let mutator = IdentifierMutator::new(&platform, &mut db.journal, None, Duration::ZERO);
        let outcome = mutator.plan(&IdentifierClass::AdapterAddress, &MutationOptions::default());
        assert!(outcome.success);
        assert_eq!(outcome.message, "dry run");
        drop(mutator);
        assert!(db.journal.list_mutations(10).unwrap().is_empty());
        assert!(platform.control_log().is_empty());
    }

    #[test]
    fn test_restore_all_returns_first_originals() {
        let platform = platform();
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();
        for class in [
            IdentifierClass::AdapterAddress,
            IdentifierClass::MachineId,
            IdentifierClass::NetworkAddress,
            IdentifierClass::AdapterAddress,
            IdentifierClass::ReportingOverride("CPU.Serial".to_string()),
        ] {
            assert!(mutate(&platform, &mut db.journal, &session, &class).success);
        }

        let report = IdentifierMutator::new(&platform, &mut db.journal, Some(&session), Duration::ZERO)
            .restore_all()
            .unwrap();
        assert!(report.all_succeeded(), "{report:?}");
        let items: Vec<_> = report.outcomes.iter().map(|o| o.item.as_str()).collect();
        assert_eq!(items, vec!["machine_guid_restore", "mac_restore", "ip_restore", "overrides_clear"]);

        assert_eq!(
            platform.adapter(GUID_1).unwrap().current_address.as_deref(),
            Some("AA:BB:CC:11:22:33")
        );
        assert_eq!(
            platform.get(MACHINE_GUID_KEY, MACHINE_GUID_VALUE).unwrap().as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
        let settings = db.journal.load_settings().unwrap();
        assert!(Originals::load(&settings).unwrap().is_empty());
        assert!(!settings.contains(SPOOF_OVERRIDES));
    }

    #[test]
    fn test_restore_keeps_failed_originals() {
        let platform = platform();
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();
        mutate(&platform, &mut db.journal, &session, &IdentifierClass::MachineId);
        mutate(&platform, &mut db.journal, &session, &IdentifierClass::AdapterAddress);

        platform.set_faults(Faults {
            deny_writes: true,
            ..Faults::default()
        });
        let report = IdentifierMutator::new(&platform, &mut db.journal, Some(&session), Duration::ZERO)
            .restore_all()
            .unwrap();
        assert!(!report.all_succeeded());
        assert_eq!(report.outcomes.len(), 2);
        let originals = Originals::load(&db.journal.load_settings().unwrap()).unwrap();
        assert!(originals.machine_guid.is_some());
        assert!(originals.adapter_addresses.contains_key(GUID_1));
    }

    #[test]
    fn test_registry_audit_row_per_write() {
        let platform = platform();
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();

        let guid = mutate(&platform, &mut db.journal, &session, &IdentifierClass::MachineId);
        let mac = mutate(&platform, &mut db.journal, &session, &IdentifierClass::AdapterAddress);
        mutate(&platform, &mut db.journal, &session, &IdentifierClass::NetworkAddress);

        let rows = db.journal.list_registry_changes(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value_name, NETWORK_ADDRESS_VALUE);
        assert!(rows[0].key_path.starts_with(NETWORK_CLASS_KEY));
        assert_eq!(rows[0].original_value, None);
        assert_eq!(
            rows[0].new_value,
            mac.after.as_deref().map(address::compact_mac)
        );
        assert_eq!(rows[0].success, Some(true));
        assert_eq!(rows[1].key_path, MACHINE_GUID_KEY);
        assert_eq!(rows[1].value_name, MACHINE_GUID_VALUE);
        assert_eq!(
            rows[1].original_value.as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
        assert_eq!(rows[1].new_value, guid.after);
        assert_eq!(rows[1].session_id.as_deref(), Some(session.as_str()));

        IdentifierMutator::new(&platform, &mut db.journal, Some(&session), Duration::ZERO)
            .restore_all()
            .unwrap();
        let rows = db.journal.list_registry_changes(10).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].value_name, NETWORK_ADDRESS_VALUE);
        assert_eq!(rows[0].new_value, None);
        assert_eq!(rows[1].value_name, MACHINE_GUID_VALUE);
        assert_eq!(rows[1].original_value, guid.after);
        assert!(rows.iter().all(|row| row.success == Some(true)));
    }

    #[test]
    fn test_failed_registry_write_is_audited_as_failed() {
        let platform = platform().with_faults(Faults {
            deny_writes: true,
            ..Faults::default()
        });
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();

        let outcome = mutate(&platform, &mut db.journal, &session, &IdentifierClass::MachineId);
        assert!(!outcome.success);
        let rows = db.journal.list_registry_changes(10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].success, Some(false));
    }

    #[test]
    fn test_unavailable_platform_rejects_every_class() {
        let platform = MemoryPlatform::unavailable();
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();

        for class in [
            IdentifierClass::AdapterAddress,
            IdentifierClass::NetworkAddress,
            IdentifierClass::MachineId,
        ] {
            let outcome = mutate(&platform, &mut db.journal, &session, &class);
            assert!(!outcome.success, "{class}");
            assert_eq!(
                outcome.error.unwrap().code,
                crate::error::ErrorCode::PlatformUnavailable,
                "{class}"
            );
        }

        // Overrides live in settings only and need no platform.
        let class = IdentifierClass::ReportingOverride("BIOS.SerialNumber".to_string());
        let outcome = mutate(&platform, &mut db.journal, &session, &class);
        assert!(outcome.success);
        assert_eq!(outcome.before, None);

        assert!(db.journal.pending_intents().unwrap().is_empty());
        assert!(Originals::load(&db.journal.load_settings().unwrap()).unwrap().is_empty());
        assert!(db.journal.list_registry_changes(10).unwrap().is_empty());
        assert!(platform.control_log().is_empty());
    }

    #[test]
    fn test_static_ip_reapplies_dns_servers() {
        let platform = platform().with_dns(GUID_1, &["192.168.1.1", "9.9.9.9"]);
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();

        let outcome = mutate(&platform, &mut db.journal, &session, &IdentifierClass::NetworkAddress);
        assert!(outcome.success, "{outcome:?}");
        let info = platform.adapter(GUID_1).unwrap();
        assert_eq!(info.ip_addresses, vec!["192.168.1.51"]);
        assert_eq!(info.dns_servers, vec!["192.168.1.1", "9.9.9.9"]);
        assert_eq!(
            platform.control_log(),
            vec!["static GUID-1 192.168.1.51", "dns GUID-1"]
        );
    }

    #[test]
    fn test_restore_ip_fails_when_read_back_differs() {
        let platform = platform();
        let mut db = TestJournal::new();
        let session = db.journal.start_session().unwrap();
        assert!(mutate(&platform, &mut db.journal, &session, &IdentifierClass::NetworkAddress).success);

        platform.set_faults(Faults {
            ignore_ip_changes: true,
            ..Faults::default()
        });
        let report = IdentifierMutator::new(&platform, &mut db.journal, Some(&session), Duration::ZERO)
            .restore_all()
            .unwrap();

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.item, "ip_restore");
        assert!(!outcome.success);
        assert_eq!(outcome.before.as_deref(), Some("192.168.1.51"));
        assert_eq!(
            outcome.error.as_ref().unwrap().code,
            crate::error::ErrorCode::WriteVerificationFailed
        );
        let originals = Originals::load(&db.journal.load_settings().unwrap()).unwrap();
        assert!(originals.ip_configs.contains_key(GUID_1));
    }
}
