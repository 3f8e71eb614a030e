//! Reporting overrides for fields that have no safe write path.
//!
//! Firmware serials and processor ids cannot be changed from user space.
//! Overrides only live in settings and are layered over inventory output.

use std::collections::BTreeMap;

use rand::Rng;

use crate::error::{IdError, Result};

/// Fields that accept an override.
pub const OVERRIDE_FIELDS: [&str; 5] = [
    "BIOS.SerialNumber",
    "CPU.Serial",
    "CPU.ProcessorId",
    "OS.SerialNumber",
    "EFI.Number",
];

/// Canonical spelling of `field`, matched case-insensitively.
pub fn canonical_field(field: &str) -> Result<&'static str> {
    OVERRIDE_FIELDS
        .iter()
        .copied()
        .find(|f| f.eq_ignore_ascii_case(field))
        .ok_or_else(|| {
            IdError::ValidationFailed(format!(
                "unknown override field '{field}' (expected one of {})",
                OVERRIDE_FIELDS.join(", ")
            ))
        })
}

fn hex<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(b"0123456789ABCDEF"[rng.random_range(0..16)]))
        .collect()
}

fn digits<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

/// A synthetic value in the field's usual shape.
pub fn generate_override<R: Rng + ?Sized>(rng: &mut R, field: &str) -> Result<String> {
    let value = match canonical_field(field)? {
        "BIOS.SerialNumber" => format!("PHANTOM-{}", hex(rng, 16)),
        "CPU.Serial" | "CPU.ProcessorId" => hex(rng, 16),
        "OS.SerialNumber" => digits(rng, 20),
        _ => {
            let mut bytes = [0u8; 16];
            rng.fill(&mut bytes[..]);
            uuid::Builder::from_random_bytes(bytes)
                .into_uuid()
                .to_string()
                .to_ascii_uppercase()
        }
    };
    Ok(value)
}

/// Overlay `overrides` onto inventory metadata. Fields absent from the
/// inventory are added.
pub fn apply_overrides(
    metadata: &mut BTreeMap<String, String>,
    overrides: &BTreeMap<String, String>,
) {
    for (field, value) in overrides {
        metadata.insert(field.clone(), value.clone());
    }
}
