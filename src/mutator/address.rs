//! Hardware and IP address generation.

use std::net::Ipv4Addr;

use rand::Rng;

use crate::error::{IdError, Result};

/// Lowest host octet handed out for static reassignment.
pub const MIN_HOST_OCTET: u8 = 2;
/// Highest host octet handed out for static reassignment.
pub const MAX_HOST_OCTET: u8 = 254;

/// Set the locally administered bit and clear the multicast bit.
#[must_use]
pub const fn locally_administered(first: u8) -> u8 {
    (first | 0x02) & 0xFE
}

/// Render 12 hex digits, with or without separators, as `AA:BB:CC:DD:EE:FF`.
///
/// Returns `None` for anything that is not exactly six octets.
#[must_use]
pub fn format_mac(raw: &str) -> Option<String> {
    let hex = compact_mac(raw);
    if hex.len() != 12 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let pairs: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
    Some(pairs.join(":"))
}

/// The separator-free uppercase form stored in adapter configuration.
#[must_use]
pub fn compact_mac(display: &str) -> String {
    display
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
        .collect::<String>()
        .to_ascii_uppercase()
}

fn first_octet(mac: &str) -> Option<u8> {
    let hex = compact_mac(mac);
    hex.get(..2).and_then(|b| u8::from_str_radix(b, 16).ok())
}

#[must_use]
pub fn is_locally_administered(mac: &str) -> bool {
    first_octet(mac).is_some_and(|b| b & 0x02 != 0)
}

#[must_use]
pub fn is_unicast(mac: &str) -> bool {
    first_octet(mac).is_some_and(|b| b & 0x01 == 0)
}

fn same_mac(a: &str, b: &str) -> bool {
    compact_mac(a) == compact_mac(b)
}

/// Random locally administered unicast address, never equal to `current`.
pub fn generate_mac<R: Rng + ?Sized>(rng: &mut R, current: Option<&str>) -> String {
    loop {
        let mut bytes = [0u8; 6];
        rng.fill(&mut bytes[..]);
        bytes[0] = locally_administered(bytes[0]);
        let candidate = bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        if current.is_none_or(|c| !same_mac(c, &candidate)) {
            return candidate;
        }
    }
}

/// Check a caller-supplied address before it is written.
pub fn validate_requested_mac(requested: &str, current: Option<&str>) -> Result<String> {
    let formatted = format_mac(requested)
        .ok_or_else(|| IdError::ValidationFailed(format!("not a hardware address: {requested}")))?;
    if !is_unicast(&formatted) {
        return Err(IdError::ValidationFailed(format!(
            "{formatted} is a multicast address"
        )));
    }
    if !is_locally_administered(&formatted) {
        return Err(IdError::ValidationFailed(format!(
            "{formatted} does not have the locally administered bit set"
        )));
    }
    if current.is_some_and(|c| same_mac(c, &formatted)) {
        return Err(IdError::ValidationFailed(format!(
            "{formatted} is already the current address"
        )));
    }
    Ok(formatted)
}

/// Host octets eligible for static reassignment, in ascending order.
///
/// Excludes the current host octet and the gateway's host octet.
#[must_use]
pub fn candidate_host_octets(current: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Vec<u8> {
    let current_octet = current.octets()[3];
    let gateway_octet = gateway.map(|g| g.octets()[3]);
    (MIN_HOST_OCTET..=MAX_HOST_OCTET)
        .filter(|o| *o != current_octet && Some(*o) != gateway_octet)
        .collect()
}

/// Pick the adjacent static address on the same prefix.
///
/// Takes the first eligible host octet above the current one, wrapping to
/// the bottom of the range. Returns `None` when the mask is wider than a
/// /24 boundary or no candidate remains.
#[must_use]
pub fn next_static_address(
    current: Ipv4Addr,
    mask: Ipv4Addr,
    gateway: Option<Ipv4Addr>,
) -> Option<Ipv4Addr> {
    if mask.octets()[3] != 0 {
        return None;
    }
    let candidates = candidate_host_octets(current, gateway);
    let current_octet = current.octets()[3];
    let octet = candidates
        .iter()
        .copied()
        .find(|o| *o > current_octet)
        .or_else(|| candidates.first().copied())?;
    let [a, b, c, _] = current.octets();
    Some(Ipv4Addr::new(a, b, c, octet))
}
