//! Environment overrides for config defaults. Unset or unparsable values fall
//! back to the given default.

use std::env;
use std::str::FromStr;

pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Comma-separated non-zero ports; the default applies when none parse.
pub fn env_ports(key: &str, default: &[u16]) -> Vec<u16> {
    let parsed = env::var(key)
        .map(|v| parse_ports(&v))
        .unwrap_or_default();
    if parsed.is_empty() {
        default.to_vec()
    } else {
        parsed
    }
}

fn parse_ports(value: &str) -> Vec<u16> {
    value
        .split(',')
        .filter_map(|p| p.trim().parse().ok())
        .filter(|p| *p != 0)
        .collect()
}
