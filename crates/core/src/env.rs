#![forbid(unsafe_code)]

//! Environment variable helpers shared by every binary.

use std::str::FromStr;

pub fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn parse<T: FromStr>(name: &str) -> Option<T> {
    var(name).and_then(|v| v.parse().ok())
}

/// Accepts true/false, yes/no, 1/0 (case insensitive). Anything else is
/// treated as unset so callers fall through to their default.
pub fn flag(name: &str) -> Option<bool> {
    let raw = var(name)?;
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
