//! # Generated Names
//!
//! Deterministic, DNS compatible names for child objects.

use regex::Regex;
use std::sync::LazyLock;

const MAX_NAME_LENGTH: usize = 64;

static INVALID_DNS_CHARACTERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-z0-9-_]").expect("valid regex"));

/// Join `parts` into a name ending in a checksum of the parts.
///
/// The prefix is lowercased, characters outside `[a-z0-9-_]` become `-` and
/// leading non-alphanumerics are dropped. The prefix is cut so the whole name
/// stays within 64 characters.
pub fn generate_name(parts: &[&str]) -> String {
    let checksum = checksum(&parts.concat());

    let prefix = parts.join("-").to_lowercase();
    let prefix = INVALID_DNS_CHARACTERS.replace_all(&prefix, "-");
    let prefix = prefix.trim_start_matches(|c: char| !c.is_ascii_alphanumeric());

    // Every remaining character is ASCII, so byte slicing is safe
    let max_prefix = MAX_NAME_LENGTH - 1 - checksum.len();
    let prefix = &prefix[..prefix.len().min(max_prefix)];

    if prefix.is_empty() {
        checksum
    } else {
        format!("{prefix}-{checksum}")
    }
}

fn checksum(input: &str) -> String {
    let digest = md5::compute(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.0[..8]);
    to_base36(u64::from_be_bytes(bytes))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
