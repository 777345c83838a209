//! Helpers for sanitizing data before it enters log lines or span fields.
//!
//! Logs are safe to share for debugging — these functions keep full email
//! addresses and raw message ids out of them.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Masks the local part of an email address, keeping its first character
/// and the full domain.
///
/// - `jane.doe@acmecorp.com` → `j***@acmecorp.com`
/// - `x@acmecorp.com` → `x***@acmecorp.com`
/// - strings without `@` are masked entirely
pub fn redact_email(address: &str) -> String {
    match address.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let first = local.chars().next().unwrap_or('*');
            format!("{}***@{}", first, domain)
        }
        Some((_, domain)) => format!("***@{}", domain),
        None => "***".to_string(),
    }
}

/// Returns a short deterministic hash of a message id for correlation
/// without exposing the id itself (ids often embed sender hostnames).
pub fn hash_message_id(message_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    message_id.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
