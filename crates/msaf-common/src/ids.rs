//! Minted resource identifiers.
//!
//! Identifiers handed to peers are opaque, URL-safe, and never reused
//! within a process lifetime. UUID v4 satisfies all three.

use uuid::Uuid;

/// Mints a new opaque resource id.
pub fn mint_id() -> String {
    Uuid::new_v4().to_string()
}

/// The AF-unique certificate identifier used on M3, where the
/// Application Server sees a flat namespace.
pub fn af_unique_certificate_id(provisioning_session_id: &str, certificate_id: &str) -> String {
    format!("{provisioning_session_id}:{certificate_id}")
}

/// Splits an AF-unique certificate id back into its parts.
pub fn split_af_unique_certificate_id(af_unique: &str) -> Option<(&str, &str)> {
    af_unique.split_once(':')
}
