//! Content protocols discovery.
//!
//! A static document embedded at build time, served on M1 with a fixed
//! entity tag (the SHA-256 of the embedded bytes) and a Last-Modified of
//! process start. Conditional GETs short-circuit to 304.

use std::sync::OnceLock;

use msaf_common::ResourceMetadata;

pub const CONTENT_PROTOCOLS_JSON: &str = include_str!("content-protocols.json");

static METADATA: OnceLock<ResourceMetadata> = OnceLock::new();

/// Metadata for the embedded document, computed once per process.
pub fn metadata() -> &'static ResourceMetadata {
    METADATA.get_or_init(|| ResourceMetadata::for_body(CONTENT_PROTOCOLS_JSON.as_bytes()))
}
