//! Shared plumbing for the msaf workspace.
//!
//! Wire-level error codes and RFC 7807 problem bodies, resource metadata
//! (entity tags, modification times, conditional request evaluation),
//! identifier minting, per-interface API descriptors for the `Server`
//! header, and the HTTP listener abstraction that lets each configured
//! endpoint pick an HTTP/1.1 or HTTP/2 backend.

pub mod api;
pub mod error;
pub mod ids;
pub mod metadata;
pub mod problem;
pub mod server;

pub use error::ErrorCode;
pub use metadata::ResourceMetadata;
pub use problem::{InvalidParam, Problem};
