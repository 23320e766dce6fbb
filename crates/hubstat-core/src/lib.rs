//! hubstat-core — bundle versions, wire format, and configuration.
//! All other Hubstat crates depend on this one.

pub mod config;
pub mod message;
pub mod version;
pub mod wire;

pub use message::{BundleEnvelope, TransportMessage, TransportPosition, WireError};
pub use version::{BundleVersion, SendState, VersionError};
