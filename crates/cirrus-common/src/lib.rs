//! Common types for Cirrus: CRDs, errors, the object store, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Finalizer holding deletion until identity, network, and allocation are released
pub const RELEASE_FINALIZER: &str = "compute.cirrus.dev/release";

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "cirrus-operator";

/// Default namespace for Cirrus system resources
pub const CIRRUS_SYSTEM_NAMESPACE: &str = "cirrus-system";
