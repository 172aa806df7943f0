//! Clients for the region and identity services
//!
//! Traits at the seam ([`RegionApi`], [`IdentityApi`], [`BackendProvider`])
//! let the engine run against mocks or in-process fakes. The HTTP
//! implementations enforce the services' status-code contract and map
//! everything else onto `cirrus_common::Error`.

#![deny(missing_docs)]

pub mod http;
pub mod identity;
pub mod provider;
pub mod region;
pub mod scope;
pub mod tags;

pub use identity::{Allocation, AllocationWrite, IdentityApi, ResourceAllocation};
pub use provider::{BackendConfig, BackendProvider, Backends, HttpBackendProvider, TokenSource};
pub use region::RegionApi;
pub use scope::{DeleteOutcome, IdentityScope, ProjectScope};
pub use tags::Owner;

#[cfg(feature = "mock")]
pub use identity::MockIdentityApi;
#[cfg(feature = "mock")]
pub use region::MockRegionApi;
