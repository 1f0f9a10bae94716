//! Routing logic for the gateway
//!
//! Maps an HTTP host and path to a configured [`Mapping`]. Paths match
//! exactly unless the configured path ends in `/`, in which case it matches
//! as a directory. Hosts match exactly (port stripped, case-insensitive),
//! with mappings for the empty host acting as a fallback for any host.

pub mod http;
pub mod mapping;
pub mod registry;

pub use http::{HttpRouter, HttpRouterError};
pub use mapping::{HostPath, Mapping, MappingAuth};
pub use registry::{PathPattern, RouteError, RouteRegistry};
