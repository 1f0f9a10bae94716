//! HTTP host/path routing

use crate::mapping::Mapping;
use crate::registry::{RouteError, RouteRegistry};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// HTTP routing errors
#[derive(Debug, Error)]
pub enum HttpRouterError {
    #[error("Route error: {0}")]
    RouteError(#[from] RouteError),

    #[error("Invalid host header: {0}")]
    InvalidHost(String),
}

/// HTTP router
pub struct HttpRouter {
    registry: Arc<RouteRegistry>,
}

impl HttpRouter {
    pub fn new(registry: Arc<RouteRegistry>) -> Self {
        Self { registry }
    }

    /// Build a router from configured mappings
    pub fn from_mappings<'a>(
        mappings: impl IntoIterator<Item = &'a Mapping>,
    ) -> Result<Self, HttpRouterError> {
        let router = Self::new(Arc::new(RouteRegistry::new()));
        for mapping in mappings {
            router.register_mapping(mapping.clone())?;
        }
        Ok(router)
    }

    /// Register a mapping
    pub fn register_mapping(&self, mapping: Mapping) -> Result<(), HttpRouterError> {
        debug!(
            "Registering HTTP route: {} -> {}",
            mapping.from,
            mapping.to.as_deref().unwrap_or("(tunnels only)")
        );

        let mut mapping = mapping;
        mapping.from.host = Self::normalize_host(&mapping.from.host)?;
        self.registry.register(mapping)?;
        Ok(())
    }

    /// Lookup route by host header and request path
    pub fn lookup(&self, host: &str, path: &str) -> Result<Arc<Mapping>, HttpRouterError> {
        trace!("Looking up HTTP route for //{}{}", host, path);

        let normalized_host = Self::normalize_host(host)?;
        let mapping = self.registry.lookup(&normalized_host, path)?;
        Ok(mapping)
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    /// Normalize host header (lowercase, port removed)
    pub fn normalize_host(host: &str) -> Result<String, HttpRouterError> {
        let host = host.trim();

        // Bracketed IPv6 literal, e.g. "[::1]:8080"
        if let Some(rest) = host.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| HttpRouterError::InvalidHost(host.to_string()))?;
            return Ok(format!("[{}]", rest[..end].to_ascii_lowercase()));
        }

        let name = host.split(':').next().unwrap_or(host);
        if name.contains(|c: char| c.is_whitespace() || c == '/') {
            return Err(HttpRouterError::InvalidHost(host.to_string()));
        }
        Ok(name.to_ascii_lowercase())
    }
}
