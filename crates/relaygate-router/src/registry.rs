//! Route registry keyed by host, with per-host path patterns
//!
//! Lookup order:
//! 1. Mappings for the exact host, most specific path first
//! 2. Mappings for the empty (any) host, most specific path first
//! 3. Not found

use crate::mapping::Mapping;
use dashmap::DashMap;
use std::cmp::Reverse;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Route registry errors
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("No route for host {host:?} path {path:?}")]
    RouteNotFound { host: String, path: String },

    #[error("Route already exists: //{host}{path}")]
    RouteAlreadyExists { host: String, path: String },

    #[error("Invalid path {0:?}: paths must start with '/'")]
    InvalidPath(String),
}

/// A configured path, matched per segment
///
/// `/glad` only matches `/glad`. `/oppose/` is a directory: it matches
/// `/oppose`, `/oppose/` and anything below, but not `/opposed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    /// Configured path without trailing separators
    prefix: String,
    directory: bool,
}

impl PathPattern {
    pub fn parse(path: &str) -> Result<Self, RouteError> {
        if !path.starts_with('/') {
            return Err(RouteError::InvalidPath(path.to_string()));
        }
        let directory = path.ends_with('/');
        let prefix = if directory {
            path.trim_end_matches('/').to_string()
        } else {
            path.to_string()
        };
        Ok(Self { prefix, directory })
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = if path.is_empty() { "/" } else { path };
        if !self.directory {
            return path == self.prefix;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Longer prefixes win; at equal length an exact path beats a directory.
    fn specificity(&self) -> (usize, bool) {
        (self.prefix.len(), !self.directory)
    }
}

#[derive(Debug, Clone)]
struct RouteEntry {
    pattern: PathPattern,
    mapping: Arc<Mapping>,
}

/// Route registry for host/path mappings
pub struct RouteRegistry {
    /// Normalized host to entries sorted by decreasing specificity
    routes: Arc<DashMap<String, Vec<RouteEntry>>>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(DashMap::new()),
        }
    }

    /// Register a mapping under its host and path
    pub fn register(&self, mapping: Mapping) -> Result<(), RouteError> {
        let host = mapping.from.host.to_ascii_lowercase();
        let pattern = PathPattern::parse(&mapping.from.path)?;

        let mut entries = self.routes.entry(host.clone()).or_default();
        if entries.iter().any(|e| e.pattern == pattern) {
            return Err(RouteError::RouteAlreadyExists {
                host,
                path: mapping.from.path,
            });
        }

        trace!("Registering route //{}{}", host, mapping.from.path);
        entries.push(RouteEntry {
            pattern,
            mapping: Arc::new(mapping),
        });
        entries.sort_by_key(|e| Reverse(e.pattern.specificity()));
        Ok(())
    }

    /// Lookup the most specific mapping for a normalized host and a path
    pub fn lookup(&self, host: &str, path: &str) -> Result<Arc<Mapping>, RouteError> {
        if let Some(mapping) = self.lookup_host(host, path) {
            trace!("Found route for //{}{}", host, path);
            return Ok(mapping);
        }

        if !host.is_empty() {
            if let Some(mapping) = self.lookup_host("", path) {
                trace!("Found fallback route for //{}{}", host, path);
                return Ok(mapping);
            }
        }

        Err(RouteError::RouteNotFound {
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    fn lookup_host(&self, host: &str, path: &str) -> Option<Arc<Mapping>> {
        let entries = self.routes.get(host)?;
        entries
            .iter()
            .find(|e| e.pattern.matches(path))
            .map(|e| e.mapping.clone())
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}
