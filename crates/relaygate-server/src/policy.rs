//! Allow-list of tunnel targets

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part<T> {
    Any,
    Exact(T),
}

impl<T: PartialEq> Part<T> {
    fn matches(&self, value: &T) -> bool {
        match self {
            Part::Any => true,
            Part::Exact(expected) => expected == value,
        }
    }
}

/// One allowed target: `*`, `host:port`, `host:*` or `*:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPattern {
    host: Part<String>,
    port: Part<u16>,
}

impl TargetPattern {
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Ok(Self {
                host: Part::Any,
                port: Part::Any,
            });
        }

        let (host, port) = pattern
            .rsplit_once(':')
            .ok_or_else(|| format!("tunnel pattern {:?} must be '*' or 'host:port'", pattern))?;
        if host.is_empty() {
            return Err(format!("tunnel pattern {:?} has an empty host", pattern));
        }

        let host = match host {
            "*" => Part::Any,
            host => Part::Exact(normalize(host)),
        };
        let port = match port {
            "*" => Part::Any,
            port => Part::Exact(
                port.parse()
                    .map_err(|_| format!("tunnel pattern {:?} has an invalid port", pattern))?,
            ),
        };
        Ok(Self { host, port })
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.host.matches(&normalize(host)) && self.port.matches(&port)
    }
}

impl fmt::Display for TargetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, &self.port) {
            (Part::Any, Part::Any) => write!(f, "*"),
            (Part::Any, Part::Exact(port)) => write!(f, "*:{}", port),
            (Part::Exact(host), Part::Any) => write!(f, "{}:*", host),
            (Part::Exact(host), Part::Exact(port)) => write!(f, "{}:{}", host, port),
        }
    }
}

fn normalize(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase()
}

/// Which backends tunnels may reach
///
/// An empty policy disables the tunnel endpoint altogether.
#[derive(Debug, Clone, Default)]
pub struct TunnelPolicy {
    patterns: Vec<TargetPattern>,
}

impl TunnelPolicy {
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Result<Self, String> {
        let patterns = patterns
            .iter()
            .map(|p| TargetPattern::parse(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_enabled(&self) -> bool {
        !self.patterns.is_empty()
    }

    pub fn allows(&self, host: &str, port: u16) -> bool {
        self.patterns.iter().any(|p| p.matches(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard() {
        let policy = TunnelPolicy::parse(&["*"]).unwrap();
        assert!(policy.is_enabled());
        assert!(policy.allows("db.internal", 5432));
    }

    #[test]
    fn test_host_and_port_patterns() {
        let policy = TunnelPolicy::parse(&["db.internal:5432", "cache:*", "*:22"]).unwrap();
        assert!(policy.allows("DB.internal", 5432));
        assert!(!policy.allows("db.internal", 5433));
        assert!(policy.allows("cache", 6379));
        assert!(policy.allows("anything", 22));
        assert!(!policy.allows("anything", 23));
    }

    #[test]
    fn test_ipv6() {
        let policy = TunnelPolicy::parse(&["[::1]:8080"]).unwrap();
        assert!(policy.allows("::1", 8080));
        assert!(policy.allows("[::1]", 8080));
    }

    #[test]
    fn test_empty_policy_is_disabled() {
        let policy = TunnelPolicy::parse::<&str>(&[]).unwrap();
        assert!(!policy.is_enabled());
        assert!(!policy.allows("localhost", 80));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(TargetPattern::parse("localhost").is_err());
        assert!(TargetPattern::parse(":80").is_err());
        assert!(TargetPattern::parse("localhost:http").is_err());
        assert_eq!(TargetPattern::parse("Cache:*").unwrap().to_string(), "cache:*");
    }
}
