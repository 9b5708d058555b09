//! Destination policy for direct forwards: which `host:port` pairs may be
//! dialed and how many forwards may be open at once.
//!
//! [`DestinationPolicy`] is the configured form; [`PolicyEnforcer`] parses it
//! into rules and tracks live forwards. Admission and counting happen in one
//! step, so the limit holds under concurrent opens.

use rssh_core::{RsshError, RsshResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Forwarding access-control rules.
///
/// `allowed_destinations` entries:
///
/// | Pattern              | Matches                         |
/// |----------------------|---------------------------------|
/// | `"*"`                | Any host and port.              |
/// | `"db.internal"`      | The host on any port.           |
/// | `"db.internal:5432"` | The exact host and port pair.   |
/// | `"[::1]:22"`         | IPv6 literal with a port.       |
///
/// Host names compare case-insensitively. An empty list allows nothing.
#[derive(Debug, Clone)]
pub struct DestinationPolicy {
    pub allowed_destinations: Vec<String>,
    /// Concurrent forwards across all connections.
    pub max_connections: usize,
}

impl Default for DestinationPolicy {
    fn default() -> Self {
        Self {
            allowed_destinations: vec!["*".to_string()],
            max_connections: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    Any,
    Host(String),
    HostPort(String, u16),
}

impl Rule {
    fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Rule::Any;
        }
        if let Some(rest) = pattern.strip_prefix('[') {
            if let Some((host, port)) = rest.split_once("]:") {
                if let Ok(port) = port.parse() {
                    return Rule::HostPort(host.to_ascii_lowercase(), port);
                }
            }
            return Rule::Host(rest.trim_end_matches(']').to_ascii_lowercase());
        }
        match pattern.rsplit_once(':') {
            // A second colon means a bare IPv6 literal, not host:port.
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => Rule::HostPort(host.to_ascii_lowercase(), port),
                Err(_) => {
                    warn!(pattern, "ignoring port in destination pattern");
                    Rule::Host(host.to_ascii_lowercase())
                }
            },
            _ => Rule::Host(pattern.to_ascii_lowercase()),
        }
    }

    fn matches(&self, host: &str, port: u16) -> bool {
        match self {
            Rule::Any => true,
            Rule::Host(h) => h.eq_ignore_ascii_case(host),
            Rule::HostPort(h, p) => *p == port && h.eq_ignore_ascii_case(host),
        }
    }
}

/// Parsed [`DestinationPolicy`] plus the count of live forwards.
///
/// Shared behind an `Arc` by every dialer that enforces it.
pub struct PolicyEnforcer {
    rules: Vec<Rule>,
    max_connections: usize,
    active: Arc<AtomicUsize>,
}

impl PolicyEnforcer {
    /// Parse the allowlist patterns. A pattern with an unparsable port is
    /// kept as a host-only rule and logged.
    pub fn new(policy: DestinationPolicy) -> Self {
        Self {
            rules: policy
                .allowed_destinations
                .iter()
                .map(|p| Rule::parse(p))
                .collect(),
            max_connections: policy.max_connections,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Whether `host:port` is on the allowlist. Ignores the connection limit.
    ///
    /// # Arguments
    ///
    /// * `host` - Compared case-insensitively; a bracketed IPv6 literal
    ///   (`"[::1]"`) matches the same rules as the bare form.
    /// * `port` - Only consulted by `host:port` rules.
    pub fn allows(&self, host: &str, port: u16) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        self.rules.iter().any(|rule| rule.matches(host, port))
    }

    /// Admit one forward to `host:port`, counting it until the guard drops.
    ///
    /// # Errors
    ///
    /// [`RsshError::PolicyDenied`] if the destination is not allowed or the
    /// limit is reached.
    ///
    /// # Note
    ///
    /// The slot is taken with a single compare-and-swap, so concurrent
    /// admissions never overshoot `max_connections`. Hold the guard for the
    /// whole life of the forward.
    pub fn admit(&self, host: &str, port: u16) -> RsshResult<ConnectionGuard> {
        if !self.allows(host, port) {
            return Err(RsshError::PolicyDenied(format!(
                "destination not allowed: {host}:{port}"
            )));
        }

        let max = self.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|n| {
                RsshError::PolicyDenied(format!("connection limit reached ({n}/{max})"))
            })?;

        Ok(ConnectionGuard {
            counter: self.active.clone(),
        })
    }

    /// Forwards currently holding a [`ConnectionGuard`].
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// One admitted forward. Dropping it frees the slot.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
