//! Outbound TCP dialing for direct forwards.
//!
//! The [`Dialer`] trait is the seam between the forward handler and the
//! network; [`TcpDialer`] is the production implementation.

use super::policy::{ConnectionGuard, PolicyEnforcer};
use super::resolver::Resolver;
use futures_util::future::BoxFuture;
use rssh_core::{ForwardTarget, RsshError, RsshResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// An established outbound connection.
pub struct Outbound {
    pub stream: TcpStream,
    /// The resolved address that accepted the connection.
    pub peer: SocketAddr,
    /// Keeps the forward counted against the policy limit while held.
    pub guard: Option<ConnectionGuard>,
}

/// Opens the outbound side of a `direct-tcpip` forward.
///
/// Implementations are shared by every connection and must be cheap to call
/// concurrently.
pub trait Dialer: Send + Sync {
    /// Connect to `target`.
    ///
    /// # Errors
    ///
    /// - [`RsshError::InvalidTarget`] for an empty or non-UTF-8 host, or a
    ///   port outside `1..=65535`. Nothing is resolved in that case.
    /// - [`RsshError::PolicyDenied`] when a policy refuses the destination or
    ///   the forward limit is reached.
    /// - [`RsshError::Dial`] when resolution fails or every address refuses
    ///   or times out.
    fn dial<'a>(&'a self, target: &'a ForwardTarget) -> BoxFuture<'a, RsshResult<Outbound>>;
}

/// [`Dialer`] over plain TCP.
///
/// For each target it validates the address, takes a policy slot (when a
/// policy is attached), resolves the host, then tries each address in turn
/// under `connect_timeout`. The first success wins; `TCP_NODELAY` is set on
/// the stream.
pub struct TcpDialer {
    connect_timeout: Duration,
    policy: Option<Arc<PolicyEnforcer>>,
}

impl TcpDialer {
    /// A dialer with no destination policy.
    ///
    /// # Arguments
    ///
    /// * `connect_timeout` - Applied to each address separately, so a host
    ///   with several addresses may take a multiple of it overall.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            policy: None,
        }
    }

    /// Check every dial against `policy`. The policy is shared, so one
    /// enforcer can cap forwards across all connections.
    pub fn with_policy(mut self, policy: Arc<PolicyEnforcer>) -> Self {
        self.policy = Some(policy);
        self
    }

    async fn connect(&self, target: &ForwardTarget) -> RsshResult<Outbound> {
        let (host, port) = target.dial_address()?;
        let guard = self
            .policy
            .as_ref()
            .map(|policy| policy.admit(host, port))
            .transpose()?;

        let mut last_error = String::from("no addresses");
        for addr in Resolver::resolve(host, port).await? {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%addr, error = %e, "set_nodelay failed");
                    }
                    debug!(host = %host, %addr, "connected");
                    return Ok(Outbound {
                        stream,
                        peer: addr,
                        guard,
                    });
                }
                Ok(Err(e)) => {
                    debug!(%addr, error = %e, "connect failed");
                    last_error = format!("{addr}: {e}");
                }
                Err(_) => {
                    debug!(%addr, "connect timed out");
                    last_error = format!(
                        "{addr}: timed out after {}ms",
                        self.connect_timeout.as_millis()
                    );
                }
            }
        }
        Err(RsshError::Dial(format!(
            "error dialing {host}:{port}: {last_error}"
        )))
    }
}

impl Dialer for TcpDialer {
    fn dial<'a>(&'a self, target: &'a ForwardTarget) -> BoxFuture<'a, RsshResult<Outbound>> {
        Box::pin(self.connect(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::policy::DestinationPolicy;
    use tokio::net::TcpListener;

    fn target(host: &str, port: u32) -> ForwardTarget {
        ForwardTarget {
            host_to_connect: host.as_bytes().to_vec(),
            port_to_connect: port,
            originator_address: b"127.0.0.1".to_vec(),
            originator_port: 50000,
        }
    }

    #[tokio::test]
    async fn dials_loopback_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dialer = TcpDialer::new(Duration::from_secs(5));
        let outbound = dialer.dial(&target("127.0.0.1", port.into())).await.unwrap();
        assert_eq!(outbound.peer.port(), port);
        assert!(outbound.guard.is_none());
        listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_a_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = TcpDialer::new(Duration::from_secs(5))
            .dial(&target("127.0.0.1", port.into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RsshError::Dial(_)), "{err}");
    }

    #[tokio::test]
    async fn invalid_targets_are_rejected_before_dialing() {
        let dialer = TcpDialer::new(Duration::from_secs(5));
        for bad in [target("127.0.0.1", 0), target("127.0.0.1", 70000), target("", 22)] {
            let err = dialer.dial(&bad).await.err().unwrap();
            assert!(matches!(err, RsshError::InvalidTarget(_)), "{err}");
        }
        let non_utf8 = ForwardTarget {
            host_to_connect: vec![0xC3, 0x28],
            ..target("x", 22)
        };
        assert!(matches!(
            dialer.dial(&non_utf8).await,
            Err(RsshError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn policy_is_checked_and_guard_held() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let policy = Arc::new(PolicyEnforcer::new(DestinationPolicy {
            allowed_destinations: vec![format!("127.0.0.1:{port}")],
            max_connections: 1,
        }));
        let dialer = TcpDialer::new(Duration::from_secs(5)).with_policy(policy.clone());

        let denied = dialer.dial(&target("localhost", port.into())).await.err().unwrap();
        assert!(matches!(denied, RsshError::PolicyDenied(_)));

        let outbound = dialer.dial(&target("127.0.0.1", port.into())).await.unwrap();
        assert_eq!(policy.active_connections(), 1);
        let limited = dialer.dial(&target("127.0.0.1", port.into())).await.err().unwrap();
        assert!(matches!(limited, RsshError::PolicyDenied(_)));

        drop(outbound);
        assert_eq!(policy.active_connections(), 0);
    }
}
