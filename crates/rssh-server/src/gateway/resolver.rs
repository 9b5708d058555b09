//! Host resolution via `tokio::net::lookup_host`.
//!
//! A thin async wrapper returning socket addresses ready to connect to. Used
//! by [`super::dialer::TcpDialer`] after the policy has admitted the target.

use rssh_core::{RsshError, RsshResult};
use std::net::SocketAddr;
use tokio::net;
use tracing::{debug, warn};

/// Stateless async resolver; the struct only namespaces the call.
pub struct Resolver;

impl Resolver {
    /// Resolve `host` (name or IP literal) to socket addresses for `port`.
    ///
    /// Resolution is non-blocking; IP literals come back without a lookup.
    ///
    /// # Arguments
    ///
    /// * `host` - A host name (`"db.internal"`) or an IPv4/IPv6 literal.
    ///   IPv6 literals are given bare, without brackets.
    /// * `port` - Copied into every returned address.
    ///
    /// # Errors
    ///
    /// [`RsshError::Dial`] when the lookup fails (e.g. NXDOMAIN) or yields
    /// no addresses.
    ///
    /// # Note
    ///
    /// Addresses are returned in resolver order, v4 and v6 mixed. Callers
    /// try them in turn.
    pub async fn resolve(host: &str, port: u16) -> RsshResult<Vec<SocketAddr>> {
        match net::lookup_host((host, port)).await {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    debug!(host = %host, "no addresses found");
                    Err(RsshError::Dial(format!("no addresses found for {host}")))
                } else {
                    debug!(host = %host, count = addrs.len(), "resolved");
                    Ok(addrs)
                }
            }
            Err(e) => {
                warn!(host = %host, error = %e, "resolution failed");
                Err(RsshError::Dial(format!("error resolving {host}:{port}: {e}")))
            }
        }
    }
}
