//! rssh-server: the channel dispatch and session proxy engine.
//!
//! Sits behind an SSH transport that has already authenticated the peer.
//! Each channel-open is routed by type: `session` channels drive a request
//! state machine in front of an upstream shell, `direct-tcpip` channels are
//! dialed and pumped to their destination.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;

pub use config::{ConfigOverrides, GatewayConfig};
pub use router::{ChannelRouter, ChannelTypeHandler, RouteOutcome};
pub use rssh_core::{RsshError, RsshResult};
pub use server::Gateway;
pub use transport::{Connection, Identity, LogicalChannel, PendingChannel};
