//! Direct TCP forwarding (`direct-tcpip` channels).
//!
//! # Submodules
//!
//! - **[`forwarder`]**: the [`ForwardHandler`] owns each forward channel. It
//!   dials through a [`Dialer`], reports failures on the channel, and hands
//!   established connections to the pump.
//! - **[`dialer`]**: the [`Dialer`] capability and its [`TcpDialer`]
//!   implementation (validation, policy check, resolution, connect timeout).
//! - **[`policy`]**: destination allowlist and concurrent-forward limit.
//! - **[`resolver`]**: async host resolution via `tokio::net::lookup_host`.
//! - **[`pump`]**: the bidirectional byte pump.
//!
//! # Data Flow
//!
//! ```text
//! direct-tcpip open
//!   → ChannelRouter::route (router.rs)
//!     → ForwardHandler::handle
//!         → TcpDialer::dial
//!             → PolicyEnforcer::admit
//!             → Resolver::resolve
//!             → TcpStream::connect (per address, with timeout)
//!         → pump(channel, stream), cancelled when the request drain ends
//! ```

pub mod dialer;
pub mod forwarder;
pub mod policy;
pub mod pump;
pub mod resolver;

pub use dialer::{Dialer, Outbound, TcpDialer};
pub use forwarder::ForwardHandler;
pub use policy::{DestinationPolicy, PolicyEnforcer};
pub use pump::{pump, PumpReport};
pub use resolver::Resolver;
