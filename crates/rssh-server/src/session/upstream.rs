//! Upstream session capability.
//!
//! A session channel is bridged to an upstream session obtained from an
//! [`UpstreamFactory`]. The engine only sees byte queues and an exit future;
//! how the upstream runs the command is its own business.

use crate::transport::Identity;
use futures_util::future::BoxFuture;
use rssh_core::{PtyParameters, RsshResult, WindowChange};
use tokio::sync::mpsc;

/// Resolves with the upstream's exit status once the command has finished.
pub type ExitFuture = BoxFuture<'static, RsshResult<u32>>;

/// Everything the upstream needs to start a shell or command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Launch {
    /// `None` starts the login shell.
    pub command: Option<String>,
    /// Terminal to allocate, as accepted from the last `pty-req`.
    pub pty: Option<PtyParameters>,
    /// Variables from `env` requests, in arrival order.
    pub env: Vec<(String, String)>,
}

/// Byte plumbing of a started upstream.
///
/// Dropping `input` signals end of input. `output` ends once the upstream
/// has no more output.
pub struct UpstreamIo {
    pub input: mpsc::Sender<Vec<u8>>,
    pub output: mpsc::Receiver<Vec<u8>>,
    pub exit: ExitFuture,
}

/// One upstream session, opened for one session channel.
///
/// Dropping the session terminates anything it started.
pub trait UpstreamSession: Send {
    /// Apply new terminal dimensions to a running terminal. Without one
    /// (not started yet, or started without a PTY) this is a no-op.
    fn resize(&mut self, size: WindowChange) -> BoxFuture<'_, RsshResult<()>>;

    fn start(&mut self, launch: Launch) -> BoxFuture<'_, RsshResult<UpstreamIo>>;
}

pub trait UpstreamFactory: Send + Sync {
    fn open<'a>(&'a self, identity: &'a Identity)
        -> BoxFuture<'a, RsshResult<Box<dyn UpstreamSession>>>;
}
