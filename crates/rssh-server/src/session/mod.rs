//! Interactive session channels.

pub mod local;
pub mod machine;
pub mod pty;
pub mod upstream;

pub use machine::{SessionMachine, SessionSettings, SessionState};
pub use upstream::{Launch, UpstreamFactory, UpstreamIo, UpstreamSession};

use crate::router::ChannelTypeHandler;
use crate::transport::{Identity, LogicalChannel};
use futures_util::future::BoxFuture;
use rssh_core::ChannelOpen;
use std::sync::Arc;

/// Handler for `session` channels: runs one [`SessionMachine`] per channel.
pub struct SessionHandler {
    factory: Arc<dyn UpstreamFactory>,
    settings: SessionSettings,
}

impl SessionHandler {
    pub fn new(factory: Arc<dyn UpstreamFactory>, settings: SessionSettings) -> Self {
        Self { factory, settings }
    }
}

impl ChannelTypeHandler for SessionHandler {
    fn handle(
        &self,
        _open: ChannelOpen,
        channel: LogicalChannel,
        identity: Arc<Identity>,
    ) -> BoxFuture<'static, ()> {
        let machine =
            SessionMachine::new(channel, identity, self.factory.clone(), self.settings.clone());
        Box::pin(async move {
            machine.run().await;
        })
    }
}
