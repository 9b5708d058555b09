//! Core server: accepts authenticated connections from the transport and
//! routes their channels.
//!
//! Owns the channel router and the authentication verifier handed to the
//! transport adapter. One task runs per connection; each channel-open is
//! routed without waiting on earlier channels.

use crate::auth::{AcceptAnyKey, AuthenticationVerifier, AuthorizedKeysVerifier};
use crate::config::GatewayConfig;
use crate::gateway::{DestinationPolicy, Dialer, ForwardHandler, PolicyEnforcer, TcpDialer};
use crate::router::{ChannelRouter, ChannelTypeHandler, RouteOutcome};
use crate::session::local::LocalUpstreamFactory;
use crate::session::{SessionHandler, SessionSettings, UpstreamFactory};
use crate::transport::{Connection, ControlRequest, Identity};
use rssh_core::RsshResult;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The rssh gateway instance.
pub struct Gateway {
    config: GatewayConfig,
    router: Arc<ChannelRouter>,
    verifier: Arc<dyn AuthenticationVerifier>,
}

impl Gateway {
    /// Build a gateway that runs sessions on the local host and dials
    /// forwards over TCP, as configured.
    pub fn new(config: GatewayConfig) -> RsshResult<Self> {
        let factory: Arc<dyn UpstreamFactory> = Arc::new(LocalUpstreamFactory::new(
            config.shell.clone(),
            config.default_term.clone(),
        ));

        let policy = Arc::new(PolicyEnforcer::new(DestinationPolicy {
            allowed_destinations: config.allowed_destinations.clone(),
            max_connections: config.max_connections,
        }));
        let dialer: Arc<dyn Dialer> =
            Arc::new(TcpDialer::new(config.connect_timeout).with_policy(policy));

        let verifier: Arc<dyn AuthenticationVerifier> = match &config.authorized_keys_path {
            Some(path) => Arc::new(AuthorizedKeysVerifier::from_file(path)?),
            None => {
                warn!("no authorized_keys configured, any public key will be accepted");
                Arc::new(AcceptAnyKey)
            }
        };

        Ok(Self::with_capabilities(config, factory, dialer, verifier))
    }

    /// Build a gateway from explicit capabilities.
    pub fn with_capabilities(
        config: GatewayConfig,
        factory: Arc<dyn UpstreamFactory>,
        dialer: Arc<dyn Dialer>,
        verifier: Arc<dyn AuthenticationVerifier>,
    ) -> Self {
        let session: Arc<dyn ChannelTypeHandler> = Arc::new(SessionHandler::new(
            factory,
            SessionSettings {
                drain_timeout: config.drain_timeout,
            },
        ));
        let forward = config.forward_enabled.then(|| {
            Arc::new(ForwardHandler::new(dialer, config.relay_buffer_size))
                as Arc<dyn ChannelTypeHandler>
        });
        if forward.is_none() {
            info!("direct-tcpip forwarding disabled");
        }

        Self {
            router: Arc::new(ChannelRouter::new(session, forward)),
            verifier,
            config,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Verifier for the transport adapter to consult during authentication.
    pub fn verifier(&self) -> Arc<dyn AuthenticationVerifier> {
        self.verifier.clone()
    }

    pub fn router(&self) -> Arc<ChannelRouter> {
        self.router.clone()
    }

    /// Accept connections until `incoming` ends or `shutdown` resolves.
    ///
    /// Connections already running are not interrupted; their channels end
    /// through their normal close paths.
    pub async fn serve<F>(
        &self,
        mut incoming: mpsc::Receiver<Connection>,
        shutdown: F,
    ) -> RsshResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(listen = %self.config.listen, "gateway accepting connections");

        loop {
            tokio::select! {
                connection = incoming.recv() => match connection {
                    Some(connection) => {
                        let router = self.router.clone();
                        tokio::spawn(handle_connection(router, connection));
                    }
                    None => {
                        info!("transport closed, no more connections");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Serve one connection: refuse global requests and route every channel.
pub async fn handle_connection(router: Arc<ChannelRouter>, connection: Connection) {
    let Connection {
        identity,
        mut channels,
        global_requests,
    } = connection;
    let identity = Arc::new(identity);
    info!(user = %identity.user, remote = ?identity.remote_addr, "connection established");

    let globals = tokio::spawn(refuse_global_requests(identity.clone(), global_requests));

    let (mut accepted, mut rejected) = (0u32, 0u32);
    while let Some(pending) = channels.recv().await {
        match router.route(pending, &identity) {
            RouteOutcome::Spawned { .. } => accepted += 1,
            RouteOutcome::Rejected { .. } => rejected += 1,
            RouteOutcome::Failed { .. } => {}
        }
    }
    globals.abort();

    info!(user = %identity.user, accepted, rejected, "connection closed");
}

async fn refuse_global_requests(
    identity: Arc<Identity>,
    mut requests: mpsc::Receiver<ControlRequest>,
) {
    while let Some(request) = requests.recv().await {
        debug!(user = %identity.user, request = %request.kind, want_reply = request.want_reply, "refusing global request");
        if let Err(e) = request.reply(false) {
            debug!(error = %e, "global reply not delivered");
        }
    }
}
