//! Channel-type routing.
//!
//! Every channel-open event is classified by its declared type and either
//! rejected or accepted and handed to exactly one handler task. Routing never
//! waits on a handler, so one slow channel cannot delay opens behind it.

use crate::transport::{Identity, LogicalChannel, PendingChannel, RejectReason};
use futures_util::future::BoxFuture;
use rssh_core::ChannelOpen;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns an accepted channel for its whole life.
///
/// One implementation exists per channel type the gateway serves. The router
/// holds each behind an `Arc` and calls it once per accepted channel.
pub trait ChannelTypeHandler: Send + Sync {
    /// Build the task that serves `channel` until it closes.
    ///
    /// # Arguments
    ///
    /// * `open` - The decoded open payload. A `direct-tcpip` payload that
    ///   failed to decode still arrives here, so the handler can report the
    ///   error on the channel.
    /// * `channel` - The accepted channel. The handler closes it when done.
    /// * `identity` - The authenticated peer.
    ///
    /// # Note
    ///
    /// The returned future is spawned, so it must not borrow from `self`.
    /// Clone whatever shared state it needs before boxing.
    fn handle(
        &self,
        open: ChannelOpen,
        channel: LogicalChannel,
        identity: Arc<Identity>,
    ) -> BoxFuture<'static, ()>;
}

/// What the router did with one channel-open event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Accepted; a handler task now owns the channel.
    Spawned { channel_id: u32, channel_type: String },
    Rejected { channel_id: u32, reason: RejectReason },
    /// The open could not be answered (peer already gone).
    Failed { channel_id: u32 },
}

/// Dispatches channel-open events by type.
///
/// - `session`: accepted and handed to the session handler.
/// - `direct-tcpip`: accepted and handed to the forward handler, or rejected
///   with `AdministrativelyProhibited` when forwarding is off.
/// - anything else: rejected with `UnknownChannelType`.
pub struct ChannelRouter {
    session: Arc<dyn ChannelTypeHandler>,
    forward: Option<Arc<dyn ChannelTypeHandler>>,
}

impl ChannelRouter {
    /// A router with session and direct-forward handlers. `forward` is `None`
    /// when forwarding is disabled by configuration.
    pub fn new(
        session: Arc<dyn ChannelTypeHandler>,
        forward: Option<Arc<dyn ChannelTypeHandler>>,
    ) -> Self {
        Self { session, forward }
    }

    /// Route one channel-open event. Returns as soon as the open is answered.
    ///
    /// Must be called from within a Tokio runtime: accepted channels are
    /// served by a spawned task.
    ///
    /// # Arguments
    ///
    /// * `pending` - The unanswered open. It is always answered here, with
    ///   accept or reject.
    /// * `identity` - Shared with the handler task.
    pub fn route(&self, pending: PendingChannel, identity: &Arc<Identity>) -> RouteOutcome {
        let channel_id = pending.id();
        let open = ChannelOpen::decode(pending.channel_type(), pending.extra_data());

        let handler = match &open {
            ChannelOpen::Session => Ok(&self.session),
            ChannelOpen::DirectTcpip(_) => self.forward.as_ref().ok_or((
                RejectReason::AdministrativelyProhibited,
                "port forwarding is disabled".to_string(),
            )),
            ChannelOpen::Unknown(kind) => Err((
                RejectReason::UnknownChannelType,
                format!("unsupported channel type: {kind}"),
            )),
        };

        match handler {
            Ok(handler) => match pending.accept() {
                Ok(channel) => {
                    let channel_type = open.channel_type().to_string();
                    info!(channel_id, channel_type = %channel_type, user = %identity.user, "channel accepted");
                    tokio::spawn(handler.handle(open, channel, identity.clone()));
                    RouteOutcome::Spawned {
                        channel_id,
                        channel_type,
                    }
                }
                Err(e) => {
                    warn!(channel_id, error = %e, "could not accept channel");
                    RouteOutcome::Failed { channel_id }
                }
            },
            Err((reason, message)) => {
                debug!(channel_id, channel_type = %open.channel_type(), %message, "rejecting channel");
                match pending.reject(reason, message) {
                    Ok(()) => RouteOutcome::Rejected { channel_id, reason },
                    Err(e) => {
                        warn!(channel_id, error = %e, "could not reject channel");
                        RouteOutcome::Failed { channel_id }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::channel_pair;
    use crate::transport::OpenDecision;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Recorder {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        seen: mpsc::UnboundedSender<(&'static str, u32)>,
    }

    impl ChannelTypeHandler for Recorder {
        fn handle(
            &self,
            _open: ChannelOpen,
            channel: LogicalChannel,
            _identity: Arc<Identity>,
        ) -> BoxFuture<'static, ()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let seen = self.seen.clone();
            let name = self.name;
            Box::pin(async move {
                let _ = seen.send((name, channel.id()));
            })
        }
    }

    fn router(
        with_forward: bool,
    ) -> (
        ChannelRouter,
        Arc<AtomicUsize>,
        mpsc::UnboundedReceiver<(&'static str, u32)>,
    ) {
        let calls = Arc::new(AtomicUsize::new(0));
        let (seen, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Recorder {
            name: "session",
            calls: calls.clone(),
            seen: seen.clone(),
        });
        let forward: Option<Arc<dyn ChannelTypeHandler>> = with_forward.then(|| {
            Arc::new(Recorder {
                name: "forward",
                calls: calls.clone(),
                seen,
            }) as Arc<dyn ChannelTypeHandler>
        });
        (ChannelRouter::new(session, forward), calls, rx)
    }

    #[tokio::test]
    async fn session_goes_to_session_handler() {
        let (router, _, mut seen) = router(true);
        let (pending, mut client) = channel_pair(4, "session", Vec::new());
        let outcome = router.route(pending, &Arc::new(Identity::new("alice")));
        assert!(matches!(outcome, RouteOutcome::Spawned { channel_id: 4, .. }));
        assert_eq!(client.decision().await.unwrap(), OpenDecision::Accept);
        assert_eq!(seen.recv().await.unwrap(), ("session", 4));
    }

    #[tokio::test]
    async fn direct_tcpip_goes_to_forward_handler_even_if_malformed() {
        let (router, _, mut seen) = router(true);
        let (pending, mut client) = channel_pair(5, "direct-tcpip", vec![0, 0, 0]);
        router.route(pending, &Arc::new(Identity::new("alice")));
        assert_eq!(client.decision().await.unwrap(), OpenDecision::Accept);
        assert_eq!(seen.recv().await.unwrap(), ("forward", 5));
    }

    #[tokio::test]
    async fn unknown_type_is_rejected_without_handler() {
        let (router, calls, _seen) = router(true);
        let (pending, mut client) = channel_pair(6, "x11", Vec::new());
        let outcome = router.route(pending, &Arc::new(Identity::new("alice")));
        assert_eq!(
            outcome,
            RouteOutcome::Rejected {
                channel_id: 6,
                reason: RejectReason::UnknownChannelType
            }
        );
        assert_eq!(
            client.decision().await.unwrap(),
            OpenDecision::Reject {
                reason: RejectReason::UnknownChannelType,
                message: "unsupported channel type: x11".into(),
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_forwarding_is_prohibited() {
        let (router, calls, _seen) = router(false);
        let (pending, mut client) = channel_pair(8, "direct-tcpip", Vec::new());
        router.route(pending, &Arc::new(Identity::new("alice")));
        assert!(matches!(
            client.decision().await.unwrap(),
            OpenDecision::Reject {
                reason: RejectReason::AdministrativelyProhibited,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn vanished_peer_is_reported() {
        let (router, _, _seen) = router(true);
        let (pending, client) = channel_pair(9, "session", Vec::new());
        drop(client);
        let outcome = router.route(pending, &Arc::new(Identity::new("alice")));
        assert_eq!(outcome, RouteOutcome::Failed { channel_id: 9 });
    }
}
