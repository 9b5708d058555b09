//! `direct-tcpip` channels: dial the requested destination and pump bytes
//! between it and the channel.
//!
//! Failures never reach other channels. They are written to the channel as a
//! one-line diagnostic, logged, and the channel is closed.

use super::dialer::{Dialer, Outbound};
use super::pump::pump;
use crate::router::ChannelTypeHandler;
use crate::transport::{ControlRequest, Identity, LogicalChannel};
use futures_util::future::BoxFuture;
use rssh_core::{ChannelOpen, ForwardTarget, RsshError, RsshResult};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Handler for `direct-tcpip` channels.
///
/// Each accepted channel gets one task that dials the target, then pumps
/// bytes until both directions end or the channel is closed. The dialer's
/// [`Outbound::guard`] is held for exactly that long.
pub struct ForwardHandler {
    dialer: Arc<dyn Dialer>,
    buffer_size: usize,
}

impl ForwardHandler {
    /// # Arguments
    ///
    /// * `dialer` - Opens the outbound connection and applies any policy.
    /// * `buffer_size` - Pump read buffer per direction.
    pub fn new(dialer: Arc<dyn Dialer>, buffer_size: usize) -> Self {
        Self {
            dialer,
            buffer_size,
        }
    }
}

impl ChannelTypeHandler for ForwardHandler {
    fn handle(
        &self,
        open: ChannelOpen,
        channel: LogicalChannel,
        identity: Arc<Identity>,
    ) -> BoxFuture<'static, ()> {
        let dialer = self.dialer.clone();
        let buffer_size = self.buffer_size;
        let target = match open {
            ChannelOpen::DirectTcpip(target) => target,
            other => Err(RsshError::UnsupportedChannelType(
                other.channel_type().to_string(),
            )),
        };
        Box::pin(forward(dialer, buffer_size, target, channel, identity))
    }
}

async fn forward(
    dialer: Arc<dyn Dialer>,
    buffer_size: usize,
    target: RsshResult<ForwardTarget>,
    channel: LogicalChannel,
    identity: Arc<Identity>,
) {
    let channel_id = channel.id();
    let target = match target {
        Ok(target) => target,
        Err(e) => {
            warn!(channel_id, error = %e, "malformed direct-tcpip request");
            channel
                .write_diagnostic(&format!("malformed direct-tcpip request: {e}\n"))
                .await;
            channel.close().await;
            return;
        }
    };

    let Outbound {
        stream,
        peer,
        guard,
    } = match dialer.dial(&target).await {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!(channel_id, target = %target, error = %e, "forward failed");
            channel
                .write_diagnostic(&format!(
                    "failed to connect to {}:{}: {e}\n",
                    target.host(),
                    target.port_to_connect
                ))
                .await;
            channel.close().await;
            return;
        }
    };
    info!(channel_id, user = %identity.user, target = %target, %peer, "forward established");

    let parts = channel.into_parts();
    let closed = drain_requests(channel_id, parts.requests);
    let report = pump(parts.reader, parts.writer, stream, buffer_size, closed).await;
    drop(guard);

    info!(
        channel_id,
        sent = report.sent,
        received = report.received,
        errored = report.errored(),
        "forward closed"
    );
}

/// Requests on a forward channel carry no meaning; answer any that want a
/// reply with failure and keep the channel running. Returns once the request
/// stream ends, which is how the transport reports the channel closing.
async fn drain_requests(channel_id: u32, mut requests: mpsc::Receiver<ControlRequest>) {
    while let Some(request) = requests.recv().await {
        debug!(channel_id, request = %request.kind, want_reply = request.want_reply, "request on forward channel");
        if let Err(e) = request.reply(false) {
            debug!(channel_id, error = %e, "reply not delivered");
        }
    }
    debug!(channel_id, "forward channel closed by peer");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::dialer::TcpDialer;
    use crate::gateway::policy::{DestinationPolicy, PolicyEnforcer};
    use crate::transport::memory::{channel_pair, ClientChannel};
    use rssh_core::codec::encode_direct_forward;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn payload(host: &str, port: u32) -> Vec<u8> {
        encode_direct_forward(&ForwardTarget {
            host_to_connect: host.as_bytes().to_vec(),
            port_to_connect: port,
            originator_address: b"127.0.0.1".to_vec(),
            originator_port: 54321,
        })
    }

    fn open(extra: Vec<u8>) -> (ClientChannel, JoinHandle<()>) {
        open_with(TcpDialer::new(Duration::from_secs(5)), extra)
    }

    fn open_with(dialer: TcpDialer, extra: Vec<u8>) -> (ClientChannel, JoinHandle<()>) {
        let (pending, client) = channel_pair(3, "direct-tcpip", extra.clone());
        let channel = pending.accept().unwrap();
        let handler = ForwardHandler::new(Arc::new(dialer), 4096);
        let task = tokio::spawn(handler.handle(
            ChannelOpen::decode("direct-tcpip", &extra),
            channel,
            Arc::new(Identity::new("alice")),
        ));
        (client, task)
    }

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = stream.into_split();
            tokio::io::copy(&mut r, &mut w).await.unwrap();
            w.shutdown().await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn relays_to_destination() {
        let port = echo_server().await;
        let (mut client, task) = open(payload("127.0.0.1", port.into()));
        client.write(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        client.send_eof().await.unwrap();
        assert_eq!(
            client.read_to_end().await.unwrap(),
            b"GET / HTTP/1.0\r\n\r\n"
        );
        task.await.unwrap();
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn requests_are_answered_without_closing() {
        let port = echo_server().await;
        let (mut client, task) = open(payload("127.0.0.1", port.into()));
        let reply = client
            .request("keepalive@openssh.com", Vec::new(), true)
            .await
            .unwrap();
        assert_eq!(reply, Some(false));

        client.write(b"still open").await.unwrap();
        client.send_eof().await.unwrap();
        assert_eq!(client.read_to_end().await.unwrap(), b"still open");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn dial_failure_writes_diagnostic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (mut client, task) = open(payload("127.0.0.1", port.into()));
        task.await.unwrap();
        let out = String::from_utf8(client.read_to_end().await.unwrap()).unwrap();
        assert!(
            out.starts_with(&format!("failed to connect to 127.0.0.1:{port}: ")),
            "{out}"
        );
        assert!(out.ends_with('\n'));
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_writes_diagnostic() {
        let (mut client, task) = open(vec![0, 0, 0, 40, b'h']);
        task.await.unwrap();
        let out = String::from_utf8(client.read_to_end().await.unwrap()).unwrap();
        assert!(out.starts_with("malformed direct-tcpip request: "), "{out}");
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn invalid_port_writes_diagnostic() {
        let (mut client, task) = open(payload("127.0.0.1", 0));
        task.await.unwrap();
        let out = String::from_utf8(client.read_to_end().await.unwrap()).unwrap();
        assert!(out.contains("invalid forward target"), "{out}");
    }

    #[tokio::test]
    async fn channel_close_ends_forward_to_silent_remote() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let remote = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut first = [0u8; 5];
            stream.read_exact(&mut first).await.unwrap();
            assert_eq!(&first, b"hello");
            stream
        });

        let policy = Arc::new(PolicyEnforcer::new(DestinationPolicy {
            allowed_destinations: vec!["127.0.0.1".into()],
            max_connections: 1,
        }));
        let dialer = TcpDialer::new(Duration::from_secs(5)).with_policy(policy.clone());
        let (mut client, task) = open_with(dialer, payload("127.0.0.1", port.into()));

        client.write(b"hello").await.unwrap();
        // The remote never writes or closes; only the channel goes away.
        let mut held = remote.await.unwrap();
        client.close_requests();
        drop(client);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("forward still running after channel close")
            .unwrap();
        assert_eq!(policy.active_connections(), 0);

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), held.read_to_end(&mut rest))
            .await
            .expect("remote socket left open")
            .unwrap();
        assert!(rest.is_empty());
    }
}
