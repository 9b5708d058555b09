//! In-process transport built from duplex pipes and channels.
//!
//! Used by the integration tests and by embedders that already terminate the
//! secure transport elsewhere. The client half ([`ClientConnection`],
//! [`ClientChannel`]) plays the remote peer.

use super::{ChannelStream, Connection, ControlRequest, Identity, OpenDecision, PendingChannel};
use rssh_core::{RsshError, RsshResult};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};

const PIPE_CAPACITY: usize = 64 * 1024;
const QUEUE_DEPTH: usize = 32;

/// Server half of a channel pipe. Counts completed shutdowns so tests can
/// check that a channel is closed exactly once.
struct CountingStream {
    inner: DuplexStream,
    closes: Arc<AtomicUsize>,
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if let Poll::Ready(Ok(())) = result {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

/// Build a pending channel and the peer's view of it.
pub fn channel_pair(
    id: u32,
    channel_type: &str,
    extra_data: Vec<u8>,
) -> (PendingChannel, ClientChannel) {
    let (server_io, client_io) = tokio::io::duplex(PIPE_CAPACITY);
    let closes = Arc::new(AtomicUsize::new(0));
    let (requests_tx, requests_rx) = mpsc::channel(QUEUE_DEPTH);
    let (decision_tx, decision_rx) = oneshot::channel();

    let stream: Box<dyn ChannelStream> = Box::new(CountingStream {
        inner: server_io,
        closes: closes.clone(),
    });
    let pending = PendingChannel::new(
        id,
        channel_type,
        extra_data,
        stream,
        requests_rx,
        decision_tx,
    );
    let client = ClientChannel {
        id,
        stream: client_io,
        requests: Some(requests_tx),
        decision: Some(decision_rx),
        closes,
    };
    (pending, client)
}

/// Accept side of the in-memory transport: yields [`Connection`]s.
pub fn listener() -> (MemoryConnector, mpsc::Receiver<Connection>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    (MemoryConnector { tx }, rx)
}

/// Dials in-memory connections into a listener.
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::Sender<Connection>,
}

impl MemoryConnector {
    pub async fn connect(&self, identity: Identity) -> RsshResult<ClientConnection> {
        let (channels_tx, channels_rx) = mpsc::channel(QUEUE_DEPTH);
        let (global_tx, global_rx) = mpsc::channel(QUEUE_DEPTH);
        self.tx
            .send(Connection {
                identity,
                channels: channels_rx,
                global_requests: global_rx,
            })
            .await
            .map_err(|_| RsshError::Transport("listener closed".into()))?;
        Ok(ClientConnection {
            channels: channels_tx,
            global: global_tx,
            next_id: 0,
        })
    }
}

/// Peer side of one in-memory connection. Dropping it ends the connection.
pub struct ClientConnection {
    channels: mpsc::Sender<PendingChannel>,
    global: mpsc::Sender<ControlRequest>,
    next_id: u32,
}

impl ClientConnection {
    /// Send a channel-open event. Await [`ClientChannel::decision`] for the answer.
    pub async fn open_channel(
        &mut self,
        channel_type: &str,
        extra_data: Vec<u8>,
    ) -> RsshResult<ClientChannel> {
        let id = self.next_id;
        self.next_id += 1;
        let (pending, client) = channel_pair(id, channel_type, extra_data);
        self.channels
            .send(pending)
            .await
            .map_err(|_| RsshError::Transport("connection closed".into()))?;
        Ok(client)
    }

    pub async fn global_request(
        &self,
        kind: &str,
        payload: Vec<u8>,
        want_reply: bool,
    ) -> RsshResult<Option<bool>> {
        send_request(&self.global, kind, payload, want_reply).await
    }
}

/// Peer side of one channel.
pub struct ClientChannel {
    pub id: u32,
    stream: DuplexStream,
    requests: Option<mpsc::Sender<ControlRequest>>,
    decision: Option<oneshot::Receiver<OpenDecision>>,
    closes: Arc<AtomicUsize>,
}

impl ClientChannel {
    /// Wait for the engine to accept or reject the open.
    pub async fn decision(&mut self) -> RsshResult<OpenDecision> {
        let rx = self
            .decision
            .take()
            .ok_or_else(|| RsshError::Channel("decision already taken".into()))?;
        rx.await
            .map_err(|_| RsshError::Transport("channel dropped without a decision".into()))
    }

    /// Send a channel request, waiting for the reply when one is wanted.
    pub async fn request(
        &self,
        kind: &str,
        payload: Vec<u8>,
        want_reply: bool,
    ) -> RsshResult<Option<bool>> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| RsshError::Channel("request stream closed".into()))?;
        send_request(requests, kind, payload, want_reply).await
    }

    /// End the request stream, as the transport does when a channel closes.
    pub fn close_requests(&mut self) {
        self.requests = None;
    }

    pub fn stream(&mut self) -> &mut DuplexStream {
        &mut self.stream
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    /// Half-close the peer's sending direction.
    pub async fn send_eof(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.stream.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// How many times the engine shut this channel's stream down.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

async fn send_request(
    queue: &mpsc::Sender<ControlRequest>,
    kind: &str,
    payload: Vec<u8>,
    want_reply: bool,
) -> RsshResult<Option<bool>> {
    let (request, reply) = ControlRequest::new(kind, payload, want_reply);
    queue
        .send(request)
        .await
        .map_err(|_| RsshError::Channel("request stream closed".into()))?;
    match reply {
        Some(rx) => rx
            .await
            .map(Some)
            .map_err(|_| RsshError::Transport(format!("{kind} dropped without a reply"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_delivers_channels_in_order() {
        let (connector, mut incoming) = listener();
        let mut client = connector.connect(Identity::new("alice")).await.unwrap();
        let mut conn = incoming.recv().await.unwrap();
        assert_eq!(conn.identity.user, "alice");

        let _a = client.open_channel("session", Vec::new()).await.unwrap();
        let _b = client.open_channel("direct-tcpip", vec![1]).await.unwrap();
        let first = conn.channels.recv().await.unwrap();
        let second = conn.channels.recv().await.unwrap();
        assert_eq!((first.id(), first.channel_type()), (0, "session"));
        assert_eq!((second.id(), second.channel_type()), (1, "direct-tcpip"));
        assert_eq!(second.extra_data(), &[1]);
    }

    #[tokio::test]
    async fn requests_round_trip_replies() {
        let (pending, client) = channel_pair(0, "session", Vec::new());
        let mut channel = pending.accept().unwrap();
        let server = tokio::spawn(async move {
            let req = channel.next_request().await.unwrap();
            assert_eq!(req.kind, "shell");
            req.reply(false).unwrap();
        });
        assert_eq!(
            client.request("shell", Vec::new(), true).await.unwrap(),
            Some(false)
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_connection_ends_channel_stream() {
        let (connector, mut incoming) = listener();
        let client = connector.connect(Identity::new("bob")).await.unwrap();
        let mut conn = incoming.recv().await.unwrap();
        drop(client);
        assert!(conn.channels.recv().await.is_none());
        assert!(conn.global_requests.recv().await.is_none());
    }
}
