//! The engine's view of the multiplexed secure transport.
//!
//! A transport adapter (SSH library, test harness, ...) performs the
//! handshake and authentication, then hands the engine one [`Connection`] per
//! authenticated peer. Each connection yields [`PendingChannel`]s; accepting
//! one produces a [`LogicalChannel`] that is owned by exactly one handler.
//!
//! Replies and open confirmations travel back to the adapter through
//! `oneshot` senders, so every request is answered at most once by
//! construction.

pub mod memory;

use rssh_core::{RsshError, RsshResult};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

/// Byte stream of one logical channel.
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ChannelStream for T {}

/// Read side of a channel's byte stream.
pub type ChannelReader = ReadHalf<Box<dyn ChannelStream>>;

/// Who is on the other end of a connection, as established by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    /// SHA-256 fingerprint of the key the peer authenticated with.
    pub key_fingerprint: Option<String>,
    pub remote_addr: Option<SocketAddr>,
}

impl Identity {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }
}

/// One authenticated transport connection.
pub struct Connection {
    pub identity: Identity,
    /// Channel-open events, in arrival order.
    pub channels: mpsc::Receiver<PendingChannel>,
    /// Connection-level (global) requests.
    pub global_requests: mpsc::Receiver<ControlRequest>,
}

/// Reason codes for a rejected channel open (RFC 4254 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

impl RejectReason {
    pub fn code(self) -> u32 {
        match self {
            RejectReason::AdministrativelyProhibited => 1,
            RejectReason::ConnectFailed => 2,
            RejectReason::UnknownChannelType => 3,
            RejectReason::ResourceShortage => 4,
        }
    }
}

/// The engine's answer to a channel-open event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    Accept,
    Reject {
        reason: RejectReason,
        message: String,
    },
}

/// A channel the peer asked to open, not yet accepted or rejected.
pub struct PendingChannel {
    id: u32,
    channel_type: String,
    extra_data: Vec<u8>,
    stream: Box<dyn ChannelStream>,
    requests: mpsc::Receiver<ControlRequest>,
    decision: oneshot::Sender<OpenDecision>,
}

impl PendingChannel {
    pub fn new(
        id: u32,
        channel_type: impl Into<String>,
        extra_data: Vec<u8>,
        stream: Box<dyn ChannelStream>,
        requests: mpsc::Receiver<ControlRequest>,
        decision: oneshot::Sender<OpenDecision>,
    ) -> Self {
        Self {
            id,
            channel_type: channel_type.into(),
            extra_data,
            stream,
            requests,
            decision,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    pub fn extra_data(&self) -> &[u8] {
        &self.extra_data
    }

    /// Confirm the open and take ownership of the channel.
    pub fn accept(self) -> RsshResult<LogicalChannel> {
        self.decision
            .send(OpenDecision::Accept)
            .map_err(|_| RsshError::Transport("open confirmation not delivered".into()))?;
        Ok(LogicalChannel::new(self.id, self.stream, self.requests))
    }

    /// Refuse the open. The stream and request queue are dropped.
    pub fn reject(self, reason: RejectReason, message: impl Into<String>) -> RsshResult<()> {
        self.decision
            .send(OpenDecision::Reject {
                reason,
                message: message.into(),
            })
            .map_err(|_| RsshError::Transport("open failure not delivered".into()))
    }
}

/// A named, in-order control message on a channel or connection.
#[derive(Debug)]
pub struct ControlRequest {
    pub kind: String,
    pub payload: Vec<u8>,
    pub want_reply: bool,
    reply: Option<oneshot::Sender<bool>>,
}

impl ControlRequest {
    /// Build a request. The receiver is returned when `want_reply` is set and
    /// yields the engine's single accept/reject answer.
    pub fn new(
        kind: impl Into<String>,
        payload: Vec<u8>,
        want_reply: bool,
    ) -> (Self, Option<oneshot::Receiver<bool>>) {
        let (reply, rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        (
            Self {
                kind: kind.into(),
                payload,
                want_reply,
                reply,
            },
            rx,
        )
    }

    /// Answer the request. A no-op when no reply was requested.
    pub fn reply(mut self, ok: bool) -> RsshResult<()> {
        match self.reply.take() {
            Some(tx) => tx
                .send(ok)
                .map_err(|_| RsshError::Transport(format!("reply to {} not delivered", self.kind))),
            None => Ok(()),
        }
    }
}

struct WriterState {
    half: WriteHalf<Box<dyn ChannelStream>>,
    closed: bool,
}

/// Shared write side of a channel's byte stream.
///
/// Cloneable so a relay task and the owning handler can both write; writes
/// are serialised. [`ChannelWriter::close`] shuts the stream down once no
/// matter how many clones call it.
#[derive(Clone)]
pub struct ChannelWriter {
    channel_id: u32,
    state: Arc<Mutex<WriterState>>,
}

impl ChannelWriter {
    fn new(channel_id: u32, half: WriteHalf<Box<dyn ChannelStream>>) -> Self {
        Self {
            channel_id,
            state: Arc::new(Mutex::new(WriterState {
                half,
                closed: false,
            })),
        }
    }

    pub async fn write_all(&self, data: &[u8]) -> RsshResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RsshError::Channel(format!(
                "channel {} already closed",
                self.channel_id
            )));
        }
        state
            .half
            .write_all(data)
            .await
            .map_err(|e| RsshError::Transport(format!("channel write failed: {e}")))?;
        state
            .half
            .flush()
            .await
            .map_err(|e| RsshError::Transport(format!("channel flush failed: {e}")))
    }

    /// Signal end of stream and release the write side.
    pub async fn close(&self) -> RsshResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        debug!(channel_id = self.channel_id, "closing channel");
        state
            .half
            .shutdown()
            .await
            .map_err(|e| RsshError::Transport(format!("channel shutdown failed: {e}")))
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

/// An accepted channel: byte stream plus its ordered request queue.
pub struct LogicalChannel {
    id: u32,
    reader: ChannelReader,
    writer: ChannelWriter,
    requests: mpsc::Receiver<ControlRequest>,
}

/// The pieces of a [`LogicalChannel`], for handlers that drive them from
/// separate tasks.
pub struct ChannelParts {
    pub id: u32,
    pub reader: ChannelReader,
    pub writer: ChannelWriter,
    pub requests: mpsc::Receiver<ControlRequest>,
}

impl LogicalChannel {
    pub fn new(
        id: u32,
        stream: Box<dyn ChannelStream>,
        requests: mpsc::Receiver<ControlRequest>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id,
            reader,
            writer: ChannelWriter::new(id, writer),
            requests,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    pub async fn next_request(&mut self) -> Option<ControlRequest> {
        self.requests.recv().await
    }

    /// Write a human-readable message to the peer. Failures are logged only.
    ///
    /// The returned future owns a writer handle and does not borrow the
    /// channel, so it stays `Send` whatever stream backs the channel.
    pub fn write_diagnostic(&self, message: &str) -> impl Future<Output = ()> + Send + 'static {
        let writer = self.writer.clone();
        let channel_id = self.id;
        let message = message.to_owned();
        async move { write_diagnostic(&writer, channel_id, &message).await }
    }

    pub fn into_parts(self) -> ChannelParts {
        ChannelParts {
            id: self.id,
            reader: self.reader,
            writer: self.writer,
            requests: self.requests,
        }
    }

    pub async fn close(self) {
        if let Err(e) = self.writer.close().await {
            debug!(channel_id = self.id, error = %e, "channel close failed");
        }
    }
}

/// Write a diagnostic line through a writer, logging (not returning) failures.
pub async fn write_diagnostic(writer: &ChannelWriter, channel_id: u32, message: &str) {
    if let Err(e) = writer.write_all(message.as_bytes()).await {
        warn!(channel_id, error = %e, "failed to write diagnostic to channel");
    }
}

#[cfg(test)]
mod tests {
    use super::memory::channel_pair;
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn accept_confirms_open() {
        let (pending, mut client) = channel_pair(7, "session", Vec::new());
        assert_eq!(pending.id(), 7);
        assert_eq!(pending.channel_type(), "session");
        let channel = pending.accept().unwrap();
        assert_eq!(channel.id(), 7);
        assert_eq!(client.decision().await.unwrap(), OpenDecision::Accept);
    }

    #[tokio::test]
    async fn reject_carries_reason() {
        let (pending, mut client) = channel_pair(1, "x11", Vec::new());
        pending
            .reject(RejectReason::UnknownChannelType, "nope")
            .unwrap();
        assert_eq!(
            client.decision().await.unwrap(),
            OpenDecision::Reject {
                reason: RejectReason::UnknownChannelType,
                message: "nope".into(),
            }
        );
        assert_eq!(RejectReason::UnknownChannelType.code(), 3);
    }

    #[tokio::test]
    async fn reply_is_delivered_once() {
        let (req, rx) = ControlRequest::new("shell", Vec::new(), true);
        req.reply(true).unwrap();
        assert!(rx.unwrap().await.unwrap());

        let (req, rx) = ControlRequest::new("env", Vec::new(), false);
        assert!(rx.is_none());
        req.reply(false).unwrap();
    }

    #[tokio::test]
    async fn writer_close_is_idempotent() {
        let (pending, mut client) = channel_pair(2, "session", Vec::new());
        let channel = pending.accept().unwrap();
        let writer = channel.writer();
        writer.write_all(b"bye").await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        channel.close().await;
        assert!(writer.write_all(b"late").await.is_err());

        let mut out = Vec::new();
        client.stream().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bye");
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn diagnostic_can_be_spawned() {
        let (pending, mut client) = channel_pair(3, "direct-tcpip", Vec::new());
        let channel = pending.accept().unwrap();
        tokio::spawn(channel.write_diagnostic("no route\n"))
            .await
            .unwrap();
        channel.close().await;

        let mut out = Vec::new();
        client.stream().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"no route\n");
    }
}
