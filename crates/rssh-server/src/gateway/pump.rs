//! Bidirectional byte pump between a channel and a remote stream.
//!
//! Each direction runs in its own task. End of stream on one side half-closes
//! the other side's write direction and leaves the opposite direction
//! running. An error in either direction cancels the other, and so does the
//! channel going away while the remote is still silent. The channel is
//! closed and the remote stream dropped exactly once, after both directions
//! have stopped.

use crate::transport::{ChannelReader, ChannelWriter};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::debug;

/// How one direction of the pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionEnd {
    Eof,
    Error,
    /// Stopped because the other direction failed or the channel closed.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    /// Bytes copied from the channel to the remote.
    pub sent: u64,
    /// Bytes copied from the remote to the channel.
    pub received: u64,
    pub sent_end: DirectionEnd,
    pub received_end: DirectionEnd,
}

impl PumpReport {
    pub fn errored(&self) -> bool {
        self.sent_end == DirectionEnd::Error || self.received_end == DirectionEnd::Error
    }
}

/// Copy bytes both ways until both directions stop.
///
/// # Arguments
///
/// * `reader` / `writer` - The two halves of the accepted channel.
/// * `remote` - The dialed destination stream.
/// * `buffer_size` - Read buffer per direction.
/// * `closed` - Resolves when the channel itself is gone. Both directions
///   are then cancelled, whether or not the remote ever sends EOF.
///
/// # Note
///
/// The channel writer is closed once on return, and `remote` is dropped
/// with the direction tasks, so the destination sees the socket close.
pub async fn pump<S, F>(
    reader: ChannelReader,
    writer: ChannelWriter,
    remote: S,
    buffer_size: usize,
    closed: F,
) -> PumpReport
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let (remote_read, remote_write) = tokio::io::split(remote);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let cancel = Arc::new(cancel_tx);

    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            closed.await;
            debug!("channel closed, cancelling pump");
            let _ = cancel.send(true);
        })
    };

    let outgoing = tokio::spawn(channel_to_remote(
        reader,
        remote_write,
        cancel.clone(),
        cancel_rx.clone(),
        buffer_size,
    ));
    let incoming = tokio::spawn(remote_to_channel(
        remote_read,
        writer.clone(),
        cancel,
        cancel_rx,
        buffer_size,
    ));

    let (outgoing, incoming) = tokio::join!(outgoing, incoming);
    watcher.abort();
    let (sent, sent_end) = outgoing.unwrap_or((0, DirectionEnd::Error));
    let (received, received_end) = incoming.unwrap_or((0, DirectionEnd::Error));

    if let Err(e) = writer.close().await {
        debug!(error = %e, "channel close after pump failed");
    }

    PumpReport {
        sent,
        received,
        sent_end,
        received_end,
    }
}

async fn channel_to_remote<W>(
    mut reader: ChannelReader,
    mut remote: W,
    cancel: Arc<watch::Sender<bool>>,
    mut cancelled: watch::Receiver<bool>,
    buffer_size: usize,
) -> (u64, DirectionEnd)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            _ = cancelled.changed() => return (total, DirectionEnd::Cancelled),
        };
        match read {
            Ok(0) => {
                debug!(bytes = total, "channel EOF, half-closing remote");
                if let Err(e) = remote.shutdown().await {
                    debug!(error = %e, "remote shutdown failed");
                }
                return (total, DirectionEnd::Eof);
            }
            Ok(n) => {
                if let Err(e) = remote.write_all(&buf[..n]).await {
                    debug!(error = %e, "remote write failed");
                    let _ = cancel.send(true);
                    return (total, DirectionEnd::Error);
                }
                total += n as u64;
            }
            Err(e) => {
                debug!(error = %e, "channel read failed");
                let _ = cancel.send(true);
                return (total, DirectionEnd::Error);
            }
        }
    }
}

async fn remote_to_channel<R>(
    mut remote: R,
    writer: ChannelWriter,
    cancel: Arc<watch::Sender<bool>>,
    mut cancelled: watch::Receiver<bool>,
    buffer_size: usize,
) -> (u64, DirectionEnd)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut total = 0u64;
    loop {
        let read = tokio::select! {
            read = remote.read(&mut buf) => read,
            _ = cancelled.changed() => return (total, DirectionEnd::Cancelled),
        };
        match read {
            Ok(0) => {
                debug!(bytes = total, "remote EOF, closing channel output");
                if let Err(e) = writer.close().await {
                    debug!(error = %e, "channel close failed");
                }
                return (total, DirectionEnd::Eof);
            }
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    debug!(error = %e, "channel write failed");
                    let _ = cancel.send(true);
                    return (total, DirectionEnd::Error);
                }
                total += n as u64;
            }
            Err(e) => {
                debug!(error = %e, "remote read failed");
                let _ = cancel.send(true);
                return (total, DirectionEnd::Error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{channel_pair, ClientChannel};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::oneshot;

    async fn accepted_channel() -> (ChannelReader, ChannelWriter, ClientChannel) {
        let (pending, client) = channel_pair(0, "direct-tcpip", Vec::new());
        let parts = pending.accept().unwrap().into_parts();
        (parts.reader, parts.writer, client)
    }

    async fn loopback() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (dialed.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn echoes_through_remote() {
        let (reader, writer, mut client) = accepted_channel().await;
        let (ours, theirs) = loopback().await;
        tokio::spawn(async move {
            let (mut r, mut w) = theirs.into_split();
            tokio::io::copy(&mut r, &mut w).await.unwrap();
            w.shutdown().await.unwrap();
        });
        let pump = tokio::spawn(pump(reader, writer, ours, 1024, std::future::pending()));

        client.write(b"ping").await.unwrap();
        client.send_eof().await.unwrap();
        assert_eq!(client.read_to_end().await.unwrap(), b"ping");

        let report = pump.await.unwrap();
        assert_eq!(report.sent, 4);
        assert_eq!(report.received, 4);
        assert_eq!(report.sent_end, DirectionEnd::Eof);
        assert_eq!(report.received_end, DirectionEnd::Eof);
        assert!(!report.errored());
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn remote_eof_leaves_other_direction_open() {
        let (reader, writer, mut client) = accepted_channel().await;
        let (ours, mut theirs) = loopback().await;
        let pump = tokio::spawn(pump(reader, writer, ours, 1024, std::future::pending()));

        theirs.write_all(b"banner\n").await.unwrap();
        theirs.shutdown().await.unwrap();
        assert_eq!(client.read_to_end().await.unwrap(), b"banner\n");

        client.write(b"late request").await.unwrap();
        client.send_eof().await.unwrap();
        let mut got = Vec::new();
        theirs.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"late request");

        let report = pump.await.unwrap();
        assert_eq!(report.received, 7);
        assert_eq!(report.sent, 12);
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn write_failure_stops_both_directions() {
        let (reader, writer, mut client) = accepted_channel().await;
        let (remote, peer) = tokio::io::duplex(64);
        drop(peer);
        let pump = tokio::spawn(pump(reader, writer, remote, 1024, std::future::pending()));

        client.write(b"data").await.unwrap();
        let report = pump.await.unwrap();
        assert_eq!(report.sent_end, DirectionEnd::Error);
        assert!(report.errored());
        assert_eq!(client.read_to_end().await.unwrap(), b"");
        assert_eq!(client.close_count(), 1);
    }

    #[tokio::test]
    async fn channel_close_cancels_silent_remote() {
        let (reader, writer, mut client) = accepted_channel().await;
        let (ours, mut theirs) = loopback().await;
        let (close_tx, close_rx) = oneshot::channel::<()>();
        let pump = tokio::spawn(pump(reader, writer, ours, 1024, async move {
            let _ = close_rx.await;
        }));

        client.write(b"x").await.unwrap();
        let mut first = [0u8; 1];
        theirs.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"x");

        close_tx.send(()).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(2), pump)
            .await
            .expect("pump still running after channel close")
            .unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(report.sent_end, DirectionEnd::Cancelled);
        assert_eq!(report.received_end, DirectionEnd::Cancelled);
        assert!(!report.errored());

        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(client.read_to_end().await.unwrap(), b"");
        assert_eq!(client.close_count(), 1);
    }
}
