//! Per-channel session request state machine.
//!
//! ```text
//! Idle ──pty-req/env──▶ Configuring ──shell/exec──▶ Running ──exit──▶ Closed
//!   └──────────────────shell/exec──────────────────────┘
//! ```
//!
//! Requests are processed strictly in arrival order and each one that wants
//! a reply gets exactly one, sent after its transition has completed. Once
//! running, channel bytes and upstream bytes are relayed by two tasks while
//! the machine keeps serving `window-change` and waits for the upstream to
//! exit.

use super::upstream::{ExitFuture, Launch, UpstreamFactory, UpstreamIo, UpstreamSession};
use crate::transport::{
    write_diagnostic, ChannelReader, ChannelWriter, ControlRequest, Identity, LogicalChannel,
};
use rssh_core::{PtyParameters, RsshError, RsshResult, SessionRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RELAY_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configuring,
    Running,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long to keep relaying upstream output after the upstream exits.
    pub drain_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_millis(500),
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

enum Event {
    Request(Option<ControlRequest>),
    Exited(RsshResult<u32>),
}

struct Relay {
    input: JoinHandle<()>,
    output: JoinHandle<()>,
}

pub struct SessionMachine {
    channel_id: u32,
    reader: Option<ChannelReader>,
    writer: ChannelWriter,
    requests: mpsc::Receiver<ControlRequest>,
    identity: Arc<Identity>,
    factory: Arc<dyn UpstreamFactory>,
    settings: SessionSettings,
    state: SessionState,
    upstream: Option<Box<dyn UpstreamSession>>,
    pty: Option<PtyParameters>,
    env: Vec<(String, String)>,
    exit: Option<ExitFuture>,
    relay: Option<Relay>,
}

async fn wait_exit(exit: &mut Option<ExitFuture>) -> RsshResult<u32> {
    match exit {
        Some(exit) => exit.await,
        None => std::future::pending().await,
    }
}

impl SessionMachine {
    pub fn new(
        channel: LogicalChannel,
        identity: Arc<Identity>,
        factory: Arc<dyn UpstreamFactory>,
        settings: SessionSettings,
    ) -> Self {
        let parts = channel.into_parts();
        Self {
            channel_id: parts.id,
            reader: Some(parts.reader),
            writer: parts.writer,
            requests: parts.requests,
            identity,
            factory,
            settings,
            state: SessionState::Idle,
            upstream: None,
            pty: None,
            env: Vec::new(),
            exit: None,
            relay: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the channel until it closes. Always ends in [`SessionState::Closed`].
    pub async fn run(mut self) -> SessionState {
        info!(channel_id = self.channel_id, user = %self.identity.user, "session started");
        loop {
            let event = tokio::select! {
                request = self.requests.recv() => Event::Request(request),
                status = wait_exit(&mut self.exit) => Event::Exited(status),
            };
            match event {
                Event::Request(Some(request)) => {
                    if let Flow::Stop = self.handle(request).await {
                        break;
                    }
                }
                Event::Request(None) => {
                    debug!(channel_id = self.channel_id, "request stream ended");
                    break;
                }
                Event::Exited(status) => {
                    self.exit = None;
                    match status {
                        Ok(code) => info!(channel_id = self.channel_id, code, "upstream exited"),
                        Err(e) => warn!(channel_id = self.channel_id, error = %e, "upstream wait failed"),
                    }
                    self.drain_output().await;
                    break;
                }
            }
        }
        self.shutdown().await;
        self.state
    }

    async fn handle(&mut self, request: ControlRequest) -> Flow {
        let kind = request.kind.clone();
        let (ok, flow) = match SessionRequest::decode(&request.kind, &request.payload) {
            Ok(decoded) => self.apply(decoded).await,
            Err(e) => {
                warn!(channel_id = self.channel_id, request = %kind, error = %e, "malformed request");
                write_diagnostic(
                    &self.writer,
                    self.channel_id,
                    &format!("malformed {kind} request: {e}\n"),
                )
                .await;
                (false, Flow::Stop)
            }
        };
        debug!(channel_id = self.channel_id, request = %kind, ok, state = ?self.state, "request handled");

        if let Err(e) = request.reply(ok) {
            warn!(channel_id = self.channel_id, error = %e, "failed to send reply");
            return Flow::Stop;
        }
        flow
    }

    async fn apply(&mut self, request: SessionRequest) -> (bool, Flow) {
        match request {
            SessionRequest::PtyReq(params) => {
                if self.state == SessionState::Running {
                    return (false, Flow::Continue);
                }
                if let Err(e) = self.ensure_upstream().await {
                    warn!(channel_id = self.channel_id, error = %e, "failed to open upstream");
                    write_diagnostic(
                        &self.writer,
                        self.channel_id,
                        &format!("failed to open upstream session: {e}\n"),
                    )
                    .await;
                    return (false, Flow::Stop);
                }
                debug!(
                    channel_id = self.channel_id,
                    term = %params.term,
                    cols = params.columns,
                    rows = params.rows,
                    modes = %params.modes,
                    "pty requested"
                );
                self.pty = Some(params);
                self.state = SessionState::Configuring;
                (true, Flow::Continue)
            }
            SessionRequest::Env { name, value } => {
                if self.state == SessionState::Running {
                    return (false, Flow::Continue);
                }
                debug!(channel_id = self.channel_id, %name, "env requested");
                self.env.push((name, value));
                self.state = SessionState::Configuring;
                (true, Flow::Continue)
            }
            SessionRequest::WindowChange(size) => match (self.state, self.upstream.as_mut()) {
                (SessionState::Running, Some(upstream)) => match upstream.resize(size).await {
                    Ok(()) => (true, Flow::Continue),
                    Err(e) => {
                        warn!(channel_id = self.channel_id, error = %e, "resize failed");
                        (false, Flow::Continue)
                    }
                },
                // The terminal is sized from pty-req when the session starts.
                _ => {
                    debug!(channel_id = self.channel_id, "window-change before start ignored");
                    (true, Flow::Continue)
                }
            },
            SessionRequest::Shell => self.launch(None).await,
            SessionRequest::Exec(command) => self.launch(Some(command)).await,
            SessionRequest::Unsupported(kind) => {
                warn!(channel_id = self.channel_id, request = %kind, "unsupported request");
                write_diagnostic(
                    &self.writer,
                    self.channel_id,
                    &format!("unsupported request type: {kind}\n"),
                )
                .await;
                (false, Flow::Stop)
            }
        }
    }

    async fn launch(&mut self, command: Option<String>) -> (bool, Flow) {
        if self.state == SessionState::Running {
            return (false, Flow::Continue);
        }
        let launch = Launch {
            command,
            pty: self.pty.clone(),
            env: std::mem::take(&mut self.env),
        };
        let label = launch.command.clone().unwrap_or_else(|| "<shell>".into());
        match self.start_upstream(launch).await {
            Ok(io) => {
                self.begin_relay(io);
                self.state = SessionState::Running;
                info!(channel_id = self.channel_id, command = %label, pty = self.pty.is_some(), "session running");
                (true, Flow::Continue)
            }
            Err(e) => {
                warn!(channel_id = self.channel_id, error = %e, "failed to start upstream");
                write_diagnostic(
                    &self.writer,
                    self.channel_id,
                    &format!("failed to start session: {e}\n"),
                )
                .await;
                (false, Flow::Stop)
            }
        }
    }

    async fn ensure_upstream(&mut self) -> RsshResult<()> {
        if self.upstream.is_none() {
            let opened = self.factory.open(&self.identity).await?;
            self.upstream = Some(opened);
        }
        Ok(())
    }

    async fn start_upstream(&mut self, launch: Launch) -> RsshResult<UpstreamIo> {
        self.ensure_upstream().await?;
        let upstream = self
            .upstream
            .as_mut()
            .ok_or_else(|| RsshError::Upstream("no upstream session".into()))?;
        upstream.start(launch).await
    }

    fn begin_relay(&mut self, io: UpstreamIo) {
        let UpstreamIo {
            input,
            mut output,
            exit,
        } = io;
        self.exit = Some(exit);
        let channel_id = self.channel_id;

        let reader = self.reader.take();
        let input_task = tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return;
            };
            let mut buf = vec![0u8; RELAY_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        debug!(channel_id, "channel input finished");
                        break;
                    }
                    Ok(n) => {
                        if input.send(buf[..n].to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(channel_id, error = %e, "channel read failed");
                        break;
                    }
                }
            }
        });

        let writer = self.writer.clone();
        let output_task = tokio::spawn(async move {
            while let Some(chunk) = output.recv().await {
                if let Err(e) = writer.write_all(&chunk).await {
                    debug!(channel_id, error = %e, "channel write failed");
                    break;
                }
            }
        });

        self.relay = Some(Relay {
            input: input_task,
            output: output_task,
        });
    }

    async fn drain_output(&mut self) {
        let Some(relay) = self.relay.as_mut() else {
            return;
        };
        if tokio::time::timeout(self.settings.drain_timeout, &mut relay.output)
            .await
            .is_err()
        {
            debug!(channel_id = self.channel_id, "output drain timed out");
        }
    }

    async fn shutdown(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.input.abort();
            relay.output.abort();
        }
        self.exit = None;
        self.upstream = None;
        if let Err(e) = self.writer.close().await {
            debug!(channel_id = self.channel_id, error = %e, "channel close failed");
        }
        self.state = SessionState::Closed;
        info!(channel_id = self.channel_id, "session closed");
    }
}
