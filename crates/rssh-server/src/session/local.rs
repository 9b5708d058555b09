//! Upstream backend that runs commands on the local host.
//!
//! With a PTY the command runs on a pseudo-terminal (see [`super::pty`]);
//! without one it runs with piped stdio, stderr merged into the output.

use super::pty::{PtyCommand, PtyHandle};
use super::upstream::{ExitFuture, Launch, UpstreamFactory, UpstreamIo, UpstreamSession};
use crate::transport::Identity;
use futures_util::future::BoxFuture;
use rssh_core::{RsshError, RsshResult, WindowChange};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

const READ_CHUNK: usize = 8192;
const QUEUE_DEPTH: usize = 64;

pub struct LocalUpstreamFactory {
    shell: String,
    default_term: String,
}

impl LocalUpstreamFactory {
    pub fn new(shell: impl Into<String>, default_term: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            default_term: default_term.into(),
        }
    }
}

impl UpstreamFactory for LocalUpstreamFactory {
    fn open<'a>(
        &'a self,
        identity: &'a Identity,
    ) -> BoxFuture<'a, RsshResult<Box<dyn UpstreamSession>>> {
        Box::pin(async move {
            debug!(user = %identity.user, shell = %self.shell, "opening local upstream");
            Ok(Box::new(LocalSession {
                shell: self.shell.clone(),
                default_term: self.default_term.clone(),
                pty: None,
                started: false,
            }) as Box<dyn UpstreamSession>)
        })
    }
}

struct LocalSession {
    shell: String,
    default_term: String,
    pty: Option<PtyHandle>,
    started: bool,
}

impl UpstreamSession for LocalSession {
    fn resize(&mut self, size: WindowChange) -> BoxFuture<'_, RsshResult<()>> {
        Box::pin(async move {
            match self.pty.as_mut() {
                Some(pty) => pty.resize(size),
                None => {
                    debug!(columns = size.columns, rows = size.rows, "no pty, resize ignored");
                    Ok(())
                }
            }
        })
    }

    fn start(&mut self, launch: Launch) -> BoxFuture<'_, RsshResult<UpstreamIo>> {
        Box::pin(async move {
            if self.started {
                return Err(RsshError::Upstream("session already started".into()));
            }
            self.started = true;

            match launch.pty {
                Some(params) => {
                    let size = params.size();
                    let term = if params.term.is_empty() {
                        self.default_term.as_str()
                    } else {
                        params.term.as_str()
                    };
                    let (handle, io) = PtyHandle::spawn(
                        PtyCommand {
                            shell: &self.shell,
                            command: launch.command.as_deref(),
                            env: &launch.env,
                            term,
                        },
                        size,
                    )?;
                    self.pty = Some(handle);
                    Ok(io)
                }
                None => spawn_piped(&self.shell, launch.command.as_deref(), &launch.env),
            }
        })
    }
}

fn spawn_piped(
    shell: &str,
    command: Option<&str>,
    env: &[(String, String)],
) -> RsshResult<UpstreamIo> {
    let mut cmd = Command::new(shell);
    if let Some(command) = command {
        cmd.arg("-c").arg(command);
    }
    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| RsshError::Upstream(format!("failed to spawn {shell}: {e}")))?;
    let missing = |name: &str| RsshError::Upstream(format!("child {name} not captured"));
    let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
    info!(shell, command = command.unwrap_or("<shell>"), "process spawned");

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(data) = input_rx.recv().await {
            if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                break;
            }
        }
    });

    let (output_tx, output_rx) = mpsc::channel(QUEUE_DEPTH);
    tokio::spawn(forward_output(stdout, output_tx.clone()));
    tokio::spawn(forward_output(stderr, output_tx));

    let exit: ExitFuture = Box::pin(async move {
        let status = child
            .wait()
            .await
            .map_err(|e| RsshError::Upstream(format!("wait error: {e}")))?;
        let code = status.code().map(|c| c as u32).unwrap_or(255);
        info!(code, "process exited");
        Ok(code)
    });

    Ok(UpstreamIo {
        input: input_tx,
        output: output_rx,
        exit,
    })
}

async fn forward_output<R: AsyncRead + Unpin>(mut source: R, sink: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sink.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}
