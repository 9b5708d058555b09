//! PTY-backed process using portable-pty.
//!
//! Opens a pseudo-terminal of the requested size, spawns the shell (or
//! `shell -c command`) on it, and exposes the terminal as an [`UpstreamIo`].

use super::upstream::{ExitFuture, UpstreamIo};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use rssh_core::{RsshError, RsshResult, WindowChange};
use std::io::{Read, Write};
use tokio::sync::mpsc;
use tracing::{debug, info};

const READ_CHUNK: usize = 8192;
const QUEUE_DEPTH: usize = 64;

/// What to run on the terminal.
pub struct PtyCommand<'a> {
    pub shell: &'a str,
    pub command: Option<&'a str>,
    pub env: &'a [(String, String)],
    pub term: &'a str,
}

/// A running PTY child. Dropping the handle kills the child.
pub struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    size: WindowChange,
}

fn pty_size(size: WindowChange) -> PtySize {
    let clamp = |v: u32| u16::try_from(v).unwrap_or(u16::MAX);
    PtySize {
        rows: clamp(size.rows),
        cols: clamp(size.columns),
        pixel_width: clamp(size.pixel_width),
        pixel_height: clamp(size.pixel_height),
    }
}

impl PtyHandle {
    /// Spawn the command on a fresh PTY of the given size.
    pub fn spawn(run: PtyCommand<'_>, size: WindowChange) -> RsshResult<(Self, UpstreamIo)> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| RsshError::Upstream(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(run.shell);
        if let Some(command) = run.command {
            cmd.arg("-c");
            cmd.arg(command);
        }
        for (key, value) in run.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", run.term);

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RsshError::Upstream(format!("failed to spawn {}: {e}", run.shell)))?;
        drop(pair.slave);

        info!(cols = size.columns, rows = size.rows, term = %run.term, "PTY spawned");

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RsshError::Upstream(format!("failed to clone PTY reader: {e}")))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| RsshError::Upstream(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        let (output_tx, output_rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("PTY reader finished");
        });

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(QUEUE_DEPTH);
        tokio::task::spawn_blocking(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).and_then(|_| writer.flush()).is_err() {
                    break;
                }
            }
        });

        let wait = tokio::task::spawn_blocking(move || child.wait());
        let exit: ExitFuture = Box::pin(async move {
            let status = wait
                .await
                .map_err(|e| RsshError::Upstream(format!("join error: {e}")))?
                .map_err(|e| RsshError::Upstream(format!("wait error: {e}")))?;
            let code = status.exit_code();
            info!(code, "PTY child exited");
            Ok(code)
        });

        Ok((
            Self {
                master: pair.master,
                killer,
                size,
            },
            UpstreamIo {
                input: input_tx,
                output: output_rx,
                exit,
            },
        ))
    }

    pub fn resize(&mut self, size: WindowChange) -> RsshResult<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| RsshError::Upstream(format!("PTY resize failed: {e}")))?;
        self.size = size;
        debug!(cols = size.columns, rows = size.rows, "PTY resized");
        Ok(())
    }

    pub fn size(&self) -> WindowChange {
        self.size
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        // Already-exited children report an error here.
        let _ = self.killer.kill();
    }
}
