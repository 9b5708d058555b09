//! Typed channel-open and channel-request payloads.
//!
//! The transport hands the engine opaque byte buffers whose meaning depends
//! on the channel or request type. They are decoded once, at the boundary,
//! into the types below.

use crate::codec;
use crate::error::{RsshError, RsshResult};
use crate::terminal::TerminalModes;
use std::borrow::Cow;
use std::fmt;

/// Channel type of an interactive session.
pub const CHANNEL_SESSION: &str = "session";
/// Channel type of a client-requested TCP forward.
pub const CHANNEL_DIRECT_TCPIP: &str = "direct-tcpip";

pub const REQUEST_PTY: &str = "pty-req";
pub const REQUEST_ENV: &str = "env";
pub const REQUEST_WINDOW_CHANGE: &str = "window-change";
pub const REQUEST_SHELL: &str = "shell";
pub const REQUEST_EXEC: &str = "exec";

/// Pseudo-terminal parameters from a `pty-req` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyParameters {
    /// Value for `TERM` (e.g. `xterm-256color`).
    pub term: String,
    pub columns: u32,
    pub rows: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub modes: TerminalModes,
}

impl PtyParameters {
    pub fn size(&self) -> WindowChange {
        WindowChange {
            columns: self.columns,
            rows: self.rows,
            pixel_width: self.pixel_width,
            pixel_height: self.pixel_height,
        }
    }
}

/// Terminal dimensions from a `window-change` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowChange {
    pub columns: u32,
    pub rows: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

/// Destination of a `direct-tcpip` channel.
///
/// Host fields keep the exact bytes the client sent. The originator fields
/// are informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub host_to_connect: Vec<u8>,
    pub port_to_connect: u32,
    pub originator_address: Vec<u8>,
    pub originator_port: u32,
}

impl ForwardTarget {
    pub fn host(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.host_to_connect)
    }

    pub fn originator(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.originator_address)
    }

    /// The `(host, port)` pair to dial.
    ///
    /// # Errors
    ///
    /// [`RsshError::InvalidTarget`] if the host is empty or not UTF-8, or the
    /// port is outside `1..=65535`.
    pub fn dial_address(&self) -> RsshResult<(&str, u16)> {
        let host = std::str::from_utf8(&self.host_to_connect)
            .map_err(|_| RsshError::InvalidTarget("host is not valid UTF-8".into()))?;
        if host.is_empty() {
            return Err(RsshError::InvalidTarget("empty host".into()));
        }
        let port = u16::try_from(self.port_to_connect)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                RsshError::InvalidTarget(format!("port {} out of range", self.port_to_connect))
            })?;
        Ok((host, port))
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (from {}:{})",
            self.host(),
            self.port_to_connect,
            self.originator(),
            self.originator_port
        )
    }
}

/// A channel-open event, classified by declared type with its extra data
/// already decoded.
#[derive(Debug)]
pub enum ChannelOpen {
    Session,
    /// The decode result is kept so the forward handler can report a
    /// malformed payload on the accepted channel.
    DirectTcpip(RsshResult<ForwardTarget>),
    Unknown(String),
}

impl ChannelOpen {
    pub fn decode(channel_type: &str, extra_data: &[u8]) -> Self {
        match channel_type {
            CHANNEL_SESSION => ChannelOpen::Session,
            CHANNEL_DIRECT_TCPIP => {
                ChannelOpen::DirectTcpip(codec::decode_direct_forward(extra_data))
            }
            other => ChannelOpen::Unknown(other.to_string()),
        }
    }

    pub fn channel_type(&self) -> &str {
        match self {
            ChannelOpen::Session => CHANNEL_SESSION,
            ChannelOpen::DirectTcpip(_) => CHANNEL_DIRECT_TCPIP,
            ChannelOpen::Unknown(kind) => kind,
        }
    }
}

/// A request on a session channel, decoded from its type and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    PtyReq(PtyParameters),
    Env { name: String, value: String },
    WindowChange(WindowChange),
    Shell,
    Exec(String),
    Unsupported(String),
}

impl SessionRequest {
    /// Decode a request. Unknown types are not an error here; they decode
    /// to [`SessionRequest::Unsupported`].
    pub fn decode(kind: &str, payload: &[u8]) -> RsshResult<Self> {
        Ok(match kind {
            REQUEST_PTY => SessionRequest::PtyReq(codec::decode_pty_request(payload)?),
            REQUEST_ENV => {
                let (name, value) = codec::decode_env(payload)?;
                SessionRequest::Env { name, value }
            }
            REQUEST_WINDOW_CHANGE => {
                SessionRequest::WindowChange(codec::decode_window_change(payload)?)
            }
            REQUEST_SHELL => SessionRequest::Shell,
            REQUEST_EXEC => SessionRequest::Exec(codec::decode_exec(payload)?),
            other => SessionRequest::Unsupported(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{write_string, write_uint32};

    fn target(host: &[u8], port: u32) -> ForwardTarget {
        ForwardTarget {
            host_to_connect: host.to_vec(),
            port_to_connect: port,
            originator_address: b"127.0.0.1".to_vec(),
            originator_port: 40000,
        }
    }

    #[test]
    fn dial_address_accepts_valid_target() {
        assert_eq!(
            target(b"example.com", 443).dial_address().unwrap(),
            ("example.com", 443)
        );
    }

    #[test]
    fn dial_address_rejects_bad_ports() {
        assert!(target(b"example.com", 0).dial_address().is_err());
        assert!(target(b"example.com", 65536).dial_address().is_err());
    }

    #[test]
    fn dial_address_rejects_non_utf8_and_empty_hosts() {
        assert!(target(&[0xFF, 0xFE], 22).dial_address().is_err());
        assert!(target(b"", 22).dial_address().is_err());
    }

    #[test]
    fn forward_target_display() {
        assert_eq!(
            target(b"db.internal", 5432).to_string(),
            "db.internal:5432 (from 127.0.0.1:40000)"
        );
    }

    #[test]
    fn channel_open_classification() {
        assert!(matches!(
            ChannelOpen::decode("session", &[]),
            ChannelOpen::Session
        ));
        assert!(matches!(
            ChannelOpen::decode("direct-tcpip", &[0, 0]),
            ChannelOpen::DirectTcpip(Err(_))
        ));
        let unknown = ChannelOpen::decode("x11", &[]);
        assert_eq!(unknown.channel_type(), "x11");
        assert!(matches!(unknown, ChannelOpen::Unknown(_)));
    }

    #[test]
    fn session_request_decoding() {
        assert_eq!(
            SessionRequest::decode("shell", &[]).unwrap(),
            SessionRequest::Shell
        );
        assert_eq!(
            SessionRequest::decode("subsystem", b"sftp").unwrap(),
            SessionRequest::Unsupported("subsystem".into())
        );

        let mut exec = Vec::new();
        write_string(&mut exec, b"ls -la");
        assert_eq!(
            SessionRequest::decode("exec", &exec).unwrap(),
            SessionRequest::Exec("ls -la".into())
        );

        let mut resize = Vec::new();
        for v in [100, 30, 0, 0] {
            write_uint32(&mut resize, v);
        }
        assert!(matches!(
            SessionRequest::decode("window-change", &resize).unwrap(),
            SessionRequest::WindowChange(WindowChange {
                columns: 100,
                rows: 30,
                ..
            })
        ));
        assert!(SessionRequest::decode("pty-req", &[0, 0, 0, 1]).is_err());
    }
}
