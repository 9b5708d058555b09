//! Binary sub-protocol codec for channel-open and channel-request payloads.
//!
//! Wire format primitives:
//! - integer: `[4-byte big-endian u32]`
//! - string:  `[4-byte big-endian length L][L raw bytes]`
//! - terminal modes: `[4-byte length][(opcode u8, value u32)*][0x00]`
//!
//! Every reader takes a buffer plus an offset and returns the value together
//! with the offset just past it. Nothing here allocates more than the decoded
//! value itself, and no reader indexes past the end of its buffer.

use crate::error::{RsshError, RsshResult};
use crate::payload::{ForwardTarget, PtyParameters, WindowChange};
use crate::terminal::{TerminalMode, TerminalModes, TTY_OP_END, TTY_OP_UNDEFINED_START};

fn truncated(buf: &[u8], offset: usize, needed: usize) -> RsshError {
    RsshError::TruncatedPayload {
        offset,
        needed,
        remaining: buf.len().saturating_sub(offset),
    }
}

fn take(buf: &[u8], offset: usize, len: usize) -> RsshResult<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| buf.get(offset..end))
        .ok_or_else(|| truncated(buf, offset, len))
}

/// Read a big-endian `u32` at `offset`.
pub fn read_uint32(buf: &[u8], offset: usize) -> RsshResult<(u32, usize)> {
    let bytes = take(buf, offset, 4)?;
    let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok((value, offset + 4))
}

/// Read a length-prefixed string at `offset`, borrowing its raw bytes.
pub fn read_string(buf: &[u8], offset: usize) -> RsshResult<(&[u8], usize)> {
    let (len, start) = read_uint32(buf, offset)?;
    let bytes = take(buf, start, len as usize)?;
    Ok((bytes, start + bytes.len()))
}

pub fn write_uint32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn write_string(out: &mut Vec<u8>, value: &[u8]) {
    write_uint32(out, value.len() as u32);
    out.extend_from_slice(value);
}

/// Encode a terminal mode block. Entry order follows map iteration and is
/// not canonical.
pub fn encode_terminal_modes(modes: &TerminalModes) -> Vec<u8> {
    let block_len = modes.len() * 5 + 1;
    let mut out = Vec::with_capacity(4 + block_len);
    write_uint32(&mut out, block_len as u32);
    for (mode, value) in modes.iter() {
        out.push(mode.opcode());
        write_uint32(&mut out, value);
    }
    out.push(TTY_OP_END);
    out
}

/// Decode a terminal mode block (length prefix included).
///
/// Opcodes outside the known table but below 160 are skipped; an opcode of
/// 160 or above ends parsing. A zero-length block decodes to no modes.
pub fn decode_terminal_modes(buf: &[u8]) -> RsshResult<TerminalModes> {
    let (declared, start) = read_uint32(buf, 0)?;
    let block = take(buf, start, declared as usize)?;
    let mut modes = TerminalModes::new();

    if block.is_empty() {
        return Ok(modes);
    }

    let mut i = 0;
    loop {
        let Some(&opcode) = block.get(i) else {
            return Err(RsshError::MalformedModeBlock(format!(
                "no terminator within {declared} declared bytes"
            )));
        };
        if opcode == TTY_OP_END || opcode >= TTY_OP_UNDEFINED_START {
            return Ok(modes);
        }
        let Some(raw) = block.get(i + 1..i + 5) else {
            return Err(RsshError::MalformedModeBlock(format!(
                "opcode {opcode} at offset {i} runs past the declared length {declared}"
            )));
        };
        let value = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        if let Some(mode) = TerminalMode::from_opcode(opcode) {
            modes.insert(mode, value);
        }
        i += 5;
    }
}

/// Decode a `pty-req` payload.
pub fn decode_pty_request(buf: &[u8]) -> RsshResult<PtyParameters> {
    let (term, next) = read_string(buf, 0)?;
    let (columns, next) = read_uint32(buf, next)?;
    let (rows, next) = read_uint32(buf, next)?;
    let (pixel_width, next) = read_uint32(buf, next)?;
    let (pixel_height, next) = read_uint32(buf, next)?;
    let modes = decode_terminal_modes(&buf[next..]).map_err(|e| match e {
        RsshError::TruncatedPayload {
            offset,
            needed,
            remaining,
        } => RsshError::TruncatedPayload {
            offset: offset + next,
            needed,
            remaining,
        },
        other => other,
    })?;

    Ok(PtyParameters {
        term: String::from_utf8_lossy(term).into_owned(),
        columns,
        rows,
        pixel_width,
        pixel_height,
        modes,
    })
}

pub fn encode_pty_request(params: &PtyParameters) -> Vec<u8> {
    let mut out = Vec::new();
    write_string(&mut out, params.term.as_bytes());
    write_uint32(&mut out, params.columns);
    write_uint32(&mut out, params.rows);
    write_uint32(&mut out, params.pixel_width);
    write_uint32(&mut out, params.pixel_height);
    out.extend(encode_terminal_modes(&params.modes));
    out
}

/// Decode a `direct-tcpip` channel-open payload.
pub fn decode_direct_forward(buf: &[u8]) -> RsshResult<ForwardTarget> {
    let (host, next) = read_string(buf, 0)?;
    let (port, next) = read_uint32(buf, next)?;
    let (originator, next) = read_string(buf, next)?;
    let (originator_port, _) = read_uint32(buf, next)?;

    Ok(ForwardTarget {
        host_to_connect: host.to_vec(),
        port_to_connect: port,
        originator_address: originator.to_vec(),
        originator_port,
    })
}

pub fn encode_direct_forward(target: &ForwardTarget) -> Vec<u8> {
    let mut out = Vec::new();
    write_string(&mut out, &target.host_to_connect);
    write_uint32(&mut out, target.port_to_connect);
    write_string(&mut out, &target.originator_address);
    write_uint32(&mut out, target.originator_port);
    out
}

/// Decode a `window-change` payload: four integers at offsets 0, 4, 8, 12.
pub fn decode_window_change(buf: &[u8]) -> RsshResult<WindowChange> {
    let (columns, _) = read_uint32(buf, 0)?;
    let (rows, _) = read_uint32(buf, 4)?;
    let (pixel_width, _) = read_uint32(buf, 8)?;
    let (pixel_height, _) = read_uint32(buf, 12)?;
    Ok(WindowChange {
        columns,
        rows,
        pixel_width,
        pixel_height,
    })
}

pub fn encode_window_change(size: &WindowChange) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    write_uint32(&mut out, size.columns);
    write_uint32(&mut out, size.rows);
    write_uint32(&mut out, size.pixel_width);
    write_uint32(&mut out, size.pixel_height);
    out
}

/// Decode an `exec` payload (the command line).
pub fn decode_exec(buf: &[u8]) -> RsshResult<String> {
    let (command, _) = read_string(buf, 0)?;
    Ok(String::from_utf8_lossy(command).into_owned())
}

/// Decode an `env` payload: variable name then value.
pub fn decode_env(buf: &[u8]) -> RsshResult<(String, String)> {
    let (name, next) = read_string(buf, 0)?;
    let (value, _) = read_string(buf, next)?;
    Ok((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}
