//! The cookie is the first thing each side writes to a fresh TCP session, and the first thing
//!  in a log file:
//!
//! ```ascii
//!  0: magic, ASCII, NUL padded to 16 bytes - e.g. "vrpn: ver. 07.35"
//! 16: two spaces
//! 18: requested remote log mode as an ASCII digit ('0' .. '3')
//! 19: NUL padding to 24 bytes
//! ```

use bytes::BufMut;
use tracing::warn;

use crate::error::BusError;
use crate::log::LogMode;

pub const MAGIC_LEN: usize = 16;
pub const COOKIE_LEN: usize = 24;
pub const DEFAULT_MAGIC: &str = "vrpn: ver. 07.35";

const LOG_MODE_OFFSET: usize = MAGIC_LEN + 2;

/// Outcome of comparing a peer's cookie with our own magic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieMatch {
    Exact,
    /// Same product and major version, different minor version. Peers talk to each other, but
    ///  it is worth a warning.
    MinorVersionSkew { peer_magic: String },
}

/// A magic must fit into its fixed-size slot and have a '.' separating the major from the minor
///  version
pub fn validate_magic(magic: &str) -> Result<(), BusError> {
    if !magic.is_ascii() {
        return Err(BusError::Config(format!("magic {:?} is not ASCII", magic)));
    }
    if magic.len() > MAGIC_LEN {
        return Err(BusError::Config(format!("magic {:?} is longer than {} bytes", magic, MAGIC_LEN)));
    }
    if !magic.contains('.') {
        return Err(BusError::Config(format!("magic {:?} has no '.' separating the minor version", magic)));
    }
    Ok(())
}

pub fn write_cookie(buf: &mut impl BufMut, magic: &str, remote_log_mode: LogMode) {
    let magic = magic.as_bytes();
    let magic = &magic[..magic.len().min(MAGIC_LEN)];

    buf.put_slice(magic);
    buf.put_bytes(0, MAGIC_LEN - magic.len());
    buf.put_slice(b"  ");
    buf.put_u8(b'0' + remote_log_mode.bits());
    buf.put_bytes(0, COOKIE_LEN - LOG_MODE_OFFSET - 1);
}

pub fn cookie_bytes(magic: &str, remote_log_mode: LogMode) -> Vec<u8> {
    let mut result = Vec::with_capacity(COOKIE_LEN);
    write_cookie(&mut result, magic, remote_log_mode);
    result
}

/// the magic part of a received cookie, without padding
pub fn peer_magic(received: &[u8]) -> String {
    let magic = &received[..received.len().min(MAGIC_LEN)];
    let end = magic.iter().position(|&b| b == 0).unwrap_or(magic.len());
    String::from_utf8_lossy(&magic[..end]).into_owned()
}

/// Compares a received cookie with the local magic. Everything up to and including the local
///  magic's last '.' must match exactly, the rest may differ.
pub fn check_cookie(local_magic: &str, received: &[u8]) -> Result<CookieMatch, BusError> {
    if received.len() < COOKIE_LEN {
        return Err(BusError::Handshake(format!("cookie too short: {} bytes", received.len())));
    }

    let local = local_magic.as_bytes();
    let local = &local[..local.len().min(MAGIC_LEN)];
    let major_len = local_magic.rfind('.')
        .map(|idx| idx + 1)
        .unwrap_or(local.len())
        .min(local.len());

    if received[..major_len] != local[..major_len] {
        return Err(BusError::Handshake(format!(
            "incompatible peer version {:?}, expected {:?}", peer_magic(received), local_magic
        )));
    }

    let mut local_padded = [0u8; MAGIC_LEN];
    local_padded[..local.len()].copy_from_slice(local);
    if received[..MAGIC_LEN] == local_padded {
        Ok(CookieMatch::Exact)
    }
    else {
        let peer_magic = peer_magic(received);
        warn!("peer version {:?} differs from local version {:?} - continuing", peer_magic, local_magic);
        Ok(CookieMatch::MinorVersionSkew { peer_magic })
    }
}

/// the log mode the peer requests us to apply to this session
pub fn requested_log_mode(received: &[u8]) -> Result<LogMode, BusError> {
    let digit = *received.get(LOG_MODE_OFFSET)
        .ok_or_else(|| BusError::Handshake("cookie too short for a log mode".to_string()))?;

    match digit {
        b'0'..=b'3' => Ok(LogMode::from_bits_truncate(digit - b'0')),
        other => Err(BusError::Handshake(format!("invalid log mode {:?} in cookie", other as char))),
    }
}
