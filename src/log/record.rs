//! Log file layout: the cookie (see [crate::wire::cookie]), followed by records without any
//!  separators:
//!
//! ```ascii
//!  0: type id (i32 BE)
//!  4: sender id (i32 BE)
//!  8: seconds (i32 BE)
//! 12: microseconds (i32 BE)
//! 16: payload length (i32 BE)
//! 20: reserved, 0 (i32 BE)
//! 24: payload, unpadded
//! ```
//!
//! Ids are those of the side that sent the message, so replay needs the logged system
//!  descriptions to translate them.

use std::path::Path;

use bytes::{Buf, BufMut, Bytes};
use tracing::{debug, warn};

use crate::error::BusError;
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::PrecheckedCast;
use crate::wire::cookie::COOKIE_LEN;
use crate::wire::message::{Message, SenderId, Timestamp, TypeId};

pub const RECORD_HEADER_LEN: usize = 6 * size_of::<i32>();

pub fn ser_record(msg: &Message, buf: &mut impl BufMut) {
    buf.put_i32(msg.type_id.0);
    buf.put_i32(msg.sender.0);
    buf.put_i32(msg.time.secs as i32);
    buf.put_i32(msg.time.usecs as i32);
    buf.put_i32(msg.payload.len().prechecked_cast());
    buf.put_i32(0);
    buf.put_slice(&msg.payload);
}

/// Reads one record, returning `Ok(None)` if the buffer is exhausted
pub fn deser_record(buf: &mut Bytes) -> Result<Option<Message>, BusError> {
    if !buf.has_remaining() {
        return Ok(None);
    }
    if buf.remaining() < RECORD_HEADER_LEN {
        return Err(BusError::Framing(format!("truncated log record header: {} bytes", buf.remaining())));
    }

    let type_id = TypeId(buf.checked_i32()?);
    let sender = SenderId(buf.checked_i32()?);
    let secs = buf.checked_i32()? as u32;
    let usecs = buf.checked_i32()? as u32;
    let payload_len = buf.checked_i32()?;
    let _reserved = buf.checked_i32()?;

    let payload_len = usize::try_from(payload_len)
        .map_err(|_| BusError::Framing(format!("negative payload length {} in log record", payload_len)))?;
    if buf.remaining() < payload_len {
        return Err(BusError::Framing(format!("truncated log record payload: {} of {} bytes", buf.remaining(), payload_len)));
    }

    Ok(Some(Message {
        type_id,
        sender,
        time: Timestamp::new(secs, usecs),
        payload: buf.split_to(payload_len),
    }))
}

/// A parsed log file
#[derive(Debug)]
pub struct LogContents {
    pub cookie: Vec<u8>,
    pub records: Vec<Message>,
}

impl LogContents {
    pub fn parse(mut buf: Bytes) -> Result<LogContents, BusError> {
        if buf.remaining() < COOKIE_LEN {
            return Err(BusError::Handshake(format!("log file too short for a cookie: {} bytes", buf.remaining())));
        }
        let cookie = buf.split_to(COOKIE_LEN).to_vec();

        let mut records = Vec::new();
        loop {
            match deser_record(&mut buf) {
                Ok(Some(msg)) => records.push(msg),
                Ok(None) => break,
                Err(e) => {
                    warn!("log ends with an incomplete record after {} records, ignoring the rest: {}", records.len(), e);
                    break;
                }
            }
        }
        Ok(LogContents { cookie, records })
    }

    pub fn read(path: &Path) -> Result<LogContents, BusError> {
        let raw = std::fs::read(path)?;
        debug!("read log file {:?}: {} bytes", path, raw.len());
        Self::parse(Bytes::from(raw))
    }
}
