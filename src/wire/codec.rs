//! Message framing, identical for the TCP stream and for UDP datagrams.
//!
//! Header - all numbers in network byte order (BE):
//! ```ascii
//!  0: total length (u32) - header length (24) plus payload length, *excluding* payload padding
//!  4: seconds (u32)
//!  8: microseconds (u32)
//! 12: sender id (i32)
//! 16: type id (i32)
//! 20: sequence number (u32) - occupies the header's alignment padding. It is written for the
//!      benefit of sniffers and never interpreted on decode
//! 24: payload, zero-padded to a multiple of 8 bytes
//! ```
//!
//! The receiver re-derives padding from the alignment rule, so encoder and decoder must agree on
//!  [ALIGN] exactly. A UDP datagram may contain several consecutive frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::BusError;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};
use crate::wire::message::{Message, SenderId, Timestamp, TypeId};

pub const ALIGN: usize = 8;

const HEADER_FIELDS_LEN: usize = 5 * size_of::<u32>();
const SEQUENCE_LEN: usize = size_of::<u32>();

pub const HEADER_LEN: usize = aligned(HEADER_FIELDS_LEN);

pub const fn aligned(len: usize) -> usize {
    len.div_ceil(ALIGN) * ALIGN
}

/// number of bytes a message with the given payload length occupies on the wire, padding included
pub const fn encoded_len(payload_len: usize) -> usize {
    HEADER_LEN + aligned(payload_len)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_len: u32,
    pub time: Timestamp,
    pub sender: SenderId,
    pub type_id: TypeId,
}

impl FrameHeader {
    /// Parses the header at the start of `buf`, which must hold at least [HEADER_LEN] bytes.
    pub fn deser(buf: &[u8]) -> Result<FrameHeader, BusError> {
        if buf.len() < HEADER_LEN {
            return Err(BusError::Framing(format!("incomplete header: {} bytes", buf.len())));
        }

        let mut b = &buf[..HEADER_FIELDS_LEN];
        let total_len = b.get_u32();
        let secs = b.get_u32();
        let usecs = b.get_u32();
        let sender = SenderId(b.get_i32());
        let type_id = TypeId(b.get_i32());

        let total: usize = total_len.safe_cast();
        if total < HEADER_LEN {
            return Err(BusError::Framing(format!("declared length {} is shorter than the header", total_len)));
        }

        Ok(FrameHeader {
            total_len,
            time: Timestamp::new(secs, usecs),
            sender,
            type_id,
        })
    }

    pub fn payload_len(&self) -> usize {
        let total: usize = self.total_len.safe_cast();
        total - HEADER_LEN
    }

    pub fn padded_len(&self) -> usize {
        aligned(self.total_len.safe_cast())
    }
}

/// Appends one framed message to `buf`, returning the number of bytes written (padding included).
pub fn encode(buf: &mut impl BufMut, time: Timestamp, type_id: TypeId, sender: SenderId, payload: &[u8], sequence: u32) -> Result<usize, BusError> {
    let total_len = HEADER_LEN + payload.len();
    if total_len > u32::MAX as usize {
        return Err(BusError::Framing(format!("payload of {} bytes is too long to be framed", payload.len())));
    }

    let len = encoded_len(payload.len());

    buf.put_u32(total_len.prechecked_cast());
    buf.put_u32(time.secs);
    buf.put_u32(time.usecs);
    buf.put_i32(sender.0);
    buf.put_i32(type_id.0);
    buf.put_u32(sequence);
    buf.put_bytes(0, HEADER_LEN - HEADER_FIELDS_LEN - SEQUENCE_LEN);

    buf.put_slice(payload);
    buf.put_bytes(0, aligned(payload.len()) - payload.len());

    Ok(len)
}

/// Decodes the frame at the start of `buf`, returning the message and the number of bytes
///  consumed. Fails if the declared length does not fit the buffer.
pub fn decode(buf: &[u8]) -> Result<(Message, usize), BusError> {
    let header = FrameHeader::deser(buf)?;
    let padded_len = header.padded_len();
    if padded_len > buf.len() {
        return Err(BusError::Framing(format!("declared length {} exceeds the remaining {} bytes", header.total_len, buf.len())));
    }

    let payload_end = HEADER_LEN + header.payload_len();
    let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..payload_end]);

    Ok((Message {
        type_id: header.type_id,
        sender: header.sender,
        time: header.time,
        payload,
    }, padded_len))
}

/// Decodes all frames in a datagram. Either the whole datagram is consumed, or this fails.
pub fn decode_datagram(mut buf: &[u8]) -> Result<Vec<Message>, BusError> {
    let mut result = Vec::new();
    while !buf.is_empty() {
        let (msg, consumed) = decode(buf)?;
        result.push(msg);
        buf = &buf[consumed..];
    }
    Ok(result)
}

/// Splits the first complete frame off a stream receive buffer. Returns `Ok(None)` if the buffer
///  does not hold a complete frame yet, leaving the buffer untouched.
///
/// The payload of the returned message shares the receive buffer's allocation without copying.
pub fn try_split_frame(buf: &mut BytesMut, max_frame_len: usize) -> Result<Option<Message>, BusError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let header = FrameHeader::deser(buf)?;
    let padded_len = header.padded_len();
    if padded_len > max_frame_len {
        return Err(BusError::Framing(format!("frame of {} bytes exceeds the maximum of {}", padded_len, max_frame_len)));
    }
    if buf.len() < padded_len {
        return Ok(None);
    }

    let mut frame = buf.split_to(padded_len);
    frame.advance(HEADER_LEN);
    frame.truncate(header.payload_len());

    Ok(Some(Message {
        type_id: header.type_id,
        sender: header.sender,
        time: header.time,
        payload: frame.freeze(),
    }))
}
