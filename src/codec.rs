//! Wire framing: header, byte stuffing and XOR checksum
//!
//! ```text
//! ┌────────────┬──────────┬───────────────┬────────────┬──────────────────┬──────────┐
//! │ 0xAA 0xDD  │ Len (2B) │ Opcode (2B)   │ Status (1B)│ Data (stuffed)   │ XOR (1B) │
//! │ sync       │ BE body  │               │ inbound    │ 0xAA → 0xAA 0x00 │          │
//! └────────────┴──────────┴───────────────┴────────────┴──────────────────┴──────────┘
//! ```
//!
//! Outbound frames carry no status byte and their length field is a
//! reserved `0x00` followed by the body length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;

use crate::command::Command;
use crate::types::{bytes_to_hex, Response, RfidError};

/// Frame sync bytes; the first one doubles as the stuffing sentinel
pub const SYNC: [u8; 2] = [SENTINEL, 0xDD];

/// Payload byte that must be escaped
pub const SENTINEL: u8 = 0xAA;

/// Continuation byte written after every payload sentinel
pub const ESCAPE: u8 = 0x00;

/// Sync (2) + length (2)
pub const HEADER_LEN: usize = 4;

/// Maximum outbound wire frame, header included
pub const MAX_FRAME_LEN: usize = 255;

const RESERVED: u8 = 0x00;

// Opcode (2) + status (1) + checksum (1)
const MIN_BODY_LEN: usize = 4;

/// XOR of all bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Append `payload` to `dst`, escaping every sentinel byte
pub fn stuff(payload: &[u8], dst: &mut Vec<u8>) {
    for &byte in payload {
        dst.push(byte);
        if byte == SENTINEL {
            dst.push(ESCAPE);
        }
    }
}

/// Collapse every sentinel + escape pair back into a single sentinel
pub fn unstuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter().copied().peekable();
    while let Some(byte) = bytes.next() {
        out.push(byte);
        if byte == SENTINEL && bytes.peek() == Some(&ESCAPE) {
            bytes.next();
        }
    }
    out
}

/// Build the frame body: opcode, stuffed payload, checksum
pub fn encode_body(opcode: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(opcode.len() + payload.len() * 2 + 1);
    body.extend_from_slice(&opcode);
    stuff(payload, &mut body);
    body.push(checksum(&body));
    body
}

/// Encode `command` with its transport header into `dst`
pub fn encode_frame(command: &Command, dst: &mut BytesMut) -> Result<(), RfidError> {
    let body = encode_body(command.opcode(), &command.payload());
    let total = HEADER_LEN + body.len();
    if total > MAX_FRAME_LEN {
        return Err(RfidError::Validation(format!(
            "{} frame is {} bytes, max {}",
            command.name(),
            total,
            MAX_FRAME_LEN
        )));
    }

    dst.reserve(total);
    dst.put_slice(&SYNC);
    dst.put_u8(RESERVED);
    dst.put_u8(body.len() as u8);
    dst.put_slice(&body);
    Ok(())
}

/// Incremental decoder for inbound frames
///
/// Bytes may arrive in fragments of any size. Complete frames are decoded in
/// arrival order; anything past the last complete frame stays buffered for
/// the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    // Total raw frame length, known once the header has arrived
    target: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer `bytes` and decode every frame now complete
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Response>, RfidError> {
        self.extend(bytes);
        let mut responses = Vec::new();
        while let Some(response) = self.decode_next()? {
            responses.push(response);
        }
        Ok(responses)
    }

    /// Buffer `bytes` without decoding
    pub fn extend(&mut self, bytes: &[u8]) {
        trace!("Buffering {} bytes: {}", bytes.len(), bytes_to_hex(bytes));
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the oldest complete frame, if any
    ///
    /// A header that does not start with [`SYNC`] is fatal: the buffered
    /// bytes are dropped and no resynchronisation is attempted.
    pub fn decode_next(&mut self) -> Result<Option<Response>, RfidError> {
        let target = match self.target {
            Some(target) => target,
            None => {
                if self.buffer.len() < HEADER_LEN {
                    return Ok(None);
                }
                if self.buffer[..2] != SYNC {
                    let bytes = self.buffer.split().to_vec();
                    return Err(RfidError::Framing {
                        message: format!("frame does not start with {}", bytes_to_hex(&SYNC)),
                        bytes,
                    });
                }
                let body_len = usize::from(u16::from_be_bytes([self.buffer[2], self.buffer[3]]));
                if body_len < MIN_BODY_LEN {
                    let bytes = self.buffer.split().to_vec();
                    return Err(RfidError::Framing {
                        message: format!("body length {} is shorter than {}", body_len, MIN_BODY_LEN),
                        bytes,
                    });
                }
                let target = HEADER_LEN + body_len;
                self.target = Some(target);
                target
            }
        };

        if self.buffer.len() < target {
            return Ok(None);
        }

        let mut raw = self.buffer.split_to(target);
        self.target = None;
        raw.advance(HEADER_LEN);
        decode_body(&raw).map(Some)
    }

    /// Drain whatever is buffered at end of stream
    ///
    /// The returned bytes never form a valid response and are only useful
    /// for diagnostics.
    pub fn flush(&mut self) -> Option<Bytes> {
        self.target = None;
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_body(raw: &[u8]) -> Result<Response, RfidError> {
    let frame = unstuff(raw);
    if frame.len() < MIN_BODY_LEN {
        return Err(RfidError::Framing {
            message: format!("decoded frame has {} bytes, need {}", frame.len(), MIN_BODY_LEN),
            bytes: frame,
        });
    }
    if checksum(&frame) != 0 {
        return Err(RfidError::Checksum { frame });
    }

    Ok(Response {
        opcode: [frame[0], frame[1]],
        status: frame[2].into(),
        data: Bytes::copy_from_slice(&frame[3..frame.len() - 1]),
    })
}

/// Encode a response the way the reader sends it
#[cfg(test)]
pub(crate) fn encode_response(opcode: [u8; 2], status: u8, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() * 2 + 4);
    body.extend_from_slice(&opcode);
    body.push(status);
    stuff(data, &mut body);
    body.push(checksum(&body));

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&SYNC);
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}
