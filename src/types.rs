//! Types for RFID operations

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;

/// Number of bytes in a tag identifier
pub const TAG_LEN: usize = 5;

/// A 5-byte RFID token identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tag([u8; TAG_LEN]);

impl Tag {
    pub const fn new(bytes: [u8; TAG_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TAG_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Tag {
    type Error = RfidError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; TAG_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| RfidError::TagFormat { len: bytes.len() })
    }
}

impl From<[u8; TAG_LEN]> for Tag {
    fn from(bytes: [u8; TAG_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bytes_to_hex(&self.0))
    }
}

/// Parses hex text such as `"04 05 06 07 08"`, `"04:05:06:07:08"` or `"0405060708"`.
impl FromStr for Tag {
    type Err = RfidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<u8> = s
            .bytes()
            .filter(|b| !matches!(b, b' ' | b':' | b'-'))
            .collect();
        if digits.len() % 2 != 0 {
            return Err(RfidError::Validation(format!(
                "Odd number of hex digits in tag '{}'",
                s
            )));
        }

        let bytes = digits
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                    .ok_or_else(|| RfidError::Validation(format!("Invalid hex in tag '{}'", s)))
            })
            .collect::<Result<Vec<u8>, _>>()?;

        Tag::try_from(bytes.as_slice())
    }
}

/// Indicator LED color on the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum IndicatorColor {
    #[default]
    None = 0x00,
    Red = 0x01,
    Green = 0x02,
}

/// Status byte returned by the reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// No token present in the field
    NoToken,
    CommError,
    CommError2,
    /// Status byte outside the documented range
    Unknown(u8),
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Status::Ok,
            0x01 => Status::NoToken,
            0x02 => Status::CommError,
            0x03 => Status::CommError2,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => 0x00,
            Status::NoToken => 0x01,
            Status::CommError => 0x02,
            Status::CommError2 => 0x03,
            Status::Unknown(other) => other,
        }
    }
}

/// A checksum-validated response decoded from the reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: [u8; 2],
    pub status: Status,
    pub data: Bytes,
}

/// Errors that can occur during RFID operations
#[derive(Debug, thiserror::Error)]
pub enum RfidError {
    /// Inbound bytes do not form a valid frame header
    #[error("framing error: {message} (bytes: {})", bytes_to_hex(.bytes))]
    Framing { message: String, bytes: Vec<u8> },

    /// XOR over a decoded frame is not zero
    #[error("checksum mismatch in frame {}", bytes_to_hex(.frame))]
    Checksum { frame: Vec<u8> },

    #[error("wrong tag length: expected {expected} bytes, got {len}", expected = TAG_LEN)]
    TagFormat { len: usize },

    #[error("no tag present")]
    NoTag,

    #[error("{command} failed with status {status:?}")]
    Communication {
        command: &'static str,
        status: Status,
    },

    #[error("unexpected device: expected '{expected}', got '{found}'")]
    DeviceMismatch { expected: String, found: String },

    /// Invalid parameter passed to a function
    #[error("invalid parameter: {0}")]
    Validation(String),

    /// The transaction was purged by a disconnect
    #[error("transaction cancelled")]
    Cancelled,

    /// Transport layer error (serial port, bridge driver, etc.)
    #[error("transport error: {0}")]
    Transport(String),

    #[error("reader is not connected")]
    NotConnected,

    /// The byte source ended before a complete frame arrived
    #[error("connection closed with {} unframed bytes", .tail.len())]
    ConnectionClosed { tail: Bytes },

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    /// Both write variants completed but the tag read back differs
    #[error("tag write not verified: wanted {expected}, read {found}")]
    WriteNotVerified { expected: Tag, found: Tag },
}

/// Convert bytes to lowercase, space-separated hex
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===================
    // Tag tests
    // ===================

    #[test]
    fn test_tag_rejects_wrong_lengths() {
        for len in [0usize, 1, 4, 6, 10] {
            let bytes = vec![0x11; len];
            match Tag::try_from(bytes.as_slice()) {
                Err(RfidError::TagFormat { len: got }) => assert_eq!(got, len),
                other => panic!("expected TagFormat for {} bytes, got {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_tag_accepts_five_bytes() {
        let tag = Tag::try_from(&[1u8, 2, 3, 4, 5][..]).unwrap();
        assert_eq!(tag.as_bytes(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_tag_equality() {
        let a = Tag::new([0x04, 0x05, 0x06, 0x07, 0x08]);
        let b = Tag::try_from(&[0x04u8, 0x05, 0x06, 0x07, 0x08][..]).unwrap();
        assert_eq!(a, b);

        for i in 0..TAG_LEN {
            let mut bytes = *a.as_bytes();
            bytes[i] ^= 0x01;
            assert_ne!(a, Tag::new(bytes), "byte {} changed", i);
        }
    }

    #[test]
    fn test_tag_display() {
        let tag = Tag::new([0x00, 0x0a, 0xab, 0x10, 0xff]);
        assert_eq!(tag.to_string(), "00 0a ab 10 ff");
    }

    #[test]
    fn test_tag_from_str() {
        let expected = Tag::new([0x00, 0x0a, 0xab, 0x10, 0xff]);
        assert_eq!("00 0a ab 10 ff".parse::<Tag>().unwrap(), expected);
        assert_eq!("00:0A:AB:10:FF".parse::<Tag>().unwrap(), expected);
        assert_eq!("000aab10ff".parse::<Tag>().unwrap(), expected);
    }

    #[test]
    fn test_tag_from_str_invalid() {
        assert!(matches!("00 0a ab".parse::<Tag>(), Err(RfidError::TagFormat { len: 3 })));
        assert!(matches!("zz 0a ab 10 ff".parse::<Tag>(), Err(RfidError::Validation(_))));
        assert!(matches!("0".parse::<Tag>(), Err(RfidError::Validation(_))));
    }

    // ===================
    // Status tests
    // ===================

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::from(0x00), Status::Ok);
        assert_eq!(Status::from(0x01), Status::NoToken);
        assert_eq!(Status::from(0x02), Status::CommError);
        assert_eq!(Status::from(0x03), Status::CommError2);
        assert_eq!(Status::from(0x7F), Status::Unknown(0x7F));
        assert_eq!(u8::from(Status::CommError2), 0x03);
    }
}
