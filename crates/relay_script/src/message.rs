//! Message buffers crossing the host/script boundary
//!
//! A [`MessageBuffer`] is either absent ("nothing to process") or an owned byte
//! payload whose length fits in an `i32`, the only length type the boundary
//! knows about.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("declared length {declared} does not match payload of {actual} bytes")]
    LengthMismatch { declared: i64, actual: usize },

    #[error("payload of {actual} bytes exceeds the i32 length limit")]
    TooLarge { actual: usize },
}

/// Length-prefixed binary payload.
///
/// `data == None` is a distinguished state, not an empty payload: the
/// invoker short-circuits it without entering the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireMessage", try_from = "WireMessage")]
pub struct MessageBuffer {
    data: Option<Vec<u8>>,
}

impl MessageBuffer {
    /// The absent buffer.
    pub fn empty() -> Self {
        Self { data: None }
    }

    pub fn new(data: Vec<u8>) -> Result<Self, MessageError> {
        check_length(data.len())?;
        Ok(Self { data: Some(data) })
    }

    /// Rebuild a buffer from its wire shape, enforcing `length == data.len()`.
    pub fn from_raw_parts(data: Option<Vec<u8>>, length: i64) -> Result<Self, MessageError> {
        match data {
            None if length == 0 => Ok(Self::empty()),
            None => Err(MessageError::LengthMismatch {
                declared: length,
                actual: 0,
            }),
            Some(bytes) => {
                if length < 0 || length as u64 != bytes.len() as u64 {
                    return Err(MessageError::LengthMismatch {
                        declared: length,
                        actual: bytes.len(),
                    });
                }
                Self::new(bytes)
            }
        }
    }

    pub fn is_absent(&self) -> bool {
        self.data.is_none()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Payload length; zero when absent.
    pub fn length(&self) -> i32 {
        // `new` guarantees the length fits.
        self.data.as_ref().map_or(0, |bytes| bytes.len() as i32)
    }

    /// Bytes of the payload, empty when absent.
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn into_data(self) -> Option<Vec<u8>> {
        self.data
    }
}

fn check_length(len: usize) -> Result<(), MessageError> {
    match i32::try_from(len) {
        Ok(_) => Ok(()),
        Err(_) => Err(MessageError::TooLarge { actual: len }),
    }
}

/// Serialized form. `length` is optional on input; when given it must match.
#[derive(Serialize, Deserialize)]
struct WireMessage {
    data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<i64>,
}

impl From<MessageBuffer> for WireMessage {
    fn from(buffer: MessageBuffer) -> Self {
        let length = buffer.data.as_ref().map(|_| i64::from(buffer.length()));
        Self {
            data: buffer.data,
            length,
        }
    }
}

impl TryFrom<WireMessage> for MessageBuffer {
    type Error = MessageError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        match (wire.data, wire.length) {
            (data, Some(length)) => Self::from_raw_parts(data, length),
            (Some(bytes), None) => Self::new(bytes),
            (None, None) => Ok(Self::empty()),
        }
    }
}

impl TryFrom<Vec<u8>> for MessageBuffer {
    type Error = MessageError;

    fn try_from(data: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(data)
    }
}

impl TryFrom<&[u8]> for MessageBuffer {
    type Error = MessageError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        Self::new(data.to_vec())
    }
}
