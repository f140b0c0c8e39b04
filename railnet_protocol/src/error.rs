// Error types for framing and message decoding.
//
// `FrameError` is fatal to a connection: once the length prefix is garbage
// the byte stream cannot be resynchronized. `DecodeError` covers a single
// well-framed message whose body does not parse; callers log and drop it.

use thiserror::Error;

/// A malformed frame header. The connection that produced it must be torn down.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid byte {0:#04x} in frame length prefix")]
    InvalidPrefix(u8),
    #[error("frame length prefix has no digits")]
    EmptyPrefix,
    #[error("frame length prefix is too long")]
    PrefixTooLong,
    #[error("frame too large: {0} bytes (max {max})", max = crate::framing::MAX_MESSAGE_SIZE)]
    TooLarge(usize),
}

/// Rejection of a display name.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameError {
    #[error("name must be 4 to 10 characters, got {0}")]
    Length(usize),
    #[error("name must not start with a digit")]
    LeadingDigit,
    #[error("name contains forbidden character {0:?}")]
    ForbiddenChar(char),
}

/// A framed message whose content could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message is not valid UTF-8")]
    NotUtf8,
    #[error("empty message")]
    Empty,
    #[error("unknown message kind {0:?}")]
    UnknownKind(String),
    #[error("{kind}: missing field {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("{kind}: invalid {field} {value:?}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        value: String,
    },
    #[error("{kind}: {extra} unexpected trailing fields")]
    TrailingFields { kind: &'static str, extra: usize },
}
