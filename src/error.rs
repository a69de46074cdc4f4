//! Classified error type.
//!
//! The reference implementation threads an ambient `(group, message)`
//! status tuple through every call and leaves callers to parse the
//! message string to discriminate failures. Here each failure group
//! becomes its own variant (or variant family) so callers match on
//! structure instead of text.

use thiserror::Error;

/// A transport-level failure: connect, send, receive, or a read timeout.
#[derive(Debug, Error)]
pub enum TransportError {
    /// `TcpStream::connect` failed.
    #[error("connect failed: {0}")]
    Connect(std::io::Error),
    /// A `send` (write) on the socket failed.
    #[error("send failed: {0}")]
    Send(std::io::Error),
    /// A `recv` (read) on the socket failed, including a read timeout.
    #[error("receive failed: {0}")]
    Receive(std::io::Error),
    /// The peer closed the connection before a full reply was read.
    #[error("connection closed by peer while expecting {expected} bytes, got {got}")]
    ShortRead {
        /// Bytes expected.
        expected: usize,
        /// Bytes actually read before EOF.
        got: usize,
    },
}

/// A session precondition was violated, e.g. calling a tag operation
/// before `register_session` or `forward_open` succeeded.
#[derive(Debug, Error)]
pub enum SessionError {
    /// An operation that requires a registered session was called first.
    #[error("a session must be registered before calling {0}")]
    NotRegistered(&'static str),
    /// An operation that requires a forward-opened connection was called
    /// first, and the lazy `forward_open` retry also failed.
    #[error("target is not connected; forward_open failed before calling {0}")]
    NotConnected(&'static str),
    /// `forward_close`/`unregister_session` called with nothing open.
    #[error("no active connection to close")]
    NothingToClose,
}

/// Codec-level failure: an unrecognized CIP data-type code, or a
/// pack/unpack call whose input didn't match the type's wire size.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The 8-bit (or, for symbol types, 12-bit) data-type code is not one
    /// of the 14 known CIP atomic types.
    #[error("unknown CIP data type code: 0x{0:04x}")]
    UnknownDataType(u16),
    /// A slice passed to an unpack function had the wrong length.
    #[error("expected {expected} bytes to unpack {type_name}, got {got}")]
    WrongSize {
        /// The atomic type name being unpacked.
        type_name: &'static str,
        /// Expected wire size in bytes.
        expected: usize,
        /// Actual slice length.
        got: usize,
    },
}

/// Top-level error type returned by every fallible operation in this
/// crate.
#[derive(Debug, Error)]
pub enum CipError {
    /// Group 11/12/13: socket connect, send, receive, or timeout.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Group 3: the encapsulation header's status field was non-zero.
    #[error("encapsulation error: status 0x{status:08x}")]
    Encapsulation {
        /// The raw 32-bit status field from the encapsulation header.
        status: u32,
    },

    /// Groups 6/7/8/9/10: a session precondition was violated.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Group 3: a CIP service reply carried a non-zero general status.
    #[error("CIP service 0x{service:02x} failed: general status 0x{status:02x}{}", format_extended_status(extended))]
    CipService {
        /// The CIP service code the request was sent with.
        service: u8,
        /// The general status byte from the reply.
        status: u8,
        /// Raw extended-status bytes, if any were attached to the reply.
        extended: Option<Vec<u8>>,
    },

    /// Group 8: unknown data type, or a pack/unpack size mismatch.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Group 1: a symbol-list or template reply didn't parse as expected
    /// (malformed attribute list, member-count mismatch, truncated name
    /// table, ...).
    #[error("resolver error: {0}")]
    Resolver(String),
}

fn format_extended_status(extended: &Option<Vec<u8>>) -> String {
    match extended {
        None => String::new(),
        Some(bytes) if bytes.is_empty() => String::new(),
        Some(bytes) => {
            let hex: Vec<String> = bytes.iter().map(|b| format!("{b:02x}")).collect();
            format!(" (extended: {})", hex.join(""))
        }
    }
}

impl From<std::io::Error> for CipError {
    fn from(e: std::io::Error) -> Self {
        CipError::Transport(TransportError::Receive(e))
    }
}
