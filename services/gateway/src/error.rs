//! Error types for connection handling.

use std::io;

use thiserror::Error;

/// Per-connection errors with standardized reason codes.
///
/// None of these ever escape the task handling the connection that raised
/// them.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A variable-length integer ran past its five-byte limit.
    #[error("malformed_varint: continuation past {0} bytes")]
    MalformedVarInt(usize),

    /// The peer closed or the frame ended before a field was complete.
    #[error("truncated_frame: {0}")]
    TruncatedFrame(&'static str),

    /// The handshake hostname is not valid UTF-8.
    #[error("invalid_server_address: {0}")]
    InvalidServerAddress(#[source] std::string::FromUtf8Error),

    /// The declared handshake length is negative or above the accepted bound.
    #[error("oversized_frame: declared length {0}")]
    OversizedFrame(i32),

    /// The inbound identification header is structurally invalid.
    #[error("malformed_header: {0}")]
    MalformedHeader(String),

    /// The outbound identification header cannot express these addresses.
    #[error("unsupported_address_family: {src} -> {dst}")]
    UnsupportedAddressFamily { src: String, dst: String },

    /// Neither a destination rule nor the default address applies.
    #[error("no_destination: {0}")]
    NoDestination(String),

    /// Dial, dial timeout, or a bounded write to the backend failed.
    #[error("backend_unreachable: {addr}: {source}")]
    BackendUnreachable {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// IO error on the client socket.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            GatewayError::MalformedVarInt(_) => "malformed_varint",
            GatewayError::TruncatedFrame(_) => "truncated_frame",
            GatewayError::InvalidServerAddress(_) => "invalid_server_address",
            GatewayError::OversizedFrame(_) => "oversized_frame",
            GatewayError::MalformedHeader(_) => "malformed_header",
            GatewayError::UnsupportedAddressFamily { .. } => "unsupported_address_family",
            GatewayError::NoDestination(_) => "no_destination",
            GatewayError::BackendUnreachable { .. } => "backend_unreachable",
            GatewayError::Io(_) => "io_error",
        }
    }

    pub(crate) fn backend(addr: &str, source: io::Error) -> Self {
        GatewayError::BackendUnreachable {
            addr: addr.to_string(),
            source,
        }
    }

    /// Map an IO error raised while reading a frame.
    ///
    /// A peer hanging up mid-frame is a truncation, not a transport fault.
    pub(crate) fn from_frame_read(err: io::Error, field: &'static str) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            GatewayError::TruncatedFrame(field)
        } else {
            GatewayError::Io(err)
        }
    }
}

/// Result alias for connection handling.
pub type Result<T> = std::result::Result<T, GatewayError>;
