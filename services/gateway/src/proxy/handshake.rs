//! Handshake frame decoding.
//!
//! The first packet a game client sends names the virtual host it is
//! dialing. The gateway routes on that name, then replays the frame to the
//! backend byte for byte.
//!
//! Wire format:
//! - varint: frame length L
//! - L bytes of payload:
//!   - varint: packet id
//!   - varint: protocol version
//!   - varint-prefixed UTF-8: requested address
//!   - u16 big-endian: requested port
//!   - varint: next state
//!
//! Varints carry 7 data bits per byte, least significant group first, with
//! 0x80 as the continuation flag, and never exceed five bytes.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{GatewayError, Result};

/// Maximum encoded length of a varint.
pub const MAX_VARINT_LEN: usize = 5;

/// Largest handshake payload accepted before any bytes are buffered.
pub const MAX_HANDSHAKE_LEN: i32 = 32 * 1024;

const CONTINUATION: u8 = 0x80;
const SEGMENT: u8 = 0x7f;

/// Append the varint encoding of `value` to `buf`.
///
/// Negative values are encoded through their two's complement bits and
/// always take five bytes.
pub fn encode_varint(value: i32, buf: &mut Vec<u8>) {
    let mut value = value as u32;
    loop {
        let byte = (value & SEGMENT as u32) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | CONTINUATION);
    }
}

/// Decode a varint from the front of a slice, advancing it.
pub fn decode_varint(buf: &mut &[u8]) -> Result<i32> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let Some((&byte, rest)) = buf.split_first() else {
            return Err(GatewayError::TruncatedFrame("varint"));
        };
        *buf = rest;
        value |= ((byte & SEGMENT) as u32) << (7 * i);
        if byte & CONTINUATION == 0 {
            return Ok(value as i32);
        }
    }
    Err(GatewayError::MalformedVarInt(MAX_VARINT_LEN))
}

/// Read a varint from a stream.
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<i32> {
    let mut raw = Vec::with_capacity(MAX_VARINT_LEN);
    read_varint_raw(reader, &mut raw).await
}

/// Read a varint from a stream, appending the bytes exactly as received.
async fn read_varint_raw<R: AsyncRead + Unpin>(reader: &mut R, raw: &mut Vec<u8>) -> Result<i32> {
    let mut value: u32 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader
            .read_u8()
            .await
            .map_err(|e| GatewayError::from_frame_read(e, "varint"))?;
        raw.push(byte);
        value |= ((byte & SEGMENT) as u32) << (7 * i);
        if byte & CONTINUATION == 0 {
            return Ok(value as i32);
        }
    }
    Err(GatewayError::MalformedVarInt(MAX_VARINT_LEN))
}

/// A decoded handshake frame and the exact bytes it arrived as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFrame {
    /// Packet id (0x00 for handshakes).
    pub packet_id: i32,
    /// Client protocol version.
    pub protocol_version: i32,
    /// Virtual host the client is dialing.
    pub server_address: String,
    /// Port the client is dialing.
    pub server_port: u16,
    /// Requested state after the handshake (status or login).
    pub next_state: i32,
    /// Length prefix and payload as received.
    raw: Vec<u8>,
}

impl HandshakeFrame {
    /// The frame bytes to replay to the backend.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Consume the frame, keeping only its bytes.
    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }
}

/// Read and decode one handshake frame.
///
/// Only the declared frame length is consumed from the stream; anything
/// the client sent after it stays unread for the forwarder.
pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<HandshakeFrame> {
    let mut raw = Vec::with_capacity(MAX_VARINT_LEN);
    let length = read_varint_raw(reader, &mut raw).await?;
    if !(0..=MAX_HANDSHAKE_LEN).contains(&length) {
        return Err(GatewayError::OversizedFrame(length));
    }

    let prefix_len = raw.len();
    raw.resize(prefix_len + length as usize, 0);
    reader
        .read_exact(&mut raw[prefix_len..])
        .await
        .map_err(|e| GatewayError::from_frame_read(e, "payload"))?;

    let mut payload = &raw[prefix_len..];
    let packet_id = decode_varint(&mut payload)?;
    let protocol_version = decode_varint(&mut payload)?;

    let address_len = decode_varint(&mut payload)?;
    if address_len < 0 || address_len as usize > payload.len() {
        return Err(GatewayError::TruncatedFrame("server address"));
    }
    let (address, rest) = payload.split_at(address_len as usize);
    let server_address =
        String::from_utf8(address.to_vec()).map_err(GatewayError::InvalidServerAddress)?;
    payload = rest;

    let Some((port, rest)) = payload.split_first_chunk::<2>() else {
        return Err(GatewayError::TruncatedFrame("server port"));
    };
    let server_port = u16::from_be_bytes(*port);
    payload = rest;

    let next_state = decode_varint(&mut payload)?;

    Ok(HandshakeFrame {
        packet_id,
        protocol_version,
        server_address,
        server_port,
        next_state,
        raw,
    })
}

/// Encode a handshake frame (packet id 0x00).
///
/// The gateway itself never re-encodes a frame it received; this exists
/// for clients and tests that need to produce one.
pub fn encode_handshake(
    protocol_version: i32,
    server_address: &str,
    server_port: u16,
    next_state: i32,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(server_address.len() + 16);
    encode_varint(0x00, &mut payload);
    encode_varint(protocol_version, &mut payload);
    encode_varint(server_address.len() as i32, &mut payload);
    payload.extend_from_slice(server_address.as_bytes());
    payload.extend_from_slice(&server_port.to_be_bytes());
    encode_varint(next_state, &mut payload);

    let mut frame = Vec::with_capacity(payload.len() + MAX_VARINT_LEN);
    encode_varint(payload.len() as i32, &mut frame);
    frame.extend_from_slice(&payload);
    frame
}
