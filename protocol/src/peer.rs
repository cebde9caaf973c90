//! Direct peer-to-peer wire formats: the control handshake exchanged over
//! the negotiated TCP channel, and the datagram framing used on the UDP
//! message channel. Both sides run the same code; only send order differs
//! (connector writes its handshake first, listener replies).

use std::net::Ipv4Addr;

use crate::ProtocolError;

/// 4-byte data-channel port + 4-byte packed IPv4 address.
pub const HANDSHAKE_LEN: usize = 8;

/// Reserved bytes + 4-byte payload length.
pub const MESSAGE_HEADER_LEN: usize = 6;

/// Encode one side's half of the control handshake.
pub fn encode_handshake(ip: Ipv4Addr, data_port: u16) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[..4].copy_from_slice(&(data_port as u32).to_le_bytes());
    buf[4..].copy_from_slice(&u32::from(ip).to_le_bytes());
    buf
}

/// Decode the peer's half of the control handshake into (address, data port).
/// The port travels in a 4-byte field but must fit 16 bits; anything larger
/// is a malformed handshake, not a port to wrap around.
pub fn decode_handshake(buf: &[u8; HANDSHAKE_LEN]) -> Result<(Ipv4Addr, u16), ProtocolError> {
    let port = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let ip = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

    let port = u16::try_from(port).map_err(|_| ProtocolError::PortOutOfRange(port))?;
    Ok((Ipv4Addr::from(ip), port))
}

/// Frame a chat message for the data channel.
pub fn encode_message(text: &str) -> Vec<u8> {
    let payload = text.as_bytes();
    let mut buf = Vec::with_capacity(MESSAGE_HEADER_LEN + payload.len());
    buf.extend_from_slice(&[0, 0]); // reserved
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode one received datagram. A length field that disagrees with the
/// datagram size is a malformed frame; the caller discards it.
pub fn decode_message(buf: &[u8]) -> Result<String, ProtocolError> {
    if buf.len() < MESSAGE_HEADER_LEN {
        return Err(ProtocolError::LengthMismatch {
            declared: MESSAGE_HEADER_LEN,
            actual: buf.len(),
        });
    }

    let declared = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    let payload = &buf[MESSAGE_HEADER_LEN..];
    if declared != payload.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }

    String::from_utf8(payload.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}
