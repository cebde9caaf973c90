//! Wire protocol for the rendezvous chat system.
//!
//! Two frame kinds travel on the client <-> directory server channel:
//! fixed-width command frames (tag 0x01, 18 bytes total) and variable-length
//! data-transfer frames (user listings). Raw param byte fields are decoded
//! into typed payloads here at the boundary, so the rest of the system never
//! touches padded byte slices.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

pub mod peer;

pub const COMMAND_TAG: u8 = 0x01;
pub const TRANSFER_CHUNK: u8 = 0x00;
pub const TRANSFER_FINAL: u8 = 0x40;

/// Username/password/param field width on the wire, zero padded.
pub const FIELD_LEN: usize = 8;

/// Tag + code + param1 + param2.
pub const COMMAND_FRAME_LEN: usize = 2 + 2 * FIELD_LEN;

/// Tag + identifier length + payload length.
pub const TRANSFER_HEADER_LEN: usize = 6;

/// Upper bound on a declared transfer payload. A header claiming more is
/// rejected as soon as it is read, before any buffering for the payload.
pub const MAX_TRANSFER_LEN: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unrecognized frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("unrecognized command code {0}")]
    UnknownCommand(u8),
    #[error("{0} longer than {FIELD_LEN} bytes")]
    FieldTooLong(&'static str),
    #[error("field is not valid utf-8")]
    InvalidUtf8,
    #[error("payload length mismatch, declared {declared} actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("declared payload length {0} exceeds {MAX_TRANSFER_LEN} bytes")]
    PayloadTooLarge(usize),
    #[error("port value {0} does not fit in 16 bits")]
    PortOutOfRange(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Closed command code enumeration. An unlisted code byte decodes to
/// `ProtocolError::UnknownCommand`, never a silent skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SignUp { username: String, password: String },            // 1
    DeclineSignUp,                                            // 2
    SignIn { username: String, password: String },            // 3
    AcceptSignIn,                                             // 4
    DeclineSignIn,                                            // 5
    RequestUserList,                                          // 6
    RequestPtpConnection { username: String },                // 7
    UserNotAvailable,                                         // 8
    RelayPtpRequest { username: String },                     // 9
    DeclinePtpConnection { username: String },                // 10
    AcceptPtpConnection { username: String, addr: PeerAddr }, // 11
    SignOut { username: String },                             // 12
    AlreadyLoggedIn,                                          // 13
}

/// IPv4 address + port pair packed into a command param field.
/// Opaque to the directory server; only the two peer clients interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl PeerAddr {
    pub fn to_field(self) -> [u8; FIELD_LEN] {
        let mut field = [0u8; FIELD_LEN];
        field[..4].copy_from_slice(&u32::from(self.ip).to_le_bytes());
        field[4..6].copy_from_slice(&self.port.to_le_bytes());
        field
    }

    pub fn from_field(field: &[u8; FIELD_LEN]) -> Self {
        let ip = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
        let port = u16::from_le_bytes([field[4], field[5]]);
        PeerAddr { ip: Ipv4Addr::from(ip), port }
    }
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::SignUp { .. } => 1,
            Command::DeclineSignUp => 2,
            Command::SignIn { .. } => 3,
            Command::AcceptSignIn => 4,
            Command::DeclineSignIn => 5,
            Command::RequestUserList => 6,
            Command::RequestPtpConnection { .. } => 7,
            Command::UserNotAvailable => 8,
            Command::RelayPtpRequest { .. } => 9,
            Command::DeclinePtpConnection { .. } => 10,
            Command::AcceptPtpConnection { .. } => 11,
            Command::SignOut { .. } => 12,
            Command::AlreadyLoggedIn => 13,
        }
    }

    fn decode(code: u8, param1: [u8; FIELD_LEN], param2: [u8; FIELD_LEN])
              -> Result<Command, ProtocolError> {
        let cmd = match code {
            1 => Command::SignUp {
                username: field_to_string(&param1)?,
                password: field_to_string(&param2)?,
            },
            2 => Command::DeclineSignUp,
            3 => Command::SignIn {
                username: field_to_string(&param1)?,
                password: field_to_string(&param2)?,
            },
            4 => Command::AcceptSignIn,
            5 => Command::DeclineSignIn,
            6 => Command::RequestUserList,
            7 => Command::RequestPtpConnection { username: field_to_string(&param1)? },
            8 => Command::UserNotAvailable,
            9 => Command::RelayPtpRequest { username: field_to_string(&param1)? },
            10 => Command::DeclinePtpConnection { username: field_to_string(&param1)? },
            11 => Command::AcceptPtpConnection {
                username: field_to_string(&param1)?,
                addr: PeerAddr::from_field(&param2),
            },
            12 => Command::SignOut { username: field_to_string(&param1)? },
            13 => Command::AlreadyLoggedIn,
            other => {
                debug!("rejecting unknown command code {}", other);
                return Err(ProtocolError::UnknownCommand(other));
            },
        };

        Ok(cmd)
    }

    fn params(&self) -> Result<([u8; FIELD_LEN], [u8; FIELD_LEN]), ProtocolError> {
        let zero = [0u8; FIELD_LEN];

        let params = match self {
            Command::SignUp { username, password } |
            Command::SignIn { username, password } => {
                (string_to_field(username, "username")?,
                 string_to_field(password, "password")?)
            },
            Command::RequestPtpConnection { username } |
            Command::RelayPtpRequest { username } |
            Command::DeclinePtpConnection { username } |
            Command::SignOut { username } => {
                (string_to_field(username, "username")?, zero)
            },
            Command::AcceptPtpConnection { username, addr } => {
                (string_to_field(username, "username")?, addr.to_field())
            },
            _ => (zero, zero),
        };

        Ok(params)
    }
}

/// Variable-length bulk content, server to client only.
/// The identifier length byte is carried on the wire but the final protocol
/// iteration always sends it as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub last: bool,
    pub ident_len: u8,
    pub payload: Vec<u8>,
}

impl Transfer {
    pub fn final_chunk(payload: Vec<u8>) -> Self {
        Transfer { last: true, ident_len: 0, payload }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command(Command),
    Transfer(Transfer),
}

pub struct CommandCodec; // unit struct

impl Decoder for CommandCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        match src[0] {
            COMMAND_TAG => {
                if src.len() < COMMAND_FRAME_LEN {
                    src.reserve(COMMAND_FRAME_LEN - src.len());
                    return Ok(None);
                }

                src.advance(1);
                let code = src.get_u8();
                let mut param1 = [0u8; FIELD_LEN];
                src.copy_to_slice(&mut param1);
                let mut param2 = [0u8; FIELD_LEN];
                src.copy_to_slice(&mut param2);

                Ok(Some(Frame::Command(Command::decode(code, param1, param2)?)))
            },
            TRANSFER_CHUNK | TRANSFER_FINAL => {
                if src.len() < TRANSFER_HEADER_LEN {
                    return Ok(None);
                }

                let declared =
                    u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
                if declared > MAX_TRANSFER_LEN {
                    // a hostile length field must not buy any buffering,
                    // nor keep the connection waiting for bytes to come
                    debug!("rejecting transfer declaring {} payload bytes", declared);
                    return Err(ProtocolError::PayloadTooLarge(declared));
                }
                if src.len() < TRANSFER_HEADER_LEN + declared {
                    src.reserve(TRANSFER_HEADER_LEN + declared - src.len());
                    return Ok(None);
                }

                let tag = src.get_u8();
                let ident_len = src.get_u8();
                src.advance(4); // declared length, already read
                let payload = src.split_to(declared).to_vec();

                Ok(Some(Frame::Transfer(Transfer {
                    last: tag == TRANSFER_FINAL,
                    ident_len,
                    payload,
                })))
            },
            other => {
                debug!("rejecting frame with unknown leading tag {:#04x}", other);
                Err(ProtocolError::UnknownTag(other))
            },
        }
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (param1, param2) = item.params()?;

        dst.reserve(COMMAND_FRAME_LEN);
        dst.put_u8(COMMAND_TAG);
        dst.put_u8(item.code());
        dst.extend_from_slice(&param1);
        dst.extend_from_slice(&param2);

        Ok(())
    }
}

impl Encoder<Transfer> for CommandCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Transfer, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(TRANSFER_HEADER_LEN + item.payload.len());
        dst.put_u8(if item.last { TRANSFER_FINAL } else { TRANSFER_CHUNK });
        dst.put_u8(item.ident_len);
        dst.put_u32_le(item.payload.len() as u32);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}

impl Encoder<Frame> for CommandCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Command(cmd) => self.encode(cmd, dst),
            Frame::Transfer(transfer) => self.encode(transfer, dst),
        }
    }
}

// read a zero padded wire field into a String
fn field_to_string(field: &[u8; FIELD_LEN]) -> Result<String, ProtocolError> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(FIELD_LEN);
    std::str::from_utf8(&field[..end])
        .map(|s| s.to_owned())
        .map_err(|_| ProtocolError::InvalidUtf8)
}

// write a String into a zero padded wire field
fn string_to_field(s: &str, what: &'static str) -> Result<[u8; FIELD_LEN], ProtocolError> {
    let bytes = s.as_bytes();
    if bytes.len() > FIELD_LEN {
        return Err(ProtocolError::FieldTooLong(what));
    }

    let mut field = [0u8; FIELD_LEN];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cmd: Command) -> Command {
        let mut codec = CommandCodec;
        let mut buf = BytesMut::new();
        codec.encode(cmd, &mut buf).unwrap();
        assert_eq!(buf.len(), COMMAND_FRAME_LEN);

        match codec.decode(&mut buf).unwrap() {
            Some(Frame::Command(decoded)) => {
                assert!(buf.is_empty());
                decoded
            },
            other => panic!("expected command frame, got {:?}", other),
        }
    }

    #[test]
    fn command_roundtrip_preserves_typed_payloads() {
        let cases = vec![
            Command::SignUp { username: "alice".into(), password: "pw".into() },
            Command::SignIn { username: "bob12345".into(), password: "hunter2".into() },
            Command::DeclineSignUp,
            Command::AcceptSignIn,
            Command::DeclineSignIn,
            Command::RequestUserList,
            Command::RequestPtpConnection { username: "bob".into() },
            Command::UserNotAvailable,
            Command::RelayPtpRequest { username: "alice".into() },
            Command::DeclinePtpConnection { username: "carol".into() },
            Command::AcceptPtpConnection {
                username: "alice".into(),
                addr: PeerAddr { ip: Ipv4Addr::new(127, 0, 0, 1), port: 15999 },
            },
            Command::SignOut { username: "alice".into() },
            Command::AlreadyLoggedIn,
        ];

        for cmd in cases {
            assert_eq!(roundtrip(cmd.clone()), cmd);
        }
    }

    #[test]
    fn command_fields_are_zero_padded() {
        let mut codec = CommandCodec;
        let mut buf = BytesMut::new();
        codec.encode(Command::SignUp { username: "al".into(), password: "p".into() },
                     &mut buf).unwrap();

        // tag, code, then "al" + six NULs, "p" + seven NULs
        assert_eq!(&buf[..], &[0x01, 1,
                               b'a', b'l', 0, 0, 0, 0, 0, 0,
                               b'p', 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn oversize_field_is_rejected_at_encode() {
        let mut codec = CommandCodec;
        let mut buf = BytesMut::new();
        let res = codec.encode(Command::RequestPtpConnection {
            username: "ninecharss".into(),
        }, &mut buf);

        assert!(matches!(res, Err(ProtocolError::FieldTooLong("username"))));
    }

    #[test]
    fn unknown_command_code_is_a_violation() {
        let mut codec = CommandCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(COMMAND_TAG);
        buf.put_u8(99);
        buf.extend_from_slice(&[0u8; 2 * FIELD_LEN]);

        assert!(matches!(codec.decode(&mut buf),
                         Err(ProtocolError::UnknownCommand(99))));
    }

    #[test]
    fn unknown_tag_is_a_violation() {
        let mut codec = CommandCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        buf.put_u8(0);

        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::UnknownTag(0x7f))));
    }

    #[test]
    fn partial_command_frame_waits_for_more_bytes() {
        let mut codec = CommandCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(COMMAND_TAG);
        buf.put_u8(6);
        buf.extend_from_slice(&[0u8; 5]);

        assert!(matches!(codec.decode(&mut buf), Ok(None)));
        assert_eq!(buf.len(), 7); // nothing consumed
    }

    #[test]
    fn transfer_roundtrip_including_empty_payload() {
        let mut codec = CommandCodec;

        for payload in [vec![], b"alice, bob".to_vec()] {
            let mut buf = BytesMut::new();
            let n = payload.len();
            codec.encode(Transfer::final_chunk(payload.clone()), &mut buf).unwrap();
            assert_eq!(buf.len(), TRANSFER_HEADER_LEN + n);

            match codec.decode(&mut buf).unwrap() {
                Some(Frame::Transfer(t)) => {
                    assert!(t.last);
                    assert_eq!(t.payload.len(), n);
                    assert_eq!(t.payload, payload);
                },
                other => panic!("expected transfer frame, got {:?}", other),
            }
        }
    }

    #[test]
    fn transfer_waits_until_declared_payload_arrives() {
        let mut codec = CommandCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(TRANSFER_FINAL);
        buf.put_u8(0);
        buf.put_u32_le(10);
        buf.extend_from_slice(b"alice");

        // only 5 of the declared 10 payload bytes present, no over-read
        assert!(matches!(codec.decode(&mut buf), Ok(None)));
    }

    #[test]
    fn hostile_declared_length_is_rejected_from_the_header_alone() {
        let mut codec = CommandCodec;
        let mut buf = BytesMut::new();
        buf.put_u8(TRANSFER_FINAL);
        buf.put_u8(0);
        buf.put_u32_le(0x7fff_ffff);

        // the six header bytes alone must settle it, no waiting, no reserve
        assert!(matches!(codec.decode(&mut buf),
                         Err(ProtocolError::PayloadTooLarge(0x7fff_ffff))));
    }

    #[test]
    fn peer_addr_field_roundtrip() {
        let addr = PeerAddr { ip: Ipv4Addr::new(192, 168, 1, 7), port: 18432 };
        assert_eq!(PeerAddr::from_field(&addr.to_field()), addr);
    }
}
