//! Tunnel wire format
//!
//! One protobuf message per transport frame. Field numbers are fixed: both
//! sides of a tunnel may be different builds (or different implementations
//! entirely) and must stay bit-compatible.

use bytes::Bytes;
use prost::Message;

use crate::common::{Address, Error, Result};

/// The wire unit exchanged between the two tunnel sides.
///
/// `address` is only meaningful on `Connect`, `data` only on `Data`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(enumeration = "FrameKind", tag = "1")]
    pub kind: i32,
    #[prost(enumeration = "Origin", tag = "2")]
    pub origin: i32,
    #[prost(uint32, tag = "3")]
    pub id: u32,
    #[prost(string, tag = "4")]
    pub address: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "5")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

/// What a frame asks the receiving side to do
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum FrameKind {
    /// Open a session: dial `address` on the receiving side
    Connect = 0,
    /// The dial succeeded; the session is open
    Connected = 1,
    /// The dial failed; the session is dead on arrival
    Unavailable = 2,
    /// The session's socket closed; final frame for the session
    Disconnected = 3,
    /// Session payload bytes
    Data = 4,
}

/// Which side created the session a frame belongs to.
///
/// This is the entire routing protocol: a frame stamped `Local` refers to a
/// session its *sender* originated, which the receiver tracks in its
/// remote-origin registry, and vice versa. Neither side ever needs to
/// negotiate ids with the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum Origin {
    Local = 0,
    Remote = 1,
}

impl Frame {
    pub fn connect(id: u32, target: &Address) -> Frame {
        Frame {
            kind: FrameKind::Connect as i32,
            origin: Origin::Local as i32,
            id,
            address: target.to_string(),
            data: Vec::new(),
        }
    }

    pub fn connected(id: u32) -> Frame {
        Frame {
            kind: FrameKind::Connected as i32,
            origin: Origin::Local as i32,
            id,
            address: String::new(),
            data: Vec::new(),
        }
    }

    pub fn unavailable(id: u32) -> Frame {
        Frame {
            kind: FrameKind::Unavailable as i32,
            origin: Origin::Local as i32,
            id,
            address: String::new(),
            data: Vec::new(),
        }
    }

    pub fn disconnected(id: u32, origin: Origin) -> Frame {
        Frame {
            kind: FrameKind::Disconnected as i32,
            origin: origin as i32,
            id,
            address: String::new(),
            data: Vec::new(),
        }
    }

    pub fn data(id: u32, origin: Origin, payload: Vec<u8>) -> Frame {
        Frame {
            kind: FrameKind::Data as i32,
            origin: origin as i32,
            id,
            address: String::new(),
            data: payload,
        }
    }

    /// The frame kind, or a protocol error for values this build does not know.
    pub fn frame_kind(&self) -> Result<FrameKind> {
        FrameKind::try_from(self.kind)
            .map_err(|_| Error::Protocol(format!("unknown frame kind {}", self.kind)))
    }

    /// The session origin the frame is stamped with.
    pub fn session_origin(&self) -> Result<Origin> {
        Origin::try_from(self.origin)
            .map_err(|_| Error::Protocol(format!("unknown origin {}", self.origin)))
    }

    /// Serialize for the wire.
    pub fn encode_payload(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)
            .expect("Vec<u8> write cannot fail");
        buf.into()
    }

    /// Parse a wire payload. Any failure here is fatal to the tunnel.
    pub fn decode_payload(payload: &[u8]) -> Result<Frame> {
        let frame =
            Frame::decode(payload).map_err(|e| Error::Protocol(format!("malformed frame: {}", e)))?;
        frame.frame_kind()?;
        frame.session_origin()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = Frame::data(7, Origin::Remote, b"hello".to_vec());
        let decoded = Frame::decode_payload(&frame.encode_payload()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.frame_kind().unwrap(), FrameKind::Data);
        assert_eq!(decoded.session_origin().unwrap(), Origin::Remote);
    }

    #[test]
    fn connect_carries_target() {
        let frame = Frame::connect(1, &Address::domain("echo.test", 9));
        let decoded = Frame::decode_payload(&frame.encode_payload()).unwrap();
        assert_eq!(decoded.address, "echo.test:9");
        assert_eq!(decoded.frame_kind().unwrap(), FrameKind::Connect);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Frame::decode_payload(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut frame = Frame::connected(3);
        frame.kind = 42;
        assert!(Frame::decode_payload(&frame.encode_payload()).is_err());
    }
}
