//! RFC 6455 frame codec.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |                     Masking-key (if MASK set)                 |
//! +---------------------------------------------------------------+
//! |                          Payload Data                         |
//! +---------------------------------------------------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::websocket::CloseCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Serialises an unmasked (server to client) frame into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let len = self.payload.len();
        dst.reserve(len + 10);

        let fin = if self.fin { 0x80 } else { 0x00 };
        dst.put_u8(fin | self.opcode.as_u8());

        if len < 126 {
            dst.put_u8(len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127);
            dst.put_u64(len as u64);
        }
        dst.put_slice(&self.payload);
    }
}

/// A violation that ends the session with the given close code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("unknown opcode 0x{0:X}")]
    UnknownOpcode(u8),
    #[error("client frame is not masked")]
    Unmasked,
    #[error("control frame is fragmented or longer than 125 bytes")]
    InvalidControlFrame,
    #[error("frame payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: usize },
}

impl FrameError {
    pub fn close_code(&self) -> CloseCode {
        match self {
            FrameError::TooLarge { .. } => CloseCode::MessageTooBig,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Incremental decoder for client frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Takes one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` and consumes nothing while the frame is incomplete.
    /// Oversized frames are rejected from the header alone, before their
    /// payload is buffered.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let b0 = src[0];
        let b1 = src[1];
        let fin = b0 & 0x80 != 0;
        if b0 & 0x70 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let opcode = Opcode::from_u8(b0 & 0x0F).ok_or(FrameError::UnknownOpcode(b0 & 0x0F))?;
        if b1 & 0x80 == 0 {
            return Err(FrameError::Unmasked);
        }

        let (len, mut offset) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([src[2], src[3]]) as u64, 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(raw), 10)
            }
            n => (n as u64, 2),
        };

        if opcode.is_control() && (!fin || len > 125) {
            return Err(FrameError::InvalidControlFrame);
        }
        if len > self.max_payload as u64 {
            return Err(FrameError::TooLarge {
                size: len,
                limit: self.max_payload,
            });
        }
        let len = len as usize;

        if src.len() < offset + 4 + len {
            src.reserve(offset + 4 + len - src.len());
            return Ok(None);
        }

        let mut mask = [0u8; 4];
        mask.copy_from_slice(&src[offset..offset + 4]);
        offset += 4;

        src.advance(offset);
        let mut payload = src.split_to(len).to_vec();
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked(fin: bool, opcode: u8, payload: &[u8]) -> BytesMut {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut buf = BytesMut::new();
        buf.put_u8(if fin { 0x80 } else { 0 } | opcode);
        if payload.len() < 126 {
            buf.put_u8(0x80 | payload.len() as u8);
        } else {
            buf.put_u8(0x80 | 126);
            buf.put_u16(payload.len() as u16);
        }
        buf.put_slice(&mask);
        for (i, b) in payload.iter().enumerate() {
            buf.put_u8(b ^ mask[i % 4]);
        }
        buf
    }

    #[test]
    fn decodes_masked_text_frame() {
        let decoder = FrameDecoder::new(1024);
        let mut buf = masked(true, 0x1, b"Hello");

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"Hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_complete_frame() {
        let decoder = FrameDecoder::new(1024);
        let full = masked(true, 0x2, &[7u8; 300]);
        let mut buf = BytesMut::from(&full[..full.len() - 1]);

        assert_eq!(decoder.decode(&mut buf), Ok(None));
        assert_eq!(buf.len(), full.len() - 1);

        buf.put_u8(full[full.len() - 1]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, vec![7u8; 300]);
    }

    #[test]
    fn rejects_protocol_violations() {
        let decoder = FrameDecoder::new(1024);

        let mut unmasked = BytesMut::from(&[0x81u8, 0x01, b'a'][..]);
        assert_eq!(decoder.decode(&mut unmasked), Err(FrameError::Unmasked));

        let mut rsv = masked(true, 0x1, b"a");
        rsv[0] |= 0x40;
        assert_eq!(decoder.decode(&mut rsv), Err(FrameError::ReservedBits));

        let mut fragmented_ping = masked(false, 0x9, b"");
        assert_eq!(
            decoder.decode(&mut fragmented_ping),
            Err(FrameError::InvalidControlFrame)
        );

        let mut opcode = masked(true, 0x3, b"");
        assert_eq!(decoder.decode(&mut opcode), Err(FrameError::UnknownOpcode(3)));
    }

    #[test]
    fn rejects_oversized_frame_from_header() {
        let decoder = FrameDecoder::new(16);
        let mut buf = BytesMut::from(&[0x82u8, 0x80 | 126, 0x01, 0x00][..]);

        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err, FrameError::TooLarge { size: 256, limit: 16 });
        assert_eq!(err.close_code(), CloseCode::MessageTooBig);
    }

    #[test]
    fn encodes_unmasked_lengths() {
        let mut dst = BytesMut::new();
        Frame::new(Opcode::Text, "hi").encode(&mut dst);
        assert_eq!(&dst[..], &[0x81, 0x02, b'h', b'i']);

        let mut dst = BytesMut::new();
        Frame::new(Opcode::Binary, vec![0u8; 200]).encode(&mut dst);
        assert_eq!(&dst[..4], &[0x82, 126, 0x00, 200]);
        assert_eq!(dst.len(), 204);
    }
}
