//! RFC 6455 frame encoding and decoding.
//!
//! Frame layout (2-byte base header + optional extended length + optional
//! masking key + payload):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |                 Masking-key, if MASK set to 1                 |
//! +---------------------------------------------------------------+
//! |                          Payload Data                         |
//! +---------------------------------------------------------------+
//! ```

use crate::close::CloseCode;
use crate::error::ProtocolError;
use crate::{MAX_CONTROL_PAYLOAD, MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame type identifier (4-bit opcode field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames must not be fragmented and carry at most 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(ProtocolError::InvalidOpCode(other)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        match op {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// XORs `data` in place with the 32-bit masking key (byte i with key[i % 4]).
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// A parsed WebSocket frame.
///
/// `mask` records the key the frame was (or will be) masked with; the
/// payload itself is always held unmasked. Client-to-server frames must set
/// a mask before encoding, server-to-client frames must not.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// Masking key, if the frame is masked on the wire.
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a final text frame.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Text,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Binary,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a continuation frame (final unless changed via [`with_fin`](Self::with_fin)).
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Continuation,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Ping,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: OpCode::Pong,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a close frame carrying a status code and UTF-8 reason.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(u16::from(code));
        payload.put_slice(reason);
        Self {
            fin: true,
            opcode: OpCode::Close,
            mask: None,
            payload: payload.freeze(),
        }
    }

    /// Sets the fin flag (builder style).
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Sets an explicit masking key (builder style).
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Sets a cryptographically random masking key, as the client role must.
    pub fn with_random_mask(mut self) -> Self {
        self.mask = Some(rand::random());
        self
    }

    /// Extracts the status code from a close frame payload.
    pub fn close_code(&self) -> Option<CloseCode> {
        let raw = u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?);
        Some(CloseCode::from(raw))
    }

    /// Extracts the UTF-8 reason from a close frame payload, if any.
    pub fn close_reason(&self) -> Result<Option<&str>, ProtocolError> {
        match self.payload.get(2..) {
            None | Some([]) => Ok(None),
            Some(reason) => std::str::from_utf8(reason)
                .map(Some)
                .map_err(|_| ProtocolError::InvalidUtf8),
        }
    }

    /// Splits the frame into fragments of at most `max_size` payload bytes.
    ///
    /// The first fragment keeps the frame's opcode; the rest are
    /// Continuation frames; only the last carries `fin=true`. Frames that
    /// already fit yield themselves unchanged.
    pub fn into_fragments(self, max_size: usize) -> Vec<Frame> {
        if self.payload.len() <= max_size {
            return vec![self];
        }

        let mut out = Vec::with_capacity(self.payload.len() / max_size + 1);
        let mut rest = self.payload;
        let mut opcode = self.opcode;
        while rest.len() > max_size {
            let chunk = rest.split_to(max_size);
            out.push(Frame {
                fin: false,
                opcode,
                mask: self.mask,
                payload: chunk,
            });
            opcode = OpCode::Continuation;
        }
        out.push(Frame {
            fin: true,
            opcode,
            mask: self.mask,
            payload: rest,
        });
        out
    }

    /// Encodes the frame into bytes, masking the payload if a key is set.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(14 + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Encodes the frame onto the end of `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if self.opcode.is_control() {
            if !self.fin {
                return Err(ProtocolError::BadControlFrame("fragmented control frame"));
            }
            if len > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::BadControlFrame(
                    "control payload exceeds 125 bytes",
                ));
            }
        }

        self.write_head(dst);

        match self.mask {
            Some(key) => {
                let start = dst.len();
                dst.put_slice(&self.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&self.payload),
        }

        Ok(())
    }

    /// Writes the frame header: FIN/RSV/opcode byte, then the mask bit and
    /// 7-bit length, 126 + 16-bit or 127 + 64-bit big-endian length, then
    /// the masking key when present.
    fn write_head(&self, dst: &mut BytesMut) {
        let first = (u8::from(self.fin) << 7) | u8::from(self.opcode);
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();

        dst.put_u8(first);
        if len <= 125 {
            dst.put_u8(len as u8 | mask_bit);
        } else if len <= u16::MAX as usize {
            dst.put_u8(126 | mask_bit);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }

        if let Some(key) = self.mask {
            dst.put_slice(&key);
        }
    }

    /// Decodes a frame from the front of `buf`.
    ///
    /// Returns `Ok(Some(frame))` with the consumed bytes removed from `buf`,
    /// `Ok(None)` if the buffer holds only a prefix of a frame, or `Err` on
    /// protocol violations. Masked payloads are unmasked; the key is kept on
    /// the returned frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let rsv = b0 & 0x70;
        if rsv != 0 {
            // No extension is ever negotiated, so RSV bits are always fatal.
            return Err(ProtocolError::ReservedBitsSet(rsv));
        }
        let fin = b0 & 0x80 != 0;
        let opcode = OpCode::try_from(b0 & 0x0F)?;

        let b1 = buf[1];
        let masked = b1 & 0x80 != 0;
        let len7 = (b1 & 0x7F) as usize;

        let (payload_len, len_bytes) = match len7 {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as usize, 2)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes(buf[2..10].try_into().expect("slice of 8"));
                if len > MAX_PAYLOAD_SIZE as u64 {
                    return Err(ProtocolError::FrameTooLarge {
                        size: len as usize,
                        max: MAX_PAYLOAD_SIZE,
                    });
                }
                (len as usize, 8)
            }
            n => (n, 0),
        };

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if opcode.is_control() {
            if !fin {
                return Err(ProtocolError::BadControlFrame("fragmented control frame"));
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::BadControlFrame(
                    "control payload exceeds 125 bytes",
                ));
            }
        }

        let header_len = 2 + len_bytes + if masked { 4 } else { 0 };
        let total_len = header_len + payload_len;
        if buf.len() < total_len {
            return Ok(None);
        }

        let mask = if masked {
            let key: [u8; 4] = buf[2 + len_bytes..2 + len_bytes + 4]
                .try_into()
                .expect("slice of 4");
            Some(key)
        } else {
            None
        };

        buf.advance(header_len);
        let mut payload = buf.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Self {
            fin,
            opcode,
            mask,
            payload: payload.freeze(),
        }))
    }
}
