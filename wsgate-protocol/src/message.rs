//! Message reassembly from fragmented data frames.

use crate::error::ProtocolError;
use crate::frame::{Frame, OpCode};
use bytes::{Bytes, BytesMut};

/// A complete data message, reassembled from one or more frames.
///
/// The opcode is taken from the first frame of the sequence and is always
/// `Text` or `Binary`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: OpCode,
    pub data: Bytes,
}

impl Message {
    /// Creates a text message.
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Text,
            data: data.into(),
        }
    }

    /// Creates a binary message.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Binary,
            data: data.into(),
        }
    }

    /// Returns the payload as UTF-8 text.
    pub fn as_text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.data).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

/// Accumulates data frames until a `fin=true` frame completes a message.
///
/// A single buffer holds the partial payload, so fragmented messages cost
/// one allocation instead of one per frame. Control frames must be filtered
/// out before frames reach the reassembler.
#[derive(Debug, Default)]
pub struct Reassembler {
    opcode: Option<OpCode>,
    buf: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while a fragmented message is in progress.
    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    /// Feeds one data frame; returns the message once its final frame lands.
    ///
    /// A `Continuation` frame with no initiating `Text`/`Binary` frame, or a
    /// new data frame arriving mid-message, is a protocol violation and the
    /// caller is expected to close with status 1002.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        match (frame.opcode, self.opcode) {
            (OpCode::Continuation, None) => return Err(ProtocolError::UnexpectedContinuation),
            (OpCode::Continuation, Some(_)) => {}
            (OpCode::Text | OpCode::Binary, None) => self.opcode = Some(frame.opcode),
            (OpCode::Text | OpCode::Binary, Some(_)) => {
                return Err(ProtocolError::InterleavedDataFrame)
            }
            (op, _) => {
                debug_assert!(op.is_control());
                return Err(ProtocolError::BadControlFrame(
                    "control frame fed to reassembler",
                ));
            }
        }

        self.buf.extend_from_slice(&frame.payload);

        if frame.fin {
            let opcode = self.opcode.take().expect("initiator recorded above");
            let data = self.buf.split().freeze();
            Ok(Some(Message { opcode, data }))
        } else {
            Ok(None)
        }
    }
}
