//! Wire format: length-prefixed bincode frames.
//!
//! Every message travels as a 4-byte little-endian length followed by
//! the bincode body. The framing layer is synchronous and socket-free so
//! it can be tested without a network.

use serde::{Deserialize, Serialize};

use vox_core::command::{Command, CommandsBundle};
use vox_core::world::PlayerId;

use crate::ServerError;

/// Upper bound on one frame's body. A tick bundle for a busy 8-player
/// match stays well under this.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// Everything that crosses the wire, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Client joins the match.
    Join {
        /// Display name, informational only.
        name: String,
    },
    /// Server assigns the client its player slot.
    Welcome {
        /// The assigned player index.
        player: PlayerId,
    },
    /// Client submits a command for its units.
    Submit {
        /// The submitting player.
        player: PlayerId,
        /// The command.
        command: Command,
    },
    /// Server broadcasts one sealed tick.
    Bundle(CommandsBundle),
    /// A player disconnected; its units keep simulating.
    Leave {
        /// The departed player.
        player: PlayerId,
    },
}

/// Encode a message into one length-prefixed frame.
pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, ServerError> {
    let body = bincode::serialize(message).map_err(|e| ServerError::Codec(e.to_string()))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ServerError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// Feed it raw bytes as they arrive; it yields complete messages in
/// order and buffers partial frames across reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append newly received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<WireMessage>, ServerError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(ServerError::FrameTooLarge(len));
        }
        if self.buffer.len() < 4 + len {
            return Ok(None);
        }
        let message = bincode::deserialize(&self.buffer[4..4 + len])
            .map_err(|e| ServerError::Codec(e.to_string()))?;
        self.buffer.drain(..4 + len);
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_core::command::CommandKind;

    #[test]
    fn test_roundtrip_single_message() {
        let message = WireMessage::Submit {
            player: 2,
            command: Command::new(7, CommandKind::Grow),
        };
        let frame = encode_frame(&message).unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        assert_eq!(decoder.next_message().unwrap(), Some(message));
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_partial_frames_reassemble() {
        let message = WireMessage::Bundle(CommandsBundle::new(42));
        let frame = encode_frame(&message).unwrap();

        let mut decoder = FrameDecoder::new();
        let (first, second) = frame.split_at(frame.len() / 2);
        decoder.push(first);
        assert_eq!(decoder.next_message().unwrap(), None);
        decoder.push(second);
        assert_eq!(decoder.next_message().unwrap(), Some(message));
    }

    #[test]
    fn test_back_to_back_frames() {
        let first = WireMessage::Welcome { player: 0 };
        let second = WireMessage::Leave { player: 0 };
        let mut stream = encode_frame(&first).unwrap();
        stream.extend(encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        assert_eq!(decoder.next_message().unwrap(), Some(first));
        assert_eq!(decoder.next_message().unwrap(), Some(second));
        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::new();
        let bogus_len = (MAX_FRAME_BYTES as u32 + 1).to_le_bytes();
        decoder.push(&bogus_len);
        assert!(matches!(
            decoder.next_message(),
            Err(ServerError::FrameTooLarge(_))
        ));
    }
}
