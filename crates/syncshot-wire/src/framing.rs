//! Stream framing
//!
//! TCP gives no message boundaries: one read may carry two frames, or half
//! of one. `FrameDecoder` accumulates raw bytes and only hands out complete
//! `\n`-terminated frames.

use bytes::{Buf, BytesMut};

use syncshot_core::{SyncError, SyncResult};

use crate::{Message, FRAME_TERMINATOR};

/// Longest frame accepted before the stream is declared corrupt
pub const MAX_FRAME_LEN: usize = 4096;

/// Buffering frame decoder
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        FrameDecoder {
            buf: BytesMut::with_capacity(512),
            max_frame_len,
        }
    }

    /// Append bytes received from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Buffer for direct reads (`AsyncReadExt::read_buf`)
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes of an incomplete frame still waiting for their terminator
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, if one is buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A malformed frame is
    /// consumed and reported; it is never skipped silently.
    pub fn next_message(&mut self) -> SyncResult<Option<Message>> {
        let Some(end) = self.buf.iter().position(|b| *b == FRAME_TERMINATOR) else {
            if self.buf.len() > self.max_frame_len {
                return Err(SyncError::FrameTooLong {
                    limit: self.max_frame_len,
                    actual: self.buf.len(),
                });
            }
            return Ok(None);
        };

        let frame = self.buf.split_to(end);
        self.buf.advance(1);

        if frame.len() > self.max_frame_len {
            return Err(SyncError::FrameTooLong {
                limit: self.max_frame_len,
                actual: frame.len(),
            });
        }

        let text = std::str::from_utf8(&frame).map_err(|_| SyncError::InvalidEncoding)?;
        Message::decode(text.strip_suffix('\r').unwrap_or(text)).map(Some)
    }

    /// Drain every complete frame currently buffered
    pub fn drain_messages(&mut self) -> SyncResult<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(message) = self.next_message()? {
            messages.push(message);
        }
        Ok(messages)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use syncshot_core::{AgentId, Timestamp};
    use std::time::Duration;

    fn conversation() -> Vec<Message> {
        vec![
            Message::TakePhoto {
                deadline: Timestamp::from_nanos(1_700_000_000_000_000_000),
            },
            Message::PhotoTaken {
                elapsed: Some(Duration::from_micros(51_234)),
            },
            Message::RamLow,
            Message::StopRecord,
            Message::RecordingStopped,
            Message::Ready,
            Message::Anomalies {
                agent: AgentId::new(3).unwrap(),
                rounds: vec![4, 9, 12],
            },
        ]
    }

    #[test]
    fn test_merged_frames_in_one_read() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"PHOTO_TAKEN\nRECORDING_STOPPED\nREA");

        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::PhotoTaken { elapsed: None })
        );
        assert_eq!(decoder.next_message().unwrap(), Some(Message::RecordingStopped));
        assert_eq!(decoder.next_message().unwrap(), None);
        assert_eq!(decoder.pending(), 3);

        decoder.extend(b"DY\r\n");
        assert_eq!(decoder.next_message().unwrap(), Some(Message::Ready));
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_unknown_frame_is_reported_then_stream_continues() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"PHOTO_TAKN\nREADY\n");

        assert_eq!(
            decoder.next_message(),
            Err(SyncError::UnknownKeyword("PHOTO_TAKN".into()))
        );
        assert_eq!(decoder.next_message().unwrap(), Some(Message::Ready));
    }

    #[test]
    fn test_unterminated_garbage_is_bounded() {
        let mut decoder = FrameDecoder::with_max_frame_len(16);
        decoder.extend(&[b'A'; 17]);
        assert!(matches!(
            decoder.next_message(),
            Err(SyncError::FrameTooLong { limit: 16, .. })
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0xff, 0xfe, b'\n']);
        assert_eq!(decoder.next_message(), Err(SyncError::InvalidEncoding));
    }

    proptest! {
        #[test]
        fn prop_any_fragmentation_decodes_identically(
            cuts in proptest::collection::vec(1usize..40, 0..30)
        ) {
            let expected = conversation();
            let stream: Vec<u8> = expected.iter().flat_map(|m| m.encode()).collect();

            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            let mut offset = 0;
            for cut in cuts {
                let end = (offset + cut).min(stream.len());
                decoder.extend(&stream[offset..end]);
                decoded.extend(decoder.drain_messages().unwrap());
                offset = end;
            }
            decoder.extend(&stream[offset..]);
            decoded.extend(decoder.drain_messages().unwrap());

            prop_assert_eq!(decoded, expected);
            prop_assert_eq!(decoder.pending(), 0);
        }
    }
}
