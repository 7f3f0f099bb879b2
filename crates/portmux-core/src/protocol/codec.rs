//! Binary codec for encoding and reassembling PortMux frames.
//!
//! Wire format:
//! ```text
//! [command:2][payload_len:2][payload:N]
//! ```
//! Total header size: 4 bytes. All multi-byte integers are big-endian.
//!
//! Encoding is stateless ([`encode_frame`]).  Decoding is stateful
//! ([`FrameDecoder`]): the shared link is a raw byte stream with no message
//! boundaries of its own, so a single transport read may deliver half a
//! header, three frames and the first byte of a fourth, and the decoder must
//! reassemble frames across any such split without ever losing stream
//! position.

use thiserror::Error;
use tracing::warn;

use crate::protocol::frames::{Command, Frame, HEADER_SIZE, MAX_PAYLOAD};

/// Errors that can occur while building frame bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload does not fit the 16-bit length field.
    #[error("payload of {size} bytes exceeds the {MAX_PAYLOAD}-byte frame limit")]
    PayloadTooLarge { size: usize },
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encodes a [`Frame`] into a byte vector including the 4-byte header.
///
/// Deterministic and side-effect free.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD`].
///
/// # Examples
///
/// ```rust
/// use portmux_core::{encode_frame, Frame, FrameDecoder};
///
/// let frame = Frame::connect(3);
/// let bytes = encode_frame(&frame).unwrap();
///
/// let mut decoder = FrameDecoder::new();
/// assert_eq!(decoder.feed(&bytes), vec![frame]);
/// ```
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let len = frame.payload.len();
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge { size: len });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + len);
    buf.extend_from_slice(&(frame.command as u16).to_be_bytes());
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decoder progress between calls to [`FrameDecoder::feed`].
#[derive(Debug)]
enum DecodeState {
    /// Collecting the 4-byte header (possibly across reads).
    AwaitHeader,
    /// Header parsed; collecting `needed` payload bytes.
    AwaitPayload {
        /// `None` when the command code was unrecognized; the payload is
        /// still consumed to keep the stream synchronized, then dropped.
        command: Option<Command>,
        raw_code: u16,
        needed: usize,
    },
}

/// Incremental frame reassembler.
///
/// Call [`feed`](FrameDecoder::feed) once per transport read with whatever
/// bytes arrived; it returns every frame completed by that chunk, in order.
/// Frames may split at any byte boundary, inside the header or inside the
/// payload, or span more than two reads for large payloads.  `feed` never
/// blocks and never discards bytes.
#[derive(Debug)]
pub struct FrameDecoder {
    header: [u8; HEADER_SIZE],
    header_len: usize,
    payload: Vec<u8>,
    state: DecodeState,
}

impl FrameDecoder {
    /// Creates a decoder positioned at a frame boundary.
    pub fn new() -> Self {
        Self {
            header: [0u8; HEADER_SIZE],
            header_len: 0,
            payload: Vec::new(),
            state: DecodeState::AwaitHeader,
        }
    }

    /// Consumes one chunk of link bytes and returns the frames it completed.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();

        while !chunk.is_empty() {
            match self.state {
                DecodeState::AwaitHeader => {
                    // Top up the pending header from the chunk.
                    let take = (HEADER_SIZE - self.header_len).min(chunk.len());
                    self.header[self.header_len..self.header_len + take]
                        .copy_from_slice(&chunk[..take]);
                    self.header_len += take;
                    chunk = &chunk[take..];

                    if self.header_len < HEADER_SIZE {
                        // Chunk exhausted mid-header; resume on the next read.
                        break;
                    }
                    self.header_len = 0;

                    let raw_code = u16::from_be_bytes([self.header[0], self.header[1]]);
                    let needed =
                        u16::from_be_bytes([self.header[2], self.header[3]]) as usize;
                    let command = Command::try_from(raw_code).ok();

                    if needed == 0 {
                        self.emit(command, raw_code, Vec::new(), &mut frames);
                    } else {
                        self.payload.clear();
                        self.payload.reserve(needed);
                        self.state = DecodeState::AwaitPayload {
                            command,
                            raw_code,
                            needed,
                        };
                    }
                }
                DecodeState::AwaitPayload {
                    command,
                    raw_code,
                    needed,
                } => {
                    // Top up the pending payload from the chunk.
                    let take = (needed - self.payload.len()).min(chunk.len());
                    self.payload.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if self.payload.len() == needed {
                        let payload = std::mem::take(&mut self.payload);
                        self.state = DecodeState::AwaitHeader;
                        self.emit(command, raw_code, payload, &mut frames);
                    }
                    // else: chunk exhausted mid-payload; the loop exits.
                }
            }
        }

        frames
    }

    fn emit(
        &self,
        command: Option<Command>,
        raw_code: u16,
        payload: Vec<u8>,
        out: &mut Vec<Frame>,
    ) {
        match command {
            Some(command) => out.push(Frame { command, payload }),
            // Unknown command: the declared payload was consumed so the
            // stream stays byte-synchronized, but the frame is not emitted.
            None => warn!(
                code = format!("0x{raw_code:04X}"),
                payload_len = payload.len(),
                "dropping frame with unknown command code"
            ),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &Frame) -> Frame {
        let encoded = encode_frame(frame).expect("encode failed");
        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.feed(&encoded);
        assert_eq!(frames.len(), 1, "exactly one frame per encoded buffer");
        frames.remove(0)
    }

    // ── Round trips ───────────────────────────────────────────────────────────

    #[test]
    fn test_connect_round_trip() {
        let frame = Frame::connect(0);
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_disconnect_round_trip() {
        let frame = Frame::disconnect(u16::MAX);
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_data_round_trip() {
        let frame = Frame::data(42, b"hello world").unwrap();
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_link_up_round_trip() {
        let frame = Frame::link_up(8000);
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_terminate_round_trip() {
        let frame = Frame::terminate();
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_maximum_payload_round_trip() {
        let frame = Frame {
            command: Command::Data,
            payload: vec![0xA5; MAX_PAYLOAD],
        };
        assert_eq!(round_trip(&frame), frame);
    }

    // ── Header layout ─────────────────────────────────────────────────────────

    #[test]
    fn test_header_encodes_command_and_length_big_endian() {
        let bytes = encode_frame(&Frame::data(0x0102, b"abc").unwrap()).unwrap();
        assert_eq!(&bytes[0..2], &[0x03, 0x01], "DATA command code");
        assert_eq!(&bytes[2..4], &[0x00, 0x05], "payload length = id + 3 bytes");
        assert_eq!(bytes.len(), HEADER_SIZE + 5);
    }

    #[test]
    fn test_empty_payload_frame_is_header_only() {
        let bytes = encode_frame(&Frame::terminate()).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes, &[0x05, 0x0F, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let frame = Frame {
            command: Command::Data,
            payload: vec![0u8; MAX_PAYLOAD + 1],
        };
        assert_eq!(
            encode_frame(&frame),
            Err(ProtocolError::PayloadTooLarge {
                size: MAX_PAYLOAD + 1
            })
        );
    }

    // ── Reassembly across reads ───────────────────────────────────────────────

    #[test]
    fn test_feed_one_byte_at_a_time_reassembles_frame() {
        let frame = Frame::data(9, b"fragmented").unwrap();
        let bytes = encode_frame(&frame).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &bytes {
            frames.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_feed_header_split_across_reads() {
        let frame = Frame::connect(0x0BEE);
        let bytes = encode_frame(&frame).unwrap();

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&bytes[..3]).is_empty(), "3 of 4 header bytes");
        assert_eq!(decoder.feed(&bytes[3..]), vec![frame]);
    }

    #[test]
    fn test_feed_payload_spanning_three_reads() {
        let frame = Frame::data(1, &vec![0x11; 3000]).unwrap();
        let bytes = encode_frame(&frame).unwrap();

        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&bytes[..1000]).is_empty());
        assert!(decoder.feed(&bytes[1000..2000]).is_empty());
        assert_eq!(decoder.feed(&bytes[2000..]), vec![frame]);
    }

    #[test]
    fn test_feed_multiple_frames_in_one_chunk() {
        let frames = vec![
            Frame::connect(0),
            Frame::data(0, b"ping").unwrap(),
            Frame::disconnect(0),
            Frame::terminate(),
        ];
        let mut bytes = Vec::new();
        for frame in &frames {
            bytes.extend(encode_frame(frame).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&bytes), frames);
    }

    #[test]
    fn test_feed_chunk_ending_mid_second_frame() {
        let first = Frame::data(0, b"aaaa").unwrap();
        let second = Frame::data(1, b"bbbb").unwrap();
        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());

        // Split inside the second frame's payload.
        let split = bytes.len() - 2;
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&bytes[..split]), vec![first]);
        assert_eq!(decoder.feed(&bytes[split..]), vec![second]);
    }

    #[test]
    fn test_feed_zero_length_frame_followed_by_data_in_same_chunk() {
        let mut bytes = encode_frame(&Frame::terminate()).unwrap();
        let data = Frame::data(2, b"after").unwrap();
        bytes.extend(encode_frame(&data).unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&bytes);
        assert_eq!(frames, vec![Frame::terminate(), data]);
    }

    #[test]
    fn test_feed_empty_chunk_is_a_no_op() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&[]).is_empty());
    }

    // ── Unknown commands ──────────────────────────────────────────────────────

    #[test]
    fn test_unknown_command_is_skipped_without_losing_sync() {
        // A frame with a bogus command code, followed by a valid frame.
        let mut bytes = vec![0xAB, 0xCD, 0x00, 0x03, 0x01, 0x02, 0x03];
        let valid = Frame::data(5, b"ok").unwrap();
        bytes.extend(encode_frame(&valid).unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&bytes);
        assert_eq!(frames, vec![valid], "bogus frame dropped, sync preserved");
    }

    #[test]
    fn test_unknown_command_split_payload_still_consumed() {
        let mut decoder = FrameDecoder::new();
        // Bogus command declaring a 4-byte payload, delivered byte by byte.
        for byte in [0xFFu8, 0xFF, 0x00, 0x04, 0xDE, 0xAD, 0xBE] {
            assert!(decoder.feed(&[byte]).is_empty());
        }
        assert!(decoder.feed(&[0xEF]).is_empty(), "bogus frame completes silently");

        // The decoder is back at a frame boundary.
        let valid = Frame::connect(1);
        assert_eq!(decoder.feed(&encode_frame(&valid).unwrap()), vec![valid]);
    }
}
