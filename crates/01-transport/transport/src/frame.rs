//! Length-prefixed framing shared by the stream and ring transports.
//!
//! Every message on the wire is `u32_le(length) || payload`. The decoder is a
//! two-phase state machine fed with arbitrarily fragmented chunks: it first
//! accumulates exactly four length bytes, then exactly `length` body bytes,
//! emits the body, and starts over.

use crate::{TransportError, TransportResult};
use std::io::{self, Write};

/// Size of the little-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest body [`FrameDecoder::new`] accepts.
pub const DEFAULT_MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Body bytes reserved up front; the rest is allocated as it arrives.
const INITIAL_BODY_CAPACITY: usize = 64 * 1024;

/// Encodes `payload` as one frame.
pub fn encode_frame(payload: &[u8]) -> TransportResult<Vec<u8>> {
    let len = frame_len(payload)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Writes one frame to `writer` with a single `write_all`.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let frame = encode_frame(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame)?;
    writer.flush()
}

fn frame_len(payload: &[u8]) -> TransportResult<u32> {
    u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })
}

#[derive(Debug)]
enum DecodeState {
    ReadingLength { buf: [u8; LENGTH_PREFIX_LEN], filled: usize },
    ReadingBody { body: Vec<u8>, len: usize },
}

impl DecodeState {
    fn start() -> Self {
        DecodeState::ReadingLength {
            buf: [0; LENGTH_PREFIX_LEN],
            filled: 0,
        }
    }
}

/// Incremental frame reassembler.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    max_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Decoder rejecting bodies over [`DEFAULT_MAX_FRAME_LEN`].
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Decoder that rejects frames longer than `max_len`.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            state: DecodeState::start(),
            max_len,
        }
    }

    /// True when the decoder sits on a frame boundary.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::ReadingLength { filled: 0, .. })
    }

    /// Feeds `chunk`, calling `on_frame` once per completed body in order.
    ///
    /// An oversized length is reported as an error and leaves the decoder
    /// unusable for the current stream.
    pub fn feed(
        &mut self,
        mut chunk: &[u8],
        mut on_frame: impl FnMut(Vec<u8>),
    ) -> TransportResult<()> {
        loop {
            match &mut self.state {
                DecodeState::ReadingLength { buf, filled } => {
                    if chunk.is_empty() {
                        return Ok(());
                    }
                    let take = (LENGTH_PREFIX_LEN - *filled).min(chunk.len());
                    buf[*filled..*filled + take].copy_from_slice(&chunk[..take]);
                    *filled += take;
                    chunk = &chunk[take..];
                    if *filled < LENGTH_PREFIX_LEN {
                        return Ok(());
                    }
                    let len = u32::from_le_bytes(*buf) as usize;
                    if len > self.max_len {
                        return Err(TransportError::FrameTooLarge {
                            len,
                            max: self.max_len,
                        });
                    }
                    self.state = DecodeState::ReadingBody {
                        body: Vec::with_capacity(len.min(INITIAL_BODY_CAPACITY)),
                        len,
                    };
                }
                DecodeState::ReadingBody { body, len } => {
                    let take = (*len - body.len()).min(chunk.len());
                    body.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if body.len() < *len {
                        return Ok(());
                    }
                    let body = std::mem::take(body);
                    self.state = DecodeState::start();
                    on_frame(body);
                }
            }
        }
    }

    /// Feeds `chunk` and collects the completed bodies.
    pub fn feed_collect(&mut self, chunk: &[u8]) -> TransportResult<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        self.feed(chunk, |frame| frames.push(frame))?;
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A frame delivered one byte at a time reassembles to the original payload.
    #[test]
    fn byte_at_a_time() {
        let frame = encode_frame(b"abcdef").expect("encode");
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for byte in &frame {
            decoder
                .feed(std::slice::from_ref(byte), |f| out.push(f))
                .expect("feed");
        }
        assert_eq!(out, vec![b"abcdef".to_vec()]);
        assert!(decoder.is_idle());
    }

    /// Several frames in one chunk come out in order, including empty bodies.
    #[test]
    fn coalesced_frames() {
        let mut wire = encode_frame(b"one").expect("encode");
        wire.extend(encode_frame(b"").expect("encode"));
        wire.extend(encode_frame(b"three").expect("encode"));
        let frames = FrameDecoder::new().feed_collect(&wire).expect("feed");
        assert_eq!(frames, vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]);
    }

    /// A chunk ending mid-prefix resumes correctly on the next chunk.
    #[test]
    fn split_inside_length_prefix() {
        let wire = encode_frame(&[7u8; 300]).expect("encode");
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed_collect(&wire[..2]).expect("feed").is_empty());
        assert!(!decoder.is_idle());
        let frames = decoder.feed_collect(&wire[2..]).expect("feed");
        assert_eq!(frames, vec![vec![7u8; 300]]);
    }

    /// Lengths above the configured limit are rejected.
    #[test]
    fn rejects_oversized_length() {
        let wire = encode_frame(&[0u8; 64]).expect("encode");
        let err = FrameDecoder::with_max_len(16)
            .feed_collect(&wire)
            .expect_err("oversized");
        assert!(matches!(err, TransportError::FrameTooLarge { len: 64, max: 16 }));
    }

    /// A header claiming a huge body neither passes the default limit nor
    /// reserves the claimed size.
    #[test]
    fn hostile_length_is_bounded() {
        let err = FrameDecoder::new()
            .feed_collect(&u32::MAX.to_le_bytes())
            .expect_err("over default limit");
        assert!(matches!(err, TransportError::FrameTooLarge { max: DEFAULT_MAX_FRAME_LEN, .. }));

        let mut decoder = FrameDecoder::new();
        let claimed = (DEFAULT_MAX_FRAME_LEN as u32).to_le_bytes();
        assert!(decoder.feed_collect(&claimed).expect("feed").is_empty());
        match &decoder.state {
            DecodeState::ReadingBody { body, len } => {
                assert_eq!(*len, DEFAULT_MAX_FRAME_LEN);
                assert!(body.capacity() <= INITIAL_BODY_CAPACITY);
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    /// `write_frame` emits the same bytes as `encode_frame`.
    #[test]
    fn write_frame_matches_encoding() {
        let mut sink = Vec::new();
        write_frame(&mut sink, b"payload").expect("write");
        assert_eq!(sink, encode_frame(b"payload").expect("encode"));
        assert_eq!(&sink[..4], &7u32.to_le_bytes());
    }

    #[cfg(feature = "proptest")]
    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Any split of a framed stream into chunks reconstructs every payload.
            #[test]
            fn reassembly_ignores_chunk_boundaries(
                payloads in proptest::collection::vec(
                    proptest::collection::vec(any::<u8>(), 0..512), 1..8),
                cuts in proptest::collection::vec(1usize..64, 1..256),
            ) {
                let mut wire = Vec::new();
                for payload in &payloads {
                    wire.extend(encode_frame(payload).unwrap());
                }

                let mut decoder = FrameDecoder::new();
                let mut out = Vec::new();
                let mut rest = wire.as_slice();
                let mut cut = cuts.iter().cycle();
                while !rest.is_empty() {
                    let take = (*cut.next().unwrap()).min(rest.len());
                    decoder.feed(&rest[..take], |f| out.push(f)).unwrap();
                    rest = &rest[take..];
                }

                prop_assert_eq!(out, payloads);
                prop_assert!(decoder.is_idle());
            }
        }
    }
}
