use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;
pub const FRAME_HEADER_BYTES: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("stream ended inside a frame: expected {expected} bytes, got {received}")]
    Truncated { expected: usize, received: usize },
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

/// Prefixes `payload` with its u32 big-endian length.
pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_frame_bytes || payload.len() > u32::MAX as usize {
        return Err(FrameError::OversizedFrame {
            size: payload.len(),
            max: max_frame_bytes,
        });
    }
    let mut framed = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Incremental splitter for length-prefixed byte streams.
///
/// An oversized length header leaves no way to find the next frame
/// boundary, so the decoder poisons itself and drops all further input.
pub struct LengthPrefixedDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    poisoned: bool,
}

impl LengthPrefixedDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            poisoned: false,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<Vec<u8>> {
        let mut report = DecodeReport::default();
        if self.poisoned {
            return report;
        }
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while self.pending.len() >= FRAME_HEADER_BYTES {
            let mut header = [0u8; FRAME_HEADER_BYTES];
            header.copy_from_slice(&self.pending[..FRAME_HEADER_BYTES]);
            let size = u32::from_be_bytes(header) as usize;
            if size > self.max_frame_bytes {
                report.push_error(FrameError::OversizedFrame {
                    size,
                    max: self.max_frame_bytes,
                });
                self.poisoned = true;
                self.pending.clear();
                break;
            }
            if self.pending.len() < FRAME_HEADER_BYTES + size {
                break;
            }
            let frame = self.pending[FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + size].to_vec();
            self.pending.drain(..FRAME_HEADER_BYTES + size);
            report.push_frame(frame);
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<Vec<u8>> {
        let mut report = DecodeReport::default();
        if self.pending.is_empty() || self.poisoned {
            return report;
        }
        let leftover = std::mem::take(&mut self.pending);
        let expected = if leftover.len() >= FRAME_HEADER_BYTES {
            let mut header = [0u8; FRAME_HEADER_BYTES];
            header.copy_from_slice(&leftover[..FRAME_HEADER_BYTES]);
            FRAME_HEADER_BYTES + u32::from_be_bytes(header) as usize
        } else {
            FRAME_HEADER_BYTES
        };
        report.push_error(FrameError::Truncated {
            expected,
            received: leftover.len(),
        });
        report
    }
}

impl Default for LengthPrefixedDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_split_across_chunks_are_reassembled() {
        let a = encode_frame(b"alpha", DEFAULT_MAX_FRAME_BYTES).expect("encode a");
        let b = encode_frame(b"bravo!", DEFAULT_MAX_FRAME_BYTES).expect("encode b");
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut decoder = LengthPrefixedDecoder::default();
        let first = decoder.push_chunk(&stream[..3]);
        assert!(first.frames.is_empty());
        let second = decoder.push_chunk(&stream[3..a.len() + 2]);
        assert_eq!(second.frames, vec![b"alpha".to_vec()]);
        let third = decoder.push_chunk(&stream[a.len() + 2..]);
        assert_eq!(third.frames, vec![b"bravo!".to_vec()]);
        assert!(decoder.finish().errors.is_empty());
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let result = encode_frame(&[0u8; 128], 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { size: 128, max: 64 })));
    }

    #[test]
    fn oversized_header_poisons_decoder() {
        let mut stream = (10_000u32).to_be_bytes().to_vec();
        stream.extend_from_slice(&[0u8; 32]);
        let mut decoder = LengthPrefixedDecoder::new(1_024);
        let report = decoder.push_chunk(&stream);
        assert!(report.frames.is_empty());
        assert_eq!(
            report.errors,
            vec![FrameError::OversizedFrame {
                size: 10_000,
                max: 1_024
            }]
        );
        assert!(decoder.is_poisoned());

        let valid = encode_frame(b"ok", 1_024).expect("encode");
        assert!(decoder.push_chunk(&valid).frames.is_empty());
    }

    #[test]
    fn finish_reports_partial_frame() {
        let framed = encode_frame(b"partial", DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let mut decoder = LengthPrefixedDecoder::default();
        decoder.push_chunk(&framed[..6]);
        let report = decoder.finish();
        assert_eq!(
            report.errors,
            vec![FrameError::Truncated {
                expected: 11,
                received: 6
            }]
        );
    }

    #[test]
    fn empty_payload_is_a_valid_frame() {
        let framed = encode_frame(&[], DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let mut decoder = LengthPrefixedDecoder::default();
        let report = decoder.push_chunk(&framed);
        assert_eq!(report.frames, vec![Vec::<u8>::new()]);
    }
}
