//! DL/T 645-2007 frame layer: delimiters, declared-length handling, the
//! mod-256 checksum, and an incremental assembler that carves frames out of
//! a TCP stream and resynchronises on the next 0x68 after any damage.

use bytes::BytesMut;
use log::warn;
use thiserror::Error;

use crate::bcd;

pub const FRAME_START: u8 = 0x68;
pub const FRAME_END: u8 = 0x16;
/// Address(6) + two starts + control + length + checksum + end.
pub const MIN_FRAME_LEN: usize = 12;
/// Offset of the declared data length byte.
pub const LENGTH_OFFSET: usize = 9;

/// Control-code bits: responses set 0x80, error responses set 0xC0.
pub const RESPONSE_FLAG: u8 = 0x80;
pub const ERROR_FLAG: u8 = 0xc0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("bad start delimiter {0:#04x}")]
    BadStart(u8),
    #[error("bad second start delimiter {0:#04x}")]
    BadSecondStart(u8),
    #[error("bad end delimiter {0:#04x}")]
    BadEnd(u8),
    #[error("declared data length {declared} does not match frame length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("bad checksum (expected {expected:#04x}, got {got:#04x})")]
    BadChecksum { expected: u8, got: u8 },
}

/// Sum mod 256 over the given bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Append checksum and end delimiter to a partial frame.
pub fn append_checksum(frame: &mut Vec<u8>) {
    frame.push(checksum(frame));
    frame.push(FRAME_END);
}

/// Checksum law: the trailing `[cs, 0x16]` of a complete frame verifies.
pub fn verify_checksum(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    checksum(&frame[..frame.len() - 2]) == frame[frame.len() - 2]
}

/// One parsed frame. The payload keeps its wire form (+0x33 offset still
/// applied); the codec layer strips it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub address: String,
    pub control: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn data_length(&self) -> usize {
        self.payload.len()
    }

    /// Error responses set both top bits of the control code.
    pub fn is_error(&self) -> bool {
        self.control & ERROR_FLAG == ERROR_FLAG
    }

    pub fn is_response(&self) -> bool {
        self.control & RESPONSE_FLAG != 0
    }
}

/// Validate delimiters, declared length and checksum, in that order.
pub fn validate(bytes: &[u8]) -> Result<(), FrameError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort(bytes.len()));
    }
    if bytes[0] != FRAME_START {
        return Err(FrameError::BadStart(bytes[0]));
    }
    if bytes[7] != FRAME_START {
        return Err(FrameError::BadSecondStart(bytes[7]));
    }
    let last = bytes.len() - 1;
    if bytes[last] != FRAME_END {
        return Err(FrameError::BadEnd(bytes[last]));
    }
    let declared = bytes[LENGTH_OFFSET] as usize;
    if declared + MIN_FRAME_LEN != bytes.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    let expected = checksum(&bytes[..last - 1]);
    if expected != bytes[last - 1] {
        return Err(FrameError::BadChecksum {
            expected,
            got: bytes[last - 1],
        });
    }
    Ok(())
}

/// Parse one complete frame.
pub fn parse_frame(bytes: &[u8]) -> Result<Frame, FrameError> {
    validate(bytes)?;
    let mut address_bytes = [0u8; 6];
    address_bytes.copy_from_slice(&bytes[1..7]);
    let declared = bytes[LENGTH_OFFSET] as usize;
    Ok(Frame {
        address: bcd::buffer_to_address(&address_bytes),
        control: bytes[8],
        payload: bytes[10..10 + declared].to_vec(),
    })
}

/// Total frame length once the declared data length is visible, or `None`
/// while fewer than ten bytes are buffered.
pub fn declared_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() <= LENGTH_OFFSET {
        return None;
    }
    Some(buf[LENGTH_OFFSET] as usize + MIN_FRAME_LEN)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AssemblerStats {
    pub frames: u64,
    pub discarded_bytes: u64,
    pub bad_frames: u64,
}

/// Incremental frame assembler for one connection's stream.
#[derive(Default)]
pub struct FrameAssembler {
    buf: BytesMut,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes; complete valid frames come out in order. Malformed spans
    /// are dropped up to the next 0x68.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            // resync: drop leading garbage before the next start delimiter
            match self.buf.iter().position(|&b| b == FRAME_START) {
                Some(0) => {}
                Some(offset) => {
                    self.discard(offset);
                }
                None => {
                    self.discard(self.buf.len());
                    break;
                }
            }
            // cheap pre-check once the second delimiter is visible
            if self.buf.len() > 7 && self.buf[7] != FRAME_START {
                self.discard(1);
                continue;
            }
            let total = match declared_frame_len(&self.buf) {
                Some(total) => total,
                None => break,
            };
            if self.buf.len() < total {
                break;
            }
            match parse_frame(&self.buf[..total]) {
                Ok(frame) => {
                    let _ = self.buf.split_to(total);
                    self.stats.frames += 1;
                    out.push(frame);
                }
                Err(e) => {
                    warn!("dropping malformed DL/T 645 frame: {e}");
                    self.stats.bad_frames += 1;
                    self.discard(1);
                }
            }
        }
        out
    }

    fn discard(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        let _ = self.buf.split_to(count);
        self.stats.discarded_bytes += count as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_test_frame(address: &str, control: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![FRAME_START];
        frame.extend(crate::bcd::address_to_buffer(address).unwrap());
        frame.push(FRAME_START);
        frame.push(control);
        frame.push(payload.len() as u8);
        frame.extend(payload);
        append_checksum(&mut frame);
        frame
    }

    #[test]
    fn test_checksum_law() {
        // P4: verify(append(partial)) for a spread of partial lengths
        for len in [10usize, 16, 64, 210] {
            let mut partial: Vec<u8> = (0..len).map(|i| (i * 7) as u8).collect();
            append_checksum(&mut partial);
            assert!(verify_checksum(&partial), "length {len}");
        }
    }

    #[test]
    fn test_parse_round_trip() {
        let bytes = build_test_frame("000012345678", 0x91, &[0x33, 0x33, 0x33, 0x33]);
        let frame = parse_frame(&bytes).unwrap();
        assert_eq!(frame.address, "000012345678");
        assert_eq!(frame.control, 0x91);
        assert_eq!(frame.data_length(), 4);
        assert!(frame.is_response());
        assert!(!frame.is_error());
    }

    #[test]
    fn test_validation_order() {
        let good = build_test_frame("000000000001", 0x91, &[]);

        let mut bad = good.clone();
        bad[0] = 0x00;
        assert_eq!(validate(&bad), Err(FrameError::BadStart(0x00)));

        let mut bad = good.clone();
        bad[7] = 0x00;
        assert_eq!(validate(&bad), Err(FrameError::BadSecondStart(0x00)));

        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] = 0x17;
        assert_eq!(validate(&bad), Err(FrameError::BadEnd(0x17)));

        let mut bad = good.clone();
        bad[LENGTH_OFFSET] = 5;
        assert!(matches!(
            validate(&bad),
            Err(FrameError::LengthMismatch { declared: 5, .. })
        ));

        let mut bad = good.clone();
        let cs = bad.len() - 2;
        bad[cs] ^= 0xff;
        assert!(matches!(validate(&bad), Err(FrameError::BadChecksum { .. })));

        assert_eq!(validate(&good), Ok(()));
        assert_eq!(validate(&good[..8]), Err(FrameError::TooShort(8)));
    }

    #[test]
    fn test_error_control_code() {
        let bytes = build_test_frame("000000000001", 0xd1, &[0x35]);
        let frame = parse_frame(&bytes).unwrap();
        assert!(frame.is_error());
    }

    #[test]
    fn test_assembler_chunked() {
        let first = build_test_frame("000012345678", 0x91, &[0x44, 0x44]);
        let second = build_test_frame("000012345678", 0x93, &[]);
        let mut stream = first.clone();
        stream.extend(&second);
        for chunk_size in 1..=stream.len() {
            let mut assembler = FrameAssembler::default();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                frames.extend(assembler.push(chunk));
            }
            assert_eq!(frames.len(), 2, "chunk size {chunk_size}");
            assert_eq!(frames[0].control, 0x91);
            assert_eq!(frames[1].control, 0x93);
        }
    }

    #[test]
    fn test_assembler_resync_after_garbage() {
        let frame = build_test_frame("000012345678", 0x91, &[0x44]);
        let mut stream = vec![0x01, 0x02, 0x03];
        stream.extend(&frame);
        let mut assembler = FrameAssembler::default();
        let frames = assembler.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(assembler.stats().discarded_bytes, 3);
    }

    #[test]
    fn test_assembler_recovers_from_corrupt_frame() {
        let mut corrupt = build_test_frame("000012345678", 0x91, &[0x44]);
        let cs = corrupt.len() - 2;
        corrupt[cs] ^= 0x01;
        let good = build_test_frame("000012345678", 0x93, &[]);
        let mut stream = corrupt;
        stream.extend(&good);
        let mut assembler = FrameAssembler::default();
        let frames = assembler.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].control, 0x93);
        assert!(assembler.stats().bad_frames >= 1);
    }
}
