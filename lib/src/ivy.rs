//! The IVY wrapper is the vendor's 8-byte envelope for carrying DLMS over
//! TCP. Streams from the field mix three shapes: wrapped packets, the
//! 26-byte heartbeat (itself a well-formed IVY packet), and bare DLMS APDUs
//! with no wrapper at all, which have to be framed by computing each APDU's
//! length from its leading tag.

use bytes::{Buf, BytesMut};
use deku::prelude::*;
use log::{debug, warn};
use thiserror::Error;

use crate::dlms::apdu;

/// First four bytes of every wrapped packet: version 0x0001, source 0x0001.
/// All four bytes must match; raw DLMS payloads contain `00 01` incidentally.
pub const IVY_SIGNATURE: [u8; 4] = [0x00, 0x01, 0x00, 0x01];

pub const IVY_HEADER_LEN: usize = 8;

/// Destination shared by heartbeats and the DLMS public client.
pub const DESTINATION_PUBLIC: u16 = 0x0001;

/// Lowest destination of the legacy DLMS paths.
pub const DESTINATION_LEGACY_DLMS: u16 = 0x0010;

/// Wrapped payloads above this are treated as framing corruption.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct IvyHeader {
    pub version: u16,
    pub source: u16,
    pub destination: u16,
    pub payload_len: u16,
}

/// One reassembled packet. `raw_dlms` marks APDUs that arrived without a
/// wrapper and received a synthesised public-client header.
#[derive(Debug, Clone, PartialEq)]
pub struct IvyPacket {
    pub destination: u16,
    pub raw_dlms: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IvyError {
    #[error("declared payload length {0} exceeds cap {1}")]
    PayloadTooLarge(usize, usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamStats {
    pub packets: u64,
    pub raw_packets: u64,
    pub discarded_bytes: u64,
    pub resyncs: u64,
}

/// Incremental parser over one connection's byte stream. Push bytes in any
/// chunking; complete packets come out in arrival order. Malformed input
/// only ever costs the bytes up to the next recognisable boundary.
pub struct StreamParser {
    buf: BytesMut,
    max_payload: usize,
    stats: StreamStats,
    discard_run: u64,
}

enum Step {
    Packet(IvyPacket),
    NeedMore,
    Continue,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl StreamParser {
    pub fn new(max_payload: usize) -> Self {
        StreamParser {
            buf: BytesMut::new(),
            max_payload,
            stats: StreamStats::default(),
            discard_run: 0,
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Bytes buffered awaiting completion.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes, returning every packet completed by them.
    pub fn push(&mut self, data: &[u8]) -> Vec<IvyPacket> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            match self.step() {
                Step::Packet(packet) => {
                    self.discard_run = 0;
                    out.push(packet);
                }
                Step::Continue => {}
                Step::NeedMore => break,
            }
        }
        out
    }

    fn step(&mut self) -> Step {
        if self.buf.is_empty() {
            return Step::NeedMore;
        }
        // a short buffer beginning like the signature cannot be classified yet
        if self.buf.len() < IVY_SIGNATURE.len() && IVY_SIGNATURE.starts_with(&self.buf) {
            return Step::NeedMore;
        }
        if self.buf.len() >= IVY_SIGNATURE.len() && self.buf[..4] == IVY_SIGNATURE {
            return self.step_wrapped();
        }
        if apdu::is_apdu_tag(self.buf[0]) {
            return self.step_raw_apdu();
        }
        self.discard(1, "unknown leading byte");
        Step::Continue
    }

    fn step_wrapped(&mut self) -> Step {
        if self.buf.len() < IVY_HEADER_LEN {
            return Step::NeedMore;
        }
        let (_, header) = IvyHeader::from_bytes((&self.buf[..IVY_HEADER_LEN], 0))
            .expect("eight header bytes always parse");
        let destination = header.destination;
        let payload_len = header.payload_len as usize;
        if payload_len > self.max_payload {
            warn!(
                "{}",
                IvyError::PayloadTooLarge(payload_len, self.max_payload)
            );
            self.resync();
            return Step::Continue;
        }
        let total = IVY_HEADER_LEN + payload_len;
        if self.buf.len() < total {
            return Step::NeedMore;
        }
        let mut frame = self.buf.split_to(total);
        frame.advance(IVY_HEADER_LEN);
        self.stats.packets += 1;
        Step::Packet(IvyPacket {
            destination,
            raw_dlms: false,
            payload: frame.to_vec(),
        })
    }

    fn step_raw_apdu(&mut self) -> Step {
        match apdu::apdu_length(&self.buf) {
            Ok(Some(len)) => {
                if self.buf.len() < len {
                    return Step::NeedMore;
                }
                let frame = self.buf.split_to(len);
                self.stats.packets += 1;
                self.stats.raw_packets += 1;
                Step::Packet(IvyPacket {
                    destination: DESTINATION_PUBLIC,
                    raw_dlms: true,
                    payload: frame.to_vec(),
                })
            }
            Ok(None) => Step::NeedMore,
            Err(e) => {
                debug!("cannot frame APDU at stream head: {e}");
                self.discard(1, "unframeable APDU tag");
                Step::Continue
            }
        }
    }

    /// Drop everything up to the next 4-byte signature (or nearly the whole
    /// buffer when none is in sight).
    fn resync(&mut self) {
        let next = self.buf[1..]
            .windows(IVY_SIGNATURE.len())
            .position(|window| window == IVY_SIGNATURE)
            .map(|offset| offset + 1);
        // keep a partial-signature tail so a boundary-split signature survives
        let drop = next.unwrap_or_else(|| self.buf.len().saturating_sub(IVY_SIGNATURE.len() - 1));
        let dropped = self.buf.split_to(drop);
        self.stats.resyncs += 1;
        self.stats.discarded_bytes += dropped.len() as u64;
        let preview: String = dropped
            .iter()
            .take(16)
            .map(|b| format!("{b:02x} "))
            .collect();
        warn!(
            "resynchronising stream: discarded {} bytes [{}]",
            dropped.len(),
            preview.trim_end()
        );
    }

    fn discard(&mut self, count: usize, reason: &str) {
        let dropped = self.buf.split_to(count);
        self.stats.discarded_bytes += dropped.len() as u64;
        self.discard_run += dropped.len() as u64;
        // rate-limit: long garbage runs produce one warning per 64 bytes
        if self.discard_run == 1 || self.discard_run % 64 == 0 {
            warn!(
                "discarding stream byte {:#04x} ({reason}, {} dropped in this run)",
                dropped[0], self.discard_run
            );
        }
    }
}

/// Wrap a payload for transmission to a meter.
pub fn wrap(destination: u16, payload: &[u8]) -> Vec<u8> {
    let header = IvyHeader {
        version: 0x0001,
        source: 0x0001,
        destination,
        payload_len: payload.len() as u16,
    };
    let mut out = header.to_bytes().expect("fixed-layout header always serialises");
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrapped(destination: u16, payload: &[u8]) -> Vec<u8> {
        wrap(destination, payload)
    }

    #[test]
    fn test_single_packet() {
        let mut parser = StreamParser::default();
        let packets = parser.push(&wrapped(0x0010, &[0xc4, 0x01, 0x05, 0x01, 0x04]));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].destination, 0x0010);
        assert!(!packets[0].raw_dlms);
        assert_eq!(packets[0].payload, [0xc4, 0x01, 0x05, 0x01, 0x04]);
    }

    #[test]
    fn test_chunked_reassembly() {
        // P7: any chunking yields the same packets in order
        let mut stream = Vec::new();
        stream.extend(wrapped(0x0001, &[0xd8, 0x01, 0x02]));
        stream.extend(wrapped(0x0010, &[0xc4, 0x01, 0x07, 0x01, 0x0b]));
        for chunk_size in 1..stream.len() {
            let mut parser = StreamParser::default();
            let mut packets = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                packets.extend(parser.push(chunk));
            }
            assert_eq!(packets.len(), 2, "chunk size {chunk_size}");
            assert_eq!(packets[0].payload, [0xd8, 0x01, 0x02]);
            assert_eq!(packets[1].payload, [0xc4, 0x01, 0x07, 0x01, 0x0b]);
        }
    }

    #[test]
    fn test_raw_apdu_framing() {
        // P8: concatenated bare APDUs split exactly, irrespective of chunking
        let first = [
            0xc2, 0x00, 0x03, 0x01, 0x00, 0x20, 0x07, 0x00, 0xff, 0x02, 0x12, 0x00, 0xe6,
        ];
        let second = [
            0xc2, 0x00, 0x03, 0x01, 0x00, 0x1f, 0x07, 0x00, 0xff, 0x02, 0x12, 0x00, 0x0a,
        ];
        let mut stream = first.to_vec();
        stream.extend(second);
        for chunk_size in 1..=stream.len() {
            let mut parser = StreamParser::default();
            let mut packets = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                packets.extend(parser.push(chunk));
            }
            assert_eq!(packets.len(), 2, "chunk size {chunk_size}");
            assert_eq!(packets[0].payload, first);
            assert!(packets[0].raw_dlms);
            assert_eq!(packets[0].destination, DESTINATION_PUBLIC);
            assert_eq!(packets[1].payload, second);
        }
    }

    #[test]
    fn test_mixed_wrapped_and_raw() {
        let mut parser = StreamParser::default();
        let mut stream = wrapped(0x0001, &[0xc4, 0x01, 0x01, 0x00, 0x12, 0x05, 0xdc]);
        stream.extend([0x62, 0x03, 0x80, 0x01, 0x00]);
        let packets = parser.push(&stream);
        assert_eq!(packets.len(), 2);
        assert!(!packets[0].raw_dlms);
        assert!(packets[1].raw_dlms);
        assert_eq!(packets[1].payload, [0x62, 0x03, 0x80, 0x01, 0x00]);
    }

    #[test]
    fn test_oversize_payload_resyncs() {
        let mut parser = StreamParser::new(64);
        let mut stream = vec![0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0xff, 0xff];
        stream.extend([0xaa; 8]);
        let good = wrapped(0x0001, &[0xd8, 0x01, 0x02]);
        stream.extend(&good);
        let packets = parser.push(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload, [0xd8, 0x01, 0x02]);
        assert!(parser.stats().resyncs >= 1);
        assert!(parser.stats().discarded_bytes >= 8);
    }

    #[test]
    fn test_garbage_discarded_byte_by_byte() {
        let mut parser = StreamParser::default();
        let mut stream = vec![0x55, 0x99, 0x42];
        stream.extend(wrapped(0x0010, &[0xc4, 0x01, 0x09, 0x01, 0x02]));
        let packets = parser.push(&stream);
        assert_eq!(packets.len(), 1);
        assert_eq!(parser.stats().discarded_bytes, 3);
    }

    #[test]
    fn test_underrun_keeps_state() {
        let mut parser = StreamParser::default();
        let full = wrapped(0x0010, &[0xc4, 0x01, 0x05, 0x01, 0x04]);
        assert!(parser.push(&full[..7]).is_empty());
        assert_eq!(parser.pending(), 7);
        let packets = parser.push(&full[7..]);
        assert_eq!(packets.len(), 1);
        assert_eq!(parser.pending(), 0);
    }

    #[test]
    fn test_heartbeat_is_a_wrapped_packet() {
        let mut heartbeat = vec![
            0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x12, 0x0a, 0x02, 0x0c,
        ];
        heartbeat.extend(b"311501114070");
        heartbeat.extend([0x00, 0x12, 0x34]);
        assert_eq!(heartbeat.len(), 26);
        let mut parser = StreamParser::default();
        let packets = parser.push(&heartbeat);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].destination, DESTINATION_PUBLIC);
        assert_eq!(packets[0].payload.len(), 18);
        assert_eq!(&packets[0].payload[..3], &[0x0a, 0x02, 0x0c]);
    }
}
