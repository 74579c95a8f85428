//! Per-connection protocol routing. A connection's protocol is detected
//! once, from its first bytes, and never re-detected; every subsequent byte
//! goes to the detected parser. Parsed IVY packets for the shared public
//! destination are routed by content (heartbeat vs DLMS APDU).

use log::{debug, warn};
use serde::Serialize;

use crate::dlms::apdu::{self, Apdu};
use crate::dlt645::frame::{Frame, FrameAssembler, FRAME_START};
use crate::heartbeat::{self, Heartbeat};
use crate::ivy::{
    IvyPacket, StreamParser, DESTINATION_LEGACY_DLMS, DESTINATION_PUBLIC, IVY_SIGNATURE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtocolType {
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "dlt645")]
    Dlt645,
    #[serde(rename = "ivy_dlms")]
    IvyDlms,
}

impl ProtocolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Unknown => "unknown",
            ProtocolType::Dlt645 => "dlt645",
            ProtocolType::IvyDlms => "ivy_dlms",
        }
    }
}

/// Everything the router can hand to the connection layer.
#[derive(Debug, PartialEq)]
pub enum RouterEvent {
    /// Fired exactly once per connection lifetime.
    ProtocolDetected(ProtocolType),
    Heartbeat(Heartbeat),
    Dlt645Frame(Frame),
    DlmsApdu {
        apdu: Apdu,
        destination: u16,
        raw_dlms: bool,
    },
}

pub struct ProtocolRouter {
    /// `None` until the first bytes decide; locked afterwards.
    detected: Option<ProtocolType>,
    detect_buf: Vec<u8>,
    ivy: StreamParser,
    dlt645: FrameAssembler,
    discarded_unknown: u64,
}

impl Default for ProtocolRouter {
    fn default() -> Self {
        Self::new(crate::ivy::DEFAULT_MAX_PAYLOAD)
    }
}

impl ProtocolRouter {
    pub fn new(max_ivy_payload: usize) -> Self {
        ProtocolRouter {
            detected: None,
            detect_buf: Vec::new(),
            ivy: StreamParser::new(max_ivy_payload),
            dlt645: FrameAssembler::default(),
            discarded_unknown: 0,
        }
    }

    /// Protocol as currently known.
    pub fn protocol(&self) -> ProtocolType {
        self.detected.unwrap_or(ProtocolType::Unknown)
    }

    /// Bytes dropped on a connection that never identified its protocol.
    pub fn discarded_unknown(&self) -> u64 {
        self.discarded_unknown
    }

    /// Feed received bytes, collecting routing events.
    pub fn push(&mut self, data: &[u8]) -> Vec<RouterEvent> {
        let mut events = Vec::new();
        match self.detected {
            None => {
                self.detect_buf.extend_from_slice(data);
                if let Some(protocol) = detect(&self.detect_buf) {
                    self.detected = Some(protocol);
                    events.push(RouterEvent::ProtocolDetected(protocol));
                    let buffered = std::mem::take(&mut self.detect_buf);
                    self.dispatch(&buffered, &mut events);
                }
            }
            Some(_) => self.dispatch(data, &mut events),
        }
        events
    }

    fn dispatch(&mut self, data: &[u8], events: &mut Vec<RouterEvent>) {
        match self.detected {
            Some(ProtocolType::Dlt645) => {
                for frame in self.dlt645.push(data) {
                    events.push(RouterEvent::Dlt645Frame(frame));
                }
            }
            Some(ProtocolType::IvyDlms) => {
                for packet in self.ivy.push(data) {
                    self.route_packet(packet, events);
                }
            }
            Some(ProtocolType::Unknown) => {
                self.discarded_unknown += data.len() as u64;
                if self.discarded_unknown == data.len() as u64 {
                    warn!(
                        "connection speaks no known protocol (first byte {:#04x}); discarding",
                        data.first().copied().unwrap_or_default()
                    );
                }
            }
            None => unreachable!("dispatch is only called after detection"),
        }
    }

    fn route_packet(&mut self, packet: IvyPacket, events: &mut Vec<RouterEvent>) {
        if packet.destination == DESTINATION_PUBLIC && !packet.raw_dlms {
            // shared destination: heartbeat or DLMS, told apart by content
            if heartbeat::payload_is_heartbeat(&packet.payload) {
                match heartbeat::parse_payload(&packet.payload) {
                    Ok(heartbeat) => events.push(RouterEvent::Heartbeat(heartbeat)),
                    Err(e) => warn!("unparseable heartbeat: {e}"),
                }
                return;
            }
            if !packet.payload.first().copied().is_some_and(apdu::is_apdu_tag) {
                warn!(
                    "packet for destination {:#06x} is neither heartbeat nor DLMS (first byte {:?})",
                    packet.destination,
                    packet.payload.first()
                );
                return;
            }
        }
        if packet.destination != DESTINATION_PUBLIC && packet.destination < DESTINATION_LEGACY_DLMS
        {
            debug!(
                "packet for destination {:#06x} outside the known ranges; trying DLMS",
                packet.destination
            );
        }
        match apdu::parse_apdu(&packet.payload) {
            Ok(parsed) => events.push(RouterEvent::DlmsApdu {
                apdu: parsed,
                destination: packet.destination,
                raw_dlms: packet.raw_dlms,
            }),
            // a bad APDU costs only itself; the stream goes on
            Err(e) => warn!(
                "dropping unparseable APDU for destination {:#06x}: {e}",
                packet.destination
            ),
        }
    }
}

/// First-bytes protocol detection. `None` means "not enough bytes yet"
/// (only possible while the data could still become the IVY signature).
fn detect(buf: &[u8]) -> Option<ProtocolType> {
    let first = *buf.first()?;
    if first == FRAME_START {
        return Some(ProtocolType::Dlt645);
    }
    if apdu::is_apdu_tag(first) {
        return Some(ProtocolType::IvyDlms);
    }
    if IVY_SIGNATURE.starts_with(&buf[..buf.len().min(4)]) {
        if buf.len() < 4 {
            return None;
        }
        return Some(ProtocolType::IvyDlms);
    }
    debug!("unrecognised first byte {first:#04x}");
    Some(ProtocolType::Unknown)
}
