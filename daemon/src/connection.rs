//! One TCP connection's shared state: lifecycle, counters, the serialized
//! writer and the pending-request table that correlates commands and poll
//! requests with the frames and APDUs the ingress task decodes.

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use ivygate::dlms::apdu::Apdu;
use ivygate::dlt645::Frame;
use ivygate::router::ProtocolType;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    Connected,
    Identified,
    Active,
    Idle,
    Disconnecting,
    Disconnected,
}

/// How a response is matched back to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    /// DL/T 645 read/write, correlated by the echoed data identifier.
    DataId(u32),
    /// DL/T 645 commands whose response carries no data identifier
    /// (relay control, read-address), correlated by request control code.
    Control(u8),
    /// DLMS GET.
    InvokeId(u8),
    /// AARE.
    Association,
    /// RLRE.
    Release,
}

impl MatchKey {
    fn is_dlt645(&self) -> bool {
        matches!(self, MatchKey::DataId(_) | MatchKey::Control(_))
    }
}

/// What a resolved request hands back to the awaiting caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Dlt645(Frame),
    Dlms(Apdu),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendError {
    #[error("Meter not connected")]
    MeterNotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no matching response within {0:?}")]
    RequestTimeout(Duration),
    #[error("write did not drain within {0:?}")]
    BackpressureTimeout(Duration),
    #[error("pending request table is full ({0} entries)")]
    PendingOverflow(usize),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("association rejected by meter (result {0})")]
    AssociationRejected(u8),
    #[error("unexpected response shape")]
    UnexpectedResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub connected_at: DateTime<Utc>,
}

struct Meta {
    state: ConnState,
    meter_id: Option<String>,
    protocol: ProtocolType,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
    bytes_in: u64,
    bytes_out: u64,
    frames_in: u64,
    frames_out: u64,
    next_invoke_id: u8,
}

struct PendingRequest {
    key: MatchKey,
    tx: oneshot::Sender<ResponsePayload>,
}

pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    meta: StdMutex<Meta>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    /// FIFO; duplicate match keys resolve oldest-first.
    pending: StdMutex<Vec<PendingRequest>>,
    max_pending: usize,
    write_timeout: Duration,
    closed: CancellationToken,
}

pub type ConnectionHandle = Arc<Connection>;

impl Connection {
    pub fn new(
        id: ConnectionId,
        remote: SocketAddr,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        max_pending: usize,
        write_timeout: Duration,
    ) -> ConnectionHandle {
        Arc::new(Connection {
            id,
            remote,
            meta: StdMutex::new(Meta {
                state: ConnState::Connected,
                meter_id: None,
                protocol: ProtocolType::Unknown,
                connected_at: Utc::now(),
                last_activity: Instant::now(),
                bytes_in: 0,
                bytes_out: 0,
                frames_in: 0,
                frames_out: 0,
                next_invoke_id: 0,
            }),
            writer: Mutex::new(writer),
            pending: StdMutex::new(Vec::new()),
            max_pending,
            write_timeout,
            closed: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnState {
        self.meta.lock().unwrap().state
    }

    pub fn meter_id(&self) -> Option<String> {
        self.meta.lock().unwrap().meter_id.clone()
    }

    pub fn protocol(&self) -> ProtocolType {
        self.meta.lock().unwrap().protocol
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Token cancelled exactly once, when the connection starts closing.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        let meta = self.meta.lock().unwrap();
        ConnectionStats {
            bytes_in: meta.bytes_in,
            bytes_out: meta.bytes_out,
            frames_in: meta.frames_in,
            frames_out: meta.frames_out,
            connected_at: meta.connected_at,
        }
    }

    /// Protocol locks on first detection and never reverts.
    pub fn set_protocol(&self, protocol: ProtocolType) {
        let mut meta = self.meta.lock().unwrap();
        if meta.protocol == ProtocolType::Unknown {
            meta.protocol = protocol;
        } else if meta.protocol != protocol {
            warn!(
                "connection {} tried to re-detect protocol {} -> {}",
                self.id,
                meta.protocol.as_str(),
                protocol.as_str()
            );
        }
    }

    /// Bind the meter id; returns false when already bound (the id never
    /// changes afterwards).
    pub fn bind_meter_id(&self, meter_id: &str) -> bool {
        let mut meta = self.meta.lock().unwrap();
        match &meta.meter_id {
            Some(existing) => {
                if existing != meter_id {
                    warn!(
                        "connection {} already identified as {existing}, ignoring {meter_id}",
                        self.id
                    );
                }
                false
            }
            None => {
                meta.meter_id = Some(meter_id.to_string());
                if meta.state == ConnState::Connected {
                    meta.state = ConnState::Identified;
                }
                true
            }
        }
    }

    /// Record ingress bytes; any data wakes an idle connection.
    pub fn record_ingress(&self, bytes: usize) {
        let mut meta = self.meta.lock().unwrap();
        meta.bytes_in += bytes as u64;
        meta.last_activity = Instant::now();
        if matches!(meta.state, ConnState::Idle | ConnState::Identified) {
            meta.state = ConnState::Active;
        }
    }

    pub fn record_frame_in(&self) {
        self.meta.lock().unwrap().frames_in += 1;
    }

    pub fn idle_for(&self) -> Duration {
        self.meta.lock().unwrap().last_activity.elapsed()
    }

    /// Sweep transition `active -> idle`. Returns true when it applied.
    pub fn mark_idle(&self) -> bool {
        let mut meta = self.meta.lock().unwrap();
        if meta.state == ConnState::Active {
            meta.state = ConnState::Idle;
            true
        } else {
            false
        }
    }

    /// First half of teardown: flip state, cancel the token, reject every
    /// pending request. Idempotent.
    pub fn begin_close(&self) {
        {
            let mut meta = self.meta.lock().unwrap();
            if matches!(meta.state, ConnState::Disconnecting | ConnState::Disconnected) {
                return;
            }
            meta.state = ConnState::Disconnecting;
        }
        self.closed.cancel();
        self.fail_all_pending();
    }

    pub fn finish_close(&self) {
        self.meta.lock().unwrap().state = ConnState::Disconnected;
    }

    /// Serialized frame write with a drain deadline. Frames are never
    /// interleaved: the writer lock is held for the whole frame.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                let mut meta = self.meta.lock().unwrap();
                meta.bytes_out += bytes.len() as u64;
                meta.frames_out += 1;
                meta.last_activity = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => Err(SendError::Transport(e.to_string())),
            Err(_) => Err(SendError::BackpressureTimeout(self.write_timeout)),
        }
    }

    /// Enqueue a pending request before the matching bytes go out.
    pub fn register_pending(
        &self,
        key: MatchKey,
    ) -> Result<oneshot::Receiver<ResponsePayload>, SendError> {
        if self.is_closed() {
            return Err(SendError::ConnectionClosed);
        }
        let mut pending = self.pending.lock().unwrap();
        if pending.len() >= self.max_pending {
            return Err(SendError::PendingOverflow(self.max_pending));
        }
        let (tx, rx) = oneshot::channel();
        pending.push(PendingRequest { key, tx });
        Ok(rx)
    }

    /// Resolve the oldest pending request with this key. Returns false when
    /// nothing matched (a late or unsolicited response).
    pub fn resolve_pending(&self, key: MatchKey, payload: ResponsePayload) -> bool {
        let entry = {
            let mut pending = self.pending.lock().unwrap();
            pending
                .iter()
                .position(|request| request.key == key)
                .map(|index| pending.remove(index))
        };
        match entry {
            Some(request) => {
                if request.tx.send(payload).is_err() {
                    debug!("pending request for {key:?} was abandoned before resolution");
                }
                true
            }
            None => false,
        }
    }

    /// DL/T 645 error responses carry no data identifier: fail the oldest
    /// outstanding DL/T 645 request instead.
    pub fn resolve_oldest_dlt645(&self, payload: ResponsePayload) -> bool {
        let entry = {
            let mut pending = self.pending.lock().unwrap();
            pending
                .iter()
                .position(|request| request.key.is_dlt645())
                .map(|index| pending.remove(index))
        };
        match entry {
            Some(request) => {
                let _ = request.tx.send(payload);
                true
            }
            None => false,
        }
    }

    /// Drop the oldest entry for a key whose await timed out, so the table
    /// holds no stale entries (a late response is then logged and dropped).
    pub fn remove_pending(&self, key: MatchKey) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(index) = pending.iter().position(|request| request.key == key) {
            pending.remove(index);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn fail_all_pending(&self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain(..).collect()
        };
        // dropping the senders rejects every awaiting caller with
        // ConnectionClosed
        if !drained.is_empty() {
            debug!(
                "connection {}: rejecting {} pending requests on close",
                self.id,
                drained.len()
            );
        }
    }

    /// Allocate the next invoke-id, cycling 1..=255 and skipping ids that
    /// are still outstanding.
    pub fn alloc_invoke_id(&self) -> u8 {
        let pending = self.pending.lock().unwrap();
        let mut meta = self.meta.lock().unwrap();
        let mut candidate = meta.next_invoke_id;
        for _ in 0..=u8::MAX {
            candidate = ivygate::dlms::client::next_invoke_id(candidate);
            let in_flight = pending
                .iter()
                .any(|request| request.key == MatchKey::InvokeId(candidate));
            if !in_flight {
                meta.next_invoke_id = candidate;
                return candidate;
            }
        }
        // table is capped well below 255 ids, so this is unreachable
        meta.next_invoke_id = 1;
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> ConnectionHandle {
        let (_client, server) = tokio::io::duplex(1024);
        Connection::new(
            1,
            "127.0.0.1:5000".parse().unwrap(),
            Box::new(server),
            5,
            Duration::from_millis(200),
        )
    }

    fn frame_payload() -> ResponsePayload {
        ResponsePayload::Dlt645(Frame {
            address: "000012345678".to_string(),
            control: 0x91,
            payload: vec![],
        })
    }

    #[tokio::test]
    async fn test_pending_fifo_for_duplicate_keys() {
        let conn = test_connection();
        let rx1 = conn.register_pending(MatchKey::DataId(7)).unwrap();
        let rx2 = conn.register_pending(MatchKey::DataId(7)).unwrap();
        assert!(conn.resolve_pending(MatchKey::DataId(7), frame_payload()));
        // the first registration resolves first
        assert!(rx1.await.is_ok());
        assert!(conn.resolve_pending(MatchKey::DataId(7), frame_payload()));
        assert!(rx2.await.is_ok());
        assert!(!conn.resolve_pending(MatchKey::DataId(7), frame_payload()));
    }

    #[tokio::test]
    async fn test_pending_overflow() {
        let conn = test_connection();
        let _receivers: Vec<_> = (0..5)
            .map(|i| conn.register_pending(MatchKey::DataId(i)).unwrap())
            .collect();
        assert_eq!(
            conn.register_pending(MatchKey::DataId(99)).unwrap_err(),
            SendError::PendingOverflow(5)
        );
    }

    #[tokio::test]
    async fn test_close_rejects_pending() {
        let conn = test_connection();
        let rx = conn.register_pending(MatchKey::InvokeId(3)).unwrap();
        conn.begin_close();
        assert!(rx.await.is_err());
        assert_eq!(conn.state(), ConnState::Disconnecting);
        assert_eq!(conn.pending_len(), 0);
        assert_eq!(
            conn.register_pending(MatchKey::InvokeId(4)).unwrap_err(),
            SendError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_remove_pending_leaves_no_entry() {
        let conn = test_connection();
        let _rx = conn.register_pending(MatchKey::InvokeId(9)).unwrap();
        conn.remove_pending(MatchKey::InvokeId(9));
        assert_eq!(conn.pending_len(), 0);
        assert!(!conn.resolve_pending(
            MatchKey::InvokeId(9),
            ResponsePayload::Dlms(Apdu::Rlre { raw: vec![0x63, 0x00] })
        ));
    }

    #[tokio::test]
    async fn test_invoke_id_skips_outstanding() {
        let conn = test_connection();
        assert_eq!(conn.alloc_invoke_id(), 1);
        let _rx = conn.register_pending(MatchKey::InvokeId(2)).unwrap();
        assert_eq!(conn.alloc_invoke_id(), 3);
    }

    #[tokio::test]
    async fn test_meter_id_binds_once() {
        let conn = test_connection();
        assert!(conn.bind_meter_id("311501114070"));
        assert!(!conn.bind_meter_id("311501114070"));
        assert!(!conn.bind_meter_id("000000000001"));
        assert_eq!(conn.meter_id().unwrap(), "311501114070");
        assert_eq!(conn.state(), ConnState::Identified);
    }

    #[tokio::test]
    async fn test_send_updates_counters() {
        let (mut client, server) = tokio::io::duplex(1024);
        let conn = Connection::new(
            2,
            "127.0.0.1:5001".parse().unwrap(),
            Box::new(server),
            5,
            Duration::from_millis(200),
        );
        conn.send(&[1, 2, 3, 4]).await.unwrap();
        let stats = conn.stats();
        assert_eq!(stats.bytes_out, 4);
        assert_eq!(stats.frames_out, 1);
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_backpressure_times_out() {
        // a 16-byte duplex with no reader fills immediately
        let (_client, server) = tokio::io::duplex(16);
        let conn = Connection::new(
            3,
            "127.0.0.1:5002".parse().unwrap(),
            Box::new(server),
            5,
            Duration::from_millis(100),
        );
        let result = conn.send(&[0u8; 64]).await;
        assert_eq!(
            result.unwrap_err(),
            SendError::BackpressureTimeout(Duration::from_millis(100))
        );
    }
}
