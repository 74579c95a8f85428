//! The connection registry: meter-id binding with duplicate eviction, the
//! send/await correlation entry points, the idle/timeout sweep and the
//! gateway-wide counters.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ivygate::router::ProtocolType;

use crate::config::TcpConfig;
use crate::connection::{
    ConnState, Connection, ConnectionHandle, ConnectionId, MatchKey, ResponsePayload, SendError,
};
use crate::events::{EventSender, GatewayEvent};

/// Counters surfaced through [`ConnectionManager::stats_snapshot`]. Nothing
/// retries silently: every retry and drop shows up here.
#[derive(Default)]
pub struct Counters {
    pub accepted: AtomicU64,
    pub evicted: AtomicU64,
    pub timed_out: AtomicU64,
    pub late_responses: AtomicU64,
    pub poll_cycles: AtomicU64,
    pub poll_errors: AtomicU64,
    pub poll_retries: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GatewayStats {
    pub connections: usize,
    pub identified_meters: usize,
    pub accepted: u64,
    pub evicted: u64,
    pub timed_out: u64,
    pub late_responses: u64,
    pub poll_cycles: u64,
    pub poll_errors: u64,
    pub poll_retries: u64,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    meters: HashMap<String, ConnectionId>,
}

pub struct ConnectionManager {
    registry: StdMutex<Registry>,
    next_id: AtomicU64,
    config: TcpConfig,
    events: EventSender,
    counters: Counters,
}

impl ConnectionManager {
    pub fn new(config: TcpConfig, events: EventSender) -> Arc<Self> {
        Arc::new(ConnectionManager {
            registry: StdMutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            config,
            events,
            counters: Counters::default(),
        })
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().unwrap().connections.len()
    }

    pub fn at_capacity(&self) -> bool {
        self.connection_count() >= self.config.max_connections
    }

    pub fn stats_snapshot(&self) -> GatewayStats {
        let (connections, identified_meters) = {
            let registry = self.registry.lock().unwrap();
            (registry.connections.len(), registry.meters.len())
        };
        GatewayStats {
            connections,
            identified_meters,
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            late_responses: self.counters.late_responses.load(Ordering::Relaxed),
            poll_cycles: self.counters.poll_cycles.load(Ordering::Relaxed),
            poll_errors: self.counters.poll_errors.load(Ordering::Relaxed),
            poll_retries: self.counters.poll_retries.load(Ordering::Relaxed),
        }
    }

    /// Create and register a connection for a freshly accepted socket.
    pub fn register(
        &self,
        remote: SocketAddr,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(
            id,
            remote,
            writer,
            self.config.max_pending_requests,
            self.config.write_timeout(),
        );
        self.registry
            .lock()
            .unwrap()
            .connections
            .insert(id, conn.clone());
        Counters::bump(&self.counters.accepted);
        debug!("connection {id} registered from {remote}");
        conn
    }

    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.registry.lock().unwrap().connections.get(&id).cloned()
    }

    pub fn connection_for_meter(&self, meter_id: &str) -> Option<ConnectionHandle> {
        let registry = self.registry.lock().unwrap();
        registry
            .meters
            .get(meter_id)
            .and_then(|id| registry.connections.get(id))
            .cloned()
    }

    pub fn all_connections(&self) -> Vec<ConnectionHandle> {
        self.registry
            .lock()
            .unwrap()
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Identified IVY/DLMS meters, the poller's working set.
    pub fn identified_dlms_meters(&self) -> Vec<(String, ConnectionHandle)> {
        let registry = self.registry.lock().unwrap();
        let mut meters: Vec<(String, ConnectionHandle)> = registry
            .meters
            .iter()
            .filter_map(|(meter_id, id)| {
                let conn = registry.connections.get(id)?;
                (conn.protocol() == ProtocolType::IvyDlms)
                    .then(|| (meter_id.clone(), conn.clone()))
            })
            .collect();
        meters.sort_by(|a, b| a.0.cmp(&b.0));
        meters
    }

    /// Bind a meter id to its connection. A duplicate claim evicts the
    /// earlier connection, fully, before this connection is marked
    /// identified. Emits `MeterConnected` once per connection.
    pub async fn identify(&self, conn: &ConnectionHandle, meter_id: &str) {
        let evicted = {
            let registry = self.registry.lock().unwrap();
            registry
                .meters
                .get(meter_id)
                .filter(|&&existing| existing != conn.id())
                .and_then(|id| registry.connections.get(id).cloned())
        };
        if let Some(older) = evicted {
            warn!(
                "meter {meter_id} reconnected on connection {}; evicting connection {}",
                conn.id(),
                older.id()
            );
            Counters::bump(&self.counters.evicted);
            self.close_connection(&older, "duplicate_meter").await;
        }
        let newly_bound = {
            let mut registry = self.registry.lock().unwrap();
            let newly_bound = conn.bind_meter_id(meter_id);
            if newly_bound {
                registry.meters.insert(meter_id.to_string(), conn.id());
            }
            newly_bound
        };
        if newly_bound {
            info!(
                "meter {meter_id} identified on connection {} ({})",
                conn.id(),
                conn.remote()
            );
            let _ = self
                .events
                .send(GatewayEvent::MeterConnected {
                    meter_id: meter_id.to_string(),
                    remote_address: conn.remote().to_string(),
                    protocol_type: conn.protocol(),
                })
                .await;
        }
    }

    /// Tear a connection down: reject its pending requests, unbind its
    /// meter and emit `MeterDisconnected` (identified connections only).
    pub async fn close_connection(&self, conn: &ConnectionHandle, reason: &str) {
        if conn.state() == ConnState::Disconnected {
            return;
        }
        conn.begin_close();
        let meter_id = {
            let mut registry = self.registry.lock().unwrap();
            registry.connections.remove(&conn.id());
            match conn.meter_id() {
                Some(meter_id) => {
                    // only unbind if this connection still owns the id; an
                    // evicting successor may already have taken it over
                    if registry.meters.get(&meter_id) == Some(&conn.id()) {
                        registry.meters.remove(&meter_id);
                    }
                    Some(meter_id)
                }
                None => None,
            }
        };
        conn.finish_close();
        info!(
            "connection {} ({}) closed: {reason}",
            conn.id(),
            conn.remote()
        );
        if let Some(meter_id) = meter_id {
            let _ = self
                .events
                .send(GatewayEvent::MeterDisconnected {
                    meter_id,
                    reason: reason.to_string(),
                    stats: conn.stats(),
                })
                .await;
        }
    }

    /// Fire-and-forget write to a meter's connection.
    pub async fn send_to_meter(&self, meter_id: &str, bytes: &[u8]) -> Result<(), SendError> {
        let conn = self
            .connection_for_meter(meter_id)
            .ok_or(SendError::MeterNotConnected)?;
        self.send_on(&conn, bytes).await
    }

    pub async fn send_on(&self, conn: &ConnectionHandle, bytes: &[u8]) -> Result<(), SendError> {
        match conn.send(bytes).await {
            Ok(()) => Ok(()),
            Err(e @ SendError::BackpressureTimeout(_)) | Err(e @ SendError::Transport(_)) => {
                self.close_connection(conn, "write failure").await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Write a request and wait for the response matching `key`. A timeout
    /// removes the pending entry so nothing stale stays behind.
    pub async fn send_and_await(
        &self,
        meter_id: &str,
        bytes: &[u8],
        key: MatchKey,
        timeout: Duration,
    ) -> Result<ResponsePayload, SendError> {
        let conn = self
            .connection_for_meter(meter_id)
            .ok_or(SendError::MeterNotConnected)?;
        self.send_and_await_on(&conn, bytes, key, timeout).await
    }

    pub async fn send_and_await_on(
        &self,
        conn: &ConnectionHandle,
        bytes: &[u8],
        key: MatchKey,
        timeout: Duration,
    ) -> Result<ResponsePayload, SendError> {
        let rx = conn.register_pending(key)?;
        if let Err(e) = self.send_on(conn, bytes).await {
            conn.remove_pending(key);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(SendError::ConnectionClosed),
            Err(_) => {
                conn.remove_pending(key);
                Err(SendError::RequestTimeout(timeout))
            }
        }
    }

    /// Close everything, e.g. at shutdown.
    pub async fn shutdown(&self) {
        let connections = self.all_connections();
        futures::future::join_all(
            connections
                .iter()
                .map(|conn| self.close_connection(conn, "shutdown")),
        )
        .await;
    }
}

/// Periodic idle/timeout sweep: `active -> idle` after two silent heartbeat
/// intervals, close after `connection_timeout`.
pub fn run_sweep_task(
    task_tracker: &TaskTracker,
    manager: Arc<ConnectionManager>,
    shutdown_token: CancellationToken,
) {
    let heartbeat_interval = manager.config.heartbeat_interval();
    let connection_timeout = manager.config.connection_timeout();
    task_tracker.spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                _ = ticker.tick() => {
                    for conn in manager.all_connections() {
                        let silent_for = conn.idle_for();
                        if silent_for >= connection_timeout {
                            Counters::bump(&manager.counters.timed_out);
                            manager.close_connection(&conn, "timeout").await;
                        } else if silent_for >= heartbeat_interval * 2 && conn.mark_idle() {
                            debug!("connection {} is idle", conn.id());
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    fn test_manager() -> (Arc<ConnectionManager>, Receiver<GatewayEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let manager = ConnectionManager::new(TcpConfig::default(), tx);
        (manager, rx)
    }

    fn register_test_conn(manager: &ConnectionManager) -> ConnectionHandle {
        let (_client, server) = tokio::io::duplex(4096);
        manager.register("127.0.0.1:6000".parse().unwrap(), Box::new(server))
    }

    #[tokio::test]
    async fn test_duplicate_meter_evicts_older() {
        let (manager, mut events) = test_manager();
        let first = register_test_conn(&manager);
        first.set_protocol(ProtocolType::IvyDlms);
        manager.identify(&first, "311501114070").await;
        let pending = first
            .register_pending(MatchKey::InvokeId(1))
            .expect("first connection accepts requests");

        let second = register_test_conn(&manager);
        second.set_protocol(ProtocolType::IvyDlms);
        manager.identify(&second, "311501114070").await;

        // P9: one live connection per meter id
        assert!(first.is_closed());
        assert_eq!(first.state(), ConnState::Disconnected);
        assert_eq!(
            manager.connection_for_meter("311501114070").unwrap().id(),
            second.id()
        );
        assert_eq!(manager.connection_count(), 1);
        // pending requests on the evicted connection reject
        assert!(pending.await.is_err());

        // the eviction is announced before B's binding
        let event = events.recv().await.unwrap();
        assert!(matches!(event, GatewayEvent::MeterConnected { .. }));
        let event = events.recv().await.unwrap();
        let GatewayEvent::MeterDisconnected { reason, .. } = event else {
            panic!("expected disconnect, got {event:?}");
        };
        assert_eq!(reason, "duplicate_meter");
        let event = events.recv().await.unwrap();
        assert!(matches!(event, GatewayEvent::MeterConnected { .. }));
        assert_eq!(manager.stats_snapshot().evicted, 1);
    }

    #[tokio::test]
    async fn test_send_and_await_resolves_by_match_key() {
        let (manager, _events) = test_manager();
        let conn = register_test_conn(&manager);
        manager.identify(&conn, "000012345678").await;

        let resolver = conn.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            resolver.resolve_pending(
                MatchKey::DataId(0x0001_0000),
                ResponsePayload::Dlt645(ivygate::dlt645::Frame {
                    address: "000012345678".to_string(),
                    control: 0x91,
                    payload: vec![],
                }),
            )
        });
        let payload = manager
            .send_and_await(
                "000012345678",
                &[0x68],
                MatchKey::DataId(0x0001_0000),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(payload, ResponsePayload::Dlt645(_)));
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_send_and_await_timeout_leaves_no_entry() {
        let (manager, _events) = test_manager();
        let conn = register_test_conn(&manager);
        manager.identify(&conn, "000012345678").await;

        let result = manager
            .send_and_await(
                "000012345678",
                &[0x68],
                MatchKey::DataId(5),
                Duration::from_millis(30),
            )
            .await;
        assert!(matches!(result, Err(SendError::RequestTimeout(_))));
        // P10: nothing left behind
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_meter_fails_fast() {
        let (manager, _events) = test_manager();
        let result = manager.send_to_meter("999999999990", &[0x68]).await;
        assert_eq!(result.unwrap_err(), SendError::MeterNotConnected);
    }

    #[tokio::test]
    async fn test_close_unbinds_meter() {
        let (manager, mut events) = test_manager();
        let conn = register_test_conn(&manager);
        manager.identify(&conn, "000012345678").await;
        let _ = events.recv().await;
        manager.close_connection(&conn, "peer closed").await;
        assert!(manager.connection_for_meter("000012345678").is_none());
        assert_eq!(manager.connection_count(), 0);
        let GatewayEvent::MeterDisconnected { meter_id, .. } = events.recv().await.unwrap() else {
            panic!("expected disconnect");
        };
        assert_eq!(meter_id, "000012345678");
    }

    #[tokio::test]
    async fn test_unidentified_close_emits_no_disconnect() {
        let (manager, mut events) = test_manager();
        let conn = register_test_conn(&manager);
        manager.close_connection(&conn, "peer closed").await;
        assert!(events.try_recv().is_err());
    }
}
