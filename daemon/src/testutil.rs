//! Shared fixtures for the daemon's async tests: an in-memory gateway wired
//! exactly like production, with `tokio::io::duplex` standing in for meter
//! sockets.

use std::sync::Arc;

use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc::Receiver;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::connection::ConnectionHandle;
use crate::events::GatewayEvent;
use crate::manager::ConnectionManager;
use crate::server::{spawn_ingress_task, ServerContext};

use ivygate::heartbeat::HEARTBEAT_SIGNATURE;

pub struct Harness {
    pub ctx: Arc<ServerContext>,
    pub events: Receiver<GatewayEvent>,
    pub tracker: TaskTracker,
}

pub fn harness(config: Config) -> Harness {
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let manager = ConnectionManager::new(config.tcp.clone(), tx.clone());
    let ctx = ServerContext::new(manager, config, tx).unwrap();
    Harness {
        ctx,
        events: rx,
        tracker: TaskTracker::new(),
    }
}

/// Register a connection backed by an in-memory pipe and start its ingress
/// task. The returned stream is the meter's side of the socket.
pub fn attach_connection(harness: &Harness, port: u16) -> (ConnectionHandle, DuplexStream) {
    let (meter_side, gateway_side) = duplex(16 * 1024);
    let (read_half, write_half) = tokio::io::split(gateway_side);
    let conn = harness.ctx.manager.register(
        format!("10.0.0.1:{port}").parse().unwrap(),
        Box::new(write_half),
    );
    spawn_ingress_task(&harness.tracker, harness.ctx.clone(), conn.clone(), read_half);
    (conn, meter_side)
}

pub fn heartbeat_bytes(address: &str) -> Vec<u8> {
    let mut frame = HEARTBEAT_SIGNATURE.to_vec();
    frame.extend(address.as_bytes());
    frame.extend([0x00, 0x12, 0x34]);
    frame
}
