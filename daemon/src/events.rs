//! Events the gateway publishes. The embedded broker lives outside this
//! process boundary; it consumes the channel handed out by [`EventService`].
//! When nothing else claims the receiver, the default worker serialises each
//! event as one JSON line on the gateway log.

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ivygate::router::ProtocolType;
use ivygate::telemetry::{ReadingValue, TelemetrySource};

use crate::connection::ConnectionStats;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterRef {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    MeterConnected {
        meter_id: String,
        remote_address: String,
        protocol_type: ProtocolType,
    },
    MeterDisconnected {
        meter_id: String,
        reason: String,
        stats: ConnectionStats,
    },
    TelemetryReceived {
        meter_id: String,
        source: TelemetrySource,
        register: RegisterRef,
        value: ReadingValue,
        raw_value: ReadingValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        unit: Option<&'static str>,
        timestamp: DateTime<Utc>,
    },
    ErrorResponse {
        meter_id: String,
        error_code: u8,
        error_message: String,
    },
    DlmsEvent {
        meter_id: String,
        event_type: String,
        data: serde_json::Value,
    },
    DlmsError {
        meter_id: String,
        invoke_id: u8,
        error_code: u8,
        error_name: &'static str,
    },
}

pub type EventSender = Sender<GatewayEvent>;

pub struct EventService {
    tx: EventSender,
    rx: Receiver<GatewayEvent>,
}

impl EventService {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(256);
        EventService { tx, rx }
    }

    pub fn new_handler(&self) -> EventSender {
        self.tx.clone()
    }
}

impl Default for EventService {
    fn default() -> Self {
        Self::new()
    }
}

/// Default consumer: one JSON line per event at info level. An external
/// publisher replaces this by taking the service's receiver instead.
pub fn run_event_log_worker(
    task_tracker: &TaskTracker,
    mut service: EventService,
    shutdown_token: CancellationToken,
) {
    task_tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                event = service.rx.recv() => {
                    let Some(event) = event else { break };
                    match serde_json::to_string(&event) {
                        Ok(line) => info!(target: "ivygate::events", "{line}"),
                        Err(e) => error!("unserialisable event: {e}"),
                    }
                }
            }
        }
    });
}
