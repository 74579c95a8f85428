//! TCP front door: the accept loop, one ingress task per connection, and
//! the normalisation of router events into gateway events and pending
//! request resolutions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ivygate::bcd;
use ivygate::dlms::apdu::{self, Apdu, GetResult};
use ivygate::dlms::obis;
use ivygate::dlt645::codec::{self, control};
use ivygate::dlt645::registers;
use ivygate::dlt645::Frame;
use ivygate::heartbeat::Heartbeat;
use ivygate::router::{ProtocolRouter, RouterEvent};
use ivygate::telemetry::{DlmsTelemetry, TelemetrySource};

use crate::config::{Config, ZeroAddressAction};
use crate::connection::{ConnectionHandle, MatchKey, ResponsePayload};
use crate::error::GatewayError;
use crate::events::{EventSender, GatewayEvent, RegisterRef};
use crate::manager::{ConnectionManager, Counters};

pub struct ServerContext {
    pub manager: Arc<ConnectionManager>,
    pub config: Config,
    pub events: EventSender,
    heartbeat_ack: Vec<u8>,
}

impl ServerContext {
    pub fn new(
        manager: Arc<ConnectionManager>,
        config: Config,
        events: EventSender,
    ) -> Result<Arc<Self>, GatewayError> {
        let heartbeat_ack = if config.heartbeat.ack_enabled {
            config.heartbeat.ack_payload_bytes()?
        } else {
            Vec::new()
        };
        Ok(Arc::new(ServerContext {
            manager,
            config,
            events,
            heartbeat_ack,
        }))
    }
}

/// Bind the listener and start the accept loop.
pub async fn run_tcp_server(
    task_tracker: &TaskTracker,
    ctx: Arc<ServerContext>,
    shutdown_token: CancellationToken,
) -> Result<(), GatewayError> {
    let addr = format!("{}:{}", ctx.config.tcp.host, ctx.config.tcp.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("listening for meters on {addr}");
    let tracker = task_tracker.clone();
    task_tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    info!("accept loop stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, remote)) => {
                        if ctx.manager.at_capacity() {
                            warn!("connection limit reached, refusing {remote}");
                            continue;
                        }
                        let _ = socket.set_nodelay(true);
                        let (read_half, write_half) = socket.into_split();
                        let conn = ctx.manager.register(remote, Box::new(write_half));
                        spawn_ingress_task(&tracker, ctx.clone(), conn, read_half);
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    });
    Ok(())
}

/// Single consumer of one connection's bytes: reads, demultiplexes, and
/// turns router events into gateway events and request resolutions.
pub fn spawn_ingress_task<R>(
    task_tracker: &TaskTracker,
    ctx: Arc<ServerContext>,
    conn: ConnectionHandle,
    mut reader: R,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    task_tracker.spawn(async move {
        let mut router = ProtocolRouter::new(ctx.config.tcp.max_ivy_payload);
        let closed = conn.closed_token();
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        ctx.manager.close_connection(&conn, "peer closed").await;
                        break;
                    }
                    Ok(n) => {
                        conn.record_ingress(n);
                        for event in router.push(&buf[..n]) {
                            handle_router_event(&ctx, &conn, event).await;
                        }
                    }
                    Err(e) => {
                        debug!("read error on connection {}: {e}", conn.id());
                        ctx.manager.close_connection(&conn, "read error").await;
                        break;
                    }
                }
            }
        }
    });
}

async fn handle_router_event(ctx: &ServerContext, conn: &ConnectionHandle, event: RouterEvent) {
    match event {
        RouterEvent::ProtocolDetected(protocol) => {
            conn.set_protocol(protocol);
            info!("connection {} speaks {}", conn.id(), protocol.as_str());
        }
        RouterEvent::Heartbeat(heartbeat) => handle_heartbeat(ctx, conn, heartbeat).await,
        RouterEvent::Dlt645Frame(frame) => handle_dlt645_frame(ctx, conn, frame).await,
        RouterEvent::DlmsApdu { apdu, .. } => handle_dlms_apdu(ctx, conn, apdu).await,
    }
}

async fn handle_heartbeat(ctx: &ServerContext, conn: &ConnectionHandle, heartbeat: Heartbeat) {
    conn.record_frame_in();
    let meter_id = if heartbeat.is_zero_address()
        && ctx.config.heartbeat.zero_address_action == ZeroAddressAction::UseIp
    {
        format!("auto_{}_{}", conn.remote().ip(), conn.remote().port())
    } else {
        heartbeat.address.clone()
    };
    ctx.manager.identify(conn, &meter_id).await;
    if !ctx.heartbeat_ack.is_empty() {
        if let Err(e) = conn.send(&ctx.heartbeat_ack).await {
            warn!("heartbeat ack failed on connection {}: {e}", conn.id());
        }
    }
}

async fn handle_dlt645_frame(ctx: &ServerContext, conn: &ConnectionHandle, frame: Frame) {
    conn.record_frame_in();
    // the first frame's source address identifies a DL/T 645 meter
    if conn.meter_id().is_none() && frame.address.bytes().all(|b| b.is_ascii_digit()) {
        ctx.manager.identify(conn, &frame.address).await;
    }
    let meter_id = conn.meter_id().unwrap_or_else(|| frame.address.clone());

    if frame.is_error() {
        match codec::parse_error_response(&frame) {
            Ok(error) => {
                let _ = ctx
                    .events
                    .send(GatewayEvent::ErrorResponse {
                        meter_id: meter_id.clone(),
                        error_code: error.error_code,
                        error_message: error.error_message,
                    })
                    .await;
            }
            Err(e) => warn!("undecodable error response from {meter_id}: {e}"),
        }
        if !conn.resolve_oldest_dlt645(ResponsePayload::Dlt645(frame)) {
            Counters::bump(&ctx.manager.counters().late_responses);
            debug!("unsolicited error response from {meter_id} dropped");
        }
        return;
    }
    if !frame.is_response() {
        debug!(
            "ignoring non-response frame (control {:#04x}) from {meter_id}",
            frame.control
        );
        return;
    }

    let request = codec::request_code(frame.control);
    let plain = bcd::remove_offset(&frame.payload);
    if matches!(request, control::READ | control::WRITE) && plain.len() >= 4 {
        let data_id = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]);
        if request == control::READ {
            emit_dlt645_telemetry(ctx, &meter_id, &frame, data_id).await;
        }
        if !conn.resolve_pending(MatchKey::DataId(data_id), ResponsePayload::Dlt645(frame)) {
            Counters::bump(&ctx.manager.counters().late_responses);
            debug!("late DL/T 645 response for data id {data_id:#010x} dropped");
        }
    } else if !conn.resolve_pending(MatchKey::Control(request), ResponsePayload::Dlt645(frame)) {
        Counters::bump(&ctx.manager.counters().late_responses);
        debug!("late DL/T 645 response for control {request:#04x} dropped");
    }
}

async fn handle_dlms_apdu(ctx: &ServerContext, conn: &ConnectionHandle, apdu: Apdu) {
    conn.record_frame_in();
    let Some(meter_id) = conn.meter_id() else {
        debug!(
            "APDU from unidentified connection {}; waiting for a heartbeat",
            conn.id()
        );
        return;
    };
    match &apdu {
        Apdu::Aare { .. } => {
            resolve_or_count_late(ctx, conn, MatchKey::Association, apdu.clone());
        }
        Apdu::Rlre { .. } => {
            resolve_or_count_late(ctx, conn, MatchKey::Release, apdu.clone());
        }
        Apdu::GetResponse { invoke_id, result } => {
            if let GetResult::Error { code, name } = result {
                let _ = ctx
                    .events
                    .send(GatewayEvent::DlmsError {
                        meter_id: meter_id.clone(),
                        invoke_id: *invoke_id,
                        error_code: *code,
                        error_name: name,
                    })
                    .await;
            }
            resolve_or_count_late(ctx, conn, MatchKey::InvokeId(*invoke_id), apdu.clone());
        }
        Apdu::EventNotification(_) | Apdu::DataNotification { .. } => {
            match apdu::extract_telemetry(&apdu, None) {
                Some(telemetry) if !telemetry.readings.is_empty() => {
                    emit_dlms_telemetry(ctx, &meter_id, telemetry).await;
                }
                _ => {
                    let _ = ctx
                        .events
                        .send(GatewayEvent::DlmsEvent {
                            meter_id,
                            event_type: apdu_kind(&apdu).to_string(),
                            data: dlms_event_data(&apdu),
                        })
                        .await;
                }
            }
        }
        Apdu::ExceptionResponse {
            state_error,
            service_error,
        } => {
            let _ = ctx
                .events
                .send(GatewayEvent::DlmsEvent {
                    meter_id,
                    event_type: "exception_response".to_string(),
                    data: json!({
                        "state_error": state_error,
                        "service_error": service_error,
                    }),
                })
                .await;
        }
        _ => debug!(
            "ignoring client-role APDU {:#04x} from {meter_id}",
            apdu.tag()
        ),
    }
}

fn resolve_or_count_late(
    ctx: &ServerContext,
    conn: &ConnectionHandle,
    key: MatchKey,
    apdu: Apdu,
) {
    if !conn.resolve_pending(key, ResponsePayload::Dlms(apdu)) {
        Counters::bump(&ctx.manager.counters().late_responses);
        debug!("late DLMS response for {key:?} dropped");
    }
}

fn apdu_kind(apdu: &Apdu) -> &'static str {
    match apdu {
        Apdu::EventNotification(_) => "event_notification",
        Apdu::DataNotification { .. } => "data_notification",
        _ => "apdu",
    }
}

fn dlms_event_data(apdu: &Apdu) -> serde_json::Value {
    match apdu {
        Apdu::EventNotification(event) => json!({
            "class_id": event.class_id,
            "obis": event.obis.to_string(),
            "attribute": event.attribute,
            "value_tag": event.value.tag.name(),
        }),
        Apdu::DataNotification { invoke_id, .. } => json!({ "invoke_id": invoke_id }),
        _ => serde_json::Value::Null,
    }
}

async fn emit_dlt645_telemetry(ctx: &ServerContext, meter_id: &str, frame: &Frame, data_id: u32) {
    let spec = registers::lookup(data_id);
    match codec::parse_read_response(frame, spec) {
        Ok(response) => {
            let register = match response.register {
                Some(spec) => RegisterRef {
                    key: spec.key.to_string(),
                    name: spec.name.to_string(),
                },
                None => RegisterRef {
                    key: format!("{data_id:#010x}"),
                    name: format!("data id {data_id:#010x}"),
                },
            };
            let _ = ctx
                .events
                .send(GatewayEvent::TelemetryReceived {
                    meter_id: meter_id.to_string(),
                    source: TelemetrySource::Dlt645,
                    register,
                    value: response.value,
                    raw_value: response.raw_value,
                    unit: response.unit,
                    timestamp: Utc::now(),
                })
                .await;
        }
        Err(e) => warn!("undecodable read response from {meter_id}: {e}"),
    }
}

pub(crate) async fn emit_dlms_telemetry(
    ctx: &ServerContext,
    meter_id: &str,
    telemetry: DlmsTelemetry,
) {
    let timestamp = telemetry.timestamp.unwrap_or_else(Utc::now);
    for (key, reading) in telemetry.readings {
        let name = reading
            .obis
            .as_ref()
            .and_then(obis::lookup)
            .map(|def| def.name.to_string())
            .unwrap_or_else(|| key.clone());
        let _ = ctx
            .events
            .send(GatewayEvent::TelemetryReceived {
                meter_id: meter_id.to_string(),
                source: TelemetrySource::Dlms,
                register: RegisterRef { key, name },
                value: reading.value,
                raw_value: reading.raw_value,
                unit: reading.unit,
                timestamp,
            })
            .await;
    }
}
