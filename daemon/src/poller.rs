//! Active DLMS polling: a periodic AARQ → GET×N → RLRQ cycle against every
//! identified IVY/DLMS meter. One worker task walks the meters sequentially
//! each tick, so two cycles can never overlap on a connection.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ivygate::dlms::apdu::{self, Apdu, GetResult};
use ivygate::dlms::client;
use ivygate::dlms::obis::ObisCode;

use crate::config::{DlmsConfig, PollingConfig, RegisterGroup};
use crate::connection::{ConnectionHandle, MatchKey, ResponsePayload, SendError};
use crate::manager::{ConnectionManager, Counters};
use crate::server::{emit_dlms_telemetry, ServerContext};

/// COSEM interface classes polled by the gateway.
const CLASS_REGISTER: u16 = 3;
const CLASS_CLOCK: u16 = 8;
const CLASS_DATA: u16 = 1;

const ENERGY_CODES: &[(u16, ObisCode)] = &[
    (CLASS_REGISTER, ObisCode::new(1, 0, 1, 8, 0, 255)),
    (CLASS_REGISTER, ObisCode::new(1, 0, 2, 8, 0, 255)),
    (CLASS_REGISTER, ObisCode::new(1, 0, 15, 8, 0, 255)),
];

const INSTANTANEOUS_CODES: &[(u16, ObisCode)] = &[
    (CLASS_REGISTER, ObisCode::new(1, 0, 1, 7, 0, 255)),
    (CLASS_REGISTER, ObisCode::new(1, 0, 3, 7, 0, 255)),
    (CLASS_REGISTER, ObisCode::new(1, 0, 9, 7, 0, 255)),
    (CLASS_REGISTER, ObisCode::new(1, 0, 11, 7, 0, 255)),
    (CLASS_REGISTER, ObisCode::new(1, 0, 12, 7, 0, 255)),
    (CLASS_REGISTER, ObisCode::new(1, 0, 13, 7, 0, 255)),
    (CLASS_REGISTER, ObisCode::new(1, 0, 14, 7, 0, 255)),
    (CLASS_REGISTER, ObisCode::new(1, 0, 91, 7, 0, 255)),
];

const SYSTEM_CODES: &[(u16, ObisCode)] = &[
    (CLASS_CLOCK, ObisCode::new(0, 0, 1, 0, 0, 255)),
    (CLASS_DATA, ObisCode::new(0, 0, 96, 1, 0, 255)),
    (CLASS_DATA, ObisCode::new(0, 0, 96, 14, 0, 255)),
];

/// The codes one cycle reads, per configured group.
pub fn group_codes(group: RegisterGroup) -> Vec<(u16, ObisCode)> {
    match group {
        RegisterGroup::Energy => ENERGY_CODES.to_vec(),
        RegisterGroup::Instantaneous => INSTANTANEOUS_CODES.to_vec(),
        RegisterGroup::All => {
            let mut codes = ENERGY_CODES.to_vec();
            codes.extend_from_slice(INSTANTANEOUS_CODES);
            codes.extend_from_slice(SYSTEM_CODES);
            codes
        }
    }
}

pub fn run_polling_worker(
    task_tracker: &TaskTracker,
    ctx: Arc<ServerContext>,
    polling: PollingConfig,
    dlms: DlmsConfig,
    shutdown_token: CancellationToken,
) {
    if !polling.enabled || dlms.passive_only {
        info!("active DLMS polling disabled");
        return;
    }
    task_tracker.spawn(async move {
        let mut ticker = tokio::time::interval(polling.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                _ = ticker.tick() => {
                    let meters = ctx.manager.identified_dlms_meters();
                    debug!("poll tick: {} identified DLMS meters", meters.len());
                    for (meter_id, conn) in meters {
                        if shutdown_token.is_cancelled() {
                            break;
                        }
                        Counters::bump(&ctx.manager.counters().poll_cycles);
                        if let Err(e) = poll_meter(&ctx, &polling, &meter_id, &conn).await {
                            Counters::bump(&ctx.manager.counters().poll_errors);
                            warn!("poll cycle for {meter_id} failed: {e}");
                        }
                        tokio::time::sleep(polling.stagger_delay()).await;
                    }
                }
            }
        }
    });
}

/// One complete cycle: associate, read the configured group, release.
pub async fn poll_meter(
    ctx: &ServerContext,
    polling: &PollingConfig,
    meter_id: &str,
    conn: &ConnectionHandle,
) -> Result<(), SendError> {
    let manager: &ConnectionManager = &ctx.manager;

    // 1. associate
    let response = manager
        .send_and_await_on(
            conn,
            &client::build_aarq(),
            MatchKey::Association,
            polling.timeout(),
        )
        .await?;
    match response {
        ResponsePayload::Dlms(Apdu::Aare { accepted: true, .. }) => {}
        ResponsePayload::Dlms(Apdu::Aare { result, .. }) => {
            return Err(SendError::AssociationRejected(result));
        }
        _ => return Err(SendError::UnexpectedResponse),
    }

    // 2. read every register in the group
    for (class_id, obis) in group_codes(polling.register_group) {
        let mut attempts = 0;
        loop {
            let invoke_id = conn.alloc_invoke_id();
            let request = client::build_get_request(class_id, obis, 2, invoke_id);
            match manager
                .send_and_await_on(conn, &request, MatchKey::InvokeId(invoke_id), polling.timeout())
                .await
            {
                Ok(ResponsePayload::Dlms(response @ Apdu::GetResponse { .. })) => {
                    match &response {
                        Apdu::GetResponse {
                            result: GetResult::Data(_),
                            ..
                        } => {
                            if let Some(telemetry) = apdu::extract_telemetry(&response, Some(obis))
                            {
                                emit_dlms_telemetry(ctx, meter_id, telemetry).await;
                            }
                        }
                        Apdu::GetResponse {
                            result: GetResult::Error { code, name },
                            ..
                        } => {
                            // access errors are definitive; move on
                            debug!("{meter_id}: {obis} unreadable ({name}, code {code})");
                        }
                        _ => unreachable!(),
                    }
                    break;
                }
                Ok(_) => {
                    debug!("{meter_id}: unexpected payload for invoke id {invoke_id}");
                    break;
                }
                Err(SendError::RequestTimeout(_)) if attempts < polling.retries => {
                    attempts += 1;
                    Counters::bump(&manager.counters().poll_retries);
                    debug!("{meter_id}: retrying {obis} (attempt {attempts})");
                }
                // timeouts past the retry budget fail this register only
                Err(SendError::RequestTimeout(_)) => {
                    debug!("{meter_id}: giving up on {obis} this cycle");
                    break;
                }
                // connection-level failures abort the cycle
                Err(e) => return Err(e),
            }
        }
    }

    // 3. release, best effort
    if let Err(e) = manager
        .send_and_await_on(
            conn,
            &client::build_release_request(0),
            MatchKey::Release,
            polling.release_timeout(),
        )
        .await
    {
        debug!("{meter_id}: release not acknowledged: {e}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::GatewayEvent;
    use crate::testutil::{attach_connection, harness, heartbeat_bytes};
    use ivygate::telemetry::ReadingValue;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Scripted meter: answers AARQ, every GET, and RLRQ on the raw socket.
    /// Values are chosen per OBIS so scaler application is observable.
    async fn run_fake_meter(mut socket: DuplexStream, values: HashMap<String, u32>) {
        let mut buf = vec![0u8; 4096];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let mut pos = 0;
            while pos < n {
                match buf[pos] {
                    0x60 => {
                        let len = 2 + buf[pos + 1] as usize;
                        // AARE: accepted
                        let aare = [
                            0x61, 0x11, 0xa1, 0x09, 0x06, 0x07, 0x60, 0x85, 0x74, 0x05, 0x08,
                            0x01, 0x01, 0xa2, 0x03, 0x02, 0x01, 0x00,
                        ];
                        socket.write_all(&aare).await.unwrap();
                        pos += len;
                    }
                    0xc0 => {
                        let invoke_id = buf[pos + 2];
                        let obis = ObisCode::from_slice(&buf[pos + 5..pos + 11]).unwrap();
                        let value = values.get(&obis.to_string()).copied().unwrap_or(0);
                        let mut reply = vec![0xc4, 0x01, invoke_id, 0x00, 0x06];
                        reply.extend(value.to_be_bytes());
                        socket.write_all(&reply).await.unwrap();
                        pos += 13;
                    }
                    0x62 => {
                        let len = 2 + buf[pos + 1] as usize;
                        socket.write_all(&[0x63, 0x03, 0x80, 0x01, 0x00]).await.unwrap();
                        pos += len;
                    }
                    other => {
                        panic!("fake meter got unexpected byte {other:#04x}");
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_full_poll_cycle_applies_scalers() {
        let mut config = Config::default();
        config.polling.register_group = RegisterGroup::Instantaneous;
        config.polling.timeout_ms = 2_000;
        let mut harness = harness(config.clone());
        let (conn, mut meter) = attach_connection(&harness, 7101);

        meter.write_all(&heartbeat_bytes("311501114070")).await.unwrap();
        let event = harness.events.recv().await.unwrap();
        assert!(matches!(event, GatewayEvent::MeterConnected { .. }));

        let mut values = HashMap::new();
        values.insert("1-0:1.7.0.255".to_string(), 1500);
        values.insert("1-0:3.7.0.255".to_string(), 120);
        values.insert("1-0:9.7.0.255".to_string(), 1510);
        values.insert("1-0:11.7.0.255".to_string(), 6420);
        values.insert("1-0:12.7.0.255".to_string(), 23636);
        values.insert("1-0:13.7.0.255".to_string(), 987);
        values.insert("1-0:14.7.0.255".to_string(), 5002);
        values.insert("1-0:91.7.0.255".to_string(), 310);
        tokio::spawn(run_fake_meter(meter, values));

        poll_meter(&harness.ctx, &config.polling, "311501114070", &conn)
            .await
            .unwrap();

        let mut readings = HashMap::new();
        while let Ok(event) = harness.events.try_recv() {
            if let GatewayEvent::TelemetryReceived { register, value, unit, .. } = event {
                readings.insert(register.key, (value, unit));
            }
        }
        // one reading per OBIS code in the instantaneous group
        assert_eq!(readings.len(), INSTANTANEOUS_CODES.len());
        // a UINT32 of 23636 for 1-0:12.7.0.255 becomes 236.36 V
        assert_eq!(
            readings["VOLTAGE"],
            (ReadingValue::Number(236.36), Some("V"))
        );
        assert_eq!(
            readings["CURRENT"],
            (ReadingValue::Number(6.42), Some("A"))
        );
        assert_eq!(
            readings["FREQUENCY"],
            (ReadingValue::Number(50.02), Some("Hz"))
        );
        assert_eq!(
            readings["TOTAL_ACTIVE_POWER"],
            (ReadingValue::Number(1500.0), Some("W"))
        );
        // the cycle's pending entries are all resolved
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_rejected_association_fails_cycle() {
        let config = Config::default();
        let mut harness = harness(config.clone());
        let (conn, mut meter) = attach_connection(&harness, 7102);

        meter.write_all(&heartbeat_bytes("311501114071")).await.unwrap();
        let _ = harness.events.recv().await.unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let _ = meter.read(&mut buf).await.unwrap();
            // AARE with association-result 1 (rejected-permanent)
            let aare = [
                0x61, 0x11, 0xa1, 0x09, 0x06, 0x07, 0x60, 0x85, 0x74, 0x05, 0x08, 0x01, 0x01,
                0xa2, 0x03, 0x02, 0x01, 0x01,
            ];
            meter.write_all(&aare).await.unwrap();
            // keep the socket open so the gateway sees the reply
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut polling = config.polling.clone();
        polling.timeout_ms = 2_000;
        let result = poll_meter(&harness.ctx, &polling, "311501114071", &conn).await;
        assert_eq!(result.unwrap_err(), SendError::AssociationRejected(1));
        assert_eq!(conn.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_get_timeout_consumes_retries() {
        let mut config = Config::default();
        config.polling.register_group = RegisterGroup::Energy;
        let mut harness = harness(config.clone());
        let (conn, mut meter) = attach_connection(&harness, 7103);

        meter.write_all(&heartbeat_bytes("311501114072")).await.unwrap();
        let _ = harness.events.recv().await.unwrap();

        // answers the association and the release, never the GETs
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match meter.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                let mut pos = 0;
                while pos < n {
                    match buf[pos] {
                        0x60 => {
                            let aare = [
                                0x61, 0x11, 0xa1, 0x09, 0x06, 0x07, 0x60, 0x85, 0x74, 0x05,
                                0x08, 0x01, 0x01, 0xa2, 0x03, 0x02, 0x01, 0x00,
                            ];
                            meter.write_all(&aare).await.unwrap();
                            pos += 2 + buf[pos + 1] as usize;
                        }
                        0xc0 => pos += 13,
                        0x62 => {
                            meter.write_all(&[0x63, 0x03, 0x80, 0x01, 0x00]).await.unwrap();
                            pos += 2 + buf[pos + 1] as usize;
                        }
                        _ => return,
                    }
                }
            }
        });

        let mut polling = config.polling.clone();
        polling.timeout_ms = 50;
        polling.retries = 2;
        poll_meter(&harness.ctx, &polling, "311501114072", &conn)
            .await
            .unwrap();
        // every GET timed out: retries were spent and counted
        let stats = harness.ctx.manager.stats_snapshot();
        assert_eq!(
            stats.poll_retries,
            (polling.retries as u64) * ENERGY_CODES.len() as u64
        );
        assert_eq!(conn.pending_len(), 0);
    }

    #[test]
    fn test_group_codes() {
        assert_eq!(group_codes(RegisterGroup::Energy).len(), 3);
        assert_eq!(group_codes(RegisterGroup::Instantaneous).len(), 8);
        assert_eq!(
            group_codes(RegisterGroup::All).len(),
            3 + 8 + SYSTEM_CODES.len()
        );
        let energy = group_codes(RegisterGroup::Energy);
        assert!(energy
            .iter()
            .any(|(_, code)| code.to_string() == "1-0:15.8.0.255"));
    }
}
