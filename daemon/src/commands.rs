//! The request/response command surface consumed by external collaborators
//! (the broker bridge, in production). Commands arrive on an mpsc channel,
//! each carrying a oneshot responder, and fail fast when no connection owns
//! the target meter id.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ivygate::bcd;
use ivygate::dlms::apdu::{self, Apdu, GetResult};
use ivygate::dlms::client;
use ivygate::dlms::obis::{self, ObisCode};
use ivygate::dlt645::codec::{self, control, RelayCipher, RelayCommand};
use ivygate::dlt645::registers;
use ivygate::router::ProtocolType;
use ivygate::telemetry::ReadingValue;

use crate::connection::{ConnectionHandle, MatchKey, ResponsePayload, SendError};
use crate::server::ServerContext;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("Meter not connected")]
    MeterNotConnected,
    #[error("unknown register {0:?}")]
    UnknownRegister(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("meter error: {0}")]
    MeterError(String),
    #[error("malformed response: {0}")]
    BadResponse(String),
    #[error("request failed: {0}")]
    Request(SendError),
}

impl From<SendError> for CommandError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::MeterNotConnected => CommandError::MeterNotConnected,
            other => CommandError::Request(other),
        }
    }
}

/// Register selector: a mnemonic from either registry, or a raw DL/T 645
/// data identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterSelector {
    Key(String),
    DataId(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Open,
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadRegisterResponse {
    pub register: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obis: Option<String>,
    pub value: ReadingValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayControlResponse {
    pub relay_state: RelayState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadAddressResponse {
    pub address: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadAllResponse {
    pub readings: BTreeMap<String, ReadRegisterResponse>,
    pub errors: BTreeMap<String, String>,
}

pub enum MeterCommand {
    ReadRegister {
        meter_id: String,
        register: RegisterSelector,
        response_tx: oneshot::Sender<Result<ReadRegisterResponse, CommandError>>,
    },
    ReadAll {
        meter_id: String,
        registers: Vec<String>,
        response_tx: oneshot::Sender<Result<ReadAllResponse, CommandError>>,
    },
    RelayControl {
        meter_id: String,
        state: RelayState,
        response_tx: oneshot::Sender<Result<RelayControlResponse, CommandError>>,
    },
    ReadAddress {
        meter_id: String,
        response_tx: oneshot::Sender<Result<ReadAddressResponse, CommandError>>,
    },
}

pub fn run_command_worker(
    task_tracker: &TaskTracker,
    ctx: Arc<ServerContext>,
    cipher: Arc<dyn RelayCipher + Send + Sync>,
    mut rx: Receiver<MeterCommand>,
    shutdown_token: CancellationToken,
) {
    task_tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                command = rx.recv() => {
                    let Some(command) = command else {
                        info!("command channel closed, worker exiting");
                        break;
                    };
                    handle_command(&ctx, cipher.as_ref(), command).await;
                }
            }
        }
    });
}

async fn handle_command(ctx: &ServerContext, cipher: &(dyn RelayCipher + Sync), command: MeterCommand) {
    match command {
        MeterCommand::ReadRegister {
            meter_id,
            register,
            response_tx,
        } => {
            let result = read_register(ctx, &meter_id, register).await;
            let _ = response_tx.send(result);
        }
        MeterCommand::ReadAll {
            meter_id,
            registers,
            response_tx,
        } => {
            let result = read_all(ctx, &meter_id, registers).await;
            let _ = response_tx.send(result);
        }
        MeterCommand::RelayControl {
            meter_id,
            state,
            response_tx,
        } => {
            let result = relay_control(ctx, cipher, &meter_id, state).await;
            let _ = response_tx.send(result);
        }
        MeterCommand::ReadAddress {
            meter_id,
            response_tx,
        } => {
            let result = read_address(ctx, &meter_id).await;
            let _ = response_tx.send(result);
        }
    }
}

fn connection_for(ctx: &ServerContext, meter_id: &str) -> Result<ConnectionHandle, CommandError> {
    ctx.manager
        .connection_for_meter(meter_id)
        .ok_or(CommandError::MeterNotConnected)
}

pub async fn read_register(
    ctx: &ServerContext,
    meter_id: &str,
    register: RegisterSelector,
) -> Result<ReadRegisterResponse, CommandError> {
    let conn = connection_for(ctx, meter_id)?;
    match conn.protocol() {
        ProtocolType::Dlt645 => read_register_dlt645(ctx, meter_id, register).await,
        ProtocolType::IvyDlms => read_register_dlms(ctx, &conn, meter_id, register).await,
        ProtocolType::Unknown => Err(CommandError::Invalid(
            "connection protocol is not yet known".to_string(),
        )),
    }
}

async fn read_register_dlt645(
    ctx: &ServerContext,
    meter_id: &str,
    register: RegisterSelector,
) -> Result<ReadRegisterResponse, CommandError> {
    let (spec, data_id) = match &register {
        RegisterSelector::DataId(id) => (registers::lookup(*id), *id),
        RegisterSelector::Key(key) => {
            let spec = registers::lookup_by_key(key)
                .ok_or_else(|| CommandError::UnknownRegister(key.clone()))?;
            (Some(spec), spec.data_id)
        }
    };
    let request = codec::build_read_frame(meter_id, data_id)
        .map_err(|e| CommandError::Invalid(e.to_string()))?;
    let payload = ctx
        .manager
        .send_and_await(
            meter_id,
            &request,
            MatchKey::DataId(data_id),
            ctx.config.polling.timeout(),
        )
        .await?;
    let ResponsePayload::Dlt645(frame) = payload else {
        return Err(CommandError::BadResponse("expected a DL/T 645 frame".into()));
    };
    if frame.is_error() {
        let error = codec::parse_error_response(&frame)
            .map_err(|e| CommandError::BadResponse(e.to_string()))?;
        return Err(CommandError::MeterError(error.error_message));
    }
    let response = codec::parse_read_response(&frame, spec)
        .map_err(|e| CommandError::BadResponse(e.to_string()))?;
    Ok(ReadRegisterResponse {
        register: spec
            .map(|s| s.key.to_string())
            .unwrap_or_else(|| format!("{data_id:#010x}")),
        data_id: Some(data_id),
        obis: None,
        value: response.value,
        unit: response.unit,
        timestamp: Utc::now(),
    })
}

/// COSEM class for a register: clock is class 8, abstract (media 0) objects
/// are plain Data, everything else is read as a Register.
fn cosem_class(code: &ObisCode) -> u16 {
    if *code == ObisCode::new(0, 0, 1, 0, 0, 255) {
        8
    } else if code.as_bytes()[0] == 0 {
        1
    } else {
        3
    }
}

async fn read_register_dlms(
    ctx: &ServerContext,
    conn: &ConnectionHandle,
    meter_id: &str,
    register: RegisterSelector,
) -> Result<ReadRegisterResponse, CommandError> {
    let RegisterSelector::Key(key) = register else {
        return Err(CommandError::Invalid(
            "data identifier selectors only apply to DL/T 645 meters".to_string(),
        ));
    };
    let (code, def) =
        obis::lookup_by_key(&key).ok_or_else(|| CommandError::UnknownRegister(key.clone()))?;
    let invoke_id = conn.alloc_invoke_id();
    let request = client::build_get_request(cosem_class(&code), code, 2, invoke_id);
    let payload = ctx
        .manager
        .send_and_await_on(
            conn,
            &request,
            MatchKey::InvokeId(invoke_id),
            ctx.config.polling.timeout(),
        )
        .await?;
    let ResponsePayload::Dlms(response) = payload else {
        return Err(CommandError::BadResponse("expected a DLMS APDU".into()));
    };
    match &response {
        Apdu::GetResponse {
            result: GetResult::Error { code, name },
            ..
        } => Err(CommandError::MeterError(format!("{name} (code {code})"))),
        Apdu::GetResponse {
            result: GetResult::Data(_),
            ..
        } => {
            let telemetry = apdu::extract_telemetry(&response, Some(code))
                .ok_or_else(|| CommandError::BadResponse("no telemetry in response".into()))?;
            let (_, reading) = telemetry
                .readings
                .into_iter()
                .next()
                .ok_or_else(|| CommandError::BadResponse("non-scalar register value".into()))?;
            Ok(ReadRegisterResponse {
                register: def.key.to_string(),
                data_id: None,
                obis: Some(code.to_string()),
                value: reading.value,
                unit: reading.unit,
                timestamp: Utc::now(),
            })
        }
        _ => Err(CommandError::BadResponse("expected a GET.response".into())),
    }
}

pub async fn read_all(
    ctx: &ServerContext,
    meter_id: &str,
    registers: Vec<String>,
) -> Result<ReadAllResponse, CommandError> {
    // fail fast once; individual register failures are reported per key
    connection_for(ctx, meter_id)?;
    let mut readings = BTreeMap::new();
    let mut errors = BTreeMap::new();
    for key in registers {
        match read_register(ctx, meter_id, RegisterSelector::Key(key.clone())).await {
            Ok(response) => {
                readings.insert(key, response);
            }
            Err(e) => {
                debug!("read_all: {key} failed for {meter_id}: {e}");
                errors.insert(key, e.to_string());
            }
        }
    }
    Ok(ReadAllResponse { readings, errors })
}

pub async fn relay_control(
    ctx: &ServerContext,
    cipher: &(dyn RelayCipher + Sync),
    meter_id: &str,
    state: RelayState,
) -> Result<RelayControlResponse, CommandError> {
    let conn = connection_for(ctx, meter_id)?;
    if conn.protocol() != ProtocolType::Dlt645 {
        return Err(CommandError::Invalid(
            "relay control is a DL/T 645 operation".to_string(),
        ));
    }
    let command = match state {
        RelayState::Open => RelayCommand::Trip,
        RelayState::Close => RelayCommand::Close,
    };
    let request = codec::build_relay_control_frame(
        meter_id,
        command,
        0,
        [0u8; 4],
        cipher,
        Utc::now(),
    )
    .map_err(|e| CommandError::Invalid(e.to_string()))?;
    let payload = ctx
        .manager
        .send_and_await_on(
            &conn,
            &request,
            MatchKey::Control(control::RELAY),
            ctx.config.polling.timeout(),
        )
        .await?;
    let ResponsePayload::Dlt645(frame) = payload else {
        return Err(CommandError::BadResponse("expected a DL/T 645 frame".into()));
    };
    if frame.is_error() {
        let error = codec::parse_error_response(&frame)
            .map_err(|e| CommandError::BadResponse(e.to_string()))?;
        return Err(CommandError::MeterError(error.error_message));
    }
    Ok(RelayControlResponse {
        relay_state: state,
        timestamp: Utc::now(),
    })
}

pub async fn read_address(
    ctx: &ServerContext,
    meter_id: &str,
) -> Result<ReadAddressResponse, CommandError> {
    let conn = connection_for(ctx, meter_id)?;
    let request = codec::build_read_address_frame();
    let payload = ctx
        .manager
        .send_and_await_on(
            &conn,
            &request,
            MatchKey::Control(control::READ_ADDRESS),
            ctx.config.polling.timeout(),
        )
        .await?;
    let ResponsePayload::Dlt645(frame) = payload else {
        return Err(CommandError::BadResponse("expected a DL/T 645 frame".into()));
    };
    // the reply's data field is the 6-byte BCD address
    let plain = bcd::remove_offset(&frame.payload);
    let address = if plain.len() >= 6 {
        let mut buffer = [0u8; 6];
        buffer.copy_from_slice(&plain[..6]);
        bcd::buffer_to_address(&buffer)
    } else {
        frame.address.clone()
    };
    Ok(ReadAddressResponse {
        address,
        timestamp: Utc::now(),
    })
}
