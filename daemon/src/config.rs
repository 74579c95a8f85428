use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub tcp: TcpConfig,
    pub polling: PollingConfig,
    pub dlms: DlmsConfig,
    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    /// Expected heartbeat cadence; also drives the idle/timeout sweep.
    pub heartbeat_interval_ms: u64,
    pub connection_timeout_ms: u64,
    /// Wrapped payloads above this are framing corruption.
    pub max_ivy_payload: usize,
    pub max_pending_requests: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            host: "0.0.0.0".to_string(),
            port: 8899,
            max_connections: 1000,
            heartbeat_interval_ms: 30_000,
            connection_timeout_ms: 120_000,
            max_ivy_payload: ivygate::ivy::DEFAULT_MAX_PAYLOAD,
            max_pending_requests: 50,
        }
    }
}

impl TcpConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Deadline for one serialized frame write; a socket that cannot drain
    /// this long is closed.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis((self.connection_timeout_ms / 4).max(5_000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterGroup {
    #[default]
    Energy,
    Instantaneous,
    All,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub register_group: RegisterGroup,
    pub timeout_ms: u64,
    pub retries: u32,
    pub stagger_delay_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            enabled: true,
            interval_ms: 60_000,
            register_group: RegisterGroup::Energy,
            timeout_ms: 10_000,
            retries: 2,
            stagger_delay_ms: 100,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    /// RLRE rarely matters; wait only briefly for it.
    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.min(2_000))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DlmsConfig {
    /// Suppress the active poller and only decode what meters push.
    pub passive_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroAddressAction {
    #[default]
    Accept,
    UseIp,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub ack_enabled: bool,
    /// Hex string written back on each heartbeat when acking is enabled.
    pub ack_payload: String,
    pub zero_address_action: ZeroAddressAction,
}

impl HeartbeatConfig {
    pub fn ack_payload_bytes(&self) -> Result<Vec<u8>, GatewayError> {
        let cleaned: String = self
            .ack_payload
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        if cleaned.len() % 2 != 0 {
            return Err(GatewayError::ConfigInvalid(format!(
                "heartbeat.ack_payload has odd hex length {}",
                cleaned.len()
            )));
        }
        (0..cleaned.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&cleaned[i..i + 2], 16).map_err(|_| {
                    GatewayError::ConfigInvalid(format!(
                        "heartbeat.ack_payload is not hex: {:?}",
                        self.ack_payload
                    ))
                })
            })
            .collect()
    }
}

impl Config {
    /// Startup-only validation; the process never dies over configuration
    /// after this point.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.tcp.port == 0 {
            return Err(GatewayError::ConfigInvalid("tcp.port must be nonzero".into()));
        }
        if self.tcp.heartbeat_interval_ms == 0 || self.tcp.connection_timeout_ms == 0 {
            return Err(GatewayError::ConfigInvalid(
                "tcp.heartbeat_interval_ms and tcp.connection_timeout_ms must be nonzero".into(),
            ));
        }
        if self.tcp.connection_timeout_ms < self.tcp.heartbeat_interval_ms {
            return Err(GatewayError::ConfigInvalid(
                "tcp.connection_timeout_ms must be at least tcp.heartbeat_interval_ms".into(),
            ));
        }
        if self.tcp.max_pending_requests == 0 {
            return Err(GatewayError::ConfigInvalid(
                "tcp.max_pending_requests must be nonzero".into(),
            ));
        }
        if self.polling.enabled && self.polling.interval_ms == 0 {
            return Err(GatewayError::ConfigInvalid(
                "polling.interval_ms must be nonzero".into(),
            ));
        }
        if self.heartbeat.ack_enabled {
            let bytes = self.heartbeat.ack_payload_bytes()?;
            if bytes.is_empty() {
                return Err(GatewayError::ConfigInvalid(
                    "heartbeat.ack_enabled requires a nonempty heartbeat.ack_payload".into(),
                ));
            }
        }
        Ok(())
    }
}

pub async fn parse_config<P>(path: P) -> Result<Config, GatewayError>
where
    P: AsRef<std::path::Path>,
{
    if let Ok(config_file) = tokio::fs::read_to_string(&path).await {
        Ok(toml::from_str(&config_file).map_err(GatewayError::ConfigFileParsingError)?)
    } else {
        warn!("unable to read config file, using default config");
        Ok(Config::default())
    }
}

pub struct Args {
    pub config_path: String,
}

pub fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        println!("Usage: {} /path/to/config/file", args[0]);
        std::process::exit(1);
    }
    Args {
        config_path: args[1].clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.tcp.port, 8899);
        assert_eq!(config.tcp.heartbeat_interval_ms, 30_000);
        assert_eq!(config.tcp.connection_timeout_ms, 120_000);
        assert_eq!(config.tcp.max_pending_requests, 50);
        assert!(config.polling.enabled);
        assert_eq!(config.polling.interval_ms, 60_000);
        assert_eq!(config.polling.register_group, RegisterGroup::Energy);
        assert_eq!(config.polling.retries, 2);
        assert!(!config.dlms.passive_only);
        assert!(!config.heartbeat.ack_enabled);
        assert_eq!(config.heartbeat.zero_address_action, ZeroAddressAction::Accept);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            [tcp]
            port = 9000

            [polling]
            register_group = "instantaneous"

            [heartbeat]
            zero_address_action = "use_ip"
            "#,
        )
        .unwrap();
        assert_eq!(config.tcp.port, 9000);
        assert_eq!(config.tcp.heartbeat_interval_ms, 30_000);
        assert_eq!(config.polling.register_group, RegisterGroup::Instantaneous);
        assert_eq!(config.heartbeat.zero_address_action, ZeroAddressAction::UseIp);
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config = Config::default();
        config.tcp.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.heartbeat.ack_enabled = true;
        config.heartbeat.ack_payload = "0xZZ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.heartbeat.ack_enabled = true;
        config.heartbeat.ack_payload = "6f6b".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.heartbeat.ack_payload_bytes().unwrap(), b"ok");
    }
}
