use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Config file parsing error: {0}")]
    ConfigFileParsingError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("Tokio error: {0}")]
    TokioError(#[from] tokio::io::Error),
}
