// src/error.rs
use thiserror::Error;

/// Errors surfaced by the alarm service.
///
/// Config errors are fatal at load time; everything else is recoverable
/// and normally ends up as a logged warning.
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Predicate error: {0}")]
    Predicate(String),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    #[error("State store error: {0}")]
    State(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VigilError>;
