use std::io;
use thiserror::Error;

use crate::sensor::DeviceState;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("insufficient data: needed {needed} bytes, have {available}")]
    InsufficientData { needed: usize, available: usize },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("device busy: {0:?}")]
    Busy(DeviceState),
}

impl DriverError {
    /// Shorthand for the fail-closed bounds checks used by the byte views.
    pub fn short(needed: usize, available: usize) -> Self {
        DriverError::InsufficientData { needed, available }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
