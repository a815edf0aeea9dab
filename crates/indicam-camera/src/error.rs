//! Camera error taxonomy

use indicam_bus::{BusError, CommandError};
use indicam_core::{DecodeError, ProfileError};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Invalid frame type '{requested}', expected one of {allowed:?}")]
    InvalidFrameType {
        requested: String,
        allowed: Vec<String>,
    },
    #[error("Invalid exposure duration {duration} s, must be in (0, {max}]")]
    InvalidDuration { duration: f64, max: f64 },
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("No confirmation of {device}.{vector} within {timeout:?}")]
    Timeout {
        device: String,
        vector: String,
        timeout: Duration,
    },
    #[error("Connection to property server lost")]
    ConnectionLost,
    #[error("Vector {vector} has no element {element}")]
    MissingElement { vector: String, element: String },
    #[error("Property bus error: {0}")]
    Bus(BusError),
    #[error("Failed to decode image: {0}")]
    Decode(#[from] DecodeError),
    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),
}

impl From<CommandError> for CameraError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Timeout {
                device,
                vector,
                timeout,
            } => CameraError::Timeout {
                device,
                vector,
                timeout,
            },
            CommandError::ConnectionLost => CameraError::ConnectionLost,
            CommandError::Bus(err) => CameraError::from(err),
        }
    }
}

impl From<BusError> for CameraError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Closed => CameraError::ConnectionLost,
            other => CameraError::Bus(other),
        }
    }
}
