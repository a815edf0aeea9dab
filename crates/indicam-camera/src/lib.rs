//! Indicam Camera - Camera-level control over a property bus
//!
//! This crate turns capability profiles and confirmed vector writes into
//! camera operations:
//! - `ExposureSession`, the state machine behind a single exposure
//! - `CameraController`, the per-camera facade (temperature, binning,
//!   frame, filters, exposures, and model-specific setup steps)

pub mod config;
pub mod controller;
pub mod error;
pub mod exposure;

pub use config::{ControllerConfig, ErrorPolicy};
pub use controller::{Binning, CameraController, FilterSelector, Frame};
pub use error::CameraError;
pub use exposure::{
    ExposureCancel, ExposureOutcome, ExposureRequest, ExposureSession, ExposureState,
};
