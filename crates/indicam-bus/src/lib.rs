//! Indicam Bus - Property server access for camera control
//!
//! This crate sits between camera logic and the property server:
//! - `PropertyBus`, the async seam to a live property server connection
//! - `VectorCommand`, a write that waits for the server to confirm it
//! - `EventObserver`, the hook for server messages and stray events
//! - `SimulatedBus`, an in-process CCD simulator for tests and dry runs

pub mod bus;
pub mod command;
pub mod observer;
pub mod sim;

pub use bus::{BusError, PropertyBus};
pub use command::{CommandError, VectorCommand};
pub use observer::{EventObserver, MessageSeverity, TracingObserver};
pub use sim::{ccd_vectors, ExposureResponse, RecordedWrite, SimulatedBus, SIMULATOR_DEVICE};
