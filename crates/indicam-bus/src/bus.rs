//! The property bus seam

use async_trait::async_trait;
use indicam_core::{ElementUpdate, InboundEvent, PropertyVector};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Property bus connection is closed")]
    Closed,
    #[error("Failed to connect to {host}:{port}: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("Unknown vector {device}.{vector}")]
    UnknownVector { device: String, vector: String },
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Live connection to a property server
///
/// Implementations keep a cache of every vector the server has defined and
/// deliver inbound events in arrival order. All methods fail with
/// [`BusError::Closed`] once the connection is gone.
#[async_trait]
pub trait PropertyBus: Send + Sync {
    /// Open the connection to a property server
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), BusError>;

    fn is_open(&self) -> bool;

    /// Last known state of a vector
    async fn current_value(&self, device: &str, vector: &str) -> Result<PropertyVector, BusError>;

    /// Send new element values; does not wait for the server to apply them
    async fn submit(
        &mut self,
        device: &str,
        vector: &str,
        updates: &[ElementUpdate],
    ) -> Result<(), BusError>;

    /// Next inbound event, or `None` if nothing arrives within `wait`
    async fn next_event(&mut self, wait: Duration) -> Result<Option<InboundEvent>, BusError>;

    /// Ask the server to deliver binary payloads for a device
    async fn enable_binary_delivery(&mut self, device: &str) -> Result<(), BusError>;
}
