//! Confirmed vector writes
//!
//! A `VectorCommand` submits one write and then drains the bus until the
//! server reports the new state of the written vector. While draining it
//! forwards server messages to the observer and keeps binary payloads for
//! its device, in arrival order, for whoever consumes the bus next.

use indicam_core::{ElementUpdate, InboundEvent, PropertyVector};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::{BusError, PropertyBus};
use crate::observer::EventObserver;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("No confirmation of {device}.{vector} within {timeout:?}")]
    Timeout {
        device: String,
        vector: String,
        timeout: Duration,
    },
    #[error("Connection to property server lost")]
    ConnectionLost,
    #[error("Property bus error: {0}")]
    Bus(BusError),
}

impl From<BusError> for CommandError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Closed => CommandError::ConnectionLost,
            other => CommandError::Bus(other),
        }
    }
}

/// Write-then-confirm primitive bound to one device
pub struct VectorCommand<'a, B: PropertyBus + ?Sized> {
    bus: &'a mut B,
    device: &'a str,
    observer: &'a dyn EventObserver,
    retained: Vec<InboundEvent>,
}

impl<'a, B: PropertyBus + ?Sized> VectorCommand<'a, B> {
    pub fn new(bus: &'a mut B, device: &'a str, observer: &'a dyn EventObserver) -> Self {
        Self {
            bus,
            device,
            observer,
            retained: Vec::new(),
        }
    }

    pub fn device(&self) -> &str {
        self.device
    }

    /// Read the last known state of one of the device's vectors
    pub async fn read(&self, vector: &str) -> Result<PropertyVector, CommandError> {
        Ok(self.bus.current_value(self.device, vector).await?)
    }

    /// Submit `updates` as a single write and wait for the matching update
    pub async fn write_and_confirm(
        &mut self,
        vector: &str,
        updates: &[ElementUpdate],
        timeout: Duration,
    ) -> Result<PropertyVector, CommandError> {
        debug!(
            device = %self.device,
            vector = %vector,
            updates = updates.len(),
            "Submitting vector write"
        );
        self.bus.submit(self.device, vector, updates).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(device = %self.device, vector = %vector, ?timeout, "Write not confirmed");
                return Err(CommandError::Timeout {
                    device: self.device.to_string(),
                    vector: vector.to_string(),
                    timeout,
                });
            }

            let Some(event) = self.bus.next_event(deadline - now).await? else {
                continue;
            };
            match event {
                InboundEvent::VectorUpdate(v) if v.is(self.device, vector) => {
                    debug!(vector = %v, "Write confirmed");
                    return Ok(v);
                }
                InboundEvent::VectorUpdate(v) => self.observer.on_vector(&v),
                InboundEvent::Message { device, text } => self.observer.on_message(&device, &text),
                event @ InboundEvent::BinaryPayload { .. } if event.device() == self.device => {
                    debug!(vector = ?event.vector_name(), "Retaining binary payload");
                    self.retained.push(event);
                }
                event => self.observer.on_discarded(&event),
            }
        }
    }

    /// Binary payloads seen while confirming, oldest first
    pub fn take_retained(&mut self) -> Vec<InboundEvent> {
        std::mem::take(&mut self.retained)
    }

    /// Borrow the underlying bus for direct draining
    pub fn bus(&mut self) -> &mut B {
        &mut *self.bus
    }

    pub fn observer(&self) -> &'a dyn EventObserver {
        self.observer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::TracingObserver;
    use crate::sim::{SimulatedBus, SIMULATOR_DEVICE};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<String>>,
        discarded: Mutex<usize>,
    }

    impl EventObserver for Recorder {
        fn on_message(&self, _device: &str, text: &str) {
            self.messages.lock().unwrap().push(text.to_string());
        }

        fn on_discarded(&self, _event: &InboundEvent) {
            *self.discarded.lock().unwrap() += 1;
        }
    }

    async fn connected() -> SimulatedBus {
        let mut bus = SimulatedBus::ccd(SIMULATOR_DEVICE);
        bus.connect("localhost", 7624).await.unwrap();
        bus
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_and_confirm() {
        let mut bus = connected().await;
        let mut command = VectorCommand::new(&mut bus, SIMULATOR_DEVICE, &TracingObserver);
        let confirmed = command
            .write_and_confirm(
                "CCD_TEMPERATURE",
                &[ElementUpdate::number("CCD_TEMPERATURE_VALUE", -10.0)],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(confirmed.number("CCD_TEMPERATURE_VALUE"), Some(-10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_forwarded_and_strays_discarded() {
        let mut bus = connected().await;
        bus.message(SIMULATOR_DEVICE, "ERROR: cooler fault", Duration::ZERO);
        bus.message("Other Device", "hello", Duration::ZERO);
        bus.push(InboundEvent::BinaryPayload {
            device: "Other Device".to_string(),
            vector: "CCD1".to_string(),
            element: "CCD1".to_string(),
            format: ".fits".to_string(),
            data: Vec::new(),
        });

        let recorder = Recorder::default();
        let mut command = VectorCommand::new(&mut bus, SIMULATOR_DEVICE, &recorder);
        command
            .write_and_confirm(
                "CCD_BINNING",
                &[ElementUpdate::number("HOR_BIN", 2.0)],
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(
            *recorder.messages.lock().unwrap(),
            vec!["ERROR: cooler fault".to_string(), "hello".to_string()]
        );
        assert_eq!(*recorder.discarded.lock().unwrap(), 1);
        assert!(command.take_retained().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retains_own_binary_payloads() {
        let mut bus = connected().await;
        bus.push(InboundEvent::BinaryPayload {
            device: SIMULATOR_DEVICE.to_string(),
            vector: "CCD1".to_string(),
            element: "CCD1".to_string(),
            format: ".fits".to_string(),
            data: vec![1, 2, 3],
        });

        let mut command = VectorCommand::new(&mut bus, SIMULATOR_DEVICE, &TracingObserver);
        command
            .write_and_confirm(
                "CCD_BINNING",
                &[ElementUpdate::number("VER_BIN", 2.0)],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let retained = command.take_retained();
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].vector_name(), Some("CCD1"));
        assert!(command.take_retained().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_echo() {
        let mut bus = connected().await;
        bus.swallow_echo(true);

        let start = Instant::now();
        let mut command = VectorCommand::new(&mut bus, SIMULATOR_DEVICE, &TracingObserver);
        let result = command
            .write_and_confirm(
                "CCD_BINNING",
                &[ElementUpdate::number("HOR_BIN", 2.0)],
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(CommandError::Timeout { .. })));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_bus_is_connection_lost() {
        let mut bus = connected().await;
        bus.close();

        let mut command = VectorCommand::new(&mut bus, SIMULATOR_DEVICE, &TracingObserver);
        let result = command
            .write_and_confirm(
                "CCD_BINNING",
                &[ElementUpdate::number("HOR_BIN", 2.0)],
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(CommandError::ConnectionLost)));
    }
}
