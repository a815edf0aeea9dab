//! Observers for server messages and unrelated inbound events

use indicam_core::{InboundEvent, PropertyVector};
use tracing::{debug, error, info};

/// Severity a server message is reported at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Error,
}

impl MessageSeverity {
    /// Messages mentioning "error" (any case) are errors, everything else is info
    pub fn of(text: &str) -> Self {
        if text.to_ascii_uppercase().contains("ERROR") {
            MessageSeverity::Error
        } else {
            MessageSeverity::Info
        }
    }
}

/// Receives events that arrive while a command or exposure is waiting
pub trait EventObserver: Send + Sync {
    fn on_message(&self, device: &str, text: &str) {
        let _ = (device, text);
    }

    fn on_vector(&self, vector: &PropertyVector) {
        let _ = vector;
    }

    /// An event nobody was waiting for
    fn on_discarded(&self, event: &InboundEvent) {
        let _ = event;
    }
}

/// Observer that reports everything through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl EventObserver for TracingObserver {
    fn on_message(&self, device: &str, text: &str) {
        match MessageSeverity::of(text) {
            MessageSeverity::Error => error!(device = %device, "{}", text),
            MessageSeverity::Info => info!(device = %device, "{}", text),
        }
    }

    fn on_vector(&self, vector: &PropertyVector) {
        debug!(vector = %vector, "Vector update");
    }

    fn on_discarded(&self, event: &InboundEvent) {
        debug!(
            device = %event.device(),
            vector = ?event.vector_name(),
            "Discarding unrelated event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_severity() {
        assert_eq!(MessageSeverity::of("ERROR: shutter jammed"), MessageSeverity::Error);
        assert_eq!(MessageSeverity::of("readout error"), MessageSeverity::Error);
        assert_eq!(MessageSeverity::of("Exposure done, downloading image..."), MessageSeverity::Info);
    }
}
