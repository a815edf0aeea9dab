//! Controller timing and error policy

use std::time::Duration;

/// How an exposure reacts to server error messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Log the message and keep waiting for the image or the deadline
    #[default]
    KeepWaiting,
    /// End the exposure with `ExposureOutcome::ServerError`
    FailFast,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// How long a vector write may go unconfirmed
    pub confirm_timeout: Duration,
    /// Extra wait beyond the exposure duration before giving up on the image
    pub grace: Duration,
    /// Longest single wait on the bus while an exposure is in flight
    pub poll_interval: Duration,
    pub error_policy: ErrorPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(5),
            grace: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            error_policy: ErrorPolicy::KeepWaiting,
        }
    }
}
