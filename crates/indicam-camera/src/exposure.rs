//! Single-exposure state machine
//!
//! An `ExposureSession` selects the frame type, arms the exposure, and then
//! drains the bus until the image arrives, the deadline passes, or the
//! exposure is cancelled. Sessions are built fresh for every exposure and
//! consumed by [`ExposureSession::run`].
//!
//! ```text
//! Idle -> FrameTypeSet -> ExposureArmed -> Waiting -> Completed
//!                                                  -> TimedOut
//!                                                  -> Errored
//! ```

use indicam_bus::{MessageSeverity, PropertyBus, VectorCommand};
use indicam_core::{
    is_image_format, CapabilityProfile, ElementUpdate, HeaderValue, Image, ImageDecoder,
    InboundEvent, Operation, ProfileError, SwitchState, MAX_EXPOSURE_SECS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ControllerConfig, ErrorPolicy};
use crate::error::CameraError;

/// Parameters of one exposure
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRequest {
    /// Exposure time in seconds
    pub duration: f64,
    /// Frame-type label, e.g. "Light"
    pub frame_type: String,
}

impl ExposureRequest {
    pub fn new(duration: f64, frame_type: &str) -> Self {
        Self {
            duration,
            frame_type: frame_type.to_string(),
        }
    }

    pub fn light(duration: f64) -> Self {
        Self::new(duration, "Light")
    }

    /// Check the request against a profile; no I/O
    pub fn validate(&self, profile: &CapabilityProfile) -> Result<(), CameraError> {
        if !profile.accepts_frame_type(&self.frame_type) {
            return Err(CameraError::InvalidFrameType {
                requested: self.frame_type.clone(),
                allowed: profile.frame_types().to_vec(),
            });
        }
        let (min, max) = profile
            .range_of(Operation::Exposure)
            .unwrap_or((0.0, MAX_EXPOSURE_SECS));
        let min = min.max(0.0);
        let max = max.min(MAX_EXPOSURE_SECS);
        if !(self.duration > min && self.duration <= max) {
            return Err(CameraError::InvalidDuration {
                duration: self.duration,
                max,
            });
        }
        Ok(())
    }
}

/// Terminal result of an exposure
#[derive(Debug, Clone, PartialEq)]
pub enum ExposureOutcome {
    /// Decoded image plus the header keys that were filled in from defaults
    Image { image: Image, applied: Vec<String> },
    TimedOut,
    /// A server error message ended the exposure (`ErrorPolicy::FailFast` only)
    ServerError(String),
    Aborted,
}

impl ExposureOutcome {
    pub fn image(&self) -> Option<&Image> {
        match self {
            ExposureOutcome::Image { image, .. } => Some(image),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureState {
    Idle,
    FrameTypeSet,
    ExposureArmed,
    Waiting,
    Completed,
    TimedOut,
    Errored,
}

/// Cooperative cancellation for an in-flight exposure
#[derive(Debug, Clone)]
pub struct ExposureCancel {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ExposureCancel {
    fn default() -> Self {
        Self::new()
    }
}

impl ExposureCancel {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

pub struct ExposureSession<'a, B: PropertyBus + ?Sized> {
    command: VectorCommand<'a, B>,
    profile: &'a CapabilityProfile,
    config: &'a ControllerConfig,
    decoder: &'a dyn ImageDecoder,
    defaults: Vec<(String, HeaderValue)>,
    cancel: Option<watch::Receiver<bool>>,
    state: ExposureState,
}

impl<'a, B: PropertyBus + ?Sized> ExposureSession<'a, B> {
    pub fn new(
        command: VectorCommand<'a, B>,
        profile: &'a CapabilityProfile,
        config: &'a ControllerConfig,
        decoder: &'a dyn ImageDecoder,
    ) -> Self {
        Self {
            command,
            profile,
            config,
            decoder,
            defaults: Vec::new(),
            cancel: None,
            state: ExposureState::Idle,
        }
    }

    /// Header fields stamped into the image when it lacks them
    pub fn with_defaults(mut self, defaults: Vec<(String, HeaderValue)>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_cancel(mut self, cancel: &ExposureCancel) -> Self {
        self.cancel = Some(cancel.subscribe());
        self
    }

    pub fn state(&self) -> ExposureState {
        self.state
    }

    fn transition(&mut self, state: ExposureState) {
        debug!(from = ?self.state, to = ?state, "Exposure state");
        self.state = state;
    }

    fn required(&self, operation: Operation) -> Result<(&'a str, Option<&'a str>), CameraError> {
        let profile: &'a CapabilityProfile = self.profile;
        let binding = profile.resolve(operation).supported().ok_or_else(|| {
            ProfileError::MissingRequired {
                model: profile.model.clone(),
                operation,
            }
        })?;
        Ok((binding.vector, binding.element))
    }

    /// Drive the exposure to a terminal outcome
    pub async fn run(mut self, request: &ExposureRequest) -> Result<ExposureOutcome, CameraError> {
        request.validate(self.profile)?;
        let result = self.acquire(request).await;
        if result.is_err() {
            self.transition(ExposureState::Errored);
        }
        result
    }

    async fn acquire(&mut self, request: &ExposureRequest) -> Result<ExposureOutcome, CameraError> {
        let confirm = self.config.confirm_timeout;

        let (frame_vector, _) = self.required(Operation::FrameType)?;
        let current = self.command.read(frame_vector).await?;
        let updates = current
            .select_switch(&request.frame_type)
            .ok_or_else(|| CameraError::InvalidFrameType {
                requested: request.frame_type.clone(),
                allowed: current.labels(),
            })?;
        self.command
            .write_and_confirm(frame_vector, &updates, confirm)
            .await?;
        // Nothing drained before the exposure write can belong to it
        let observer = self.command.observer();
        for stale in self.command.take_retained() {
            observer.on_discarded(&stale);
        }
        self.transition(ExposureState::FrameTypeSet);

        let (exposure_vector, exposure_element) = self.required(Operation::Exposure)?;
        let element = exposure_element.ok_or_else(|| CameraError::MissingElement {
            vector: exposure_vector.to_string(),
            element: "duration".to_string(),
        })?;
        self.command
            .write_and_confirm(
                exposure_vector,
                &[ElementUpdate::number(element, request.duration)],
                confirm,
            )
            .await?;
        let deadline =
            Instant::now() + Duration::from_secs_f64(request.duration) + self.config.grace;
        self.transition(ExposureState::ExposureArmed);
        info!(
            device = %self.command.device(),
            duration = request.duration,
            frame_type = %request.frame_type,
            "Exposure started"
        );

        self.transition(ExposureState::Waiting);
        for event in self.command.take_retained() {
            if let Some(outcome) = self.handle(event)? {
                return Ok(outcome);
            }
        }

        loop {
            if self.cancel.as_ref().is_some_and(|rx| *rx.borrow()) {
                return self.abort().await;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    device = %self.command.device(),
                    duration = request.duration,
                    "Exposure timed out waiting for image"
                );
                self.transition(ExposureState::TimedOut);
                return Ok(ExposureOutcome::TimedOut);
            }

            let wait = (deadline - now).min(self.config.poll_interval);
            if let Some(event) = self.command.bus().next_event(wait).await? {
                if let Some(outcome) = self.handle(event)? {
                    return Ok(outcome);
                }
            }
        }
    }

    fn handle(&mut self, event: InboundEvent) -> Result<Option<ExposureOutcome>, CameraError> {
        let observer = self.command.observer();
        match event {
            InboundEvent::BinaryPayload {
                device,
                vector,
                format,
                data,
                ..
            } if device == self.command.device() => {
                if !is_image_format(&format) {
                    info!(vector = %vector, format = %format, "Ignoring non-image payload");
                    return Ok(None);
                }
                let image = self.decoder.decode(&format, &data)?;
                Ok(Some(self.complete(image)))
            }
            InboundEvent::Message { device, text } => {
                observer.on_message(&device, &text);
                if device == self.command.device()
                    && MessageSeverity::of(&text) == MessageSeverity::Error
                    && self.config.error_policy == ErrorPolicy::FailFast
                {
                    self.transition(ExposureState::Errored);
                    return Ok(Some(ExposureOutcome::ServerError(text)));
                }
                Ok(None)
            }
            InboundEvent::VectorUpdate(v) => {
                observer.on_vector(&v);
                Ok(None)
            }
            event => {
                observer.on_discarded(&event);
                Ok(None)
            }
        }
    }

    fn complete(&mut self, mut image: Image) -> ExposureOutcome {
        let applied: Vec<String> = self
            .defaults
            .iter()
            .filter(|(key, value)| image.set_default(key, value.clone()))
            .map(|(key, _)| key.clone())
            .collect();
        info!(
            device = %self.command.device(),
            bytes = image.data.len(),
            stamped = ?applied,
            "Exposure complete"
        );
        self.transition(ExposureState::Completed);
        ExposureOutcome::Image { image, applied }
    }

    async fn abort(&mut self) -> Result<ExposureOutcome, CameraError> {
        info!(device = %self.command.device(), "Exposure cancelled");
        if let Some(binding) = self.profile.resolve(Operation::AbortExposure).supported() {
            let element = binding.element.unwrap_or("ABORT");
            self.command
                .write_and_confirm(
                    binding.vector,
                    &[ElementUpdate::switch(element, SwitchState::On)],
                    self.config.confirm_timeout,
                )
                .await?;
        }
        self.transition(ExposureState::Errored);
        Ok(ExposureOutcome::Aborted)
    }
}
