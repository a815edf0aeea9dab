//! Shared helpers for controller integration tests

#![allow(dead_code)]

use indicam_bus::{EventObserver, MessageSeverity, SimulatedBus};
use indicam_camera::{CameraController, ControllerConfig};
use indicam_core::CapabilityProfile;
use std::sync::{Arc, Mutex};

/// Observer that keeps every server message it sees
#[derive(Default)]
pub struct RecordingObserver {
    messages: Mutex<Vec<(MessageSeverity, String)>>,
}

impl RecordingObserver {
    pub fn messages(&self) -> Vec<(MessageSeverity, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(severity, _)| *severity == MessageSeverity::Error)
            .map(|(_, text)| text)
            .collect()
    }
}

impl EventObserver for RecordingObserver {
    fn on_message(&self, _device: &str, text: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((MessageSeverity::of(text), text.to_string()));
    }
}

pub struct TestCamera {
    pub controller: CameraController<SimulatedBus>,
    /// Second handle onto the simulator the controller owns
    pub sim: SimulatedBus,
    pub observer: Arc<RecordingObserver>,
}

/// Open a built-in model against a fresh simulator, with recorded writes cleared
pub async fn open_camera(model: &str) -> TestCamera {
    open_camera_with(model, ControllerConfig::default()).await
}

pub async fn open_camera_with(model: &str, config: ControllerConfig) -> TestCamera {
    let profile = CapabilityProfile::builtin(model).unwrap();
    let sim = SimulatedBus::ccd(&profile.driver);
    let observer = Arc::new(RecordingObserver::default());

    let mut controller = CameraController::new(sim.clone(), profile)
        .unwrap()
        .with_config(config)
        .with_observer(observer.clone());
    controller.open("localhost", 7624).await.unwrap();
    sim.clear_writes();

    TestCamera {
        controller,
        sim,
        observer,
    }
}
