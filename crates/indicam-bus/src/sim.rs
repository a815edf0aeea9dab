//! In-process CCD simulator implementing [`PropertyBus`]
//!
//! `SimulatedBus` holds a set of property vectors for one or more devices and
//! behaves like a cooperative property server: writes are applied and echoed
//! back as vector updates, exposures produce a FITS image after a delay, and
//! arbitrary events can be scheduled at offsets from "now". Handles are
//! cheap clones over shared state, so a test can keep one handle to inspect
//! recorded writes while a controller owns another.

use async_trait::async_trait;
use indicam_core::{
    Element, ElementUpdate, ElementValue, Image, InboundEvent, PropertyVector, SwitchState,
    VectorKind, VectorState,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bus::{BusError, PropertyBus};

/// Default device name of the simulator
pub const SIMULATOR_DEVICE: &str = "CCD Simulator";

const SIM_MAX_X: f64 = 1280.0;
const SIM_MAX_Y: f64 = 1024.0;

/// A write the simulator accepted
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub device: String,
    pub vector: String,
    pub updates: Vec<ElementUpdate>,
}

impl RecordedWrite {
    /// Value written to an element, if this write touched it
    pub fn value(&self, element: &str) -> Option<&ElementValue> {
        self.updates
            .iter()
            .find(|u| u.element == element)
            .map(|u| &u.value)
    }
}

/// What the simulator does after an exposure is started
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExposureResponse {
    /// Deliver a FITS image once the requested duration has elapsed
    #[default]
    AfterExposure,
    /// Deliver a FITS image after a fixed delay
    After(Duration),
    /// Never deliver an image
    Silent,
}

#[derive(Debug)]
struct Scheduled {
    due: Instant,
    event: InboundEvent,
}

#[derive(Debug, Default)]
struct SimState {
    vectors: BTreeMap<(String, String), PropertyVector>,
    queue: VecDeque<Scheduled>,
    writes: Vec<RecordedWrite>,
    binary_devices: HashSet<String>,
    swallow_echo: bool,
    refuse_connect: bool,
    exposure_response: ExposureResponse,
    endpoint: Option<(String, u16)>,
}

impl SimState {
    /// Insert keeping the queue ordered by due time, FIFO among equals
    fn schedule(&mut self, due: Instant, event: InboundEvent) {
        let idx = self.queue.iter().position(|s| s.due > due).unwrap_or(self.queue.len());
        self.queue.insert(idx, Scheduled { due, event });
    }

    fn image_for(&self, device: &str) -> Image {
        let lookup = |vector: &str, element: &str, default: f64| {
            self.vectors
                .get(&(device.to_string(), vector.to_string()))
                .and_then(|v| v.number(element))
                .unwrap_or(default)
        };
        let bin_x = lookup("CCD_BINNING", "HOR_BIN", 1.0).max(1.0);
        let bin_y = lookup("CCD_BINNING", "VER_BIN", 1.0).max(1.0);
        let width = lookup("CCD_FRAME", "WIDTH", SIM_MAX_X) / bin_x;
        let height = lookup("CCD_FRAME", "HEIGHT", SIM_MAX_Y) / bin_y;

        let mut image = Image::blank(width.max(1.0) as usize, height.max(1.0) as usize);
        image.set("EXPTIME", lookup("CCD_EXPOSURE", "CCD_EXPOSURE_VALUE", 0.0));
        image.set("XBINNING", bin_x as i64);
        image.set("YBINNING", bin_y as i64);
        image
    }
}

/// In-memory property server
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
    open: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    /// Simulator with no devices
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            open: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Simulator preloaded with the standard CCD vector set for `device`
    pub fn ccd(device: &str) -> Self {
        let bus = Self::new();
        for vector in ccd_vectors(device) {
            bus.add_vector(vector);
        }
        bus
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Define or replace a vector
    pub fn add_vector(&self, vector: PropertyVector) {
        let key = (vector.device.clone(), vector.name.clone());
        self.state().vectors.insert(key, vector);
    }

    pub fn remove_vector(&self, device: &str, vector: &str) {
        self.state()
            .vectors
            .remove(&(device.to_string(), vector.to_string()));
    }

    pub fn vector(&self, device: &str, vector: &str) -> Option<PropertyVector> {
        self.state()
            .vectors
            .get(&(device.to_string(), vector.to_string()))
            .cloned()
    }

    /// Change stored element values without producing events
    pub fn set_values(&self, device: &str, vector: &str, updates: &[ElementUpdate]) {
        if let Some(v) = self
            .state()
            .vectors
            .get_mut(&(device.to_string(), vector.to_string()))
        {
            v.apply(updates);
        }
    }

    /// Queue an event for delivery `after` from now
    pub fn schedule(&self, event: InboundEvent, after: Duration) {
        self.state().schedule(Instant::now() + after, event);
        self.wake.notify_one();
    }

    /// Queue an event for immediate delivery
    pub fn push(&self, event: InboundEvent) {
        self.schedule(event, Duration::ZERO);
    }

    /// Queue a server message
    pub fn message(&self, device: &str, text: &str, after: Duration) {
        self.schedule(
            InboundEvent::Message {
                device: device.to_string(),
                text: text.to_string(),
            },
            after,
        );
    }

    /// Stop echoing writes back as vector updates
    pub fn swallow_echo(&self, swallow: bool) {
        self.state().swallow_echo = swallow;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connect = refuse;
    }

    pub fn set_exposure_response(&self, response: ExposureResponse) {
        self.state().exposure_response = response;
    }

    /// Drop the connection; blocked and future calls fail with `Closed`
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Every write accepted so far, oldest first
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state().writes.clone()
    }

    pub fn writes_to(&self, vector: &str) -> Vec<RecordedWrite> {
        self.state()
            .writes
            .iter()
            .filter(|w| w.vector == vector)
            .cloned()
            .collect()
    }

    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// Host and port of the last successful connect
    pub fn endpoint(&self) -> Option<(String, u16)> {
        self.state().endpoint.clone()
    }

    pub fn pending_events(&self) -> usize {
        self.state().queue.len()
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }
}

#[async_trait]
impl PropertyBus for SimulatedBus {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), BusError> {
        let mut state = self.state();
        if state.refuse_connect {
            return Err(BusError::ConnectFailed {
                host: host.to_string(),
                port,
                reason: "connection refused".to_string(),
            });
        }
        state.endpoint = Some((host.to_string(), port));
        self.open.store(true, Ordering::SeqCst);
        debug!(host = %host, port = port, "Simulated bus connected");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn current_value(&self, device: &str, vector: &str) -> Result<PropertyVector, BusError> {
        self.ensure_open()?;
        self.vector(device, vector)
            .ok_or_else(|| BusError::UnknownVector {
                device: device.to_string(),
                vector: vector.to_string(),
            })
    }

    async fn submit(
        &mut self,
        device: &str,
        vector: &str,
        updates: &[ElementUpdate],
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut state = self.state();
        let key = (device.to_string(), vector.to_string());

        let updated = {
            let stored = state.vectors.get_mut(&key).ok_or_else(|| BusError::UnknownVector {
                device: device.to_string(),
                vector: vector.to_string(),
            })?;
            stored.apply(updates);
            stored.state = VectorState::Ok;
            stored.clone()
        };
        state.writes.push(RecordedWrite {
            device: device.to_string(),
            vector: vector.to_string(),
            updates: updates.to_vec(),
        });
        trace!(vector = %updated, "Simulated write applied");

        if vector == "CCD_EXPOSURE" {
            let duration = updated.number("CCD_EXPOSURE_VALUE").unwrap_or(0.0);
            let delay = match &state.exposure_response {
                ExposureResponse::AfterExposure => Some(Duration::from_secs_f64(duration.max(0.0))),
                ExposureResponse::After(delay) => Some(*delay),
                ExposureResponse::Silent => None,
            };
            if let Some(delay) = delay {
                if duration > 0.0 && state.binary_devices.contains(device) {
                    let image = state.image_for(device);
                    state.schedule(
                        now + delay,
                        InboundEvent::BinaryPayload {
                            device: device.to_string(),
                            vector: "CCD1".to_string(),
                            element: "CCD1".to_string(),
                            format: image.format.clone(),
                            data: image.to_bytes(),
                        },
                    );
                }
            }
        }

        if !state.swallow_echo {
            state.schedule(now, InboundEvent::VectorUpdate(updated));
        }
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    async fn next_event(&mut self, wait: Duration) -> Result<Option<InboundEvent>, BusError> {
        let deadline = Instant::now() + wait;
        loop {
            self.ensure_open()?;
            let now = Instant::now();
            let next_due = {
                let mut state = self.state();
                if state.queue.front().is_some_and(|s| s.due <= now) {
                    return Ok(state.queue.pop_front().map(|s| s.event));
                }
                state.queue.front().map(|s| s.due)
            };
            if now >= deadline {
                return Ok(None);
            }
            let until = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = tokio::time::sleep_until(until) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn enable_binary_delivery(&mut self, device: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        self.state().binary_devices.insert(device.to_string());
        debug!(device = %device, "Binary delivery enabled");
        Ok(())
    }
}

fn switches(device: &str, name: &str, items: &[(&str, &str, bool)]) -> PropertyVector {
    items.iter().fold(
        PropertyVector::new(device, name, VectorKind::Switch),
        |v, (element, label, on)| {
            v.with_element(Element::switch(element, SwitchState::from(*on)).with_label(label))
        },
    )
}

fn numbers(device: &str, name: &str, items: &[(&str, &str, f64, f64, f64)]) -> PropertyVector {
    items.iter().fold(
        PropertyVector::new(device, name, VectorKind::Number),
        |v, (element, label, value, min, max)| {
            v.with_element(
                Element::number(element, *value)
                    .with_label(label)
                    .with_range(*min, *max),
            )
        },
    )
}

fn texts(device: &str, name: &str, items: &[(&str, &str, &str)]) -> PropertyVector {
    items.iter().fold(
        PropertyVector::new(device, name, VectorKind::Text),
        |v, (element, label, value)| v.with_element(Element::text(element, value).with_label(label)),
    )
}

/// Standard CCD driver vector set, disconnected and idle
pub fn ccd_vectors(device: &str) -> Vec<PropertyVector> {
    vec![
        switches(
            device,
            "CONNECTION",
            &[("CONNECT", "Connect", false), ("DISCONNECT", "Disconnect", true)],
        ),
        numbers(
            device,
            "CCD_EXPOSURE",
            &[("CCD_EXPOSURE_VALUE", "Duration (s)", 1.0, 0.0, 3600.0)],
        ),
        switches(device, "CCD_ABORT_EXPOSURE", &[("ABORT", "Abort", false)]),
        switches(
            device,
            "CCD_FRAME_TYPE",
            &[
                ("FRAME_LIGHT", "Light", true),
                ("FRAME_BIAS", "Bias", false),
                ("FRAME_DARK", "Dark", false),
                ("FRAME_FLAT", "Flat", false),
            ],
        ),
        numbers(
            device,
            "CCD_INFO",
            &[
                ("CCD_MAX_X", "Max. Width", SIM_MAX_X, 1.0, 16000.0),
                ("CCD_MAX_Y", "Max. Height", SIM_MAX_Y, 1.0, 16000.0),
                ("CCD_PIXEL_SIZE", "Pixel size (um)", 5.2, 1.0, 40.0),
                ("CCD_PIXEL_SIZE_X", "Pixel size X", 5.2, 1.0, 40.0),
                ("CCD_PIXEL_SIZE_Y", "Pixel size Y", 5.2, 1.0, 40.0),
                ("CCD_BITSPERPIXEL", "Bits per pixel", 16.0, 8.0, 64.0),
            ],
        ),
        numbers(
            device,
            "CCD_BINNING",
            &[("HOR_BIN", "X", 1.0, 1.0, 4.0), ("VER_BIN", "Y", 1.0, 1.0, 4.0)],
        ),
        numbers(
            device,
            "CCD_FRAME",
            &[
                ("X", "Left", 0.0, 0.0, SIM_MAX_X - 1.0),
                ("Y", "Top", 0.0, 0.0, SIM_MAX_Y - 1.0),
                ("WIDTH", "Width", SIM_MAX_X, 1.0, SIM_MAX_X),
                ("HEIGHT", "Height", SIM_MAX_Y, 1.0, SIM_MAX_Y),
            ],
        ),
        numbers(
            device,
            "CCD_TEMPERATURE",
            &[("CCD_TEMPERATURE_VALUE", "Temperature (C)", 20.0, -50.0, 50.0)],
        ),
        switches(
            device,
            "CCD_COOLER",
            &[("COOLER_ON", "On", false), ("COOLER_OFF", "Off", true)],
        ),
        numbers(
            device,
            "CCD_COOLER_POWER",
            &[("CCD_COOLER_VALUE", "Cooling Power (%)", 0.0, 0.0, 100.0)],
        ),
        switches(device, "CCD_FAN", &[("FAN_ON", "On", true), ("FAN_OFF", "Off", false)]),
        numbers(
            device,
            "FILTER_SLOT",
            &[("FILTER_SLOT_VALUE", "Filter", 1.0, 1.0, 5.0)],
        ),
        texts(
            device,
            "FILTER_NAME",
            &[
                ("FILTER_SLOT_NAME_1", "Filter#1", "U"),
                ("FILTER_SLOT_NAME_2", "Filter#2", "B"),
                ("FILTER_SLOT_NAME_3", "Filter#3", "V"),
                ("FILTER_SLOT_NAME_4", "Filter#4", "R"),
                ("FILTER_SLOT_NAME_5", "Filter#5", "I"),
            ],
        ),
        texts(
            device,
            "FITS_HEADER",
            &[
                ("FITS_OBSERVER", "Observer", "Unknown"),
                ("FITS_OBJECT", "Object", "Unknown"),
            ],
        ),
        numbers(
            device,
            "CCD_CONTROLS",
            &[("Gain", "Gain", 0.0, 0.0, 600.0), ("Offset", "Offset", 10.0, 0.0, 240.0)],
        ),
        switches(
            device,
            "CFW_CONNECTION",
            &[("CONNECT", "Connect", false), ("DISCONNECT", "Disconnect", true)],
        ),
        switches(
            device,
            "CFW_TYPE",
            &[
                ("CFW1", "CFW-2/4", false),
                ("CFW2", "CFW-402", false),
                ("CFW3", "CFW-8", false),
            ],
        ),
        PropertyVector::new(device, "CCD1", VectorKind::Binary),
    ]
}
