//! Camera controller facade
//!
//! A `CameraController` pairs one property bus with one capability profile
//! and exposes camera-level operations. Every optional operation resolves
//! through the profile first; an operation the model does not bind returns
//! [`Support::NotApplicable`] without touching the bus.

use indicam_bus::{EventObserver, PropertyBus, TracingObserver, VectorCommand};
use indicam_core::{
    CapabilityProfile, ElementUpdate, FitsDecoder, HeaderValue, ImageDecoder, InboundEvent,
    Operation, ProfileError, PropertyVector, Support,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::ControllerConfig;
use crate::error::CameraError;
use crate::exposure::{ExposureCancel, ExposureOutcome, ExposureRequest, ExposureSession};

/// Header value stamped as FILTER when a model has no filter selection
const NO_FILTER: &str = "N/A";

/// Horizontal and vertical binning factors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binning {
    pub x: u32,
    pub y: u32,
}

impl Binning {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Readout region, in detector pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

impl Frame {
    pub fn new(x: i64, y: i64, width: i64, height: i64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Filter chosen by zero-based position or by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSelector {
    Index(usize),
    Name(String),
}

impl From<usize> for FilterSelector {
    fn from(index: usize) -> Self {
        FilterSelector::Index(index)
    }
}

impl From<&str> for FilterSelector {
    fn from(name: &str) -> Self {
        FilterSelector::Name(name.to_string())
    }
}

pub struct CameraController<B: PropertyBus> {
    bus: B,
    profile: CapabilityProfile,
    config: ControllerConfig,
    observer: Arc<dyn EventObserver>,
    decoder: Box<dyn ImageDecoder>,
}

impl<B: PropertyBus> CameraController<B> {
    /// Create a controller; the profile is validated here
    pub fn new(bus: B, profile: CapabilityProfile) -> Result<Self, CameraError> {
        profile.validate()?;
        Ok(Self {
            bus,
            profile,
            config: ControllerConfig::default(),
            observer: Arc::new(TracingObserver),
            decoder: Box::new(FitsDecoder),
        })
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_decoder(mut self, decoder: Box<dyn ImageDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Device name on the property server
    pub fn device(&self) -> &str {
        &self.profile.driver
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn command(&mut self) -> VectorCommand<'_, B> {
        VectorCommand::new(&mut self.bus, &self.profile.driver, self.observer.as_ref())
    }

    /// Open the bus and bring the camera into its working state
    pub async fn open(&mut self, host: &str, port: u16) -> Result<(), CameraError> {
        if !self.bus.is_open() {
            self.bus.connect(host, port).await?;
        }
        let device = self.profile.driver.clone();
        self.bus.enable_binary_delivery(&device).await?;
        if !self.is_connected().await? {
            self.connect().await?;
        }
        self.drain().await?;

        if let Some(observer) = self.profile.observer.clone() {
            self.set_observer(&observer).await?;
        }
        if self.profile.filter_wheel.is_some() {
            self.enable_filter_wheel().await?;
        }
        info!(
            model = %self.profile.model,
            device = %device,
            host = %host,
            port = port,
            "Camera open"
        );
        Ok(())
    }

    /// Hand every queued event to the observer
    pub async fn drain(&mut self) -> Result<usize, CameraError> {
        let mut drained = 0;
        while let Some(event) = self.bus.next_event(Duration::ZERO).await? {
            match &event {
                InboundEvent::Message { device, text } => {
                    self.observer.on_message(device, text)
                }
                InboundEvent::VectorUpdate(v) => self.observer.on_vector(v),
                other => self.observer.on_discarded(other),
            }
            drained += 1;
        }
        if drained > 0 {
            debug!(events = drained, "Drained queued events");
        }
        Ok(drained)
    }

    async fn read_vector(&self, operation: Operation) -> Result<Support<PropertyVector>, CameraError> {
        let Support::Supported(binding) = self.profile.resolve(operation) else {
            return Ok(Support::NotApplicable);
        };
        let vector = self
            .bus
            .current_value(&self.profile.driver, binding.vector)
            .await?;
        Ok(Support::Supported(vector))
    }

    async fn read_number(&self, operation: Operation) -> Result<Support<f64>, CameraError> {
        let Support::Supported(binding) = self.profile.resolve(operation) else {
            return Ok(Support::NotApplicable);
        };
        let element = binding.element.unwrap_or_default();
        let vector = self
            .bus
            .current_value(&self.profile.driver, binding.vector)
            .await?;
        vector
            .number(element)
            .map(Support::Supported)
            .ok_or_else(|| CameraError::MissingElement {
                vector: binding.vector.to_string(),
                element: element.to_string(),
            })
    }

    async fn read_text(&self, operation: Operation) -> Result<Support<String>, CameraError> {
        let Support::Supported(binding) = self.profile.resolve(operation) else {
            return Ok(Support::NotApplicable);
        };
        let element = binding.element.unwrap_or_default();
        let vector = self
            .bus
            .current_value(&self.profile.driver, binding.vector)
            .await?;
        vector
            .text(element)
            .map(|t| Support::Supported(t.to_string()))
            .ok_or_else(|| CameraError::MissingElement {
                vector: binding.vector.to_string(),
                element: element.to_string(),
            })
    }

    /// On/off state of the switch element an operation is bound to
    async fn read_switch(&self, operation: Operation) -> Result<Support<bool>, CameraError> {
        let Support::Supported(binding) = self.profile.resolve(operation) else {
            return Ok(Support::NotApplicable);
        };
        let element = binding.element.unwrap_or_default();
        let vector = self
            .bus
            .current_value(&self.profile.driver, binding.vector)
            .await?;
        vector
            .switch(element)
            .map(|s| Support::Supported(s.is_on()))
            .ok_or_else(|| CameraError::MissingElement {
                vector: binding.vector.to_string(),
                element: element.to_string(),
            })
    }

    /// Write numeric values, one confirmed write per distinct vector
    ///
    /// Operations the profile does not bind are skipped; if none is bound
    /// nothing is written.
    async fn write_numbers(
        &mut self,
        values: &[(Operation, f64)],
    ) -> Result<Support<()>, CameraError> {
        let mut groups: Vec<(String, Vec<ElementUpdate>)> = Vec::new();
        for &(operation, value) in values {
            let Support::Supported(binding) = self.profile.resolve(operation) else {
                continue;
            };
            let Some(element) = binding.element else {
                return Err(CameraError::MissingElement {
                    vector: binding.vector.to_string(),
                    element: format!("{:?}", operation),
                });
            };
            let update = ElementUpdate::number(element, value);
            match groups.iter_mut().find(|(v, _)| v == binding.vector) {
                Some((_, updates)) => updates.push(update),
                None => groups.push((binding.vector.to_string(), vec![update])),
            }
        }
        if groups.is_empty() {
            return Ok(Support::NotApplicable);
        }

        let timeout = self.config.confirm_timeout;
        let mut command = self.command();
        for (vector, updates) in &groups {
            command.write_and_confirm(vector, updates, timeout).await?;
        }
        Ok(Support::Supported(()))
    }

    async fn write_text(&mut self, operation: Operation, text: &str) -> Result<Support<()>, CameraError> {
        let Support::Supported(binding) = self.profile.resolve(operation) else {
            return Ok(Support::NotApplicable);
        };
        let (vector, element) = (binding.vector.to_string(), binding.element.unwrap_or_default().to_string());
        let timeout = self.config.confirm_timeout;
        self.command()
            .write_and_confirm(&vector, &[ElementUpdate::text(&element, text)], timeout)
            .await?;
        Ok(Support::Supported(()))
    }

    /// Select one switch of a one-of-many vector by label or name
    async fn select(&mut self, operation: Operation, key: &str) -> Result<Support<()>, CameraError> {
        let Support::Supported(binding) = self.profile.resolve(operation) else {
            return Ok(Support::NotApplicable);
        };
        let vector = binding.vector.to_string();
        let current = self.bus.current_value(&self.profile.driver, &vector).await?;
        let updates = current
            .select_switch(key)
            .ok_or_else(|| CameraError::MissingElement {
                vector: vector.clone(),
                element: key.to_string(),
            })?;
        let timeout = self.config.confirm_timeout;
        self.command().write_and_confirm(&vector, &updates, timeout).await?;
        Ok(Support::Supported(()))
    }

    async fn required_select(&mut self, operation: Operation, key: &str) -> Result<(), CameraError> {
        match self.select(operation, key).await? {
            Support::Supported(()) => Ok(()),
            Support::NotApplicable => Err(ProfileError::MissingRequired {
                model: self.profile.model.clone(),
                operation,
            }
            .into()),
        }
    }

    pub async fn connect(&mut self) -> Result<(), CameraError> {
        self.required_select(Operation::Connection, "Connect").await?;
        info!(device = %self.profile.driver, "Camera connected");
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), CameraError> {
        self.required_select(Operation::Connection, "Disconnect").await?;
        info!(device = %self.profile.driver, "Camera disconnected");
        Ok(())
    }

    pub async fn is_connected(&self) -> Result<bool, CameraError> {
        Ok(self
            .read_switch(Operation::Connection)
            .await?
            .supported()
            .unwrap_or(false))
    }

    /// All CCD_INFO numbers by element name
    pub async fn ccd_info(&self) -> Result<Support<BTreeMap<String, f64>>, CameraError> {
        Ok(self.read_vector(Operation::CcdInfo).await?.map(|v| {
            v.elements
                .iter()
                .filter_map(|e| e.value.as_number().map(|n| (e.name.clone(), n)))
                .collect()
        }))
    }

    async fn ccd_max(&self) -> Result<Option<(f64, f64)>, CameraError> {
        let max_x = self.read_number(Operation::CcdMaxX).await?.supported();
        let max_y = self.read_number(Operation::CcdMaxY).await?.supported();
        Ok(max_x.zip(max_y))
    }

    pub async fn temperature(&self) -> Result<Support<f64>, CameraError> {
        self.read_number(Operation::Temperature).await
    }

    /// Set the CCD temperature, switching the cooler on when cooling down
    pub async fn set_temperature(&mut self, celsius: f64) -> Result<Support<()>, CameraError> {
        let Support::Supported(current) = self.temperature().await? else {
            return Ok(Support::NotApplicable);
        };
        self.write_numbers(&[(Operation::Temperature, celsius)]).await?;
        info!(from = current, to = celsius, "Setting CCD temperature");
        if celsius < current && self.profile.supports(Operation::Cooling) {
            self.cooling_on().await?;
        }
        Ok(Support::Supported(()))
    }

    pub async fn cooler_power(&self) -> Result<Support<f64>, CameraError> {
        self.read_number(Operation::CoolerPower).await
    }

    /// Whether the cooler is on
    pub async fn cooler(&self) -> Result<Support<bool>, CameraError> {
        self.read_switch(Operation::Cooling).await
    }

    pub async fn cooling_on(&mut self) -> Result<Support<()>, CameraError> {
        self.select(Operation::Cooling, "On").await
    }

    pub async fn cooling_off(&mut self) -> Result<Support<()>, CameraError> {
        self.select(Operation::Cooling, "Off").await
    }

    /// Whether the fan is on
    pub async fn fan(&self) -> Result<Support<bool>, CameraError> {
        self.read_switch(Operation::Fan).await
    }

    pub async fn fan_on(&mut self) -> Result<Support<()>, CameraError> {
        self.select(Operation::Fan, "On").await
    }

    pub async fn fan_off(&mut self) -> Result<Support<()>, CameraError> {
        self.select(Operation::Fan, "Off").await
    }

    pub async fn binning(&self) -> Result<Support<Binning>, CameraError> {
        let x = self.read_number(Operation::BinningX).await?;
        let y = self.read_number(Operation::BinningY).await?;
        Ok(match (x, y) {
            (Support::Supported(x), Support::Supported(y)) => {
                Support::Supported(Binning::new(x as u32, y as u32))
            }
            _ => Support::NotApplicable,
        })
    }

    /// Set binning; factors below 1 are left unchanged
    pub async fn set_binning(&mut self, binning: Binning) -> Result<Support<()>, CameraError> {
        if !self.profile.supports(Operation::BinningX) && !self.profile.supports(Operation::BinningY) {
            return Ok(Support::NotApplicable);
        }
        let mut values = Vec::new();
        if binning.x >= 1 {
            values.push((Operation::BinningX, binning.x as f64));
        }
        if binning.y >= 1 {
            values.push((Operation::BinningY, binning.y as f64));
        }
        if values.is_empty() {
            return Ok(Support::Supported(()));
        }
        info!(x = binning.x, y = binning.y, "Setting binning");
        self.write_numbers(&values).await
    }

    pub async fn frame(&self) -> Result<Support<Frame>, CameraError> {
        let mut fields = [0i64; 4];
        let operations = [
            Operation::FrameX,
            Operation::FrameY,
            Operation::FrameWidth,
            Operation::FrameHeight,
        ];
        for (field, operation) in fields.iter_mut().zip(operations) {
            match self.read_number(operation).await? {
                Support::Supported(value) => *field = value as i64,
                Support::NotApplicable => return Ok(Support::NotApplicable),
            }
        }
        let [x, y, width, height] = fields;
        Ok(Support::Supported(Frame::new(x, y, width, height)))
    }

    /// Set the readout region, clamped to the detector
    ///
    /// An origin outside `[0, CCD_MAX]` leaves that axis untouched; a size is
    /// clamped to `CCD_MAX - origin` and dropped if the result is below 1.
    pub async fn set_frame(&mut self, frame: Frame) -> Result<Support<()>, CameraError> {
        if !self.profile.supports(Operation::FrameX) {
            return Ok(Support::NotApplicable);
        }
        let Some((max_x, max_y)) = self.ccd_max().await? else {
            return Ok(Support::NotApplicable);
        };
        let (max_x, max_y) = (max_x as i64, max_y as i64);

        let mut values = Vec::new();
        if (0..=max_x).contains(&frame.x) {
            values.push((Operation::FrameX, frame.x as f64));
            let width = frame.width.min(max_x - frame.x);
            if width >= 1 {
                values.push((Operation::FrameWidth, width as f64));
            }
        }
        if (0..=max_y).contains(&frame.y) {
            values.push((Operation::FrameY, frame.y as f64));
            let height = frame.height.min(max_y - frame.y);
            if height >= 1 {
                values.push((Operation::FrameHeight, height as f64));
            }
        }
        if values.is_empty() {
            debug!(?frame, "Frame origin outside detector, nothing to set");
            return Ok(Support::Supported(()));
        }
        info!(?frame, "Setting frame");
        self.write_numbers(&values).await
    }

    /// Installed filter names in slot order
    pub async fn filters(&self) -> Result<Support<Vec<String>>, CameraError> {
        if !self.profile.supports(Operation::Filter) {
            return Ok(Support::NotApplicable);
        }
        Ok(self.read_vector(Operation::FilterNames).await?.map(|v| {
            v.elements
                .iter()
                .filter_map(|e| e.value.as_text().map(str::to_string))
                .collect()
        }))
    }

    /// Name of the filter in the beam, if the slot maps to a named filter
    pub async fn filter(&self) -> Result<Support<Option<String>>, CameraError> {
        let Support::Supported(names) = self.filters().await? else {
            return Ok(Support::NotApplicable);
        };
        let Support::Supported(slot) = self.read_number(Operation::Filter).await? else {
            return Ok(Support::NotApplicable);
        };
        // slots are 1-indexed
        let index = slot as i64 - 1;
        Ok(Support::Supported(
            usize::try_from(index).ok().and_then(|i| names.get(i).cloned()),
        ))
    }

    pub async fn set_filter(
        &mut self,
        selector: impl Into<FilterSelector>,
    ) -> Result<Support<()>, CameraError> {
        let Support::Supported(names) = self.filters().await? else {
            return Ok(Support::NotApplicable);
        };
        let index = match selector.into() {
            FilterSelector::Index(i) if i < names.len() => i,
            FilterSelector::Index(i) => {
                return Err(CameraError::InvalidFilter(format!(
                    "index {} out of range for {} filters",
                    i,
                    names.len()
                )))
            }
            FilterSelector::Name(name) => names
                .iter()
                .position(|n| *n == name)
                .ok_or_else(|| CameraError::InvalidFilter(format!("'{}' not in {:?}", name, names)))?,
        };
        info!(filter = %names[index], slot = index + 1, "Selecting filter");
        self.write_numbers(&[(Operation::Filter, (index + 1) as f64)]).await
    }

    pub async fn observer(&self) -> Result<Support<String>, CameraError> {
        self.read_text(Operation::Observer).await
    }

    pub async fn set_observer(&mut self, observer: &str) -> Result<Support<()>, CameraError> {
        self.write_text(Operation::Observer, observer).await
    }

    pub async fn object(&self) -> Result<Support<String>, CameraError> {
        self.read_text(Operation::Object).await
    }

    pub async fn set_object(&mut self, object: &str) -> Result<Support<()>, CameraError> {
        self.write_text(Operation::Object, object).await
    }

    pub async fn gain(&self) -> Result<Support<f64>, CameraError> {
        self.read_number(Operation::Gain).await
    }

    /// Select the profile's filter wheel type and connect it
    pub async fn enable_filter_wheel(&mut self) -> Result<Support<()>, CameraError> {
        let Some(setup) = self.profile.filter_wheel.clone() else {
            return Ok(Support::NotApplicable);
        };
        if !self.profile.supports(Operation::FilterWheel) {
            return Ok(Support::NotApplicable);
        }
        self.select(Operation::FilterWheelType, &setup.type_label).await?;
        self.select(Operation::FilterWheel, "Connect").await?;
        info!(wheel = %setup.type_label, "Filter wheel enabled");
        Ok(Support::Supported(()))
    }

    pub async fn disable_filter_wheel(&mut self) -> Result<Support<()>, CameraError> {
        if self.profile.filter_wheel.is_none() {
            return Ok(Support::NotApplicable);
        }
        self.select(Operation::FilterWheel, "Disconnect").await
    }

    /// 1x1 binning and the full detector
    pub async fn default_config(&mut self) -> Result<Support<()>, CameraError> {
        let Some((max_x, max_y)) = self.ccd_max().await? else {
            return Ok(Support::NotApplicable);
        };
        self.set_binning(Binning::new(1, 1)).await?;
        self.set_frame(Frame::new(0, 0, max_x as i64, max_y as i64))
            .await
    }

    /// Square WFS readout: fixed binning, sub-frame `max_y` wide
    ///
    /// The origin is given in binned pixels while the size is unbinned, which
    /// is how the driver interprets the CCD_FRAME vector.
    pub async fn wfs_config(&mut self) -> Result<Support<()>, CameraError> {
        let Some(setup) = self.profile.wfs.clone() else {
            return Ok(Support::NotApplicable);
        };
        let Some((max_x, max_y)) = self.ccd_max().await? else {
            return Ok(Support::NotApplicable);
        };
        self.set_binning(Binning::new(setup.binning, setup.binning)).await?;
        let x = ((max_x - max_y) / 6.0) as i64;
        self.set_frame(Frame::new(x, 0, max_y as i64, max_y as i64))
            .await
    }

    /// Set the WFS observer header, then configure the WFS readout
    pub async fn wfs_setup(&mut self) -> Result<Support<()>, CameraError> {
        let Some(setup) = self.profile.wfs.clone() else {
            return Ok(Support::NotApplicable);
        };
        self.drain().await?;
        if let Some(observer) = &setup.observer {
            self.set_observer(observer).await?;
        }
        self.wfs_config().await
    }

    /// Header fields stamped into images that lack them
    async fn header_defaults(&self) -> Result<Vec<(String, HeaderValue)>, CameraError> {
        let filter = match self.filter().await? {
            Support::Supported(Some(name)) => name,
            _ => NO_FILTER.to_string(),
        };
        Ok(vec![
            ("FILTER".to_string(), HeaderValue::from(filter.as_str())),
            ("CAMERA".to_string(), HeaderValue::from(self.profile.camera_name.as_str())),
        ])
    }

    /// Take one exposure
    pub async fn expose(&mut self, request: &ExposureRequest) -> Result<ExposureOutcome, CameraError> {
        self.run_exposure(request, None).await
    }

    /// Take one exposure that `cancel` can abort
    pub async fn expose_with_cancel(
        &mut self,
        request: &ExposureRequest,
        cancel: &ExposureCancel,
    ) -> Result<ExposureOutcome, CameraError> {
        self.run_exposure(request, Some(cancel)).await
    }

    async fn run_exposure(
        &mut self,
        request: &ExposureRequest,
        cancel: Option<&ExposureCancel>,
    ) -> Result<ExposureOutcome, CameraError> {
        request.validate(&self.profile)?;
        let defaults = self.header_defaults().await?;
        let command = VectorCommand::new(&mut self.bus, &self.profile.driver, self.observer.as_ref());
        let mut session = ExposureSession::new(command, &self.profile, &self.config, self.decoder.as_ref())
            .with_defaults(defaults);
        if let Some(cancel) = cancel {
            session = session.with_cancel(cancel);
        }
        session.run(request).await
    }
}
