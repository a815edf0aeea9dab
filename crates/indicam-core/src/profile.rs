//! Capability profiles - per camera-model tables of property bindings
//!
//! A profile maps logical camera operations onto the property vectors and
//! elements a particular driver exposes, declares legal ranges, and lists
//! the frame-type labels the model accepts. Models are values, not types:
//! the built-in set mirrors the cameras in service, and further models can
//! be loaded from a TOML profile index.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::Support;

/// Hard upper bound on a single exposure, seconds
pub const MAX_EXPOSURE_SECS: f64 = 3600.0;

/// Names of the built-in profiles
pub const BUILTIN_MODELS: &[&str] = &["generic", "sim", "asi", "ratcam", "matcam", "f9wfs"];

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to read profile index: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse profile index: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize profile index: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Profile '{model}' does not bind required operation {operation:?}")]
    MissingRequired { model: String, operation: Operation },
    #[error("Profile '{0}' declares no frame types")]
    NoFrameTypes(String),
    #[error("Unknown camera model: {0}")]
    UnknownModel(String),
}

/// Logical camera operation a profile can bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Connection,
    Exposure,
    AbortExposure,
    FrameType,
    CcdInfo,
    CcdMaxX,
    CcdMaxY,
    BinningX,
    BinningY,
    FrameX,
    FrameY,
    FrameWidth,
    FrameHeight,
    Temperature,
    CoolerPower,
    Cooling,
    Fan,
    Filter,
    FilterNames,
    FilterWheel,
    FilterWheelType,
    Observer,
    Object,
    Gain,
    Image,
}

/// Operations every profile must bind
pub const REQUIRED_OPERATIONS: &[Operation] =
    &[Operation::Connection, Operation::Exposure, Operation::FrameType];

/// One row of a capability table
///
/// An entry without a vector marks the operation as explicitly unsupported
/// for the model; an operation with no entry at all is unsupported too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEntry {
    pub operation: Operation,
    #[serde(default)]
    pub vector: Option<String>,
    /// Element within the vector; absent when the whole vector is addressed
    #[serde(default)]
    pub element: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl CapabilityEntry {
    pub fn bound(operation: Operation, vector: &str, element: Option<&str>) -> Self {
        Self {
            operation,
            vector: Some(vector.to_string()),
            element: element.map(str::to_string),
            min: None,
            max: None,
        }
    }

    pub fn unsupported(operation: Operation) -> Self {
        Self {
            operation,
            vector: None,
            element: None,
            min: None,
            max: None,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }
}

/// A resolved (vector, element) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding<'a> {
    pub vector: &'a str,
    pub element: Option<&'a str>,
}

/// Filter wheel that must be enabled as part of opening the camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterWheelSetup {
    /// Label of the CFW type switch to select (e.g. "CFW-402")
    pub type_label: String,
}

/// Wavefront-sensor readout configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WfsSetup {
    /// Binning factor applied on both axes
    #[serde(default = "default_wfs_binning")]
    pub binning: u32,
    /// Observer header written by the WFS setup step
    #[serde(default)]
    pub observer: Option<String>,
}

fn default_wfs_binning() -> u32 {
    3
}

fn default_frame_types() -> Vec<String> {
    ["Light", "Bias", "Dark", "Flat"].iter().map(|s| s.to_string()).collect()
}

/// Capability table for one camera model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    /// Model identifier (e.g. "matcam")
    pub model: String,
    /// Device name the driver registers on the property server
    pub driver: String,
    /// Camera identifier stamped into image headers
    pub camera_name: String,
    /// Observer header set when the camera is opened
    #[serde(default)]
    pub observer: Option<String>,
    /// Legal exposure frame-type labels, in display order
    #[serde(default = "default_frame_types")]
    pub frame_types: Vec<String>,
    #[serde(default, rename = "capability")]
    pub capabilities: Vec<CapabilityEntry>,
    #[serde(default)]
    pub filter_wheel: Option<FilterWheelSetup>,
    #[serde(default)]
    pub wfs: Option<WfsSetup>,
}

impl CapabilityProfile {
    /// Full CCD capability table as exposed by standard INDI CCD drivers
    pub fn standard(model: &str, driver: &str, camera_name: &str) -> Self {
        use Operation::*;
        let capabilities = vec![
            CapabilityEntry::bound(Connection, "CONNECTION", Some("CONNECT")),
            CapabilityEntry::bound(Exposure, "CCD_EXPOSURE", Some("CCD_EXPOSURE_VALUE"))
                .with_range(0.0, MAX_EXPOSURE_SECS),
            CapabilityEntry::bound(AbortExposure, "CCD_ABORT_EXPOSURE", Some("ABORT")),
            CapabilityEntry::bound(FrameType, "CCD_FRAME_TYPE", None),
            CapabilityEntry::bound(CcdInfo, "CCD_INFO", None),
            CapabilityEntry::bound(CcdMaxX, "CCD_INFO", Some("CCD_MAX_X")),
            CapabilityEntry::bound(CcdMaxY, "CCD_INFO", Some("CCD_MAX_Y")),
            CapabilityEntry::bound(BinningX, "CCD_BINNING", Some("HOR_BIN")),
            CapabilityEntry::bound(BinningY, "CCD_BINNING", Some("VER_BIN")),
            CapabilityEntry::bound(FrameX, "CCD_FRAME", Some("X")),
            CapabilityEntry::bound(FrameY, "CCD_FRAME", Some("Y")),
            CapabilityEntry::bound(FrameWidth, "CCD_FRAME", Some("WIDTH")),
            CapabilityEntry::bound(FrameHeight, "CCD_FRAME", Some("HEIGHT")),
            CapabilityEntry::bound(Temperature, "CCD_TEMPERATURE", Some("CCD_TEMPERATURE_VALUE")),
            CapabilityEntry::bound(CoolerPower, "CCD_COOLER_POWER", Some("CCD_COOLER_VALUE")),
            CapabilityEntry::bound(Cooling, "CCD_COOLER", Some("COOLER_ON")),
            CapabilityEntry::bound(Fan, "CCD_FAN", Some("FAN_ON")),
            CapabilityEntry::bound(Filter, "FILTER_SLOT", Some("FILTER_SLOT_VALUE")),
            CapabilityEntry::bound(FilterNames, "FILTER_NAME", None),
            CapabilityEntry::bound(Observer, "FITS_HEADER", Some("FITS_OBSERVER")),
            CapabilityEntry::bound(Object, "FITS_HEADER", Some("FITS_OBJECT")),
            CapabilityEntry::bound(Image, "CCD1", Some("CCD1")),
        ];

        Self {
            model: model.to_string(),
            driver: driver.to_string(),
            camera_name: camera_name.to_string(),
            observer: None,
            frame_types: default_frame_types(),
            capabilities,
            filter_wheel: None,
            wfs: None,
        }
    }

    /// Look up a built-in model by name (case-insensitive)
    pub fn builtin(model: &str) -> Option<Self> {
        use Operation::*;
        let profile = match model.to_ascii_lowercase().as_str() {
            "generic" => Self::standard("generic", "CCD Simulator", "MMTO Default"),
            "sim" => Self::standard("sim", "CCD Simulator", "SimCam")
                .with_observer("INDI CCD Simulator")
                .without(CoolerPower),
            "asi" => Self::standard("asi", "ASI CCD", "ZWO ASI Camera")
                .without(Filter)
                .without(FilterNames)
                .with(CapabilityEntry::bound(Gain, "CCD_CONTROLS", Some("Gain"))),
            "ratcam" => Self::standard("ratcam", "SBIG CCD", "RATcam")
                .with_observer("Rotator Alignment Telescope")
                .with_frame_types(&["Light"])
                .without(Temperature)
                .without(CoolerPower)
                .without(Cooling)
                .without(Fan)
                .without(Filter)
                .without(FilterNames)
                .without(FilterWheel),
            "matcam" => Self::standard("matcam", "SBIG CCD", "MATcam")
                .with_observer("Mount Alignment Telescope")
                .with(CapabilityEntry::bound(FilterWheel, "CFW_CONNECTION", None))
                .with(CapabilityEntry::bound(FilterWheelType, "CFW_TYPE", None))
                .with_filter_wheel("CFW-402"),
            "f9wfs" => {
                let mut profile = Self::standard("f9wfs", "SBIG CCD", "F/9 WFS")
                    .without(Filter)
                    .without(FilterNames)
                    // fan control is disabled on this camera's driver
                    .without(Fan);
                profile.wfs = Some(WfsSetup {
                    binning: default_wfs_binning(),
                    observer: Some("F/9 WFS".to_string()),
                });
                profile
            }
            _ => return None,
        };
        Some(profile)
    }

    /// Replace (or add) the entry for an operation
    pub fn with(mut self, entry: CapabilityEntry) -> Self {
        self.capabilities.retain(|e| e.operation != entry.operation);
        self.capabilities.push(entry);
        self
    }

    /// Mark an operation unsupported
    pub fn without(self, operation: Operation) -> Self {
        self.with(CapabilityEntry::unsupported(operation))
    }

    pub fn with_observer(mut self, observer: &str) -> Self {
        self.observer = Some(observer.to_string());
        self
    }

    pub fn with_frame_types(mut self, labels: &[&str]) -> Self {
        self.frame_types = labels.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_filter_wheel(mut self, type_label: &str) -> Self {
        self.filter_wheel = Some(FilterWheelSetup {
            type_label: type_label.to_string(),
        });
        self
    }

    fn entry(&self, operation: Operation) -> Option<&CapabilityEntry> {
        self.capabilities.iter().find(|e| e.operation == operation)
    }

    /// Resolve an operation to its vector and element
    pub fn resolve(&self, operation: Operation) -> Support<Binding<'_>> {
        match self.entry(operation) {
            Some(CapabilityEntry {
                vector: Some(vector),
                element,
                ..
            }) => Support::Supported(Binding {
                vector,
                element: element.as_deref(),
            }),
            _ => Support::NotApplicable,
        }
    }

    pub fn supports(&self, operation: Operation) -> bool {
        self.resolve(operation).is_supported()
    }

    /// Declared (min, max) for a bounded numeric operation
    pub fn range_of(&self, operation: Operation) -> Option<(f64, f64)> {
        let entry = self.entry(operation)?;
        entry.vector.as_ref()?;
        Some((entry.min?, entry.max?))
    }

    pub fn frame_types(&self) -> &[String] {
        &self.frame_types
    }

    pub fn accepts_frame_type(&self, label: &str) -> bool {
        self.frame_types.iter().any(|t| t == label)
    }

    /// Check the invariants every profile must satisfy
    pub fn validate(&self) -> Result<(), ProfileError> {
        for &operation in REQUIRED_OPERATIONS {
            if !self.supports(operation) {
                return Err(ProfileError::MissingRequired {
                    model: self.model.clone(),
                    operation,
                });
            }
        }
        if self.frame_types.is_empty() {
            return Err(ProfileError::NoFrameTypes(self.model.clone()));
        }
        Ok(())
    }
}

/// A set of profiles loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileIndex {
    /// Version of the profile index format
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub profile: Vec<CapabilityProfile>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for ProfileIndex {
    fn default() -> Self {
        Self {
            version: default_version(),
            profile: Vec::new(),
        }
    }
}

impl ProfileIndex {
    /// Load profile index from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load profile index from a TOML string, validating every profile
    pub fn from_toml(content: &str) -> Result<Self, ProfileError> {
        let index: ProfileIndex = toml::from_str(content)?;
        for profile in &index.profile {
            profile.validate()?;
        }
        Ok(index)
    }

    /// Save the index to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ProfileError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn add(&mut self, profile: CapabilityProfile) {
        self.profile.retain(|p| !p.model.eq_ignore_ascii_case(&profile.model));
        self.profile.push(profile);
    }

    /// Find an indexed profile by model (case-insensitive)
    pub fn find(&self, model: &str) -> Option<&CapabilityProfile> {
        self.profile.iter().find(|p| p.model.eq_ignore_ascii_case(model))
    }

    /// Resolve a model, preferring the index over the built-in set
    pub fn resolve(&self, model: &str) -> Result<CapabilityProfile, ProfileError> {
        if let Some(profile) = self.find(model) {
            return Ok(profile.clone());
        }
        let profile = CapabilityProfile::builtin(model)
            .ok_or_else(|| ProfileError::UnknownModel(model.to_string()))?;
        tracing::debug!(model = %model, "Using built-in profile");
        Ok(profile)
    }

    /// Indexed model names followed by built-ins not overridden by the index
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.profile.iter().map(|p| p.model.clone()).collect();
        for builtin in BUILTIN_MODELS {
            if self.find(builtin).is_none() {
                models.push(builtin.to_string());
            }
        }
        models
    }
}
