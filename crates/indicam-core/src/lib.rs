//! Indicam Core - Property model, capability profiles, and image types
//!
//! This crate provides the foundational types for indicam:
//! - Property vectors, element updates, and inbound bus events
//! - Capability profiles mapping camera operations to driver properties
//! - FITS image decoding and header stamping

pub mod image;
pub mod profile;
pub mod vector;

pub use image::{is_image_format, DecodeError, FitsDecoder, HeaderCard, HeaderValue, Image, ImageDecoder};
pub use profile::{
    Binding, CapabilityEntry, CapabilityProfile, FilterWheelSetup, Operation, ProfileError,
    ProfileIndex, WfsSetup, BUILTIN_MODELS, MAX_EXPOSURE_SECS,
};
pub use vector::{
    Element, ElementUpdate, ElementValue, InboundEvent, PropertyVector, SwitchState, VectorKind,
    VectorState,
};

/// Result of an operation a camera model may not provide
///
/// `NotApplicable` is a normal outcome, not an error: it reports that the
/// model has no binding for the operation and nothing was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support<T> {
    Supported(T),
    NotApplicable,
}

impl<T> Support<T> {
    pub fn is_supported(&self) -> bool {
        matches!(self, Support::Supported(_))
    }

    pub fn supported(self) -> Option<T> {
        match self {
            Support::Supported(v) => Some(v),
            Support::NotApplicable => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Support<U> {
        match self {
            Support::Supported(v) => Support::Supported(f(v)),
            Support::NotApplicable => Support::NotApplicable,
        }
    }
}

impl<T> From<Option<T>> for Support<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Support::Supported(v),
            None => Support::NotApplicable,
        }
    }
}
