//! Property vectors, their elements, and the events that carry them
//!
//! A device exposes named vectors of typed elements. The property bus owns
//! the live copies; this module only describes their shape, the updates a
//! client may request, and the notifications the bus delivers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a property vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorKind {
    Switch,
    Number,
    Text,
    Binary,
    Message,
}

/// Server-reported state of a vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

/// State of a single switch element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn is_on(self) -> bool {
        matches!(self, SwitchState::On)
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchState::On => write!(f, "On"),
            SwitchState::Off => write!(f, "Off"),
        }
    }
}

/// Typed value carried by an element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ElementValue {
    Number(f64),
    Text(String),
    Switch(SwitchState),
    Blob { format: String, data: Vec<u8> },
}

impl ElementValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ElementValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ElementValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_switch(&self) -> Option<SwitchState> {
        match self {
            ElementValue::Switch(s) => Some(*s),
            _ => None,
        }
    }
}

impl fmt::Display for ElementValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementValue::Number(n) => write!(f, "{}", n),
            ElementValue::Text(s) => write!(f, "{:?}", s),
            ElementValue::Switch(s) => write!(f, "{}", s),
            ElementValue::Blob { format, data } => write!(f, "<{} bytes {}>", data.len(), format),
        }
    }
}

/// A single typed value within a vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Protocol name (e.g. "CCD_EXPOSURE_VALUE")
    pub name: String,
    /// Human-readable label (e.g. "Duration (s)")
    pub label: String,
    pub value: ElementValue,
    /// Declared lower bound, Number elements only
    #[serde(default)]
    pub min: Option<f64>,
    /// Declared upper bound, Number elements only
    #[serde(default)]
    pub max: Option<f64>,
}

impl Element {
    pub fn number(name: &str, value: f64) -> Self {
        Self::new(name, ElementValue::Number(value))
    }

    pub fn text(name: &str, value: &str) -> Self {
        Self::new(name, ElementValue::Text(value.to_string()))
    }

    pub fn switch(name: &str, state: SwitchState) -> Self {
        Self::new(name, ElementValue::Switch(state))
    }

    fn new(name: &str, value: ElementValue) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
            value,
            min: None,
            max: None,
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Match by exact name or case-insensitive label
    pub fn matches(&self, key: &str) -> bool {
        self.name == key || self.label.eq_ignore_ascii_case(key)
    }
}

/// Requested new value for one element of a vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementUpdate {
    /// Element name (labels are resolved before an update is built)
    pub element: String,
    pub value: ElementValue,
}

impl ElementUpdate {
    pub fn number(element: &str, value: f64) -> Self {
        Self {
            element: element.to_string(),
            value: ElementValue::Number(value),
        }
    }

    pub fn text(element: &str, value: &str) -> Self {
        Self {
            element: element.to_string(),
            value: ElementValue::Text(value.to_string()),
        }
    }

    pub fn switch(element: &str, state: SwitchState) -> Self {
        Self {
            element: element.to_string(),
            value: ElementValue::Switch(state),
        }
    }
}

/// A named, typed group of elements belonging to one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyVector {
    pub device: String,
    pub name: String,
    pub kind: VectorKind,
    #[serde(default)]
    pub state: VectorState,
    pub elements: Vec<Element>,
}

impl PropertyVector {
    pub fn new(device: &str, name: &str, kind: VectorKind) -> Self {
        Self {
            device: device.to_string(),
            name: name.to_string(),
            kind,
            state: VectorState::Idle,
            elements: Vec::new(),
        }
    }

    pub fn with_element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    /// Check whether this is the vector `name` of `device`
    pub fn is(&self, device: &str, name: &str) -> bool {
        self.device == device && self.name == name
    }

    /// Find an element by name, falling back to label
    pub fn element(&self, key: &str) -> Option<&Element> {
        self.elements
            .iter()
            .find(|e| e.name == key)
            .or_else(|| self.elements.iter().find(|e| e.matches(key)))
    }

    fn element_mut(&mut self, key: &str) -> Option<&mut Element> {
        let idx = self
            .elements
            .iter()
            .position(|e| e.name == key)
            .or_else(|| self.elements.iter().position(|e| e.matches(key)))?;
        self.elements.get_mut(idx)
    }

    pub fn number(&self, key: &str) -> Option<f64> {
        self.element(key).and_then(|e| e.value.as_number())
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.element(key).and_then(|e| e.value.as_text())
    }

    pub fn switch(&self, key: &str) -> Option<SwitchState> {
        self.element(key).and_then(|e| e.value.as_switch())
    }

    /// Element labels in declaration order
    pub fn labels(&self) -> Vec<String> {
        self.elements.iter().map(|e| e.label.clone()).collect()
    }

    /// Build the one-of-many update turning `key` on and every other switch off
    ///
    /// Returns `None` when no element matches `key` or the vector holds no
    /// switches.
    pub fn select_switch(&self, key: &str) -> Option<Vec<ElementUpdate>> {
        if self.kind != VectorKind::Switch {
            return None;
        }
        let selected = self.element(key)?.name.clone();
        Some(
            self.elements
                .iter()
                .map(|e| ElementUpdate::switch(&e.name, SwitchState::from(e.name == selected)))
                .collect(),
        )
    }

    /// Apply updates in place, returning how many elements matched
    pub fn apply(&mut self, updates: &[ElementUpdate]) -> usize {
        let mut applied = 0;
        for update in updates {
            if let Some(element) = self.element_mut(&update.element) {
                element.value = update.value.clone();
                applied += 1;
            }
        }
        applied
    }
}

impl fmt::Display for PropertyVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} [{:?}]", self.device, self.name, self.state)?;
        for e in &self.elements {
            write!(f, " {}={}", e.name, e.value)?;
        }
        Ok(())
    }
}

/// Notification delivered by the property bus, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// New state of a vector (definition or set)
    VectorUpdate(PropertyVector),
    /// Binary element payload, e.g. an image
    BinaryPayload {
        device: String,
        vector: String,
        element: String,
        format: String,
        data: Vec<u8>,
    },
    /// Free-form server message
    Message { device: String, text: String },
}

impl InboundEvent {
    pub fn device(&self) -> &str {
        match self {
            InboundEvent::VectorUpdate(v) => &v.device,
            InboundEvent::BinaryPayload { device, .. } => device,
            InboundEvent::Message { device, .. } => device,
        }
    }

    /// Name of the vector this event concerns, if any
    pub fn vector_name(&self) -> Option<&str> {
        match self {
            InboundEvent::VectorUpdate(v) => Some(&v.name),
            InboundEvent::BinaryPayload { vector, .. } => Some(vector),
            InboundEvent::Message { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_type_vector() -> PropertyVector {
        PropertyVector::new("CCD Simulator", "CCD_FRAME_TYPE", VectorKind::Switch)
            .with_element(Element::switch("FRAME_LIGHT", SwitchState::On).with_label("Light"))
            .with_element(Element::switch("FRAME_BIAS", SwitchState::Off).with_label("Bias"))
            .with_element(Element::switch("FRAME_DARK", SwitchState::Off).with_label("Dark"))
    }

    #[test]
    fn test_element_lookup_by_name_or_label() {
        let v = frame_type_vector();
        assert_eq!(v.element("FRAME_DARK").map(|e| e.label.as_str()), Some("Dark"));
        assert_eq!(v.element("dark").map(|e| e.name.as_str()), Some("FRAME_DARK"));
        assert!(v.element("Flat").is_none());
    }

    #[test]
    fn test_select_switch_is_one_of_many() {
        let v = frame_type_vector();
        let updates = v.select_switch("Bias").unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0], ElementUpdate::switch("FRAME_LIGHT", SwitchState::Off));
        assert_eq!(updates[1], ElementUpdate::switch("FRAME_BIAS", SwitchState::On));
        assert_eq!(updates[2], ElementUpdate::switch("FRAME_DARK", SwitchState::Off));

        assert!(v.select_switch("Flat").is_none());
    }

    #[test]
    fn test_select_switch_rejects_number_vector() {
        let v = PropertyVector::new("cam", "CCD_BINNING", VectorKind::Number)
            .with_element(Element::number("HOR_BIN", 1.0));
        assert!(v.select_switch("HOR_BIN").is_none());
    }

    #[test]
    fn test_apply_updates() {
        let mut v = PropertyVector::new("cam", "CCD_BINNING", VectorKind::Number)
            .with_element(Element::number("HOR_BIN", 1.0).with_label("X"))
            .with_element(Element::number("VER_BIN", 1.0).with_label("Y"));

        let applied = v.apply(&[
            ElementUpdate::number("HOR_BIN", 2.0),
            ElementUpdate::number("Y", 3.0),
            ElementUpdate::number("NOPE", 9.0),
        ]);
        assert_eq!(applied, 2);
        assert_eq!(v.number("HOR_BIN"), Some(2.0));
        assert_eq!(v.number("VER_BIN"), Some(3.0));
    }

    #[test]
    fn test_event_accessors() {
        let event = InboundEvent::BinaryPayload {
            device: "cam".to_string(),
            vector: "CCD1".to_string(),
            element: "CCD1".to_string(),
            format: ".fits".to_string(),
            data: vec![0; 4],
        };
        assert_eq!(event.device(), "cam");
        assert_eq!(event.vector_name(), Some("CCD1"));

        let message = InboundEvent::Message {
            device: "cam".to_string(),
            text: "hello".to_string(),
        };
        assert_eq!(message.vector_name(), None);
    }
}
