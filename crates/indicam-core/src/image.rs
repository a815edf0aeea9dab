//! Image containers and the FITS decoder
//!
//! Images arrive as binary payloads. FITS payloads are split into an ordered
//! list of header cards and the raw data unit; pixel data is carried through
//! untouched so that an image can be re-encoded after header stamping.

use std::fmt;
use std::path::Path;
use thiserror::Error;

const CARD_LEN: usize = 80;
const BLOCK_LEN: usize = 2880;
const KEY_LEN: usize = 8;
/// Largest NAXIS a FITS header may declare
const MAX_AXES: i64 = 999;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("Payload is not FITS: first card is not SIMPLE")]
    NotFits,
    #[error("Header ends without an END card")]
    MissingEnd,
    #[error("Malformed header card {index}: {card}")]
    InvalidCard { index: usize, card: String },
    #[error("Invalid data dimensions: {0}")]
    InvalidDimensions(String),
    #[error("Data unit truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("Failed to write image: {0}")]
    IoError(#[from] std::io::Error),
}

/// Whether a binary format tag names an image this crate can decode
pub fn is_image_format(format: &str) -> bool {
    matches!(
        format.trim_start_matches('.').to_ascii_lowercase().as_str(),
        "fits" | "fit" | "fts"
    )
}

/// Value of a header card
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Text(String),
    Logical(bool),
    Integer(i64),
    Float(f64),
    /// Free text of a COMMENT/HISTORY/blank card
    Commentary(String),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Float(f) => Some(*f),
            HeaderValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    fn parse(raw: &str) -> Option<(HeaderValue, Option<String>)> {
        let raw = raw.trim_start();
        if let Some(rest) = raw.strip_prefix('\'') {
            // Quoted string, '' escapes a quote
            let mut text = String::new();
            let mut chars = rest.char_indices().peekable();
            let mut end = None;
            while let Some((i, c)) = chars.next() {
                if c == '\'' {
                    if matches!(chars.peek(), Some((_, '\''))) {
                        text.push('\'');
                        chars.next();
                    } else {
                        end = Some(i + 1);
                        break;
                    }
                } else {
                    text.push(c);
                }
            }
            let tail = &rest[end?..];
            let comment = tail.split_once('/').map(|(_, c)| c.trim().to_string());
            return Some((HeaderValue::Text(text.trim_end().to_string()), comment));
        }

        let (value, comment) = match raw.split_once('/') {
            Some((v, c)) => (v.trim(), Some(c.trim().to_string())),
            None => (raw.trim(), None),
        };
        let value = match value {
            "T" => HeaderValue::Logical(true),
            "F" => HeaderValue::Logical(false),
            v => {
                if let Ok(i) = v.parse::<i64>() {
                    HeaderValue::Integer(i)
                } else if let Ok(f) = v.replace(['D', 'd'], "E").parse::<f64>() {
                    HeaderValue::Float(f)
                } else {
                    return None;
                }
            }
        };
        Some((value, comment))
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            HeaderValue::Logical(b) => write!(f, "{}", if *b { "T" } else { "F" }),
            HeaderValue::Integer(i) => write!(f, "{}", i),
            HeaderValue::Float(v) => write!(f, "{:E}", v),
            HeaderValue::Commentary(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Text(s.to_string())
    }
}

impl From<i64> for HeaderValue {
    fn from(i: i64) -> Self {
        HeaderValue::Integer(i)
    }
}

impl From<f64> for HeaderValue {
    fn from(f: f64) -> Self {
        HeaderValue::Float(f)
    }
}

impl From<bool> for HeaderValue {
    fn from(b: bool) -> Self {
        HeaderValue::Logical(b)
    }
}

/// One 80-column header record
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderCard {
    pub key: String,
    pub value: HeaderValue,
    pub comment: Option<String>,
}

impl HeaderCard {
    fn encode(&self) -> String {
        let mut card = match &self.value {
            HeaderValue::Commentary(text) => format!("{:<8}{}", self.key, text),
            HeaderValue::Text(_) => format!("{:<8}= {:<20}", self.key, self.value.to_string()),
            value => format!("{:<8}= {:>20}", self.key, value.to_string()),
        };
        if let Some(comment) = &self.comment {
            card.push_str(" / ");
            card.push_str(comment);
        }
        let mut card: String = card.chars().filter(|c| c.is_ascii()).take(CARD_LEN).collect();
        while card.len() < CARD_LEN {
            card.push(' ');
        }
        card
    }
}

/// A decoded image: ordered header cards plus the raw data unit
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Format tag the payload arrived with (e.g. ".fits")
    pub format: String,
    pub cards: Vec<HeaderCard>,
    /// Data unit bytes, without block padding
    pub data: Vec<u8>,
}

impl Image {
    /// Zero-filled 16-bit image, used by simulators and tests
    pub fn blank(width: usize, height: usize) -> Self {
        let mut image = Self {
            format: ".fits".to_string(),
            cards: Vec::new(),
            data: vec![0; width * height * 2],
        };
        image.set("SIMPLE", true);
        image.set("BITPIX", 16i64);
        image.set("NAXIS", 2i64);
        image.set("NAXIS1", width as i64);
        image.set("NAXIS2", height as i64);
        image
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.cards
            .iter()
            .find(|c| c.key.eq_ignore_ascii_case(key))
            .map(|c| &c.value)
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.header(key).is_some()
    }

    /// Set a header, replacing any existing card with that key
    pub fn set(&mut self, key: &str, value: impl Into<HeaderValue>) {
        let key = key.to_ascii_uppercase();
        let value = value.into();
        match self.cards.iter_mut().find(|c| c.key == key) {
            Some(card) => card.value = value,
            None => self.cards.push(HeaderCard {
                key,
                value,
                comment: None,
            }),
        }
    }

    /// Set a header only when it is absent; returns whether it was added
    pub fn set_default(&mut self, key: &str, value: impl Into<HeaderValue>) -> bool {
        if self.has_header(key) {
            return false;
        }
        self.set(key, value);
        true
    }

    /// Expected data unit length from BITPIX and NAXISn
    pub fn data_len(&self) -> Result<usize, DecodeError> {
        let bitpix = self.header("BITPIX").and_then(HeaderValue::as_i64).unwrap_or(0);
        let naxis = self.header("NAXIS").and_then(HeaderValue::as_i64).unwrap_or(0);
        if naxis <= 0 {
            return Ok(0);
        }
        if naxis > MAX_AXES {
            return Err(DecodeError::InvalidDimensions(format!("NAXIS = {}", naxis)));
        }
        let pixels = (1..=naxis).try_fold(1i64, |acc, n| {
            let key = format!("NAXIS{}", n);
            let len = self.header(&key).and_then(HeaderValue::as_i64).unwrap_or(0);
            if len < 0 {
                return Err(DecodeError::InvalidDimensions(format!("{} = {}", key, len)));
            }
            acc.checked_mul(len)
                .ok_or_else(|| DecodeError::InvalidDimensions(format!("{} overflows", key)))
        })?;
        pixels
            .checked_mul(bitpix.abs() / 8)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| DecodeError::InvalidDimensions(format!("BITPIX = {}", bitpix)))
    }

    /// Encode header and data as a FITS byte stream
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_LEN + self.data.len());
        for card in &self.cards {
            out.extend_from_slice(card.encode().as_bytes());
        }
        out.extend_from_slice(format!("{:<80}", "END").as_bytes());
        pad_to_block(&mut out, b' ');
        out.extend_from_slice(&self.data);
        pad_to_block(&mut out, 0);
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<(), DecodeError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }
}

fn pad_to_block(buf: &mut Vec<u8>, fill: u8) {
    let rem = buf.len() % BLOCK_LEN;
    if rem != 0 {
        buf.resize(buf.len() + BLOCK_LEN - rem, fill);
    }
}

/// Converts a binary payload into an [`Image`]
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, format: &str, data: &[u8]) -> Result<Image, DecodeError>;
}

/// Decoder for single-HDU FITS payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct FitsDecoder;

impl FitsDecoder {
    fn parse_card(index: usize, raw: &[u8]) -> Result<Option<HeaderCard>, DecodeError> {
        let invalid = || DecodeError::InvalidCard {
            index,
            card: String::from_utf8_lossy(raw).trim_end().to_string(),
        };
        let text = std::str::from_utf8(raw).map_err(|_| invalid())?;
        let key = text.get(..KEY_LEN).unwrap_or(text).trim_end().to_string();
        let rest = text.get(KEY_LEN..).unwrap_or("");

        if key == "END" {
            return Ok(None);
        }
        if !rest.starts_with("= ") {
            return Ok(Some(HeaderCard {
                key,
                value: HeaderValue::Commentary(rest.trim_end().to_string()),
                comment: None,
            }));
        }
        let (value, comment) = HeaderValue::parse(&rest[2..]).ok_or_else(invalid)?;
        Ok(Some(HeaderCard {
            key,
            value,
            comment,
        }))
    }
}

impl ImageDecoder for FitsDecoder {
    fn decode(&self, format: &str, data: &[u8]) -> Result<Image, DecodeError> {
        if !is_image_format(format) {
            return Err(DecodeError::UnsupportedFormat(format.to_string()));
        }

        let mut cards = Vec::new();
        let mut header_end = None;
        for (index, raw) in data.chunks_exact(CARD_LEN).enumerate() {
            match Self::parse_card(index, raw)? {
                Some(card) => {
                    if index == 0 && card.key != "SIMPLE" {
                        return Err(DecodeError::NotFits);
                    }
                    cards.push(card);
                }
                None => {
                    header_end = Some((index + 1) * CARD_LEN);
                    break;
                }
            }
        }
        let header_end = header_end.ok_or(DecodeError::MissingEnd)?;
        if cards.is_empty() {
            return Err(DecodeError::NotFits);
        }

        let data_start = header_end.div_ceil(BLOCK_LEN) * BLOCK_LEN;
        let mut image = Image {
            format: format.to_string(),
            cards,
            data: Vec::new(),
        };
        let expected = image.data_len()?;
        let available = data.len().saturating_sub(data_start);
        if available < expected {
            return Err(DecodeError::Truncated {
                expected,
                found: available,
            });
        }
        image.data = data[data_start..data_start + expected].to_vec();
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(text: &str) -> Vec<u8> {
        format!("{:<80}", text).into_bytes()
    }

    fn sample_fits() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(card("SIMPLE  =                    T / conforms to FITS"));
        bytes.extend(card("BITPIX  =                   16"));
        bytes.extend(card("NAXIS   =                    2"));
        bytes.extend(card("NAXIS1  =                    4"));
        bytes.extend(card("NAXIS2  =                    2"));
        bytes.extend(card("EXPTIME =              1.5D+00 / seconds"));
        bytes.extend(card("OBSERVER= 'O''Brien '          / who"));
        bytes.extend(card("COMMENT   simulated frame"));
        bytes.extend(card("END"));
        bytes.resize(BLOCK_LEN, b' ');
        bytes.extend((0..16u8).collect::<Vec<_>>());
        bytes.resize(BLOCK_LEN * 2, 0);
        bytes
    }

    #[test]
    fn test_is_image_format() {
        assert!(is_image_format(".fits"));
        assert!(is_image_format("FITS"));
        assert!(is_image_format(".fts"));
        assert!(!is_image_format(".stream"));
        assert!(!is_image_format(".jpg"));
    }

    #[test]
    fn test_decode_headers_and_data() {
        let image = FitsDecoder.decode(".fits", &sample_fits()).unwrap();
        assert_eq!(image.header("SIMPLE"), Some(&HeaderValue::Logical(true)));
        assert_eq!(image.header("naxis1").and_then(HeaderValue::as_i64), Some(4));
        assert_eq!(image.header("EXPTIME").and_then(HeaderValue::as_f64), Some(1.5));
        assert_eq!(image.header("OBSERVER").and_then(HeaderValue::as_text), Some("O'Brien"));
        assert_eq!(image.cards[5].comment.as_deref(), Some("seconds"));
        assert!(matches!(image.header("COMMENT"), Some(HeaderValue::Commentary(_))));
        assert_eq!(image.data, (0..16u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(matches!(
            FitsDecoder.decode(".jpg", &sample_fits()),
            Err(DecodeError::UnsupportedFormat(_))
        ));

        let mut not_fits = card("XTENSION= 'IMAGE   '");
        not_fits.extend(card("END"));
        assert!(matches!(FitsDecoder.decode(".fits", &not_fits), Err(DecodeError::NotFits)));

        let no_end = card("SIMPLE  =                    T");
        assert!(matches!(FitsDecoder.decode(".fits", &no_end), Err(DecodeError::MissingEnd)));

        let truncated = sample_fits()[..BLOCK_LEN + 4].to_vec();
        assert!(matches!(
            FitsDecoder.decode(".fits", &truncated),
            Err(DecodeError::Truncated { expected: 16, found: 4 })
        ));
    }

    #[test]
    fn test_decode_rejects_hostile_dimensions() {
        let header = |naxis: &[&str]| {
            let mut bytes = card("SIMPLE  =                    T");
            bytes.extend(card("BITPIX  =                   16"));
            for text in naxis {
                bytes.extend(card(text));
            }
            bytes.extend(card("END"));
            bytes.resize(BLOCK_LEN, b' ');
            bytes
        };

        let huge = header(&[
            "NAXIS   =                    2",
            "NAXIS1  =           4294967296",
            "NAXIS2  =           4294967296",
        ]);
        assert!(matches!(
            FitsDecoder.decode(".fits", &huge),
            Err(DecodeError::InvalidDimensions(_))
        ));

        let negative = header(&[
            "NAXIS   =                    2",
            "NAXIS1  =                   -4",
            "NAXIS2  =                    2",
        ]);
        assert!(matches!(
            FitsDecoder.decode(".fits", &negative),
            Err(DecodeError::InvalidDimensions(_))
        ));

        let many_axes = header(&["NAXIS   =        1000000000000"]);
        assert!(matches!(
            FitsDecoder.decode(".fits", &many_axes),
            Err(DecodeError::InvalidDimensions(_))
        ));
    }

    #[test]
    fn test_set_default_keeps_existing() {
        let mut image = FitsDecoder.decode(".fits", &sample_fits()).unwrap();
        assert!(!image.set_default("OBSERVER", "someone else"));
        assert!(image.set_default("FILTER", "V"));
        assert_eq!(image.header("OBSERVER").and_then(HeaderValue::as_text), Some("O'Brien"));
        assert_eq!(image.header("FILTER").and_then(HeaderValue::as_text), Some("V"));
    }

    #[test]
    fn test_stamped_image_reencodes() {
        let mut image = Image::blank(3, 3);
        image.set_default("CAMERA", "F/9 WFS");
        let bytes = image.to_bytes();
        assert_eq!(bytes.len() % BLOCK_LEN, 0);

        let decoded = FitsDecoder.decode(".fits", &bytes).unwrap();
        assert_eq!(decoded.header("CAMERA").and_then(HeaderValue::as_text), Some("F/9 WFS"));
        assert_eq!(decoded.data.len(), 18);
    }
}
