//! Conversion between raw Modbus payloads and engineering values.
//!
//! 32-bit values span two consecutive registers, high word first, each word
//! big-endian.  A noisy serial link must never take the control loop down,
//! so malformed payloads decode to zero with a warning instead of an error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
}

impl DataType {
    /// Number of 16-bit words (or bits) to request for one value.
    pub fn word_count(self) -> u16 {
        match self {
            Self::Int32 | Self::Uint32 | Self::Float32 => 2,
            Self::Boolean | Self::Int16 | Self::Uint16 => 1,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int16 | Self::Uint16 | Self::Int32 | Self::Uint32)
    }
}

impl FromStr for DataType {
    type Err = String;

    /// Accepts the canonical names plus the short legacy aliases
    /// (`bool`, `int`, `float`) still found in older register tables.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(Self::Boolean),
            "int16" | "int" => Ok(Self::Int16),
            "uint16" => Ok(Self::Uint16),
            "int32" => Ok(Self::Int32),
            "uint32" => Ok(Self::Uint32),
            "float32" | "float" => Ok(Self::Float32),
            other => Err(format!("unknown data type '{other}'")),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Boolean => "boolean",
            Self::Int16 => "int16",
            Self::Uint16 => "uint16",
            Self::Int32 => "int32",
            Self::Uint32 => "uint32",
            Self::Float32 => "float32",
        };
        f.write_str(s)
    }
}

/// Payload of one read, as returned by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Raw {
    Bits(Vec<bool>),
    Words(Vec<u16>),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RegisterValue {
    Bool(bool),
    Int(i64),
    Float(f32),
}

impl RegisterValue {
    pub fn zero(data_type: DataType) -> Self {
        match data_type {
            DataType::Boolean => Self::Bool(false),
            DataType::Float32 => Self::Float(0.0),
            _ => Self::Int(0),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::Bool(b) => f64::from(u8::from(b)),
            Self::Int(i) => i as f64,
            Self::Float(f) => f64::from(f),
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", if *b { "ON" } else { "OFF" }),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v:.2}"),
        }
    }
}

fn join_words(hi: u16, lo: u16) -> u32 {
    (u32::from(hi) << 16) | u32::from(lo)
}

fn split_words(v: u32) -> Vec<u16> {
    vec![(v >> 16) as u16, (v & 0xFFFF) as u16]
}

/// Decode a raw payload into a value of `data_type`.
pub fn decode(raw: &Raw, data_type: DataType) -> RegisterValue {
    let decoded = match (data_type, raw) {
        (DataType::Boolean, Raw::Bits(bits)) => bits.first().map(|b| RegisterValue::Bool(*b)),
        (DataType::Boolean, Raw::Words(words)) => {
            words.first().map(|w| RegisterValue::Bool(*w != 0))
        }
        (DataType::Float32, Raw::Words(w)) if w.len() >= 2 => {
            Some(RegisterValue::Float(f32::from_bits(join_words(w[0], w[1]))))
        }
        (DataType::Int32, Raw::Words(w)) if w.len() >= 2 => {
            Some(RegisterValue::Int(i64::from(join_words(w[0], w[1]) as i32)))
        }
        (DataType::Uint32, Raw::Words(w)) if w.len() >= 2 => {
            Some(RegisterValue::Int(i64::from(join_words(w[0], w[1]))))
        }
        (DataType::Int16, Raw::Words(w)) => w.first().map(|v| RegisterValue::Int(i64::from(*v as i16))),
        (DataType::Uint16, Raw::Words(w)) => w.first().map(|v| RegisterValue::Int(i64::from(*v))),
        _ => None,
    };

    decoded.unwrap_or_else(|| {
        warn!(%data_type, ?raw, "malformed register payload, using zero");
        RegisterValue::zero(data_type)
    })
}

/// Encode an engineering value into register words for `data_type`.
/// Integer types round to the nearest integer and saturate at the type bounds.
pub fn encode(value: f64, data_type: DataType) -> Vec<u16> {
    if data_type.is_integer() && !value.is_finite() {
        warn!(%data_type, value, "cannot encode non-finite value, using zero");
        return vec![0; data_type.word_count() as usize];
    }

    match data_type {
        DataType::Boolean => vec![u16::from(value != 0.0)],
        DataType::Int16 => vec![value.round() as i16 as u16],
        DataType::Uint16 => vec![value.round() as u16],
        DataType::Int32 => split_words(value.round() as i32 as u32),
        DataType::Uint32 => split_words(value.round() as u32),
        DataType::Float32 => split_words((value as f32).to_bits()),
    }
}

fn effective_scale(scale: f64) -> f64 {
    if scale.is_finite() && scale != 0.0 {
        scale
    } else {
        1.0
    }
}

/// Engineering value of a decoded reading.  The scale factor applies to
/// integer registers only; floats already carry engineering units.
pub fn apply_scale(value: RegisterValue, scale: f64) -> f64 {
    match value {
        RegisterValue::Int(i) => i as f64 * effective_scale(scale),
        other => other.as_f64(),
    }
}

/// Inverse of [`apply_scale`] for a value about to be written.
pub fn remove_scale(value: f64, data_type: DataType, scale: f64) -> f64 {
    if data_type.is_integer() {
        value / effective_scale(scale)
    } else {
        value
    }
}

// ===========================================================================
// Tests
// ===========================================================================
