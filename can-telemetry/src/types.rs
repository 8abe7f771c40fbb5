//! Core types for the telemetry store
//!
//! This module defines the value model shared by every stage of the pipeline:
//! the closed set of numeric sample types a channel can hold, the key that
//! identifies a channel, and the library-wide error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Bus port identifier (subject ID or service ID)
pub type PortId = u16;

/// Bus node identifier (7 bits significant)
pub type NodeId = u8;

/// Errors that can occur while ingesting, storing or exporting telemetry
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Malformed frame at offset {offset}: declared payload length {declared_len} exceeds 64 bytes")]
    MalformedFrame { offset: usize, declared_len: usize },

    #[error("Schema error on port {port_id}: {reason}")]
    Schema { port_id: PortId, reason: String },

    #[error("Type mismatch on channel {key}: channel holds {expected}, got {found}")]
    TypeMismatch {
        key: ChannelKey,
        expected: ValueType,
        found: ValueType,
    },

    #[error("Channel {0} has no data points")]
    EmptyChannel(ChannelKey),

    #[error("Failed to parse session identifier: {0}")]
    SessionIdParse(String),

    #[error("Reassembly error at offset {offset}: {reason}")]
    Reassembly { offset: usize, reason: String },

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(f64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load port schema: {0}")]
    SchemaConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// The value type a channel is fixed to at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    F32,
    F64,
    U8,
    U16,
    U32,
    Bool,
}

impl ValueType {
    /// True for the unsigned integer types
    pub fn is_integral(&self) -> bool {
        matches!(self, ValueType::U8 | ValueType::U16 | ValueType::U32)
    }

    /// True for the floating point types
    pub fn is_float(&self) -> bool {
        matches!(self, ValueType::F32 | ValueType::F64)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::U8 => "u8",
            ValueType::U16 => "u16",
            ValueType::U32 => "u32",
            ValueType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A single numeric sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    F32(f32),
    F64(f64),
    U8(u8),
    U16(u16),
    U32(u32),
    Bool(bool),
}

impl Value {
    /// The type tag of this value
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::U8(_) => ValueType::U8,
            Value::U16(_) => ValueType::U16,
            Value::U32(_) => ValueType::U32,
            Value::Bool(_) => ValueType::Bool,
        }
    }

    /// Widen to f64 (booleans map to 0.0/1.0)
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::F32(v) => *v as f64,
            Value::F64(v) => *v,
            Value::U8(v) => *v as f64,
            Value::U16(v) => *v as f64,
            Value::U32(v) => *v as f64,
            Value::Bool(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", if *v { "true" } else { "false" }),
        }
    }
}

/// One timestamped sample. `time` is in microseconds since session start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub time: f64,
    pub value: Value,
}

impl DataPoint {
    pub fn new(time: f64, value: Value) -> Self {
        Self { time, value }
    }
}

/// Identifies one channel: a measurement/field pair within one session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Session identifier, e.g. `CAN_2024-11-20(142000)`
    pub session_id: String,
    /// Measurement name (line-protocol measurement)
    pub measurement: String,
    /// Field name, namespaced as `<MessageName>.<fieldName>`
    pub field: String,
}

impl ChannelKey {
    pub fn new(
        session_id: impl Into<String>,
        measurement: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            measurement: measurement.into(),
            field: field.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.session_id, self.measurement, self.field)
    }
}
