//! Port schema table
//!
//! Maps port IDs to fixed message layouts. Built once at startup (from the
//! built-in table and/or TOML files) and shared read-only between ingest
//! workers.

use crate::types::{PortId, Result, TelemetryError, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Measurement used when a schema does not name one
pub const DEFAULT_MEASUREMENT: &str = "vcu";

/// Wire type of one field in a message layout
///
/// Layouts are bit-packed, little-endian, without implicit alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    /// One bit
    Bool,
    /// Unsigned integer of 1 to 32 bits
    Uint(u8),
    Float32,
    Float64,
    /// Padding of 1 to 64 bits, skipped
    Void(u8),
}

impl FieldType {
    /// Width of the field on the wire
    pub fn bit_length(&self) -> usize {
        match self {
            FieldType::Bool => 1,
            FieldType::Uint(bits) | FieldType::Void(bits) => *bits as usize,
            FieldType::Float32 => 32,
            FieldType::Float64 => 64,
        }
    }

    /// Channel value type produced by this field (`None` for padding)
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            FieldType::Bool => Some(ValueType::Bool),
            FieldType::Uint(bits) if *bits <= 8 => Some(ValueType::U8),
            FieldType::Uint(bits) if *bits <= 16 => Some(ValueType::U16),
            FieldType::Uint(_) => Some(ValueType::U32),
            FieldType::Float32 => Some(ValueType::F32),
            FieldType::Float64 => Some(ValueType::F64),
            FieldType::Void(_) => None,
        }
    }

    pub fn is_padding(&self) -> bool {
        matches!(self, FieldType::Void(_))
    }
}

impl TryFrom<String> for FieldType {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl std::str::FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let sized = |prefix: &str, max: u8| -> Option<std::result::Result<u8, String>> {
            let digits = s.strip_prefix(prefix)?;
            Some(match digits.parse::<u8>() {
                Ok(bits) if (1..=max).contains(&bits) => Ok(bits),
                _ => Err(format!("invalid bit width in field type '{}'", s)),
            })
        };

        match s {
            "bool" => Ok(FieldType::Bool),
            "float32" => Ok(FieldType::Float32),
            "float64" => Ok(FieldType::Float64),
            _ => {
                if let Some(bits) = sized("uint", 32) {
                    bits.map(FieldType::Uint)
                } else if let Some(bits) = sized("void", 64) {
                    bits.map(FieldType::Void)
                } else {
                    Err(format!("unknown field type '{}'", s))
                }
            }
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Bool => write!(f, "bool"),
            FieldType::Uint(bits) => write!(f, "uint{}", bits),
            FieldType::Float32 => write!(f, "float32"),
            FieldType::Float64 => write!(f, "float64"),
            FieldType::Void(bits) => write!(f, "void{}", bits),
        }
    }
}

impl From<FieldType> for String {
    fn from(t: FieldType) -> Self {
        t.to_string()
    }
}

/// One field of a message layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Field name; absent for padding
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldSchema {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: Some(name.to_string()),
            field_type,
        }
    }

    pub fn padding(bits: u8) -> Self {
        Self {
            name: None,
            field_type: FieldType::Void(bits),
        }
    }
}

/// Layout of the message carried on one port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSchema {
    pub port_id: PortId,
    /// Message name, used as the field namespace (`<name>.<field>`)
    pub name: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
    pub fields: Vec<FieldSchema>,
}

fn default_measurement() -> String {
    DEFAULT_MEASUREMENT.to_string()
}

impl MessageSchema {
    pub fn new(port_id: PortId, name: &str, fields: Vec<FieldSchema>) -> Self {
        Self {
            port_id,
            name: name.to_string(),
            measurement: default_measurement(),
            fields,
        }
    }

    /// Minimum payload size in bits
    pub fn bit_length(&self) -> usize {
        self.fields.iter().map(|f| f.field_type.bit_length()).sum()
    }

    /// Number of value-carrying (non-padding) fields
    pub fn value_field_count(&self) -> usize {
        self.fields
            .iter()
            .filter(|f| !f.field_type.is_padding())
            .count()
    }

    /// Namespaced channel field name
    pub fn qualified_name(&self, field: &str) -> String {
        format!("{}.{}", self.name, field)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            Err(TelemetryError::SchemaConfig(format!(
                "message '{}' on port {}: {}",
                self.name, self.port_id, reason
            )))
        };

        if self.name.is_empty() {
            return invalid("message name is empty".to_string());
        }
        if self.measurement.is_empty() {
            return invalid("measurement is empty".to_string());
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            match (&field.name, field.field_type.is_padding()) {
                (Some(name), false) => {
                    if name.is_empty() {
                        return invalid("field name is empty".to_string());
                    }
                    if !seen.insert(name.as_str()) {
                        return invalid(format!("duplicate field '{}'", name));
                    }
                }
                (None, false) => {
                    return invalid(format!("unnamed {} field", field.field_type));
                }
                (_, true) => {}
            }
        }

        if seen.is_empty() {
            return invalid("no value fields".to_string());
        }
        Ok(())
    }
}

/// TOML document holding message schemas
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    message: Vec<MessageSchema>,
}

/// Immutable-after-build map from port ID to message layout
#[derive(Debug, Clone, Default)]
pub struct PortTable {
    schemas: HashMap<PortId, MessageSchema>,
}

impl PortTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            schemas: HashMap::new(),
        }
    }

    /// Table holding the built-in vehicle control unit messages
    pub fn builtin() -> Self {
        let schemas = super::builtin::vcu_schemas()
            .into_iter()
            .map(|schema| (schema.port_id, schema))
            .collect();
        Self { schemas }
    }

    /// Build a table from a TOML schema document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut table = Self::new();
        table.load_toml_str(content)?;
        Ok(table)
    }

    /// Build a table from a TOML schema file
    pub fn from_toml_file(path: &std::path::Path) -> Result<Self> {
        let mut table = Self::new();
        table.load_toml_file(path)?;
        Ok(table)
    }

    /// Add a message schema. A schema already registered for the same port is replaced.
    pub fn add_schema(&mut self, schema: MessageSchema) -> Result<()> {
        schema.validate()?;
        if let Some(previous) = self.schemas.get(&schema.port_id) {
            log::warn!(
                "Port {} schema '{}' replaced by '{}'",
                schema.port_id,
                previous.name,
                schema.name
            );
        }
        self.schemas.insert(schema.port_id, schema);
        Ok(())
    }

    /// Parse schemas from a TOML document and add them to the table
    ///
    /// ```toml
    /// [[message]]
    /// port_id = 102
    /// name = "INS"
    /// fields = [{ name = "vx", type = "float32" }, { type = "void8" }]
    /// ```
    pub fn load_toml_str(&mut self, content: &str) -> Result<usize> {
        let file: SchemaFile = toml::from_str(content)
            .map_err(|e| TelemetryError::SchemaConfig(e.to_string()))?;
        let count = file.message.len();
        for schema in file.message {
            self.add_schema(schema)?;
        }
        Ok(count)
    }

    /// Load a TOML schema file and add its messages to the table
    pub fn load_toml_file(&mut self, path: &std::path::Path) -> Result<usize> {
        log::info!("Loading port schemas: {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|e| {
            TelemetryError::SchemaConfig(format!("Failed to read {:?}: {}", path, e))
        })?;
        let count = self.load_toml_str(&content)?;
        log::info!("Loaded {} port schemas from {:?}", count, path);
        Ok(count)
    }

    /// Get the schema registered for a port
    pub fn get(&self, port_id: PortId) -> Option<&MessageSchema> {
        self.schemas.get(&port_id)
    }

    /// All registered ports, sorted
    pub fn port_ids(&self) -> Vec<PortId> {
        let mut ids: Vec<PortId> = self.schemas.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Table statistics
    pub fn stats(&self) -> TableStats {
        TableStats {
            num_messages: self.schemas.len(),
            num_fields: self.schemas.values().map(|s| s.value_field_count()).sum(),
        }
    }
}

/// Port table statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Number of registered message layouts
    pub num_messages: usize,
    /// Total number of value fields across all layouts
    pub num_fields: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_parsing() {
        assert_eq!("bool".parse::<FieldType>(), Ok(FieldType::Bool));
        assert_eq!("uint3".parse::<FieldType>(), Ok(FieldType::Uint(3)));
        assert_eq!("uint32".parse::<FieldType>(), Ok(FieldType::Uint(32)));
        assert_eq!("void7".parse::<FieldType>(), Ok(FieldType::Void(7)));
        assert_eq!("float64".parse::<FieldType>(), Ok(FieldType::Float64));
        assert!("uint33".parse::<FieldType>().is_err());
        assert!("uint0".parse::<FieldType>().is_err());
        assert!("int8".parse::<FieldType>().is_err());
    }

    #[test]
    fn test_field_value_types() {
        assert_eq!(FieldType::Uint(3).value_type(), Some(ValueType::U8));
        assert_eq!(FieldType::Uint(12).value_type(), Some(ValueType::U16));
        assert_eq!(FieldType::Uint(32).value_type(), Some(ValueType::U32));
        assert_eq!(FieldType::Void(4).value_type(), None);
    }

    #[test]
    fn test_load_toml_schema() {
        let mut table = PortTable::new();
        let count = table
            .load_toml_str(
                r#"
                [[message]]
                port_id = 300
                name = "Wheel"
                measurement = "sensors"
                fields = [
                    { name = "speed", type = "float32" },
                    { type = "void4" },
                    { name = "slip", type = "bool" },
                ]
            "#,
            )
            .unwrap();

        assert_eq!(count, 1);
        let schema = table.get(300).unwrap();
        assert_eq!(schema.measurement, "sensors");
        assert_eq!(schema.bit_length(), 37);
        assert_eq!(schema.qualified_name("speed"), "Wheel.speed");
        assert_eq!(table.stats().num_fields, 2);
    }

    #[test]
    fn test_rejects_duplicate_field_names() {
        let mut table = PortTable::new();
        let schema = MessageSchema::new(
            1,
            "Dup",
            vec![
                FieldSchema::new("a", FieldType::Bool),
                FieldSchema::new("a", FieldType::Uint(8)),
            ],
        );
        assert!(table.add_schema(schema).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_rejects_unknown_type_in_toml() {
        let mut table = PortTable::new();
        let result = table.load_toml_str(
            r#"
            [[message]]
            port_id = 1
            name = "Bad"
            fields = [{ name = "x", type = "float16" }]
        "#,
        );
        assert!(matches!(result, Err(TelemetryError::SchemaConfig(_))));
    }

    #[test]
    fn test_builtin_table_is_valid() {
        let table = PortTable::builtin();
        assert_eq!(table.port_ids(), vec![8, 10, 13, 102, 111, 113, 114]);
        for port in table.port_ids() {
            table.get(port).unwrap().validate().unwrap();
        }
        assert_eq!(table.get(102).unwrap().bit_length(), 15 * 32);
        assert_eq!(table.get(111).unwrap().bit_length(), 8 + 4 + 64);
        assert_eq!(table.get(114).unwrap().measurement, "vcu");
    }

    #[test]
    fn test_default_measurement() {
        let mut table = PortTable::new();
        table
            .load_toml_str(
                r#"
                [[message]]
                port_id = 2
                name = "Mode"
                fields = [{ name = "command", type = "uint8" }]
            "#,
            )
            .unwrap();
        assert_eq!(table.get(2).unwrap().measurement, DEFAULT_MEASUREMENT);
        assert_eq!(table.port_ids(), vec![2]);
    }
}
