//! Port dispatch
//!
//! Decodes a reassembled transfer payload into named data points using the
//! layout registered for its port. Layouts are bit-packed little-endian: each
//! field starts at the bit right after the previous one and bits are consumed
//! LSB first within every byte.

use crate::schema::{FieldType, MessageSchema, PortTable};
use crate::types::{PortId, Result, TelemetryError, Value};

/// Named values decoded from one transfer
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    pub port_id: PortId,
    /// Line-protocol measurement the fields belong to
    pub measurement: String,
    /// `(<MessageName>.<field>, value)` in layout order
    pub fields: Vec<(String, Value)>,
}

impl PortTable {
    /// Decode a payload received on `port_id`.
    ///
    /// # Returns
    /// * `Ok(Some(message))` for a known port
    /// * `Ok(None)` if no layout is registered for the port
    /// * `Err(Schema)` if the payload is too short for the layout
    pub fn decode(&self, port_id: PortId, payload: &[u8]) -> Result<Option<DecodedMessage>> {
        match self.get(port_id) {
            Some(schema) => MessageDecoder::decode(schema, payload).map(Some),
            None => {
                log::trace!("No schema for port {}", port_id);
                Ok(None)
            }
        }
    }
}

/// Fixed-layout payload decoder
pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode `payload` according to `schema`. Bytes past the layout are ignored.
    pub fn decode(schema: &MessageSchema, payload: &[u8]) -> Result<DecodedMessage> {
        let required_bits = schema.bit_length();
        if required_bits > payload.len() * 8 {
            return Err(TelemetryError::Schema {
                port_id: schema.port_id,
                reason: format!(
                    "{} requires {} bytes but payload has {} bytes",
                    schema.name,
                    required_bits.div_ceil(8),
                    payload.len()
                ),
            });
        }

        let mut fields = Vec::with_capacity(schema.value_field_count());
        let mut bit_offset = 0;

        for field in &schema.fields {
            let width = field.field_type.bit_length();
            let value = Self::decode_field(payload, bit_offset, field.field_type);
            bit_offset += width;

            if let (Some(name), Some(value)) = (&field.name, value) {
                fields.push((schema.qualified_name(name), value));
            }
        }

        Ok(DecodedMessage {
            port_id: schema.port_id,
            measurement: schema.measurement.clone(),
            fields,
        })
    }

    fn decode_field(data: &[u8], start_bit: usize, field_type: FieldType) -> Option<Value> {
        let raw = Self::extract_little_endian(data, start_bit, field_type.bit_length());
        match field_type {
            FieldType::Bool => Some(Value::Bool(raw != 0)),
            FieldType::Uint(bits) if bits <= 8 => Some(Value::U8(raw as u8)),
            FieldType::Uint(bits) if bits <= 16 => Some(Value::U16(raw as u16)),
            FieldType::Uint(_) => Some(Value::U32(raw as u32)),
            FieldType::Float32 => Some(Value::F32(f32::from_bits(raw as u32))),
            FieldType::Float64 => Some(Value::F64(f64::from_bits(raw))),
            FieldType::Void(_) => None,
        }
    }

    /// Extract `length` bits (at most 64) starting at `start_bit`, LSB first.
    ///
    /// Bit `n` of the payload is bit `n % 8` of byte `n / 8`; the first bit
    /// read becomes the least significant bit of the result.
    fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
        let mut result: u64 = 0;

        for i in 0..length {
            let bit_pos = start_bit + i;
            let byte_idx = bit_pos / 8;
            let bit_in_byte = bit_pos % 8;

            if byte_idx < data.len() {
                let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
                result |= (bit_value as u64) << i;
            }
        }

        result
    }
}
