//! Capture frame extractor
//!
//! Pulls fixed-header, variable-payload records out of a byte buffer. Each record
//! on the wire is:
//!
//! ```text
//! timestamp: u64 (BE) | bus_id: u32 (BE, 29 bits significant) | length: u8 | payload[length]
//! ```
//!
//! The extractor keeps no state between calls: the caller owns the cursor.

use crate::types::{Result, TelemetryError};
use byteorder::{BigEndian, ByteOrder};

/// Size of the fixed record header in bytes
pub const HEADER_LEN: usize = 8 + 4 + 1;

/// Largest payload a record may declare
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Mask keeping the 29 significant identifier bits
pub const BUS_ID_MASK: u32 = 0x1FFF_FFFF;

/// One raw bus frame as read from a capture buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Timestamp in source clock units (microseconds)
    pub timestamp: u64,
    /// Bus identifier, masked to 29 bits
    pub bus_id: u32,
    /// Frame payload (at most 64 bytes)
    pub payload: Vec<u8>,
}

/// Outcome of one extraction attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    /// A complete record was read and the cursor advanced past it
    Frame(RawFrame),
    /// Not enough bytes remain for the next record; cursor unchanged
    NeedMoreData,
}

/// Extract the record starting at `*cursor`.
///
/// On success the cursor is advanced by header plus payload length. When the
/// buffer is too short the cursor is left untouched and `NeedMoreData` is
/// returned. A declared payload length above 64 bytes is a format violation
/// and yields `MalformedFrame`, again without moving the cursor.
pub fn extract_frame(buffer: &[u8], cursor: &mut usize) -> Result<Extracted> {
    let start = *cursor;
    let remaining = buffer.len().saturating_sub(start);

    if remaining < HEADER_LEN {
        return Ok(Extracted::NeedMoreData);
    }

    let header = &buffer[start..start + HEADER_LEN];
    let declared_len = header[12] as usize;

    if declared_len > MAX_PAYLOAD_LEN {
        return Err(TelemetryError::MalformedFrame {
            offset: start,
            declared_len,
        });
    }

    if remaining < HEADER_LEN + declared_len {
        return Ok(Extracted::NeedMoreData);
    }

    let timestamp = BigEndian::read_u64(&header[0..8]);
    let bus_id = BigEndian::read_u32(&header[8..12]) & BUS_ID_MASK;
    let payload_start = start + HEADER_LEN;
    let payload = buffer[payload_start..payload_start + declared_len].to_vec();

    *cursor = payload_start + declared_len;

    Ok(Extracted::Frame(RawFrame {
        timestamp,
        bus_id,
        payload,
    }))
}

impl RawFrame {
    pub fn new(timestamp: u64, bus_id: u32, payload: Vec<u8>) -> Self {
        Self {
            timestamp,
            bus_id: bus_id & BUS_ID_MASK,
            payload,
        }
    }

    /// Append this frame in capture wire format to `out`.
    ///
    /// Fails with `InvalidConfig` if the payload is longer than 64 bytes.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(TelemetryError::InvalidConfig(format!(
                "frame payload of {} bytes exceeds {} bytes",
                self.payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        let mut header = [0u8; HEADER_LEN];
        BigEndian::write_u64(&mut header[0..8], self.timestamp);
        BigEndian::write_u32(&mut header[8..12], self.bus_id & BUS_ID_MASK);
        header[12] = self.payload.len() as u8;

        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frames: &[RawFrame]) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            frame.encode_into(&mut out).unwrap();
        }
        out
    }

    #[test]
    fn test_round_trip_masks_identifier() {
        let frame = RawFrame {
            timestamp: 0x0102_0304_0506_0708,
            bus_id: 0xFFFF_FFFF,
            payload: vec![1, 2, 3, 4],
        };
        let bytes = encoded(&[frame]);

        let mut cursor = 0;
        let extracted = extract_frame(&bytes, &mut cursor).unwrap();
        assert_eq!(
            extracted,
            Extracted::Frame(RawFrame {
                timestamp: 0x0102_0304_0506_0708,
                bus_id: 0x1FFF_FFFF,
                payload: vec![1, 2, 3, 4],
            })
        );
        assert_eq!(cursor, bytes.len());
    }

    #[test]
    fn test_header_is_big_endian() {
        let bytes = [
            0, 0, 0, 0, 0, 0, 0x01, 0x00, // timestamp = 256
            0x10, 0x00, 0x66, 0x05, // bus id
            0x01, // length
            0xAA,
        ];
        let mut cursor = 0;
        match extract_frame(&bytes, &mut cursor).unwrap() {
            Extracted::Frame(frame) => {
                assert_eq!(frame.timestamp, 256);
                assert_eq!(frame.bus_id, 0x1000_6605);
                assert_eq!(frame.payload, vec![0xAA]);
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_sequential_extraction_until_need_more_data() {
        let frames = vec![
            RawFrame::new(1, 0x100, vec![0xE0]),
            RawFrame::new(2, 0x200, vec![]),
            RawFrame::new(3, 0x300, vec![7; 64]),
        ];
        let bytes = encoded(&frames);

        let mut cursor = 0;
        let mut out = Vec::new();
        while let Extracted::Frame(frame) = extract_frame(&bytes, &mut cursor).unwrap() {
            out.push(frame);
        }
        assert_eq!(out, frames);
        assert_eq!(cursor, bytes.len());
    }

    #[test]
    fn test_truncated_header_leaves_cursor() {
        let bytes = [0u8; HEADER_LEN - 1];
        let mut cursor = 0;
        assert_eq!(
            extract_frame(&bytes, &mut cursor).unwrap(),
            Extracted::NeedMoreData
        );
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_truncated_payload_leaves_cursor() {
        let mut bytes = encoded(&[RawFrame::new(9, 0x42, vec![1, 2, 3, 4, 5])]);
        bytes.truncate(bytes.len() - 2);
        let mut cursor = 0;
        assert_eq!(
            extract_frame(&bytes, &mut cursor).unwrap(),
            Extracted::NeedMoreData
        );
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_oversized_length_is_malformed() {
        let mut bytes = encoded(&[RawFrame::new(1, 0x100, vec![0xE0])]);
        let bad_offset = bytes.len();
        bytes.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 1, 0, 200]);
        bytes.extend_from_slice(&[0u8; 200]);

        let mut cursor = 0;
        assert!(matches!(
            extract_frame(&bytes, &mut cursor).unwrap(),
            Extracted::Frame(_)
        ));
        assert_eq!(cursor, bad_offset);

        let err = extract_frame(&bytes, &mut cursor).unwrap_err();
        match err {
            TelemetryError::MalformedFrame {
                offset,
                declared_len,
            } => {
                assert_eq!(offset, bad_offset);
                assert_eq!(declared_len, 200);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(cursor, bad_offset);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let frame = RawFrame::new(0, 0, vec![0; 65]);
        let mut out = Vec::new();
        assert!(frame.encode_into(&mut out).is_err());
        assert!(out.is_empty());
    }
}
