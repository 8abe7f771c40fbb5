//! Bus identifier decoding
//!
//! Splits a 29-bit extended identifier into its priority, transfer kind, port
//! and node fields. Message and service identifiers use different layouts:
//!
//! ```text
//! message: | prio 28..26 | svc=0 25 | anon 24 | - | subject 20..8 | - | src 6..0 |
//! service: | prio 28..26 | svc=1 25 | req 24 | - | service 23..14 | dst 13..7 | src 6..0 |
//! ```

use crate::types::{NodeId, PortId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of transfer carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransferKind {
    Message,
    Request,
    Response,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Message => write!(f, "Message"),
            TransferKind::Request => write!(f, "Request"),
            TransferKind::Response => write!(f, "Response"),
        }
    }
}

/// Fields unpacked from a bus identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierFields {
    /// Priority level, 0 (highest) to 7
    pub priority: u8,
    /// True for service (request/response) identifiers
    pub is_service: bool,
    /// True for anonymous messages (never set for services)
    pub is_anonymous: bool,
    pub kind: TransferKind,
    /// Subject ID for messages, service ID for services
    pub port_id: PortId,
    pub source_node_id: NodeId,
    /// Destination node, services only
    pub destination_node_id: Option<NodeId>,
}

impl IdentifierFields {
    /// Decode a bus identifier. Total over `u32`; bits above 28 are ignored.
    pub fn from_bus_id(bus_id: u32) -> Self {
        let priority = ((bus_id >> 26) & 0x7) as u8;
        let is_service = (bus_id >> 25) & 0x1 != 0;
        let bit24 = (bus_id >> 24) & 0x1 != 0;
        let source_node_id = (bus_id & 0x7F) as NodeId;

        if !is_service {
            Self {
                priority,
                is_service,
                is_anonymous: bit24,
                kind: TransferKind::Message,
                port_id: ((bus_id >> 8) & 0x1FFF) as PortId,
                source_node_id,
                destination_node_id: None,
            }
        } else {
            Self {
                priority,
                is_service,
                is_anonymous: false,
                kind: if bit24 {
                    TransferKind::Request
                } else {
                    TransferKind::Response
                },
                port_id: ((bus_id >> 14) & 0x3FF) as PortId,
                source_node_id,
                destination_node_id: Some(((bus_id >> 7) & 0x7F) as NodeId),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_identifier() {
        let bus_id = (4 << 26) | (102 << 8) | 5;
        let fields = IdentifierFields::from_bus_id(bus_id);
        assert_eq!(fields.priority, 4);
        assert!(!fields.is_service);
        assert!(!fields.is_anonymous);
        assert_eq!(fields.kind, TransferKind::Message);
        assert_eq!(fields.port_id, 102);
        assert_eq!(fields.source_node_id, 5);
        assert_eq!(fields.destination_node_id, None);
    }

    #[test]
    fn test_anonymous_message() {
        let bus_id = (1 << 24) | (8191 << 8) | 0x7F;
        let fields = IdentifierFields::from_bus_id(bus_id);
        assert!(fields.is_anonymous);
        assert_eq!(fields.port_id, 8191);
        assert_eq!(fields.source_node_id, 127);
    }

    #[test]
    fn test_service_request() {
        let bus_id = (2 << 26) | (1 << 25) | (1 << 24) | (13 << 14) | (42 << 7) | 9;
        let fields = IdentifierFields::from_bus_id(bus_id);
        assert_eq!(fields.priority, 2);
        assert!(fields.is_service);
        assert!(!fields.is_anonymous);
        assert_eq!(fields.kind, TransferKind::Request);
        assert_eq!(fields.port_id, 13);
        assert_eq!(fields.destination_node_id, Some(42));
        assert_eq!(fields.source_node_id, 9);
    }

    #[test]
    fn test_service_response() {
        let bus_id = (1 << 25) | (511 << 14) | (3 << 7) | 4;
        let fields = IdentifierFields::from_bus_id(bus_id);
        assert_eq!(fields.kind, TransferKind::Response);
        assert_eq!(fields.port_id, 511);
        assert_eq!(fields.destination_node_id, Some(3));
    }

    #[test]
    fn test_high_bits_ignored() {
        let bus_id = (4 << 26) | (102 << 8) | 5;
        assert_eq!(
            IdentifierFields::from_bus_id(bus_id),
            IdentifierFields::from_bus_id(bus_id | 0xE000_0000)
        );
    }
}
