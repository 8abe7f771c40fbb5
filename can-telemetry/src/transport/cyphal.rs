//! Cyphal/CAN transfer reassembly
//!
//! Every frame carries a tail byte as its last payload byte:
//! - bit 7: start of transfer
//! - bit 6: end of transfer
//! - bit 5: toggle (starts at 1, alternates per frame)
//! - bits 0-4: transfer ID
//!
//! Single-frame transfers complete immediately. Multi-frame transfers are
//! assembled per (subscription, source node) and end with a big-endian
//! CRC-16/CCITT-FALSE over the payload, which is checked and stripped.
//! Invalid frames are dropped silently (the outcome is `Pending`), as a
//! passive listener cannot do anything better with them.

use super::{AcceptOutcome, Reassembler, ReassemblyError, SubscriptionId, Transfer};
use crate::frame::RawFrame;
use crate::identifier::{IdentifierFields, TransferKind};
use crate::types::{NodeId, PortId};
use crc::{Crc, Digest, CRC_16_IBM_3740};
use std::collections::HashMap;

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF, no reflection)
static TRANSFER_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Length of the transfer CRC appended to multi-frame payloads
const CRC_LEN: usize = 2;

/// Upper bound on recycled payload buffers
const MAX_POOLED_BUFFERS: usize = 64;

/// Default transfer-ID timeout (2 seconds)
pub const DEFAULT_TRANSFER_ID_TIMEOUT_US: u64 = 2_000_000;

const TAIL_START: u8 = 0x80;
const TAIL_END: u8 = 0x40;
const TAIL_TOGGLE: u8 = 0x20;
const TAIL_TRANSFER_ID: u8 = 0x1F;

#[derive(Debug, Clone, Copy)]
struct TailByte {
    start: bool,
    end: bool,
    toggle: bool,
    transfer_id: u8,
}

impl TailByte {
    fn parse(byte: u8) -> Self {
        Self {
            start: byte & TAIL_START != 0,
            end: byte & TAIL_END != 0,
            toggle: byte & TAIL_TOGGLE != 0,
            transfer_id: byte & TAIL_TRANSFER_ID,
        }
    }
}

/// A multi-frame transfer being assembled
struct Session {
    timestamp_us: u64,
    priority: u8,
    transfer_id: u8,
    expected_toggle: bool,
    total_size: usize,
    buffer: Vec<u8>,
    crc: Digest<'static, u16>,
}

struct Subscription {
    kind: TransferKind,
    port_id: PortId,
    extent: usize,
    transfer_id_timeout_us: u64,
    /// In-progress transfers by source node
    sessions: HashMap<NodeId, Session>,
    /// (transfer ID, timestamp) of the last completed transfer per source node
    last_completed: HashMap<NodeId, (u8, u64)>,
}

/// Reassembler for Cyphal/CAN frames carried in the capture stream
pub struct CyphalReassembler {
    subscriptions: Vec<Subscription>,
    index: HashMap<(TransferKind, PortId), SubscriptionId>,
    free_buffers: Vec<Vec<u8>>,
    dropped_frames: u64,
}

impl CyphalReassembler {
    pub fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
            index: HashMap::new(),
            free_buffers: Vec::new(),
            dropped_frames: 0,
        }
    }

    /// Number of frames dropped as invalid, out of order or duplicated
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Number of registered subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        self.free_buffers.pop().unwrap_or_default()
    }

    fn drop_frame(&mut self, reason: &str, frame: &RawFrame) -> AcceptOutcome {
        log::trace!(
            "Dropping frame 0x{:08X} at {}: {}",
            frame.bus_id,
            frame.timestamp,
            reason
        );
        self.dropped_frames += 1;
        AcceptOutcome::Pending
    }
}

impl Default for CyphalReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler for CyphalReassembler {
    fn get_subscription(&self, kind: TransferKind, port_id: PortId) -> Option<SubscriptionId> {
        self.index.get(&(kind, port_id)).copied()
    }

    fn subscribe(
        &mut self,
        kind: TransferKind,
        port_id: PortId,
        extent_bytes: usize,
        transfer_id_timeout_us: u64,
    ) -> Result<SubscriptionId, ReassemblyError> {
        if extent_bytes == 0 {
            return Err(ReassemblyError::InvalidSubscription(
                "extent must be at least one byte".to_string(),
            ));
        }

        if let Some(existing) = self.index.get(&(kind, port_id)) {
            let sub = &mut self.subscriptions[existing.0];
            sub.extent = extent_bytes;
            sub.transfer_id_timeout_us = transfer_id_timeout_us;
            return Ok(*existing);
        }

        let id = SubscriptionId(self.subscriptions.len());
        self.subscriptions.push(Subscription {
            kind,
            port_id,
            extent: extent_bytes,
            transfer_id_timeout_us,
            sessions: HashMap::new(),
            last_completed: HashMap::new(),
        });
        self.index.insert((kind, port_id), id);
        log::debug!("Subscribed to {} port {} ({})", kind, port_id, id);
        Ok(id)
    }

    fn accept(
        &mut self,
        timestamp_us: u64,
        frame: &RawFrame,
        subscription: SubscriptionId,
    ) -> Result<AcceptOutcome, ReassemblyError> {
        let fields = IdentifierFields::from_bus_id(frame.bus_id);

        let sub = self
            .subscriptions
            .get(subscription.0)
            .ok_or(ReassemblyError::UnknownSubscription(subscription))?;
        if sub.kind != fields.kind || sub.port_id != fields.port_id {
            return Err(ReassemblyError::SubscriptionMismatch {
                subscription,
                kind: fields.kind,
                port_id: fields.port_id,
            });
        }

        let Some((&tail_byte, data)) = frame.payload.split_last() else {
            return Ok(self.drop_frame("empty payload", frame));
        };
        let tail = TailByte::parse(tail_byte);

        // Single-frame transfer
        if tail.start && tail.end {
            if !tail.toggle {
                return Ok(self.drop_frame("single frame with toggle cleared", frame));
            }

            let (extent, timeout) = (sub.extent, sub.transfer_id_timeout_us);
            let source = (!fields.is_anonymous).then_some(fields.source_node_id);

            if let Some(node) = source {
                if is_duplicate(&sub.last_completed, node, tail.transfer_id, timestamp_us, timeout) {
                    return Ok(self.drop_frame("duplicate transfer", frame));
                }
            }

            let mut payload = self.take_buffer();
            payload.extend_from_slice(&data[..data.len().min(extent)]);

            let sub = &mut self.subscriptions[subscription.0];
            if let Some(node) = source {
                sub.sessions.remove(&node);
                sub.last_completed
                    .insert(node, (tail.transfer_id, timestamp_us));
            }

            return Ok(AcceptOutcome::Complete(Transfer {
                timestamp_us,
                priority: fields.priority,
                kind: fields.kind,
                port_id: fields.port_id,
                source_node_id: source,
                transfer_id: tail.transfer_id,
                payload,
            }));
        }

        if fields.is_anonymous {
            return Ok(self.drop_frame("multi-frame anonymous transfer", frame));
        }
        let node = fields.source_node_id;

        if tail.start {
            if !tail.toggle {
                return Ok(self.drop_frame("start frame with toggle cleared", frame));
            }
            if is_duplicate(
                &sub.last_completed,
                node,
                tail.transfer_id,
                timestamp_us,
                sub.transfer_id_timeout_us,
            ) {
                return Ok(self.drop_frame("duplicate transfer", frame));
            }

            let buffer = self.take_buffer();
            let sub = &mut self.subscriptions[subscription.0];
            if let Some(stale) = sub.sessions.remove(&node) {
                recycle(&mut self.free_buffers, stale.buffer);
            }

            let mut session = Session {
                timestamp_us,
                priority: fields.priority,
                transfer_id: tail.transfer_id,
                expected_toggle: true,
                total_size: 0,
                buffer,
                crc: TRANSFER_CRC.digest(),
            };
            session.push(data, sub.extent);
            sub.sessions.insert(node, session);
            return Ok(AcceptOutcome::Pending);
        }

        // Continuation or end frame
        let sub = &mut self.subscriptions[subscription.0];
        let (extent, timeout) = (sub.extent, sub.transfer_id_timeout_us);

        let Some(session) = sub.sessions.get_mut(&node) else {
            return Ok(self.drop_frame("continuation without a start frame", frame));
        };

        if timestamp_us.saturating_sub(session.timestamp_us) > timeout {
            if let Some(stale) = sub.sessions.remove(&node) {
                recycle(&mut self.free_buffers, stale.buffer);
            }
            return Ok(self.drop_frame("transfer timed out", frame));
        }
        if session.transfer_id != tail.transfer_id || session.expected_toggle != tail.toggle {
            return Ok(self.drop_frame("unexpected transfer ID or toggle", frame));
        }

        session.push(data, extent);

        if !tail.end {
            return Ok(AcceptOutcome::Pending);
        }

        let Some(session) = sub.sessions.remove(&node) else {
            return Ok(AcceptOutcome::Pending);
        };
        if session.total_size < CRC_LEN || session.crc.finalize() != 0 {
            recycle(&mut self.free_buffers, session.buffer);
            return Ok(self.drop_frame("transfer CRC mismatch", frame));
        }

        sub.last_completed
            .insert(node, (session.transfer_id, session.timestamp_us));

        let mut payload = session.buffer;
        payload.truncate((session.total_size - CRC_LEN).min(extent));

        Ok(AcceptOutcome::Complete(Transfer {
            timestamp_us: session.timestamp_us,
            priority: session.priority,
            kind: fields.kind,
            port_id: fields.port_id,
            source_node_id: Some(node),
            transfer_id: session.transfer_id,
            payload,
        }))
    }

    fn release(&mut self, payload: Vec<u8>) {
        recycle(&mut self.free_buffers, payload);
    }
}

impl Session {
    /// Append frame data, keeping at most `extent` payload bytes plus the CRC
    fn push(&mut self, data: &[u8], extent: usize) {
        self.crc.update(data);
        self.total_size += data.len();
        let room = (extent + CRC_LEN).saturating_sub(self.buffer.len());
        self.buffer.extend_from_slice(&data[..data.len().min(room)]);
        self.expected_toggle = !self.expected_toggle;
    }
}

fn is_duplicate(
    last_completed: &HashMap<NodeId, (u8, u64)>,
    node: NodeId,
    transfer_id: u8,
    timestamp_us: u64,
    timeout_us: u64,
) -> bool {
    matches!(
        last_completed.get(&node),
        Some(&(last_id, last_ts))
            if last_id == transfer_id && timestamp_us.saturating_sub(last_ts) <= timeout_us
    )
}

fn recycle(pool: &mut Vec<Vec<u8>>, mut buffer: Vec<u8>) {
    if pool.len() < MAX_POOLED_BUFFERS {
        buffer.clear();
        pool.push(buffer);
    }
}
