//! Transport reassembly contract
//!
//! Turns validated frames into complete application transfers. The ingest
//! worker only depends on the [`Reassembler`] trait: it looks up a subscription
//! for the frame's (kind, port), subscribes lazily when none exists, feeds the
//! frame to `accept` and, once a transfer completes and has been dispatched,
//! hands the payload buffer back with `release`.

use crate::frame::RawFrame;
use crate::identifier::TransferKind;
use crate::types::{NodeId, PortId};
use std::fmt;

pub mod cyphal;

pub use cyphal::CyphalReassembler;

/// Handle to a subscription registered with a reassembler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub usize);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One complete application-level message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Timestamp of the first frame of the transfer (microseconds)
    pub timestamp_us: u64,
    pub priority: u8,
    pub kind: TransferKind,
    pub port_id: PortId,
    /// Source node, `None` for anonymous transfers
    pub source_node_id: Option<NodeId>,
    pub transfer_id: u8,
    /// Reassembled payload, owned until handed back via `Reassembler::release`
    pub payload: Vec<u8>,
}

/// Result of feeding one frame to a reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// The frame completed a transfer
    Complete(Transfer),
    /// The frame was consumed; no transfer completed yet
    Pending,
}

/// Reassembly-layer failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("frame for {kind} port {port_id} does not match subscription {subscription}")]
    SubscriptionMismatch {
        subscription: SubscriptionId,
        kind: TransferKind,
        port_id: PortId,
    },

    #[error("invalid subscription parameters: {0}")]
    InvalidSubscription(String),
}

/// Contract between the ingest worker and a transport reassembly engine
pub trait Reassembler {
    /// Look up an existing subscription for (kind, port)
    fn get_subscription(&self, kind: TransferKind, port_id: PortId) -> Option<SubscriptionId>;

    /// Register a subscription with a fixed extent and transfer-ID timeout
    fn subscribe(
        &mut self,
        kind: TransferKind,
        port_id: PortId,
        extent_bytes: usize,
        transfer_id_timeout_us: u64,
    ) -> Result<SubscriptionId, ReassemblyError>;

    /// Feed one frame received at `timestamp_us`
    fn accept(
        &mut self,
        timestamp_us: u64,
        frame: &RawFrame,
        subscription: SubscriptionId,
    ) -> Result<AcceptOutcome, ReassemblyError>;

    /// Return a completed transfer's payload buffer to the reassembler
    fn release(&mut self, payload: Vec<u8>);
}
