//! CAN Telemetry Library
//!
//! Ingests captured CAN bus traffic carrying Cyphal transfers, stores the
//! decoded values as typed per-session time series and exports them as
//! line-protocol batches for a time-series database.
//!
//! # Architecture
//!
//! - [`frame`]: pulls fixed-header records out of capture buffers
//! - [`identifier`]: splits a 29-bit bus identifier into its fields
//! - [`transport`]: the reassembly contract and a Cyphal/CAN implementation
//! - [`schema`] / [`dispatch`]: port → message layout table and payload decoding
//! - [`channel`] / [`store`]: typed time series and the concurrent registry
//! - [`ingest`]: per-source worker with private stores merged at the end
//! - [`export`]: line-protocol batching
//!
//! The library does NOT deliver batches to a database, read network sockets
//! or draw plots. Those belong to the application layer (can-telemetry-cli).
//!
//! # Example Usage
//!
//! ```no_run
//! use can_telemetry::{
//!     export_batches, ChannelStore, CyphalReassembler, IngestConfig, Ingestor, PortTable,
//!     ReaderSource,
//! };
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//!
//! let ingestor = Ingestor::new(Arc::new(PortTable::builtin()), IngestConfig::new());
//! let file = std::fs::File::open("CAN_2024-11-20(142000).bin").unwrap();
//! let mut source = ReaderSource::new(file, 64 * 1024);
//! let mut reassembler = CyphalReassembler::new();
//!
//! let (store, report) = ingestor.ingest_source(
//!     "CAN_2024-11-20(142000)",
//!     &mut source,
//!     &mut reassembler,
//!     &AtomicBool::new(false),
//! );
//! println!("{} points", report.points);
//!
//! let shared = ChannelStore::new();
//! shared.merge_from(&store);
//! for channel in shared.channels() {
//!     for batch in export_batches(&channel, 5000).unwrap() {
//!         print!("{}", batch.text);
//!     }
//! }
//! ```

// Public modules
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod export;
pub mod frame;
pub mod identifier;
pub mod ingest;
pub mod schema;
pub mod store;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use channel::{Channel, ChannelTags};
pub use config::{ExportConfig, Framing, IngestConfig};
pub use dispatch::{DecodedMessage, MessageDecoder};
pub use export::{
    export_batches, export_batches_with_base, export_store, session_base_epoch_ms, ExportBatch,
};
pub use frame::{extract_frame, Extracted, RawFrame};
pub use identifier::{IdentifierFields, TransferKind};
pub use ingest::{IngestReport, Ingestor, PayloadSource, ReaderSource, SourceOutcome, VecSource};
pub use schema::{FieldSchema, FieldType, MessageSchema, PortTable, TableStats};
pub use store::{ChannelInfo, ChannelStore, MergeConflict, MergeReport};
pub use transport::{
    AcceptOutcome, CyphalReassembler, Reassembler, ReassemblyError, SubscriptionId, Transfer,
};
pub use types::{
    ChannelKey, DataPoint, NodeId, PortId, Result, TelemetryError, Value, ValueType,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
