//! Ingestion worker
//!
//! Drives the pipeline for one input source:
//!
//! ```text
//! payload source -> frame extractor -> identifier decoder -> reassembler
//!                -> port dispatch -> private channel store
//! ```
//!
//! Every source is ingested into its own [`ChannelStore`] and merged into the
//! shared store exactly once when the source ends, is cancelled or halts.
//! Recoverable errors (schema, type mismatch, unknown port) are counted and
//! logged; a malformed frame or a reassembly error ends the current buffer
//! region.

use crate::config::{Framing, IngestConfig};
use crate::frame::{extract_frame, Extracted, RawFrame};
use crate::identifier::{IdentifierFields, TransferKind};
use crate::schema::PortTable;
use crate::store::{ChannelStore, MergeReport};
use crate::transport::{AcceptOutcome, Reassembler, Transfer};
use crate::types::{ChannelKey, Result, TelemetryError};
use rayon::prelude::*;
use serde::Serialize;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Producer of payload ranges (one datagram, or one chunk of a stream)
pub trait PayloadSource {
    /// Next payload, `Ok(None)` at end of stream
    fn next_payload(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Payload source over any reader, yielding fixed-size chunks
pub struct ReaderSource<R: Read> {
    reader: R,
    chunk_size: usize,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
        }
    }
}

impl<R: Read> PayloadSource for ReaderSource<R> {
    fn next_payload(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        let read = (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut chunk)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(chunk))
    }
}

/// In-memory payload source
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    payloads: std::collections::VecDeque<Vec<u8>>,
}

impl VecSource {
    pub fn new(payloads: Vec<Vec<u8>>) -> Self {
        Self {
            payloads: payloads.into(),
        }
    }
}

impl PayloadSource for VecSource {
    fn next_payload(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.payloads.pop_front())
    }
}

/// Counters for one ingested source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub payloads: usize,
    pub bytes: usize,
    pub frames: usize,
    pub transfers: usize,
    pub points: usize,
    /// Transfers on ports with no schema (including service transfers)
    pub unknown_ports: usize,
    pub schema_errors: usize,
    pub type_mismatches: usize,
    pub reassembly_errors: usize,
    pub malformed_frames: usize,
    /// Bytes of an incomplete trailing frame that were never processed
    pub discarded_bytes: usize,
    pub cancelled: bool,
    /// Why the source stopped early, if it did
    pub halt_reason: Option<String>,
}

/// Result of ingesting one source in a parallel run
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub session_id: String,
    pub report: IngestReport,
    pub merge: MergeReport,
}

/// How processing of one buffer region ended
enum RegionEnd {
    /// All complete frames consumed
    Exhausted,
    Cancelled,
    /// Malformed frame or reassembly error
    Failed(TelemetryError),
}

/// Ingestion driver sharing one port table across sources
#[derive(Debug, Clone)]
pub struct Ingestor {
    table: Arc<PortTable>,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(table: Arc<PortTable>, config: IngestConfig) -> Self {
        Self { table, config }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn table(&self) -> &PortTable {
        &self.table
    }

    /// Ingest a whole source into a new private store.
    ///
    /// Returns whatever was stored before the source ended, halted or was
    /// cancelled, together with the run's counters.
    pub fn ingest_source<S, R>(
        &self,
        session_id: &str,
        source: &mut S,
        reassembler: &mut R,
        cancel: &AtomicBool,
    ) -> (ChannelStore, IngestReport)
    where
        S: PayloadSource + ?Sized,
        R: Reassembler + ?Sized,
    {
        let store = ChannelStore::new();
        let mut report = IngestReport::default();
        let mut worker = Worker {
            session_id,
            table: &self.table,
            config: &self.config,
            store: &store,
            report: &mut report,
        };

        log::info!("Ingesting session {} ({:?} framing)", session_id, self.config.framing);
        match self.config.framing {
            Framing::Datagram => worker.run_datagrams(source, reassembler, cancel),
            Framing::Stream => worker.run_stream(source, reassembler, cancel),
        }

        log::info!(
            "Session {}: {} frames, {} transfers, {} points in {} channels",
            session_id,
            report.frames,
            report.transfers,
            report.points,
            store.len()
        );
        (store, report)
    }

    /// Ingest several sources in parallel and merge each into `shared`.
    ///
    /// Each source runs on its own rayon worker with a fresh reassembler and a
    /// private store. The private store is merged exactly once, including after
    /// cancellation or a halting error.
    pub fn ingest_parallel<S, R, F>(
        &self,
        sources: Vec<(String, S)>,
        make_reassembler: F,
        shared: &ChannelStore,
        cancel: &AtomicBool,
    ) -> Vec<SourceOutcome>
    where
        S: PayloadSource + Send,
        R: Reassembler,
        F: Fn() -> R + Sync,
    {
        log::info!("Ingesting {} sources in parallel", sources.len());
        sources
            .into_par_iter()
            .map(|(session_id, mut source)| {
                let mut reassembler = make_reassembler();
                let (private, report) =
                    self.ingest_source(&session_id, &mut source, &mut reassembler, cancel);
                let merge = shared.merge_from(&private);
                SourceOutcome {
                    session_id,
                    report,
                    merge,
                }
            })
            .collect()
    }
}

/// Per-source state for one ingest run
struct Worker<'a> {
    session_id: &'a str,
    table: &'a PortTable,
    config: &'a IngestConfig,
    store: &'a ChannelStore,
    report: &'a mut IngestReport,
}

impl Worker<'_> {
    fn next_payload<S: PayloadSource + ?Sized>(&mut self, source: &mut S) -> Option<Vec<u8>> {
        match source.next_payload() {
            Ok(Some(payload)) => {
                self.report.payloads += 1;
                self.report.bytes += payload.len();
                Some(payload)
            }
            Ok(None) => None,
            Err(e) => {
                log::error!("Session {}: source read failed: {}", self.session_id, e);
                self.report.halt_reason = Some(e.to_string());
                None
            }
        }
    }

    /// Every payload is its own region. A failed region is abandoned and the
    /// next datagram is processed.
    fn run_datagrams<S, R>(&mut self, source: &mut S, reassembler: &mut R, cancel: &AtomicBool)
    where
        S: PayloadSource + ?Sized,
        R: Reassembler + ?Sized,
    {
        let mut base_offset = 0;
        while let Some(payload) = self.next_payload(source) {
            let mut cursor = 0;
            match self.process_region(&payload, &mut cursor, base_offset, reassembler, cancel) {
                RegionEnd::Exhausted => {
                    let leftover = payload.len() - cursor;
                    if leftover > 0 {
                        log::warn!(
                            "Session {}: {} trailing bytes at offset {} discarded",
                            self.session_id,
                            leftover,
                            base_offset + cursor
                        );
                        self.report.discarded_bytes += leftover;
                    }
                }
                RegionEnd::Cancelled => return,
                RegionEnd::Failed(e) => {
                    log::error!("Session {}: datagram abandoned: {}", self.session_id, e);
                }
            }
            base_offset += payload.len();
        }
    }

    /// Payloads are consecutive chunks of one stream. A failure halts the source.
    fn run_stream<S, R>(&mut self, source: &mut S, reassembler: &mut R, cancel: &AtomicBool)
    where
        S: PayloadSource + ?Sized,
        R: Reassembler + ?Sized,
    {
        let mut pending: Vec<u8> = Vec::new();
        let mut base_offset = 0;

        while let Some(payload) = self.next_payload(source) {
            pending.extend_from_slice(&payload);

            let mut cursor = 0;
            match self.process_region(&pending, &mut cursor, base_offset, reassembler, cancel) {
                RegionEnd::Exhausted => {
                    pending.drain(..cursor);
                    base_offset += cursor;
                }
                RegionEnd::Cancelled => return,
                RegionEnd::Failed(e) => {
                    log::error!("Session {}: stream halted: {}", self.session_id, e);
                    self.report.halt_reason = Some(e.to_string());
                    return;
                }
            }
        }

        if !pending.is_empty() {
            log::warn!(
                "Session {}: stream ended inside a frame at offset {} ({} bytes discarded)",
                self.session_id,
                base_offset,
                pending.len()
            );
            self.report.discarded_bytes += pending.len();
        }
    }

    fn process_region<R>(
        &mut self,
        buffer: &[u8],
        cursor: &mut usize,
        base_offset: usize,
        reassembler: &mut R,
        cancel: &AtomicBool,
    ) -> RegionEnd
    where
        R: Reassembler + ?Sized,
    {
        loop {
            if cancel.load(Ordering::Relaxed) {
                log::warn!("Session {}: ingestion cancelled", self.session_id);
                self.report.cancelled = true;
                return RegionEnd::Cancelled;
            }

            let frame_offset = base_offset + *cursor;
            match extract_frame(buffer, cursor) {
                Ok(Extracted::NeedMoreData) => return RegionEnd::Exhausted,
                Ok(Extracted::Frame(frame)) => {
                    self.report.frames += 1;
                    if let Err(e) = self.handle_frame(&frame, frame_offset, reassembler) {
                        self.report.reassembly_errors += 1;
                        return RegionEnd::Failed(e);
                    }
                }
                Err(TelemetryError::MalformedFrame { declared_len, .. }) => {
                    self.report.malformed_frames += 1;
                    return RegionEnd::Failed(TelemetryError::MalformedFrame {
                        offset: frame_offset,
                        declared_len,
                    });
                }
                Err(e) => return RegionEnd::Failed(e),
            }
        }
    }

    /// Feed one frame through reassembly; dispatch and release a completed transfer
    fn handle_frame<R>(&mut self, frame: &RawFrame, offset: usize, reassembler: &mut R) -> Result<()>
    where
        R: Reassembler + ?Sized,
    {
        let fields = IdentifierFields::from_bus_id(frame.bus_id);
        let reassembly_error = |e: crate::transport::ReassemblyError| TelemetryError::Reassembly {
            offset,
            reason: e.to_string(),
        };

        let subscription = match reassembler.get_subscription(fields.kind, fields.port_id) {
            Some(subscription) => subscription,
            None => {
                log::debug!("Subscribing to {} port {}", fields.kind, fields.port_id);
                reassembler
                    .subscribe(
                        fields.kind,
                        fields.port_id,
                        self.config.extent_bytes,
                        self.config.transfer_id_timeout_us,
                    )
                    .map_err(reassembly_error)?
            }
        };

        match reassembler
            .accept(frame.timestamp, frame, subscription)
            .map_err(reassembly_error)?
        {
            AcceptOutcome::Pending => {}
            AcceptOutcome::Complete(transfer) => {
                self.report.transfers += 1;
                self.dispatch(&transfer);
                reassembler.release(transfer.payload);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, transfer: &Transfer) {
        if transfer.kind != TransferKind::Message {
            log::trace!("Ignoring {} transfer on port {}", transfer.kind, transfer.port_id);
            self.report.unknown_ports += 1;
            return;
        }

        let message = match self.table.decode(transfer.port_id, &transfer.payload) {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.report.unknown_ports += 1;
                return;
            }
            Err(e) => {
                log::warn!("Session {}: {}", self.session_id, e);
                self.report.schema_errors += 1;
                return;
            }
        };

        let time = transfer.timestamp_us as f64;
        for (field, value) in message.fields {
            let key = ChannelKey::new(self.session_id, message.measurement.as_str(), field);
            match self.store.add_point(&key, time, value) {
                Ok(()) => self.report.points += 1,
                Err(e @ TelemetryError::TypeMismatch { .. }) => {
                    log::warn!("Port {}: {}", transfer.port_id, e);
                    self.report.type_mismatches += 1;
                }
                Err(e) => log::warn!("Port {}: dropped point for {}: {}", transfer.port_id, key, e),
            }
        }
    }
}
