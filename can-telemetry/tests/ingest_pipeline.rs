// End-to-end tests: capture bytes -> reassembly -> store -> line protocol

use can_telemetry::{
    export_batches, ChannelKey, ChannelStore, ChannelTags, CyphalReassembler, DataPoint,
    ExportConfig, Framing, IngestConfig, Ingestor, PayloadSource, PortTable, RawFrame,
    ReaderSource, TelemetryError, Value, ValueType, VecSource,
};
use crc::{Crc, CRC_16_IBM_3740};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SESSION: &str = "CAN_2024-11-20(142000)";
const BASE_MS: i64 = 1_732_112_400_000;
const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn message_id(port: u16, node: u8) -> u32 {
    (4 << 26) | ((port as u32) << 8) | node as u32
}

/// Frames of one transfer over classic CAN (7 data bytes + tail byte per frame)
fn transfer_frames(timestamp: u64, port: u16, transfer_id: u8, payload: &[u8]) -> Vec<RawFrame> {
    let id = message_id(port, 5);
    if payload.len() <= 7 {
        let mut data = payload.to_vec();
        data.push(0xE0 | (transfer_id & 0x1F));
        return vec![RawFrame::new(timestamp, id, data)];
    }

    let mut body = payload.to_vec();
    body.extend_from_slice(&CRC.checksum(payload).to_be_bytes());
    let chunks: Vec<&[u8]> = body.chunks(7).collect();
    let last = chunks.len() - 1;

    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut tail = transfer_id & 0x1F;
            if i == 0 {
                tail |= 0x80;
            }
            if i == last {
                tail |= 0x40;
            }
            if i % 2 == 0 {
                tail |= 0x20;
            }
            let mut data = chunk.to_vec();
            data.push(tail);
            RawFrame::new(timestamp + i as u64, id, data)
        })
        .collect()
}

fn encode(frames: &[RawFrame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        frame.encode_into(&mut out).unwrap();
    }
    out
}

fn ins_payload(vx: f32) -> Vec<u8> {
    let mut payload = Vec::new();
    for i in 0..15 {
        let value = if i == 0 { vx } else { i as f32 };
        payload.extend_from_slice(&value.to_le_bytes());
    }
    payload
}

#[test]
fn capture_file_to_line_protocol() {
    init_logging();

    let mut frames = Vec::new();
    for i in 0..10u64 {
        frames.extend(transfer_frames(i * 10_000, 102, i as u8, &ins_payload(i as f32)));
        frames.extend(transfer_frames(i * 10_000 + 5, 10, i as u8, &[2]));
    }

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&encode(&frames)).unwrap();
    file.flush().unwrap();

    let ingestor = Ingestor::new(
        Arc::new(PortTable::builtin()),
        IngestConfig::new().with_framing(Framing::Stream),
    );
    let mut source = ReaderSource::new(std::fs::File::open(file.path()).unwrap(), 50);
    let mut reassembler = CyphalReassembler::new();
    let (store, report) =
        ingestor.ingest_source(SESSION, &mut source, &mut reassembler, &AtomicBool::new(false));

    assert_eq!(report.transfers, 20);
    assert_eq!(report.points, 10 * 15 + 10);
    assert_eq!(report.halt_reason, None);
    assert_eq!(reassembler.dropped_frames(), 0);
    assert_eq!(store.len(), 16);

    let vx = store.get(&ChannelKey::new(SESSION, "vcu", "INS.vx")).unwrap();
    assert_eq!(vx.value_type(), ValueType::F32);
    assert_eq!(vx.value_at(25_000.0).unwrap(), Value::F32(2.5));

    store.tag_session(SESSION, &ChannelTags::new().with_car("ev24"));
    let batches = export_batches(&vx, 4).unwrap();
    assert_eq!(batches.len(), 3);
    assert_eq!(
        batches[0].text.lines().nth(1).unwrap(),
        format!(
            "vcu,log_id=CAN_2024-11-20(142000),car=ev24 INS.vx=1 {}",
            BASE_MS + 10
        )
    );
}

#[test]
fn schema_file_drives_dispatch() {
    init_logging();

    let mut schema = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        schema,
        r#"
        [[message]]
        port_id = 500
        name = "Wheel"
        measurement = "chassis"
        fields = [
            {{ name = "rpm", type = "uint16" }},
            {{ name = "locked", type = "bool" }},
            {{ type = "void7" }},
        ]
        "#
    )
    .unwrap();

    let table = PortTable::from_toml_file(schema.path()).unwrap();
    let ingestor = Ingestor::new(Arc::new(table), IngestConfig::new());
    let datagram = encode(&transfer_frames(1_000, 500, 0, &[0x10, 0x27, 0x01]));

    let mut source = VecSource::new(vec![datagram]);
    let mut reassembler = CyphalReassembler::new();
    let (store, report) =
        ingestor.ingest_source(SESSION, &mut source, &mut reassembler, &AtomicBool::new(false));

    assert_eq!(report.points, 2);
    let rpm = store.get(&ChannelKey::new(SESSION, "chassis", "Wheel.rpm")).unwrap();
    assert_eq!(rpm.points(), vec![DataPoint::new(1_000.0, Value::U16(10_000))]);
    let locked = store
        .get(&ChannelKey::new(SESSION, "chassis", "Wheel.locked"))
        .unwrap();
    assert_eq!(locked.value_at(0.0).unwrap(), Value::Bool(true));
}

#[test]
fn parallel_sources_merge_into_shared_store() {
    init_logging();

    let ingestor = Ingestor::new(Arc::new(PortTable::builtin()), IngestConfig::new());
    let sources: Vec<(String, VecSource)> = (0..4u64)
        .map(|s| {
            let datagrams = (0..25u64)
                .map(|i| {
                    let ts = i * 1_000 + s * 100;
                    encode(&transfer_frames(ts, 10, i as u8, &[s as u8]))
                })
                .collect();
            (SESSION.to_string(), VecSource::new(datagrams))
        })
        .collect();

    let shared = ChannelStore::new();
    let outcomes = ingestor.ingest_parallel(
        sources,
        CyphalReassembler::new,
        &shared,
        &AtomicBool::new(false),
    );

    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|o| o.report.points == 25));
    assert!(outcomes.iter().all(|o| o.merge.is_clean()));

    let command = shared
        .get(&ChannelKey::new(SESSION, "vcu", "DriveMode.command"))
        .unwrap();
    assert_eq!(command.len(), 100);
    let points = command.normalized_points();
    assert!(points.windows(2).all(|w| w[0].time < w[1].time));
}

/// Raises the cancel flag when asked for its second payload
struct CancelAfterFirst<'a> {
    inner: VecSource,
    cancel: &'a AtomicBool,
    served: usize,
}

impl PayloadSource for CancelAfterFirst<'_> {
    fn next_payload(&mut self) -> can_telemetry::Result<Option<Vec<u8>>> {
        if self.served == 1 {
            self.cancel.store(true, Ordering::SeqCst);
        }
        self.served += 1;
        self.inner.next_payload()
    }
}

#[test]
fn cancelled_ingest_merges_partial_store_once() {
    init_logging();

    let ingestor = Ingestor::new(Arc::new(PortTable::builtin()), IngestConfig::new());
    let cancel = AtomicBool::new(false);
    let first = encode(&[
        transfer_frames(100, 10, 0, &[1]),
        transfer_frames(200, 10, 1, &[2]),
    ]
    .concat());
    let second = encode(&transfer_frames(300, 8, 0, &[1]));
    let sources = vec![(
        SESSION.to_string(),
        CancelAfterFirst {
            inner: VecSource::new(vec![first, second]),
            cancel: &cancel,
            served: 0,
        },
    )];

    let shared = ChannelStore::new();
    let seeded = ChannelKey::new(SESSION, "vcu", "INS.vx");
    shared.add_point(&seeded, 0.0, Value::F32(1.0)).unwrap();

    let outcomes = ingestor.ingest_parallel(sources, CyphalReassembler::new, &shared, &cancel);

    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert!(outcome.report.cancelled);
    assert_eq!(outcome.report.frames, 2);
    assert_eq!(outcome.report.points, 2);
    assert_eq!(outcome.merge.cloned, 1);
    assert_eq!(outcome.merge.points, 2);

    let command = shared
        .get(&ChannelKey::new(SESSION, "vcu", "DriveMode.command"))
        .unwrap();
    assert_eq!(command.len(), 2);
    assert!(shared
        .get(&ChannelKey::new(SESSION, "vcu", "EbsActivation.activate_ebs"))
        .is_none());
    assert_eq!(shared.get(&seeded).unwrap().len(), 1);
    assert_eq!(shared.len(), 2);
}

#[test]
fn export_batches_of_twelve_thousand_points() {
    let store = ChannelStore::new();
    let key = ChannelKey::new(SESSION, "vcu", "INS.ax");
    let points: Vec<DataPoint> = (0..12_000)
        .map(|i| DataPoint::new(i as f64 * 1_000.0, Value::F32(i as f32)))
        .collect();
    store.add_points(&key, &points).unwrap();

    let channel = store.get(&key).unwrap();
    let batches = export_batches(&channel, ExportConfig::default().max_batch_size).unwrap();
    let sizes: Vec<usize> = batches.iter().map(|b| b.records).collect();
    assert_eq!(sizes, vec![5000, 5000, 2000]);

    let last = batches[2].text.lines().last().unwrap();
    assert!(last.ends_with(&format!(" {}", BASE_MS + 11_999)));
}

#[test]
fn merge_completeness_and_collision() {
    let k1 = ChannelKey::new(SESSION, "vcu", "K1");
    let k2 = ChannelKey::new(SESSION, "vcu", "K2");

    let b = ChannelStore::new();
    b.add_point(&k1, 2.0, Value::F32(2.0)).unwrap();
    b.add_point(&k1, 1.0, Value::F32(1.0)).unwrap();
    b.add_point(&k2, 1.0, Value::U8(7)).unwrap();

    let a = ChannelStore::new();
    let report = a.merge_from(&b);
    assert_eq!(report.cloned, 2);
    for key in [&k1, &k2] {
        assert_eq!(
            a.get(key).unwrap().normalized_points(),
            b.get(key).unwrap().normalized_points()
        );
    }

    let c = ChannelStore::new();
    c.add_point(&k1, 5.0, Value::U8(5)).unwrap();
    let before = a.get(&k1).unwrap().points();
    let report = a.merge_from(&c);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].key, k1);
    assert_eq!(a.get(&k1).unwrap().points(), before);
}

#[test]
fn type_safety_across_store_and_channel() {
    let store = ChannelStore::new();
    let key = ChannelKey::new(SESSION, "vcu", "INS.vx");
    store.get_or_create(&key, ValueType::F32).unwrap();
    store.add_point(&key, 0.0, Value::F32(1.0)).unwrap();

    let err = store.add_point(&key, 1.0, Value::Bool(true)).unwrap_err();
    assert!(matches!(err, TelemetryError::TypeMismatch { .. }));
    assert!(store.get_or_create(&key, ValueType::Bool).is_err());
    assert_eq!(store.get(&key).unwrap().len(), 1);
}
