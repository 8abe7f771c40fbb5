//! Line-protocol export
//!
//! Turns a channel into batches of time-series database records:
//!
//! ```text
//! measurement,log_id=<session>[,tag=value]* field=value timestamp_ms
//! ```
//!
//! Record times are absolute: the session identifier embeds the UTC start of
//! the recording and each point's offset (microseconds) is added to it in
//! whole milliseconds.

use crate::channel::Channel;
use crate::config::ExportConfig;
use crate::store::ChannelStore;
use crate::types::{ChannelKey, Result, TelemetryError, Value};
use chrono::NaiveDateTime;

/// Format of the time part of a session identifier (`<PREFIX>_<time>`)
pub const SESSION_TIME_FORMAT: &str = "%Y-%m-%d(%H%M%S)";

/// One batch of newline-terminated records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBatch {
    /// Number of records in `text`
    pub records: usize,
    pub text: String,
}

/// Parse `"<PREFIX>_YYYY-MM-DD(HHMMSS)"` into epoch milliseconds (UTC)
pub fn session_base_epoch_ms(session_id: &str) -> Result<i64> {
    let (prefix, time) = session_id.rsplit_once('_').ok_or_else(|| {
        TelemetryError::SessionIdParse(format!("'{}' has no '_' separator", session_id))
    })?;
    if prefix.is_empty() {
        return Err(TelemetryError::SessionIdParse(format!(
            "'{}' has an empty prefix",
            session_id
        )));
    }

    let start = NaiveDateTime::parse_from_str(time, SESSION_TIME_FORMAT)
        .map_err(|e| TelemetryError::SessionIdParse(format!("'{}': {}", session_id, e)))?;
    Ok(start.and_utc().timestamp_millis())
}

/// Export a channel, taking the time base from its session identifier.
///
/// Normalizes the channel first. Fails without producing any batch if the
/// session identifier cannot be parsed.
pub fn export_batches(channel: &Channel, max_batch_size: usize) -> Result<Vec<ExportBatch>> {
    let base_ms = session_base_epoch_ms(&channel.key().session_id)?;
    export_batches_with_base(channel, base_ms, max_batch_size)
}

/// Export a channel against an explicit time base
pub fn export_batches_with_base(
    channel: &Channel,
    base_ms: i64,
    max_batch_size: usize,
) -> Result<Vec<ExportBatch>> {
    if max_batch_size == 0 {
        return Err(TelemetryError::InvalidConfig(
            "max_batch_size must be greater than zero".to_string(),
        ));
    }

    let key = channel.key();
    let prefix = record_prefix(key, channel);
    let points = channel.normalized_points();

    let mut batches = Vec::new();
    let mut current = ExportBatch {
        records: 0,
        text: String::new(),
    };
    let mut skipped = 0;
    let mut out_of_range = 0;

    for point in &points {
        let Some(value) = format_value(&point.value) else {
            skipped += 1;
            continue;
        };
        let Some(timestamp_ms) = record_timestamp_ms(base_ms, point.time) else {
            out_of_range += 1;
            continue;
        };

        current.text.push_str(&prefix);
        current.text.push_str(&value);
        current.text.push(' ');
        current.text.push_str(&timestamp_ms.to_string());
        current.text.push('\n');
        current.records += 1;

        if current.records == max_batch_size {
            batches.push(std::mem::replace(
                &mut current,
                ExportBatch {
                    records: 0,
                    text: String::new(),
                },
            ));
        }
    }
    if current.records > 0 {
        batches.push(current);
    }

    if skipped > 0 {
        log::warn!("Skipped {} non-finite values exporting {}", skipped, key);
    }
    if out_of_range > 0 {
        log::warn!(
            "Skipped {} points exporting {}: timestamp out of range",
            out_of_range,
            key
        );
    }
    log::debug!(
        "Exported {}: {} records in {} batches",
        key,
        points.len() - skipped - out_of_range,
        batches.len()
    );
    Ok(batches)
}

/// Absolute record time in milliseconds, `None` if it does not fit in an i64
fn record_timestamp_ms(base_ms: i64, time_us: f64) -> Option<i64> {
    let offset_ms = (time_us / 1000.0).floor();
    // i64::MAX as f64 rounds up to 2^63, which is itself out of range
    if !(offset_ms >= i64::MIN as f64 && offset_ms < i64::MAX as f64) {
        return None;
    }
    base_ms.checked_add(offset_ms as i64)
}

/// Export every channel of a store, sorted by key.
///
/// A failing channel does not stop the others; its error is returned in its slot.
pub fn export_store(
    store: &ChannelStore,
    config: &ExportConfig,
) -> Vec<(ChannelKey, Result<Vec<ExportBatch>>)> {
    store
        .channels()
        .into_iter()
        .map(|channel| {
            let result = export_batches(&channel, config.max_batch_size);
            if let Err(e) = &result {
                log::error!("Export of {} failed: {}", channel.key(), e);
            }
            (channel.key().clone(), result)
        })
        .collect()
}

/// `measurement,tags field=` part shared by every record of a channel
fn record_prefix(key: &ChannelKey, channel: &Channel) -> String {
    let mut prefix = escape_measurement(&key.measurement);

    prefix.push_str(",log_id=");
    prefix.push_str(&escape_tag(&key.session_id));

    let tags = channel.tags();
    for (tag_key, tag_value) in tags.entries() {
        prefix.push(',');
        prefix.push_str(&escape_tag(tag_key));
        prefix.push('=');
        prefix.push_str(&escape_tag(tag_value));
    }

    prefix.push(' ');
    prefix.push_str(&escape_tag(&key.field));
    prefix.push('=');
    prefix
}

/// Field value text, `None` for values the database cannot store
fn format_value(value: &Value) -> Option<String> {
    match value {
        Value::F32(v) if !v.is_finite() => None,
        Value::F64(v) if !v.is_finite() => None,
        Value::F32(_) | Value::F64(_) | Value::Bool(_) => Some(value.to_string()),
        Value::U8(_) | Value::U16(_) | Value::U32(_) => Some(format!("{}i", value)),
    }
}

/// Escape a measurement name: commas and spaces
fn escape_measurement(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace(' ', "\\ ")
}

/// Escape a tag key, tag value or field key: commas, equals signs and spaces
fn escape_tag(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
