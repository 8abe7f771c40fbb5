//! Console reports
//!
//! Plain-text tables for the ingest summary and the channel metadata snapshot.

use can_telemetry::{ChannelInfo, SourceOutcome};
use std::fmt::Write;

/// Per-source ingest counters and merge results
pub fn format_ingest_summary(outcomes: &[SourceOutcome]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<28} {:>8} {:>9} {:>9} {:>7} {:>7} {:>9}  {}",
        "SESSION", "FRAMES", "TRANSFERS", "POINTS", "UNKNOWN", "ERRORS", "CONFLICTS", "STATUS"
    );

    for outcome in outcomes {
        let r = &outcome.report;
        let errors = r.schema_errors + r.type_mismatches + r.reassembly_errors + r.malformed_frames;
        let status = if r.cancelled {
            "cancelled".to_string()
        } else if let Some(reason) = &r.halt_reason {
            format!("halted: {}", reason)
        } else {
            "ok".to_string()
        };

        let _ = writeln!(
            out,
            "{:<28} {:>8} {:>9} {:>9} {:>7} {:>7} {:>9}  {}",
            outcome.session_id,
            r.frames,
            r.transfers,
            r.points,
            r.unknown_ports,
            errors,
            outcome.merge.conflicts.len(),
            status
        );
    }
    out
}

/// One row per channel: key, type, point count and time span
pub fn format_channel_table(channels: &[ChannelInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<28} {:<12} {:<36} {:<5} {:>9} {:>14}",
        "SESSION", "MEASUREMENT", "FIELD", "TYPE", "POINTS", "SPAN (s)"
    );

    for info in channels {
        let span = match info.time_range {
            Some((start, end)) => format!("{:.3}", (end - start) / 1_000_000.0),
            None => "-".to_string(),
        };
        let _ = writeln!(
            out,
            "{:<28} {:<12} {:<36} {:<5} {:>9} {:>14}",
            info.key.session_id,
            info.key.measurement,
            info.key.field,
            info.value_type.to_string(),
            info.points,
            span
        );
    }

    let total: usize = channels.iter().map(|c| c.points).sum();
    let _ = writeln!(out, "{} channels, {} points", channels.len(), total);
    out
}
