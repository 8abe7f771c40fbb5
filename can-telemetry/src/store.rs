//! Channel store
//!
//! Concurrent registry of channels keyed by (session, measurement, field).
//!
//! # Lock ordering
//!
//! The store's structural lock guards the key → channel map. Each channel
//! guards its own points. Code that needs both takes the structural lock first,
//! then channel locks. `merge_from` takes the structural locks of both stores,
//! lower address first.

use crate::channel::{Channel, ChannelTags};
use crate::types::{ChannelKey, DataPoint, Result, TelemetryError, Value, ValueType};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Diagnostic summary of one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelInfo {
    pub key: ChannelKey,
    pub value_type: ValueType,
    pub points: usize,
    pub normalized: bool,
    /// Earliest and latest time in microseconds
    pub time_range: Option<(f64, f64)>,
}

/// A key that could not be merged because the two stores disagree on its type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeConflict {
    pub key: ChannelKey,
    pub existing: ValueType,
    pub incoming: ValueType,
}

/// Outcome of `ChannelStore::merge_from`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Channels copied because the target had no channel at that key
    pub cloned: usize,
    /// Channels whose points were appended to an existing channel
    pub appended: usize,
    /// Total points moved
    pub points: usize,
    /// Keys skipped on a type mismatch
    pub conflicts: Vec<MergeConflict>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Registry of channels
#[derive(Debug, Default)]
pub struct ChannelStore {
    channels: Mutex<HashMap<ChannelKey, Arc<Channel>>>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the channel at `key`, creating it with `value_type` if absent.
    ///
    /// Fails with `TypeMismatch` if a channel of another type already exists.
    pub fn get_or_create(&self, key: &ChannelKey, value_type: ValueType) -> Result<Arc<Channel>> {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get(key) {
            if channel.value_type() != value_type {
                return Err(TelemetryError::TypeMismatch {
                    key: key.clone(),
                    expected: channel.value_type(),
                    found: value_type,
                });
            }
            return Ok(Arc::clone(channel));
        }

        log::debug!("Creating channel {} ({})", key, value_type);
        let channel = Arc::new(Channel::new(key.clone(), value_type));
        channels.insert(key.clone(), Arc::clone(&channel));
        Ok(channel)
    }

    pub fn get(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.channels.lock().get(key).cloned()
    }

    /// Append one point, creating the channel on first use
    pub fn add_point(&self, key: &ChannelKey, time: f64, value: Value) -> Result<()> {
        self.get_or_create(key, value.value_type())?.append(time, value)
    }

    /// Append several points to one channel, creating it on first use.
    ///
    /// The channel type is taken from the first point; all points must share it.
    pub fn add_points(&self, key: &ChannelKey, points: &[DataPoint]) -> Result<()> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        self.get_or_create(key, first.value.value_type())?
            .append_batch(points)
    }

    /// All keys, sorted
    pub fn list_keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = self.channels.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// All channels, sorted by key
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<Arc<Channel>> = self.channels.lock().values().cloned().collect();
        channels.sort_by(|a, b| a.key().cmp(b.key()));
        channels
    }

    /// Channels belonging to one session, sorted by key
    pub fn channels_for_session(&self, session_id: &str) -> Vec<Arc<Channel>> {
        self.channels()
            .into_iter()
            .filter(|c| c.key().session_id == session_id)
            .collect()
    }

    /// Key, type and point count of every channel, sorted by key.
    ///
    /// The structural lock is released before channels are inspected.
    pub fn metadata_snapshot(&self) -> Vec<ChannelInfo> {
        self.channels()
            .iter()
            .map(|channel| ChannelInfo {
                key: channel.key().clone(),
                value_type: channel.value_type(),
                points: channel.len(),
                normalized: channel.is_normalized(),
                time_range: channel.time_range(),
            })
            .collect()
    }

    /// Replace the tags of every channel in `session_id`. Returns the number tagged.
    pub fn tag_session(&self, session_id: &str, tags: &ChannelTags) -> usize {
        let channels = self.channels_for_session(session_id);
        for channel in &channels {
            channel.set_tags(tags.clone());
        }
        channels.len()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Total points across all channels
    pub fn total_points(&self) -> usize {
        self.channels().iter().map(|c| c.len()).sum()
    }

    /// Merge every channel of `other` into this store.
    ///
    /// Missing keys get an independent copy of `other`'s channel; keys of the
    /// same type get `other`'s raw points appended; keys of a different type
    /// are skipped and reported in `MergeReport::conflicts`.
    pub fn merge_from(&self, other: &ChannelStore) -> MergeReport {
        let mut report = MergeReport::default();
        if std::ptr::eq(self, other) {
            log::warn!("Ignoring merge of a channel store into itself");
            return report;
        }

        let (mut mine, theirs) = if (self as *const Self) < (other as *const Self) {
            let mine = self.channels.lock();
            let theirs = other.channels.lock();
            (mine, theirs)
        } else {
            let theirs = other.channels.lock();
            let mine = self.channels.lock();
            (mine, theirs)
        };

        let mut keys: Vec<&ChannelKey> = theirs.keys().collect();
        keys.sort();

        for key in keys {
            let Some(incoming) = theirs.get(key) else {
                continue;
            };

            let existing = mine.get(key).cloned();
            match existing {
                None => {
                    let copy = incoming.deep_clone();
                    report.points += copy.len();
                    report.cloned += 1;
                    mine.insert(key.clone(), Arc::new(copy));
                }
                Some(existing) if existing.value_type() == incoming.value_type() => {
                    match existing.append_from(incoming) {
                        Ok(moved) => {
                            report.points += moved;
                            report.appended += 1;
                        }
                        Err(e) => log::error!("Failed to merge channel {}: {}", key, e),
                    }
                }
                Some(existing) => {
                    log::error!(
                        "Type mismatch merging channel {}: store holds {}, incoming {}; skipped",
                        key,
                        existing.value_type(),
                        incoming.value_type()
                    );
                    report.conflicts.push(MergeConflict {
                        key: key.clone(),
                        existing: existing.value_type(),
                        incoming: incoming.value_type(),
                    });
                }
            }
        }

        log::debug!(
            "Merged store: {} cloned, {} appended, {} points, {} conflicts",
            report.cloned,
            report.appended,
            report.points,
            report.conflicts.len()
        );
        report
    }
}
