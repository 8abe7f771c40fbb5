//! Typed time series
//!
//! A [`Channel`] holds the samples of one measurement/field pair within a
//! session. Its value type is fixed at creation and every write is checked
//! against it. Points are stored column-wise (times plus one typed column) and
//! kept in arrival order until [`Channel::normalize`] sorts them and collapses
//! duplicate timestamps.
//!
//! # Averaging and casting
//!
//! Means and interpolations are computed in `f64` and cast back to the
//! channel's type: floats with `as`, unsigned integers by truncation toward
//! zero (saturating at the type bounds), booleans as `true` iff the value is
//! at least 0.5.
//!
//! # Locking
//!
//! Each channel has its own data lock. When a store operation touches both a
//! store and a channel, the store's structural lock is taken first.

use crate::types::{ChannelKey, DataPoint, Result, TelemetryError, Value, ValueType};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Descriptive tags attached to a channel and emitted on export
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTags {
    #[serde(default)]
    pub car: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub competition: String,
    #[serde(default)]
    pub log_type: String,
    /// Free-form tags
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ChannelTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_car(mut self, car: impl Into<String>) -> Self {
        self.car = car.into();
        self
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    pub fn with_competition(mut self, competition: impl Into<String>) -> Self {
        self.competition = competition.into();
        self
    }

    pub fn with_log_type(mut self, log_type: impl Into<String>) -> Self {
        self.log_type = log_type.into();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Non-empty tags in export order: the named tags first, then free-form
    /// tags sorted by key.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let named = [
            ("car", self.car.as_str()),
            ("driver", self.driver.as_str()),
            ("event", self.event.as_str()),
            ("competition", self.competition.as_str()),
            ("log_type", self.log_type.as_str()),
        ];
        named
            .into_iter()
            .chain(self.extra.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect()
    }
}

/// Conversion between a column element and the f64 working type
trait Sample: Copy {
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
    fn wrap(self) -> Value;
}

impl Sample for f32 {
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn wrap(self) -> Value {
        Value::F32(self)
    }
}

impl Sample for f64 {
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
    fn wrap(self) -> Value {
        Value::F64(self)
    }
}

macro_rules! impl_unsigned_sample {
    ($($ty:ty => $variant:ident),*) => {
        $(
            impl Sample for $ty {
                fn to_f64(self) -> f64 {
                    self as f64
                }
                // `as` truncates toward zero and saturates
                fn from_f64(v: f64) -> Self {
                    v as $ty
                }
                fn wrap(self) -> Value {
                    Value::$variant(self)
                }
            }
        )*
    };
}

impl_unsigned_sample!(u8 => U8, u16 => U16, u32 => U32);

impl Sample for bool {
    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
    fn from_f64(v: f64) -> Self {
        v >= 0.5
    }
    fn wrap(self) -> Value {
        Value::Bool(self)
    }
}

/// Sample storage of one fixed type
#[derive(Debug, Clone, PartialEq)]
enum Column {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    Bool(Vec<bool>),
}

/// Run `$body` with `$v` bound to the typed vector inside `$col`
macro_rules! with_column {
    ($col:expr, $v:ident => $body:expr) => {
        match $col {
            Column::F32($v) => $body,
            Column::F64($v) => $body,
            Column::U8($v) => $body,
            Column::U16($v) => $body,
            Column::U32($v) => $body,
            Column::Bool($v) => $body,
        }
    };
}

impl Column {
    fn new(value_type: ValueType) -> Self {
        match value_type {
            ValueType::F32 => Column::F32(Vec::new()),
            ValueType::F64 => Column::F64(Vec::new()),
            ValueType::U8 => Column::U8(Vec::new()),
            ValueType::U16 => Column::U16(Vec::new()),
            ValueType::U32 => Column::U32(Vec::new()),
            ValueType::Bool => Column::Bool(Vec::new()),
        }
    }

    /// Push a value of the column's type; returns false on a type mismatch
    fn push(&mut self, value: Value) -> bool {
        match (self, value) {
            (Column::F32(v), Value::F32(x)) => v.push(x),
            (Column::F64(v), Value::F64(x)) => v.push(x),
            (Column::U8(v), Value::U8(x)) => v.push(x),
            (Column::U16(v), Value::U16(x)) => v.push(x),
            (Column::U32(v), Value::U32(x)) => v.push(x),
            (Column::Bool(v), Value::Bool(x)) => v.push(x),
            _ => return false,
        }
        true
    }

    /// Append all values of `other`; returns false on a type mismatch
    fn extend_from(&mut self, other: &Column) -> bool {
        match (self, other) {
            (Column::F32(a), Column::F32(b)) => a.extend_from_slice(b),
            (Column::F64(a), Column::F64(b)) => a.extend_from_slice(b),
            (Column::U8(a), Column::U8(b)) => a.extend_from_slice(b),
            (Column::U16(a), Column::U16(b)) => a.extend_from_slice(b),
            (Column::U32(a), Column::U32(b)) => a.extend_from_slice(b),
            (Column::Bool(a), Column::Bool(b)) => a.extend_from_slice(b),
            _ => return false,
        }
        true
    }

    fn get(&self, index: usize) -> Value {
        with_column!(self, v => v[index].wrap())
    }

    fn reserve(&mut self, additional: usize) {
        with_column!(self, v => v.reserve(additional))
    }
}

/// Sort by time (stable) and replace each run of equal timestamps with its mean
fn sort_and_average<T: Sample>(times: &[f64], values: &[T]) -> (Vec<f64>, Vec<T>) {
    let mut order: Vec<usize> = (0..times.len()).collect();
    order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));

    let mut out_times = Vec::with_capacity(order.len());
    let mut out_values = Vec::with_capacity(order.len());

    let mut i = 0;
    while i < order.len() {
        let t = times[order[i]];
        let mut j = i + 1;
        while j < order.len() && times[order[j]] == t {
            j += 1;
        }

        let value = if j - i == 1 {
            values[order[i]]
        } else {
            let sum: f64 = order[i..j].iter().map(|&k| values[k].to_f64()).sum();
            T::from_f64(sum / (j - i) as f64)
        };

        out_times.push(t);
        out_values.push(value);
        i = j;
    }

    (out_times, out_values)
}

fn lerp<T: Sample>(values: &[T], upper: usize, t0: f64, t1: f64, t: f64) -> Value {
    let a = values[upper - 1].to_f64();
    let b = values[upper].to_f64();
    T::from_f64(a + (b - a) * (t - t0) / (t1 - t0)).wrap()
}

/// Point storage guarded by the channel's data lock
#[derive(Debug, Clone)]
struct ChannelData {
    times: Vec<f64>,
    values: Column,
    normalized: bool,
}

impl ChannelData {
    fn new(value_type: ValueType) -> Self {
        Self {
            times: Vec::new(),
            values: Column::new(value_type),
            normalized: true,
        }
    }

    /// A value of the wrong type is refused and leaves times, values and the
    /// normalized flag untouched
    fn push(&mut self, time: f64, value: Value) -> bool {
        if !self.values.push(value) {
            return false;
        }
        if let Some(&last) = self.times.last() {
            if time <= last {
                self.normalized = false;
            }
        }
        self.times.push(time);
        true
    }

    fn normalize(&mut self) {
        if self.normalized {
            return;
        }

        let times = &self.times;
        let sorted_times = with_column!(&mut self.values, values => {
            let (t, v) = sort_and_average(times, values.as_slice());
            *values = v;
            t
        });
        self.times = sorted_times;
        self.normalized = true;
    }

    fn points(&self) -> Vec<DataPoint> {
        self.times
            .iter()
            .enumerate()
            .map(|(i, &time)| DataPoint::new(time, self.values.get(i)))
            .collect()
    }
}

/// A single typed time series
#[derive(Debug)]
pub struct Channel {
    key: ChannelKey,
    value_type: ValueType,
    data: Mutex<ChannelData>,
    tags: Mutex<ChannelTags>,
}

impl Channel {
    /// Create an empty channel. An empty channel is normalized.
    pub fn new(key: ChannelKey, value_type: ValueType) -> Self {
        Self {
            key,
            value_type,
            data: Mutex::new(ChannelData::new(value_type)),
            tags: Mutex::new(ChannelTags::default()),
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// The type fixed at creation
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    fn check_type(&self, found: ValueType) -> Result<()> {
        if found != self.value_type {
            return Err(TelemetryError::TypeMismatch {
                key: self.key.clone(),
                expected: self.value_type,
                found,
            });
        }
        Ok(())
    }

    fn check_time(time: f64) -> Result<()> {
        if !time.is_finite() {
            return Err(TelemetryError::InvalidTimestamp(time));
        }
        Ok(())
    }

    /// Append one point. Out-of-order or duplicate times clear the normalized flag.
    pub fn append(&self, time: f64, value: Value) -> Result<()> {
        self.check_type(value.value_type())?;
        Self::check_time(time)?;
        self.data.lock().push(time, value);
        Ok(())
    }

    /// Append a batch of points. Nothing is written unless every point is valid.
    pub fn append_batch(&self, points: &[DataPoint]) -> Result<()> {
        for point in points {
            self.check_type(point.value.value_type())?;
            Self::check_time(point.time)?;
        }

        let mut data = self.data.lock();
        data.times.reserve(points.len());
        data.values.reserve(points.len());
        for point in points {
            data.push(point.time, point.value);
        }
        Ok(())
    }

    /// Append every raw point of `other` (which may be unnormalized).
    ///
    /// The source is snapshotted before this channel is locked, so the two
    /// data locks are never held together. Returns the number of points added.
    pub fn append_from(&self, other: &Channel) -> Result<usize> {
        self.check_type(other.value_type)?;

        let snapshot = other.data.lock().clone();
        if snapshot.times.is_empty() {
            return Ok(0);
        }

        let mut data = self.data.lock();
        let stays_sorted = match (data.times.last(), snapshot.times.first()) {
            (Some(&last), Some(&first)) => first > last,
            _ => true,
        };
        data.normalized = data.normalized && snapshot.normalized && stays_sorted;
        if !data.values.extend_from(&snapshot.values) {
            return Err(TelemetryError::TypeMismatch {
                key: self.key.clone(),
                expected: self.value_type,
                found: other.value_type,
            });
        }
        data.times.extend_from_slice(&snapshot.times);
        Ok(snapshot.times.len())
    }

    /// Independent copy with its own storage, tags and normalized flag
    pub fn deep_clone(&self) -> Channel {
        Channel {
            key: self.key.clone(),
            value_type: self.value_type,
            data: Mutex::new(self.data.lock().clone()),
            tags: Mutex::new(self.tags.lock().clone()),
        }
    }

    /// Sort by time and average duplicate timestamps. No-op when already normalized.
    pub fn normalize(&self) {
        let mut data = self.data.lock();
        if !data.normalized {
            let before = data.times.len();
            data.normalize();
            log::trace!(
                "Normalized {}: {} -> {} points",
                self.key,
                before,
                data.times.len()
            );
        }
    }

    pub fn is_normalized(&self) -> bool {
        self.data.lock().normalized
    }

    /// Value at time `t`: clamped outside the series, linearly interpolated inside.
    ///
    /// Normalizes first if needed.
    pub fn value_at(&self, t: f64) -> Result<Value> {
        if t.is_nan() {
            return Err(TelemetryError::InvalidTimestamp(t));
        }

        let mut data = self.data.lock();
        if data.times.is_empty() {
            return Err(TelemetryError::EmptyChannel(self.key.clone()));
        }
        data.normalize();

        let times = &data.times;
        let last = times.len() - 1;
        if t <= times[0] {
            return Ok(data.values.get(0));
        }
        if t >= times[last] {
            return Ok(data.values.get(last));
        }

        let upper = times.partition_point(|&x| x < t);
        if times[upper] == t {
            return Ok(data.values.get(upper));
        }

        let (t0, t1) = (times[upper - 1], times[upper]);
        Ok(with_column!(&data.values, v => lerp(v.as_slice(), upper, t0, t1, t)))
    }

    /// Raw points in storage order (time-ordered only once normalized)
    pub fn points(&self) -> Vec<DataPoint> {
        self.data.lock().points()
    }

    /// Normalize, then return the points
    pub fn normalized_points(&self) -> Vec<DataPoint> {
        let mut data = self.data.lock();
        data.normalize();
        data.points()
    }

    pub fn len(&self) -> usize {
        self.data.lock().times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest and latest time, `None` when empty
    pub fn time_range(&self) -> Option<(f64, f64)> {
        let data = self.data.lock();
        if data.normalized {
            return Some((*data.times.first()?, *data.times.last()?));
        }
        data.times.iter().fold(None, |range, &t| match range {
            None => Some((t, t)),
            Some((lo, hi)) => Some((lo.min(t), hi.max(t))),
        })
    }

    pub fn tags(&self) -> ChannelTags {
        self.tags.lock().clone()
    }

    pub fn set_tags(&self, tags: ChannelTags) {
        *self.tags.lock() = tags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(value_type: ValueType) -> Channel {
        Channel::new(ChannelKey::new("CAN_2024-11-20(142000)", "vcu", "INS.vx"), value_type)
    }

    #[test]
    fn test_duplicate_timestamps_are_averaged() {
        let ch = channel(ValueType::F64);
        ch.append(5.0, Value::F64(2.0)).unwrap();
        ch.append(5.0, Value::F64(4.0)).unwrap();
        assert!(!ch.is_normalized());

        ch.normalize();
        assert!(ch.is_normalized());
        assert_eq!(ch.points(), vec![DataPoint::new(5.0, Value::F64(3.0))]);
    }

    #[test]
    fn test_normalize_sorts_and_is_idempotent() {
        let ch = channel(ValueType::F32);
        for (t, v) in [(3.0, 30.0), (1.0, 10.0), (2.0, 20.0), (1.0, 12.0)] {
            ch.append(t, Value::F32(v)).unwrap();
        }

        ch.normalize();
        let once = ch.points();
        ch.normalize();
        assert_eq!(ch.points(), once);
        assert_eq!(
            once,
            vec![
                DataPoint::new(1.0, Value::F32(11.0)),
                DataPoint::new(2.0, Value::F32(20.0)),
                DataPoint::new(3.0, Value::F32(30.0)),
            ]
        );
    }

    #[test]
    fn test_monotone_appends_stay_normalized() {
        let ch = channel(ValueType::U16);
        for t in 0..10 {
            ch.append(t as f64, Value::U16(t)).unwrap();
        }
        assert!(ch.is_normalized());
        assert_eq!(ch.time_range(), Some((0.0, 9.0)));
    }

    #[test]
    fn test_integer_and_bool_averaging() {
        let ints = channel(ValueType::U8);
        ints.append(1.0, Value::U8(3)).unwrap();
        ints.append(1.0, Value::U8(4)).unwrap();
        ints.normalize();
        assert_eq!(ints.points(), vec![DataPoint::new(1.0, Value::U8(3))]);

        let flags = channel(ValueType::Bool);
        flags.append(1.0, Value::Bool(true)).unwrap();
        flags.append(1.0, Value::Bool(false)).unwrap();
        flags.append(2.0, Value::Bool(false)).unwrap();
        flags.append(2.0, Value::Bool(false)).unwrap();
        flags.append(2.0, Value::Bool(true)).unwrap();
        flags.normalize();
        assert_eq!(
            flags.points(),
            vec![
                DataPoint::new(1.0, Value::Bool(true)),
                DataPoint::new(2.0, Value::Bool(false)),
            ]
        );
    }

    #[test]
    fn test_interpolation_and_clamping() {
        let ch = channel(ValueType::F64);
        ch.append(0.0, Value::F64(0.0)).unwrap();
        ch.append(10.0, Value::F64(10.0)).unwrap();

        assert_eq!(ch.value_at(5.0).unwrap(), Value::F64(5.0));
        assert_eq!(ch.value_at(-1.0).unwrap(), Value::F64(0.0));
        assert_eq!(ch.value_at(11.0).unwrap(), Value::F64(10.0));
        assert_eq!(ch.value_at(10.0).unwrap(), Value::F64(10.0));
    }

    #[test]
    fn test_interpolation_casts_back() {
        let ch = channel(ValueType::U32);
        ch.append(10.0, Value::U32(10)).unwrap();
        ch.append(0.0, Value::U32(0)).unwrap();
        assert_eq!(ch.value_at(2.5).unwrap(), Value::U32(2));
        assert!(ch.is_normalized());
    }

    #[test]
    fn test_value_at_empty_channel() {
        let ch = channel(ValueType::F32);
        assert!(matches!(
            ch.value_at(1.0),
            Err(TelemetryError::EmptyChannel(_))
        ));
        assert!(ch.value_at(f64::NAN).is_err());
    }

    #[test]
    fn test_refused_push_keeps_normalized_flag() {
        let mut data = ChannelData::new(ValueType::F32);
        assert!(data.push(5.0, Value::F32(1.0)));
        assert!(!data.push(1.0, Value::U8(1)));
        assert!(data.normalized);
        assert_eq!(data.times, vec![5.0]);

        assert!(data.push(1.0, Value::F32(2.0)));
        assert!(!data.normalized);
    }

    #[test]
    fn test_type_mismatch_leaves_data_unchanged() {
        let ch = channel(ValueType::F32);
        ch.append(1.0, Value::F32(1.5)).unwrap();

        let err = ch.append(2.0, Value::Bool(true)).unwrap_err();
        assert!(matches!(
            err,
            TelemetryError::TypeMismatch {
                expected: ValueType::F32,
                found: ValueType::Bool,
                ..
            }
        ));

        let batch = [
            DataPoint::new(3.0, Value::F32(2.0)),
            DataPoint::new(4.0, Value::U8(1)),
        ];
        assert!(ch.append_batch(&batch).is_err());
        assert_eq!(ch.points(), vec![DataPoint::new(1.0, Value::F32(1.5))]);
    }

    #[test]
    fn test_non_finite_time_rejected() {
        let ch = channel(ValueType::F64);
        assert!(matches!(
            ch.append(f64::INFINITY, Value::F64(1.0)),
            Err(TelemetryError::InvalidTimestamp(_))
        ));
        assert!(ch.is_empty());
    }

    #[test]
    fn test_append_from_tracks_order() {
        let a = channel(ValueType::F64);
        let b = channel(ValueType::F64);
        a.append(1.0, Value::F64(1.0)).unwrap();
        b.append(2.0, Value::F64(2.0)).unwrap();

        assert_eq!(a.append_from(&b).unwrap(), 1);
        assert!(a.is_normalized());

        let c = channel(ValueType::F64);
        c.append(0.5, Value::F64(0.5)).unwrap();
        a.append_from(&c).unwrap();
        assert!(!a.is_normalized());
        assert_eq!(a.len(), 3);
        assert_eq!(a.time_range(), Some((0.5, 2.0)));
    }

    #[test]
    fn test_append_from_self() {
        let a = channel(ValueType::U8);
        a.append(1.0, Value::U8(1)).unwrap();
        assert_eq!(a.append_from(&a).unwrap(), 1);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_append_from_type_mismatch() {
        let a = channel(ValueType::F32);
        let b = channel(ValueType::U8);
        b.append(1.0, Value::U8(1)).unwrap();
        assert!(a.append_from(&b).is_err());
        assert!(a.is_empty());
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let a = channel(ValueType::F32);
        a.append(1.0, Value::F32(1.0)).unwrap();
        a.set_tags(ChannelTags::new().with_car("ev24"));

        let b = a.deep_clone();
        b.append(2.0, Value::F32(2.0)).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
        assert_eq!(b.tags().car, "ev24");
    }

    #[test]
    fn test_tag_entries_skip_empty() {
        let tags = ChannelTags::new()
            .with_car("ev24")
            .with_event("endurance")
            .with_tag("track", "Hockenheim")
            .with_tag("empty", "");
        assert_eq!(
            tags.entries(),
            vec![("car", "ev24"), ("event", "endurance"), ("track", "Hockenheim")]
        );
    }
}
