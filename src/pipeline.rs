//! Data Pipeline: the per-reading transform chain between a driver's raw
//! output and the sinks.
//!
//! Stages run in order: range-check (tag uncertain, never clip) → scale
//! (raw*factor+offset) → change-detection/deadband → quality+timestamp
//! stamping → fan-out. Each stage is a plain function so the worker's
//! polling loop can call them inline without an actor/channel per point.

use crate::model::{CurrentValue, DataPoint, Quality, TimestampedValue, Value};
use chrono::Utc;
use std::collections::HashMap;

/// Runs the per-point transform chain and decides whether the result
/// should be fanned out to history (cache always receives the latest
/// value; see [`FanOut`]).
pub struct Pipeline {
    /// Last good engineering value per point, used for deadband comparison.
    last_values: HashMap<uuid::Uuid, f64>,
    /// Wall-clock of the last time a point was forwarded to history.
    last_logged_at: HashMap<uuid::Uuid, chrono::DateTime<Utc>>,
    /// Last quality stamped per point, and when it was last stamped;
    /// `quality_timestamp` only advances when quality differs from this.
    last_quality: HashMap<uuid::Uuid, (Quality, chrono::DateTime<Utc>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub to_cache: bool,
    pub to_history: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            last_values: HashMap::new(),
            last_logged_at: HashMap::new(),
            last_quality: HashMap::new(),
        }
    }

    /// Process one raw driver reading into a [`TimestampedValue`] plus the
    /// fan-out decision for it. `raw_value` is `None` when the driver
    /// reported a read failure for this point; quality is forced to `Bad`
    /// in that case and no scaling/deadband logic runs.
    pub fn process(&mut self, point: &DataPoint, raw_value: Option<Value>, driver_quality: Quality) -> (TimestampedValue, FanOut) {
        let now = Utc::now();

        let Some(raw_value) = raw_value else {
            let quality_timestamp = self.stamp_quality(point.id, Quality::Bad, now);
            let tv = TimestampedValue {
                point_id: point.id,
                value: Value::Bool(false),
                quality: Quality::Bad,
                source_timestamp: now,
                ingress_timestamp: now,
                quality_timestamp,
                changed: false,
            };
            return (tv, FanOut { to_cache: true, to_history: false });
        };

        let mut quality = driver_quality;

        let scaled = match raw_value.as_f64() {
            Some(raw) => {
                if !point.in_range(raw) {
                    quality = Quality::Uncertain;
                }
                let engineering = raw * point.scaling_factor + point.scaling_offset;
                Value::from_f64(point.data_type, engineering)
            }
            None => raw_value,
        };

        let changed = self.detect_change(point, &scaled);
        let quality_timestamp = self.stamp_quality(point.id, quality, now);

        let tv = TimestampedValue {
            point_id: point.id,
            value: scaled,
            quality,
            source_timestamp: now,
            ingress_timestamp: now,
            quality_timestamp,
            changed,
        };

        let fan_out = self.decide_fan_out(point, &tv, now);
        (tv, fan_out)
    }

    /// Returns the quality_timestamp to use: `now` if `quality` differs from
    /// the last quality recorded for this point, else the previously
    /// recorded timestamp carried forward.
    fn stamp_quality(&mut self, point_id: uuid::Uuid, quality: Quality, now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
        match self.last_quality.get(&point_id) {
            Some((prev_quality, prev_timestamp)) if *prev_quality == quality => *prev_timestamp,
            _ => {
                self.last_quality.insert(point_id, (quality, now));
                now
            }
        }
    }

    /// Change-detection against `log_deadband`. Non-numeric values are
    /// always considered changed (no meaningful distance metric).
    fn detect_change(&mut self, point: &DataPoint, value: &Value) -> bool {
        match value.as_f64() {
            Some(n) => {
                let changed = match self.last_values.get(&point.id) {
                    Some(prev) => (n - prev).abs() > point.log_deadband,
                    None => true,
                };
                self.last_values.insert(point.id, n);
                changed
            }
            None => true,
        }
    }

    fn decide_fan_out(&mut self, point: &DataPoint, tv: &TimestampedValue, now: chrono::DateTime<Utc>) -> FanOut {
        if !point.log_enabled {
            return FanOut { to_cache: true, to_history: false };
        }

        let interval_elapsed = self
            .last_logged_at
            .get(&point.id)
            .map(|last| (now - *last).num_milliseconds() as u64 >= point.log_interval_ms)
            .unwrap_or(true);

        let to_history = tv.changed || interval_elapsed;
        if to_history {
            self.last_logged_at.insert(point.id, now);
        }

        FanOut { to_cache: true, to_history }
    }
}

/// Build the cache sink's persisted shape from a processed reading.
pub fn to_current_value(device_id: uuid::Uuid, tv: &TimestampedValue, source: &str, read_count: u64) -> CurrentValue {
    CurrentValue {
        device_id,
        point_id: tv.point_id,
        value: tv.value.clone(),
        quality: tv.quality,
        value_timestamp: tv.source_timestamp,
        quality_timestamp: tv.quality_timestamp,
        source: source.to_string(),
        read_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;
    use uuid::Uuid;

    fn point(factor: f64, offset: f64, deadband: f64, min: Option<f64>, max: Option<f64>) -> DataPoint {
        DataPoint {
            id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            name: "p".into(),
            address: Some(40001),
            address_string: None,
            data_type: DataType::Float64,
            unit: None,
            scaling_factor: factor,
            scaling_offset: offset,
            min_value: min,
            max_value: max,
            writable: false,
            enabled: true,
            log_enabled: true,
            log_interval_ms: 60_000,
            log_deadband: deadband,
            poll_group: None,
            protocol_params: HashMap::new(),
        }
    }

    #[test]
    fn scales_raw_value_by_factor_and_offset() {
        let mut pipeline = Pipeline::new();
        let p = point(2.0, 5.0, 0.0, None, None);
        let (tv, _) = pipeline.process(&p, Some(Value::Float64(10.0)), Quality::Good);
        assert_eq!(tv.value.as_f64(), Some(25.0));
    }

    #[test]
    fn out_of_range_marks_uncertain_but_does_not_clip() {
        let mut pipeline = Pipeline::new();
        let p = point(1.0, 0.0, 0.0, Some(0.0), Some(100.0));
        let (tv, _) = pipeline.process(&p, Some(Value::Float64(150.0)), Quality::Good);
        assert_eq!(tv.quality, Quality::Uncertain);
        assert_eq!(tv.value.as_f64(), Some(150.0));
    }

    #[test]
    fn deadband_suppresses_small_changes() {
        let mut pipeline = Pipeline::new();
        let p = point(1.0, 0.0, 1.0, None, None);
        let (tv1, fan1) = pipeline.process(&p, Some(Value::Float64(10.0)), Quality::Good);
        assert!(tv1.changed);
        assert!(fan1.to_history);

        let (tv2, _) = pipeline.process(&p, Some(Value::Float64(10.5)), Quality::Good);
        assert!(!tv2.changed);

        let (tv3, _) = pipeline.process(&p, Some(Value::Float64(12.0)), Quality::Good);
        assert!(tv3.changed);
    }

    #[test]
    fn read_failure_produces_bad_quality_cache_only_fanout() {
        let mut pipeline = Pipeline::new();
        let p = point(1.0, 0.0, 0.0, None, None);
        let (tv, fan) = pipeline.process(&p, None, Quality::Good);
        assert_eq!(tv.quality, Quality::Bad);
        assert!(fan.to_cache);
        assert!(!fan.to_history);
    }

    #[test]
    fn log_disabled_points_never_go_to_history() {
        let mut pipeline = Pipeline::new();
        let mut p = point(1.0, 0.0, 0.0, None, None);
        p.log_enabled = false;
        let (_, fan) = pipeline.process(&p, Some(Value::Float64(1.0)), Quality::Good);
        assert!(!fan.to_history);
    }

    #[test]
    fn quality_timestamp_only_advances_on_transition() {
        let mut pipeline = Pipeline::new();
        let p = point(1.0, 0.0, 0.0, Some(0.0), Some(100.0));
        let (tv1, _) = pipeline.process(&p, Some(Value::Float64(150.0)), Quality::Good);
        assert_eq!(tv1.quality, Quality::Uncertain);
        let stamped_at = tv1.quality_timestamp;

        let (tv2, _) = pipeline.process(&p, Some(Value::Float64(160.0)), Quality::Good);
        assert_eq!(tv2.quality, Quality::Uncertain);
        assert_eq!(tv2.quality_timestamp, stamped_at);

        let (tv3, _) = pipeline.process(&p, Some(Value::Float64(50.0)), Quality::Good);
        assert_eq!(tv3.quality, Quality::Good);
        assert!(tv3.quality_timestamp >= stamped_at);
    }

    #[test]
    fn interval_elapsed_forces_history_even_without_change() {
        let mut pipeline = Pipeline::new();
        let mut p = point(1.0, 0.0, 100.0, None, None);
        p.log_interval_ms = 0;
        let (_, fan1) = pipeline.process(&p, Some(Value::Float64(10.0)), Quality::Good);
        assert!(fan1.to_history);
        let (tv2, fan2) = pipeline.process(&p, Some(Value::Float64(10.0)), Quality::Good);
        assert!(!tv2.changed);
        assert!(fan2.to_history);
    }
}
