//! Removable running statistics.
//!
//! [`AggregateStat`] keeps every contributed value so a contribution can be
//! retracted exactly, which is what lets an edited or deleted conversation be
//! re-indexed without touching any other conversation of the same entity.

use serde::{Deserialize, Serialize};

// ============================================================================
// AggregateStat
// ============================================================================

/// Count/total/min/max/avg over a bag of samples that supports removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStat {
    pub count: u64,
    pub total: f64,
    /// `+inf` while empty
    #[serde(with = "infinity_as_null")]
    pub min: f64,
    /// `0` while empty
    pub max: f64,
    pub avg: f64,
    /// Number of underlying samples when this stat folds other stats' totals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_count: Option<u64>,
    /// Every contributed value, in contribution order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<f64>,
}

impl Default for AggregateStat {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregateStat {
    pub fn new() -> Self {
        Self {
            count: 0,
            total: 0.0,
            min: f64::INFINITY,
            max: 0.0,
            avg: 0.0,
            sub_count: None,
            values: Vec::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Add one sample. `None` and NaN are ignored.
    pub fn add(&mut self, value: impl Into<Option<f64>>) {
        let Some(value) = value.into().filter(|v| !v.is_nan()) else {
            return;
        };

        self.count += 1;
        self.total += value;
        self.avg = self.total / self.count as f64;
        self.values.push(value);

        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
    }

    /// Remove one previously added sample. `None` and NaN are ignored.
    ///
    /// A value that was never added is reported and otherwise ignored.
    pub fn remove(&mut self, value: impl Into<Option<f64>>) {
        let Some(value) = value.into().filter(|v| !v.is_nan()) else {
            return;
        };

        let Some(pos) = self.values.iter().position(|&v| v == value) else {
            tracing::warn!(
                value,
                count = self.count,
                "aggregate stat: removing a value that was never added"
            );
            return;
        };
        self.values.remove(pos);

        self.count = self.values.len() as u64;
        // Re-summing in contribution order keeps the total identical to one
        // built from the remaining values alone.
        self.total = self.values.iter().fold(0.0, |acc, v| acc + v);
        self.avg = if self.count == 0 {
            0.0
        } else {
            self.total / self.count as f64
        };

        if value == self.min || value == self.max {
            self.recompute_extremes();
        }
    }

    /// Add every retained value of `other` as its own sample.
    pub fn add_aggregated(&mut self, other: &AggregateStat) {
        for &value in &other.values {
            self.add(value);
        }
    }

    /// Mirror of [`add_aggregated`](Self::add_aggregated).
    pub fn remove_aggregated(&mut self, other: &AggregateStat) {
        for &value in &other.values {
            self.remove(value);
        }
    }

    /// Add `other.total` as a single sample and remember how many samples
    /// informed it. An empty `other` still adds one sample of `0`.
    pub fn add_aggregated_as_one(&mut self, other: &AggregateStat) {
        self.add(other.total);
        self.sub_count = Some(self.sub_count.unwrap_or(0) + other.count);
    }

    /// Mirror of [`add_aggregated_as_one`](Self::add_aggregated_as_one).
    pub fn remove_aggregated_as_one(&mut self, other: &AggregateStat) {
        self.remove(other.total);
        self.sub_count = self
            .sub_count
            .map(|n| n.saturating_sub(other.count))
            .filter(|&n| n > 0 || self.count > 0);
    }

    fn recompute_extremes(&mut self) {
        self.min = self.values.iter().copied().fold(f64::INFINITY, f64::min);
        self.max = self.values.iter().copied().fold(0.0, f64::max);
    }
}

/// JSON has no infinity; the empty-min sentinel travels as `null`.
mod infinity_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat_of(values: &[f64]) -> AggregateStat {
        let mut stat = AggregateStat::new();
        for &v in values {
            stat.add(v);
        }
        stat
    }

    #[test]
    fn add_tracks_count_total_min_max_avg() {
        let stat = stat_of(&[3.0, 1.0, 5.0]);
        assert_eq!(stat.count, 3);
        assert_eq!(stat.total, 9.0);
        assert_eq!(stat.min, 1.0);
        assert_eq!(stat.max, 5.0);
        assert_eq!(stat.avg, 3.0);
        assert_eq!(stat.values, vec![3.0, 1.0, 5.0]);
    }

    #[test]
    fn null_and_nan_are_ignored() {
        let mut stat = stat_of(&[2.0]);
        stat.add(None);
        stat.add(f64::NAN);
        stat.remove(None);
        stat.remove(f64::NAN);
        assert_eq!(stat.count, 1);
        assert_eq!(stat.total, 2.0);
    }

    #[test]
    fn removing_min_recomputes_from_remaining() {
        let mut stat = stat_of(&[3.0, 1.0, 5.0]);
        stat.remove(1.0);
        assert_eq!(stat.min, 3.0);
        assert_eq!(stat.max, 5.0);
        assert_eq!(stat.count, 2);
        assert_eq!(stat.avg, 4.0);
    }

    #[test]
    fn removing_max_recomputes_from_remaining() {
        let mut stat = stat_of(&[3.0, 1.0, 5.0]);
        stat.remove(5.0);
        assert_eq!(stat.max, 3.0);
        assert_eq!(stat.min, 1.0);
    }

    #[test]
    fn add_then_remove_restores_previous_state() {
        let mut stat = stat_of(&[0.1, 7.25, 3.0, 0.2]);
        let before = stat.clone();

        stat.add(0.30000000000000004);
        stat.remove(0.30000000000000004);
        assert_eq!(stat, before);

        stat.add(100.0);
        stat.remove(100.0);
        assert_eq!(stat, before);

        stat.add(0.0);
        stat.remove(0.0);
        assert_eq!(stat, before);
    }

    #[test]
    fn removing_everything_returns_to_empty_sentinels() {
        let mut stat = stat_of(&[4.0]);
        stat.remove(4.0);
        assert_eq!(stat.count, 0);
        assert_eq!(stat.total, 0.0);
        assert_eq!(stat.avg, 0.0);
        assert_eq!(stat.min, f64::INFINITY);
        assert_eq!(stat.max, 0.0);
    }

    #[test]
    fn removing_unknown_value_leaves_stat_untouched() {
        let mut stat = stat_of(&[1.0, 2.0]);
        let before = stat.clone();
        stat.remove(42.0);
        assert_eq!(stat, before);
    }

    #[test]
    fn duplicate_values_are_removed_one_at_a_time() {
        let mut stat = stat_of(&[2.0, 2.0, 1.0]);
        stat.remove(2.0);
        assert_eq!(stat.count, 2);
        assert_eq!(stat.max, 2.0);
        stat.remove(2.0);
        assert_eq!(stat.max, 1.0);
    }

    #[test]
    fn aggregated_folds_every_value() {
        let inner = stat_of(&[1.0, 2.0, 3.0]);
        let mut outer = stat_of(&[10.0]);

        outer.add_aggregated(&inner);
        assert_eq!(outer.count, 4);
        assert_eq!(outer.total, 16.0);
        assert_eq!(outer.sub_count, None);

        outer.remove_aggregated(&inner);
        assert_eq!(outer, stat_of(&[10.0]));
    }

    #[test]
    fn aggregated_as_one_folds_total_and_tracks_sub_count() {
        let first = stat_of(&[1.0, 2.0, 3.0]);
        let second = stat_of(&[4.0]);
        let mut outer = AggregateStat::new();

        outer.add_aggregated_as_one(&first);
        outer.add_aggregated_as_one(&second);
        assert_eq!(outer.count, 2);
        assert_eq!(outer.values, vec![6.0, 4.0]);
        assert_eq!(outer.sub_count, Some(4));
        assert_eq!(outer.min, 4.0);
        assert_eq!(outer.max, 6.0);

        outer.remove_aggregated_as_one(&first);
        assert_eq!(outer.count, 1);
        assert_eq!(outer.sub_count, Some(1));
        assert_eq!(outer.min, 4.0);
        assert_eq!(outer.max, 4.0);

        outer.remove_aggregated_as_one(&second);
        assert_eq!(outer, AggregateStat::new());
    }

    #[test]
    fn aggregated_as_one_counts_empty_stats_as_zero() {
        let mut outer = AggregateStat::new();
        outer.add_aggregated_as_one(&stat_of(&[1000.0, 2000.0]));
        outer.add_aggregated_as_one(&AggregateStat::new());
        assert_eq!(outer.count, 2);
        assert_eq!(outer.values, vec![3000.0, 0.0]);
        assert_eq!(outer.avg, 1500.0);
        assert_eq!(outer.min, 0.0);
        assert_eq!(outer.sub_count, Some(2));

        outer.remove_aggregated_as_one(&AggregateStat::new());
        assert_eq!(outer.count, 1);
        assert_eq!(outer.min, 3000.0);
        assert_eq!(outer.sub_count, Some(2));

        outer.remove_aggregated_as_one(&stat_of(&[1000.0, 2000.0]));
        assert_eq!(outer, AggregateStat::new());
    }

    #[test]
    fn aggregated_as_one_of_only_empty_stats_removes_cleanly() {
        let mut outer = AggregateStat::new();
        outer.add_aggregated_as_one(&AggregateStat::new());
        assert_eq!(outer.count, 1);
        assert_eq!(outer.total, 0.0);
        assert_eq!(outer.sub_count, Some(0));

        outer.remove_aggregated_as_one(&AggregateStat::new());
        assert_eq!(outer, AggregateStat::new());
    }

    #[test]
    fn empty_min_survives_json_round_trip() {
        let stat = AggregateStat::new();
        let json = simd_json::to_string(&stat).expect("serialize");
        assert!(json.contains("\"min\":null"), "unexpected json: {json}");

        let mut bytes = json.into_bytes();
        let back: AggregateStat = simd_json::from_slice(&mut bytes).expect("deserialize");
        assert_eq!(back.min, f64::INFINITY);
        assert_eq!(back, stat);
    }
}
