//! Core types for Ceres

use crate::{CeresError, Result};
use serde::{Deserialize, Serialize};

/// Timestamp in seconds since Unix epoch
pub type Timestamp = i64;

/// A single incoming sample. `None` values are dropped on write.
pub type Datapoint = (Timestamp, Option<f64>);

/// A run of datapoints spaced exactly one time step apart
pub type Run = Vec<(Timestamp, f64)>;

/// Contiguous fixed-interval series returned by reads.
///
/// `values[i]` holds the sample for `start_time + i * time_step`; `None`
/// marks an interval with no data. The number of values always equals
/// `(end_time - start_time) / time_step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTimeSeriesData")]
pub struct TimeSeriesData {
    /// First interval covered (inclusive)
    pub start_time: Timestamp,
    /// End of the covered range (exclusive)
    pub end_time: Timestamp,
    /// Seconds between consecutive values
    pub time_step: Timestamp,
    values: Vec<Option<f64>>,
}

/// Wire form of [`TimeSeriesData`], checked by `TimeSeriesData::new`
#[derive(Deserialize)]
struct RawTimeSeriesData {
    start_time: Timestamp,
    end_time: Timestamp,
    time_step: Timestamp,
    values: Vec<Option<f64>>,
}

impl TryFrom<RawTimeSeriesData> for TimeSeriesData {
    type Error = CeresError;

    fn try_from(raw: RawTimeSeriesData) -> Result<Self> {
        Self::new(raw.start_time, raw.end_time, raw.time_step, raw.values)
    }
}

impl TimeSeriesData {
    /// Build a series, checking that `values` spans the interval exactly
    pub fn new(
        start_time: Timestamp,
        end_time: Timestamp,
        time_step: Timestamp,
        values: Vec<Option<f64>>,
    ) -> Result<Self> {
        if time_step <= 0 {
            return Err(CeresError::InvalidRequest(format!(
                "time step must be positive, got {}",
                time_step
            )));
        }
        if end_time < start_time || (end_time - start_time) % time_step != 0 {
            return Err(CeresError::InvalidRequest(format!(
                "interval ({}, {}) is not a whole number of {}s steps",
                start_time, end_time, time_step
            )));
        }
        let expected = ((end_time - start_time) / time_step) as usize;
        if values.len() != expected {
            return Err(CeresError::InvalidRequest(format!(
                "interval ({}, {}) needs {} values, got {}",
                start_time,
                end_time,
                expected,
                values.len()
            )));
        }
        Ok(Self {
            start_time,
            end_time,
            time_step,
            values,
        })
    }

    /// Series of `None` covering the interval
    pub fn empty(start_time: Timestamp, end_time: Timestamp, time_step: Timestamp) -> Result<Self> {
        let count = if time_step > 0 && end_time > start_time {
            ((end_time - start_time) / time_step) as usize
        } else {
            0
        };
        Self::new(start_time, end_time, time_step, vec![None; count])
    }

    /// Sample values, one per interval
    pub fn values(&self) -> &[Option<f64>] {
        &self.values
    }

    /// Consume the series, returning its values
    pub fn into_values(self) -> Vec<Option<f64>> {
        self.values
    }

    /// Interval start timestamps, one per value
    pub fn timestamps(&self) -> impl Iterator<Item = Timestamp> {
        (self.start_time..self.end_time).step_by(self.time_step as usize)
    }

    /// Iterate `(timestamp, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (Timestamp, Option<f64>)> + '_ {
        self.timestamps().zip(self.values.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Fill missing values from `other`.
    ///
    /// Only `None` slots are written; present values are never replaced.
    /// Samples from `other` outside this series' interval are ignored.
    pub fn merge(&mut self, other: &TimeSeriesData) {
        for (timestamp, value) in other.iter() {
            let Some(value) = value else { continue };
            if timestamp < self.start_time || timestamp >= self.end_time {
                continue;
            }
            let index = ((timestamp - self.start_time) / self.time_step) as usize;
            if let Some(slot) = self.values.get_mut(index) {
                if slot.is_none() {
                    *slot = Some(value);
                }
            }
        }
    }
}
