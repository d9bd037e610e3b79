//! Turning arbitrary incoming datapoints into contiguous runs

use crate::{Datapoint, Run, Timestamp};

/// Sort, align and split datapoints into maximal contiguous runs.
///
/// `None` values are dropped. Timestamps are rounded down to a multiple of
/// `time_step`. Points are stable-sorted by their raw timestamp, and
/// when several land on the same interval only the first one is kept.
/// Runs come back oldest first.
pub fn compact(datapoints: &[Datapoint], time_step: Timestamp) -> Vec<Run> {
    let mut points: Vec<(Timestamp, f64)> = datapoints
        .iter()
        .filter_map(|&(timestamp, value)| value.map(|v| (timestamp, v)))
        .collect();
    points.sort_by_key(|&(timestamp, _)| timestamp);

    let mut runs = Vec::new();
    let mut run: Run = Vec::new();
    for (timestamp, value) in points {
        let timestamp = timestamp - timestamp.rem_euclid(time_step);
        match run.last() {
            None => run.push((timestamp, value)),
            Some(&(last, _)) if last == timestamp => continue,
            Some(&(last, _)) if timestamp == last + time_step => run.push((timestamp, value)),
            Some(_) => runs.push(std::mem::replace(&mut run, vec![(timestamp, value)])),
        }
    }
    if !run.is_empty() {
        runs.push(run);
    }
    runs
}
