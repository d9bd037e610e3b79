//! Series nodes - one directory per time series
//!
//! A node owns the slice files in its directory. Writes are compacted into
//! contiguous runs and routed to the newest compatible slice that can hold
//! them; reads walk slices newest-first and stitch their data together.
//!
//! Nodes perform no locking around file I/O. Exactly one writer per node is
//! assumed; concurrent writers may interleave records.

mod cache;
mod compact;

pub use cache::SliceCachingBehavior;
pub use compact::compact;

use crate::slice::{Slice, WriteOutcome};
use crate::{config, CeresError, Datapoint, Result, Run, TimeSeriesData, Timestamp};
use cache::{SliceCache, Snapshot};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Contents of the node marker file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Seconds per sample
    #[serde(rename = "timeStep")]
    pub time_step: Timestamp,
    /// Rollup method recorded for external tooling
    #[serde(
        rename = "aggregationMethod",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub aggregation_method: Option<String>,
    /// Any other properties, preserved as-is
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeMetadata {
    pub fn new(time_step: Timestamp) -> Self {
        Self {
            time_step,
            aggregation_method: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_aggregation_method(mut self, method: impl Into<String>) -> Self {
        self.aggregation_method = Some(method.into());
        self
    }

    /// Attach an arbitrary property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.time_step <= 0 {
            return Err(CeresError::InvalidConfiguration(format!(
                "timeStep must be a positive number of seconds, got {}",
                self.time_step
            )));
        }
        Ok(())
    }
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self::new(config::DEFAULT_TIMESTEP)
    }
}

/// One named time series backed by a directory of slices
#[derive(Debug)]
pub struct SeriesNode {
    name: String,
    fs_path: PathBuf,
    metadata_path: PathBuf,
    max_slice_gap: u64,
    time_step: RwLock<Option<Timestamp>>,
    slice_cache: Mutex<SliceCache>,
}

/// Whether a write pass finished or must start over
enum WritePass {
    Done,
    Retry,
}

impl SeriesNode {
    /// Handle to an existing node directory. Performs no I/O.
    pub fn new(
        name: impl Into<String>,
        fs_path: impl Into<PathBuf>,
        slice_caching: SliceCachingBehavior,
        max_slice_gap: u64,
    ) -> Self {
        let fs_path = fs_path.into();
        Self {
            name: name.into(),
            metadata_path: fs_path.join(config::NODE_MARKER),
            fs_path,
            max_slice_gap,
            time_step: RwLock::new(None),
            slice_cache: Mutex::new(SliceCache::new(slice_caching)),
        }
    }

    /// Create the node directory and write its metadata.
    ///
    /// No slice is created until the first write.
    pub fn create(
        name: impl Into<String>,
        fs_path: impl Into<PathBuf>,
        metadata: &NodeMetadata,
        slice_caching: SliceCachingBehavior,
        max_slice_gap: u64,
    ) -> Result<Self> {
        metadata.validate()?;
        let node = Self::new(name, fs_path, slice_caching, max_slice_gap);
        if node.metadata_path.exists() {
            return Err(CeresError::NodeExists(node.name));
        }
        create_dir_all(&node.fs_path)?;
        node.write_metadata(metadata)?;

        info!("Created node: {}", node.name);
        Ok(node)
    }

    /// True if `path` is a directory carrying the node marker
    pub fn is_node_dir(path: &Path) -> bool {
        path.is_dir() && path.join(config::NODE_MARKER).exists()
    }

    /// Dotted series name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fs_path(&self) -> &Path {
        &self.fs_path
    }

    /// Load metadata from disk, refreshing the cached time step
    pub fn read_metadata(&self) -> Result<NodeMetadata> {
        let raw = fs::read(&self.metadata_path).map_err(|e| self.map_missing(e))?;
        let metadata: NodeMetadata = serde_json::from_slice(&raw)?;
        metadata.validate()?;
        *self.time_step.write() = Some(metadata.time_step);
        Ok(metadata)
    }

    /// Replace the metadata file
    pub fn write_metadata(&self, metadata: &NodeMetadata) -> Result<()> {
        metadata.validate()?;
        let raw = serde_json::to_vec(metadata)?;
        fs::write(&self.metadata_path, raw).map_err(|e| self.map_missing(e))?;
        *self.time_step.write() = Some(metadata.time_step);
        Ok(())
    }

    /// Seconds per sample, read from metadata on first use
    pub fn time_step(&self) -> Result<Timestamp> {
        if let Some(step) = *self.time_step.read() {
            return Ok(step);
        }
        Ok(self.read_metadata()?.time_step)
    }

    pub fn slice_caching_behavior(&self) -> SliceCachingBehavior {
        self.slice_cache.lock().behavior()
    }

    /// Switch caching policy, discarding anything cached
    pub fn set_slice_caching_behavior(&self, behavior: SliceCachingBehavior) {
        *self.slice_cache.lock() = SliceCache::new(behavior);
    }

    pub fn clear_slice_cache(&self) {
        self.slice_cache.lock().invalidate();
        debug!("Cleared slice cache for {}", self.name);
    }

    /// Slices of this node, newest first.
    ///
    /// The directory is listed only once the cached slices run out, so a
    /// caller that stops at the newest slice never lists it under the
    /// `Latest` and `All` policies. Call again to start over.
    pub fn slices(&self) -> Slices<'_> {
        let state = match self.slice_cache.lock().snapshot() {
            Snapshot::Unknown => SlicesState::Listing { below: None },
            Snapshot::Head(slice) => SlicesState::Head(slice),
            Snapshot::Listed(slices) => SlicesState::Listed(slices.into_iter()),
        };
        Slices { node: self, state }
    }

    /// `(start_time, end_time, time_step)` for every slice, newest first
    pub fn slice_info(&self) -> Result<Vec<(Timestamp, Timestamp, Timestamp)>> {
        self.slices()
            .map(|s| -> Result<_> {
                let s = s?;
                Ok((s.start_time(), s.end_time()?, s.time_step()))
            })
            .collect()
    }

    /// True if any slice overlaps `[from_time, until_time)`.
    ///
    /// `None` leaves that side of the interval open. Only file sizes are
    /// consulted; no datapoints are read.
    pub fn has_data_for_interval(
        &self,
        from_time: Option<Timestamp>,
        until_time: Option<Timestamp>,
    ) -> Result<bool> {
        let slices = self.slices().collect::<Result<Vec<_>>>()?;
        let (Some(latest), Some(earliest)) = (slices.first(), slices.last()) else {
            return Ok(false);
        };
        let latest_data = latest.end_time()?;
        let earliest_data = earliest.start_time();

        Ok(from_time.map_or(true, |from| from < latest_data)
            && until_time.map_or(true, |until| until > earliest_data))
    }

    /// Read `[from_time, until_time)` as one contiguous series.
    ///
    /// Both bounds are rounded up to a time step boundary. The result always
    /// spans exactly the normalized interval; intervals without data are
    /// `None`.
    pub fn read(&self, from_time: Timestamp, until_time: Timestamp) -> Result<TimeSeriesData> {
        let step = self.time_step()?;
        let from_time = align_up(from_time, step);
        let until_time = align_up(until_time, step);
        if until_time < from_time {
            return Err(CeresError::InvalidRequest(format!(
                "read interval ({}, {}) ends before it starts",
                from_time, until_time
            )));
        }

        // Segments are collected newest first and reversed at the end
        let mut segments: Vec<Vec<Option<f64>>> = Vec::new();
        let mut earliest_data: Option<Timestamp> = None;
        let mut slice_boundary: Option<Timestamp> = None;

        for slice in self.slices() {
            let slice = slice.map_err(|e| self.on_read_error(e))?;
            if slice.time_step() != step {
                warn!(
                    "Skipping slice {} of {}: step {} does not match node step {}",
                    slice.start_time(),
                    self.name,
                    slice.time_step(),
                    step
                );
                continue;
            }

            // Do not ask for data a newer slice already covered
            let request_until = match slice_boundary {
                Some(boundary) if until_time > boundary => boundary,
                _ => until_time,
            };

            if from_time >= slice.start_time() {
                match slice.read(from_time, request_until) {
                    Ok(series) => {
                        stitch(&mut segments, series, request_until, step);
                        earliest_data = Some(from_time);
                    }
                    Err(CeresError::NoData) => {}
                    Err(e) => return Err(self.on_read_error(e)),
                }
                break;
            } else if until_time >= slice.start_time() {
                match slice.read(slice.start_time(), request_until) {
                    Ok(series) => {
                        stitch(&mut segments, series, request_until, step);
                        earliest_data = Some(slice.start_time());
                    }
                    Err(CeresError::NoData) => continue,
                    Err(e) => return Err(self.on_read_error(e)),
                }
            }

            slice_boundary = Some(slice.start_time());
        }

        let values = match earliest_data {
            None => vec![None; ((until_time - from_time) / step) as usize],
            Some(earliest) => {
                let left_missing = ((earliest - from_time) / step) as usize;
                let mut values = vec![None; left_missing];
                for segment in segments.into_iter().rev() {
                    values.extend(segment);
                }
                values
            }
        };

        TimeSeriesData::new(from_time, until_time, step, values)
    }

    /// Write datapoints, creating or extending slices as needed.
    ///
    /// If a slice vanishes mid-write the slice cache is dropped and the whole
    /// write is replayed once.
    pub fn write(&self, datapoints: &[Datapoint]) -> Result<()> {
        let step = self.time_step()?;
        if datapoints.is_empty() {
            return Ok(());
        }

        if let WritePass::Done = self.write_runs(compact(datapoints, step), step)? {
            return Ok(());
        }
        warn!("Slice of {} deleted during write, retrying", self.name);
        self.clear_slice_cache();

        match self.write_runs(compact(datapoints, step), step)? {
            WritePass::Done => Ok(()),
            WritePass::Retry => {
                self.clear_slice_cache();
                Err(CeresError::SliceDeleted(self.fs_path.clone()))
            }
        }
    }

    /// Drop all data before `timestamp` from every slice
    pub fn delete_before(&self, timestamp: Timestamp) -> Result<()> {
        let slices = self.slices().collect::<Result<Vec<_>>>()?;
        self.clear_slice_cache();
        for mut slice in slices {
            match slice.delete_before(timestamp) {
                Ok(()) | Err(CeresError::SliceDeleted(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Route runs newest to oldest into compatible slices
    fn write_runs(&self, mut runs: Vec<Run>, step: Timestamp) -> Result<WritePass> {
        let mut needs_earlier_slice: Vec<Run> = Vec::new();

        while let Some(mut run) = runs.pop() {
            for slice in self.slices() {
                let slice = slice?;
                if slice.time_step() != step {
                    continue;
                }
                let (Some(&(first, _)), Some(&(last, _))) = (run.first(), run.last()) else {
                    break;
                };

                if first >= slice.start_time() {
                    // Everything left belongs to this slice
                    let chunk = std::mem::take(&mut run);
                    if let WritePass::Retry = self.write_to_slice(&slice, &chunk, step)? {
                        return Ok(WritePass::Retry);
                    }
                    break;
                } else if last >= slice.start_time() {
                    // Straddles the slice start: write the right side here,
                    // keep the left side for older slices
                    let boundary = run.partition_point(|&(t, _)| t < slice.start_time());
                    let chunk = run.split_off(boundary);
                    if let WritePass::Retry = self.write_to_slice(&slice, &chunk, step)? {
                        return Ok(WritePass::Retry);
                    }
                }
            }

            if !run.is_empty() {
                needs_earlier_slice.push(run);
            }
        }

        for run in needs_earlier_slice {
            let slice = self.create_slice(run[0].0, step)?;
            if let WriteOutcome::Deleted = slice.write(&run, self.max_slice_gap)? {
                return Ok(WritePass::Retry);
            }
        }

        Ok(WritePass::Done)
    }

    fn write_to_slice(&self, slice: &Slice, run: &[(Timestamp, f64)], step: Timestamp) -> Result<WritePass> {
        match slice.write(run, self.max_slice_gap)? {
            WriteOutcome::Written => Ok(WritePass::Done),
            WriteOutcome::Deleted => Ok(WritePass::Retry),
            WriteOutcome::GapTooLarge => {
                let new_slice = self.create_slice(run[0].0, step)?;
                match new_slice.write(run, self.max_slice_gap)? {
                    WriteOutcome::Deleted => Ok(WritePass::Retry),
                    _ => Ok(WritePass::Done),
                }
            }
        }
    }

    fn create_slice(&self, start_time: Timestamp, step: Timestamp) -> Result<Slice> {
        if !self.fs_path.is_dir() {
            return Err(CeresError::NodeDeleted(self.name.clone()));
        }
        let slice = Slice::create(&self.fs_path, start_time, step)?;
        self.clear_slice_cache();
        Ok(slice)
    }

    /// List slice files from disk, newest first
    fn list_slices(&self) -> Result<Vec<Slice>> {
        if !self.fs_path.exists() {
            return Err(CeresError::NodeDeleted(self.name.clone()));
        }
        let mut info = Vec::new();
        for entry in fs::read_dir(&self.fs_path).map_err(|e| self.map_missing(e))? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(parsed) = name.to_str().and_then(Slice::parse_file_name) {
                info.push(parsed);
            }
        }
        info.sort_unstable_by(|a, b| b.cmp(a));

        Ok(info
            .into_iter()
            .map(|(start, step)| Slice::open(&self.fs_path, start, step))
            .collect())
    }

    fn on_read_error(&self, e: CeresError) -> CeresError {
        if matches!(e, CeresError::SliceDeleted(_)) {
            self.clear_slice_cache();
        }
        e
    }

    fn map_missing(&self, e: io::Error) -> CeresError {
        if e.kind() == io::ErrorKind::NotFound && !self.fs_path.exists() {
            CeresError::NodeDeleted(self.name.clone())
        } else {
            CeresError::Io(e)
        }
    }
}

/// Lazily produced slices of a node, newest first
pub struct Slices<'a> {
    node: &'a SeriesNode,
    state: SlicesState,
}

enum SlicesState {
    /// Cached newest slice, not yet yielded
    Head(Slice),
    /// Directory must be listed; keep only slices older than `below`
    Listing { below: Option<(Timestamp, Timestamp)> },
    Listed(std::vec::IntoIter<Slice>),
    Done,
}

impl Iterator for Slices<'_> {
    type Item = Result<Slice>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match std::mem::replace(&mut self.state, SlicesState::Done) {
                SlicesState::Head(slice) => {
                    self.state = SlicesState::Listing {
                        below: Some((slice.start_time(), slice.time_step())),
                    };
                    return Some(Ok(slice));
                }
                SlicesState::Listing { below } => {
                    let listing = match self.node.list_slices() {
                        Ok(listing) => listing,
                        Err(e) => return Some(Err(e)),
                    };
                    self.node.slice_cache.lock().install(&listing);
                    let rest: Vec<Slice> = match below {
                        Some(key) => listing
                            .into_iter()
                            .filter(|s| (s.start_time(), s.time_step()) < key)
                            .collect(),
                        None => listing,
                    };
                    self.state = SlicesState::Listed(rest.into_iter());
                }
                SlicesState::Listed(mut slices) => {
                    let next = slices.next()?;
                    self.state = SlicesState::Listed(slices);
                    return Some(Ok(next));
                }
                SlicesState::Done => return None,
            }
        }
    }
}

/// Round up to the next multiple of `step`, leaving aligned values alone
fn align_up(timestamp: Timestamp, step: Timestamp) -> Timestamp {
    let rem = timestamp.rem_euclid(step);
    if rem == 0 {
        timestamp
    } else {
        timestamp - rem + step
    }
}

/// Queue a slice's values, padding with `None` up to `request_until`
fn stitch(
    segments: &mut Vec<Vec<Option<f64>>>,
    series: TimeSeriesData,
    request_until: Timestamp,
    step: Timestamp,
) {
    let right_missing = ((request_until - series.end_time).max(0) / step) as usize;
    let mut values = series.into_values();
    values.extend(std::iter::repeat(None).take(right_missing));
    segments.push(values);
}

#[cfg(unix)]
fn create_dir_all(path: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new()
        .recursive(true)
        .mode(config::DIR_PERMS)
        .create(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}
