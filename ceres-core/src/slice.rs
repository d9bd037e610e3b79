//! Slices - contiguous on-disk runs of fixed-interval datapoints
//!
//! A slice file is named `{start_time}@{time_step}.slice` and holds nothing
//! but encoded records (see [`crate::codec`]). The file name carries all of
//! the framing, so the end time is always derived from the file size.

use crate::codec::{self, RECORD_SIZE};
use crate::{CeresError, Result, TimeSeriesData, Timestamp};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error};

/// Result of writing a run into a slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Run landed in the slice
    Written,
    /// Run starts too far past the end of the slice; use a new slice
    GapTooLarge,
    /// Slice file no longer exists
    Deleted,
}

/// Handle to one slice file of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    path: PathBuf,
    start_time: Timestamp,
    time_step: Timestamp,
}

impl Slice {
    /// File name for a slice starting at `start_time`
    pub fn file_name(start_time: Timestamp, time_step: Timestamp) -> String {
        format!(
            "{}@{}.{}",
            start_time,
            time_step,
            crate::config::SLICE_EXTENSION
        )
    }

    /// Parse `{start}@{step}.slice` back into its parts
    pub fn parse_file_name(name: &str) -> Option<(Timestamp, Timestamp)> {
        let stem = name
            .strip_suffix(crate::config::SLICE_EXTENSION)?
            .strip_suffix('.')?;
        let (start, step) = stem.split_once('@')?;
        Some((start.parse().ok()?, step.parse().ok()?))
    }

    /// Handle to an existing slice in `node_dir`. Performs no I/O.
    pub fn open(node_dir: &Path, start_time: Timestamp, time_step: Timestamp) -> Self {
        Self {
            path: node_dir.join(Self::file_name(start_time, time_step)),
            start_time,
            time_step,
        }
    }

    /// Create a new, empty slice file. Fails if the file already exists.
    pub fn create(node_dir: &Path, start_time: Timestamp, time_step: Timestamp) -> Result<Self> {
        let slice = Self::open(node_dir, start_time, time_step);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&slice.path)?;
        set_permissions(&file)?;

        debug!("Created slice {}", slice.path.display());
        Ok(slice)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    pub fn time_step(&self) -> Timestamp {
        self.time_step
    }

    /// Current file size in bytes
    pub fn size(&self) -> Result<u64> {
        fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| self.map_missing(e))
    }

    /// End of the stored range (exclusive), derived from the file size
    pub fn end_time(&self) -> Result<Timestamp> {
        let records = self.size()? / RECORD_SIZE as u64;
        Ok(self.start_time + records as Timestamp * self.time_step)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.size()? == 0)
    }

    /// Last modification time of the slice file
    pub fn mtime(&self) -> Result<SystemTime> {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|e| self.map_missing(e))
    }

    /// Read `[from_time, until_time)`.
    ///
    /// The returned series may end before `until_time` if the slice holds
    /// less data. Returns [`CeresError::NoData`] if `from_time` is at or
    /// past the end of the file.
    pub fn read(&self, from_time: Timestamp, until_time: Timestamp) -> Result<TimeSeriesData> {
        let time_offset = from_time - self.start_time;
        if time_offset < 0 {
            return Err(CeresError::InvalidRequest(format!(
                "requested time range ({}, {}) precedes this slice: {}",
                from_time, until_time, self.start_time
            )));
        }
        let byte_offset = (time_offset / self.time_step) as u64 * RECORD_SIZE as u64;

        let mut file = File::open(&self.path).map_err(|e| self.map_missing(e))?;
        let file_size = file.metadata()?.len();
        if byte_offset >= file_size {
            return Err(CeresError::NoData);
        }

        let point_range = ((until_time - from_time).max(0) / self.time_step) as u64;
        let byte_range = (point_range * RECORD_SIZE as u64).min(file_size - byte_offset);

        file.seek(SeekFrom::Start(byte_offset))?;
        let mut packed = vec![0u8; byte_range as usize];
        file.read_exact(&mut packed)?;

        let values: Vec<Option<f64>> = codec::decode_run(&packed)
            .map_err(|e| {
                error!("Corrupt slice {}: {}", self.path.display(), e);
                e
            })?
            .into_iter()
            .map(|v| if v.is_nan() { None } else { Some(v) })
            .collect();

        let end_time = from_time + values.len() as Timestamp * self.time_step;
        TimeSeriesData::new(from_time, end_time, self.time_step, values)
    }

    /// Write an ascending, contiguous run starting at or after the slice start.
    ///
    /// A gap between the current end of the file and the run is filled with
    /// NaN records as long as it is no larger than `max_gap` bytes.
    pub fn write(&self, sequence: &[(Timestamp, f64)], max_gap: u64) -> Result<WriteOutcome> {
        let Some(&(beginning_time, _)) = sequence.first() else {
            return Ok(WriteOutcome::Written);
        };
        let time_offset = beginning_time - self.start_time;
        if time_offset < 0 {
            return Err(CeresError::InvalidRequest(format!(
                "write at {} precedes slice start {}",
                beginning_time, self.start_time
            )));
        }
        let mut byte_offset = (time_offset / self.time_step) as u64 * RECORD_SIZE as u64;

        let file_size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(WriteOutcome::Deleted),
            Err(e) => return Err(e.into()),
        };
        if file_size % RECORD_SIZE as u64 != 0 {
            error!("Corrupt slice {}: size {} is not whole records", self.path.display(), file_size);
            return Err(CeresError::CorruptData(format!(
                "{} bytes is not a multiple of the {} byte record size",
                file_size, RECORD_SIZE
            )));
        }

        let mut packed = bytes::BytesMut::new();
        if byte_offset > file_size {
            let byte_gap = byte_offset - file_size;
            if byte_gap > max_gap {
                return Ok(WriteOutcome::GapTooLarge);
            }
            packed.extend_from_slice(&codec::encode_gap(byte_gap as usize / RECORD_SIZE));
            byte_offset = file_size;
        }
        packed.extend_from_slice(&codec::encode_run(sequence.iter().map(|&(_, v)| v)));

        let mut file = match OpenOptions::new().write(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(WriteOutcome::Deleted),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(byte_offset))?;
        file.write_all(&packed)?;

        Ok(WriteOutcome::Written)
    }

    /// Drop every record before `timestamp` (rounded down to a step).
    ///
    /// The surviving records are moved to the front of the file and the file
    /// is renamed to its new start time. If nothing survives, the file is
    /// removed and [`CeresError::SliceDeleted`] is returned.
    pub fn delete_before(&mut self, timestamp: Timestamp) -> Result<()> {
        if !self.path.exists() {
            return Err(CeresError::SliceDeleted(self.path.clone()));
        }
        let timestamp = timestamp - timestamp.rem_euclid(self.time_step);
        if timestamp <= self.start_time {
            return Ok(());
        }
        let byte_offset = ((timestamp - self.start_time) / self.time_step) as u64 * RECORD_SIZE as u64;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| self.map_missing(e))?;
        file.seek(SeekFrom::Start(byte_offset))?;
        let mut retained = Vec::new();
        file.read_to_end(&mut retained)?;

        if retained.is_empty() {
            drop(file);
            fs::remove_file(&self.path)?;
            debug!("Removed emptied slice {}", self.path.display());
            return Err(CeresError::SliceDeleted(self.path.clone()));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&retained)?;
        drop(file);

        let node_dir = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let new_path = node_dir.join(Self::file_name(timestamp, self.time_step));
        fs::rename(&self.path, &new_path)?;
        debug!(
            "Truncated slice {} to {}",
            self.path.display(),
            new_path.display()
        );

        self.path = new_path;
        self.start_time = timestamp;
        Ok(())
    }

    fn map_missing(&self, e: io::Error) -> CeresError {
        if e.kind() == io::ErrorKind::NotFound {
            CeresError::SliceDeleted(self.path.clone())
        } else {
            CeresError::Io(e)
        }
    }
}

#[cfg(unix)]
fn set_permissions(file: &File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(crate::config::SLICE_PERMS))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_permissions(_file: &File) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_SLICE_GAP;
    use tempfile::TempDir;

    fn run(start: Timestamp, step: Timestamp, values: &[f64]) -> Vec<(Timestamp, f64)> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| (start + i as Timestamp * step, v))
            .collect()
    }

    #[test]
    fn test_file_name_round_trip() {
        assert_eq!(Slice::file_name(600, 60), "600@60.slice");
        assert_eq!(Slice::parse_file_name("600@60.slice"), Some((600, 60)));
        assert_eq!(Slice::parse_file_name("600@60.slice.tmp"), None);
        assert_eq!(Slice::parse_file_name(".ceres-node"), None);
        assert_eq!(Slice::parse_file_name("x@60.slice"), None);
    }

    #[test]
    fn test_create_refuses_existing() {
        let dir = TempDir::new().unwrap();
        Slice::create(dir.path(), 600, 60).unwrap();
        assert!(Slice::create(dir.path(), 600, 60).is_err());
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let slice = Slice::create(dir.path(), 600, 60).unwrap();
        assert!(slice.is_empty().unwrap());
        assert_eq!(slice.end_time().unwrap(), 600);

        let outcome = slice.write(&run(600, 60, &[1.0, 2.0, 3.0]), MAX_SLICE_GAP).unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(slice.end_time().unwrap(), 780);

        let series = slice.read(660, 900).unwrap();
        assert_eq!(series.start_time, 660);
        assert_eq!(series.end_time, 780);
        assert_eq!(series.values(), &[Some(2.0), Some(3.0)]);
    }

    #[test]
    fn test_read_errors() {
        let dir = TempDir::new().unwrap();
        let slice = Slice::create(dir.path(), 600, 60).unwrap();
        slice.write(&run(600, 60, &[1.0]), MAX_SLICE_GAP).unwrap();

        assert!(matches!(
            slice.read(540, 660),
            Err(CeresError::InvalidRequest(_))
        ));
        assert!(matches!(slice.read(660, 720), Err(CeresError::NoData)));
    }

    #[test]
    fn test_gap_is_nan_filled() {
        let dir = TempDir::new().unwrap();
        let slice = Slice::create(dir.path(), 0, 60).unwrap();
        slice.write(&run(0, 60, &[1.0]), MAX_SLICE_GAP).unwrap();
        // 10 missing records == 80 bytes, still within tolerance
        let outcome = slice.write(&run(660, 60, &[2.0]), MAX_SLICE_GAP).unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(slice.size().unwrap(), 12 * RECORD_SIZE as u64);

        let series = slice.read(0, 720).unwrap();
        assert_eq!(series.values()[0], Some(1.0));
        assert!(series.values()[1..11].iter().all(Option::is_none));
        assert_eq!(series.values()[11], Some(2.0));
    }

    #[test]
    fn test_gap_too_large() {
        let dir = TempDir::new().unwrap();
        let slice = Slice::create(dir.path(), 0, 60).unwrap();
        slice.write(&run(0, 60, &[1.0]), MAX_SLICE_GAP).unwrap();

        let outcome = slice.write(&run(720, 60, &[2.0]), MAX_SLICE_GAP).unwrap();
        assert_eq!(outcome, WriteOutcome::GapTooLarge);
        assert_eq!(slice.size().unwrap(), RECORD_SIZE as u64);
    }

    #[test]
    fn test_overwrite_in_place() {
        let dir = TempDir::new().unwrap();
        let slice = Slice::create(dir.path(), 0, 60).unwrap();
        slice.write(&run(0, 60, &[1.0, 2.0, 3.0]), MAX_SLICE_GAP).unwrap();
        slice.write(&run(60, 60, &[20.0]), MAX_SLICE_GAP).unwrap();

        let series = slice.read(0, 180).unwrap();
        assert_eq!(series.values(), &[Some(1.0), Some(20.0), Some(3.0)]);
    }

    #[test]
    fn test_write_to_deleted_slice() {
        let dir = TempDir::new().unwrap();
        let slice = Slice::create(dir.path(), 0, 60).unwrap();
        fs::remove_file(slice.path()).unwrap();

        let outcome = slice.write(&run(0, 60, &[1.0]), MAX_SLICE_GAP).unwrap();
        assert_eq!(outcome, WriteOutcome::Deleted);
        assert!(matches!(slice.read(0, 60), Err(CeresError::SliceDeleted(_))));
    }

    #[test]
    fn test_read_corrupt_slice() {
        let dir = TempDir::new().unwrap();
        let slice = Slice::create(dir.path(), 0, 60).unwrap();
        fs::write(slice.path(), [0u8; 12]).unwrap();

        let err = slice.read(0, 120).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_write_refuses_partial_record() {
        let dir = TempDir::new().unwrap();
        let slice = Slice::create(dir.path(), 0, 60).unwrap();
        fs::write(slice.path(), [0u8; 12]).unwrap();

        // appending after 12 bytes would shift every later record
        let err = slice.write(&run(120, 60, &[1.0]), MAX_SLICE_GAP).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(fs::metadata(slice.path()).unwrap().len(), 12);
    }

    #[test]
    fn test_delete_before() {
        let dir = TempDir::new().unwrap();
        let mut slice = Slice::create(dir.path(), 600, 60).unwrap();
        let values: Vec<f64> = (0..10).map(|i| i as f64).collect();
        slice.write(&run(600, 60, &values), MAX_SLICE_GAP).unwrap();

        // before the start: nothing happens
        slice.delete_before(540).unwrap();
        assert_eq!(slice.start_time(), 600);

        // 790 rounds down to 780, dropping 600, 660 and 720
        slice.delete_before(790).unwrap();
        assert_eq!(slice.start_time(), 780);
        assert!(slice.path().ends_with("780@60.slice"));
        assert!(!dir.path().join("600@60.slice").exists());

        let series = slice.read(780, 1200).unwrap();
        let expected: Vec<_> = (3..10).map(|i| Some(i as f64)).collect();
        assert_eq!(series.values(), expected.as_slice());
    }

    #[test]
    fn test_delete_before_everything() {
        let dir = TempDir::new().unwrap();
        let mut slice = Slice::create(dir.path(), 600, 60).unwrap();
        slice.write(&run(600, 60, &[1.0, 2.0]), MAX_SLICE_GAP).unwrap();

        let err = slice.delete_before(780).unwrap_err();
        assert!(matches!(err, CeresError::SliceDeleted(_)));
        assert!(!slice.path().exists());
    }
}
