//! Inhume a body of data: archive a storage device into an image file.
//!
//! Three image kinds are produced from a raw block device or any readable
//! source file: a flat DD copy, a monolithic-sparse VMDK with zero-grain
//! elision, and a monolithic-flat VMDK. Long copies are resumable: progress
//! is persisted in per-job log files and the entry points below re-enter an
//! interrupted job at its last committed position.

pub mod dd;
pub mod device;
pub mod error;
pub mod resume;
pub mod vmdk;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{info, warn};

use dd::RawCopy;
use error::ImageError;
use resume::ResumeLog;
use vmdk::{FlatVmdk, SparseLayout, SparseVmdk};

pub use resume::ResumeRecord;

/// Bytes per sector; every layout quantity is expressed in these.
pub const SECTOR_SIZE: u64 = 512;
/// Sectors per grain, the unit of sparse allocation.
pub const GRAIN_SECTORS: u64 = 128;
/// Bytes per grain.
pub const GRAIN_SIZE: u64 = GRAIN_SECTORS * SECTOR_SIZE;
/// Entries per grain table; one table spans 32 MiB of disk.
pub const GTES_PER_GT: u64 = 512;

/// Image kinds a resume record can describe, with their on-disk codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Dd = 1,
    SparseVmdk = 2,
}

impl ImageType {
    /// The decimal code stored on the first line of a record.
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<ImageType> {
        match code {
            1 => Some(ImageType::Dd),
            2 => Some(ImageType::SparseVmdk),
            _ => None,
        }
    }
}

/// Everything one imaging job needs to know, collected by the caller
/// (typically the CLI, which in turn asked the operator).
pub struct JobOptions {
    /// Source path: a device node such as `/dev/sdb1` or a regular file.
    pub device: String,
    /// Serial number of the source device, as reported by enumeration.
    pub serial: String,
    /// Directory the image lands in.
    pub out_dir: PathBuf,
    /// Base name of the output; engines derive their file names from it.
    pub out_name: String,
    /// I/O granularity in bytes. DD requires a multiple of the sector,
    /// sparse builds a multiple of the grain.
    pub buffer_size: u64,
    /// Source capacity in sectors.
    pub capacity_sectors: u64,
    /// Directory scanned for resume records.
    pub log_dir: PathBuf,
    /// Fixed content identifier for reproducible VMDK output.
    pub cid: Option<u32>,
    /// Cooperative cancellation flag, checked between grains or buffers.
    pub cancel: Arc<AtomicBool>,
}

impl JobOptions {
    pub fn new(
        device: impl Into<String>,
        serial: impl Into<String>,
        out_dir: impl Into<PathBuf>,
        out_name: impl Into<String>,
        capacity_sectors: u64,
    ) -> JobOptions {
        JobOptions {
            device: device.into(),
            serial: serial.into(),
            out_dir: out_dir.into(),
            out_name: out_name.into(),
            buffer_size: GRAIN_SIZE,
            capacity_sectors,
            log_dir: PathBuf::from("."),
            cid: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Lists every resume record found in `dir`, skipping malformed files.
pub fn enumerate_resume_records(dir: &Path) -> Vec<(PathBuf, ResumeRecord)> {
    ResumeLog::new(dir).enumerate()
}

/// Creates a flat DD image at `out_dir/out_name`.
///
/// With `resume` set, a matching record in the log directory re-enters the
/// copy at its persisted sector cursor; otherwise (or when the record does
/// not fit the job) the copy starts fresh and any stale record is dropped.
///
/// # Errors
///
/// See [`RawCopy::run`].
pub fn create_raw_copy(opts: &JobOptions, resume: bool) -> Result<(), ImageError> {
    let log = ResumeLog::new(&opts.log_dir);
    let (cursor, record_path) = match_raw_record(&log, opts, &opts.out_name, resume);
    let engine = RawCopy {
        device: opts.device.clone(),
        serial: opts.serial.clone(),
        out_dir: opts.out_dir.clone(),
        out_file: opts.out_name.clone(),
        buffer_size: opts.buffer_size,
        total_sectors: opts.capacity_sectors,
        log,
        cancel: Arc::clone(&opts.cancel),
    };
    engine.run(cursor, record_path)
}

/// Creates a monolithic-flat VMDK: a `out_name.vmdk` descriptor next to the
/// DD data file `out_name-flat.vmdk`. Resume applies to the data copy.
///
/// # Errors
///
/// See [`FlatVmdk::create`].
pub fn create_flat_vmdk(opts: &JobOptions, resume: bool) -> Result<(), ImageError> {
    let log = ResumeLog::new(&opts.log_dir);
    let flat_name = format!("{}-flat.vmdk", opts.out_name);
    let (cursor, record_path) = match_raw_record(&log, opts, &flat_name, resume);
    let engine = FlatVmdk {
        device: opts.device.clone(),
        serial: opts.serial.clone(),
        out_dir: opts.out_dir.clone(),
        out_name: opts.out_name.clone(),
        buffer_size: opts.buffer_size,
        capacity_sectors: opts.capacity_sectors,
        cid: opts.cid,
        log,
        cancel: Arc::clone(&opts.cancel),
    };
    engine.create(cursor, record_path)
}

/// Creates a monolithic-sparse VMDK at `out_dir/out_name.vmdk`.
///
/// With `resume` set, a matching record re-enters the build at its persisted
/// grain cursor, reusing the grain table stored in the record.
///
/// # Errors
///
/// See [`SparseVmdk::create`] and [`SparseVmdk::resume`].
pub fn create_sparse_vmdk(opts: &JobOptions, resume: bool) -> Result<(), ImageError> {
    let log = ResumeLog::new(&opts.log_dir);
    let engine = SparseVmdk {
        device: opts.device.clone(),
        serial: opts.serial.clone(),
        out_dir: opts.out_dir.clone(),
        out_name: opts.out_name.clone(),
        buffer_size: opts.buffer_size,
        capacity_sectors: opts.capacity_sectors,
        cid: opts.cid,
        log: log.clone(),
        cancel: Arc::clone(&opts.cancel),
    };

    let out_dir = opts.out_dir.to_string_lossy();
    if let Some((path, ResumeRecord::Sparse(record))) = log.find_match(
        ImageType::SparseVmdk,
        &opts.device,
        &opts.serial,
        &out_dir,
        &opts.out_name,
    ) {
        if resume && record_fits_layout(&record, opts.capacity_sectors) {
            match log.read_gtes(&path, record.total_grains) {
                Ok(gtes) => {
                    info!(
                        "Found resume record {}: continuing at grain {}",
                        path.display(),
                        record.grains_read
                    );
                    return engine.resume(&record, gtes, path);
                }
                Err(e) => warn!("Cannot reuse resume record: {}", e),
            }
        }
        warn!(
            "Discarding resume record {} and starting fresh",
            path.display()
        );
        if let Err(e) = log.delete(&path) {
            warn!("Could not delete stale record: {}", e);
        }
    }
    engine.create()
}

// A record written for a different capacity would place grains at the wrong
// offsets; it cannot seed this job.
fn record_fits_layout(record: &resume::SparseRecord, capacity_sectors: u64) -> bool {
    match SparseLayout::for_capacity(capacity_sectors) {
        Ok(layout) => {
            record.total_grains == layout.total_grains
                && record.data_offset == layout.data_offset
                && record.gt_offset == layout.gt_offset
                && record.grains_read <= layout.total_grains
        }
        Err(_) => false,
    }
}

// Shared coordination for the two engines that stream sector copies: decide
// the starting cursor and which record (if any) the engine owns.
fn match_raw_record(
    log: &ResumeLog,
    opts: &JobOptions,
    out_file: &str,
    resume: bool,
) -> (u64, Option<PathBuf>) {
    let out_dir = opts.out_dir.to_string_lossy();
    let Some((path, ResumeRecord::RawCopy(record))) =
        log.find_match(ImageType::Dd, &opts.device, &opts.serial, &out_dir, out_file)
    else {
        return (0, None);
    };
    if resume
        && record.total_sectors == opts.capacity_sectors
        && record.sectors_written <= record.total_sectors
    {
        info!(
            "Found resume record {}: continuing at sector {}",
            path.display(),
            record.sectors_written
        );
        return (record.sectors_written, Some(path));
    }
    warn!(
        "Discarding resume record {} and starting fresh",
        path.display()
    );
    if let Err(e) = log.delete(&path) {
        warn!("Could not delete stale record: {}", e);
    }
    (0, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use resume::RawCopyRecord;
    use std::fs;

    fn options(dir: &Path, source: &Path, capacity_sectors: u64) -> JobOptions {
        let mut opts = JobOptions::new(
            source.to_str().unwrap(),
            "TESTSERIAL",
            dir,
            "evidence",
            capacity_sectors,
        );
        opts.log_dir = dir.join("logs");
        opts.cid = Some(12_345_678);
        opts
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    #[test]
    fn raw_entry_point_resumes_a_matching_record() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let data = patterned(8 * 512);
        fs::write(&source, &data).unwrap();

        let mut opts = options(dir.path(), &source, 8);
        opts.buffer_size = 1024;

        // An interrupted run left half the copy and its record behind.
        fs::write(dir.path().join("evidence"), &data[..4 * 512]).unwrap();
        let log = ResumeLog::new(&opts.log_dir);
        log.create_raw(&RawCopyRecord {
            device: opts.device.clone(),
            serial: opts.serial.clone(),
            out_dir: dir.path().to_string_lossy().into_owned(),
            out_name: "evidence".to_string(),
            end_time: 0,
            sectors_written: 4,
            total_sectors: 8,
        })
        .unwrap();

        create_raw_copy(&opts, true).unwrap();

        assert_eq!(fs::read(dir.path().join("evidence")).unwrap(), data);
        assert!(enumerate_resume_records(&opts.log_dir).is_empty());
    }

    #[test]
    fn raw_entry_point_discards_records_when_not_resuming() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let data = patterned(4 * 512);
        fs::write(&source, &data).unwrap();

        let mut opts = options(dir.path(), &source, 4);
        opts.buffer_size = 512;

        let log = ResumeLog::new(&opts.log_dir);
        log.create_raw(&RawCopyRecord {
            device: opts.device.clone(),
            serial: opts.serial.clone(),
            out_dir: dir.path().to_string_lossy().into_owned(),
            out_name: "evidence".to_string(),
            end_time: 0,
            sectors_written: 2,
            total_sectors: 4,
        })
        .unwrap();

        create_raw_copy(&opts, false).unwrap();

        // Fresh copy of everything, stale record gone.
        assert_eq!(fs::read(dir.path().join("evidence")).unwrap(), data);
        assert!(enumerate_resume_records(&opts.log_dir).is_empty());
    }

    #[test]
    fn mismatched_capacity_forces_a_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let data = patterned(4 * 512);
        fs::write(&source, &data).unwrap();

        let mut opts = options(dir.path(), &source, 4);
        opts.buffer_size = 512;

        let log = ResumeLog::new(&opts.log_dir);
        log.create_raw(&RawCopyRecord {
            device: opts.device.clone(),
            serial: opts.serial.clone(),
            out_dir: dir.path().to_string_lossy().into_owned(),
            out_name: "evidence".to_string(),
            end_time: 0,
            sectors_written: 2,
            total_sectors: 1024,
        })
        .unwrap();

        create_raw_copy(&opts, true).unwrap();
        assert_eq!(fs::read(dir.path().join("evidence")).unwrap(), data);
        assert!(enumerate_resume_records(&opts.log_dir).is_empty());
    }

    #[test]
    fn sparse_entry_point_builds_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        let mut data = vec![0u8; 256 * 512];
        data[..512].fill(0xCD);
        fs::write(&source, &data).unwrap();

        let opts = options(dir.path(), &source, 256);
        create_sparse_vmdk(&opts, false).unwrap();

        let image = fs::read(dir.path().join("evidence.vmdk")).unwrap();
        assert_eq!(&image[0..4], b"KDMV");
        // Grain 0 carries data, grain 1 is elided.
        assert_eq!(image.len() as u64, 65536 + GRAIN_SIZE);
    }

    #[test]
    fn image_type_codes_round_trip() {
        assert_eq!(ImageType::Dd.code(), 1);
        assert_eq!(ImageType::SparseVmdk.code(), 2);
        assert_eq!(ImageType::from_code(1), Some(ImageType::Dd));
        assert_eq!(ImageType::from_code(2), Some(ImageType::SparseVmdk));
        assert_eq!(ImageType::from_code(7), None);
    }

    #[test]
    fn enumeration_of_an_absent_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(enumerate_resume_records(&dir.path().join("nowhere")).is_empty());
    }
}
