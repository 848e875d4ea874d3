//! Resume records and the on-disk log that stores them.
//!
//! Every interrupted or in-flight imaging job owns one `LogFile<N>` in the
//! log directory. The file is plain text, one field per line, so a record
//! survives platform moves and can be inspected by hand. A DD record keeps
//! just the sector cursor; a sparse record additionally carries the grain
//! cursors, the fixed layout offsets and the full grain-table array, which
//! is everything needed to re-enter the build at the exact grain index.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use regex::Regex;

use crate::error::ImageError;
use crate::ImageType;

/// Progress record of a flat DD copy (also used for the data file of a
/// monolithic-flat VMDK).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCopyRecord {
    pub device: String,
    pub serial: String,
    pub out_dir: String,
    pub out_name: String,
    pub end_time: u64,
    pub sectors_written: u64,
    pub total_sectors: u64,
}

/// Progress record of a monolithic-sparse VMDK build.
///
/// `grains_read` counts source grains processed (zero or not), `grains_written`
/// only the non-zero grains committed to the image. The GTE array itself is
/// stored in the log file after the fixed fields and reloaded on demand via
/// [`ResumeLog::read_gtes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseRecord {
    pub device: String,
    pub serial: String,
    pub out_dir: String,
    pub out_name: String,
    pub end_time: u64,
    pub grains_written: u64,
    pub grains_read: u64,
    pub total_grains: u64,
    pub data_offset: u64,
    pub gt_offset: u64,
}

/// A parsed resume record of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeRecord {
    RawCopy(RawCopyRecord),
    Sparse(SparseRecord),
}

impl ResumeRecord {
    pub fn image_type(&self) -> ImageType {
        match self {
            ResumeRecord::RawCopy(_) => ImageType::Dd,
            ResumeRecord::Sparse(_) => ImageType::SparseVmdk,
        }
    }

    pub fn device(&self) -> &str {
        match self {
            ResumeRecord::RawCopy(r) => &r.device,
            ResumeRecord::Sparse(r) => &r.device,
        }
    }

    pub fn serial(&self) -> &str {
        match self {
            ResumeRecord::RawCopy(r) => &r.serial,
            ResumeRecord::Sparse(r) => &r.serial,
        }
    }

    pub fn out_dir(&self) -> &str {
        match self {
            ResumeRecord::RawCopy(r) => &r.out_dir,
            ResumeRecord::Sparse(r) => &r.out_dir,
        }
    }

    pub fn out_name(&self) -> &str {
        match self {
            ResumeRecord::RawCopy(r) => &r.out_name,
            ResumeRecord::Sparse(r) => &r.out_name,
        }
    }
}

/// Seconds since the Unix epoch, for the `endTime` field.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// Log files are named LogFile<N> with N a positive decimal integer.
static LOG_FILE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^LogFile([1-9]\d*)$").unwrap());

/// The set of resume records in one working directory.
#[derive(Clone)]
pub struct ResumeLog {
    dir: PathBuf,
}

impl ResumeLog {
    pub fn new(dir: impl Into<PathBuf>) -> ResumeLog {
        ResumeLog { dir: dir.into() }
    }

    /// Scans the log directory and parses every record found.
    ///
    /// Malformed files are skipped with a warning; a missing or unreadable
    /// directory yields an empty list. Records are returned in file-number
    /// order.
    pub fn enumerate(&self) -> Vec<(PathBuf, ResumeRecord)> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot scan resume log directory '{}': {}", self.dir.display(), e);
                return Vec::new();
            }
        };
        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(caps) = LOG_FILE_REGEX.captures(name) {
                if let Ok(n) = caps[1].parse::<u64>() {
                    found.push((n, entry.path()));
                }
            }
        }
        found.sort_by_key(|(n, _)| *n);

        let mut records = Vec::new();
        for (_, path) in found {
            match parse_record(&path) {
                Ok(record) => records.push((path, record)),
                Err(reason) => warn!("Skipping malformed resume record {}: {}", path.display(), reason),
            }
        }
        records
    }

    /// Looks for a record of the given kind describing the same job as the
    /// operator's selection.
    pub fn find_match(
        &self,
        kind: ImageType,
        device: &str,
        serial: &str,
        out_dir: &str,
        out_name: &str,
    ) -> Option<(PathBuf, ResumeRecord)> {
        self.enumerate().into_iter().find(|(_, record)| {
            record.image_type() == kind
                && record.device() == device
                && record.serial() == serial
                && record.out_dir() == out_dir
                && record.out_name() == out_name
        })
    }

    /// Writes a new DD record under a fresh `LogFile<N>` name and returns its
    /// path.
    pub fn create_raw(&self, record: &RawCopyRecord) -> io::Result<PathBuf> {
        let path = self.fresh_path()?;
        self.write_raw(&path, record)?;
        Ok(path)
    }

    /// Rewrites an existing DD record in place.
    pub fn write_raw(&self, path: &Path, record: &RawCopyRecord) -> io::Result<()> {
        let mut text = String::new();
        push_prefix(
            &mut text,
            ImageType::Dd,
            &record.device,
            &record.serial,
            &record.out_dir,
            &record.out_name,
            record.end_time,
            record.sectors_written,
            record.total_sectors,
        );
        write_atomically(path, text.as_bytes())
    }

    /// Writes a new sparse record, including the GTE array, under a fresh
    /// `LogFile<N>` name and returns its path.
    pub fn create_sparse(&self, record: &SparseRecord, gtes: &[u32]) -> io::Result<PathBuf> {
        let path = self.fresh_path()?;
        self.write_sparse(&path, record, gtes)?;
        Ok(path)
    }

    /// Rewrites an existing sparse record in place.
    pub fn write_sparse(&self, path: &Path, record: &SparseRecord, gtes: &[u32]) -> io::Result<()> {
        let mut text = String::with_capacity(256 + gtes.len() * 8);
        // The sector counters of the common prefix stay zero in a sparse
        // record; progress lives in the grain cursors below.
        push_prefix(
            &mut text,
            ImageType::SparseVmdk,
            &record.device,
            &record.serial,
            &record.out_dir,
            &record.out_name,
            record.end_time,
            0,
            0,
        );
        text.push_str(&format!(
            "{}\n{}\n{}\n{}\n{}\n",
            record.grains_written,
            record.grains_read,
            record.total_grains,
            record.data_offset,
            record.gt_offset
        ));
        for gte in gtes {
            text.push_str(&format!("{}\n", gte));
        }
        write_atomically(path, text.as_bytes())
    }

    /// Loads exactly `count` grain-table entries from a sparse record.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::ResumeParse`] when the file is not a sparse
    /// record or holds fewer than `count` entries.
    pub fn read_gtes(&self, path: &Path, count: u64) -> Result<Vec<u32>, ImageError> {
        let parse_err = |reason: String| ImageError::ResumeParse {
            path: path.to_path_buf(),
            reason,
        };
        let contents = fs::read_to_string(path).map_err(|e| parse_err(e.to_string()))?;
        let lines: Vec<&str> = contents.lines().map(|l| l.trim_end_matches('\r')).collect();
        let kind = lines.first().and_then(|l| l.trim().parse::<u32>().ok());
        if kind != Some(ImageType::SparseVmdk.code()) {
            return Err(parse_err("not a sparse record".to_string()));
        }
        let mut gtes = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let line = lines
                .get(SPARSE_FIXED_LINES + i)
                .ok_or_else(|| parse_err(format!("record holds fewer than {} GTEs", count)))?;
            let gte = line
                .trim()
                .parse::<u32>()
                .map_err(|_| parse_err(format!("bad GTE at index {}", i)))?;
            gtes.push(gte);
        }
        Ok(gtes)
    }

    /// Removes a record file. Succeeds even if the file no longer exists.
    pub fn delete(&self, path: &Path) -> io::Result<()> {
        debug!("Deleting resume record {}", path.display());
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    // Picks the lowest unused LogFile number above every number in use.
    fn fresh_path(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let mut max = 0u64;
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(caps) = LOG_FILE_REGEX.captures(name) {
                if let Ok(n) = caps[1].parse::<u64>() {
                    max = max.max(n);
                }
            }
        }
        Ok(self.dir.join(format!("LogFile{}", max + 1)))
    }
}

// Lines before the GTE array in a sparse record: type, device, serial,
// directory, name, end time, the two zeroed sector counters, and the five
// grain-layout fields.
const SPARSE_FIXED_LINES: usize = 13;

#[allow(clippy::too_many_arguments)]
fn push_prefix(
    text: &mut String,
    kind: ImageType,
    device: &str,
    serial: &str,
    out_dir: &str,
    out_name: &str,
    end_time: u64,
    sectors_written: u64,
    total_sectors: u64,
) {
    text.push_str(&format!(
        "{}\n{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
        kind.code(),
        device,
        serial,
        out_dir,
        out_name,
        end_time,
        sectors_written,
        total_sectors
    ));
}

// Checkpoints are staged in a sibling file and renamed in; a torn write
// never clobbers the previous record.
fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let staged = path.with_extension("tmp");
    {
        let mut file = File::create(&staged)?;
        file.write_all(bytes)?;
    }
    fs::rename(&staged, path)
}

fn parse_record(path: &Path) -> Result<ResumeRecord, String> {
    let contents = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let lines: Vec<&str> = contents.lines().map(|l| l.trim_end_matches('\r')).collect();

    let text = |idx: usize, what: &str| -> Result<String, String> {
        lines
            .get(idx)
            .map(|l| l.to_string())
            .ok_or_else(|| format!("missing field '{}'", what))
    };
    let number = |idx: usize, what: &str| -> Result<u64, String> {
        lines
            .get(idx)
            .and_then(|l| l.trim().parse::<u64>().ok())
            .ok_or_else(|| format!("bad numeric field '{}'", what))
    };

    let kind_code = number(0, "image type")? as u32;
    let kind = ImageType::from_code(kind_code)
        .ok_or_else(|| format!("unknown image type {}", kind_code))?;

    let device = text(1, "device")?;
    let serial = text(2, "serial number")?;
    let out_dir = text(3, "output directory")?;
    let out_name = text(4, "output file name")?;
    let end_time = number(5, "end time")?;

    match kind {
        ImageType::Dd => Ok(ResumeRecord::RawCopy(RawCopyRecord {
            device,
            serial,
            out_dir,
            out_name,
            end_time,
            sectors_written: number(6, "sectors written")?,
            total_sectors: number(7, "total sectors")?,
        })),
        ImageType::SparseVmdk => {
            let record = SparseRecord {
                device,
                serial,
                out_dir,
                out_name,
                end_time,
                grains_written: number(8, "grains written")?,
                grains_read: number(9, "grains read")?,
                total_grains: number(10, "total grains")?,
                data_offset: number(11, "data offset")?,
                gt_offset: number(12, "grain table offset")?,
            };
            if (lines.len() - SPARSE_FIXED_LINES) < record.total_grains as usize {
                return Err("truncated GTE array".to_string());
            }
            Ok(ResumeRecord::Sparse(record))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_record(name: &str) -> RawCopyRecord {
        RawCopyRecord {
            device: "/dev/sdb1".to_string(),
            serial: "07614A61715128C8".to_string(),
            out_dir: "/tmp/out".to_string(),
            out_name: name.to_string(),
            end_time: 1_700_000_000,
            sectors_written: 1024,
            total_sectors: 4096,
        }
    }

    fn sparse_record() -> SparseRecord {
        SparseRecord {
            device: "/dev/sdb1".to_string(),
            serial: "07614A61715128C8".to_string(),
            out_dir: "/tmp/out".to_string(),
            out_name: "evidence".to_string(),
            end_time: 1_700_000_000,
            grains_written: 3,
            grains_read: 4,
            total_grains: 8,
            data_offset: 65536,
            gt_offset: 1536,
        }
    }

    #[test]
    fn raw_record_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResumeLog::new(dir.path());

        let path = log.create_raw(&raw_record("copy.dd")).unwrap();
        assert_eq!(path.file_name().unwrap(), "LogFile1");

        let records = log.enumerate();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, ResumeRecord::RawCopy(raw_record("copy.dd")));
    }

    #[test]
    fn raw_record_field_order_matches_schema() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResumeLog::new(dir.path());
        let path = log.create_raw(&raw_record("copy.dd")).unwrap();

        let lines: Vec<String> = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(
            lines,
            [
                "1",
                "/dev/sdb1",
                "07614A61715128C8",
                "/tmp/out",
                "copy.dd",
                "1700000000",
                "1024",
                "4096"
            ]
        );
    }

    #[test]
    fn sparse_record_keeps_zeroed_sector_counters() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResumeLog::new(dir.path());
        let gtes = [128u32, 0, 256, 384, 0, 0, 0, 0];
        let path = log.create_sparse(&sparse_record(), &gtes).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "2");
        assert_eq!(lines[6], "0");
        assert_eq!(lines[7], "0");
        assert_eq!(lines[8], "3");
        assert_eq!(lines[12], "1536");
        assert_eq!(&lines[13..], ["128", "0", "256", "384", "0", "0", "0", "0"]);

        let reloaded = log.read_gtes(&path, 8).unwrap();
        assert_eq!(reloaded, gtes);
    }

    #[test]
    fn fresh_numbering_skips_numbers_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResumeLog::new(dir.path());

        let first = log.create_raw(&raw_record("a.dd")).unwrap();
        let second = log.create_raw(&raw_record("b.dd")).unwrap();
        assert_eq!(first.file_name().unwrap(), "LogFile1");
        assert_eq!(second.file_name().unwrap(), "LogFile2");

        log.delete(&first).unwrap();
        let third = log.create_raw(&raw_record("c.dd")).unwrap();
        assert_eq!(third.file_name().unwrap(), "LogFile3");
    }

    #[test]
    fn enumeration_skips_malformed_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResumeLog::new(dir.path());

        log.create_raw(&raw_record("good.dd")).unwrap();
        fs::write(dir.path().join("LogFile2"), "2\n/dev/sdb1\ntruncated\n").unwrap();
        log.create_sparse(&sparse_record(), &[0u32; 8]).unwrap();

        let records = log.enumerate();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].1, ResumeRecord::RawCopy(_)));
        assert!(matches!(records[1].1, ResumeRecord::Sparse(_)));
    }

    #[test]
    fn enumeration_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResumeLog::new(dir.path());
        fs::write(dir.path().join("LogFile0"), "1\n").unwrap();
        fs::write(dir.path().join("LogFileX"), "1\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        assert!(log.enumerate().is_empty());
    }

    #[test]
    fn find_match_requires_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResumeLog::new(dir.path());
        log.create_raw(&raw_record("copy.dd")).unwrap();

        assert!(log
            .find_match(ImageType::Dd, "/dev/sdb1", "07614A61715128C8", "/tmp/out", "copy.dd")
            .is_some());
        assert!(log
            .find_match(ImageType::Dd, "/dev/sdb2", "07614A61715128C8", "/tmp/out", "copy.dd")
            .is_none());
        assert!(log
            .find_match(ImageType::SparseVmdk, "/dev/sdb1", "07614A61715128C8", "/tmp/out", "copy.dd")
            .is_none());
    }

    #[test]
    fn delete_missing_record_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResumeLog::new(dir.path());
        log.delete(&dir.path().join("LogFile9")).unwrap();
    }

    #[test]
    fn crlf_records_parse() {
        let dir = tempfile::tempdir().unwrap();
        let log = ResumeLog::new(dir.path());
        fs::write(
            dir.path().join("LogFile1"),
            "1\r\n/dev/sdb1\r\nSN\r\n/tmp/out\r\ncopy.dd\r\n1700000000\r\n10\r\n20\r\n",
        )
        .unwrap();

        let records = log.enumerate();
        assert_eq!(records.len(), 1);
        match &records[0].1 {
            ResumeRecord::RawCopy(r) => {
                assert_eq!(r.serial, "SN");
                assert_eq!(r.sectors_written, 10);
                assert_eq!(r.total_sectors, 20);
            }
            _ => panic!("expected a DD record"),
        }
    }
}
