//! Flat DD imaging engine.
//!
//! Streams an exact byte-for-byte copy of the first `totalSectors × 512`
//! bytes of a source device into a regular file. Unlike the sparse VMDK
//! path there is no zero elision here: every source byte reaches the
//! output. The engine checkpoints a resume record at a fixed sector cadence
//! so an interrupted copy can continue from the last committed position.

use std::cmp::min;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{error, info};

use crate::device::{DeviceReader, ImageWriter};
use crate::error::ImageError;
use crate::resume::{unix_now, RawCopyRecord, ResumeLog};
use crate::SECTOR_SIZE;

// Sectors copied between two resume-record rewrites (32 MiB of data).
const CHECKPOINT_SECTORS: u64 = 65_536;

/// One sector-by-sector copy job.
pub struct RawCopy {
    pub device: String,
    pub serial: String,
    pub out_dir: PathBuf,
    /// Name of the data file written under `out_dir`.
    pub out_file: String,
    pub buffer_size: u64,
    pub total_sectors: u64,
    pub log: ResumeLog,
    pub cancel: Arc<AtomicBool>,
}

impl RawCopy {
    /// Copies `total_sectors` sectors from the device to the output file,
    /// skipping the first `sectors_written` sectors that a previous run
    /// already committed. `record_path` is that run's resume record, if any;
    /// it is rewritten at every checkpoint and deleted on clean completion.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Parameter`] before any file is touched when the
    /// buffer size is not a positive multiple of 512, `total_sectors` is
    /// zero, or the resume cursor lies past the end. I/O failures and
    /// cooperative cancellation terminate the copy with a fresh resume
    /// record on disk and the corresponding error.
    pub fn run(
        &self,
        sectors_written: u64,
        record_path: Option<PathBuf>,
    ) -> Result<(), ImageError> {
        if self.buffer_size == 0 || self.buffer_size % SECTOR_SIZE != 0 {
            return Err(ImageError::Parameter(format!(
                "buffer size {} is not a positive multiple of {}",
                self.buffer_size, SECTOR_SIZE
            )));
        }
        if self.total_sectors == 0 {
            return Err(ImageError::Parameter("total sectors is zero".to_string()));
        }
        if sectors_written > self.total_sectors {
            return Err(ImageError::Parameter(format!(
                "resume cursor {} lies past the last sector {}",
                sectors_written, self.total_sectors
            )));
        }

        let started = Instant::now();
        let out_path = self.out_dir.join(&self.out_file);
        info!(
            "DD copy of '{}' into '{}' ({} sectors, starting at {})",
            self.device,
            out_path.display(),
            self.total_sectors,
            sectors_written
        );

        let mut reader = DeviceReader::open(&self.device)?;
        let mut writer = if sectors_written > 0 {
            ImageWriter::reopen(&out_path)?
        } else {
            ImageWriter::create(&out_path)?
        };
        if sectors_written > 0 {
            reader.seek((sectors_written * SECTOR_SIZE) as i64)?;
            writer.seek(sectors_written * SECTOR_SIZE)?;
        }

        let mut cursor = sectors_written;
        let mut record_path = record_path;
        match self.stream(&mut reader, &mut writer, &mut cursor, &mut record_path) {
            Ok(()) => {
                if let Some(path) = record_path {
                    if let Err(e) = self.log.delete(&path) {
                        error!("Could not delete resume record {}: {}", path.display(), e);
                    }
                }
                info!(
                    "DD copy finished: {} sectors in {:.1?}",
                    self.total_sectors,
                    started.elapsed()
                );
                Ok(())
            }
            Err(err) => {
                self.persist_record(&mut record_path, cursor);
                Err(err)
            }
        }
    }

    fn stream(
        &self,
        reader: &mut DeviceReader,
        writer: &mut ImageWriter,
        cursor: &mut u64,
        record_path: &mut Option<PathBuf>,
    ) -> Result<(), ImageError> {
        let buf_sectors = self.buffer_size / SECTOR_SIZE;
        let mut buf = vec![0u8; self.buffer_size as usize];
        let mut since_checkpoint = 0u64;

        while *cursor < self.total_sectors {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(ImageError::Interrupted);
            }

            let this_sectors = min(buf_sectors, self.total_sectors - *cursor);
            let wanted = (this_sectors * SECTOR_SIZE) as usize;
            let got = reader.read(&mut buf[..wanted])?;
            if got < wanted {
                // A DD image must carry every source byte; a short source is
                // a hard error, not padding material.
                return Err(ImageError::Read(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "source ended after {} bytes, {} more expected",
                        *cursor * SECTOR_SIZE + got as u64,
                        wanted - got
                    ),
                )));
            }
            writer.write(&buf[..wanted])?;
            *cursor += this_sectors;

            since_checkpoint += this_sectors;
            if since_checkpoint >= CHECKPOINT_SECTORS && *cursor < self.total_sectors {
                since_checkpoint = 0;
                self.persist_record(record_path, *cursor);
            }
        }
        Ok(())
    }

    // A record that cannot be persisted is logged and otherwise ignored; the
    // copy itself decides success or failure.
    fn persist_record(&self, record_path: &mut Option<PathBuf>, sectors_written: u64) {
        let record = RawCopyRecord {
            device: self.device.clone(),
            serial: self.serial.clone(),
            out_dir: self.out_dir.to_string_lossy().into_owned(),
            out_name: self.out_file.clone(),
            end_time: unix_now(),
            sectors_written,
            total_sectors: self.total_sectors,
        };
        let result = match record_path {
            Some(path) => self.log.write_raw(path, &record),
            None => match self.log.create_raw(&record) {
                Ok(path) => {
                    *record_path = Some(path);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            error!("Could not persist resume record: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::ResumeRecord;
    use std::fs;

    fn engine(dir: &std::path::Path, device: &str, total_sectors: u64, buffer_size: u64) -> RawCopy {
        RawCopy {
            device: device.to_string(),
            serial: "TESTSERIAL".to_string(),
            out_dir: dir.to_path_buf(),
            out_file: "copy.dd".to_string(),
            buffer_size,
            total_sectors,
            log: ResumeLog::new(dir.join("logs")),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn one_mib_copy_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        let data = patterned(1 << 20);
        fs::write(&src, &data).unwrap();

        let engine = engine(dir.path(), src.to_str().unwrap(), 2048, 4096);
        engine.run(0, None).unwrap();

        assert_eq!(fs::read(dir.path().join("copy.dd")).unwrap(), data);
        assert!(engine.log.enumerate().is_empty());
    }

    #[test]
    fn residual_tail_smaller_than_buffer_is_copied_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        // 5 sectors with a 2-sector buffer leaves a 1-sector tail.
        let data = patterned(5 * 512);
        fs::write(&src, &data).unwrap();

        engine(dir.path(), src.to_str().unwrap(), 5, 1024).run(0, None).unwrap();
        assert_eq!(fs::read(dir.path().join("copy.dd")).unwrap(), data);
    }

    #[test]
    fn resume_continues_at_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        let data = patterned(8 * 512);
        fs::write(&src, &data).unwrap();

        // A previous run committed the first 3 sectors.
        let out = dir.path().join("copy.dd");
        fs::write(&out, &data[..3 * 512]).unwrap();

        engine(dir.path(), src.to_str().unwrap(), 8, 1024).run(3, None).unwrap();
        assert_eq!(fs::read(&out).unwrap(), data);
    }

    #[test]
    fn completed_run_resumed_again_rewrites_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        let data = patterned(4 * 512);
        fs::write(&src, &data).unwrap();

        let engine = engine(dir.path(), src.to_str().unwrap(), 4, 512);
        engine.run(0, None).unwrap();
        let before = fs::read(dir.path().join("copy.dd")).unwrap();

        engine.run(4, None).unwrap();
        assert_eq!(fs::read(dir.path().join("copy.dd")).unwrap(), before);
    }

    #[test]
    fn parameters_are_rejected_before_any_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        fs::write(&src, [0u8; 1024]).unwrap();

        let bad_buffer = engine(dir.path(), src.to_str().unwrap(), 2, 700);
        assert!(matches!(bad_buffer.run(0, None), Err(ImageError::Parameter(_))));

        let zero_total = engine(dir.path(), src.to_str().unwrap(), 0, 512);
        assert!(matches!(zero_total.run(0, None), Err(ImageError::Parameter(_))));

        let bad_cursor = engine(dir.path(), src.to_str().unwrap(), 2, 512);
        assert!(matches!(bad_cursor.run(3, None), Err(ImageError::Parameter(_))));

        assert!(!dir.path().join("copy.dd").exists());
    }

    #[test]
    fn cancellation_leaves_a_resume_record() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        fs::write(&src, patterned(4 * 512)).unwrap();

        let engine = engine(dir.path(), src.to_str().unwrap(), 4, 512);
        engine.cancel.store(true, Ordering::Relaxed);
        assert!(matches!(engine.run(0, None), Err(ImageError::Interrupted)));

        let records = engine.log.enumerate();
        assert_eq!(records.len(), 1);
        match &records[0].1 {
            ResumeRecord::RawCopy(r) => {
                assert_eq!(r.sectors_written, 0);
                assert_eq!(r.total_sectors, 4);
                assert_eq!(r.out_name, "copy.dd");
            }
            _ => panic!("expected a DD record"),
        }
    }

    #[test]
    fn short_source_is_an_error_not_a_short_image() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.bin");
        fs::write(&src, [0x55u8; 3 * 512]).unwrap();

        let engine = engine(dir.path(), src.to_str().unwrap(), 8, 512);
        assert!(matches!(engine.run(0, None), Err(ImageError::Read(_))));
        // The failure left a record for continuation.
        assert_eq!(engine.log.enumerate().len(), 1);
    }
}
