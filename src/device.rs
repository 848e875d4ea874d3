//! Block-level source and destination primitives.
//!
//! This module provides the two thin wrappers around [`std::fs::File`] that
//! every imaging engine is built on: [`DeviceReader`] for the source side
//! (a raw block device such as `/dev/sdb1` or any regular file) and
//! [`ImageWriter`] for the destination image file. Core layout code never
//! touches paths or platform details beyond these two types.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::error::ImageError;

/// Sequential reader over a block device or regular file.
///
/// The reader distinguishes end-of-data from failure: a read that runs into
/// the end of a regular file returns the short count (possibly zero) and
/// latches [`is_done`](DeviceReader::is_done), while genuine I/O faults are
/// reported as [`ImageError::Read`]. Reads beyond the capacity of a raw
/// device are undefined and must be avoided by the caller.
#[derive(Debug)]
pub struct DeviceReader {
    file: File,
    done: bool,
}

impl DeviceReader {
    /// Opens the device or file at `path` for reading.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Open`] when the path cannot be opened, e.g. a
    /// missing file or insufficient privileges on a raw device node.
    pub fn open(path: &str) -> Result<DeviceReader, ImageError> {
        debug!("Opening source '{}'", path);
        let file = File::open(Path::new(path)).map_err(|source| ImageError::Open {
            path: path.to_string(),
            source,
        })?;
        Ok(DeviceReader { file, done: false })
    }

    /// Reads up to `buf.len()` bytes from the current cursor into `buf` and
    /// returns the number of bytes read.
    ///
    /// A count smaller than `buf.len()` means the source ran out of data;
    /// [`is_done`](DeviceReader::is_done) is latched in that case and every
    /// later call returns `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Read`] on any I/O failure.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ImageError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.done = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ImageError::Read(e)),
            }
        }
        Ok(filled)
    }

    /// Moves the read cursor by `offset` bytes relative to its current
    /// position. Used when resuming to skip over already-captured regions.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Seek`] when the cursor cannot be repositioned.
    pub fn seek(&mut self, offset: i64) -> Result<u64, ImageError> {
        self.file
            .seek(SeekFrom::Current(offset))
            .map_err(ImageError::Seek)
    }

    /// True once a read has hit the end of the source data.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

/// Writer for the output image file with an absolute-offset cursor.
pub struct ImageWriter {
    file: File,
}

impl ImageWriter {
    /// Creates the file at `path`, truncating any previous contents.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Open`] when the file cannot be created.
    pub fn create(path: &Path) -> Result<ImageWriter, ImageError> {
        debug!("Creating output image '{}'", path.display());
        let file = File::create(path).map_err(|source| ImageError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(ImageWriter { file })
    }

    /// Re-opens an existing partial image for a resumed job. The file is
    /// created if it vanished, and is never truncated.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Open`] when the file cannot be opened.
    pub fn reopen(path: &Path) -> Result<ImageWriter, ImageError> {
        debug!("Re-opening partial image '{}'", path.display());
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| ImageError::Open {
                path: path.display().to_string(),
                source,
            })?;
        Ok(ImageWriter { file })
    }

    /// Writes all of `buf` at the current cursor.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Write`] on any I/O failure.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), ImageError> {
        self.file.write_all(buf).map_err(ImageError::Write)
    }

    /// Positions the write cursor at the absolute byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Seek`] when the cursor cannot be repositioned.
    pub fn seek(&mut self, offset: u64) -> Result<(), ImageError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(ImageError::Seek)
    }

    /// Forces the file to the exact length `len`, extending with a hole or
    /// truncating as needed. The cursor is unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Write`] on failure.
    pub fn set_len(&mut self, len: u64) -> Result<(), ImageError> {
        self.file.set_len(len).map_err(ImageError::Write)
    }
}
