//! Error types for imaging jobs.
//!
//! One enum covers the whole pipeline so callers can tell apart the failure
//! that matters to them: a path that would not open, an I/O fault mid-stream,
//! a rejected parameter, or an unusable resume record.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Errors produced while creating or resuming a disk image.
#[derive(Debug)]
pub enum ImageError {
    /// The source device or the destination file could not be opened.
    Open { path: String, source: io::Error },
    /// I/O failure while reading from the source.
    Read(io::Error),
    /// I/O failure while writing to the output image.
    Write(io::Error),
    /// Repositioning a read or write cursor failed.
    Seek(io::Error),
    /// A job parameter was rejected before any file was touched.
    Parameter(String),
    /// A resume record could not be parsed. During enumeration such records
    /// are skipped; this surfaces only when a specific record is requested.
    ResumeParse { path: PathBuf, reason: String },
    /// The job was cancelled cooperatively. A resume record has been written
    /// if the data-streaming phase had begun.
    Interrupted,
}

impl fmt::Display for ImageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageError::Open { path, source } => write!(f, "cannot open '{}': {}", path, source),
            ImageError::Read(e) => write!(f, "read error: {}", e),
            ImageError::Write(e) => write!(f, "write error: {}", e),
            ImageError::Seek(e) => write!(f, "seek error: {}", e),
            ImageError::Parameter(reason) => write!(f, "invalid parameter: {}", reason),
            ImageError::ResumeParse { path, reason } => {
                write!(f, "malformed resume record {}: {}", path.display(), reason)
            }
            ImageError::Interrupted => write!(f, "job cancelled"),
        }
    }
}

impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageError::Open { source, .. } => Some(source),
            ImageError::Read(e) | ImageError::Write(e) | ImageError::Seek(e) => Some(e),
            _ => None,
        }
    }
}
