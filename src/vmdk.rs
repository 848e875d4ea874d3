//! This module contains functionality for writing VMDK virtual disks.
//!
//! Two variants are produced: a monolithic-sparse extent (one self-describing
//! file carrying the header, the embedded descriptor, the grain directory and
//! tables, and the grain-aligned data area with zero-grain elision) and a
//! monolithic-flat disk (a standalone text descriptor next to a raw
//! `<name>-flat.vmdk` data file).
//!
//! # Known Limitations
//!
//! Compressed grains, differential/parent chains and stream-optimized disks
//! are not produced. The descriptor is always written in UTF-8.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::{error, info};
use strum::Display;

use crate::dd::RawCopy;
use crate::device::{DeviceReader, ImageWriter};
use crate::error::ImageError;
use crate::resume::{unix_now, ResumeLog, SparseRecord};
use crate::{GRAIN_SECTORS, GRAIN_SIZE, GTES_PER_GT, SECTOR_SIZE};

const VMDK_MAGIC: u32 = 0x564D444B; // "KDMV" once laid out little-endian
const VMDK_VERSION: u32 = 1;
// Valid newline detection plus redundant-grain-table awareness.
const VMDK_FLAGS: u32 = 3;
const HEADER_BYTES: usize = 512;
const DESCRIPTOR_SECTORS: u64 = 1;
// The grain directory starts right after the header and embedded descriptor.
const GD_OFFSET_SECTORS: u64 = 2;

const DESCRIPTOR_FILE_SIGNATURE: &str = "# Disk DescriptorFile";
const DESCRIPTOR_FILE_EXTENT_SECTION_SIGNATURE: &str = "# Extent description";
const DESCRIPTOR_FILE_DISK_DATABASE_SECTION_SIGNATURE: &str = "# The Disk Data Base";

// Grains streamed between two resume-record rewrites (128 MiB of source).
const CHECKPOINT_GRAINS: u64 = 2048;

/// The disk types this writer emits into descriptors.
#[derive(Debug, Display, Clone, Copy, PartialEq)]
enum CreateType {
    #[strum(serialize = "monolithicSparse")]
    MonolithicSparse,
    #[strum(serialize = "monolithicFlat")]
    MonolithicFlat,
}

/// BIOS-style geometry advertised in the disk database section.
struct DiskGeometry {
    heads: u64,
    sectors: u64,
}

const SPARSE_GEOMETRY: DiskGeometry = DiskGeometry { heads: 16, sectors: 63 };
const FLAT_GEOMETRY: DiskGeometry = DiskGeometry { heads: 255, sectors: 63 };

impl DiskGeometry {
    fn cylinders(&self, capacity_sectors: u64) -> u64 {
        capacity_sectors / (self.heads * self.sectors)
    }
}

/// Draws a random 8-decimal-digit content identifier from the clock.
fn random_cid() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    10_000_000 + (nanos % 90_000_000) as u32
}

/// Renders the descriptor text for either disk variant.
fn descriptor_text(
    create_type: CreateType,
    cid: u32,
    capacity_sectors: u64,
    extent_file: &str,
    geometry: &DiskGeometry,
) -> String {
    let extent_kind = match create_type {
        CreateType::MonolithicSparse => "SPARSE",
        CreateType::MonolithicFlat => "FLAT",
    };
    format!(
        "{DESCRIPTOR_FILE_SIGNATURE}\n\
         version=1\n\
         CID={cid}\n\
         parentCID=ffffffff\n\
         createType=\"{create_type}\"\n\
         \n\
         {DESCRIPTOR_FILE_EXTENT_SECTION_SIGNATURE}\n\
         RW {capacity_sectors} {extent_kind} \"{extent_file}\" 0\n\
         \n\
         {DESCRIPTOR_FILE_DISK_DATABASE_SECTION_SIGNATURE}\n\
         #DDB\n\
         ddb.adapterType = \"ide\"\n\
         ddb.geometry.cylinders = \"{cylinders}\"\n\
         ddb.geometry.heads = \"{heads}\"\n\
         ddb.geometry.sectors = \"{sectors}\"\n\
         ddb.virtualHWVersion = \"10\"\n",
        cylinders = geometry.cylinders(capacity_sectors),
        heads = geometry.heads,
        sectors = geometry.sectors,
    )
}

/// The 512-byte binary header at the start of a sparse extent file.
///
/// Field order and widths follow the on-disk format; everything is encoded
/// little-endian by [`to_bytes`](SparseExtentHeader::to_bytes).
pub struct SparseExtentHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    /// Logical disk size in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    /// Sector of the embedded descriptor.
    pub descriptor_offset: u64,
    /// Embedded descriptor length in sectors.
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    /// Sector of the redundant grain directory; 0 when absent.
    pub rgd_offset: u64,
    /// Sector of the grain directory.
    pub gd_offset: u64,
    /// Metadata overhead in bytes.
    pub overhead: u64,
    pub unclean_shutdown: bool,
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// Builds the fixed header this writer emits for a disk of
    /// `capacity_sectors` sectors.
    pub fn for_capacity(capacity_sectors: u64) -> SparseExtentHeader {
        SparseExtentHeader {
            magic: VMDK_MAGIC,
            version: VMDK_VERSION,
            flags: VMDK_FLAGS,
            capacity: capacity_sectors,
            grain_size: GRAIN_SECTORS,
            descriptor_offset: 1,
            descriptor_size: DESCRIPTOR_SECTORS,
            num_gtes_per_gt: GTES_PER_GT as u32,
            rgd_offset: 0,
            gd_offset: GD_OFFSET_SECTORS,
            overhead: HEADER_BYTES as u64 + SECTOR_SIZE * DESCRIPTOR_SECTORS,
            unclean_shutdown: false,
            compress_algorithm: 0,
        }
    }

    /// Serialises the header into its on-disk 512-byte form.
    pub fn to_bytes(&self) -> [u8; HEADER_BYTES] {
        let mut bytes = [0u8; HEADER_BYTES];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.flags.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        bytes[20..28].copy_from_slice(&self.grain_size.to_le_bytes());
        bytes[28..36].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        bytes[36..44].copy_from_slice(&self.descriptor_size.to_le_bytes());
        bytes[44..48].copy_from_slice(&self.num_gtes_per_gt.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.rgd_offset.to_le_bytes());
        bytes[56..64].copy_from_slice(&self.gd_offset.to_le_bytes());
        bytes[64..72].copy_from_slice(&self.overhead.to_le_bytes());
        bytes[72] = self.unclean_shutdown as u8;
        // Newline witness bytes used by consumers to detect line-ending
        // mangling of the file.
        bytes[73] = b'\n';
        bytes[74] = b' ';
        bytes[75] = b'\r';
        bytes[76] = b'\n';
        bytes[77..79].copy_from_slice(&self.compress_algorithm.to_le_bytes());
        bytes
    }
}

/// Byte offsets of every region of a sparse extent, derived from the disk
/// capacity alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseLayout {
    pub capacity_sectors: u64,
    pub total_grains: u64,
    pub num_gts: u64,
    /// Byte offset of the grain directory.
    pub gd_offset: u64,
    /// Byte offset of the grain tables, sector aligned.
    pub gt_offset: u64,
    /// Byte offset of the data region, grain aligned.
    pub data_offset: u64,
}

fn align_up(value: u64, to: u64) -> u64 {
    value.div_ceil(to) * to
}

impl SparseLayout {
    /// Computes the layout for a disk of `capacity_sectors` sectors.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Parameter`] for a zero capacity.
    pub fn for_capacity(capacity_sectors: u64) -> Result<SparseLayout, ImageError> {
        if capacity_sectors == 0 {
            return Err(ImageError::Parameter("capacity is zero sectors".to_string()));
        }
        let total_grains = capacity_sectors.div_ceil(GRAIN_SECTORS);
        let num_gts = total_grains.div_ceil(GTES_PER_GT);
        let gd_offset = GD_OFFSET_SECTORS * SECTOR_SIZE;
        let gt_offset = align_up(gd_offset + num_gts * 4, SECTOR_SIZE);
        let data_offset = align_up(gt_offset + total_grains * 4, GRAIN_SIZE);
        Ok(SparseLayout {
            capacity_sectors,
            total_grains,
            num_gts,
            gd_offset,
            gt_offset,
            data_offset,
        })
    }

    /// The first grain-table entry value, i.e. the sector of the first data
    /// grain.
    fn first_gte(&self) -> u32 {
        (self.data_offset / SECTOR_SIZE) as u32
    }
}

// Cursor state of the grain-streaming phase. `cur_gte` is the sector the
// next non-zero grain will land on.
struct Progress {
    grains_read: u64,
    cur_gte: u32,
}

impl Progress {
    fn grains_written(&self, layout: &SparseLayout) -> u64 {
        (self.cur_gte as u64 - layout.data_offset / SECTOR_SIZE) / GRAIN_SECTORS
    }
}

/// Builder for a monolithic-sparse VMDK image of one source device.
pub struct SparseVmdk {
    pub device: String,
    pub serial: String,
    pub out_dir: PathBuf,
    /// Base name; the image lands at `out_dir/out_name.vmdk`.
    pub out_name: String,
    /// Read granularity in bytes; must be a positive multiple of the grain.
    pub buffer_size: u64,
    pub capacity_sectors: u64,
    /// Fixed content identifier for reproducible output; a random one is
    /// drawn when absent.
    pub cid: Option<u32>,
    pub log: ResumeLog,
    pub cancel: Arc<AtomicBool>,
}

impl SparseVmdk {
    /// Path of the image this builder writes.
    pub fn out_file(&self) -> PathBuf {
        self.out_dir.join(format!("{}.vmdk", self.out_name))
    }

    /// Builds the sparse image from scratch: header, embedded descriptor,
    /// grain directory, the zero-eliding grain stream, and finally the grain
    /// table.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Parameter`] before any file is touched when the
    /// capacity is zero or the buffer size is not a multiple of the grain
    /// size. Failures after the grain stream has started leave a resume
    /// record behind alongside the partial image.
    pub fn create(&self) -> Result<(), ImageError> {
        let layout = self.validate()?;
        let started = Instant::now();
        let out_path = self.out_file();
        info!(
            "Sparse copy of '{}' into '{}' ({} grains over {} tables)",
            self.device,
            out_path.display(),
            layout.total_grains,
            layout.num_gts
        );

        let mut writer = ImageWriter::create(&out_path)?;
        self.write_metadata(&mut writer, &layout)?;
        // Even a fully-zero disk ends exactly at the data region.
        writer.set_len(layout.data_offset)?;
        writer.seek(layout.data_offset)?;

        let mut reader = DeviceReader::open(&self.device)?;
        let mut gtes = vec![0u32; layout.total_grains as usize];
        let mut progress = Progress {
            grains_read: 0,
            cur_gte: layout.first_gte(),
        };
        self.finish(&mut reader, &mut writer, &layout, &mut gtes, &mut progress, None, started)
    }

    /// Re-enters an interrupted build using the persisted record and its
    /// grain-table array. The partial image is continued in place; the
    /// header, descriptor and grain directory written by the interrupted run
    /// are kept as they are.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Parameter`] when the record does not describe
    /// this job's layout. Streaming failures behave as in
    /// [`create`](SparseVmdk::create).
    pub fn resume(
        &self,
        record: &SparseRecord,
        gtes: Vec<u32>,
        record_path: PathBuf,
    ) -> Result<(), ImageError> {
        let layout = self.validate()?;
        if record.total_grains != layout.total_grains
            || record.data_offset != layout.data_offset
            || record.gt_offset != layout.gt_offset
            || record.grains_read > layout.total_grains
            || gtes.len() as u64 != layout.total_grains
        {
            return Err(ImageError::Parameter(
                "resume record does not match the computed layout".to_string(),
            ));
        }
        let started = Instant::now();
        info!(
            "Resuming sparse copy of '{}' at grain {} of {}",
            self.device, record.grains_read, layout.total_grains
        );

        let mut writer = ImageWriter::reopen(&self.out_file())?;
        let mut reader = DeviceReader::open(&self.device)?;
        reader.seek((record.grains_read * GRAIN_SIZE) as i64)?;

        let mut progress = Progress {
            grains_read: record.grains_read,
            cur_gte: layout.first_gte() + (record.grains_written * GRAIN_SECTORS) as u32,
        };
        writer.seek(progress.cur_gte as u64 * SECTOR_SIZE)?;

        let mut gtes = gtes;
        self.finish(
            &mut reader,
            &mut writer,
            &layout,
            &mut gtes,
            &mut progress,
            Some(record_path),
            started,
        )
    }

    fn validate(&self) -> Result<SparseLayout, ImageError> {
        if self.buffer_size == 0 || self.buffer_size % GRAIN_SIZE != 0 {
            return Err(ImageError::Parameter(format!(
                "buffer size {} is not a positive multiple of the {}-byte grain",
                self.buffer_size, GRAIN_SIZE
            )));
        }
        SparseLayout::for_capacity(self.capacity_sectors)
    }

    // Header, embedded descriptor and grain directory, in that order.
    fn write_metadata(
        &self,
        writer: &mut ImageWriter,
        layout: &SparseLayout,
    ) -> Result<(), ImageError> {
        let header = SparseExtentHeader::for_capacity(self.capacity_sectors);
        writer.write(&header.to_bytes())?;

        let cid = self.cid.unwrap_or_else(random_cid);
        let descriptor = descriptor_text(
            CreateType::MonolithicSparse,
            cid,
            self.capacity_sectors,
            &format!("{}.vmdk", self.out_name),
            &SPARSE_GEOMETRY,
        );
        let mut block = descriptor.into_bytes();
        if block.len() > (DESCRIPTOR_SECTORS * SECTOR_SIZE) as usize {
            return Err(ImageError::Parameter(
                "descriptor does not fit its reserved sector".to_string(),
            ));
        }
        block.resize((DESCRIPTOR_SECTORS * SECTOR_SIZE) as usize, 0);
        writer.write(&block)?;

        writer.seek(layout.gd_offset)?;
        let gt_base = (layout.gt_offset / SECTOR_SIZE) as u32;
        let mut gdes = Vec::with_capacity(layout.num_gts as usize * 4);
        for j in 0..layout.num_gts as u32 {
            // Each grain table spans 512 entries of 4 bytes: 4 sectors.
            gdes.extend_from_slice(&(gt_base + j * 4).to_le_bytes());
        }
        writer.write(&gdes)?;
        Ok(())
    }

    // Streams the data region and then commits the grain table. Any failure
    // after the stream began persists a resume record.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        reader: &mut DeviceReader,
        writer: &mut ImageWriter,
        layout: &SparseLayout,
        gtes: &mut [u32],
        progress: &mut Progress,
        record_path: Option<PathBuf>,
        started: Instant,
    ) -> Result<(), ImageError> {
        let mut record_path = record_path;
        let streamed = self
            .stream_grains(reader, writer, layout, gtes, progress, &mut record_path)
            .and_then(|()| {
                writer.seek(layout.gt_offset)?;
                let mut table = Vec::with_capacity(gtes.len() * 4);
                for gte in gtes.iter() {
                    table.extend_from_slice(&gte.to_le_bytes());
                }
                writer.write(&table)
            });

        match streamed {
            Ok(()) => {
                if let Some(path) = record_path {
                    if let Err(e) = self.log.delete(&path) {
                        error!("Could not delete resume record {}: {}", path.display(), e);
                    }
                }
                info!(
                    "Sparse copy finished: {} of {} grains materialised in {:.1?}",
                    progress.grains_written(layout),
                    layout.total_grains,
                    started.elapsed()
                );
                Ok(())
            }
            Err(err) => {
                self.persist_record(&mut record_path, layout, gtes, progress);
                Err(err)
            }
        }
    }

    fn stream_grains(
        &self,
        reader: &mut DeviceReader,
        writer: &mut ImageWriter,
        layout: &SparseLayout,
        gtes: &mut [u32],
        progress: &mut Progress,
        record_path: &mut Option<PathBuf>,
    ) -> Result<(), ImageError> {
        let batch_grains = self.buffer_size / GRAIN_SIZE;
        let mut buf = vec![0u8; self.buffer_size as usize];
        // Meaningful bytes of the last grain; 0 when capacity is grain
        // aligned.
        let tail_bytes = ((self.capacity_sectors % GRAIN_SECTORS) * SECTOR_SIZE) as usize;
        let mut since_checkpoint = 0u64;

        while progress.grains_read < layout.total_grains {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(ImageError::Interrupted);
            }

            let this_grains = batch_grains.min(layout.total_grains - progress.grains_read);
            let wanted = (this_grains * GRAIN_SIZE) as usize;
            let got = reader.read(&mut buf[..wanted])?;
            if got < wanted {
                // End of a regular-file source; the remainder is logically
                // zero.
                buf[got..wanted].fill(0);
            }

            for g in 0..this_grains {
                let grain = progress.grains_read;
                let grain_buf =
                    &mut buf[(g * GRAIN_SIZE) as usize..((g + 1) * GRAIN_SIZE) as usize];
                if grain == layout.total_grains - 1 && tail_bytes != 0 {
                    // Device bytes past the stated capacity never reach the
                    // image.
                    grain_buf[tail_bytes..].fill(0);
                }
                if grain_buf.iter().any(|&b| b != 0) {
                    writer.write(grain_buf)?;
                    gtes[grain as usize] = progress.cur_gte;
                    progress.cur_gte += GRAIN_SECTORS as u32;
                }
                progress.grains_read += 1;
            }

            since_checkpoint += this_grains;
            if since_checkpoint >= CHECKPOINT_GRAINS && progress.grains_read < layout.total_grains {
                since_checkpoint = 0;
                self.persist_record(record_path, layout, gtes, progress);
            }
        }
        Ok(())
    }

    // A record that cannot be persisted is logged and otherwise ignored; the
    // build itself decides success or failure.
    fn persist_record(
        &self,
        record_path: &mut Option<PathBuf>,
        layout: &SparseLayout,
        gtes: &[u32],
        progress: &Progress,
    ) {
        let record = SparseRecord {
            device: self.device.clone(),
            serial: self.serial.clone(),
            out_dir: self.out_dir.to_string_lossy().into_owned(),
            out_name: self.out_name.clone(),
            end_time: unix_now(),
            grains_written: progress.grains_written(layout),
            grains_read: progress.grains_read,
            total_grains: layout.total_grains,
            data_offset: layout.data_offset,
            gt_offset: layout.gt_offset,
        };
        let result = match record_path {
            Some(path) => self.log.write_sparse(path, &record, gtes),
            None => match self.log.create_sparse(&record, gtes) {
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

/// Builder for a monolithic-flat VMDK: a text descriptor plus a DD copy of
/// the source into `<name>-flat.vmdk`.
pub struct FlatVmdk {
    pub device: String,
    pub serial: String,
    pub out_dir: PathBuf,
    /// Base name; the descriptor lands at `out_dir/out_name.vmdk` and the
    /// data at `out_dir/out_name-flat.vmdk`.
    pub out_name: String,
    pub buffer_size: u64,
    pub capacity_sectors: u64,
    /// Fixed content identifier for reproducible output.
    pub cid: Option<u32>,
    pub log: ResumeLog,
    pub cancel: Arc<AtomicBool>,
}

impl FlatVmdk {
    /// Writes the descriptor (fresh jobs only) and copies the device into
    /// the flat data file, continuing at `sectors_written` when resuming.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::Parameter`] for a zero capacity before any file
    /// is created; the data copy itself fails as
    /// [`RawCopy::run`](crate::dd::RawCopy::run) does.
    pub fn create(
        &self,
        sectors_written: u64,
        record_path: Option<PathBuf>,
    ) -> Result<(), ImageError> {
        if self.capacity_sectors == 0 {
            return Err(ImageError::Parameter("capacity is zero sectors".to_string()));
        }
        let flat_name = format!("{}-flat.vmdk", self.out_name);

        if sectors_written == 0 {
            let cid = self.cid.unwrap_or_else(random_cid);
            let descriptor = descriptor_text(
                CreateType::MonolithicFlat,
                cid,
                self.capacity_sectors,
                &flat_name,
                &FLAT_GEOMETRY,
            );
            let descriptor_path = self.out_dir.join(format!("{}.vmdk", self.out_name));
            info!("Writing flat descriptor '{}'", descriptor_path.display());
            let mut writer = ImageWriter::create(&descriptor_path)?;
            writer.write(descriptor.as_bytes())?;
        }

        let copy = RawCopy {
            device: self.device.clone(),
            serial: self.serial.clone(),
            out_dir: self.out_dir.clone(),
            out_file: flat_name,
            buffer_size: self.buffer_size,
            total_sectors: self.capacity_sectors,
            log: self.log.clone(),
            cancel: Arc::clone(&self.cancel),
        };
        copy.run(sectors_written, record_path)
    }
}
