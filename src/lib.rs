//! # qcow2-rs - QCOW2 disk image reading and writing
//!
//! Reads and writes a restricted profile of QCOW2 version 3 images:
//!
//! - **16-bit refcounts**, no encryption, no snapshots, no feature bits
//! - **Backing chains** of any depth, resolved cluster by cluster
//! - **Compressed images** written sequentially with raw DEFLATE payloads
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use qcow2_rs::{ImageReader, ImageWriter, Result};
//!
//! # fn main() -> Result<()> {
//! // 1 GiB image with 64 KiB clusters
//! let mut writer = ImageWriter::create("disk.qcow2", 1 << 30, false)?;
//! writer.write_cluster(3, &vec![0xAB; 65536])?;
//! writer.close()?;
//!
//! let mut reader = ImageReader::open("disk.qcow2")?;
//! assert!(reader.read_cluster(3)?.is_some());
//! // Unwritten clusters read as holes
//! assert!(reader.read_cluster(4)?.is_none());
//! # Ok(())
//! # }
//! ```
//!
//! ## Flattening a backing chain
//!
//! ```rust,no_run
//! use qcow2_rs::{convert, Result, WriterConfig};
//!
//! # fn main() -> Result<()> {
//! let config = WriterConfig::new().cluster_bits(16).compressed();
//! let summary = convert("child.qcow2", "flat.qcow2", &config)?;
//! println!("{} of {} clusters stored", summary.clusters_written, summary.clusters);
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use self::core::{
    allocator, compression, config, error, header, io, layout, reader, writer,
};

pub use crate::core::{
    config::{WriteMode, WriterConfig},
    error::{FormatError, Qcow2Error, Result},
    header::{Header, SupportedProfile, HEADER_LENGTH, SUPPORTED_PROFILE},
    layout::{L1Entry, L2Entry},
    reader::ImageReader,
    writer::ImageWriter,
};

use std::path::Path;
use tracing::info;

/// Outcome of [`convert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvertSummary {
    /// Virtual clusters in the output image
    pub clusters: u64,

    /// Clusters that held data and were written
    pub clusters_written: u64,

    /// Size of the output file
    pub output_bytes: u64,
}

/// Copy every non-zero cluster of `input` (following its backing chain)
/// into a new standalone image at `output`.
///
/// The output keeps the input's virtual size. `config.backing_file` is
/// ignored, since the output is flattened. When the cluster sizes differ the
/// data is re-chunked through the sector interface.
pub fn convert<P: AsRef<Path>, Q: AsRef<Path>>(
    input: P,
    output: Q,
    config: &WriterConfig,
) -> Result<ConvertSummary> {
    let mut reader = ImageReader::open(input.as_ref())?;
    let config = WriterConfig {
        backing_file: None,
        ..config.clone()
    };
    let mut writer =
        ImageWriter::create_with_config(output.as_ref(), reader.virtual_size(), &config)?;

    let clusters = writer.cluster_count();
    let sectors_per_cluster = (writer.cluster_size() / layout::SECTOR_SIZE) as u64;
    let mut clusters_written = 0;

    if reader.cluster_bits() == writer.cluster_bits() {
        for cluster in 0..clusters {
            let data = reader.read_cluster(cluster)?;
            if data.is_some() {
                clusters_written += 1;
            }
            writer.write_optional_cluster(cluster, data)?;
        }
    } else {
        let mut buf = vec![0u8; writer.cluster_size()];
        let sector_count = reader.sector_count();
        for cluster in 0..clusters {
            buf.fill(0);
            let mut any = false;
            let first = cluster * sectors_per_cluster;
            for (i, sector) in (first..(first + sectors_per_cluster).min(sector_count)).enumerate() {
                if let Some(data) = reader.read_sector(sector)? {
                    let at = i * layout::SECTOR_SIZE;
                    buf[at..at + layout::SECTOR_SIZE].copy_from_slice(data);
                    any = true;
                }
            }
            if any {
                writer.write_cluster(cluster, &buf)?;
                clusters_written += 1;
            }
        }
    }

    writer.close()?;
    reader.close()?;

    let output_bytes = std::fs::metadata(output.as_ref())?.len();
    info!(
        input = ?input.as_ref(),
        output = ?output.as_ref(),
        clusters,
        clusters_written,
        output_bytes,
        "converted image"
    );

    Ok(ConvertSummary {
        clusters,
        clusters_written,
        output_bytes,
    })
}
