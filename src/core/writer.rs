//! Building QCOW2 images from scratch
//!
//! Physical layout produced by [`ImageWriter`]:
//!
//! ```text
//! cluster 0          header (+ backing file path)
//! cluster 1..        L1 table (reserved at create)
//! next cluster       refcount table (reserved at create)
//! ...                data clusters / compressed payloads, in write order
//! ...                L2 tables, refcount blocks (allocated at close)
//! ```
//!
//! Allocation only ever moves forward. Tables live in memory until
//! [`ImageWriter::close`], which writes them out and puts the header down
//! last.

use crate::allocator::RefcountLedger;
use crate::compression::{compress, CompressedCluster};
use crate::config::{WriteMode, WriterConfig};
use crate::error::{FormatError, Qcow2Error, Result};
use crate::header::{Header, HEADER_LENGTH};
use crate::io::ImageFile;
use crate::layout::{
    cluster_count, l1_size, max_compressed_sectors, sectors_for, split, L1Entry, L2Entry,
    L2Table, MAX_L1_BYTES, SECTOR_SIZE,
};
use crate::reader::ImageReader;
use std::path::Path;
use tracing::{debug, info, trace};

/// Write position inside the partially filled tail of the compressed region
#[derive(Debug, Clone, Copy)]
struct CompressedArena {
    cursor: u64,
    bytes_remaining: u64,
}

#[derive(Debug)]
pub struct ImageWriter {
    file: ImageFile,
    header: Header,
    mode: WriteMode,
    ledger: RefcountLedger,
    l1_table: Vec<L2Table>,
    l1_clusters: u64,
    backing_file: Option<String>,
    arena: CompressedArena,
    last_compressed: Option<u64>,
}

impl ImageWriter {
    /// Create an image with the default cluster size
    pub fn create<P: AsRef<Path>>(path: P, virtual_size: u64, compressed: bool) -> Result<Self> {
        let mode = if compressed {
            WriteMode::Compressed
        } else {
            WriteMode::Uncompressed
        };
        Self::create_with_config(path, virtual_size, &WriterConfig::new().mode(mode))
    }

    pub fn create_with_config<P: AsRef<Path>>(
        path: P,
        virtual_size: u64,
        config: &WriterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref();
        let cluster_bits = config.cluster_bits;
        let cluster_size = 1u64 << cluster_bits;

        let mut header = Header::new(virtual_size, cluster_bits);
        let l1_entries = l1_size(virtual_size, cluster_bits);
        if l1_entries.saturating_mul(8) > MAX_L1_BYTES {
            return Err(FormatError::InvalidGeometry(format!(
                "virtual size {} needs {} L1 entries, limit is {} bytes",
                virtual_size, l1_entries, MAX_L1_BYTES
            ))
            .into());
        }
        header.l1_size = l1_entries as u32;

        let backing_file = match &config.backing_file {
            Some(backing) => {
                let name = Self::check_backing(path, backing, &header)?;
                header.backing_file_offset = HEADER_LENGTH as u64;
                header.backing_file_size = name.len() as u32;
                Some(name)
            }
            None => None,
        };

        let file = ImageFile::create(path)?;
        let mut ledger = RefcountLedger::new(cluster_bits);

        let l1_clusters = (l1_entries * 8).div_ceil(cluster_size).max(1);
        header.l1_table_offset = ledger.alloc_clusters(l1_clusters);
        header.refcount_table_offset = ledger.alloc_cluster();
        header.refcount_table_clusters = 1;

        let arena = CompressedArena {
            cursor: ledger.allocated_bytes(),
            bytes_remaining: 0,
        };

        info!(
            path = ?path,
            size = virtual_size,
            cluster_bits,
            mode = ?config.mode,
            backing = ?backing_file,
            "created image"
        );

        Ok(ImageWriter {
            file,
            header,
            mode: config.mode,
            ledger,
            l1_table: vec![L2Table::unallocated(); l1_entries as usize],
            l1_clusters,
            backing_file,
            arena,
            last_compressed: None,
        })
    }

    /// Validate a backing file against the new image's geometry and return
    /// the path as it will be recorded in the header
    fn check_backing(image: &Path, backing: &Path, header: &Header) -> Result<String> {
        let name = backing
            .to_str()
            .ok_or_else(|| {
                FormatError::InvalidGeometry(format!(
                    "backing file path {:?} is not valid UTF-8",
                    backing
                ))
            })?
            .to_string();
        if HEADER_LENGTH + name.len() > header.cluster_size() as usize {
            return Err(FormatError::InvalidGeometry(format!(
                "backing file path is {} bytes, header cluster holds {}",
                name.len(),
                header.cluster_size() as usize - HEADER_LENGTH
            ))
            .into());
        }

        let resolved = match image.parent() {
            Some(dir) if backing.is_relative() => dir.join(backing),
            _ => backing.to_path_buf(),
        };
        let reader = ImageReader::open(&resolved)?;
        if reader.cluster_bits() != header.cluster_bits {
            return Err(Qcow2Error::BackingMismatch {
                path: resolved,
                field: "cluster_bits",
                expected: header.cluster_bits.into(),
                found: reader.cluster_bits().into(),
            });
        }
        if reader.virtual_size() != header.size {
            return Err(Qcow2Error::BackingMismatch {
                path: resolved,
                field: "size",
                expected: header.size,
                found: reader.virtual_size(),
            });
        }
        reader.close()?;
        Ok(name)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn cluster_bits(&self) -> u32 {
        self.header.cluster_bits
    }

    pub fn cluster_size(&self) -> usize {
        1 << self.header.cluster_bits
    }

    pub fn virtual_size(&self) -> u64 {
        self.header.size
    }

    pub fn cluster_count(&self) -> u64 {
        cluster_count(self.header.size, self.header.cluster_bits)
    }

    /// Bytes covered by clusters allocated so far
    pub fn allocated_bytes(&self) -> u64 {
        self.ledger.allocated_bytes()
    }

    pub fn backing_file(&self) -> Option<&Path> {
        self.backing_file.as_deref().map(Path::new)
    }

    /// Allocate one physical cluster and return its byte offset
    pub fn alloc_cluster(&mut self) -> u64 {
        self.ledger.alloc_cluster()
    }

    fn check_range(&self, cluster: u64) -> Result<()> {
        let clusters = self.cluster_count();
        if cluster >= clusters {
            return Err(Qcow2Error::ClusterOutOfRange { cluster, clusters });
        }
        Ok(())
    }

    fn check_payload(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.cluster_size() {
            return Err(Qcow2Error::PayloadSize {
                expected: self.cluster_size(),
                actual: data.len(),
            });
        }
        Ok(())
    }

    fn require_mode(&self, mode: WriteMode, cluster: u64) -> Result<()> {
        if self.mode != mode {
            return Err(Qcow2Error::SequentialViolation {
                cluster,
                reason: match self.mode {
                    WriteMode::Compressed => "writer is in compressed mode",
                    WriteMode::Uncompressed => "writer is in uncompressed mode",
                },
            });
        }
        Ok(())
    }

    /// Store a raw L2 entry for `cluster`, materializing its L2 table on first use
    pub fn set_l2_entry(&mut self, cluster: u64, raw: u64) -> Result<()> {
        self.check_range(cluster)?;
        let cluster_bits = self.header.cluster_bits;
        let (l1_index, l2_index) = split(cluster, cluster_bits);
        let table = &mut self.l1_table[l1_index];
        if !table.is_allocated() {
            trace!(l1_index, "materializing L2 table");
        }
        table.set(l2_index, raw, cluster_bits);
        Ok(())
    }

    /// Write one full cluster in the writer's mode
    pub fn write_cluster(&mut self, cluster: u64, data: &[u8]) -> Result<()> {
        match self.mode {
            WriteMode::Uncompressed => self.write_cluster_uncompressed(cluster, data),
            WriteMode::Compressed => self.write_cluster_compressed(cluster, data),
        }
    }

    /// Write a cluster that may be absent; `None` leaves the cluster unmapped
    pub fn write_optional_cluster(&mut self, cluster: u64, data: Option<&[u8]>) -> Result<()> {
        match data {
            Some(data) => self.write_cluster(cluster, data),
            None => {
                self.check_range(cluster)?;
                trace!(cluster, "skipping absent cluster");
                Ok(())
            }
        }
    }

    /// Store `data` in a freshly allocated cluster.
    ///
    /// Rewriting a cluster allocates a new one; the old one stays allocated.
    pub fn write_cluster_uncompressed(&mut self, cluster: u64, data: &[u8]) -> Result<()> {
        self.require_mode(WriteMode::Uncompressed, cluster)?;
        self.check_range(cluster)?;
        self.check_payload(data)?;

        let offset = self.alloc_cluster();
        self.file.pwrite(offset, data)?;
        self.set_l2_entry(cluster, L2Entry::Plain { offset }.encode(self.header.cluster_bits))?;
        trace!(cluster, offset, "wrote cluster");
        Ok(())
    }

    /// Compress `data` and append it to the compressed region
    pub fn write_cluster_compressed(&mut self, cluster: u64, data: &[u8]) -> Result<()> {
        self.require_mode(WriteMode::Compressed, cluster)?;
        self.check_range(cluster)?;
        self.check_payload(data)?;

        let compressed = compress(data)?;
        self.append_compressed(cluster, &compressed)
    }

    /// Append an already compressed raw DEFLATE stream for `cluster`.
    ///
    /// The stream must inflate to exactly one cluster.
    pub fn write_cluster_precompressed(&mut self, cluster: u64, stream: &[u8]) -> Result<()> {
        self.require_mode(WriteMode::Compressed, cluster)?;
        self.check_range(cluster)?;

        let mut data = stream.to_vec();
        data.resize(stream.len().next_multiple_of(SECTOR_SIZE), 0);
        let compressed = CompressedCluster {
            data,
            stream_len: stream.len(),
        };
        self.append_compressed(cluster, &compressed)
    }

    fn append_compressed(&mut self, cluster: u64, compressed: &CompressedCluster) -> Result<()> {
        let cluster_bits = self.header.cluster_bits;
        let cluster_size = self.cluster_size() as u64;

        if let Some(last) = self.last_compressed {
            if cluster <= last {
                return Err(Qcow2Error::SequentialViolation {
                    cluster,
                    reason: if cluster == last {
                        "cluster already written"
                    } else {
                        "clusters must be written in ascending order"
                    },
                });
            }
        }
        if self.arena.cursor + self.arena.bytes_remaining != self.ledger.allocated_bytes() {
            return Err(Qcow2Error::SequentialViolation {
                cluster,
                reason: "clusters were allocated outside the compressed region",
            });
        }

        let sectors = compressed.sectors();
        let max_sectors = max_compressed_sectors(cluster_bits);
        if sectors > max_sectors {
            return Err(Qcow2Error::CompressedOverflow {
                cluster,
                sectors,
                max_sectors,
            });
        }

        let offset = self.arena.cursor;
        let len = compressed.data.len() as u64;
        debug_assert_eq!(sectors_for(compressed.data.len()), sectors);

        // The payload shares its first cluster with the previous one
        if self.arena.bytes_remaining > 0 {
            self.ledger.bump_last();
        }
        // A payload that exactly fills the tail needs no new cluster
        while self.arena.bytes_remaining < len {
            self.ledger.alloc_cluster();
            self.arena.bytes_remaining += cluster_size;
        }

        self.file.pwrite(offset, &compressed.data)?;
        self.arena.cursor += len;
        self.arena.bytes_remaining -= len;

        self.set_l2_entry(cluster, L2Entry::Compressed { offset, sectors }.encode(cluster_bits))?;
        self.last_compressed = Some(cluster);
        trace!(cluster, offset, sectors, "wrote compressed cluster");
        Ok(())
    }

    /// Number of refcount table clusters and refcount blocks to write at close.
    ///
    /// A table count of zero means the reserved table cluster is large enough.
    fn plan_refcounts(&self) -> (u64, u64) {
        let pointers_per_cluster = self.cluster_size() as u64 / 8;
        let mut table_clusters = 0;
        loop {
            let blocks = self.ledger.blocks_needed(table_clusters);
            let needed = blocks.div_ceil(pointers_per_cluster);
            if table_clusters == 0 && needed <= 1 {
                return (0, blocks);
            }
            if needed <= table_clusters {
                return (table_clusters, blocks);
            }
            table_clusters = needed;
        }
    }

    /// Flush all tables and the header, then close the file
    pub fn close(mut self) -> Result<()> {
        let cluster_size = self.cluster_size() as u64;

        let mut l1_raw = vec![0u64; (self.l1_clusters * cluster_size / 8) as usize];
        for (l1_index, table) in self.l1_table.iter().enumerate() {
            if !table.is_allocated() {
                continue;
            }
            let offset = self.ledger.alloc_cluster();
            self.file.write_be_u64s(offset, table.entries())?;
            l1_raw[l1_index] = L1Entry::from_l2_offset(offset).0;
        }
        self.file.write_be_u64s(self.header.l1_table_offset, &l1_raw)?;

        let (relocated, blocks) = self.plan_refcounts();
        if relocated > 0 {
            self.header.refcount_table_offset = self.ledger.alloc_clusters(relocated);
            self.header.refcount_table_clusters = relocated as u32;
            debug!(
                offset = self.header.refcount_table_offset,
                clusters = relocated,
                "relocated refcount table"
            );
        }

        let per_block = (cluster_size / 2) as usize;
        let first_block = self.ledger.alloc_clusters(blocks);
        debug_assert!(self.ledger.len() <= blocks as usize * per_block);

        let table_len = u64::from(self.header.refcount_table_clusters) * cluster_size / 8;
        let mut refcount_table = vec![0u64; table_len as usize];
        for (i, slot) in refcount_table.iter_mut().take(blocks as usize).enumerate() {
            let block_offset = first_block + i as u64 * cluster_size;
            let counts = self.ledger.block(i * per_block, per_block);
            let mut block = vec![0u16; per_block];
            block[..counts.len()].copy_from_slice(counts);
            self.file.write_be_u16s(block_offset, &block)?;
            *slot = block_offset;
        }
        self.file
            .write_be_u64s(self.header.refcount_table_offset, &refcount_table)?;

        if let Some(name) = &self.backing_file {
            self.file.pwrite(self.header.backing_file_offset, name.as_bytes())?;
        }
        self.file.pwrite(0, &self.header.encode())?;
        self.file.sync()?;

        info!(
            path = ?self.file.path(),
            clusters = self.ledger.len(),
            l2_tables = self.l1_table.iter().filter(|t| t.is_allocated()).count(),
            refcount_blocks = blocks,
            "closed image"
        );
        Ok(())
    }
}
