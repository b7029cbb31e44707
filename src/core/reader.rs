//! Read-only access to QCOW2 images
//!
//! An [`ImageReader`] loads the whole L1/L2 mapping at open time and then
//! resolves clusters against it. Clusters not stored in this image fall
//! through to the backing image, which the reader owns outright.
//!
//! ```text
//! child.qcow2 ──absent──► base.qcow2 ──absent──► hole (None)
//! ```
//!
//! Any cluster or sector whose content is entirely zero is reported as a
//! hole, whether or not it is physically stored.

use crate::compression::decompress;
use crate::error::{FormatError, Qcow2Error, Result};
use crate::header::{Header, HEADER_LENGTH};
use crate::io::ImageFile;
use crate::layout::{
    cluster_count, l1_size, l2_entries, split, L1Entry, L2Entry, L2Table, MAX_L1_BYTES,
    SECTOR_BITS, SECTOR_SIZE,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

/// Single-slot cache of the most recently resolved cluster
#[derive(Debug, Default)]
struct ClusterCache {
    slot: Option<(u64, Option<Vec<u8>>)>,
}

impl ClusterCache {
    fn holds(&self, cluster: u64) -> bool {
        matches!(self.slot, Some((cached, _)) if cached == cluster)
    }

    fn data(&self) -> Option<&[u8]> {
        self.slot.as_ref().and_then(|(_, data)| data.as_deref())
    }
}

#[derive(Debug)]
pub struct ImageReader {
    file: ImageFile,
    header: Header,
    backing_file: Option<PathBuf>,
    backing: Option<Box<ImageReader>>,
    l1_table: Vec<L2Table>,
    cache: ClusterCache,
}

fn is_zero(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

impl ImageReader {
    /// Open an image and, recursively, its backing chain
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut chain = Vec::new();
        Self::open_in_chain(path.as_ref(), &mut chain)
    }

    fn open_in_chain(path: &Path, chain: &mut Vec<PathBuf>) -> Result<Self> {
        let canonical = std::fs::canonicalize(path)?;
        if chain.contains(&canonical) {
            return Err(Qcow2Error::BackingCycle(path.to_path_buf()));
        }
        chain.push(canonical);

        let mut file = ImageFile::open(path)?;
        let header = Header::decode(&file.pread(0, HEADER_LENGTH)?)?;
        Self::check_geometry(&header)?;

        let (backing_file, backing) = if header.has_backing_file() {
            let raw = file.pread(
                header.backing_file_offset,
                header.backing_file_size as usize,
            )?;
            let name = String::from_utf8(raw).map_err(|_| {
                FormatError::InvalidGeometry("backing file path is not valid UTF-8".into())
            })?;
            let resolved = resolve_backing_path(path, Path::new(&name));
            debug!(image = ?path, backing = ?resolved, "opening backing file");

            let backing = Self::open_in_chain(&resolved, chain)?;
            if backing.header.cluster_bits != header.cluster_bits {
                return Err(Qcow2Error::BackingMismatch {
                    path: resolved,
                    field: "cluster_bits",
                    expected: header.cluster_bits.into(),
                    found: backing.header.cluster_bits.into(),
                });
            }
            if backing.header.size != header.size {
                return Err(Qcow2Error::BackingMismatch {
                    path: resolved,
                    field: "size",
                    expected: header.size,
                    found: backing.header.size,
                });
            }
            (Some(resolved), Some(Box::new(backing)))
        } else {
            (None, None)
        };

        let l1_table = Self::load_tables(&mut file, &header)?;

        info!(
            path = ?path,
            size = header.size,
            cluster_bits = header.cluster_bits,
            backing = ?backing_file,
            "opened image"
        );

        Ok(ImageReader {
            file,
            header,
            backing_file,
            backing,
            l1_table,
            cache: ClusterCache::default(),
        })
    }

    fn check_geometry(header: &Header) -> Result<()> {
        let needed = l1_size(header.size, header.cluster_bits);
        if u64::from(header.l1_size) < needed {
            return Err(FormatError::InvalidGeometry(format!(
                "L1 table has {} entries, virtual size needs {}",
                header.l1_size, needed
            ))
            .into());
        }
        if u64::from(header.l1_size) * 8 > MAX_L1_BYTES {
            return Err(FormatError::InvalidGeometry(format!(
                "L1 table of {} entries exceeds {} bytes",
                header.l1_size, MAX_L1_BYTES
            ))
            .into());
        }
        if header.has_backing_file()
            && header
                .backing_file_offset
                .saturating_add(header.backing_file_size.into())
                > header.cluster_size()
        {
            return Err(FormatError::InvalidGeometry(
                "backing file path extends past the header cluster".into(),
            )
            .into());
        }
        if header.l1_size > 0 && header.l1_table_offset % header.cluster_size() != 0 {
            return Err(FormatError::InvalidGeometry(format!(
                "L1 table offset {:#x} is not cluster aligned",
                header.l1_table_offset
            ))
            .into());
        }
        Ok(())
    }

    fn load_tables(file: &mut ImageFile, header: &Header) -> Result<Vec<L2Table>> {
        let cluster_bits = header.cluster_bits;
        let raw_l1 = file.read_be_u64s(header.l1_table_offset, header.l1_size as usize)?;

        let mut l1_table = Vec::with_capacity(raw_l1.len());
        for raw in raw_l1 {
            let table = match L1Entry(raw).l2_offset() {
                Some(offset) => {
                    if offset % header.cluster_size() != 0 {
                        return Err(FormatError::InvalidGeometry(format!(
                            "L2 table offset {:#x} is not cluster aligned",
                            offset
                        ))
                        .into());
                    }
                    let entries =
                        file.read_be_u64s(offset, l2_entries(cluster_bits) as usize)?;
                    L2Table::from_entries(entries)
                }
                None => L2Table::unallocated(),
            };
            l1_table.push(table);
        }

        debug!(
            l1_entries = l1_table.len(),
            l2_tables = l1_table.iter().filter(|t| t.is_allocated()).count(),
            "loaded mapping tables"
        );
        Ok(l1_table)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        self.file.path()
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

    /// Number of virtual clusters
    pub fn cluster_count(&self) -> u64 {
        cluster_count(self.header.size, self.header.cluster_bits)
    }

    /// Number of virtual 512-byte sectors
    pub fn sector_count(&self) -> u64 {
        self.header.size.div_ceil(SECTOR_SIZE as u64)
    }

    /// Resolved path of the backing file, if any
    pub fn backing_file(&self) -> Option<&Path> {
        self.backing_file.as_deref()
    }

    pub fn backing(&self) -> Option<&ImageReader> {
        self.backing.as_deref()
    }

    fn check_range(&self, cluster: u64) -> Result<()> {
        let clusters = self.cluster_count();
        if cluster >= clusters {
            return Err(Qcow2Error::ClusterOutOfRange { cluster, clusters });
        }
        Ok(())
    }

    /// L2 mapping of `cluster` in this image (not following the backing chain)
    pub fn l2_entry(&self, cluster: u64) -> Result<L2Entry> {
        self.check_range(cluster)?;
        let (l1_index, l2_index) = split(cluster, self.header.cluster_bits);
        let raw = self
            .l1_table
            .get(l1_index)
            .map_or(0, |table| table.get(l2_index));
        Ok(L2Entry::decode(raw, self.header.cluster_bits))
    }

    /// Resolve a cluster without touching the cache
    fn resolve_cluster(&mut self, cluster: u64) -> Result<Option<Vec<u8>>> {
        let cluster_size = self.cluster_size();

        let data = match self.l2_entry(cluster)? {
            L2Entry::Absent => {
                return match self.backing.as_mut() {
                    Some(backing) => {
                        trace!(cluster, "delegating to backing file");
                        backing.resolve_cluster(cluster)
                    }
                    None => Ok(None),
                };
            }
            L2Entry::Compressed { offset, sectors } => {
                let raw = self.file.pread(offset, sectors as usize * SECTOR_SIZE)?;
                let data = decompress(&raw, cluster_size)?;
                if data.len() != cluster_size {
                    return Err(Qcow2Error::Decompression(format!(
                        "cluster {} at {:#x} inflated to {} bytes, expected {}",
                        cluster,
                        offset,
                        data.len(),
                        cluster_size
                    )));
                }
                data
            }
            L2Entry::Plain { offset } => self.file.pread(offset, cluster_size)?,
        };

        if is_zero(&data) {
            Ok(None)
        } else {
            Ok(Some(data))
        }
    }

    /// Read a full cluster; `None` means a hole (all zero)
    pub fn read_cluster(&mut self, cluster: u64) -> Result<Option<&[u8]>> {
        if self.cache.holds(cluster) {
            trace!(cluster, "cluster cache hit");
        } else {
            let data = self.resolve_cluster(cluster)?;
            self.cache.slot = Some((cluster, data));
        }
        Ok(self.cache.data())
    }

    /// Read one 512-byte sector; `None` means the sector is all zero
    pub fn read_sector(&mut self, sector: u64) -> Result<Option<&[u8]>> {
        let shift = self.header.cluster_bits - SECTOR_BITS;
        let cluster = sector >> shift;
        let offset = ((sector & ((1 << shift) - 1)) as usize) << SECTOR_BITS;

        let data = self.read_cluster(cluster)?;
        Ok(data
            .map(|d| &d[offset..offset + SECTOR_SIZE])
            .filter(|s| !is_zero(s)))
    }

    /// Close the image and its backing chain
    pub fn close(self) -> Result<()> {
        info!(path = ?self.file.path(), "closed image");
        Ok(())
    }
}

/// Relative backing paths are relative to the referencing image's directory
fn resolve_backing_path(image: &Path, backing: &Path) -> PathBuf {
    if backing.is_absolute() {
        return backing.to_path_buf();
    }
    match image.parent() {
        Some(dir) => dir.join(backing),
        None => backing.to_path_buf(),
    }
}
