//! Address translation between virtual clusters and the two-level L1/L2 tables
//!
//! A virtual byte offset maps to a cluster number, which splits into an L1
//! index (which L2 table) and an L2 index (which entry in that table).
//! Every L2 table is exactly one cluster of big-endian `u64` entries, so it
//! holds `2^(cluster_bits - 3)` entries.
//!
//! All functions here are pure and total; callers are expected to pass
//! `cluster_bits` already validated against the header profile.

pub const SECTOR_BITS: u32 = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_BITS;

/// Largest L1 table, in bytes, an image may carry
pub const MAX_L1_BYTES: u64 = 32 << 20;

/// Tag bit: the entry holds a direct offset.
pub const COPIED: u64 = 1 << 63;

/// Tag bit: the L2 entry describes a compressed payload.
pub const COMPRESSED: u64 = 1 << 62;

/// Cluster containing `byte_offset`
pub fn cluster_index(byte_offset: u64, cluster_bits: u32) -> u64 {
    byte_offset >> cluster_bits
}

/// Entries per L2 table
pub fn l2_entries(cluster_bits: u32) -> u64 {
    1 << (cluster_bits - 3)
}

/// Split a cluster number into `(l1_index, l2_index)`
pub fn split(cluster: u64, cluster_bits: u32) -> (usize, usize) {
    let entries = l2_entries(cluster_bits);
    ((cluster / entries) as usize, (cluster % entries) as usize)
}

/// Number of L1 entries needed to cover `virtual_size` bytes
pub fn l1_size(virtual_size: u64, cluster_bits: u32) -> u64 {
    // Each L1 entry spans cluster_size * l2_entries = 2^(2 * cluster_bits - 3) bytes
    virtual_size.div_ceil(1 << (2 * cluster_bits - 3))
}

/// Number of virtual clusters covering `virtual_size` bytes
pub fn cluster_count(virtual_size: u64, cluster_bits: u32) -> u64 {
    virtual_size.div_ceil(1 << cluster_bits)
}

/// Width of the byte-offset field inside a compressed L2 descriptor
pub fn compressed_offset_bits(cluster_bits: u32) -> u32 {
    62 - (cluster_bits - 8)
}

/// Largest sector count a compressed descriptor can hold
pub fn max_compressed_sectors(cluster_bits: u32) -> u64 {
    (1 << (cluster_bits - 8)) - 1
}

/// Sectors occupied by `len` bytes of compressed payload
pub fn sectors_for(len: usize) -> u64 {
    len.div_ceil(SECTOR_SIZE) as u64
}

/// One L1 table entry: either empty or the offset of an L2 table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L1Entry(pub u64);

impl L1Entry {
    pub fn from_l2_offset(offset: u64) -> Self {
        L1Entry(offset | COPIED)
    }

    pub fn l2_offset(&self) -> Option<u64> {
        match self.0 & !COPIED {
            0 => None,
            offset => Some(offset),
        }
    }
}

/// Decoded L2 table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Entry {
    /// Not stored here: zero, or delegated to the backing file
    Absent,

    /// Full cluster stored uncompressed at `offset`
    Plain { offset: u64 },

    /// DEFLATE payload starting at byte `offset`, spanning `sectors` 512-byte sectors
    Compressed { offset: u64, sectors: u64 },
}

impl L2Entry {
    pub fn decode(raw: u64, cluster_bits: u32) -> Self {
        if raw == 0 {
            return L2Entry::Absent;
        }

        if raw & COMPRESSED != 0 {
            let x = compressed_offset_bits(cluster_bits);
            L2Entry::Compressed {
                offset: raw & ((1 << x) - 1),
                sectors: (raw >> x) & max_compressed_sectors(cluster_bits),
            }
        } else {
            L2Entry::Plain {
                offset: raw & !COPIED,
            }
        }
    }

    pub fn encode(&self, cluster_bits: u32) -> u64 {
        match *self {
            L2Entry::Absent => 0,
            L2Entry::Plain { offset } => offset | COPIED,
            L2Entry::Compressed { offset, sectors } => {
                let x = compressed_offset_bits(cluster_bits);
                offset | (sectors << x) | COMPRESSED
            }
        }
    }

    /// Byte range `(offset, len)` to read for this entry, if stored here
    pub fn host_range(&self, cluster_bits: u32) -> Option<(u64, usize)> {
        match *self {
            L2Entry::Absent => None,
            L2Entry::Plain { offset } => Some((offset, 1 << cluster_bits)),
            L2Entry::Compressed { offset, sectors } => {
                Some((offset, sectors as usize * SECTOR_SIZE))
            }
        }
    }
}

/// In-memory L2 table.
///
/// An unallocated region is an empty placeholder that reads as all-zero
/// entries; the first [`L2Table::set`] replaces it with a full table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct L2Table {
    entries: Vec<u64>,
}

impl L2Table {
    pub fn unallocated() -> Self {
        L2Table::default()
    }

    pub fn from_entries(entries: Vec<u64>) -> Self {
        L2Table { entries }
    }

    pub fn is_allocated(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Raw entry at `index`, zero for an unallocated table
    pub fn get(&self, index: usize) -> u64 {
        self.entries.get(index).copied().unwrap_or(0)
    }

    pub fn set(&mut self, index: usize, raw: u64, cluster_bits: u32) {
        if self.entries.is_empty() {
            self.entries = vec![0; l2_entries(cluster_bits) as usize];
        }
        self.entries[index] = raw;
    }

    pub fn entries(&self) -> &[u64] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_table_lazy_materialization() {
        let mut table = L2Table::unallocated();
        assert!(!table.is_allocated());
        assert_eq!(table.get(100), 0);

        table.set(100, 0x9_0000 | COPIED, 12);
        assert!(table.is_allocated());
        assert_eq!(table.entries().len(), 512);
        assert_eq!(table.get(100), 0x9_0000 | COPIED);
        assert_eq!(table.get(99), 0);
    }

    #[test]
    fn test_cluster_index() {
        assert_eq!(cluster_index(0, 16), 0);
        assert_eq!(cluster_index(65535, 16), 0);
        assert_eq!(cluster_index(65536, 16), 1);
        assert_eq!(cluster_index(10 << 16 | 17, 16), 10);
    }

    #[test]
    fn test_split_64k_clusters() {
        assert_eq!(l2_entries(16), 8192);
        assert_eq!(split(10000, 16), (1, 1808));
        assert_eq!(split(0, 16), (0, 0));
        assert_eq!(split(8191, 16), (0, 8191));
        assert_eq!(split(8192, 16), (1, 0));
    }

    #[test]
    fn test_l1_size() {
        // ceil(2^40 / (2^16 * 2^13))
        assert_eq!(l1_size(1 << 40, 16), 2048);
        assert_eq!(l1_size((1 << 40) + 1, 16), 2049);
        assert_eq!(l1_size(1, 16), 1);
        assert_eq!(l1_size(0, 16), 0);
        // 512-byte clusters: 64 entries per table, 32 KiB per L1 entry
        assert_eq!(l1_size(1 << 20, 9), 32);
    }

    #[test]
    fn test_cluster_count() {
        assert_eq!(cluster_count(1 << 20, 16), 16);
        assert_eq!(cluster_count((1 << 20) + 1, 16), 17);
    }

    #[test]
    fn test_compressed_descriptor_widths() {
        assert_eq!(compressed_offset_bits(16), 54);
        assert_eq!(max_compressed_sectors(16), 255);
        assert_eq!(compressed_offset_bits(9), 61);
        assert_eq!(max_compressed_sectors(9), 1);
    }

    #[test]
    fn test_sectors_for() {
        assert_eq!(sectors_for(1), 1);
        assert_eq!(sectors_for(512), 1);
        assert_eq!(sectors_for(513), 2);
        assert_eq!(sectors_for(0), 0);
    }

    #[test]
    fn test_l1_entry() {
        assert_eq!(L1Entry(0).l2_offset(), None);
        let entry = L1Entry::from_l2_offset(0x30000);
        assert_eq!(entry.0, 0x30000 | COPIED);
        assert_eq!(entry.l2_offset(), Some(0x30000));
    }

    #[test]
    fn test_l2_entry_plain() {
        let raw = 0x5_0000 | COPIED;
        let entry = L2Entry::decode(raw, 16);
        assert_eq!(entry, L2Entry::Plain { offset: 0x5_0000 });
        assert_eq!(entry.encode(16), raw);
        assert_eq!(entry.host_range(16), Some((0x5_0000, 65536)));
    }

    #[test]
    fn test_l2_entry_compressed() {
        let entry = L2Entry::Compressed {
            offset: 0x3_0200,
            sectors: 3,
        };
        let raw = entry.encode(16);
        assert_eq!(raw, 0x3_0200 | (3 << 54) | COMPRESSED);
        assert_eq!(raw & COPIED, 0);
        assert_eq!(L2Entry::decode(raw, 16), entry);
        assert_eq!(entry.host_range(16), Some((0x3_0200, 1536)));
    }

    #[test]
    fn test_l2_entry_absent() {
        assert_eq!(L2Entry::decode(0, 16), L2Entry::Absent);
        assert_eq!(L2Entry::Absent.encode(16), 0);
        assert_eq!(L2Entry::Absent.host_range(16), None);
    }
}
