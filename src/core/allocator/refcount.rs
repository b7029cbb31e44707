//! In-memory refcount ledger with bump allocation
//!
//! One 16-bit counter per physical cluster, indexed by cluster number.
//! Cluster 0 holds the header and is reserved when the ledger is created.

use tracing::trace;

#[derive(Debug, Clone)]
pub struct RefcountLedger {
    counts: Vec<u16>,
    cluster_bits: u32,
}

impl RefcountLedger {
    /// Create a ledger with cluster 0 (the header) already allocated
    pub fn new(cluster_bits: u32) -> Self {
        RefcountLedger {
            counts: vec![1],
            cluster_bits,
        }
    }

    /// Allocate the next physical cluster and return its byte offset
    pub fn alloc_cluster(&mut self) -> u64 {
        let offset = (self.counts.len() as u64) << self.cluster_bits;
        self.counts.push(1);
        trace!(offset, "allocated cluster");
        offset
    }

    /// Allocate `n` contiguous clusters and return the offset of the first
    pub fn alloc_clusters(&mut self, n: u64) -> u64 {
        let offset = self.allocated_bytes();
        for _ in 0..n {
            self.alloc_cluster();
        }
        offset
    }

    /// Add a reference to the most recently allocated cluster
    pub fn bump_last(&mut self) {
        if let Some(last) = self.counts.last_mut() {
            *last = last.saturating_add(1);
        }
    }

    /// Number of allocated clusters
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Bytes covered by allocated clusters
    pub fn allocated_bytes(&self) -> u64 {
        (self.counts.len() as u64) << self.cluster_bits
    }

    /// Refcount of physical cluster `index`, zero if never allocated
    pub fn count(&self, index: u64) -> u16 {
        self.counts.get(index as usize).copied().unwrap_or(0)
    }

    /// Counters `[start, start + entries)` clipped to the ledger length
    pub fn block(&self, start: usize, entries: usize) -> &[u16] {
        let start = start.min(self.counts.len());
        let end = start.saturating_add(entries).min(self.counts.len());
        &self.counts[start..end]
    }

    /// Refcount blocks needed if `extra` more clusters are allocated
    /// before the blocks themselves.
    ///
    /// Blocks describe their own clusters too, so this solves
    /// `blocks = ceil((len + extra + blocks) / entries_per_block)`.
    pub fn blocks_needed(&self, extra: u64) -> u64 {
        let per_block = 1u64 << (self.cluster_bits - 1);
        let base = self.counts.len() as u64 + extra;
        let mut blocks = base.div_ceil(per_block);
        while (base + blocks).div_ceil(per_block) > blocks {
            blocks += 1;
        }
        blocks
    }
}
