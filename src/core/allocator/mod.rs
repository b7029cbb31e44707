//! Cluster allocation for image writers
//!
//! Allocation is a bump pointer over physical clusters: the next cluster
//! handed out is always the one just past the last allocated cluster, and
//! nothing is ever freed. The refcount ledger doubles as the allocation
//! state, since its length is the number of allocated clusters.

pub mod refcount;

pub use refcount::RefcountLedger;
