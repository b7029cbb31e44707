use std::path::PathBuf;
use thiserror::Error;

/// Header problems detected while decoding the fixed-layout header.
///
/// Every variant is fatal: an image that does not match the supported
/// profile is rejected outright instead of being partially interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Header truncated: got {len} bytes, need {expected}")]
    Truncated { len: usize, expected: usize },

    #[error("Invalid magic number in header: {0:#010x}")]
    BadMagic(u32),

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Unsupported feature: {field} = {value:#x}")]
    UnsupportedFeature { field: &'static str, value: u64 },

    #[error("Header field {field} is {found}, only {expected} is supported")]
    ProfileMismatch {
        field: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("Invalid image geometry: {0}")]
    InvalidGeometry(String),
}

#[derive(Error, Debug)]
pub enum Qcow2Error {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Backing file {path:?} has {field} {found}, expected {expected}")]
    BackingMismatch {
        path: PathBuf,
        field: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("Backing chain loops back to {0:?}")]
    BackingCycle(PathBuf),

    #[error("Short read at offset {offset}: got {actual} of {expected} bytes")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Short write at offset {offset}: wrote {actual} of {expected} bytes")]
    ShortWrite {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Sequential write violation at cluster {cluster}: {reason}")]
    SequentialViolation { cluster: u64, reason: &'static str },

    #[error("Cluster {cluster} out of range (image has {clusters} clusters)")]
    ClusterOutOfRange { cluster: u64, clusters: u64 },

    #[error("Cluster payload must be exactly {expected} bytes, got {actual}")]
    PayloadSize { expected: usize, actual: usize },

    #[error("Compressed cluster {cluster} needs {sectors} sectors, descriptor holds at most {max_sectors}")]
    CompressedOverflow {
        cluster: u64,
        sectors: u64,
        max_sectors: u64,
    },

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Qcow2Error>;
