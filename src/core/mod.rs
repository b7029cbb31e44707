//! QCOW2 image engine
//!
//! - [`error`] - Error types
//! - [`header`] - Fixed 104-byte version 3 header and the supported profile
//! - [`layout`] - Cluster addressing and L1/L2 entry encoding
//! - [`compression`] - Raw DEFLATE codec for compressed clusters
//! - [`io`] - Positional file I/O with big-endian table helpers
//! - [`allocator`] - Bump allocation and the refcount ledger
//! - [`config`] - Writer configuration
//! - [`reader`] - Image reader with backing chain resolution
//! - [`writer`] - Image writer

pub mod allocator;
pub mod compression;
pub mod config;
pub mod error;
pub mod header;
pub mod io;
pub mod layout;
pub mod reader;
pub mod writer;

pub use config::{WriteMode, WriterConfig};
pub use error::{FormatError, Qcow2Error, Result};
pub use header::{Header, SupportedProfile, SUPPORTED_PROFILE};
pub use reader::ImageReader;
pub use writer::ImageWriter;
