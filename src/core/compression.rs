//! Raw DEFLATE codec for compressed clusters
//!
//! **Format**:
//! - Headerless DEFLATE stream (no zlib or gzip framing), 15-bit window
//! - Compressed output is zero-padded up to a 512-byte sector boundary
//! - Decompression stops at the end of the stream or at `max_len` bytes,
//!   whichever comes first, so trailing sector padding is never interpreted

use crate::error::{Qcow2Error, Result};
use crate::layout::{sectors_for, SECTOR_SIZE};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// A compressed cluster payload ready to be laid out on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedCluster {
    /// DEFLATE stream followed by zero padding to a sector boundary
    pub data: Vec<u8>,

    /// Length of the DEFLATE stream without padding
    pub stream_len: usize,
}

impl CompressedCluster {
    /// Number of 512-byte sectors the payload occupies
    pub fn sectors(&self) -> u64 {
        sectors_for(self.stream_len)
    }
}

/// Compress one cluster with maximum compression
pub fn compress(data: &[u8]) -> Result<CompressedCluster> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len()), Compression::best());
    encoder.write_all(data)?;
    let mut out = encoder.finish()?;

    let stream_len = out.len();
    out.resize(stream_len.next_multiple_of(SECTOR_SIZE), 0);

    Ok(CompressedCluster {
        data: out,
        stream_len,
    })
}

/// Decompress a raw DEFLATE stream, producing at most `max_len` bytes
pub fn decompress(data: &[u8], max_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(max_len);
    DeflateDecoder::new(data)
        .take(max_len as u64)
        .read_to_end(&mut out)
        .map_err(|e| Qcow2Error::Decompression(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deflate_round_trip() {
        let data = b"QCOW2 compressed cluster test data! ".repeat(1900);
        let data = &data[..65536];

        let compressed = compress(data).unwrap();
        assert!(compressed.stream_len < data.len());

        let decompressed = decompress(&compressed.data, 65536).unwrap();
        assert_eq!(decompressed.as_slice(), data);
    }

    #[test]
    fn test_output_padded_to_sector() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 251) as u8).collect();
        let compressed = compress(&data).unwrap();

        assert_eq!(compressed.data.len() % SECTOR_SIZE, 0);
        assert!(compressed.data.len() >= compressed.stream_len);
        assert!(compressed.data.len() - compressed.stream_len < SECTOR_SIZE);
        assert!(compressed.data[compressed.stream_len..]
            .iter()
            .all(|&b| b == 0));
        assert_eq!(
            compressed.sectors(),
            (compressed.data.len() / SECTOR_SIZE) as u64
        );
    }

    #[test]
    fn test_zero_cluster_compresses_to_one_sector() {
        let compressed = compress(&[0u8; 65536]).unwrap();
        assert_eq!(compressed.sectors(), 1);
        assert_eq!(compressed.data.len(), SECTOR_SIZE);
    }

    #[test]
    fn test_decompress_bounded() {
        let data = vec![0xAB; 8192];
        let compressed = compress(&data).unwrap();

        let out = decompress(&compressed.data, 1000).unwrap();
        assert_eq!(out.len(), 1000);
        assert!(out.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_decompress_ignores_trailing_bytes() {
        let data = vec![7u8; 2048];
        let mut compressed = compress(&data).unwrap().data;
        compressed.extend_from_slice(&[0u8; 1024]);

        assert_eq!(decompress(&compressed, 2048).unwrap(), data);
    }

    #[test]
    fn test_corrupt_stream() {
        // BFINAL=1, BTYPE=11 is a reserved block type
        let garbage = [0xFFu8; 64];
        assert!(matches!(
            decompress(&garbage, 4096),
            Err(Qcow2Error::Decompression(_))
        ));
    }
}
