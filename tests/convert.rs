//! Flattening images with `convert`

use qcow2_rs::{convert, ImageReader, ImageWriter, WriteMode, WriterConfig};
use std::path::Path;
use tempfile::TempDir;

const SIZE: u64 = 2 << 20;

fn cluster(byte: u8, size: usize) -> Vec<u8> {
    (0..size).map(|i| byte.wrapping_add((i / 100) as u8)).collect()
}

fn make_chain(dir: &Path) -> std::path::PathBuf {
    let config = WriterConfig::new().cluster_bits(12);
    let base = dir.join("base.qcow2");
    let mut writer = ImageWriter::create_with_config(&base, SIZE, &config).unwrap();
    writer.write_cluster(0, &cluster(1, 4096)).unwrap();
    writer.write_cluster(9, &cluster(2, 4096)).unwrap();
    writer.close().unwrap();

    let child = dir.join("child.qcow2");
    let mut writer =
        ImageWriter::create_with_config(&child, SIZE, &config.backing_file("base.qcow2")).unwrap();
    writer.write_cluster(9, &cluster(3, 4096)).unwrap();
    writer.write_cluster(300, &cluster(4, 4096)).unwrap();
    writer.close().unwrap();
    child
}

#[test]
fn test_convert_flattens_chain() {
    let dir = TempDir::new().unwrap();
    let child = make_chain(dir.path());
    let flat = dir.path().join("flat.qcow2");

    let config = WriterConfig::new().cluster_bits(12).compressed();
    let summary = convert(&child, &flat, &config).unwrap();
    assert_eq!(summary.clusters, 512);
    assert_eq!(summary.clusters_written, 3);

    let mut reader = ImageReader::open(&flat).unwrap();
    assert!(reader.backing().is_none());
    assert_eq!(reader.read_cluster(0).unwrap(), Some(cluster(1, 4096).as_slice()));
    assert_eq!(reader.read_cluster(9).unwrap(), Some(cluster(3, 4096).as_slice()));
    assert_eq!(reader.read_cluster(300).unwrap(), Some(cluster(4, 4096).as_slice()));
    assert_eq!(reader.read_cluster(1).unwrap(), None);
}

#[test]
fn test_convert_changes_cluster_size() {
    let dir = TempDir::new().unwrap();
    let child = make_chain(dir.path());
    let flat = dir.path().join("flat64k.qcow2");

    let config = WriterConfig::new().cluster_bits(16);
    assert_eq!(config.mode, WriteMode::Uncompressed);
    let summary = convert(&child, &flat, &config).unwrap();
    // 4 KiB clusters 0 and 9 land in 64 KiB cluster 0, 300 in cluster 18
    assert_eq!(summary.clusters, 32);
    assert_eq!(summary.clusters_written, 2);

    let mut source = ImageReader::open(&child).unwrap();
    let mut target = ImageReader::open(&flat).unwrap();
    assert_eq!(target.cluster_size(), 65536);
    for sector in 0..source.sector_count() {
        let expected = source.read_sector(sector).unwrap().map(|s| s.to_vec());
        assert_eq!(
            target.read_sector(sector).unwrap(),
            expected.as_deref(),
            "sector {}",
            sector
        );
    }
}
