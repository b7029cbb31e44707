#![no_main]
use libfuzzer_sys::fuzz_target;
use qcow2_rs::ImageReader;

// Arbitrary bytes as an image file: open and reads may fail, never panic
fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::TempDir::new() {
        Ok(d) => d,
        Err(_) => return,
    };
    let path = dir.path().join("fuzz.qcow2");
    if std::fs::write(&path, data).is_err() {
        return;
    }

    let mut reader = match ImageReader::open(&path) {
        Ok(r) => r,
        Err(_) => return,
    };

    let clusters = reader.cluster_count().min(64);
    for cluster in 0..clusters {
        let _ = reader.read_cluster(cluster);
    }
    let _ = reader.read_sector(0);
});
