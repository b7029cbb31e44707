#![no_main]
use libfuzzer_sys::fuzz_target;
use qcow2_rs::Header;

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must survive an encode/decode cycle unchanged
    if let Ok(header) = Header::decode(data) {
        let encoded = header.encode();
        assert_eq!(Header::decode(&encoded).ok(), Some(header));
    }
});
