//! Positional disk I/O for image files
//!
//! Each [`ImageFile`] owns its handle and tracks the current file position
//! itself, so consecutive reads or writes skip the redundant seek.

use crate::error::{Qcow2Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Disk-backed image storage
#[derive(Debug)]
pub struct ImageFile {
    file: File,
    path: PathBuf,
    position: u64,
}

impl ImageFile {
    /// Open an existing image read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;

        Ok(ImageFile {
            file,
            path: path.as_ref().to_path_buf(),
            position: 0,
        })
    }

    /// Create (or truncate) an image for writing
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(ImageFile {
            file,
            path: path.as_ref().to_path_buf(),
            position: 0,
        })
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file position
    pub fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        if self.position != offset {
            self.file.seek(SeekFrom::Start(offset))?;
            self.position = offset;
        }
        Ok(())
    }

    /// Read exactly `len` bytes at the current position
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let start = self.position;
        let mut buffer = vec![0u8; len];
        let mut filled = 0;

        while filled < len {
            match self.file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.position = start + filled as u64;
                    return Err(e.into());
                }
            }
        }
        self.position = start + filled as u64;

        if filled != len {
            return Err(Qcow2Error::ShortRead {
                offset: start,
                expected: len,
                actual: filled,
            });
        }

        Ok(buffer)
    }

    /// Write all of `data` at the current position
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let start = self.position;
        let mut written = 0;

        while written < data.len() {
            match self.file.write(&data[written..]) {
                Ok(0) => {
                    self.position = start + written as u64;
                    return Err(Qcow2Error::ShortWrite {
                        offset: start,
                        expected: data.len(),
                        actual: written,
                    });
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.position = start + written as u64;
                    return Err(e.into());
                }
            }
        }
        self.position = start + written as u64;

        Ok(())
    }

    /// Read exactly `len` bytes at `offset`
    pub fn pread(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.seek(offset)?;
        self.read(len)
    }

    /// Write all of `data` at `offset`
    pub fn pwrite(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.seek(offset)?;
        self.write(data)
    }

    /// Read `count` big-endian `u64` values at `offset`
    pub fn read_be_u64s(&mut self, offset: u64, count: usize) -> Result<Vec<u64>> {
        let bytes = self.pread(offset, count * 8)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                u64::from_be_bytes(raw)
            })
            .collect())
    }

    /// Write `values` as big-endian `u64` at `offset`
    pub fn write_be_u64s(&mut self, offset: u64, values: &[u64]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.pwrite(offset, &bytes)
    }

    /// Write `values` as big-endian `u16` at `offset`
    pub fn write_be_u16s(&mut self, offset: u64, values: &[u16]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.pwrite(offset, &bytes)
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_and_read_at_offset() {
        let temp = NamedTempFile::new().unwrap();
        let mut file = ImageFile::create(temp.path()).unwrap();

        file.pwrite(4096, b"Hello").unwrap();
        assert_eq!(file.position(), 4101);

        let data = file.pread(4096, 5).unwrap();
        assert_eq!(&data, b"Hello");
        assert_eq!(file.position(), 4101);

        // Gap before the write reads back as zeros
        assert_eq!(file.pread(0, 16).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_sequential_writes_track_position() {
        let temp = NamedTempFile::new().unwrap();
        let mut file = ImageFile::create(temp.path()).unwrap();

        file.pwrite(512, b"abc").unwrap();
        file.write(b"def").unwrap();
        file.write(b"ghi").unwrap();
        assert_eq!(file.position(), 521);
        assert_eq!(file.pread(512, 9).unwrap(), b"abcdefghi");
    }

    #[test]
    fn test_short_read_past_end() {
        let temp = NamedTempFile::new().unwrap();
        let mut file = ImageFile::create(temp.path()).unwrap();
        file.pwrite(0, &[1u8; 100]).unwrap();

        match file.pread(90, 20) {
            Err(Qcow2Error::ShortRead {
                offset,
                expected,
                actual,
            }) => {
                assert_eq!(offset, 90);
                assert_eq!(expected, 20);
                assert_eq!(actual, 10);
            }
            other => panic!("expected ShortRead, got {:?}", other),
        }
    }

    #[test]
    fn test_big_endian_arrays() {
        let temp = NamedTempFile::new().unwrap();
        let mut file = ImageFile::create(temp.path()).unwrap();

        file.write_be_u64s(0, &[1, 0x0102_0304_0506_0708]).unwrap();
        file.write_be_u16s(16, &[1, 0xABCD]).unwrap();

        let raw = file.pread(0, 20).unwrap();
        assert_eq!(&raw[0..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&raw[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&raw[16..20], &[0, 1, 0xAB, 0xCD]);

        assert_eq!(
            file.read_be_u64s(0, 2).unwrap(),
            vec![1, 0x0102_0304_0506_0708]
        );
    }

    #[test]
    fn test_open_existing_read_only() {
        let temp = NamedTempFile::new().unwrap();
        {
            let mut file = ImageFile::create(temp.path()).unwrap();
            file.pwrite(0, b"QFI\xfb").unwrap();
            file.sync().unwrap();
        }

        let mut file = ImageFile::open(temp.path()).unwrap();
        assert_eq!(file.path(), temp.path());
        assert_eq!(file.pread(0, 4).unwrap(), b"QFI\xfb");
        assert!(file.pwrite(0, b"x").is_err());
    }
}
