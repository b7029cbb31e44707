use crate::error::FormatError;

/// `QFI\xfb`
pub const MAGIC: u32 = 0x5146_49fb;
pub const VERSION: u32 = 3;

/// Size of the fixed big-endian header in bytes.
pub const HEADER_LENGTH: usize = 104;

/// log2 of the refcount width; 4 means 16-bit counters.
pub const REFCOUNT_ORDER: u32 = 4;

pub const MIN_CLUSTER_BITS: u32 = 9;
pub const MAX_CLUSTER_BITS: u32 = 21;

/// The single header profile this engine reads and writes.
///
/// Every field here is compared verbatim during [`Header::decode`]; images
/// that deviate in any of them are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedProfile {
    pub magic: u32,
    pub version: u32,
    pub crypt_method: u32,
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub refcount_order: u32,
    pub header_length: u32,
}

pub const SUPPORTED_PROFILE: SupportedProfile = SupportedProfile {
    magic: MAGIC,
    version: VERSION,
    crypt_method: 0,
    nb_snapshots: 0,
    snapshots_offset: 0,
    incompatible_features: 0,
    compatible_features: 0,
    autoclear_features: 0,
    refcount_order: REFCOUNT_ORDER,
    header_length: HEADER_LENGTH as u32,
};

/// QCOW2 version 3 header (start of cluster 0)
///
/// ```text
///   0  magic                    u32
///   4  version                  u32
///   8  backing_file_offset      u64
///  16  backing_file_size        u32
///  20  cluster_bits             u32
///  24  size                     u64
///  32  crypt_method             u32
///  36  l1_size                  u32
///  40  l1_table_offset          u64
///  48  refcount_table_offset    u64
///  56  refcount_table_clusters  u32
///  60  nb_snapshots             u32
///  64  snapshots_offset         u64
///  72  incompatible_features    u64
///  80  compatible_features      u64
///  88  autoclear_features       u64
///  96  refcount_order           u32
/// 100  header_length            u32
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u32,
    pub version: u32,

    /// Byte range of the backing file path; `0`/`0` when there is none
    pub backing_file_offset: u64,
    pub backing_file_size: u32,

    /// log2 of the cluster size
    pub cluster_bits: u32,

    /// Virtual disk size in bytes
    pub size: u64,

    pub crypt_method: u32,

    /// Number of entries in the L1 table
    pub l1_size: u32,
    pub l1_table_offset: u64,

    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,

    pub nb_snapshots: u32,
    pub snapshots_offset: u64,

    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,

    pub refcount_order: u32,
    pub header_length: u32,
}

impl Header {
    /// Create a header carrying the supported profile and the given geometry.
    ///
    /// Table offsets and sizes are left at zero for the writer to fill in.
    pub fn new(size: u64, cluster_bits: u32) -> Self {
        let p = SUPPORTED_PROFILE;
        Header {
            magic: p.magic,
            version: p.version,
            backing_file_offset: 0,
            backing_file_size: 0,
            cluster_bits,
            size,
            crypt_method: p.crypt_method,
            l1_size: 0,
            l1_table_offset: 0,
            refcount_table_offset: 0,
            refcount_table_clusters: 0,
            nb_snapshots: p.nb_snapshots,
            snapshots_offset: p.snapshots_offset,
            incompatible_features: p.incompatible_features,
            compatible_features: p.compatible_features,
            autoclear_features: p.autoclear_features,
            refcount_order: p.refcount_order,
            header_length: p.header_length,
        }
    }

    pub fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    pub fn has_backing_file(&self) -> bool {
        self.backing_file_size != 0
    }

    /// Check every constant field against [`SUPPORTED_PROFILE`]
    pub fn validate(&self) -> Result<(), FormatError> {
        let p = SUPPORTED_PROFILE;

        if self.magic != p.magic {
            return Err(FormatError::BadMagic(self.magic));
        }
        if self.version != p.version {
            return Err(FormatError::UnsupportedVersion(self.version));
        }

        let features: [(&'static str, u64, u64); 6] = [
            ("crypt_method", self.crypt_method.into(), p.crypt_method.into()),
            ("nb_snapshots", self.nb_snapshots.into(), p.nb_snapshots.into()),
            ("snapshots_offset", self.snapshots_offset, p.snapshots_offset),
            (
                "incompatible_features",
                self.incompatible_features,
                p.incompatible_features,
            ),
            (
                "compatible_features",
                self.compatible_features,
                p.compatible_features,
            ),
            (
                "autoclear_features",
                self.autoclear_features,
                p.autoclear_features,
            ),
        ];
        for (field, value, supported) in features {
            if value != supported {
                return Err(FormatError::UnsupportedFeature { field, value });
            }
        }

        if self.refcount_order != p.refcount_order {
            return Err(FormatError::ProfileMismatch {
                field: "refcount_order",
                expected: p.refcount_order.into(),
                found: self.refcount_order.into(),
            });
        }
        if self.header_length != p.header_length {
            return Err(FormatError::ProfileMismatch {
                field: "header_length",
                expected: p.header_length.into(),
                found: self.header_length.into(),
            });
        }

        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(FormatError::InvalidGeometry(format!(
                "cluster_bits {} outside {}..={}",
                self.cluster_bits, MIN_CLUSTER_BITS, MAX_CLUSTER_BITS
            )));
        }

        Ok(())
    }

    /// Serialize to the fixed big-endian layout
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut bytes = [0u8; HEADER_LENGTH];
        let mut w = FieldWriter::new(&mut bytes);

        w.u32(self.magic);
        w.u32(self.version);
        w.u64(self.backing_file_offset);
        w.u32(self.backing_file_size);
        w.u32(self.cluster_bits);
        w.u64(self.size);
        w.u32(self.crypt_method);
        w.u32(self.l1_size);
        w.u64(self.l1_table_offset);
        w.u64(self.refcount_table_offset);
        w.u32(self.refcount_table_clusters);
        w.u32(self.nb_snapshots);
        w.u64(self.snapshots_offset);
        w.u64(self.incompatible_features);
        w.u64(self.compatible_features);
        w.u64(self.autoclear_features);
        w.u32(self.refcount_order);
        w.u32(self.header_length);

        debug_assert_eq!(w.pos, HEADER_LENGTH);
        bytes
    }

    /// Deserialize and validate a header.
    ///
    /// Extra trailing bytes (the rest of cluster 0) are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(FormatError::Truncated {
                len: bytes.len(),
                expected: HEADER_LENGTH,
            });
        }

        let mut r = FieldReader::new(&bytes[..HEADER_LENGTH]);
        let header = Header {
            magic: r.u32(),
            version: r.u32(),
            backing_file_offset: r.u64(),
            backing_file_size: r.u32(),
            cluster_bits: r.u32(),
            size: r.u64(),
            crypt_method: r.u32(),
            l1_size: r.u32(),
            l1_table_offset: r.u64(),
            refcount_table_offset: r.u64(),
            refcount_table_clusters: r.u32(),
            nb_snapshots: r.u32(),
            snapshots_offset: r.u64(),
            incompatible_features: r.u64(),
            compatible_features: r.u64(),
            autoclear_features: r.u64(),
            refcount_order: r.u32(),
            header_length: r.u32(),
        };

        header.validate()?;
        Ok(header)
    }
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        FieldReader { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take())
    }
}

struct FieldWriter<'a> {
    bytes: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    fn new(bytes: &'a mut [u8]) -> Self {
        FieldWriter { bytes, pos: 0 }
    }

    fn put(&mut self, field: &[u8]) {
        self.bytes[self.pos..self.pos + field.len()].copy_from_slice(field);
        self.pos += field.len();
    }

    fn u32(&mut self, value: u32) {
        self.put(&value.to_be_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.put(&value.to_be_bytes());
    }
}
