//! Shard catalog file.
//!
//! A small binary file recording which shard stores must be reopened on
//! restart, written at shutdown. This is a bootstrap hint, not an
//! authoritative consensus structure: the only integrity guard is the
//! magic number and version field. All fields are little-endian packed.
//!
//! Layout:
//! `u32 magic | u32 version | u32 count | count x u64 shard name |
//!  u32 error_len | error bytes`

use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};
use kestrel_common::error::SnapshotError;
use kestrel_common::name::Name;
use tracing::info;

pub const SHARD_CATALOG_MAGIC: u32 = 0x30510FDB;
pub const SHARD_CATALOG_VERSION: u32 = 1;

/// Parsed shard catalog contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardCatalog {
    pub shards: Vec<Name>,
    /// Last shutdown error, empty when the node stopped cleanly.
    pub error: String,
}

impl ShardCatalog {
    pub fn new(shards: Vec<Name>) -> Self {
        ShardCatalog { shards, error: String::new() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16 + self.shards.len() * 8 + self.error.len());
        buf.put_u32_le(SHARD_CATALOG_MAGIC);
        buf.put_u32_le(SHARD_CATALOG_VERSION);
        buf.put_u32_le(self.shards.len() as u32);
        for shard in &self.shards {
            buf.put_u64_le(shard.as_u64());
        }
        buf.put_u32_le(self.error.len() as u32);
        buf.put_slice(self.error.as_bytes());
        buf.to_vec()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, SnapshotError> {
        if data.remaining() < 4 {
            return Err(SnapshotError::Truncated);
        }
        let magic = data.get_u32_le();
        if magic != SHARD_CATALOG_MAGIC {
            return Err(SnapshotError::BadMagic { expected: SHARD_CATALOG_MAGIC, got: magic });
        }
        if data.remaining() < 4 {
            return Err(SnapshotError::Truncated);
        }
        let version = data.get_u32_le();
        if version != SHARD_CATALOG_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                expected: SHARD_CATALOG_VERSION,
                got: version,
            });
        }
        if data.remaining() < 4 {
            return Err(SnapshotError::Truncated);
        }
        let count = data.get_u32_le() as usize;
        if data.remaining() < count * 8 {
            return Err(SnapshotError::Truncated);
        }
        let mut shards = Vec::with_capacity(count);
        for _ in 0..count {
            shards.push(Name::new(data.get_u64_le()));
        }
        if data.remaining() < 4 {
            return Err(SnapshotError::Truncated);
        }
        let error_len = data.get_u32_le() as usize;
        if data.remaining() < error_len {
            return Err(SnapshotError::Truncated);
        }
        let error = String::from_utf8_lossy(&data[..error_len]).into_owned();
        Ok(ShardCatalog { shards, error })
    }
}

/// Write the catalog, replacing any existing file.
pub fn write_catalog(path: &Path, catalog: &ShardCatalog) -> Result<(), SnapshotError> {
    fs::write(path, catalog.encode())?;
    info!(path = %path.display(), shards = catalog.shards.len(), "shard catalog written");
    Ok(())
}

/// Read the catalog written by a previous shutdown.
pub fn read_catalog(path: &Path) -> Result<ShardCatalog, SnapshotError> {
    let data = fs::read(path)?;
    ShardCatalog::decode(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::name::name;

    #[test]
    fn test_round_trip() {
        let catalog = ShardCatalog {
            shards: vec![name("shard1"), name("shard2"), name("sub.shard1")],
            error: "unclean shutdown".to_string(),
        };
        let decoded = ShardCatalog::decode(&catalog.encode()).unwrap();
        assert_eq!(decoded, catalog);
    }

    #[test]
    fn test_empty_catalog_round_trip() {
        let catalog = ShardCatalog::default();
        let decoded = ShardCatalog::decode(&catalog.encode()).unwrap();
        assert!(decoded.shards.is_empty());
        assert!(decoded.error.is_empty());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut data = ShardCatalog::default().encode();
        data[0] ^= 0xFF;
        assert!(matches!(
            ShardCatalog::decode(&data),
            Err(SnapshotError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let mut data = ShardCatalog::default().encode();
        data[4] = 0xEE;
        assert!(matches!(
            ShardCatalog::decode(&data),
            Err(SnapshotError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let data = ShardCatalog::new(vec![name("shard1")]).encode();
        for cut in [0, 3, 7, 11, 14] {
            assert!(matches!(
                ShardCatalog::decode(&data[..cut]),
                Err(SnapshotError::Truncated)
            ));
        }
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shards.dat");
        let catalog = ShardCatalog::new(vec![name("shard1")]);
        write_catalog(&path, &catalog).unwrap();
        assert_eq!(read_catalog(&path).unwrap(), catalog);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.dat");
        assert!(matches!(read_catalog(&path), Err(SnapshotError::Io(_))));
    }

    #[test]
    fn test_magic_is_packed_little_endian() {
        let data = ShardCatalog::default().encode();
        assert_eq!(&data[..4], &[0xDB, 0x0F, 0x51, 0x30]);
    }
}
