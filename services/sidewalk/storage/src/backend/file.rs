//! File-based storage backend: one checksummed file per record

use crate::{KvStore, RecordKey, StorageError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use dashmap::DashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const RECORD_EXT: &str = "rec";

/// Configuration for the file store
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Base data directory
    pub data_dir: PathBuf,
    /// Fsync after every write
    pub fsync: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./sidewalkdata"),
            fsync: true,
        }
    }
}

/// Record header
#[derive(Debug)]
struct RecordHeader {
    len: u32,    // Value length (not including header)
    crc32c: u32, // CRC32 over name || value
}

impl RecordHeader {
    const SIZE: usize = 4 + 4;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.crc32c);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, StorageError> {
        if buf.remaining() < Self::SIZE {
            return Err(StorageError::Corruption(
                "Incomplete record header".to_string(),
            ));
        }

        Ok(Self {
            len: buf.get_u32_le(),
            crc32c: buf.get_u32_le(),
        })
    }

    fn compute_crc(name: &str, value: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(name.as_bytes());
        hasher.update(value);
        hasher.finalize()
    }
}

/// File-backed record store with a read cache
#[derive(Debug)]
pub struct FileStore {
    config: FileStoreConfig,
    cache: DashMap<String, Vec<u8>>,
}

impl FileStore {
    /// Open (or create) a store in `config.data_dir`, loading existing records
    pub fn open(config: FileStoreConfig) -> Result<Self, StorageError> {
        // Ensure data directory exists
        fs::create_dir_all(&config.data_dir)?;

        let store = Self {
            config,
            cache: DashMap::new(),
        };
        store.load_records()?;

        info!(
            "Opened record store at {:?} with {} records",
            store.config.data_dir,
            store.cache.len()
        );
        Ok(store)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.config.data_dir.join(format!("{}.{}", name, RECORD_EXT))
    }

    fn load_records(&self) -> Result<(), StorageError> {
        for entry in fs::read_dir(&self.config.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            match Self::read_record(&path, &name) {
                Ok(value) => {
                    debug!("Loaded record {} ({} bytes)", name, value.len());
                    self.cache.insert(name, value);
                }
                Err(e) => {
                    warn!("Skipping record {:?}: {}", path, e);
                }
            }
        }

        Ok(())
    }

    fn read_record(path: &Path, name: &str) -> Result<Vec<u8>, StorageError> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut bytes = Bytes::from(buf);
        let header = RecordHeader::decode(&mut bytes)?;
        if bytes.remaining() != header.len as usize {
            return Err(StorageError::Corruption(format!(
                "record {} length {} but {} bytes present",
                name,
                header.len,
                bytes.remaining()
            )));
        }

        let expected_crc = RecordHeader::compute_crc(name, &bytes);
        if header.crc32c != expected_crc {
            error!("CRC mismatch in record {:?}", path);
            return Err(StorageError::Corruption(format!(
                "CRC mismatch for record {}",
                name
            )));
        }

        Ok(bytes.to_vec())
    }

    fn write_record(&self, name: &str, value: &[u8]) -> Result<(), StorageError> {
        let header = RecordHeader {
            len: value.len() as u32,
            crc32c: RecordHeader::compute_crc(name, value),
        };
        let mut buf = BytesMut::with_capacity(RecordHeader::SIZE + value.len());
        header.encode(&mut buf);
        buf.put_slice(value);

        // Write aside, then rename over the old record
        let tmp = self.config.data_dir.join(format!("{}.tmp", name));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        if self.config.fsync {
            file.sync_all()?;
        }
        fs::rename(&tmp, self.record_path(name))?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn put(&self, key: &RecordKey, value: &[u8]) -> Result<(), StorageError> {
        let name = key.name();
        self.write_record(&name, value)?;
        self.cache.insert(name, value.to_vec());
        Ok(())
    }

    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.cache.get(&key.name()).map(|v| v.value().clone()))
    }

    fn delete(&self, key: &RecordKey) -> Result<(), StorageError> {
        let name = key.name();
        self.cache.remove(&name);
        match fs::remove_file(self.record_path(&name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&self) -> Result<(), StorageError> {
        if self.config.fsync {
            File::open(&self.config.data_dir)?.sync_all()?;
        }
        Ok(())
    }
}
