use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{DbError, Result};
use crate::model::{Document, Record};

/// Opaque snapshot storage. `load` returns `None` when nothing was saved yet.
pub trait BlobStore: Send + Sync {
    fn load(&self) -> Result<Option<Vec<u8>>>;
    fn save(&self, bytes: &[u8]) -> Result<()>;
}

/// Snapshot blob on the local filesystem.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    pub file_path: PathBuf,
}

impl FileBlobStore {
    pub fn new(path: &Path) -> Self {
        Self { file_path: path.to_path_buf() }
    }
}

impl BlobStore for FileBlobStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.file_path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // Readers only ever see a complete snapshot file
        let tmp_path = self.file_path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.file_path)?;
        Ok(())
    }
}

/// In-process blob, used by tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.blob.lock().map_err(|_| DbError::Poisoned("memory blob"))?.clone())
    }

    fn save(&self, bytes: &[u8]) -> Result<()> {
        *self.blob.lock().map_err(|_| DbError::Poisoned("memory blob"))? = Some(bytes.to_vec());
        Ok(())
    }
}

/// Archived form of a record. The document travels as JSON text.
#[derive(Archive, Deserialize, Serialize, Debug, PartialEq)]
#[archive(check_bytes)]
struct StoredRecord {
    id: u64,
    name: String,
    doc: String,
    expired_id: u64,
}

/// Encodes records for the snapshot blob. Creating transaction ids are not
/// stored, so every loaded record comes back with `created_id == 0`.
pub fn encode_snapshot(records: &[Record]) -> Result<Vec<u8>> {
    let stored = records
        .iter()
        .map(|r| {
            Ok(StoredRecord {
                id: r.id,
                name: r.name.clone(),
                doc: serde_json::to_string(&r.doc)?,
                expired_id: r.expired_id,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let bytes = rkyv::to_bytes::<_, 4096>(&stored)
        .map_err(|e| DbError::Persistence(format!("snapshot encode failed: {:?}", e)))?;
    Ok(bytes.into_vec())
}

/// Validates and decodes a snapshot blob.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<Record>> {
    let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    let archived = rkyv::check_archived_root::<Vec<StoredRecord>>(&aligned)
        .map_err(|e| DbError::Persistence(format!("corrupt snapshot: {:?}", e)))?;
    let stored: Vec<StoredRecord> = archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|e| DbError::Persistence(format!("snapshot decode failed: {:?}", e)))?;

    stored
        .into_iter()
        .map(|s| {
            let doc: Document = serde_json::from_str(&s.doc)?;
            Ok(Record {
                id: s.id,
                name: s.name,
                doc,
                created_id: 0,
                expired_id: s.expired_id,
            })
        })
        .collect()
}
