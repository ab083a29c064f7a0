//! Blob storage for QR codes and relayed media.
//!
//! Stored blobs are addressed by a key and exposed through a public URL
//! (served by [`crate::web`] when the file server is enabled).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::platform::MediaInfo;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob io error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no such blob: {0}")]
    NotFound(String),
}

/// A published blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub url: String,
}

pub trait BlobStore: Send + Sync {
    fn add(&self, name: &str, ext: &str, bytes: &[u8]) -> Result<StoredBlob, BlobError>;
    fn remove(&self, blob: &StoredBlob) -> Result<(), BlobError>;
}

/// Keep keys to a single path component of harmless characters.
fn blob_key(name: &str, ext: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    };
    let ext = clean(ext);
    if ext.is_empty() { clean(name) } else { format!("{}.{ext}", clean(name)) }
}

fn join_url(base: &str, key: &str) -> String {
    format!("{}/{key}", base.trim_end_matches('/'))
}

/// File extension for an attachment: from its filename, else its MIME
/// type, else the content's magic bytes, else `bin`.
pub fn media_extension(media: &MediaInfo, bytes: &[u8]) -> String {
    if let Some(ext) = media
        .filename
        .as_deref()
        .and_then(|f| Path::new(f).extension())
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
    {
        return ext.to_ascii_lowercase();
    }
    if let Some(ext) = media.mime_type.as_deref().and_then(extension_for_mime) {
        return ext;
    }
    infer::get(bytes)
        .map(|kind| kind.extension())
        .unwrap_or("bin")
        .to_string()
}

/// Known extension for a MIME type. The subtype wins when it is itself a
/// known extension (`image/jpeg` → `jpeg`).
fn extension_for_mime(mime: &str) -> Option<String> {
    let essence = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
    let known = mime_guess::get_mime_extensions_str(&essence)?;
    let subtype = essence.split_once('/').map(|(_, sub)| sub).unwrap_or("");
    known
        .iter()
        .find(|ext| **ext == subtype)
        .or_else(|| known.first())
        .map(|ext| ext.to_string())
}

/// Blobs written to a directory served under `base_url`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self, BlobError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| BlobError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self {
            dir,
            base_url: base_url.into(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BlobStore for FsBlobStore {
    fn add(&self, name: &str, ext: &str, bytes: &[u8]) -> Result<StoredBlob, BlobError> {
        let key = blob_key(name, ext);
        std::fs::write(self.dir.join(&key), bytes).map_err(|source| BlobError::Io {
            key: key.clone(),
            source,
        })?;
        Ok(StoredBlob {
            url: join_url(&self.base_url, &key),
            key,
        })
    }

    fn remove(&self, blob: &StoredBlob) -> Result<(), BlobError> {
        match std::fs::remove_file(self.dir.join(&blob.key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(blob.key.clone()))
            }
            Err(source) => Err(BlobError::Io {
                key: blob.key.clone(),
                source,
            }),
        }
    }
}

/// In-process blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    base_url: String,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            blobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl BlobStore for MemoryBlobStore {
    fn add(&self, name: &str, ext: &str, bytes: &[u8]) -> Result<StoredBlob, BlobError> {
        let key = blob_key(name, ext);
        self.blobs.lock().unwrap().insert(key.clone(), bytes.to_vec());
        Ok(StoredBlob {
            url: join_url(&self.base_url, &key),
            key,
        })
    }

    fn remove(&self, blob: &StoredBlob) -> Result<(), BlobError> {
        self.blobs
            .lock()
            .unwrap()
            .remove(&blob.key)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(blob.key.clone()))
    }
}

/// Removes a blob when dropped.
pub struct BlobGuard {
    store: Arc<dyn BlobStore>,
    blob: StoredBlob,
}

impl BlobGuard {
    pub fn new(store: Arc<dyn BlobStore>, blob: StoredBlob) -> Self {
        Self { store, blob }
    }

    pub fn url(&self) -> &str {
        &self.blob.url
    }
}

impl Drop for BlobGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.remove(&self.blob) {
            tracing::warn!(key = %self.blob.key, "failed to remove blob: {e}");
        }
    }
}
