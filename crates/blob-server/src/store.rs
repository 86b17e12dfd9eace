//! On-disk blob store with derived in-memory indices.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{info, warn};

use lazyfs_common::Entry;

/// Errors that can occur while reading or writing blobs.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt blob {hash}: {source}")]
    Corrupt {
        hash: String,
        source: serde_json::Error,
    },
}

/// Indices over the blob directory, rebuilt on startup.
#[derive(Default)]
struct Index {
    /// canonical path -> content hash (the blob's filename)
    keydir: HashMap<String, String>,
    /// directory path -> hashes of the entries whose parent it is
    known_directories: HashMap<String, HashSet<String>>,
}

/// A content-addressed key/value store over one directory of
/// hash-named JSON files.
///
/// Both indices sit behind a single read-write lock; blob file I/O
/// happens after the hash has been copied out of the lock.
pub struct Store {
    dir: PathBuf,
    index: RwLock<Index>,
}

impl Store {
    /// Open a store rooted at `dir`, creating the directory if needed
    /// and reconstructing the indices from the blobs already there.
    ///
    /// Corrupt or unreadable blobs are logged and skipped; the store
    /// comes up with a partial index rather than refusing to start.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut index = Index::default();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut loaded = 0usize;
        while let Some(dirent) = entries.next_entry().await? {
            if !dirent.file_type().await?.is_file() {
                continue;
            }
            let hash = dirent.file_name().to_string_lossy().to_string();
            let raw = match tokio::fs::read(dirent.path()).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(%hash, %err, "skipping unreadable blob");
                    continue;
                }
            };
            let entry: Entry = match serde_json::from_slice(&raw) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%hash, %err, "skipping corrupt blob");
                    continue;
                }
            };
            index.insert(&entry, &hash);
            loaded += 1;
        }
        info!(count = loaded, dir = %dir.display(), "reconstructed blob index");

        Ok(Self {
            dir,
            index: RwLock::new(index),
        })
    }

    /// Store a batch of entries. Best-effort: an entry whose blob write
    /// fails is logged, skipped, and left out of the indices; the rest
    /// of the batch is stored and fully indexed.
    ///
    /// Returns the number stored. Errors only if nothing could be
    /// written at all for a non-empty batch.
    pub async fn upload(&self, entries: Vec<Entry>) -> Result<usize, StoreError> {
        let total = entries.len();
        let mut stored = 0usize;
        let mut first_err = None;

        for mut entry in entries {
            let hash = entry.content_hash();
            entry.hash_value = hash.clone();

            let encoded = match serde_json::to_vec(&entry) {
                Ok(encoded) => encoded,
                Err(err) => {
                    warn!(key = %entry.key, %err, "skipping unencodable entry");
                    continue;
                }
            };
            // Overwriting is idempotent: the hash names the content.
            if let Err(err) = tokio::fs::write(self.dir.join(&hash), encoded).await {
                warn!(key = %entry.key, %hash, %err, "failed to write blob");
                first_err.get_or_insert(err);
                continue;
            }

            let mut index = self.index.write().await;
            index.insert(&entry, &hash);
            stored += 1;
        }

        match first_err {
            Some(err) if stored == 0 && total > 0 => Err(err.into()),
            _ => Ok(stored),
        }
    }

    /// Fetch a single entry by its canonical path. `None` if the key is
    /// unknown.
    pub async fn fetch_entry(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let hash = {
            let index = self.index.read().await;
            match index.keydir.get(key) {
                Some(hash) => hash.clone(),
                None => return Ok(None),
            }
        };
        Ok(Some(self.read_blob(&hash).await?))
    }

    /// Fetch a directory listing: every entry whose parent is `path`,
    /// with `value` stripped. `None` if the directory is unknown.
    pub async fn fetch_dir(&self, path: &str) -> Result<Option<Vec<Entry>>, StoreError> {
        let key = path.trim_end_matches('/');
        let hashes = {
            let index = self.index.read().await;
            match index.known_directories.get(key) {
                Some(hashes) => hashes.iter().cloned().collect::<Vec<_>>(),
                None => return Ok(None),
            }
        };

        let mut listing = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let entry = self.read_blob(&hash).await?;
            listing.push(entry.without_value());
        }
        Ok(Some(listing))
    }

    /// The sync oracle: which of the client's keys the server lacks, or
    /// holds under a different hash.
    pub async fn need_upload(&self, offered: &[lazyfs_common::SyncEntry]) -> Vec<String> {
        let index = self.index.read().await;
        offered
            .iter()
            .filter(|sync| index.keydir.get(&sync.key) != Some(&sync.hash))
            .map(|sync| sync.key.clone())
            .collect()
    }

    /// Number of keys currently indexed.
    pub async fn len(&self) -> usize {
        self.index.read().await.keydir.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn read_blob(&self, hash: &str) -> Result<Entry, StoreError> {
        let raw = tokio::fs::read(self.dir.join(hash)).await?;
        let mut entry: Entry =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
                hash: hash.to_string(),
                source,
            })?;
        entry.hash_value = hash.to_string();
        Ok(entry)
    }
}

impl Index {
    fn insert(&mut self, entry: &Entry, hash: &str) {
        self.keydir.insert(entry.key.clone(), hash.to_string());
        if !entry.parent.is_empty() {
            self.known_directories
                .entry(entry.parent.clone())
                .or_default()
                .insert(hash.to_string());
        }
    }
}
