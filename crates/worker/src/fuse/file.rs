//! File inodes.

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use libc::c_int;
use tracing::{error, warn};

/// Everything needed to register a file inode.
pub struct FileInit {
    /// Where the bytes live (or will live) in the blob cache.
    pub cache_path: PathBuf,
    pub mode: u32,
    pub size: u64,
    /// Bytes already in hand (server fetch, disk-cache hit). `None`
    /// defers materialization to the first `open`.
    pub data: Option<Vec<u8>>,
    /// Kernel entry/attr cache lifetime for this inode.
    pub ttl: Duration,
}

/// A file in the mounted tree. Bytes are materialized whole, at most
/// once, and retained for the life of the inode.
#[derive(Debug)]
pub struct FileNode {
    ino: u64,
    cache_path: PathBuf,
    mode: u32,
    size: u64,
    ttl: Duration,
    data: RwLock<Option<Vec<u8>>>,
}

impl FileNode {
    pub(super) fn new(ino: u64, init: FileInit) -> Self {
        Self {
            ino,
            cache_path: init.cache_path,
            mode: init.mode,
            size: init.size,
            ttl: init.ttl,
            data: RwLock::new(init.data),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Populate `data` from the blob cache if it is not already in
    /// memory. Double-checked so concurrent opens load the file once.
    pub fn open(&self) -> Result<(), c_int> {
        if self.data.read().expect("file data poisoned").is_some() {
            return Ok(());
        }
        let mut guard = self.data.write().expect("file data poisoned");
        if guard.is_some() {
            return Ok(());
        }
        match std::fs::read(&self.cache_path) {
            Ok(bytes) => {
                *guard = Some(bytes);
                Ok(())
            }
            Err(err) => {
                warn!(path = %self.cache_path.display(), %err, "failed to read cached blob");
                Err(libc::EIO)
            }
        }
    }

    /// Slice `data[offset .. offset + size]`, clamped to the data
    /// length. Offsets outside the file read as empty, not as errors.
    pub fn read(&self, offset: i64, size: u32) -> Result<Vec<u8>, c_int> {
        let guard = self.data.read().expect("file data poisoned");
        let Some(data) = guard.as_deref() else {
            error!(ino = self.ino, "read on file with no data");
            return Err(libc::EIO);
        };

        if offset < 0 {
            return Ok(Vec::new());
        }
        let start = offset as usize;
        if start >= data.len() {
            return Ok(Vec::new());
        }
        let end = (start + size as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    #[cfg(test)]
    pub(crate) fn data_len(&self) -> Option<usize> {
        self.data.read().unwrap().as_ref().map(|d| d.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn file_with_data(data: &[u8]) -> FileNode {
        FileNode::new(
            9,
            FileInit {
                cache_path: PathBuf::from("/nonexistent"),
                mode: 0o644,
                size: data.len() as u64,
                data: Some(data.to_vec()),
                ttl: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn read_slices_within_bounds() {
        let cases: &[(&[u8], i64, u32, &[u8])] = &[
            (b"hello world", 0, 5, b"hello"),
            (b"hello world", 6, 5, b"world"),
            (b"hello", 3, 10, b"lo"),
            (b"", 0, 5, b""),
            (b"hello", 10, 1, b""),
            (b"hello", -1, 1, b""),
        ];

        for (data, offset, size, expected) in cases {
            let file = file_with_data(data);
            let got = file.read(*offset, *size).unwrap();
            assert_eq!(&got, expected, "data={data:?} offset={offset} size={size}");
        }
    }

    #[test]
    fn read_without_data_is_eio() {
        let file = FileNode::new(
            9,
            FileInit {
                cache_path: PathBuf::from("/nonexistent"),
                mode: 0o644,
                size: 100,
                data: None,
                ttl: Duration::ZERO,
            },
        );
        assert_eq!(file.read(0, 10), Err(libc::EIO));
    }

    #[test]
    fn open_materializes_from_cache_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let blob = tmp.path().join("abc123");
        std::fs::write(&blob, b"cached bytes").unwrap();

        let file = FileNode::new(
            9,
            FileInit {
                cache_path: blob.clone(),
                mode: 0o644,
                size: 12,
                data: None,
                ttl: Duration::from_secs(60),
            },
        );

        file.open().unwrap();
        assert_eq!(file.read(0, 64).unwrap(), b"cached bytes");

        // A second open must not re-read: mutate the blob and observe
        // the in-memory copy win.
        std::fs::write(&blob, b"changed").unwrap();
        file.open().unwrap();
        assert_eq!(file.read(0, 64).unwrap(), b"cached bytes");
    }

    #[test]
    fn open_on_missing_blob_is_eio() {
        let file = FileNode::new(
            9,
            FileInit {
                cache_path: PathBuf::from("/definitely/not/here"),
                mode: 0o644,
                size: 1,
                data: None,
                ttl: Duration::from_secs(60),
            },
        );
        assert_eq!(file.open(), Err(libc::EIO));
    }

    #[test]
    fn concurrent_opens_populate_once() {
        use std::sync::Arc;

        let tmp = tempfile::TempDir::new().unwrap();
        let blob = tmp.path().join("abc123");
        std::fs::write(&blob, b"payload").unwrap();

        let file = Arc::new(FileNode::new(
            9,
            FileInit {
                cache_path: blob,
                mode: 0o644,
                size: 7,
                data: None,
                ttl: Duration::from_secs(60),
            },
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let file = file.clone();
                std::thread::spawn(move || file.open())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(file.data_len(), Some(7));
        assert_eq!(file.read(0, 64).unwrap(), b"payload");
    }
}
