//! Directory inodes and the lookup/readdir machinery.
//!
//! A lookup walks a short-circuited pipeline: name filters, the
//! process-wide not-found set, the in-memory child map, the per-path
//! key index backed by the on-disk blob cache, and finally the blob
//! server. Readdir merges the in-memory children with the server's
//! listing, registering anything it has not seen before.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use libc::c_int;
use tracing::warn;

use crate::client::FetchError;
use crate::script::{is_ignored, is_script};

use super::file::{FileInit, FileNode};
use super::fs::{join_path, FsCore, Node};
use super::ENTRY_TTL;

/// Positive metadata cached per child path: enough to rebuild a file
/// inode from the blob cache without asking the server.
#[derive(Debug, Clone)]
pub struct CachedMeta {
    pub hash: String,
    pub mode: u32,
    pub size: u64,
}

#[derive(Default, Debug)]
pub(super) struct DirInner {
    /// Subdirectories already materialized, by name.
    pub children: HashMap<String, Arc<Directory>>,
    /// File inodes registered under this directory, by name.
    pub files: HashMap<String, Arc<FileNode>>,
    /// Child path -> cached file metadata. Strictly positive: a failed
    /// disk read never removes an entry, and negative results live in
    /// the filesystem-wide not-found set instead.
    pub key_dir: HashMap<String, CachedMeta>,
}

/// A directory in the mounted tree.
#[derive(Debug)]
pub struct Directory {
    ino: u64,
    path: String,
    pub(super) inner: RwLock<DirInner>,
}

impl Directory {
    pub(super) fn new(ino: u64, path: String) -> Self {
        Self {
            ino,
            path,
            inner: RwLock::new(DirInner::default()),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// One row of a readdir reply.
#[derive(Debug, Clone)]
pub struct DirEntryItem {
    pub ino: u64,
    pub name: String,
    pub is_dir: bool,
}

impl FsCore {
    /// Resolve `name` under `parent`. Returns the child node and the
    /// kernel cache lifetime to reply with.
    pub fn lookup(&self, parent: &Arc<Directory>, name: &str) -> Result<(Node, Duration), c_int> {
        if is_ignored(name) {
            return Err(libc::ENOENT);
        }

        let path = join_path(parent.path(), name);

        // The user's script is the one mutable input to a run: skip
        // every cache, fetch fresh, and keep the kernel from caching
        // the reply.
        if is_script(name) {
            return self.fetch_script(parent, &path, name);
        }

        if self.is_not_found(&path) {
            return Err(libc::ENOENT);
        }

        // Memory tier. An eagerly registered directory wins over any
        // same-named server entry.
        let child = {
            let inner = parent.inner.read().expect("directory poisoned");
            inner.children.get(name).cloned()
        };
        if let Some(child) = child {
            self.stats.record_memory_hit();
            return Ok((Node::Dir(child), ENTRY_TTL));
        }

        // Disk tier.
        let cached = {
            let inner = parent.inner.read().expect("directory poisoned");
            inner.key_dir.get(&path).cloned()
        };
        if let Some(meta) = cached {
            match std::fs::read(self.cache_dir.join(&meta.hash)) {
                Ok(bytes) => {
                    self.stats.record_disk_hit();
                    let node = self.register_file_child(
                        parent,
                        name,
                        &path,
                        FileInit {
                            cache_path: self.cache_dir.join(&meta.hash),
                            mode: meta.mode,
                            size: meta.size,
                            data: Some(bytes),
                            ttl: ENTRY_TTL,
                        },
                        Some(meta),
                        false,
                    );
                    return Ok((Node::File(node), ENTRY_TTL));
                }
                // Cache blob evicted or never written; the key index
                // stays and the server supplies the bytes.
                Err(_) => {}
            }
        }

        // Server tier.
        let entry = match self.rt.block_on(self.client.fetch_entry(&path)) {
            Ok(entry) => entry,
            Err(FetchError::NotFound) => {
                self.add_not_found(path);
                return Err(libc::ENOENT);
            }
            Err(err) => {
                warn!(%path, %err, "blob server fetch failed");
                return Err(libc::EIO);
            }
        };
        self.stats.record_server_fetch();

        if entry.is_dir {
            let child = self.register_dir_child(parent, name);
            return Ok((Node::Dir(child), ENTRY_TTL));
        }

        let size = entry.size.max(0) as u64;
        let meta = CachedMeta {
            hash: entry.hash_value.clone(),
            mode: entry.mode,
            size,
        };
        let node = self.register_file_child(
            parent,
            name,
            &path,
            FileInit {
                cache_path: self.cache_dir.join(&entry.hash_value),
                mode: entry.mode,
                size,
                data: Some(entry.value.clone()),
                ttl: ENTRY_TTL,
            },
            Some(meta),
            false,
        );

        // Persist outside the lock; the content-addressed name makes a
        // concurrent duplicate write harmless.
        if !entry.hash_value.is_empty() {
            if let Err(err) = std::fs::write(self.cache_dir.join(&entry.hash_value), &entry.value)
            {
                warn!(hash = %entry.hash_value, %err, "failed to write blob cache");
            }
        }

        Ok((Node::File(node), ENTRY_TTL))
    }

    fn fetch_script(
        &self,
        parent: &Arc<Directory>,
        path: &str,
        name: &str,
    ) -> Result<(Node, Duration), c_int> {
        let entry = match self.rt.block_on(self.client.fetch_entry(path)) {
            Ok(entry) => entry,
            // No negative caching either: the next run may upload it.
            Err(FetchError::NotFound) => return Err(libc::ENOENT),
            Err(err) => {
                warn!(%path, %err, "script fetch failed");
                return Err(libc::EIO);
            }
        };
        self.stats.record_server_fetch();

        let size = entry.size.max(0) as u64;
        let node = self.register_file_child(
            parent,
            name,
            path,
            FileInit {
                cache_path: self.cache_dir.join(&entry.hash_value),
                mode: entry.mode,
                size,
                data: Some(entry.value),
                ttl: Duration::ZERO,
            },
            None,
            true,
        );
        Ok((Node::File(node), Duration::ZERO))
    }

    /// List `dir`: the union of in-memory children and the server's
    /// listing, deduplicated by name. A server failure degrades to the
    /// memory view.
    pub fn readdir(&self, dir: &Arc<Directory>) -> Vec<DirEntryItem> {
        let listing = self.rt.block_on(self.client.fetch_listing(dir.path()));

        let mut inner = dir.inner.write().expect("directory poisoned");

        let mut out: Vec<DirEntryItem> = inner
            .children
            .iter()
            .map(|(name, child)| DirEntryItem {
                ino: child.ino(),
                name: name.clone(),
                is_dir: true,
            })
            .collect();
        let mut seen: std::collections::HashSet<String> =
            out.iter().map(|item| item.name.clone()).collect();

        let entries = match listing {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = dir.path(), %err, "directory listing failed, serving memory view");
                return out;
            }
        };

        for entry in entries {
            if entry.name.is_empty() || !seen.insert(entry.name.clone()) {
                continue;
            }
            if entry.is_dir {
                let child = self.ensure_dir_child_locked(&mut inner, dir.path(), &entry.name);
                out.push(DirEntryItem {
                    ino: child.ino(),
                    name: entry.name,
                    is_dir: true,
                });
            } else {
                let path = join_path(dir.path(), &entry.name);
                let size = entry.size.max(0) as u64;
                let node = self.ensure_file_child_locked(
                    &mut inner,
                    &entry.name,
                    &path,
                    FileInit {
                        cache_path: self.cache_dir.join(&entry.hash_value),
                        mode: entry.mode,
                        size,
                        // The listing carries metadata, not bytes;
                        // open materializes from the blob cache.
                        data: None,
                        ttl: ENTRY_TTL,
                    },
                    Some(CachedMeta {
                        hash: entry.hash_value.clone(),
                        mode: entry.mode,
                        size,
                    }),
                    false,
                );
                out.push(DirEntryItem {
                    ino: node.ino(),
                    name: entry.name,
                    is_dir: false,
                });
            }
        }

        out
    }

    /// Get-or-create a subdirectory child under the parent's write
    /// lock.
    pub(super) fn register_dir_child(
        &self,
        parent: &Arc<Directory>,
        name: &str,
    ) -> Arc<Directory> {
        let mut inner = parent.inner.write().expect("directory poisoned");
        self.ensure_dir_child_locked(&mut inner, parent.path(), name)
    }

    fn register_file_child(
        &self,
        parent: &Arc<Directory>,
        name: &str,
        path: &str,
        init: FileInit,
        key_meta: Option<CachedMeta>,
        overwrite: bool,
    ) -> Arc<FileNode> {
        let mut inner = parent.inner.write().expect("directory poisoned");
        self.ensure_file_child_locked(&mut inner, name, path, init, key_meta, overwrite)
    }

    fn ensure_dir_child_locked(
        &self,
        inner: &mut DirInner,
        parent_path: &str,
        name: &str,
    ) -> Arc<Directory> {
        if let Some(existing) = inner.children.get(name) {
            return existing.clone();
        }
        let child = {
            let mut nodes = self.nodes.write().expect("node table poisoned");
            let ino = nodes.allocate();
            let child = Arc::new(Directory::new(ino, join_path(parent_path, name)));
            nodes.register(ino, Node::Dir(child.clone()));
            child
        };
        inner.children.insert(name.to_string(), child.clone());
        child
    }

    fn ensure_file_child_locked(
        &self,
        inner: &mut DirInner,
        name: &str,
        path: &str,
        init: FileInit,
        key_meta: Option<CachedMeta>,
        overwrite: bool,
    ) -> Arc<FileNode> {
        if !overwrite {
            if let Some(existing) = inner.files.get(name) {
                return existing.clone();
            }
        }
        let node = {
            let mut nodes = self.nodes.write().expect("node table poisoned");
            let ino = nodes.allocate();
            let node = Arc::new(FileNode::new(ino, init));
            nodes.register(ino, Node::File(node.clone()));
            node
        };
        inner.files.insert(name.to_string(), node.clone());
        if let Some(meta) = key_meta {
            inner.key_dir.insert(path.to_string(), meta);
        }
        node
    }
}
