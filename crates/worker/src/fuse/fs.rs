//! Root filesystem state: the inode registry, the not-found set, and
//! the eagerly registered directory skeleton.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::client::BlobClient;
use crate::stats::LookupStats;

use super::dir::Directory;
use super::file::FileNode;

pub const ROOT_INO: u64 = 1;

/// Directories every Linux rootfs is expected to carry; registered
/// beneath `/app` at startup so the container runtime never has to ask
/// the server for the skeleton.
const LINUX_DIRS: &[&str] = &[
    "home", "lib", "media", "mnt", "opt", "proc", "dev", "sys", "lib64",
];

/// A registered inode.
#[derive(Debug, Clone)]
pub enum Node {
    Dir(Arc<Directory>),
    File(Arc<FileNode>),
}

/// Inode-number registry. Numbers are never reused, so a name that has
/// been resolved once keeps its inode for the life of the mount.
pub(super) struct NodeTable {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
}

impl NodeTable {
    fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            next_ino: ROOT_INO + 1,
        }
    }

    pub(super) fn allocate(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    pub(super) fn register(&mut self, ino: u64, node: Node) {
        self.nodes.insert(ino, node);
    }

    fn get(&self, ino: u64) -> Option<Node> {
        self.nodes.get(&ino).cloned()
    }
}

/// Shared state behind every FUSE callback.
pub struct FsCore {
    pub(super) client: BlobClient,
    pub(super) cache_dir: PathBuf,
    pub(super) rt: tokio::runtime::Handle,
    pub(super) nodes: RwLock<NodeTable>,
    /// Canonical paths the server has answered 404 for. Replaced
    /// wholesale at the start of each run.
    not_found: RwLock<HashSet<String>>,
    pub stats: LookupStats,
    root: Arc<Directory>,
}

impl FsCore {
    pub fn new(client: BlobClient, cache_dir: PathBuf, rt: tokio::runtime::Handle) -> Self {
        let mut table = NodeTable::new();
        let root = Arc::new(Directory::new(ROOT_INO, "/".to_string()));
        table.register(ROOT_INO, Node::Dir(root.clone()));

        let core = Self {
            client,
            cache_dir,
            rt,
            nodes: RwLock::new(table),
            not_found: RwLock::new(HashSet::new()),
            stats: LookupStats::default(),
            root,
        };

        let root = core.root.clone();
        let app = core.register_dir_child(&root, "app");
        for name in LINUX_DIRS {
            core.register_dir_child(&app, name);
        }
        core
    }

    pub fn root(&self) -> &Arc<Directory> {
        &self.root
    }

    pub fn node(&self, ino: u64) -> Option<Node> {
        self.nodes.read().expect("node table poisoned").get(ino)
    }

    pub fn is_not_found(&self, path: &str) -> bool {
        self.not_found
            .read()
            .expect("not-found set poisoned")
            .contains(path)
    }

    pub fn add_not_found(&self, path: String) {
        self.not_found
            .write()
            .expect("not-found set poisoned")
            .insert(path);
    }

    /// Forget every negative result. Called at the start of each run:
    /// the user may have uploaded files that were missing last time.
    pub fn clear_not_found(&self) {
        *self.not_found.write().expect("not-found set poisoned") = HashSet::new();
    }
}

/// Join a child name onto a canonical directory path.
pub(super) fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_path_handles_root() {
        assert_eq!(join_path("/", "app"), "/app");
        assert_eq!(join_path("/app", "numpy.so"), "/app/numpy.so");
    }

    #[test]
    fn not_found_set_clears_wholesale() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let client = BlobClient::new(url::Url::parse("http://localhost:1").unwrap()).unwrap();
        let core = FsCore::new(client, PathBuf::from("/tmp"), rt.handle().clone());

        core.add_not_found("/app/missing.so".to_string());
        assert!(core.is_not_found("/app/missing.so"));

        core.clear_not_found();
        assert!(!core.is_not_found("/app/missing.so"));
    }
}
