//! End-to-end lookup pipeline tests against a real blob server: cold
//! fetch from the server, warm hit from the local blob cache.
//!
//! These run the core the way FUSE threads do: synchronous callers
//! bridging into the runtime with `block_on`, so the tests are plain
//! `#[test]`s that own their runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::runtime::Runtime;

use lazyfs_blob_server::{http_server, Store};
use lazyfs_common::{content_hash, Entry};
use lazyfs_worker::client::BlobClient;
use lazyfs_worker::fuse::{FsCore, Node};

fn file_entry(key: &str, parent: &str, value: &[u8]) -> Entry {
    Entry {
        key: key.to_string(),
        value: value.to_vec(),
        parent: parent.to_string(),
        name: key.rsplit('/').next().unwrap().to_string(),
        size: value.len() as i64,
        mode: 0o644,
        ..Default::default()
    }
}

fn dir_entry(key: &str, parent: &str) -> Entry {
    Entry {
        key: key.to_string(),
        parent: parent.to_string(),
        name: key.rsplit('/').next().unwrap().to_string(),
        is_dir: true,
        mode: 0o755,
        ..Default::default()
    }
}

fn spawn_blob_server(rt: &Runtime, store: Arc<Store>) -> SocketAddr {
    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = http_server::router(store);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    })
}

fn core_against(rt: &Runtime, addr: SocketAddr, cache_dir: &std::path::Path) -> Arc<FsCore> {
    let base = url::Url::parse(&format!("http://{addr}")).unwrap();
    let client = BlobClient::new(base).unwrap();
    Arc::new(FsCore::new(
        client,
        cache_dir.to_path_buf(),
        rt.handle().clone(),
    ))
}

#[test]
fn cold_fetch_then_warm_disk_hit() {
    let rt = Runtime::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let store = Arc::new(rt.block_on(Store::open(store_dir.path())).unwrap());
    rt.block_on(store.upload(vec![file_entry("/app/util.py", "/app", b"import os\n")]))
        .unwrap();

    let addr = spawn_blob_server(&rt, store);
    let core = core_against(&rt, addr, cache_dir.path());
    let app = match core.node(lazyfs_worker::fuse::ROOT_INO).unwrap() {
        Node::Dir(root) => match core.lookup(&root, "app").unwrap() {
            (Node::Dir(app), _) => app,
            _ => panic!("app is a directory"),
        },
        _ => panic!("root is a directory"),
    };
    core.stats.swap_and_reset();

    // Cold: one server fetch, bytes in hand, blob persisted under its
    // content hash.
    let file = match core.lookup(&app, "util.py").unwrap() {
        (Node::File(file), _) => file,
        _ => panic!("util.py is a file"),
    };
    assert_eq!(file.read(0, 64).unwrap(), b"import os\n");

    let snap = core.stats.snapshot();
    assert_eq!(snap.server_fetches, 1);
    assert_eq!(snap.disk_cache_hits, 0);

    let hash = content_hash(b"import os\n");
    assert_eq!(
        std::fs::read(cache_dir.path().join(&hash)).unwrap(),
        b"import os\n"
    );

    // Warm: the key index plus the on-disk blob satisfy the lookup
    // with no further server traffic.
    let again = match core.lookup(&app, "util.py").unwrap() {
        (Node::File(file), _) => file,
        _ => panic!("util.py is a file"),
    };
    assert_eq!(again.ino(), file.ino());

    let snap = core.stats.snapshot();
    assert_eq!(snap.server_fetches, 1);
    assert_eq!(snap.disk_cache_hits, 1);
}

#[test]
fn nested_directories_resolve_through_the_server() {
    let rt = Runtime::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let store = Arc::new(rt.block_on(Store::open(store_dir.path())).unwrap());
    rt.block_on(store.upload(vec![
        dir_entry("/app/pkg", "/app"),
        file_entry("/app/pkg/mod.py", "/app/pkg", b"x = 1\n"),
    ]))
    .unwrap();

    let addr = spawn_blob_server(&rt, store);
    let core = core_against(&rt, addr, cache_dir.path());
    let root = match core.node(lazyfs_worker::fuse::ROOT_INO).unwrap() {
        Node::Dir(root) => root,
        _ => panic!("root is a directory"),
    };

    let app = match core.lookup(&root, "app").unwrap() {
        (Node::Dir(dir), _) => dir,
        _ => panic!("app is a directory"),
    };
    let pkg = match core.lookup(&app, "pkg").unwrap() {
        (Node::Dir(dir), _) => dir,
        _ => panic!("pkg is a directory"),
    };
    assert_eq!(pkg.path(), "/app/pkg");

    let file = match core.lookup(&pkg, "mod.py").unwrap() {
        (Node::File(file), _) => file,
        _ => panic!("mod.py is a file"),
    };
    assert_eq!(file.read(0, 16).unwrap(), b"x = 1\n");

    // The readdir merge over pkg sees the one file.
    let names: Vec<_> = core
        .readdir(&pkg)
        .into_iter()
        .map(|item| item.name)
        .collect();
    assert_eq!(names, vec!["mod.py".to_string()]);
}

#[test]
fn missing_names_are_cached_negative_until_cleared() {
    let rt = Runtime::new().unwrap();
    let store_dir = TempDir::new().unwrap();
    let cache_dir = TempDir::new().unwrap();

    let store = Arc::new(rt.block_on(Store::open(store_dir.path())).unwrap());
    let addr = spawn_blob_server(&rt, store.clone());
    let core = core_against(&rt, addr, cache_dir.path());
    let root = match core.node(lazyfs_worker::fuse::ROOT_INO).unwrap() {
        Node::Dir(root) => root,
        _ => panic!("root is a directory"),
    };
    let app = match core.lookup(&root, "app").unwrap() {
        (Node::Dir(dir), _) => dir,
        _ => panic!("app is a directory"),
    };

    assert_eq!(core.lookup(&app, "missing.so").unwrap_err(), libc::ENOENT);
    assert!(core.is_not_found("/app/missing.so"));

    // The file shows up server-side, but the negative cache masks it
    // until the next run clears the set.
    rt.block_on(store.upload(vec![file_entry("/app/missing.so", "/app", b"late")]))
        .unwrap();
    assert_eq!(core.lookup(&app, "missing.so").unwrap_err(), libc::ENOENT);

    core.clear_not_found();
    let file = match core.lookup(&app, "missing.so").unwrap() {
        (Node::File(file), _) => file,
        _ => panic!("missing.so is a file"),
    };
    assert_eq!(file.read(0, 8).unwrap(), b"late");
}
