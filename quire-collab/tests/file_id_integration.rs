//! File ids driven by the real filesystem watcher.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use quire_collab::{ChangeKind, FileIdConfig, FileIdManager};

async fn watching(root: &std::path::Path, db: &std::path::Path) -> Arc<FileIdManager> {
    let config = FileIdConfig {
        watch_filesystem: true,
        ..FileIdConfig::for_testing(root, db)
    };
    let manager = Arc::new(FileIdManager::new(config).unwrap());
    manager.start().await.unwrap();
    manager
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("watcher never caught up");
}

#[tokio::test]
async fn test_watcher_indexes_new_files() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let manager = watching(root.path(), &db.path().join("ids")).await;

    std::fs::write(root.path().join("fresh.txt"), "hi").unwrap();
    eventually(|| async { manager.get_id("fresh.txt").await.unwrap().is_some() }).await;
    manager.stop().await;
}

#[tokio::test]
async fn test_watcher_follows_renames() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("a.txt"), "content").unwrap();
    let manager = watching(root.path(), &db.path().join("ids")).await;
    let id = manager.get_id("a.txt").await.unwrap().unwrap();

    std::fs::rename(root.path().join("a.txt"), root.path().join("b.txt")).unwrap();
    eventually(|| async { manager.get_path(&id).await.unwrap().as_deref() == Some("b.txt") })
        .await;
    assert_eq!(manager.get_id("a.txt").await.unwrap(), None);
    manager.stop().await;
}

#[tokio::test]
async fn test_subscribers_see_modifications() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let file = root.path().join("watched.txt");
    std::fs::write(&file, "one").unwrap();
    let manager = watching(root.path(), &db.path().join("ids")).await;

    let mut watch = manager.watch("watched.txt");
    // Give the watcher a moment to settle before writing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::write(&file, "two").unwrap();

    let change = tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.path, "watched.txt");
    assert!(matches!(change.kind, ChangeKind::Modified | ChangeKind::Added));

    manager.unwatch(watch.path(), watch.id());
    manager.stop().await;
}

#[tokio::test]
async fn test_ids_survive_restart() {
    let root = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("docs")).unwrap();
    std::fs::write(root.path().join("docs/a.md"), "a").unwrap();

    let id = {
        let manager = watching(root.path(), &db.path().join("ids")).await;
        let id = manager.get_id("docs/a.md").await.unwrap().unwrap();
        manager.stop().await;
        id
    };

    let manager = watching(root.path(), &db.path().join("ids")).await;
    assert_eq!(manager.get_id("docs/a.md").await.unwrap(), Some(id));
    manager.stop().await;
}
