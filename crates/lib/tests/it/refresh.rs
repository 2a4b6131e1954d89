//! Filesystem indexing against real temp trees.

use driftsync::store::{FileKind, FileStatus, RootStatus};

use crate::helpers::{start_node, write_file};

#[tokio::test]
async fn initial_walk_indexes_everything() {
    let node = start_node("alice", "A").await;
    let sync_id = node.add_sync("s-refresh", "docs").await;
    let tree_id = node.add_local_tree(sync_id, "t-refresh").await;

    write_file(node.root.path(), "x.txt", b"hello");
    write_file(node.root.path(), "y/z.txt", b"hey");

    let affected = node.refresh_tree(tree_id).await;
    // x.txt, y/, y/z.txt
    assert_eq!(affected, 3);

    let x = node
        .store
        .file_by_path("t-refresh", "/x.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(x.kind, FileKind::Regular);
    assert_eq!(x.length, 5);
    assert_eq!(x.sha1, driftsync::crypto::sha1_hex(b"hello"));
    assert_eq!(x.vclock.local, 1);
    assert_eq!(x.modifier, node.config.device_uuid());

    let y = node
        .store
        .file_by_path("t-refresh", "/y")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(y.kind, FileKind::Directory);
    assert!(y.sha1.is_empty());
}

#[tokio::test]
async fn refresh_is_idempotent_without_changes() {
    let node = start_node("alice", "A").await;
    let sync_id = node.add_sync("s-idem", "docs").await;
    let tree_id = node.add_local_tree(sync_id, "t-idem").await;
    write_file(node.root.path(), "x.txt", b"hello");

    assert!(node.refresh_tree(tree_id).await > 0);
    let usn = node.store.max_usn("t-idem").await.unwrap();

    // Nothing changed on disk: no rows and no usn movement.
    assert_eq!(node.refresh_tree(tree_id).await, 0);
    assert_eq!(node.store.max_usn("t-idem").await.unwrap(), usn);
}

#[tokio::test]
async fn edits_and_deletions_are_detected() {
    let node = start_node("alice", "A").await;
    let sync_id = node.add_sync("s-edit", "docs").await;
    let tree_id = node.add_local_tree(sync_id, "t-edit").await;
    write_file(node.root.path(), "x.txt", b"hello");
    write_file(node.root.path(), "gone.txt", b"bye");
    node.refresh_tree(tree_id).await;

    write_file(node.root.path(), "x.txt", b"hello world");
    std::fs::remove_file(node.root.path().join("gone.txt")).unwrap();
    let affected = node.refresh_tree(tree_id).await;
    assert_eq!(affected, 2);

    let x = node
        .store
        .file_by_path("t-edit", "/x.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(x.length, 11);
    assert_eq!(x.vclock.local, 2);
    assert_eq!(x.status, FileStatus::Normal);

    let gone = node
        .store
        .file_by_path("t-edit", "/gone.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(gone.status, FileStatus::Remove);
    assert_ne!(gone.usn, x.usn); // both got fresh, distinct usns
}

#[tokio::test]
async fn touched_but_identical_content_changes_nothing() {
    let node = start_node("alice", "A").await;
    let sync_id = node.add_sync("s-touch", "docs").await;
    let tree_id = node.add_local_tree(sync_id, "t-touch").await;
    write_file(node.root.path(), "x.txt", b"hello");
    node.refresh_tree(tree_id).await;

    // Rewrite identical bytes; mtime moves but content does not.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    write_file(node.root.path(), "x.txt", b"hello");
    assert_eq!(node.refresh_tree(tree_id).await, 0);
}

#[tokio::test]
async fn missing_root_tombstones_nothing() {
    let node = start_node("alice", "A").await;
    let sync_id = node.add_sync("s-root", "docs").await;
    let tree_id = node.add_local_tree(sync_id, "t-root").await;
    write_file(node.root.path(), "x.txt", b"hello");
    node.refresh_tree(tree_id).await;

    // Point the tree at a directory that is not there.
    let missing = node.root.path().join("not-here");
    node.store
        .set_tree_root(tree_id, &missing.display().to_string())
        .await
        .unwrap();

    assert_eq!(node.refresh_tree(tree_id).await, 0);
    let tree = node.store.tree_by_id(tree_id).await.unwrap().unwrap();
    assert_eq!(tree.root_status, RootStatus::Removed);
    // Rows survive the absence.
    let x = node
        .store
        .file_by_path("t-root", "/x.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(x.status, FileStatus::Normal);

    // The root reappears: status restores and the walk reconciles.
    std::fs::create_dir_all(&missing).unwrap();
    write_file(&missing, "x.txt", b"hello");
    node.refresh_tree(tree_id).await;
    let tree = node.store.tree_by_id(tree_id).await.unwrap().unwrap();
    assert_eq!(tree.root_status, RootStatus::Normal);
}

#[tokio::test]
async fn sync_list_scopes_the_walk() {
    let node = start_node("alice", "A").await;
    let sync_id = node.add_sync("s-scope", "photos").await;
    let tree_id = node.add_local_tree(sync_id, "t-scope").await;

    write_file(node.root.path(), "photos/2024/a.jpg", b"aaaa");
    write_file(node.root.path(), "photos/2025/b.jpg", b"bbbb");
    node.store
        .sync_list_insert(tree_id, "/photos/2024")
        .await
        .unwrap();

    node.refresh_tree(tree_id).await;

    // In-scope rows exist: the entry, its ancestor dirs, its children.
    assert!(node
        .store
        .file_by_path("t-scope", "/photos/2024/a.jpg")
        .await
        .unwrap()
        .is_some());
    assert!(node
        .store
        .file_by_path("t-scope", "/photos")
        .await
        .unwrap()
        .is_some());
    // Out-of-scope subtree never entered the table.
    assert!(node
        .store
        .file_by_path("t-scope", "/photos/2025/b.jpg")
        .await
        .unwrap()
        .is_none());
    assert!(node
        .store
        .file_by_path("t-scope", "/photos/2025")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn dotfiles_are_ignored() {
    let node = start_node("alice", "A").await;
    let sync_id = node.add_sync("s-dot", "docs").await;
    let tree_id = node.add_local_tree(sync_id, "t-dot").await;

    write_file(node.root.path(), ".hidden", b"x");
    write_file(node.root.path(), ".git/config", b"x");
    write_file(node.root.path(), "seen.txt", b"x");

    assert_eq!(node.refresh_tree(tree_id).await, 1);
    assert!(node
        .store
        .file_by_path("t-dot", "/seen.txt")
        .await
        .unwrap()
        .is_some());
    assert!(node
        .store
        .file_by_path("t-dot", "/.hidden")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn concurrent_refreshes_coalesce() {
    let node = start_node("alice", "A").await;
    let sync_id = node.add_sync("s-co", "docs").await;
    let tree_id = node.add_local_tree(sync_id, "t-co").await;
    for i in 0..50 {
        write_file(node.root.path(), &format!("f{i}.txt"), b"data");
    }

    // Queue a walk, then race another request for the same tree.
    use driftsync::refresh::RefreshTask;
    assert!(node
        .refresh
        .enqueue(RefreshTask {
            tree_id,
            subtree: None,
        })
        .await
        .unwrap());
    assert!(!node
        .refresh
        .enqueue(RefreshTask {
            tree_id,
            subtree: None,
        })
        .await
        .unwrap());

    // Wait for the walk to land, then verify a single coherent result.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(20);
    loop {
        let rows = node.store.files_all("t-co").await.unwrap();
        if rows.len() == 50 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "walk never finished");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(node.store.max_usn("t-co").await.unwrap(), 50);
}
