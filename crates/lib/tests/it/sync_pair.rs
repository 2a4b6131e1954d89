//! Two in-process devices synchronizing over loopback.

use driftsync::store::{BackupType, FileStatus, SyncPerm};
use driftsync::sync::SyncRequest;

use crate::helpers::{read_file, start_node, write_file};

const SYNC_UUID: &str = "11111111-2222-3333-4444-555555555555";
const TREE_A: &str = "aaaaaaaa-0000-0000-0000-000000000001";
const TREE_B: &str = "bbbbbbbb-0000-0000-0000-000000000001";

#[tokio::test]
async fn initial_sync_transfers_everything() {
    let a = start_node("alice", "A").await;
    let mut b = start_node("alice", "B").await;

    // Device A holds the content.
    write_file(a.root.path(), "x.txt", b"hello");
    write_file(a.root.path(), "y/z.txt", b"hey");
    let sync_a = a.add_sync(SYNC_UUID, "docs").await;
    let tree_a = a.add_local_tree(sync_a, TREE_A).await;
    assert!(a.refresh_tree(tree_a).await > 0);

    // Device B joins with an empty root and knowledge of A.
    let sync_b = b.add_sync(SYNC_UUID, "docs").await;
    let tree_b = b.add_local_tree(sync_b, TREE_B).await;
    let remote_a = b.add_peer(&a, sync_b, TREE_A).await;

    assert!(b
        .sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_b,
            remote_tree_id: remote_a,
            is_manual: true,
        })
        .await
        .unwrap());
    let error = b.wait_sync_finished(tree_b, remote_a).await;
    assert_eq!(error, None);

    // Content landed with identical bytes and digests.
    assert_eq!(read_file(b.root.path(), "x.txt"), b"hello");
    assert_eq!(read_file(b.root.path(), "y/z.txt"), b"hey");

    let x = b.store.file_by_path(TREE_B, "/x.txt").await.unwrap().unwrap();
    assert_eq!(x.sha1, driftsync::crypto::sha1_hex(b"hello"));
    assert_eq!(x.status, FileStatus::Normal);

    // last_sync moved, and nothing conflicted.
    let sync = b.store.sync_by_id(sync_b).await.unwrap().unwrap();
    assert!(sync.last_sync > 0);
    let conflicts: Vec<_> = b
        .store
        .files_all(TREE_B)
        .await
        .unwrap()
        .into_iter()
        .filter(|f| f.path.contains(".conflict."))
        .collect();
    assert!(conflicts.is_empty());

    // Second run with no changes moves nothing (idempotent sync).
    let usn_before = b.store.max_usn(TREE_B).await.unwrap();
    assert!(b
        .sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_b,
            remote_tree_id: remote_a,
            is_manual: true,
        })
        .await
        .unwrap());
    assert_eq!(b.wait_sync_finished(tree_b, remote_a).await, None);
    assert_eq!(b.store.max_usn(TREE_B).await.unwrap(), usn_before);
}

#[tokio::test]
async fn concurrent_edits_conflict_and_converge() {
    let mut a = start_node("alice", "A").await;
    let mut b = start_node("alice", "B").await;

    // Converged starting state.
    write_file(a.root.path(), "x.txt", b"start");
    let sync_a = a.add_sync(SYNC_UUID, "docs").await;
    let tree_a = a.add_local_tree(sync_a, TREE_A).await;
    a.refresh_tree(tree_a).await;

    let sync_b = b.add_sync(SYNC_UUID, "docs").await;
    let tree_b = b.add_local_tree(sync_b, TREE_B).await;
    let remote_a_on_b = b.add_peer(&a, sync_b, TREE_A).await;
    let remote_b_on_a = a.add_peer(&b, sync_a, TREE_B).await;

    b.sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_b,
            remote_tree_id: remote_a_on_b,
            is_manual: true,
        })
        .await
        .unwrap();
    assert_eq!(b.wait_sync_finished(tree_b, remote_a_on_b).await, None);
    // A pulls B's adopted rows so both sides read Equal.
    a.sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_a,
            remote_tree_id: remote_b_on_a,
            is_manual: true,
        })
        .await
        .unwrap();
    assert_eq!(a.wait_sync_finished(tree_a, remote_b_on_a).await, None);

    // Network partition: both sides edit the same file.
    write_file(a.root.path(), "x.txt", b"edit from A!");
    write_file(b.root.path(), "x.txt", b"edit from B");
    a.refresh_tree(tree_a).await;
    b.refresh_tree(tree_b).await;

    // Reconnect: each side syncs once, then once more to settle.
    for _ in 0..2 {
        b.sync_pool
            .enqueue(SyncRequest {
                local_tree_id: tree_b,
                remote_tree_id: remote_a_on_b,
                is_manual: true,
            })
            .await
            .unwrap();
        assert_eq!(b.wait_sync_finished(tree_b, remote_a_on_b).await, None);

        a.sync_pool
            .enqueue(SyncRequest {
                local_tree_id: tree_a,
                remote_tree_id: remote_b_on_a,
                is_manual: true,
            })
            .await
            .unwrap();
        assert_eq!(a.wait_sync_finished(tree_a, remote_b_on_a).await, None);
    }

    // Both sides hold the same winner at the original path.
    let on_a = read_file(a.root.path(), "x.txt");
    let on_b = read_file(b.root.path(), "x.txt");
    assert_eq!(on_a, on_b);
    assert!(on_a == b"edit from A!" || on_a == b"edit from B");

    // The loser's content survived as a conflict sibling somewhere.
    let loser = if on_a == b"edit from A!" {
        b"edit from B".to_vec()
    } else {
        b"edit from A!".to_vec()
    };
    let mut conflict_bytes = Vec::new();
    for root in [a.root.path(), b.root.path()] {
        for entry in std::fs::read_dir(root).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.contains(".conflict.") {
                conflict_bytes.push(std::fs::read(entry.path()).unwrap());
            }
        }
    }
    assert!(
        conflict_bytes.iter().any(|c| *c == loser),
        "loser content must survive in a conflict sibling"
    );
}

#[tokio::test]
async fn wronly_peer_receives_nothing() {
    let a = start_node("alice", "A").await;
    let mut b = start_node("alice", "B").await;

    write_file(a.root.path(), "x.txt", b"hello");
    let sync_a = a.add_sync(SYNC_UUID, "docs").await;
    let tree_a = a.add_local_tree(sync_a, TREE_A).await;
    a.refresh_tree(tree_a).await;

    let sync_b = b.add_sync(SYNC_UUID, "docs").await;
    let tree_b = b.add_local_tree(sync_b, TREE_B).await;
    let remote_a = b.add_peer(&a, sync_b, TREE_A).await;
    // B may only send.
    b.store.set_sync_perm(sync_b, SyncPerm::Wronly).await.unwrap();

    b.sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_b,
            remote_tree_id: remote_a,
            is_manual: true,
        })
        .await
        .unwrap();
    assert_eq!(b.wait_sync_finished(tree_b, remote_a).await, None);

    assert!(!b.root.path().join("x.txt").exists());
    assert!(b.store.file_by_path(TREE_B, "/x.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn disconnect_is_a_benign_noop() {
    let a = start_node("alice", "A").await;
    let mut b = start_node("alice", "B").await;

    write_file(a.root.path(), "x.txt", b"hello");
    let sync_a = a.add_sync(SYNC_UUID, "docs").await;
    let tree_a = a.add_local_tree(sync_a, TREE_A).await;
    a.refresh_tree(tree_a).await;

    let sync_b = b.add_sync(SYNC_UUID, "docs").await;
    let tree_b = b.add_local_tree(sync_b, TREE_B).await;
    let remote_a = b.add_peer(&a, sync_b, TREE_A).await;
    b.store
        .set_sync_perm(sync_b, SyncPerm::Disconnect)
        .await
        .unwrap();

    b.sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_b,
            remote_tree_id: remote_a,
            is_manual: true,
        })
        .await
        .unwrap();
    assert_eq!(b.wait_sync_finished(tree_b, remote_a).await, None);
    assert!(!b.root.path().join("x.txt").exists());
}

#[tokio::test]
async fn tombstones_propagate_and_delete_to_trash() {
    let a = start_node("alice", "A").await;
    let mut b = start_node("alice", "B").await;

    write_file(a.root.path(), "x.txt", b"hello");
    let sync_a = a.add_sync(SYNC_UUID, "docs").await;
    let tree_a = a.add_local_tree(sync_a, TREE_A).await;
    a.refresh_tree(tree_a).await;

    let sync_b = b.add_sync(SYNC_UUID, "docs").await;
    let tree_b = b.add_local_tree(sync_b, TREE_B).await;
    let remote_a = b.add_peer(&a, sync_b, TREE_A).await;

    b.sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_b,
            remote_tree_id: remote_a,
            is_manual: true,
        })
        .await
        .unwrap();
    assert_eq!(b.wait_sync_finished(tree_b, remote_a).await, None);
    assert!(b.root.path().join("x.txt").exists());

    // A deletes; the tombstone reaches B on the next cycle.
    std::fs::remove_file(a.root.path().join("x.txt")).unwrap();
    a.refresh_tree(tree_a).await;

    b.sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_b,
            remote_tree_id: remote_a,
            is_manual: true,
        })
        .await
        .unwrap();
    assert_eq!(b.wait_sync_finished(tree_b, remote_a).await, None);

    assert!(!b.root.path().join("x.txt").exists());
    let row = b.store.file_by_path(TREE_B, "/x.txt").await.unwrap().unwrap();
    assert_eq!(row.status, FileStatus::Remove);
    // The bytes moved to trash rather than vanishing.
    let trash = b.root.path().join(driftsync::refresh::TRASH_DIR);
    let trashed = std::fs::read_dir(&trash)
        .map(|d| d.count())
        .unwrap_or(0);
    assert_eq!(trashed, 1);
}

#[tokio::test]
async fn backup_flows_one_way_only() {
    let mut a = start_node("alice", "A").await;
    let mut b = start_node("alice", "B").await;

    // A is the backup source, B the destination.
    write_file(a.root.path(), "report.txt", b"keep me");
    write_file(a.root.path(), "old.txt", b"drop me");
    let sync_a = a.add_sync(SYNC_UUID, "nightly").await;
    let tree_a = a.add_local_tree_as(sync_a, TREE_A, BackupType::Src).await;
    a.refresh_tree(tree_a).await;

    let sync_b = b.add_sync(SYNC_UUID, "nightly").await;
    let tree_b = b.add_local_tree_as(sync_b, TREE_B, BackupType::Dst).await;
    let remote_a_on_b = b.add_peer_as(&a, sync_b, TREE_A, BackupType::Src).await;
    let remote_b_on_a = a.add_peer_as(&b, sync_a, TREE_B, BackupType::Dst).await;

    // Files flow source to destination.
    b.sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_b,
            remote_tree_id: remote_a_on_b,
            is_manual: true,
        })
        .await
        .unwrap();
    assert_eq!(b.wait_sync_finished(tree_b, remote_a_on_b).await, None);
    assert_eq!(read_file(b.root.path(), "report.txt"), b"keep me");
    assert_eq!(read_file(b.root.path(), "old.txt"), b"drop me");

    // The destination deletes locally; the source never picks it up.
    std::fs::remove_file(b.root.path().join("old.txt")).unwrap();
    b.refresh_tree(tree_b).await;

    a.sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_a,
            remote_tree_id: remote_b_on_a,
            is_manual: true,
        })
        .await
        .unwrap();
    assert_eq!(a.wait_sync_finished(tree_a, remote_b_on_a).await, None);
    assert_eq!(read_file(a.root.path(), "old.txt"), b"drop me");
    let on_a = a.store.file_by_path(TREE_A, "/old.txt").await.unwrap().unwrap();
    assert_eq!(on_a.status, FileStatus::Normal);

    // A source deletion is tombstoned and applied on the destination,
    // while the destination's own deletion stays deleted.
    std::fs::remove_file(a.root.path().join("report.txt")).unwrap();
    a.refresh_tree(tree_a).await;

    b.sync_pool
        .enqueue(SyncRequest {
            local_tree_id: tree_b,
            remote_tree_id: remote_a_on_b,
            is_manual: true,
        })
        .await
        .unwrap();
    assert_eq!(b.wait_sync_finished(tree_b, remote_a_on_b).await, None);

    assert!(!b.root.path().join("report.txt").exists());
    let report = b
        .store
        .file_by_path(TREE_B, "/report.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.status, FileStatus::Remove);
    assert!(!b.root.path().join("old.txt").exists());
    // The source side is untouched by any of it.
    assert_eq!(read_file(a.root.path(), "old.txt"), b"drop me");
}
