//! Standalone download/upload tasks against a real peer over loopback.

use std::time::{Duration, Instant};

use driftsync::transfer::{TaskState, TaskStatus};

use crate::helpers::{Node, read_file, start_node, write_file};

const SYNC_UUID: &str = "22222222-3333-4444-5555-666666666666";
const TREE_A: &str = "aaaaaaaa-1111-0000-0000-000000000002";

async fn wait_task_settled(node: &Node, task_id: i64) -> TaskStatus {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let status = node.transfer.query_task(task_id).await.expect("task exists");
        if status.state != TaskState::Running {
            return status;
        }
        assert!(Instant::now() < deadline, "task never settled");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn download_task_runs_to_completion_and_shutdown() {
    let a = start_node("alice", "A").await;
    let b = start_node("alice", "B").await;

    let payload = vec![7u8; 200 * 1024];
    write_file(a.root.path(), "big.bin", &payload);
    let sync_a = a.add_sync(SYNC_UUID, "docs").await;
    a.add_local_tree(sync_a, TREE_A).await;

    // B only needs to know the sync and A's tree to find a source.
    let sync_b = b.add_sync(SYNC_UUID, "docs").await;
    b.add_peer(&a, sync_b, TREE_A).await;

    let task_id = b
        .transfer
        .startup_download(SYNC_UUID, "/big.bin")
        .await
        .unwrap();
    let status = wait_task_settled(&b, task_id).await;
    assert_eq!(status.state, TaskState::Done);
    assert_eq!(status.bytes_total, payload.len() as i64);
    assert_eq!(status.bytes_done, payload.len() as i64);
    assert_eq!(std::fs::read(&status.target).unwrap(), payload);

    // Shutdown forgets the task and drops its cache file.
    b.transfer.shutdown_download(task_id).await.unwrap();
    assert!(b.transfer.query_task(task_id).await.is_err());
    assert!(!status.target.exists());
    assert!(b.transfer.shutdown_download(task_id).await.is_err());
}

#[tokio::test]
async fn upload_task_completes_and_shutdown_keeps_the_source() {
    let a = start_node("alice", "A").await;
    let b = start_node("alice", "B").await;

    let sync_a = a.add_sync(SYNC_UUID, "docs").await;
    a.add_local_tree(sync_a, TREE_A).await;

    let payload = b"upload me".to_vec();
    write_file(b.root.path(), "up.bin", &payload);
    let sync_b = b.add_sync(SYNC_UUID, "docs").await;
    b.add_peer(&a, sync_b, TREE_A).await;

    let task_id = b
        .transfer
        .startup_upload(SYNC_UUID, "/up.bin", b.root.path().join("up.bin"))
        .await
        .unwrap();
    let status = wait_task_settled(&b, task_id).await;
    assert_eq!(status.state, TaskState::Done);
    assert_eq!(status.bytes_done, payload.len() as i64);
    // The bytes landed in A's tree.
    assert_eq!(read_file(a.root.path(), "up.bin"), payload);

    // Shutting an upload down never touches the caller's source file.
    b.transfer.shutdown_upload(task_id).await.unwrap();
    assert!(b.transfer.query_task(task_id).await.is_err());
    assert_eq!(read_file(b.root.path(), "up.bin"), payload);
    assert!(b.transfer.shutdown_upload(task_id).await.is_err());
}

#[tokio::test]
async fn download_without_a_reachable_source_fails_fast() {
    let b = start_node("alice", "B").await;
    // A sync with no remote trees has no source.
    let _sync = b.add_sync(SYNC_UUID, "docs").await;
    assert!(b
        .transfer
        .startup_download(SYNC_UUID, "/missing.bin")
        .await
        .is_err());
}
