//! Metadata store invariants.

use driftsync::store::{
    BatchOp, ContentProvider, ContentValues, FileChange, FileEntry, FileKind, FileStatus,
    OnConflict, Selection, Uri,
};
use driftsync::vclock::VClock;

use crate::helpers::setup_store;

fn entry(path: &str, sha1: &str) -> FileEntry {
    FileEntry {
        id: 0,
        path: path.to_string(),
        kind: FileKind::Regular,
        status: FileStatus::Normal,
        mtime: 100,
        length: 5,
        usn: 0,
        sha1: sha1.to_string(),
        modifier: "dev-a".to_string(),
        win_attr: 0,
        unix_attr: 0o644,
        vclock: VClock::new(1, 0),
        alias: String::new(),
        time_stamp: 100,
    }
}

#[tokio::test]
async fn usn_is_strictly_monotonic_and_gap_free() {
    let store = setup_store().await;
    store.ensure_file_table("t1").await.unwrap();

    let changes = vec![
        FileChange::Insert(entry("/a", "h1")),
        FileChange::Insert(entry("/b", "h2")),
        FileChange::Insert(entry("/c", "h3")),
    ];
    assert_eq!(store.apply_file_batch("t1", changes).await.unwrap(), 3);

    let mut updated = entry("/b", "h4");
    updated.vclock = VClock::new(2, 0);
    store
        .apply_file_batch("t1", vec![FileChange::Update(updated)])
        .await
        .unwrap();

    let mut usns: Vec<i64> = store
        .files_all("t1")
        .await
        .unwrap()
        .iter()
        .map(|f| f.usn)
        .collect();
    usns.sort_unstable();
    assert_eq!(usns, vec![1, 3, 4]); // /b was rewritten from usn 2 to 4
    assert_eq!(store.max_usn("t1").await.unwrap(), 4);

    // usn-ordered paging picks up exactly the rows after the cursor.
    let page = store.files_since("t1", 1, 10).await.unwrap();
    assert_eq!(page.len(), 2);
    assert!(page.windows(2).all(|w| w[0].usn < w[1].usn));
}

#[tokio::test]
async fn tombstone_bumps_usn_and_local_clock() {
    let store = setup_store().await;
    store.ensure_file_table("t1").await.unwrap();
    store
        .apply_file_batch("t1", vec![FileChange::Insert(entry("/a", "h1"))])
        .await
        .unwrap();

    let affected = store
        .apply_file_batch(
            "t1",
            vec![FileChange::Tombstone {
                path: "/a".to_string(),
                modifier: "dev-a".to_string(),
                time_stamp: 200,
            }],
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let row = store.file_by_path("t1", "/a").await.unwrap().unwrap();
    assert_eq!(row.status, FileStatus::Remove);
    assert_eq!(row.usn, 2);
    assert_eq!(row.vclock.local, 2);

    // Tombstoning a tombstone is a no-op.
    let affected = store
        .apply_file_batch(
            "t1",
            vec![FileChange::Tombstone {
                path: "/a".to_string(),
                modifier: "dev-a".to_string(),
                time_stamp: 300,
            }],
        )
        .await
        .unwrap();
    assert_eq!(affected, 0);
}

#[tokio::test]
async fn batch_is_atomic_on_failure() {
    let store = setup_store().await;

    // Second insert hits the uuid UNIQUE constraint; the first must roll
    // back with it.
    let ops = vec![
        BatchOp::Insert {
            uri: Uri::sync(),
            values: ContentValues::new()
                .put("uuid", "s-1")
                .put("name", "one"),
            on_conflict: OnConflict::Abort,
        },
        BatchOp::Insert {
            uri: Uri::sync(),
            values: ContentValues::new()
                .put("uuid", "s-1")
                .put("name", "dup"),
            on_conflict: OnConflict::Abort,
        },
    ];
    let err = store.apply_batch(ops).await.unwrap_err();
    assert_eq!(err.kind(), driftsync::ErrorKind::Content);

    let rows = store
        .query(&Uri::sync(), &[], None, None)
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn observers_fire_once_per_uri_per_batch() {
    let store = setup_store().await;
    store.ensure_file_table("t1").await.unwrap();
    let mut file_obs = store.register_observer(Uri::tree_file("t1"), false);
    let mut all_files_obs = store.register_observer(Uri::tree_file_root(), true);
    let mut sync_obs = store.register_observer(Uri::sync(), false);

    let changes = vec![
        FileChange::Insert(entry("/a", "h1")),
        FileChange::Insert(entry("/b", "h2")),
    ];
    store.apply_file_batch("t1", changes).await.unwrap();

    // One batch, one notification, regardless of row count.
    assert_eq!(file_obs.changed().await, Some(Uri::tree_file("t1")));
    assert_eq!(file_obs.try_changed(), None);
    assert_eq!(all_files_obs.changed().await, Some(Uri::tree_file("t1")));
    assert_eq!(all_files_obs.try_changed(), None);
    assert_eq!(sync_obs.try_changed(), None);

    // An empty batch commits nothing and notifies nobody.
    store.apply_file_batch("t1", Vec::new()).await.unwrap();
    assert_eq!(file_obs.try_changed(), None);
}

#[tokio::test]
async fn selection_binds_are_positional() {
    let store = setup_store().await;
    let uri = Uri::config();
    for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
        store
            .insert(
                &uri,
                ContentValues::new().put("key", k).put("value", v),
                OnConflict::Abort,
            )
            .await
            .unwrap();
    }
    let rows = store
        .query(
            &uri,
            &["key", "value"],
            Some(&Selection::new("key = ? OR value = ?").bind("a").bind("3")),
            Some("key"),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get_str("key").unwrap(), "a");
    assert_eq!(rows[1].get_str("key").unwrap(), "c");

    let deleted = store
        .delete(&uri, Some(&Selection::new("key = ?").bind("b")))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
}

#[tokio::test]
async fn sync_list_subsumption() {
    let store = setup_store().await;
    // Minimal sync/tree rows to satisfy the foreign key.
    let sync_id = store
        .insert(
            &Uri::sync(),
            ContentValues::new().put("uuid", "s").put("name", "s"),
            OnConflict::Abort,
        )
        .await
        .unwrap();
    let tree_id = store
        .insert(
            &Uri::tree(),
            ContentValues::new()
                .put("uuid", "t")
                .put("device_id", 0_i64)
                .put("sync_id", sync_id),
            OnConflict::Abort,
        )
        .await
        .unwrap();

    assert!(store.sync_list_insert(tree_id, "/photos/2024").await.unwrap());
    // Covered by the existing entry.
    assert!(!store.sync_list_insert(tree_id, "/photos/2024/jan").await.unwrap());
    // An ancestor subsumes and replaces the descendants.
    assert!(store.sync_list_insert(tree_id, "/photos").await.unwrap());
    assert_eq!(
        store.sync_list_paths(tree_id).await.unwrap(),
        vec!["/photos".to_string()]
    );

    assert!(store.sync_list_remove(tree_id, "/photos").await.unwrap());
    assert!(!store.sync_list_remove(tree_id, "/photos").await.unwrap());
}
