//! Kernel façade lifecycle and operation surface.

use std::sync::Arc;

use driftsync::ErrorKind;
use driftsync::events::NullListener;
use driftsync::kernel::Kernel;
use driftsync::store::PathType;

async fn free_udp_port() -> u16 {
    let socket = tokio::net::UdpSocket::bind(("0.0.0.0", 0))
        .await
        .expect("probe udp");
    let port = socket.local_addr().expect("local addr").port();
    drop(socket);
    port
}

async fn started_kernel() -> (Kernel, tempfile::TempDir) {
    let appdata = tempfile::tempdir().expect("appdata");
    let kernel = Kernel::new();
    kernel
        .initialize(appdata.path(), "alice", "secret", None, None)
        .await
        .expect("initialize");
    let port = free_udp_port().await;
    kernel
        .startup(appdata.path(), port, Arc::new(NullListener), None, None)
        .await
        .expect("startup");
    (kernel, appdata)
}

#[tokio::test]
async fn occupied_discover_port_fails_startup_cleanly() {
    let appdata = tempfile::tempdir().unwrap();
    // Another process holds the port.
    let holder = tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await.unwrap();
    let port = holder.local_addr().unwrap().port();

    let kernel = Kernel::new();
    let err = kernel
        .startup(appdata.path(), port, Arc::new(NullListener), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AddrInUse);

    // Nothing was written and the kernel still reports not-started.
    assert!(!appdata.path().join("Database").exists());
    assert_eq!(
        kernel.create_sync("docs").await.unwrap_err().kind(),
        ErrorKind::NotStartup
    );
    // The holder keeps its socket.
    drop(holder);
}

#[tokio::test]
async fn sync_and_tree_lifecycle() {
    let (kernel, _appdata) = started_kernel().await;

    let sync_id = kernel.create_sync("docs").await.unwrap();
    let infos = kernel.list_sync().await.unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].sync.name, "docs");

    // Tree creation validates the root.
    assert_eq!(
        kernel.create_tree(sync_id, "relative/path").await.unwrap_err().kind(),
        ErrorKind::BadPath
    );
    assert_eq!(
        kernel
            .create_tree(sync_id, "/definitely/not/here")
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::DirNoent
    );

    let root = tempfile::tempdir().unwrap();
    let tree_id = kernel
        .create_tree(sync_id, &root.path().display().to_string())
        .await
        .unwrap();

    // One local tree per sync per device.
    let root2 = tempfile::tempdir().unwrap();
    assert_eq!(
        kernel
            .create_tree(sync_id, &root2.path().display().to_string())
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::TreeExist
    );

    // Favorites behave like a selective-sync list.
    kernel.add_favorite(tree_id, "/photos/2024").await.unwrap();
    assert_eq!(
        kernel
            .add_favorite(tree_id, "/photos/2024/jan")
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::FavouriteExist
    );
    assert!(kernel.has_favorite(tree_id).await.unwrap());
    assert_eq!(
        kernel
            .get_favorite_status(tree_id, "/photos/2024")
            .await
            .unwrap(),
        PathType::Current
    );
    assert_eq!(
        kernel.get_favorite_status(tree_id, "/photos").await.unwrap(),
        PathType::Parent
    );
    kernel.del_favorite(tree_id, "/photos/2024").await.unwrap();
    assert_eq!(
        kernel
            .del_favorite(tree_id, "/photos/2024")
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::FavouriteNoent
    );

    // Blobs round-trip; garbage does not.
    let blob = kernel.export_sync(sync_id).await.unwrap();
    assert_eq!(kernel.import_sync(&blob).await.unwrap(), sync_id);
    assert_eq!(
        kernel.import_sync("not a blob").await.unwrap_err().kind(),
        ErrorKind::InvalidMsg
    );

    kernel.destroy_sync(sync_id).await.unwrap();
    assert_eq!(
        kernel.query_sync_info(sync_id).await.unwrap_err().kind(),
        ErrorKind::SyncNoent
    );

    kernel.shutdown().await.unwrap();
    assert_eq!(
        kernel.list_sync().await.unwrap_err().kind(),
        ErrorKind::NotStartup
    );
}

#[tokio::test]
async fn backup_lifecycle_and_creator_gates() {
    let (kernel, _appdata) = started_kernel().await;

    let root = tempfile::tempdir().unwrap();
    let backup_id = kernel
        .create_backup("nightly", &root.path().display().to_string())
        .await
        .unwrap();

    let backups = kernel.list_backup().await.unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].sync.name, "nightly");
    // Backups never show up in the ordinary listing.
    assert!(kernel.list_sync().await.unwrap().is_empty());

    // Unknown target device.
    assert_eq!(
        kernel
            .add_backup_target(backup_id, 999)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::DeviceNoent
    );

    kernel.destroy_backup(backup_id).await.unwrap();
    assert!(kernel.list_backup().await.unwrap().is_empty());

    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn discover_sessions_are_bounded() {
    let (kernel, _appdata) = started_kernel().await;

    let session = kernel.startup_discover_device().await.unwrap();
    assert!(kernel.get_discovered_device(session).await.unwrap().is_empty());
    kernel.shutdown_discover_device(session).await.unwrap();
    assert_eq!(
        kernel
            .get_discovered_device(session)
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::DiscoverNoent
    );

    let mut sessions = Vec::new();
    loop {
        match kernel.startup_discover_device().await {
            Ok(id) => sessions.push(id),
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::DiscoverLimit);
                break;
            }
        }
        assert!(sessions.len() <= 64, "limit never hit");
    }

    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn static_peers_round_trip() {
    use driftsync::store::StaticPeer;

    let (kernel, _appdata) = started_kernel().await;
    assert!(kernel.get_static_peers().await.unwrap().is_empty());

    let peer = StaticPeer {
        ip: "192.0.2.7".to_string(),
        port: 8848,
    };
    kernel.add_static_peers(&[peer.clone()]).await.unwrap();
    assert_eq!(kernel.get_static_peers().await.unwrap(), vec![peer.clone()]);
    kernel.save_static_peers().await.unwrap();

    kernel.delete_static_peers(&[peer]).await.unwrap();
    assert!(kernel.get_static_peers().await.unwrap().is_empty());

    kernel.shutdown().await.unwrap();
}

#[tokio::test]
async fn history_starts_empty_and_licensing_defaults_open() {
    let (kernel, _appdata) = started_kernel().await;

    assert!(kernel.query_history_info(0, 100).await.unwrap().is_empty());

    assert!(!kernel.verify_status().await.unwrap());
    kernel.bind("CDKEY-123").await.unwrap();
    assert!(kernel.verify_status().await.unwrap());
    let info = kernel.query_licences_info().await.unwrap();
    assert!(info.bound);
    assert_eq!(info.cdkey, "CDKEY-123");
    kernel.unbind().await.unwrap();
    assert!(!kernel.verify_status().await.unwrap());
    assert!(kernel.check_perm("share_readwrite").await.unwrap());

    kernel.shutdown().await.unwrap();
}
