//! Data-port transfer server and client.
//!
//! File contents move over a dedicated TCP port: a session head names the
//! tree pair and the files, then raw bytes follow per file. The receiver
//! digests the stream as it lands and discards mismatches; failed files
//! retry with exponential backoff. A task registry backs the standalone
//! download/upload API, and a capped cache directory holds partial and
//! on-demand downloads.

mod errors;

pub use errors::TransferError;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::Config;
use crate::constants::TRANSFER_MAX_ATTEMPTS;
use crate::crypto::{self, Sha1Stream};
use crate::events::{EventNotifier, StatusUpdate, TransferKind};
use crate::proto::{TransferDirection, TransferFileHead, TransferHead};
use crate::store::{DeviceStatus, MetaStore, fix_path};
use crate::Result;

const STREAM_CHUNK: usize = 64 * 1024;

async fn bind_data_listener(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            TransferError::AddrInUse { port }.into()
        } else {
            TransferError::Bind {
                port,
                reason: e.to_string(),
            }
            .into()
        }
    })
}

/// Addressing for one tree pair's content channel.
#[derive(Debug, Clone)]
pub struct TreePair {
    pub sync_uuid: String,
    pub local_tree_id: i64,
    pub local_tree_uuid: String,
    pub local_root: PathBuf,
    pub remote_tree_uuid: String,
    pub remote_host: String,
    pub remote_data_port: u16,
}

/// Lifecycle of a standalone download/upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Done,
    Failed,
}

/// Queryable progress of a task.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub state: TaskState,
    pub bytes_done: i64,
    pub bytes_total: i64,
    /// Where the downloaded content landed (cache path).
    pub target: PathBuf,
}

struct TaskEntry {
    status: TaskStatus,
    handle: Option<JoinHandle<()>>,
    finished_at: Option<i64>,
}

/// The transfer server.
pub struct TransferServer {
    store: Arc<MetaStore>,
    config: Arc<Config>,
    events: Arc<EventNotifier>,
    cache_dir: PathBuf,
    listener_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    tasks: Arc<Mutex<HashMap<i64, TaskEntry>>>,
    next_task_id: AtomicI64,
    /// Bytes per second; 0 means unlimited.
    upload_limit: AtomicI64,
    download_limit: AtomicI64,
    /// Bytes currently held in the cache directory.
    cache_used: AtomicI64,
    file_slots: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
}

impl TransferServer {
    /// Bind the data port and start accepting sessions.
    pub async fn start(
        store: Arc<MetaStore>,
        config: Arc<Config>,
        events: Arc<EventNotifier>,
        cache_dir: PathBuf,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&cache_dir).await?;
        let port = config.data_port();
        let listener = bind_data_listener(port).await?;
        info!(port, "Data listener bound");

        let server = Arc::new(Self {
            store,
            file_slots: Arc::new(Semaphore::new(config.transfer_threads())),
            config,
            events,
            cache_dir,
            listener_handle: std::sync::Mutex::new(None),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_task_id: AtomicI64::new(1),
            upload_limit: AtomicI64::new(0),
            download_limit: AtomicI64::new(0),
            cache_used: AtomicI64::new(0),
            shutdown,
        });

        let accept = Arc::clone(&server).accept_loop(listener);
        *server.listener_handle.lock().unwrap() =
            Some(tokio::spawn(accept.instrument(info_span!("data_accept"))));
        Ok(server)
    }

    /// Rebind the data port; the old listener stays on failure.
    pub async fn set_port(self: &Arc<Self>, port: u16) -> Result<()> {
        let listener = bind_data_listener(port).await?;
        let accept = Arc::clone(self).accept_loop(listener);
        let new_handle = tokio::spawn(accept.instrument(info_span!("data_accept")));
        if let Some(old) = self.listener_handle.lock().unwrap().replace(new_handle) {
            old.abort();
        }
        info!(port, "Data listener rebound");
        Ok(())
    }

    /// Set the outbound rate limit in bytes per second (0 = unlimited).
    pub fn set_upload_limit(&self, bytes_per_s: i64) {
        self.upload_limit.store(bytes_per_s.max(0), Ordering::Relaxed);
    }

    /// Set the inbound rate limit in bytes per second (0 = unlimited).
    pub fn set_download_limit(&self, bytes_per_s: i64) {
        self.download_limit
            .store(bytes_per_s.max(0), Ordering::Relaxed);
    }

    /// Shrink the cache cap, evicting oldest-completed tasks until the
    /// held bytes fit, then persist the new cap.
    pub async fn set_download_cache_volume(&self, volume: i64) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        while self.cache_used.load(Ordering::Relaxed) > volume {
            // Oldest completed task goes first.
            let victim = tasks
                .iter()
                .filter(|(_, t)| t.status.state != TaskState::Running)
                .min_by_key(|(_, t)| t.finished_at.unwrap_or(i64::MAX))
                .map(|(id, _)| *id);
            let Some(id) = victim else { break };
            if let Some(entry) = tasks.remove(&id) {
                let freed = entry.status.bytes_done;
                let _ = tokio::fs::remove_file(&entry.status.target).await;
                self.cache_used.fetch_sub(freed, Ordering::Relaxed);
                debug!(task = id, freed, "Evicted completed download");
            }
        }
        drop(tasks);
        self.config.set_download_cache_volume(volume).await
    }

    // Engine-facing bulk operations -------------------------------------

    /// Upload the listed local files to the remote tree. Returns the paths
    /// that made it across.
    pub async fn put(&self, pair: &TreePair, files: &[TransferFileHead]) -> Result<Vec<String>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let addr = format!("{}:{}", pair.remote_host, pair.remote_data_port);
        let mut stream = connect_data(&addr).await?;

        let head = TransferHead {
            direction: TransferDirection::Put,
            sync_uuid: pair.sync_uuid.clone(),
            local_tree_uuid: pair.local_tree_uuid.clone(),
            remote_tree_uuid: pair.remote_tree_uuid.clone(),
            files: files.to_vec(),
        };
        write_json(&mut stream, &head).await?;

        let mut sent = Vec::new();
        for file in files {
            let _slot = self.file_slots.acquire().await.expect("semaphore open");
            let abs = local_path(&pair.local_root, &file.path);
            match self
                .stream_file_out(&mut stream, &abs, file, pair.local_tree_id)
                .await
            {
                Ok(()) => sent.push(file.path.clone()),
                Err(e) => {
                    warn!(path = %file.path, "Upload failed: {e}");
                    break;
                }
            }
        }
        Ok(sent)
    }

    /// Download the listed files from the remote tree into the local root.
    /// Each file retries with backoff; hard failures are reported per path.
    pub async fn get(&self, pair: &TreePair, files: &[TransferFileHead]) -> Result<Vec<String>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }
        let mut applied = Vec::new();
        for file in files {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match self.get_one(pair, file).await {
                    Ok(()) => {
                        applied.push(file.path.clone());
                        break;
                    }
                    Err(e) if attempt < TRANSFER_MAX_ATTEMPTS && is_retryable(&e) => {
                        let backoff = Duration::from_secs(1 << attempt.min(5));
                        debug!(path = %file.path, attempt, "Retrying download in {backoff:?}: {e}");
                        tokio::time::sleep(backoff).await;
                    }
                    Err(e) => {
                        warn!(path = %file.path, attempt, "Download failed: {e}");
                        self.events.update(StatusUpdate::Event(
                            crate::events::EngineEvent::TransferError {
                                tree_id: pair.local_tree_id,
                                path: file.path.clone(),
                            },
                        ));
                        break;
                    }
                }
            }
        }
        Ok(applied)
    }

    async fn get_one(&self, pair: &TreePair, file: &TransferFileHead) -> Result<()> {
        let _slot = self.file_slots.acquire().await.expect("semaphore open");
        let addr = format!("{}:{}", pair.remote_host, pair.remote_data_port);
        let mut stream = connect_data(&addr).await?;

        let head = TransferHead {
            direction: TransferDirection::Get,
            sync_uuid: pair.sync_uuid.clone(),
            local_tree_uuid: pair.local_tree_uuid.clone(),
            remote_tree_uuid: pair.remote_tree_uuid.clone(),
            files: vec![file.clone()],
        };
        write_json(&mut stream, &head).await?;

        // The responder echoes the authoritative file head, then the bytes.
        let actual: TransferFileHead = read_json(&mut stream).await?;
        let target = local_path(&pair.local_root, &file.path);
        let temp = temp_path(&target);
        if let Some(parent) = temp.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let result = self
            .receive_body(
                &mut stream,
                &temp,
                &actual,
                pair.local_tree_id,
                TransferKind::Download,
            )
            .await;
        match result {
            Ok(()) => {
                tokio::fs::rename(&temp, &target).await?;
                self.events.update(StatusUpdate::TransferDone {
                    tree_id: pair.local_tree_id,
                    path: file.path.clone(),
                });
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                self.events.update(StatusUpdate::TransferDone {
                    tree_id: pair.local_tree_id,
                    path: file.path.clone(),
                });
                Err(e)
            }
        }
    }

    // Standalone task API -------------------------------------------------

    /// Start a background download of one file into the cache.
    pub async fn startup_download(
        self: &Arc<Self>,
        sync_uuid: &str,
        rel_path: &str,
    ) -> Result<i64> {
        let rel_path = fix_path(rel_path);
        let source = self.find_source(sync_uuid).await?;
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cache_name = crypto::sha1_hex(format!("{sync_uuid}{rel_path}").as_bytes());
        let target = self.cache_dir.join(cache_name);

        let status = TaskStatus {
            state: TaskState::Running,
            bytes_done: 0,
            bytes_total: 0,
            target: target.clone(),
        };

        // Register before spawning so the task always finds its entry.
        self.tasks.lock().await.insert(
            task_id,
            TaskEntry {
                status,
                handle: None,
                finished_at: None,
            },
        );

        let server = Arc::clone(self);
        let sync_uuid = sync_uuid.to_string();
        let handle = tokio::spawn(
            async move {
                let result = server
                    .run_download_task(task_id, &sync_uuid, &rel_path, source, &target)
                    .await;
                let mut tasks = server.tasks.lock().await;
                if let Some(entry) = tasks.get_mut(&task_id) {
                    entry.status.state = match result {
                        Ok(()) => TaskState::Done,
                        Err(ref e) => {
                            warn!(task = task_id, "Download task failed: {e}");
                            TaskState::Failed
                        }
                    };
                    entry.finished_at = Some(chrono::Utc::now().timestamp());
                    entry.handle = None;
                }
            }
            .instrument(info_span!("download_task", task = task_id)),
        );
        if let Some(entry) = self.tasks.lock().await.get_mut(&task_id) {
            if entry.status.state == TaskState::Running {
                entry.handle = Some(handle);
            }
        }
        Ok(task_id)
    }

    /// Start a background upload of one local-tree file to a peer holding
    /// the sync.
    pub async fn startup_upload(
        self: &Arc<Self>,
        sync_uuid: &str,
        rel_path: &str,
        local_abs: PathBuf,
    ) -> Result<i64> {
        let rel_path = fix_path(rel_path);
        let source = self.find_source(sync_uuid).await?;
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);

        let status = TaskStatus {
            state: TaskState::Running,
            bytes_done: 0,
            bytes_total: 0,
            target: local_abs.clone(),
        };

        // Register before spawning so the task always finds its entry.
        self.tasks.lock().await.insert(
            task_id,
            TaskEntry {
                status,
                handle: None,
                finished_at: None,
            },
        );

        let server = Arc::clone(self);
        let sync_uuid = sync_uuid.to_string();
        let handle = tokio::spawn(
            async move {
                let result = server
                    .run_upload_task(task_id, &sync_uuid, &rel_path, source, &local_abs)
                    .await;
                let mut tasks = server.tasks.lock().await;
                if let Some(entry) = tasks.get_mut(&task_id) {
                    entry.status.state = match result {
                        Ok(()) => TaskState::Done,
                        Err(ref e) => {
                            warn!(task = task_id, "Upload task failed: {e}");
                            TaskState::Failed
                        }
                    };
                    entry.finished_at = Some(chrono::Utc::now().timestamp());
                    entry.handle = None;
                }
            }
            .instrument(info_span!("upload_task", task = task_id)),
        );
        if let Some(entry) = self.tasks.lock().await.get_mut(&task_id) {
            if entry.status.state == TaskState::Running {
                entry.handle = Some(handle);
            }
        }
        Ok(task_id)
    }

    async fn run_upload_task(
        self: &Arc<Self>,
        task_id: i64,
        sync_uuid: &str,
        rel_path: &str,
        source: (String, u16, String),
        local_abs: &Path,
    ) -> Result<()> {
        let (host, data_port, remote_tree_uuid) = source;
        let body = tokio::fs::read(local_abs).await?;
        let meta = tokio::fs::metadata(local_abs).await?;
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(entry) = tasks.get_mut(&task_id) {
                entry.status.bytes_total = body.len() as i64;
            }
        }

        let addr = format!("{host}:{data_port}");
        let mut stream = connect_data(&addr).await?;
        let file = TransferFileHead {
            path: rel_path.to_string(),
            length: body.len() as i64,
            sha1: crypto::sha1_hex(&body),
            mtime: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
            unix_attr: 0,
            win_attr: 0,
        };
        let head = TransferHead {
            direction: TransferDirection::Put,
            sync_uuid: sync_uuid.to_string(),
            local_tree_uuid: String::new(),
            remote_tree_uuid,
            files: vec![file],
        };
        write_json(&mut stream, &head).await?;

        let limit = self.upload_limit.load(Ordering::Relaxed);
        for chunk in body.chunks(STREAM_CHUNK) {
            stream.write_all(chunk).await?;
            let mut tasks = self.tasks.lock().await;
            if let Some(entry) = tasks.get_mut(&task_id) {
                entry.status.bytes_done += chunk.len() as i64;
            }
            drop(tasks);
            self.throttle(limit, chunk.len()).await;
        }
        stream.flush().await?;
        Ok(())
    }

    /// Abort (or forget) a download task, dropping its cache file.
    pub async fn shutdown_download(&self, task_id: i64) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let entry = tasks
            .remove(&task_id)
            .ok_or(TransferError::TaskNotFound { task_id })?;
        if let Some(handle) = entry.handle {
            handle.abort();
        }
        self.cache_used
            .fetch_sub(entry.status.bytes_done, Ordering::Relaxed);
        let _ = tokio::fs::remove_file(&entry.status.target).await;
        Ok(())
    }

    /// Abort (or forget) an upload task.
    ///
    /// An upload's `target` is the caller's own source file and its bytes
    /// never enter the cache, so neither is touched here.
    pub async fn shutdown_upload(&self, task_id: i64) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let entry = tasks
            .remove(&task_id)
            .ok_or(TransferError::TaskNotFound { task_id })?;
        if let Some(handle) = entry.handle {
            handle.abort();
        }
        Ok(())
    }

    /// Progress of a download/upload task.
    pub async fn query_task(&self, task_id: i64) -> Result<TaskStatus> {
        self.tasks
            .lock()
            .await
            .get(&task_id)
            .map(|e| e.status.clone())
            .ok_or_else(|| TransferError::TaskNotFound { task_id }.into())
    }

    async fn run_download_task(
        self: &Arc<Self>,
        task_id: i64,
        sync_uuid: &str,
        rel_path: &str,
        source: (String, u16, String),
        target: &Path,
    ) -> Result<()> {
        let (host, data_port, remote_tree_uuid) = source;
        let addr = format!("{host}:{data_port}");
        let mut stream = connect_data(&addr).await?;

        let want = TransferFileHead {
            path: rel_path.to_string(),
            length: 0,
            sha1: String::new(),
            mtime: 0,
            unix_attr: 0,
            win_attr: 0,
        };
        let head = TransferHead {
            direction: TransferDirection::Get,
            sync_uuid: sync_uuid.to_string(),
            local_tree_uuid: String::new(),
            remote_tree_uuid,
            files: vec![want],
        };
        write_json(&mut stream, &head).await?;
        let actual: TransferFileHead = read_json(&mut stream).await?;

        {
            let mut tasks = self.tasks.lock().await;
            if let Some(entry) = tasks.get_mut(&task_id) {
                entry.status.bytes_total = actual.length;
            }
        }

        let temp = temp_path(target);
        let mut hasher = Sha1Stream::new();
        let mut file = tokio::fs::File::create(&temp).await?;
        let mut remaining = actual.length;
        let mut buf = vec![0u8; STREAM_CHUNK];
        while remaining > 0 {
            let want = remaining.min(STREAM_CHUNK as i64) as usize;
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(TransferError::Rejected {
                    reason: "stream ended early".to_string(),
                }
                .into());
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            remaining -= n as i64;
            self.cache_used.fetch_add(n as i64, Ordering::Relaxed);
            let mut tasks = self.tasks.lock().await;
            if let Some(entry) = tasks.get_mut(&task_id) {
                entry.status.bytes_done += n as i64;
            }
            drop(tasks);
            self.throttle(self.download_limit.load(Ordering::Relaxed), n)
                .await;
        }
        file.flush().await?;
        drop(file);

        let digest = hasher.finish_hex();
        if !actual.sha1.is_empty() && digest != actual.sha1 {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(TransferError::DigestMismatch {
                path: rel_path.to_string(),
                expected: actual.sha1,
                actual: digest,
            }
            .into());
        }
        tokio::fs::rename(&temp, target).await?;
        Ok(())
    }

    /// Pick a reachable source device for a sync: any online non-local
    /// device holding a tree of it.
    async fn find_source(&self, sync_uuid: &str) -> Result<(String, u16, String)> {
        let sync = self
            .store
            .sync_by_uuid(sync_uuid)
            .await?
            .ok_or_else(|| TransferError::NoSource {
                sync_uuid: sync_uuid.to_string(),
            })?;
        for tree in self.store.trees_of_sync(sync.id).await? {
            if tree.device_id == crate::constants::LOCAL_DEVICE_ID {
                continue;
            }
            let Some(device) = self.store.device_by_id(tree.device_id).await? else {
                continue;
            };
            if device.status != DeviceStatus::Online {
                continue;
            }
            if let Some(ip) = self.store.device_ips(device.id).await?.first() {
                return Ok((ip.ip.clone(), device.data_port as u16, tree.uuid));
            }
        }
        Err(TransferError::NoSource {
            sync_uuid: sync_uuid.to_string(),
        }
        .into())
    }

    // Server side ---------------------------------------------------------

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Data accept failed: {e}");
                        continue;
                    }
                },
                _ = shutdown.recv() => break,
            };
            let server = Arc::clone(&self);
            tokio::spawn(
                async move {
                    if let Err(e) = server.serve_session(stream).await {
                        debug!(peer = %peer, "Data session ended: {e}");
                    }
                }
                .instrument(info_span!("data_conn", peer = %peer)),
            );
        }
        info!("Data accept loop stopped");
    }

    async fn serve_session(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let head: TransferHead = read_json(&mut stream).await?;
        // The peer's "remote" tree is our local one.
        let tree = self
            .store
            .tree_by_uuid(&head.remote_tree_uuid)
            .await?
            .ok_or(TransferError::Rejected {
                reason: format!("unknown tree {}", head.remote_tree_uuid),
            })?;
        let root = PathBuf::from(&tree.root);

        match head.direction {
            // Peer pushes content at us.
            TransferDirection::Put => {
                for file in &head.files {
                    let target = local_path(&root, &file.path);
                    let temp = temp_path(&target);
                    if let Some(parent) = temp.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    match self
                        .receive_body(&mut stream, &temp, file, tree.id, TransferKind::Download)
                        .await
                    {
                        Ok(()) => {
                            tokio::fs::rename(&temp, &target).await?;
                            self.events.update(StatusUpdate::TransferDone {
                                tree_id: tree.id,
                                path: file.path.clone(),
                            });
                        }
                        Err(e) => {
                            let _ = tokio::fs::remove_file(&temp).await;
                            return Err(e);
                        }
                    }
                }
            }
            // Peer pulls content from us.
            TransferDirection::Get => {
                for file in &head.files {
                    let abs = local_path(&root, &file.path);
                    let meta = tokio::fs::metadata(&abs).await?;
                    let body = tokio::fs::read(&abs).await?;
                    let actual = TransferFileHead {
                        path: file.path.clone(),
                        length: meta.len() as i64,
                        sha1: crypto::sha1_hex(&body),
                        mtime: meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                            .map(|d| d.as_secs() as i64)
                            .unwrap_or(0),
                        unix_attr: 0,
                        win_attr: 0,
                    };
                    write_json(&mut stream, &actual).await?;
                    self.send_bytes(&mut stream, &body, tree.id, &file.path)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn stream_file_out(
        &self,
        stream: &mut TcpStream,
        abs: &Path,
        file: &TransferFileHead,
        tree_id: i64,
    ) -> Result<()> {
        let body = tokio::fs::read(abs).await?;
        self.send_bytes(stream, &body, tree_id, &file.path).await
    }

    async fn send_bytes(
        &self,
        stream: &mut TcpStream,
        body: &[u8],
        tree_id: i64,
        path: &str,
    ) -> Result<()> {
        let total = body.len() as i64;
        let mut done = 0i64;
        for chunk in body.chunks(STREAM_CHUNK) {
            stream.write_all(chunk).await?;
            done += chunk.len() as i64;
            self.events.update(StatusUpdate::Transfer {
                tree_id,
                path: path.to_string(),
                kind: TransferKind::Upload,
                bytes_done: done,
                bytes_total: total,
            });
            self.throttle(self.upload_limit.load(Ordering::Relaxed), chunk.len())
                .await;
        }
        stream.flush().await?;
        self.events.update(StatusUpdate::TransferDone {
            tree_id,
            path: path.to_string(),
        });
        Ok(())
    }

    /// Receive exactly `file.length` bytes into `temp`, digesting as they
    /// arrive. A digest mismatch removes the temp file.
    async fn receive_body(
        &self,
        stream: &mut TcpStream,
        temp: &Path,
        file: &TransferFileHead,
        tree_id: i64,
        kind: TransferKind,
    ) -> Result<()> {
        let mut hasher = Sha1Stream::new();
        let mut out = tokio::fs::File::create(temp).await?;
        let mut remaining = file.length;
        let mut buf = vec![0u8; STREAM_CHUNK];
        let mut done = 0i64;
        while remaining > 0 {
            let want = remaining.min(STREAM_CHUNK as i64) as usize;
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(TransferError::Rejected {
                    reason: "stream ended early".to_string(),
                }
                .into());
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            remaining -= n as i64;
            done += n as i64;
            self.events.update(StatusUpdate::Transfer {
                tree_id,
                path: file.path.clone(),
                kind,
                bytes_done: done,
                bytes_total: file.length,
            });
            self.throttle(self.download_limit.load(Ordering::Relaxed), n)
                .await;
        }
        out.flush().await?;
        drop(out);

        let digest = hasher.finish_hex();
        if !file.sha1.is_empty() && digest != file.sha1 {
            return Err(TransferError::DigestMismatch {
                path: file.path.clone(),
                expected: file.sha1.clone(),
                actual: digest,
            }
            .into());
        }
        Ok(())
    }

    async fn throttle(&self, limit_bytes_per_s: i64, just_sent: usize) {
        if limit_bytes_per_s > 0 {
            let pause = Duration::from_secs_f64(just_sent as f64 / limit_bytes_per_s as f64);
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
    }
}

fn is_retryable(error: &crate::Error) -> bool {
    match error {
        crate::Error::Transfer(e) => e.is_transient(),
        crate::Error::Io(_) => true,
        _ => false,
    }
}

fn local_path(root: &Path, fixed: &str) -> PathBuf {
    root.join(fixed.trim_start_matches('/'))
}

fn temp_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "part".to_string());
    name.push_str(".part");
    target.with_file_name(format!(".{name}"))
}

async fn connect_data(addr: &str) -> Result<TcpStream> {
    TcpStream::connect(addr).await.map_err(|e| {
        TransferError::ConnectFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

async fn write_json<T: serde::Serialize>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    stream
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(stream: &mut TcpStream) -> Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > 4 * 1024 * 1024 {
        return Err(TransferError::Rejected {
            reason: format!("oversized head: {len}"),
        }
        .into());
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_is_hidden_sibling() {
        let t = temp_path(Path::new("/root/dir/file.bin"));
        assert_eq!(t, Path::new("/root/dir/.file.bin.part"));
    }

    #[test]
    fn local_path_strips_leading_slash() {
        assert_eq!(
            local_path(Path::new("/data"), "/a/b.txt"),
            Path::new("/data/a/b.txt")
        );
    }
}
