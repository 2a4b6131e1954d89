//! Event notifier and per-tree status aggregation.
//!
//! Workers push status updates into a mailbox; a dedicated task folds them
//! into a per-tree board and forwards typed events to the registered
//! listener, at most once per tree per emission interval. Queries read the
//! board directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::clock::Clock;
use crate::constants::STATUS_EMIT_INTERVAL;

/// Direction of an in-flight transfer as shown in status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Upload,
    Download,
}

/// One in-flight transfer of a tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferItem {
    pub path: String,
    pub kind: TransferKind,
    pub bytes_done: i64,
    pub bytes_total: i64,
}

/// Aggregated status of one tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeStatus {
    pub tree_id: i64,
    pub is_indexing: bool,
    pub is_syncing: bool,
    pub transfer_list: Vec<TransferItem>,
}

/// Progress of one (local, remote) tree pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreePairStatus {
    pub local_tree_id: i64,
    pub remote_tree_id: i64,
    pub bytes_done: i64,
    pub bytes_total: i64,
}

/// Engine-level events forwarded to the listener.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A refresh task failed fatally for a tree.
    TreeIndexError { tree_id: i64, message: String },
    /// A file transfer exhausted its retries.
    TransferError { tree_id: i64, path: String },
    /// A sync pair finished (successfully or not).
    SyncFinished {
        local_tree_id: i64,
        remote_tree_id: i64,
        error: Option<String>,
    },
    /// A device changed reachability.
    DeviceStatusChanged { device_uuid: String, online: bool },
    /// A worker hit a fatal error and left its pool.
    WorkerTerminated { pool: &'static str },
}

/// Sink for engine events; implemented by the embedding application.
pub trait EventListener: Send + Sync {
    fn on_tree_status(&self, status: &TreeStatus);
    fn on_tree_pair_status(&self, status: &TreePairStatus);
    fn on_event(&self, event: &EngineEvent);
}

/// A listener that ignores everything (headless operation).
pub struct NullListener;

impl EventListener for NullListener {
    fn on_tree_status(&self, _status: &TreeStatus) {}
    fn on_tree_pair_status(&self, _status: &TreePairStatus) {}
    fn on_event(&self, _event: &EngineEvent) {}
}

/// Updates workers push into the mailbox.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Indexing {
        tree_id: i64,
        active: bool,
    },
    Syncing {
        tree_id: i64,
        active: bool,
    },
    Transfer {
        tree_id: i64,
        path: String,
        kind: TransferKind,
        bytes_done: i64,
        bytes_total: i64,
    },
    TransferDone {
        tree_id: i64,
        path: String,
    },
    PairProgress {
        local_tree_id: i64,
        remote_tree_id: i64,
        bytes_done: i64,
        bytes_total: i64,
    },
    Event(EngineEvent),
}

#[derive(Default)]
struct Board {
    trees: HashMap<i64, TreeStatus>,
    pairs: HashMap<(i64, i64), TreePairStatus>,
    last_emit_ms: HashMap<i64, u64>,
}

/// The event notifier.
pub struct EventNotifier {
    tx: mpsc::UnboundedSender<StatusUpdate>,
    board: Arc<Mutex<Board>>,
}

impl EventNotifier {
    /// Start the notifier task; updates flow to `listener`.
    pub fn start(listener: Arc<dyn EventListener>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<StatusUpdate>();
        let board = Arc::new(Mutex::new(Board::default()));

        let task_board = Arc::clone(&board);
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                Self::apply(&task_board, &listener, &clock, update);
            }
            debug!("Event notifier mailbox closed");
        });

        Arc::new(Self { tx, board })
    }

    /// Push one update; never blocks.
    pub fn update(&self, update: StatusUpdate) {
        let _ = self.tx.send(update);
    }

    /// Current status of a tree.
    pub fn tree_status(&self, tree_id: i64) -> TreeStatus {
        self.board
            .lock()
            .unwrap()
            .trees
            .get(&tree_id)
            .cloned()
            .unwrap_or(TreeStatus {
                tree_id,
                ..Default::default()
            })
    }

    /// Current progress of a pair.
    pub fn tree_pair_status(&self, local_tree_id: i64, remote_tree_id: i64) -> TreePairStatus {
        self.board
            .lock()
            .unwrap()
            .pairs
            .get(&(local_tree_id, remote_tree_id))
            .cloned()
            .unwrap_or(TreePairStatus {
                local_tree_id,
                remote_tree_id,
                ..Default::default()
            })
    }

    /// All in-flight transfers across trees.
    pub fn transfer_list(&self) -> Vec<(i64, TransferItem)> {
        let board = self.board.lock().unwrap();
        board
            .trees
            .values()
            .flat_map(|t| t.transfer_list.iter().map(|i| (t.tree_id, i.clone())))
            .collect()
    }

    fn apply(
        board: &Mutex<Board>,
        listener: &Arc<dyn EventListener>,
        clock: &Arc<dyn Clock>,
        update: StatusUpdate,
    ) {
        // Fold into the board under the lock, emit outside it.
        let emit: Option<TreeStatus>;
        let mut pair_emit: Option<TreePairStatus> = None;
        let mut event_emit: Option<EngineEvent> = None;
        {
            let mut board = board.lock().unwrap();
            let tree_id = match &update {
                StatusUpdate::Indexing { tree_id, .. }
                | StatusUpdate::Syncing { tree_id, .. }
                | StatusUpdate::Transfer { tree_id, .. }
                | StatusUpdate::TransferDone { tree_id, .. } => Some(*tree_id),
                StatusUpdate::PairProgress {
                    local_tree_id,
                    remote_tree_id,
                    bytes_done,
                    bytes_total,
                } => {
                    let status = TreePairStatus {
                        local_tree_id: *local_tree_id,
                        remote_tree_id: *remote_tree_id,
                        bytes_done: *bytes_done,
                        bytes_total: *bytes_total,
                    };
                    board
                        .pairs
                        .insert((*local_tree_id, *remote_tree_id), status.clone());
                    pair_emit = Some(status);
                    None
                }
                StatusUpdate::Event(event) => {
                    event_emit = Some(event.clone());
                    None
                }
            };

            let Some(tree_id) = tree_id else {
                drop(board);
                if let Some(status) = pair_emit {
                    listener.on_tree_pair_status(&status);
                }
                if let Some(event) = event_emit {
                    listener.on_event(&event);
                }
                return;
            };

            let entry = board.trees.entry(tree_id).or_insert_with(|| TreeStatus {
                tree_id,
                ..Default::default()
            });
            match update {
                StatusUpdate::Indexing { active, .. } => entry.is_indexing = active,
                StatusUpdate::Syncing { active, .. } => entry.is_syncing = active,
                StatusUpdate::Transfer {
                    path,
                    kind,
                    bytes_done,
                    bytes_total,
                    ..
                } => {
                    match entry.transfer_list.iter_mut().find(|i| i.path == path) {
                        Some(item) => {
                            item.bytes_done = bytes_done;
                            item.bytes_total = bytes_total;
                        }
                        None => entry.transfer_list.push(TransferItem {
                            path,
                            kind,
                            bytes_done,
                            bytes_total,
                        }),
                    }
                }
                StatusUpdate::TransferDone { path, .. } => {
                    entry.transfer_list.retain(|i| i.path != path);
                }
                _ => {}
            }

            // Rate-limit per tree.
            let now = clock.now_millis();
            let last = board.last_emit_ms.get(&tree_id).copied().unwrap_or(0);
            if now.saturating_sub(last) >= STATUS_EMIT_INTERVAL.as_millis() as u64 {
                board.last_emit_ms.insert(tree_id, now);
                emit = board.trees.get(&tree_id).cloned();
            } else {
                emit = None;
            }
        }
        if let Some(status) = emit {
            listener.on_tree_status(&status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        tree_emits: AtomicUsize,
        events: AtomicUsize,
    }

    impl EventListener for CountingListener {
        fn on_tree_status(&self, _status: &TreeStatus) {
            self.tree_emits.fetch_add(1, Ordering::SeqCst);
        }
        fn on_tree_pair_status(&self, _status: &TreePairStatus) {}
        fn on_event(&self, _event: &EngineEvent) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn board_folds_and_rate_limits() {
        let listener = Arc::new(CountingListener {
            tree_emits: AtomicUsize::new(0),
            events: AtomicUsize::new(0),
        });
        let clock = Arc::new(FixedClock::default());
        let notifier = EventNotifier::start(listener.clone(), clock.clone());

        notifier.update(StatusUpdate::Indexing {
            tree_id: 1,
            active: true,
        });
        // Same instant: folded but not emitted again.
        notifier.update(StatusUpdate::Syncing {
            tree_id: 1,
            active: true,
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let status = notifier.tree_status(1);
        assert!(status.is_indexing);
        assert!(status.is_syncing);
        assert_eq!(listener.tree_emits.load(Ordering::SeqCst), 1);

        // Advancing the clock past the interval allows the next emission.
        clock.advance(200);
        notifier.update(StatusUpdate::Indexing {
            tree_id: 1,
            active: false,
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(listener.tree_emits.load(Ordering::SeqCst), 2);
        assert!(!notifier.tree_status(1).is_indexing);
    }

    #[tokio::test]
    async fn transfers_join_and_leave_the_list() {
        let listener = Arc::new(CountingListener {
            tree_emits: AtomicUsize::new(0),
            events: AtomicUsize::new(0),
        });
        let clock = Arc::new(FixedClock::default());
        let notifier = EventNotifier::start(listener, clock.clone());

        notifier.update(StatusUpdate::Transfer {
            tree_id: 7,
            path: "/a.bin".into(),
            kind: TransferKind::Download,
            bytes_done: 10,
            bytes_total: 100,
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(notifier.tree_status(7).transfer_list.len(), 1);
        assert_eq!(notifier.transfer_list().len(), 1);

        notifier.update(StatusUpdate::TransferDone {
            tree_id: 7,
            path: "/a.bin".into(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(notifier.tree_status(7).transfer_list.is_empty());
    }
}
