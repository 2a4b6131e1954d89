//! Sync worker pool.
//!
//! Each request names a (local tree, remote tree) pair. A worker takes an
//! exclusive lease on the pair (duplicates coalesce onto the in-flight
//! run) and drives the pair through fetch, reconcile, apply and transfer.
//! An abort set keyed by pair cancels runs at their suspension points;
//! disabling a tree aborts every pair referencing it.

mod errors;
mod reconcile;
mod worker;

pub use errors::SyncError;
pub use reconcile::{
    PairRole, ReconcileAction, ReconcileContext, conflict_name, reconcile_path,
};

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{Instrument, debug, info_span, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::events::EventNotifier;
use crate::store::{MetaStore, PlainStore};
use crate::transfer::TransferServer;
use crate::Result;

/// One sync request for a tree pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub local_tree_id: i64,
    pub remote_tree_id: i64,
    pub is_manual: bool,
}

impl SyncRequest {
    fn pair(&self) -> (i64, i64) {
        (self.local_tree_id, self.remote_tree_id)
    }
}

/// Cancellation flags for in-flight pairs.
#[derive(Default)]
pub struct AbortSet {
    pairs: StdMutex<HashSet<(i64, i64)>>,
    trees: StdMutex<HashSet<i64>>,
}

impl AbortSet {
    /// Abort one pair.
    pub fn abort_pair(&self, pair: (i64, i64)) {
        self.pairs.lock().unwrap().insert(pair);
    }

    /// Abort every pair referencing a tree (tree disabled).
    pub fn abort_tree(&self, tree_id: i64) {
        self.trees.lock().unwrap().insert(tree_id);
    }

    /// Re-allow a tree's pairs (tree re-enabled).
    pub fn allow_tree(&self, tree_id: i64) {
        self.trees.lock().unwrap().remove(&tree_id);
    }

    /// Clear one pair's flag (manual request).
    pub fn clear_pair(&self, pair: (i64, i64)) {
        self.pairs.lock().unwrap().remove(&pair);
    }

    /// Whether a pair should stop at its next suspension point.
    pub fn is_aborted(&self, pair: (i64, i64)) -> bool {
        if self.pairs.lock().unwrap().contains(&pair) {
            return true;
        }
        let trees = self.trees.lock().unwrap();
        trees.contains(&pair.0) || trees.contains(&pair.1)
    }
}

/// Everything a sync worker needs.
pub struct SyncDeps {
    pub store: Arc<MetaStore>,
    pub plain: Arc<PlainStore>,
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<EventNotifier>,
    pub transfer: Arc<TransferServer>,
}

/// Handle to the sync pool.
pub struct SyncPool {
    tx: mpsc::Sender<SyncRequest>,
    leases: Arc<StdMutex<HashSet<(i64, i64)>>>,
    aborts: Arc<AbortSet>,
}

impl SyncPool {
    /// Spawn the worker tasks.
    pub fn start(deps: Arc<SyncDeps>, shutdown: broadcast::Sender<()>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<SyncRequest>(128);
        let leases = Arc::new(StdMutex::new(HashSet::new()));
        let aborts = Arc::new(AbortSet::default());
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..deps.config.sync_workers() {
            let rx = Arc::clone(&rx);
            let deps = Arc::clone(&deps);
            let leases = Arc::clone(&leases);
            let aborts = Arc::clone(&aborts);
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(
                async move {
                    loop {
                        let request = tokio::select! {
                            request = async { rx.lock().await.recv().await } => request,
                            _ = shutdown_rx.recv() => break,
                        };
                        let Some(request) = request else { break };
                        let worker = worker::SyncWorker::new(&deps, &aborts);
                        let result = worker.run(request).await;
                        leases.lock().unwrap().remove(&request.pair());
                        if let Err(e) = result {
                            if e.is_fatal() {
                                // Leave the pool; the kernel keeps running
                                // with reduced capacity.
                                deps.events.update(crate::events::StatusUpdate::Event(
                                    crate::events::EngineEvent::WorkerTerminated {
                                        pool: "sync",
                                    },
                                ));
                                warn!("Sync worker terminating on fatal error: {e}");
                                break;
                            }
                            if !matches!(&e, crate::Error::Sync(s) if s.is_aborted()) {
                                warn!(
                                    local = request.local_tree_id,
                                    remote = request.remote_tree_id,
                                    "Sync pair failed: {e}"
                                );
                            }
                        }
                    }
                    debug!("Sync worker exiting");
                }
                .instrument(info_span!("sync_worker", worker = worker_id)),
            );
        }

        Arc::new(Self { tx, leases, aborts })
    }

    /// Enqueue a pair. Duplicate requests coalesce onto the in-flight
    /// lease; returns false when coalesced.
    pub async fn enqueue(&self, request: SyncRequest) -> Result<bool> {
        if request.is_manual {
            self.aborts.clear_pair(request.pair());
        }
        {
            let mut leases = self.leases.lock().unwrap();
            if !leases.insert(request.pair()) {
                return Ok(false);
            }
        }
        if self.tx.send(request).await.is_err() {
            self.leases.lock().unwrap().remove(&request.pair());
            return Err(SyncError::PoolClosed.into());
        }
        Ok(true)
    }

    /// The shared abort set.
    pub fn aborts(&self) -> Arc<AbortSet> {
        Arc::clone(&self.aborts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_set_semantics() {
        let aborts = AbortSet::default();
        assert!(!aborts.is_aborted((1, 2)));

        aborts.abort_pair((1, 2));
        assert!(aborts.is_aborted((1, 2)));
        assert!(!aborts.is_aborted((1, 3)));

        aborts.clear_pair((1, 2));
        assert!(!aborts.is_aborted((1, 2)));

        aborts.abort_tree(7);
        assert!(aborts.is_aborted((7, 9)));
        assert!(aborts.is_aborted((3, 7)));
        aborts.allow_tree(7);
        assert!(!aborts.is_aborted((7, 9)));
    }
}
