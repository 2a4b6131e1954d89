//! Change-notification registry.
//!
//! Observers subscribe to a URI prefix; after a mutation commits, the store
//! pushes the changed URI into every matching subscriber's channel. Delivery
//! to one subscriber is serialized by its channel; ordering between
//! subscribers is unspecified.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::mpsc;

use super::uri::Uri;

struct Subscription {
    id: u64,
    prefix: Uri,
    recursive: bool,
    tx: mpsc::UnboundedSender<Uri>,
}

/// Registry of URI-prefix subscriptions.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    subs: Mutex<Vec<Subscription>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription; the handle unsubscribes on drop.
    pub fn register(self: &Arc<Self>, prefix: Uri, recursive: bool) -> ObserverHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().unwrap().push(Subscription {
            id,
            prefix,
            recursive,
            tx,
        });
        ObserverHandle {
            id,
            rx,
            registry: Arc::clone(self),
        }
    }

    fn unregister(&self, id: u64) {
        self.subs.lock().unwrap().retain(|s| s.id != id);
    }

    /// Deliver `uri` to every matching subscriber.
    pub fn notify(&self, uri: &Uri) {
        let subs = self.subs.lock().unwrap();
        for sub in subs.iter() {
            let matches = if sub.recursive {
                uri.is_under(&sub.prefix)
            } else {
                *uri == sub.prefix
            };
            if matches {
                // A closed receiver is cleaned up when its handle drops.
                let _ = sub.tx.send(uri.clone());
            }
        }
    }
}

/// Live subscription to store change notifications.
pub struct ObserverHandle {
    id: u64,
    rx: mpsc::UnboundedReceiver<Uri>,
    registry: Arc<ObserverRegistry>,
}

impl ObserverHandle {
    /// Wait for the next changed URI. Returns None if the registry is gone.
    pub async fn changed(&mut self) -> Option<Uri> {
        self.rx.recv().await
    }

    /// Non-blocking poll for a pending notification.
    pub fn try_changed(&mut self) -> Option<Uri> {
        self.rx.try_recv().ok()
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_and_exact_matching() {
        let registry = Arc::new(ObserverRegistry::new());
        let mut exact = registry.register(Uri::tree_file("abc"), false);
        let mut all = registry.register(Uri::tree_file_root(), true);

        registry.notify(&Uri::tree_file("abc"));
        registry.notify(&Uri::tree_file("def"));
        registry.notify(&Uri::device());

        assert_eq!(exact.try_changed(), Some(Uri::tree_file("abc")));
        assert_eq!(exact.try_changed(), None);

        assert_eq!(all.try_changed(), Some(Uri::tree_file("abc")));
        assert_eq!(all.try_changed(), Some(Uri::tree_file("def")));
        assert_eq!(all.try_changed(), None);
    }

    #[test]
    fn drop_unsubscribes() {
        let registry = Arc::new(ObserverRegistry::new());
        let handle = registry.register(Uri::device(), false);
        assert_eq!(registry.subs.lock().unwrap().len(), 1);
        drop(handle);
        assert_eq!(registry.subs.lock().unwrap().len(), 0);
    }
}
