//! Observable local state
//!
//! [`StateStore`] owns the [`Reconciler`] and publishes a fresh collection
//! snapshot and recomputed [`UnreadCounts`] after every mutation. It is
//! constructed per signed-in session and shared by reference; there is no
//! process-wide instance.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::counter::{self, UnreadCounts};
use crate::reconcile::{ApplyOutcome, Collection, Reconciler};
use crate::types::{ChangeEvent, Domain, Record};

/// Reconciled collections plus change notification
pub struct StateStore {
    reconciler: Mutex<Reconciler>,
    collections: BTreeMap<Domain, watch::Sender<Arc<Collection>>>,
    counts: watch::Sender<UnreadCounts>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        let collections = Domain::ALL
            .iter()
            .map(|domain| (*domain, watch::channel(Arc::new(Collection::default())).0))
            .collect();
        let (counts, _) = watch::channel(counter::recompute(std::iter::empty()));

        Self {
            reconciler: Mutex::new(Reconciler::new()),
            collections,
            counts,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Reconciler> {
        self.reconciler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge one change event; observers are notified if the collection changed.
    pub fn apply(&self, event: ChangeEvent) -> ApplyOutcome {
        let domain = event.domain;
        let mut reconciler = self.lock();
        let before = reconciler.revision(domain);
        let outcome = reconciler.apply(event);
        if reconciler.revision(domain) != before {
            self.publish(&reconciler, domain);
        }
        outcome
    }

    /// Log changes to `domain` until its reload lands or is aborted
    pub fn begin_reload(&self, domain: Domain) {
        self.lock().begin_reload(domain);
    }

    pub fn abort_reload(&self, domain: Domain) {
        self.lock().abort_reload(domain);
    }

    /// Authoritative wholesale replace of one domain
    pub fn replace(&self, domain: Domain, records: Vec<Record>) {
        let mut reconciler = self.lock();
        let count = records.len();
        reconciler.replace(domain, records);
        self.publish(&reconciler, domain);
        tracing::debug!(domain = %domain, records = count, "Replaced collection");
    }

    /// Optimistic local write, timestamped now
    pub fn apply_local(&self, domain: Domain, id: &str, patch: &Map<String, Value>) {
        let mut reconciler = self.lock();
        reconciler.apply_local(domain, id, patch, Utc::now());
        self.publish(&reconciler, domain);
    }

    /// Flip a record's unread marker off. Returns true if it was unread.
    pub fn mark_read(&self, domain: Domain, id: &str) -> bool {
        let mut reconciler = self.lock();
        let flipped = reconciler.mark_read(domain, id);
        if flipped {
            self.publish(&reconciler, domain);
        }
        flipped
    }

    /// Apply deferred deletes for a domain
    pub fn settle(&self, domain: Domain) -> usize {
        let mut reconciler = self.lock();
        let drained = reconciler.settle(domain);
        if drained > 0 {
            self.publish(&reconciler, domain);
        }
        drained
    }

    /// Drop all local state and publish empty snapshots
    pub fn clear(&self) {
        let mut reconciler = self.lock();
        reconciler.clear();
        for domain in Domain::ALL {
            self.publish(&reconciler, domain);
        }
    }

    /// Latest snapshot of one domain's collection
    pub fn snapshot(&self, domain: Domain) -> Arc<Collection> {
        self.collections
            .get(&domain)
            .map(|sender| sender.borrow().clone())
            .unwrap_or_default()
    }

    /// Current unread counts
    pub fn unread_counts(&self) -> UnreadCounts {
        self.counts.borrow().clone()
    }

    /// Receiver that observes every collection snapshot for `domain`
    pub fn subscribe(&self, domain: Domain) -> watch::Receiver<Arc<Collection>> {
        match self.collections.get(&domain) {
            Some(sender) => sender.subscribe(),
            None => watch::channel(Arc::new(Collection::default())).1,
        }
    }

    /// Receiver that observes every unread count change
    pub fn watch_counts(&self) -> watch::Receiver<UnreadCounts> {
        self.counts.subscribe()
    }

    /// Run `callback` with each new snapshot of `domain` until the handle is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_change<F>(&self, domain: Domain, callback: F) -> ObserverHandle
    where
        F: Fn(Arc<Collection>) + Send + 'static,
    {
        let mut receiver = self.subscribe(domain);
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    changed = receiver.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = receiver.borrow_and_update().clone();
                        callback(snapshot);
                    }
                }
            }
        });

        ObserverHandle { token }
    }

    fn publish(&self, reconciler: &Reconciler, domain: Domain) {
        if let Some(sender) = self.collections.get(&domain) {
            let snapshot = reconciler.collection(domain).cloned().unwrap_or_default();
            sender.send_replace(Arc::new(snapshot));
        }

        let counts = counter::recompute(reconciler.collections());
        self.counts.send_if_modified(|current| {
            if *current == counts {
                false
            } else {
                *current = counts;
                true
            }
        });
    }
}

/// Keeps a collection observer alive; dropping it stops the callback.
pub struct ObserverHandle {
    token: CancellationToken,
}

impl ObserverHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::Section;
    use crate::types::Operation;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn seed(store: &StateStore) {
        store.replace(
            Domain::Plans,
            vec![Record::from_row(json!({"id": "p1", "unread": true})).unwrap()],
        );
    }

    #[test]
    fn test_plan_read_scenario() {
        let store = StateStore::new();
        seed(&store);
        assert_eq!(store.unread_counts().get(Section::Active), 1);

        let event = ChangeEvent::new(Domain::Plans, "p1", Operation::Update)
            .with_payload(json!({"unread": false}))
            .at_millis(5);
        store.apply(event.clone());
        assert_eq!(store.unread_counts().get(Section::Active), 0);

        let before = store.snapshot(Domain::Plans);
        assert_eq!(store.apply(event), ApplyOutcome::Stale);
        assert_eq!(*store.snapshot(Domain::Plans), *before);
        assert_eq!(store.unread_counts().get(Section::Active), 0);
    }

    #[test]
    fn test_mark_read_recomputes() {
        let store = StateStore::new();
        seed(&store);
        let mut counts = store.watch_counts();
        counts.borrow_and_update();

        assert!(store.mark_read(Domain::Plans, "p1"));
        assert!(counts.has_changed().unwrap());
        assert_eq!(counts.borrow().total(), 0);
    }

    #[test]
    fn test_unread_sum_invariant_holds_across_mutations() {
        let store = StateStore::new();
        let check = |store: &StateStore| {
            let counts = store.unread_counts();
            let unread: usize = Domain::ALL
                .iter()
                .map(|d| store.snapshot(*d).records().filter(|r| r.is_unread()).count())
                .sum();
            assert_eq!(counts.total(), unread);
        };

        seed(&store);
        check(&store);
        store.apply(
            ChangeEvent::new(Domain::Invitations, "i1", Operation::Insert)
                .with_payload(json!({"unread": true})),
        );
        check(&store);
        store.apply(
            ChangeEvent::new(Domain::Plans, "p2", Operation::Insert)
                .with_payload(json!({"unread": true, "status": "completed"})),
        );
        check(&store);
        store.mark_read(Domain::Invitations, "i1");
        check(&store);
        store.apply(ChangeEvent::new(Domain::Plans, "p1", Operation::Delete));
        check(&store);
        assert_eq!(store.unread_counts().get(Section::Completed), 1);
    }

    #[test]
    fn test_stale_event_does_not_notify() {
        let store = StateStore::new();
        seed(&store);
        store.apply(
            ChangeEvent::new(Domain::Plans, "p1", Operation::Update)
                .with_payload(json!({"title": "a"}))
                .at_millis(10),
        );
        let mut plans = store.subscribe(Domain::Plans);
        plans.borrow_and_update();

        store.apply(
            ChangeEvent::new(Domain::Plans, "p1", Operation::Update)
                .with_payload(json!({"title": "b"}))
                .at_millis(5),
        );
        assert!(!plans.has_changed().unwrap());
    }

    #[test]
    fn test_clear_empties_everything() {
        let store = StateStore::new();
        seed(&store);
        store.clear();
        assert!(store.snapshot(Domain::Plans).is_empty());
        assert_eq!(store.unread_counts().total(), 0);
    }

    #[tokio::test]
    async fn test_on_change_callback_and_cancel() {
        let store = StateStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handle = store.on_change(Domain::Plans, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;

        seed(&store);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(handle);
        tokio::task::yield_now().await;
        store.mark_read(Domain::Plans, "p1");
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
