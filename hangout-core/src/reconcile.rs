//! Local state reconciliation
//!
//! The [`Reconciler`] merges pushed [`ChangeEvent`]s into one
//! [`Collection`] per domain and performs wholesale replaces after
//! authoritative reloads.
//!
//! ## Merge rules
//!
//! - **insert / update**: rejected as stale when the held version (or a
//!   tombstone left by a delete) is later than or equal to the event
//!   timestamp. Updates merge the fields present in the payload; inserts
//!   write the whole payload, or merge when the record already exists.
//! - **delete**: removes the record, unless a pending optimistic local write
//!   for that id is strictly later than the delete. Such deletes are
//!   re-queued once and applied unconditionally on the next drain.
//! - Events without a timestamp are applied in arrival order and are never
//!   stale.
//!
//! Exact duplicates are idempotent: a timestamped duplicate is stale against
//! its own version, an untimestamped duplicate rewrites identical fields.
//!
//! ## Reloads
//!
//! A reload's rows describe the server at some instant during its fetch.
//! Between [`Reconciler::begin_reload`] and [`Reconciler::replace`] every
//! accepted change is logged, then replayed over the fetched rows. A
//! logged delete is skipped only when the fetched row's `updated_at` is
//! at or after the delete.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::types::{ChangeEvent, Domain, Operation, Record};

/// Result of applying a single change event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The collection changed
    Applied,
    /// Accepted, but the collection already reflected it
    Unchanged,
    /// Older than what is held locally; discarded
    Stale,
    /// Delete held back behind a newer optimistic write
    Deferred,
    /// Exact copy of an event already waiting in the deferred queue
    Duplicate,
}

/// Records of one domain keyed by entity id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    records: BTreeMap<String, Record>,
}

impl Collection {
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Records in id order
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn insert_record(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        self.records.get_mut(id)
    }

    fn remove(&mut self, id: &str) -> Option<Record> {
        self.records.remove(id)
    }
}

impl FromIterator<Record> for Collection {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        let mut collection = Collection::default();
        for record in iter {
            collection.insert_record(record);
        }
        collection
    }
}

/// Change accepted while a reload's fetch was in flight
#[derive(Debug, Clone)]
enum Logged {
    Event(ChangeEvent),
    Local {
        id: String,
        patch: Map<String, Value>,
        at: DateTime<Utc>,
    },
    Read(String),
}

/// Per-domain bookkeeping around a collection
#[derive(Debug, Default)]
struct DomainState {
    collection: Collection,
    /// Server timestamp of the last write applied per id
    versions: HashMap<String, DateTime<Utc>>,
    /// Latest delete timestamp per id
    tombstones: HashMap<String, DateTime<Utc>>,
    /// Local timestamp of optimistic writes not yet echoed by the server
    pending_local: HashMap<String, DateTime<Utc>>,
    /// Deletes re-queued once behind an optimistic write
    deferred: VecDeque<ChangeEvent>,
    /// Bumped on every mutation of `collection`
    revision: u64,
    /// Set while a reload is fetching
    in_flight: Option<Vec<Logged>>,
}

impl DomainState {
    fn log(&mut self, change: Logged) {
        if let Some(log) = self.in_flight.as_mut() {
            log.push(change);
        }
    }

    /// Apply one event, then drain whatever was deferred before it
    fn apply_queued(&mut self, event: ChangeEvent) -> ApplyOutcome {
        let queued = std::mem::take(&mut self.deferred);
        let outcome = self.apply(event);
        self.drain_deferred(queued);
        outcome
    }

    fn apply(&mut self, event: ChangeEvent) -> ApplyOutcome {
        match event.op {
            Operation::Insert | Operation::Update => self.apply_write(event),
            Operation::Delete => self.apply_delete(event),
        }
    }

    fn is_stale(&self, id: &str, ts: DateTime<Utc>) -> bool {
        let superseded = self.versions.get(id).is_some_and(|held| *held >= ts);
        let deleted_later = self.tombstones.get(id).is_some_and(|deleted| *deleted >= ts);
        superseded || deleted_later
    }

    fn apply_write(&mut self, event: ChangeEvent) -> ApplyOutcome {
        let id = event.entity_id.as_str();

        if let Some(ts) = event.timestamp {
            if self.is_stale(id, ts) {
                tracing::debug!(
                    entity_id = %id,
                    op = event.op.as_str(),
                    ts = %ts,
                    "Discarding stale change event"
                );
                return ApplyOutcome::Stale;
            }
            self.versions.insert(id.to_string(), ts);
        }

        // The server echo of an optimistic write settles it.
        self.pending_local.remove(id);

        let changed = match self.collection.get_mut(id) {
            Some(existing) => {
                let before = existing.clone();
                existing.merge(&event.payload);
                *existing != before
            }
            None => {
                let record = Record::new(id, event.payload);
                self.collection.insert_record(record);
                true
            }
        };

        if changed {
            self.revision += 1;
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Unchanged
        }
    }

    fn apply_delete(&mut self, event: ChangeEvent) -> ApplyOutcome {
        let id = event.entity_id.as_str();

        if let (Some(ts), Some(local)) = (event.timestamp, self.pending_local.get(id)) {
            if *local > ts {
                tracing::debug!(
                    entity_id = %id,
                    ts = %ts,
                    local = %local,
                    "Deferring delete behind newer optimistic write"
                );
                self.deferred.push_back(event);
                return ApplyOutcome::Deferred;
            }
        }

        self.remove_entity(&event)
    }

    fn remove_entity(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        let id = event.entity_id.as_str();

        if let Some(ts) = event.timestamp {
            let tombstone = self.tombstones.entry(id.to_string()).or_insert(ts);
            if ts > *tombstone {
                *tombstone = ts;
            }
        }
        self.versions.remove(id);
        self.pending_local.remove(id);

        if self.collection.remove(id).is_some() {
            self.revision += 1;
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Unchanged
        }
    }

    /// Apply every queued deferred delete unconditionally
    fn drain_deferred(&mut self, queued: VecDeque<ChangeEvent>) -> usize {
        let count = queued.len();
        for event in queued {
            self.remove_entity(&event);
        }
        count
    }

    fn apply_local(&mut self, id: &str, patch: &Map<String, Value>, at: DateTime<Utc>) {
        match self.collection.get_mut(id) {
            Some(existing) => existing.merge(patch),
            None => self.collection.insert_record(Record::new(id, patch.clone())),
        }
        self.pending_local.insert(id.to_string(), at);
        self.revision += 1;
    }

    fn mark_read(&mut self, id: &str) -> bool {
        match self.collection.get_mut(id) {
            Some(record) if record.is_unread() => {
                record.set_unread(false);
                self.revision += 1;
                true
            }
            _ => false,
        }
    }

    /// Re-apply changes logged during a reload over freshly seeded state
    fn replay(&mut self, logged: Vec<Logged>) {
        let seeded = self.versions.clone();
        for change in logged {
            match change {
                Logged::Event(event) => {
                    let superseded = event.op == Operation::Delete
                        && event.timestamp.is_some_and(|ts| {
                            seeded
                                .get(&event.entity_id)
                                .is_some_and(|fetched| *fetched >= ts)
                        });
                    if !superseded {
                        self.apply_queued(event);
                    }
                }
                Logged::Local { id, patch, at } => self.apply_local(&id, &patch, at),
                Logged::Read(id) => {
                    self.mark_read(&id);
                }
            }
        }
    }
}

/// Merges change events into per-domain collections.
///
/// Purely synchronous; callers own the locking and notification policy
/// (see [`crate::state::StateStore`]).
#[derive(Debug, Default)]
pub struct Reconciler {
    domains: BTreeMap<Domain, DomainState>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one change event into its domain's collection.
    ///
    /// Deletes deferred by earlier calls on the same domain are applied
    /// after this event.
    pub fn apply(&mut self, event: ChangeEvent) -> ApplyOutcome {
        let state = self.domains.entry(event.domain).or_default();

        if state.deferred.contains(&event) {
            return ApplyOutcome::Duplicate;
        }

        let logged = state.in_flight.is_some().then(|| event.clone());
        let outcome = state.apply_queued(event);
        if let Some(event) = logged {
            if outcome != ApplyOutcome::Stale {
                state.log(Logged::Event(event));
            }
        }
        outcome
    }

    /// Apply any deferred deletes for `domain` without waiting for another event.
    ///
    /// Returns the number of deletes applied.
    pub fn settle(&mut self, domain: Domain) -> usize {
        match self.domains.get_mut(&domain) {
            Some(state) => {
                let queued = std::mem::take(&mut state.deferred);
                state.drain_deferred(queued)
            }
            None => 0,
        }
    }

    /// Start logging accepted changes for `domain` until the next
    /// [`replace`](Self::replace) or [`abort_reload`](Self::abort_reload).
    ///
    /// Discards anything logged by an earlier reload that never finished.
    pub fn begin_reload(&mut self, domain: Domain) {
        self.domains.entry(domain).or_default().in_flight = Some(Vec::new());
    }

    /// Stop logging for `domain` without replacing anything
    pub fn abort_reload(&mut self, domain: Domain) {
        if let Some(state) = self.domains.get_mut(&domain) {
            state.in_flight = None;
        }
    }

    /// Authoritatively replace a domain's collection.
    ///
    /// Versions are re-seeded from each row's `updated_at`; tombstones,
    /// pending optimistic writes and deferred deletes are dropped. Changes
    /// logged since [`begin_reload`](Self::begin_reload) are then replayed.
    pub fn replace(&mut self, domain: Domain, records: Vec<Record>) {
        let state = self.domains.entry(domain).or_default();
        let revision = state.revision + 1;
        let logged = state.in_flight.take().unwrap_or_default();

        let versions = records
            .iter()
            .filter_map(|record| record.updated_at().map(|ts| (record.id.clone(), ts)))
            .collect();

        *state = DomainState {
            collection: records.into_iter().collect(),
            versions,
            revision,
            ..DomainState::default()
        };

        if !logged.is_empty() {
            tracing::debug!(
                domain = %domain,
                changes = logged.len(),
                "Replaying changes received during reload"
            );
            state.replay(logged);
        }
    }

    /// Record an optimistic local write ahead of the server echo.
    pub fn apply_local(
        &mut self,
        domain: Domain,
        id: &str,
        patch: &Map<String, Value>,
        at: DateTime<Utc>,
    ) {
        let state = self.domains.entry(domain).or_default();
        state.apply_local(id, patch, at);
        state.log(Logged::Local {
            id: id.to_string(),
            patch: patch.clone(),
            at,
        });
    }

    /// Clear a record's unread marker. Returns true if it was unread.
    pub fn mark_read(&mut self, domain: Domain, id: &str) -> bool {
        let Some(state) = self.domains.get_mut(&domain) else {
            return false;
        };
        let flipped = state.mark_read(id);
        if flipped {
            state.log(Logged::Read(id.to_string()));
        }
        flipped
    }

    /// Drop every domain's state (sign-out)
    pub fn clear(&mut self) {
        self.domains.clear();
    }

    /// Drop one domain's state
    pub fn clear_domain(&mut self, domain: Domain) {
        self.domains.remove(&domain);
    }

    pub fn collection(&self, domain: Domain) -> Option<&Collection> {
        self.domains.get(&domain).map(|state| &state.collection)
    }

    /// All held collections, in domain order
    pub fn collections(&self) -> impl Iterator<Item = (Domain, &Collection)> {
        self.domains
            .iter()
            .map(|(domain, state)| (*domain, &state.collection))
    }

    /// Mutation counter for a domain; changes whenever its collection does
    pub fn revision(&self, domain: Domain) -> u64 {
        self.domains
            .get(&domain)
            .map(|state| state.revision)
            .unwrap_or(0)
    }

    /// Number of deletes waiting in a domain's deferred queue
    pub fn deferred_len(&self, domain: Domain) -> usize {
        self.domains
            .get(&domain)
            .map(|state| state.deferred.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn update(id: &str, payload: serde_json::Value) -> ChangeEvent {
        ChangeEvent::new(Domain::Plans, id, Operation::Update).with_payload(payload)
    }

    fn insert(id: &str, payload: serde_json::Value) -> ChangeEvent {
        ChangeEvent::new(Domain::Plans, id, Operation::Insert).with_payload(payload)
    }

    fn delete(id: &str) -> ChangeEvent {
        ChangeEvent::new(Domain::Plans, id, Operation::Delete)
    }

    fn seeded() -> Reconciler {
        let mut reconciler = Reconciler::new();
        reconciler.replace(
            Domain::Plans,
            vec![Record::from_row(json!({"id": "p1", "unread": true, "title": "Lunch"})).unwrap()],
        );
        reconciler
    }

    fn plans(reconciler: &Reconciler) -> Collection {
        reconciler.collection(Domain::Plans).cloned().unwrap_or_default()
    }

    #[test]
    fn test_update_merges_fields() {
        let mut reconciler = seeded();
        let outcome = reconciler.apply(update("p1", json!({"unread": false})).at_millis(5));
        assert_eq!(outcome, ApplyOutcome::Applied);

        let collection = plans(&reconciler);
        let record = collection.get("p1").unwrap();
        assert!(!record.is_unread());
        assert_eq!(record.str_field("title"), Some("Lunch"));
    }

    #[test]
    fn test_duplicate_timestamped_event_is_idempotent() {
        let mut reconciler = seeded();
        let event = update("p1", json!({"unread": false})).at_millis(5);

        reconciler.apply(event.clone());
        let once = plans(&reconciler);

        assert_eq!(reconciler.apply(event), ApplyOutcome::Stale);
        assert_eq!(plans(&reconciler), once);
    }

    #[test]
    fn test_duplicate_untimestamped_event_is_idempotent() {
        let mut reconciler = seeded();
        let event = insert("p2", json!({"title": "Movie", "unread": true}));

        assert_eq!(reconciler.apply(event.clone()), ApplyOutcome::Applied);
        let once = plans(&reconciler);

        assert_eq!(reconciler.apply(event), ApplyOutcome::Unchanged);
        assert_eq!(plans(&reconciler), once);
    }

    #[test]
    fn test_stale_update_rejected() {
        let mut reconciler = seeded();
        reconciler.apply(update("p1", json!({"title": "Dinner"})).at_millis(20));
        let outcome = reconciler.apply(update("p1", json!({"title": "Brunch"})).at_millis(10));

        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(
            plans(&reconciler).get("p1").unwrap().str_field("title"),
            Some("Dinner")
        );
    }

    #[test]
    fn test_equal_timestamp_rejected() {
        let mut reconciler = seeded();
        reconciler.apply(update("p1", json!({"title": "Dinner"})).at_millis(20));
        let outcome = reconciler.apply(update("p1", json!({"title": "Other"})).at_millis(20));
        assert_eq!(outcome, ApplyOutcome::Stale);
    }

    #[test]
    fn test_untimestamped_never_stale() {
        let mut reconciler = seeded();
        reconciler.apply(update("p1", json!({"title": "Dinner"})).at_millis(20));
        let outcome = reconciler.apply(update("p1", json!({"title": "Brunch"})));

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(
            plans(&reconciler).get("p1").unwrap().str_field("title"),
            Some("Brunch")
        );
    }

    #[test]
    fn test_insert_over_existing_is_update() {
        let mut reconciler = seeded();
        reconciler.apply(insert("p1", json!({"status": "completed"})).at_millis(3));

        let collection = plans(&reconciler);
        let record = collection.get("p1").unwrap();
        assert_eq!(record.str_field("status"), Some("completed"));
        assert_eq!(record.str_field("title"), Some("Lunch"));
    }

    #[test]
    fn test_late_insert_after_delete_rejected() {
        let mut reconciler = seeded();
        reconciler.apply(delete("p1").at_millis(30));
        let outcome = reconciler.apply(insert("p1", json!({"title": "Ghost"})).at_millis(25));

        assert_eq!(outcome, ApplyOutcome::Stale);
        assert!(!plans(&reconciler).contains("p1"));
    }

    #[test]
    fn test_delete_is_unconditional_without_local_write() {
        let mut reconciler = seeded();
        reconciler.apply(update("p1", json!({"title": "Dinner"})).at_millis(50));
        let outcome = reconciler.apply(delete("p1").at_millis(10));

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert!(plans(&reconciler).is_empty());
    }

    #[test]
    fn test_delete_deferred_behind_optimistic_write() {
        let mut reconciler = seeded();
        let patch = json!({"title": "Renamed"});
        reconciler.apply_local(Domain::Plans, "p1", patch.as_object().unwrap(), ts(100));

        let outcome = reconciler.apply(delete("p1").at_millis(50));
        assert_eq!(outcome, ApplyOutcome::Deferred);
        assert!(plans(&reconciler).contains("p1"));
        assert_eq!(reconciler.deferred_len(Domain::Plans), 1);

        // Next event on the domain drains the re-queued delete.
        reconciler.apply(insert("p2", json!({"title": "Hike"})));
        assert!(!plans(&reconciler).contains("p1"));
        assert!(plans(&reconciler).contains("p2"));
        assert_eq!(reconciler.deferred_len(Domain::Plans), 0);
    }

    #[test]
    fn test_deferred_delete_duplicate_does_not_drain() {
        let mut reconciler = seeded();
        let patch = json!({"title": "Renamed"});
        reconciler.apply_local(Domain::Plans, "p1", patch.as_object().unwrap(), ts(100));

        let event = delete("p1").at_millis(50);
        reconciler.apply(event.clone());
        let once = plans(&reconciler);

        assert_eq!(reconciler.apply(event), ApplyOutcome::Duplicate);
        assert_eq!(plans(&reconciler), once);
        assert_eq!(reconciler.settle(Domain::Plans), 1);
        assert!(!plans(&reconciler).contains("p1"));
    }

    #[test]
    fn test_delete_not_deferred_when_local_write_older() {
        let mut reconciler = seeded();
        let patch = json!({"title": "Renamed"});
        reconciler.apply_local(Domain::Plans, "p1", patch.as_object().unwrap(), ts(10));

        assert_eq!(
            reconciler.apply(delete("p1").at_millis(50)),
            ApplyOutcome::Applied
        );
    }

    #[test]
    fn test_server_echo_clears_optimistic_write() {
        let mut reconciler = seeded();
        let patch = json!({"title": "Renamed"});
        reconciler.apply_local(Domain::Plans, "p1", patch.as_object().unwrap(), ts(100));
        reconciler.apply(update("p1", json!({"title": "Renamed"})).at_millis(60));

        assert_eq!(
            reconciler.apply(delete("p1").at_millis(70)),
            ApplyOutcome::Applied
        );
    }

    #[test]
    fn test_replace_resets_bookkeeping() {
        let mut reconciler = seeded();
        reconciler.apply(delete("p1").at_millis(30));
        reconciler.replace(
            Domain::Plans,
            vec![Record::from_row(json!({"id": "p1", "title": "Back"})).unwrap()],
        );

        // Tombstone gone: an older write is no longer rejected.
        let outcome = reconciler.apply(update("p1", json!({"title": "Later"})).at_millis(25));
        assert_eq!(outcome, ApplyOutcome::Applied);
    }

    #[test]
    fn test_replace_seeds_versions_from_rows() {
        let mut reconciler = Reconciler::new();
        reconciler.replace(
            Domain::Plans,
            vec![Record::from_row(json!({
                "id": "p1",
                "title": "Fresh",
                "updated_at": "2024-05-01T10:00:00Z"
            }))
            .unwrap()],
        );

        let older = update("p1", json!({"title": "Old"}))
            .at(DateTime::parse_from_rfc3339("2024-05-01T09:00:00Z").unwrap().with_timezone(&Utc));
        assert_eq!(reconciler.apply(older), ApplyOutcome::Stale);
    }

    fn plan_row(value: serde_json::Value) -> Record {
        Record::from_row(value).unwrap()
    }

    #[test]
    fn test_delete_during_reload_survives_older_rows() {
        let mut reconciler = seeded();
        reconciler.begin_reload(Domain::Plans);
        reconciler.apply(delete("p1").at_millis(5_000));

        // Fetched before the delete committed.
        reconciler.replace(
            Domain::Plans,
            vec![plan_row(json!({"id": "p1", "title": "Lunch", "updated_at": 1_000}))],
        );
        assert!(!plans(&reconciler).contains("p1"));

        // The replayed delete left a tombstone.
        let late = update("p1", json!({"title": "Ghost"})).at_millis(4_000);
        assert_eq!(reconciler.apply(late), ApplyOutcome::Stale);
    }

    #[test]
    fn test_delete_during_reload_yields_to_newer_row() {
        let mut reconciler = seeded();
        reconciler.begin_reload(Domain::Plans);
        reconciler.apply(delete("p1").at_millis(5_000));

        // Re-created on the server after the delete.
        reconciler.replace(
            Domain::Plans,
            vec![plan_row(json!({"id": "p1", "title": "Again", "updated_at": 6_000}))],
        );
        assert_eq!(
            plans(&reconciler).get("p1").unwrap().str_field("title"),
            Some("Again")
        );
    }

    #[test]
    fn test_changes_during_reload_are_replayed() {
        let mut reconciler = seeded();
        reconciler.begin_reload(Domain::Plans);
        reconciler.apply(update("p1", json!({"title": "Old"})).at_millis(2_000));
        reconciler.apply(insert("p2", json!({"title": "Hike", "unread": true})).at_millis(3_000));
        reconciler.apply(insert("p3", json!({"unread": true})));
        assert!(reconciler.mark_read(Domain::Plans, "p3"));
        let patch = json!({"title": "Mine"});
        reconciler.apply_local(Domain::Plans, "p4", patch.as_object().unwrap(), ts(3_500));

        reconciler.replace(
            Domain::Plans,
            vec![plan_row(json!({"id": "p1", "title": "New", "updated_at": 9_000}))],
        );

        let collection = plans(&reconciler);
        assert_eq!(collection.get("p1").unwrap().str_field("title"), Some("New"));
        assert_eq!(collection.get("p2").unwrap().str_field("title"), Some("Hike"));
        assert!(!collection.get("p3").unwrap().is_unread());
        assert_eq!(collection.get("p4").unwrap().str_field("title"), Some("Mine"));

        // The optimistic write is still pending after the replay.
        assert_eq!(
            reconciler.apply(delete("p4").at_millis(3_000)),
            ApplyOutcome::Deferred
        );
    }

    #[test]
    fn test_aborted_reload_stops_logging() {
        let mut reconciler = seeded();
        reconciler.begin_reload(Domain::Plans);
        reconciler.apply(delete("p1").at_millis(5_000));
        reconciler.abort_reload(Domain::Plans);

        reconciler.replace(
            Domain::Plans,
            vec![plan_row(json!({"id": "p1", "updated_at": 1_000}))],
        );
        assert!(plans(&reconciler).contains("p1"));
    }

    #[test]
    fn test_mark_read_and_revision() {
        let mut reconciler = seeded();
        let before = reconciler.revision(Domain::Plans);

        assert!(reconciler.mark_read(Domain::Plans, "p1"));
        assert!(!reconciler.mark_read(Domain::Plans, "p1"));
        assert!(!reconciler.mark_read(Domain::Friends, "f1"));
        assert_eq!(reconciler.revision(Domain::Plans), before + 1);
    }

    #[test]
    fn test_domains_are_independent() {
        let mut reconciler = seeded();
        reconciler.apply(
            ChangeEvent::new(Domain::Friends, "p1", Operation::Insert)
                .with_payload(json!({"name": "Sam"})),
        );
        reconciler.clear_domain(Domain::Friends);

        assert!(reconciler.collection(Domain::Friends).is_none());
        assert!(plans(&reconciler).contains("p1"));
    }
}
