//! Sync service
//!
//! Wires the subscription manager, refresh scheduler, state store and data
//! source together for one signed-in user:
//!
//! - change events are merged into the store as they arrive
//! - every (re)connect, transport gap, explicit refresh and backstop tick
//!   schedules a debounced authoritative reload of the domain
//! - sign-out stops every channel, cancels pending reloads and clears local
//!   state, in that order
//!
//! Presentation code talks only to [`SyncService`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backend::DataSource;
use crate::config::Config;
use crate::counter::UnreadCounts;
use crate::error::{Error, Result};
use crate::reconcile::{ApplyOutcome, Collection};
use crate::scheduler::{RefreshScheduler, RefreshStats};
use crate::state::{ObserverHandle, StateStore};
use crate::subscription::{
    BackoffPolicy, ChannelNotice, NoticeHandler, SubscriptionManager, SubscriptionStatus,
};
use crate::transport::RealtimeTransport;
use crate::types::{Domain, Session};

/// Coarse connection state for a soft "reconnecting" hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSignal {
    /// No channel running
    Offline,
    /// Channels opening for the first time
    Connecting,
    /// Every running channel is active
    Live,
    /// At least one channel is recovering from a transport error
    Reconnecting,
}

impl ConnectionSignal {
    pub fn from_statuses<'a, I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = &'a SubscriptionStatus>,
    {
        let mut running = false;
        let mut connecting = false;
        for status in statuses {
            match status {
                SubscriptionStatus::Inactive => {}
                SubscriptionStatus::Error => return ConnectionSignal::Reconnecting,
                SubscriptionStatus::Connecting => {
                    running = true;
                    connecting = true;
                }
                SubscriptionStatus::Active => running = true,
            }
        }
        match (running, connecting) {
            (false, _) => ConnectionSignal::Offline,
            (true, true) => ConnectionSignal::Connecting,
            (true, false) => ConnectionSignal::Live,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionSignal::Offline => "offline",
            ConnectionSignal::Connecting => "connecting",
            ConnectionSignal::Live => "live",
            ConnectionSignal::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a reload or a notice needs, shared with background tasks
struct SyncContext {
    store: Arc<StateStore>,
    scheduler: RefreshScheduler,
    source: Arc<dyn DataSource>,
    filters: BTreeMap<Domain, String>,
    /// Bumped on sign-out; reloads from an older session are discarded
    generation: Mutex<u64>,
}

impl SyncContext {
    fn generation(&self) -> MutexGuard<'_, u64> {
        self.generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_reload(self: &Arc<Self>, domain: Domain) {
        let generation = *self.generation();
        let context = Arc::clone(self);
        self.scheduler
            .schedule(domain, move || async move { context.reload(domain, generation).await });
    }

    async fn reload(&self, domain: Domain, generation: u64) -> Result<()> {
        let filter = self.filters.get(&domain).map(String::as_str);
        // Events arriving mid-fetch are replayed over the fetched rows.
        self.store.begin_reload(domain);
        let records = match self.source.fetch_all(domain, filter).await {
            Ok(records) => records,
            Err(e) => {
                self.store.abort_reload(domain);
                return Err(Error::Reload {
                    domain: domain.to_string(),
                    message: e.to_string(),
                });
            }
        };

        // Held across the replace so a concurrent sign-out cannot interleave.
        let current = self.generation();
        if *current != generation {
            tracing::debug!(domain = %domain, "Discarding reload from a previous session");
            self.store.abort_reload(domain);
            return Ok(());
        }
        tracing::info!(domain = %domain, records = records.len(), "Authoritative reload");
        self.store.replace(domain, records);
        Ok(())
    }

    fn handle_notice(self: &Arc<Self>, domain: Domain, notice: ChannelNotice) {
        match notice {
            ChannelNotice::Event(event) => {
                if event.domain != domain {
                    tracing::warn!(
                        channel = %domain,
                        event_domain = %event.domain,
                        "Dropping event delivered on the wrong channel"
                    );
                    return;
                }
                let id = event.entity_id.clone();
                match self.store.apply(event) {
                    ApplyOutcome::Applied | ApplyOutcome::Unchanged => {}
                    ApplyOutcome::Stale | ApplyOutcome::Duplicate => {
                        tracing::debug!(domain = %domain, id = %id, "Discarded stale event");
                    }
                    ApplyOutcome::Deferred => {
                        tracing::debug!(domain = %domain, id = %id, "Deferred delete");
                        let store = Arc::clone(&self.store);
                        tokio::spawn(async move {
                            tokio::task::yield_now().await;
                            store.settle(domain);
                        });
                    }
                }
            }
            ChannelNotice::Connected { reconnect } => {
                tracing::debug!(domain = %domain, reconnect, "Channel connected, reloading");
                self.schedule_reload(domain);
            }
            ChannelNotice::Gap { missed } => {
                tracing::info!(domain = %domain, missed, "Missed events, reloading");
                self.schedule_reload(domain);
            }
        }
    }
}

/// Realtime view-consistency service for one user
pub struct SyncService {
    domains: Vec<Domain>,
    backstop_interval: Option<Duration>,
    context: Arc<SyncContext>,
    subscriptions: Arc<SubscriptionManager>,
    backstop: Mutex<Option<CancellationToken>>,
}

impl SyncService {
    pub fn new(
        config: &Config,
        transport: Arc<dyn RealtimeTransport>,
        source: Arc<dyn DataSource>,
    ) -> Result<Self> {
        let realtime = &config.realtime;
        realtime.validate()?;

        let backoff = BackoffPolicy {
            initial: realtime.backoff_initial(),
            max: realtime.backoff_max(),
        };

        Ok(Self {
            domains: realtime.domains.clone(),
            backstop_interval: realtime.backstop_interval(),
            context: Arc::new(SyncContext {
                store: Arc::new(StateStore::new()),
                scheduler: RefreshScheduler::new(realtime.debounce_window()),
                source,
                filters: config.backend.filters.clone(),
                generation: Mutex::new(0),
            }),
            subscriptions: Arc::new(SubscriptionManager::new(transport, backoff)),
            backstop: Mutex::new(None),
        })
    }

    /// Store the session and start every configured domain
    pub fn on_session_acquired(&self, session: Session) {
        self.context.source.set_session(Some(&session));
        self.subscriptions.on_session_acquired(session);
        self.start();
    }

    /// Sign-out: stop channels, cancel pending reloads, then clear local state
    pub fn on_session_lost(&self) {
        self.subscriptions.on_session_lost();
        self.context.scheduler.cancel_all();
        self.stop_backstop();
        {
            let mut generation = self.context.generation();
            *generation += 1;
            self.context.store.clear();
        }
        self.context.source.set_session(None);
        tracing::info!("Cleared local state after sign-out");
    }

    /// Start every configured domain
    pub fn start(&self) {
        let domains = self.domains.clone();
        self.start_domains(&domains);
    }

    /// Start the given domains. Without a session this only logs a warning.
    pub fn start_domains(&self, domains: &[Domain]) {
        if !self.subscriptions.has_session() {
            tracing::warn!("Cannot start realtime sync without an authenticated session");
            return;
        }
        let context = Arc::clone(&self.context);
        let handler: NoticeHandler =
            Arc::new(move |domain, notice| context.handle_notice(domain, notice));
        self.subscriptions.start(domains, handler);
        self.start_backstop();
    }

    /// Stop every channel; local state is kept
    pub fn stop(&self) {
        self.subscriptions.stop_all();
        self.stop_backstop();
    }

    /// Stop the given domains
    pub fn stop_domains(&self, domains: &[Domain]) {
        self.subscriptions.stop(domains);
    }

    /// Ask for a debounced authoritative reload of `domain`
    pub fn request_refresh(&self, domain: Domain) {
        if !self.subscriptions.has_session() {
            tracing::warn!(domain = %domain, "Ignoring refresh without an authenticated session");
            return;
        }
        self.context.schedule_reload(domain);
    }

    pub fn unread_counts(&self) -> UnreadCounts {
        self.context.store.unread_counts()
    }

    pub fn watch_unread_counts(&self) -> watch::Receiver<UnreadCounts> {
        self.context.store.watch_counts()
    }

    pub fn collection(&self, domain: Domain) -> Arc<Collection> {
        self.context.store.snapshot(domain)
    }

    pub fn subscribe_to_collection(&self, domain: Domain) -> watch::Receiver<Arc<Collection>> {
        self.context.store.subscribe(domain)
    }

    /// Invoke `callback` with each new snapshot of `domain` until the handle is dropped
    pub fn on_collection_change<F>(&self, domain: Domain, callback: F) -> ObserverHandle
    where
        F: Fn(Arc<Collection>) + Send + 'static,
    {
        self.context.store.on_change(domain, callback)
    }

    /// Flip a record's unread marker off. Returns true if it was unread.
    pub fn mark_read(&self, domain: Domain, id: &str) -> bool {
        self.context.store.mark_read(domain, id)
    }

    /// Optimistic local write ahead of the server echo
    pub fn apply_local(&self, domain: Domain, id: &str, patch: &Map<String, Value>) {
        self.context.store.apply_local(domain, id, patch);
    }

    pub fn subscription_status(&self, domain: Domain) -> SubscriptionStatus {
        self.subscriptions.status(domain)
    }

    pub fn watch_subscription_statuses(
        &self,
    ) -> watch::Receiver<BTreeMap<Domain, SubscriptionStatus>> {
        self.subscriptions.watch_statuses()
    }

    pub fn connection_signal(&self) -> ConnectionSignal {
        ConnectionSignal::from_statuses(self.subscriptions.statuses().values())
    }

    /// Reload statistics for one domain
    pub fn refresh_stats(&self, domain: Domain) -> RefreshStats {
        self.context.scheduler.stats(domain)
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.context.store
    }

    fn lock_backstop(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.backstop.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_backstop(&self) {
        let Some(period) = self.backstop_interval else {
            return;
        };
        let mut backstop = self.lock_backstop();
        if backstop.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *backstop = Some(token.clone());

        let context = Arc::clone(&self.context);
        let subscriptions = Arc::clone(&self.subscriptions);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {
                        let domains = subscriptions.running_domains();
                        tracing::debug!(domains = domains.len(), "Backstop reload");
                        for domain in domains {
                            context.schedule_reload(domain);
                        }
                    }
                }
            }
        });
    }

    fn stop_backstop(&self) {
        if let Some(token) = self.lock_backstop().take() {
            token.cancel();
        }
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.subscriptions.stop_all();
        self.stop_backstop();
        self.context.scheduler.cancel_all();
    }
}
