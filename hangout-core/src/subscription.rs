//! Change subscription manager
//!
//! Owns one realtime channel per domain and drives each through
//!
//! ```text
//! inactive → connecting → active
//!              ↑            │ transport drop
//!              └── error ←──┘   (capped exponential backoff)
//! any state → inactive          on stop / session loss
//! ```
//!
//! `stop` is synchronous for bookkeeping: the slot flips to `inactive` and
//! its epoch is retired before `stop` returns. Every notice is delivered
//! while holding the manager lock after re-checking the epoch, so nothing
//! reaches the consumer once `stop` has returned, even if the channel task
//! is still winding down.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::transport::{RealtimeChannel, RealtimeTransport, TransportMessage};
use crate::types::{ChangeEvent, Domain, Session};

/// Lifecycle state of one domain's channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Inactive,
    Connecting,
    Active,
    Error,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Connecting => "connecting",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a channel hands to its consumer
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelNotice {
    /// A change event for the channel's domain
    Event(ChangeEvent),
    /// The channel became active; `reconnect` is false only for the first connect
    Connected { reconnect: bool },
    /// The transport skipped messages; local state may have gaps
    Gap { missed: u64 },
}

/// Consumer callback.
///
/// Runs while the manager lock is held, so it must not call back into the
/// [`SubscriptionManager`].
pub type NoticeHandler = Arc<dyn Fn(Domain, ChannelNotice) + Send + Sync>;

/// Capped exponential reconnect delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[derive(Debug, Default)]
struct Slot {
    status: SubscriptionStatus,
    /// Identifies the current run; retired on stop
    epoch: u64,
    token: Option<CancellationToken>,
    channel_id: Option<Uuid>,
}

struct ManagerState {
    session: Option<Session>,
    slots: BTreeMap<Domain, Slot>,
    next_epoch: u64,
}

struct Shared {
    state: Mutex<ManagerState>,
    statuses: watch::Sender<BTreeMap<Domain, SubscriptionStatus>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_statuses(&self, state: &ManagerState) {
        let statuses: BTreeMap<Domain, SubscriptionStatus> = state
            .slots
            .iter()
            .map(|(domain, slot)| (*domain, slot.status))
            .collect();
        self.statuses.send_if_modified(|current| {
            if *current == statuses {
                false
            } else {
                *current = statuses;
                true
            }
        });
    }

    /// Run `f` on the slot if `epoch` is still its current run.
    ///
    /// Returns false once the run has been stopped.
    fn with_current<F>(&self, domain: Domain, epoch: u64, f: F) -> bool
    where
        F: FnOnce(&mut Slot),
    {
        let mut state = self.lock();
        let current = match state.slots.get_mut(&domain) {
            Some(slot) if slot.epoch == epoch && slot.status != SubscriptionStatus::Inactive => {
                f(slot);
                true
            }
            _ => false,
        };
        if current {
            self.publish_statuses(&state);
        }
        current
    }

    fn set_status(&self, domain: Domain, epoch: u64, status: SubscriptionStatus) -> bool {
        self.with_current(domain, epoch, |slot| slot.status = status)
    }

    /// Deliver a notice if the run is still current; the lock is held during delivery.
    fn deliver(
        &self,
        domain: Domain,
        epoch: u64,
        handler: &NoticeHandler,
        notice: ChannelNotice,
    ) -> bool {
        let state = self.lock();
        match state.slots.get(&domain) {
            Some(slot) if slot.epoch == epoch && slot.status == SubscriptionStatus::Active => {
                handler(domain, notice);
                true
            }
            _ => false,
        }
    }

    fn session(&self) -> Option<Session> {
        self.lock().session.clone()
    }
}

/// Owns the lifecycle of every domain's realtime channel
pub struct SubscriptionManager {
    transport: Arc<dyn RealtimeTransport>,
    backoff: BackoffPolicy,
    shared: Arc<Shared>,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn RealtimeTransport>, backoff: BackoffPolicy) -> Self {
        let (statuses, _) = watch::channel(BTreeMap::new());
        Self {
            transport,
            backoff,
            shared: Arc::new(Shared {
                state: Mutex::new(ManagerState {
                    session: None,
                    slots: BTreeMap::new(),
                    next_epoch: 1,
                }),
                statuses,
            }),
        }
    }

    /// Record a newly acquired (or refreshed) session.
    ///
    /// Channels pick the new token up on their next connect.
    pub fn on_session_acquired(&self, session: Session) {
        let user_id = session.user_id.clone().unwrap_or_else(|| "-".to_string());
        self.shared.lock().session = Some(session);
        tracing::info!(user_id = %user_id, "Realtime session acquired");
    }

    /// Stop every domain and forget the session
    pub fn on_session_lost(&self) {
        self.stop_all();
        self.shared.lock().session = None;
        tracing::info!("Realtime session lost");
    }

    pub fn has_session(&self) -> bool {
        self.shared.lock().session.is_some()
    }

    /// Open a channel for every requested domain that is not already running.
    ///
    /// Without a session this logs a warning and does nothing. Must be
    /// called from within a tokio runtime.
    pub fn start(&self, domains: &[Domain], handler: NoticeHandler) {
        let mut state = self.shared.lock();
        if state.session.is_none() {
            tracing::warn!(
                domains = ?domains,
                "Ignoring realtime start without an authenticated session"
            );
            return;
        }

        for domain in domains {
            let epoch = state.next_epoch;
            let slot = state.slots.entry(*domain).or_default();
            if slot.status != SubscriptionStatus::Inactive {
                tracing::debug!(domain = %domain, status = %slot.status, "Channel already running");
                continue;
            }

            let token = CancellationToken::new();
            slot.status = SubscriptionStatus::Connecting;
            slot.epoch = epoch;
            slot.token = Some(token.clone());
            slot.channel_id = None;
            state.next_epoch += 1;

            tokio::spawn(run_channel(ChannelRun {
                domain: *domain,
                epoch,
                transport: Arc::clone(&self.transport),
                backoff: self.backoff,
                shared: Arc::clone(&self.shared),
                handler: Arc::clone(&handler),
                token,
            }));
            tracing::debug!(domain = %domain, epoch, "Starting realtime channel");
        }

        self.shared.publish_statuses(&state);
    }

    /// Tear down the requested domains.
    ///
    /// Safe in any state. Bookkeeping is `inactive` when this returns; the
    /// transport close completes in the background.
    pub fn stop(&self, domains: &[Domain]) {
        let mut state = self.shared.lock();
        for domain in domains {
            let Some(slot) = state.slots.get_mut(domain) else {
                continue;
            };
            if slot.status == SubscriptionStatus::Inactive {
                continue;
            }
            if let Some(token) = slot.token.take() {
                token.cancel();
            }
            slot.status = SubscriptionStatus::Inactive;
            slot.channel_id = None;
            tracing::debug!(domain = %domain, "Stopped realtime channel");
        }
        self.shared.publish_statuses(&state);
    }

    /// Tear down every domain
    pub fn stop_all(&self) {
        let domains: Vec<Domain> = self.shared.lock().slots.keys().copied().collect();
        self.stop(&domains);
    }

    pub fn status(&self, domain: Domain) -> SubscriptionStatus {
        self.shared
            .lock()
            .slots
            .get(&domain)
            .map(|slot| slot.status)
            .unwrap_or_default()
    }

    /// Status of every domain that has been started at least once
    pub fn statuses(&self) -> BTreeMap<Domain, SubscriptionStatus> {
        self.shared.statuses.borrow().clone()
    }

    /// Domains currently running (connecting, active or retrying)
    pub fn running_domains(&self) -> Vec<Domain> {
        self.shared
            .lock()
            .slots
            .iter()
            .filter(|(_, slot)| slot.status != SubscriptionStatus::Inactive)
            .map(|(domain, _)| *domain)
            .collect()
    }

    /// True while any domain is recovering from a transport error
    pub fn is_reconnecting(&self) -> bool {
        self.shared
            .statuses
            .borrow()
            .values()
            .any(|status| *status == SubscriptionStatus::Error)
    }

    /// Observe status changes (e.g., to show a soft "reconnecting" hint)
    pub fn watch_statuses(&self) -> watch::Receiver<BTreeMap<Domain, SubscriptionStatus>> {
        self.shared.statuses.subscribe()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

struct ChannelRun {
    domain: Domain,
    epoch: u64,
    transport: Arc<dyn RealtimeTransport>,
    backoff: BackoffPolicy,
    shared: Arc<Shared>,
    handler: NoticeHandler,
    token: CancellationToken,
}

async fn close_channel(domain: Domain, channel: Box<dyn RealtimeChannel>) {
    if let Err(e) = channel.close().await {
        tracing::debug!(domain = %domain, error = %e, "Error closing realtime channel");
    }
}

async fn run_channel(run: ChannelRun) {
    let ChannelRun {
        domain,
        epoch,
        transport,
        backoff,
        shared,
        handler,
        token,
    } = run;

    let mut attempt: u32 = 0;
    let mut connected_before = false;

    loop {
        if !shared.set_status(domain, epoch, SubscriptionStatus::Connecting) {
            return;
        }
        let Some(session) = shared.session() else {
            tracing::warn!(domain = %domain, "Session gone before connect");
            return;
        };

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            opened = transport.open_channel(domain, &session) => opened,
        };

        match opened {
            Ok(mut channel) => {
                let channel_id = Uuid::new_v4();
                let activated = shared.with_current(domain, epoch, |slot| {
                    slot.status = SubscriptionStatus::Active;
                    slot.channel_id = Some(channel_id);
                });
                let announced = activated
                    && shared.deliver(
                        domain,
                        epoch,
                        &handler,
                        ChannelNotice::Connected {
                            reconnect: connected_before,
                        },
                    );
                if !announced {
                    close_channel(domain, channel).await;
                    return;
                }

                tracing::info!(
                    domain = %domain,
                    channel_id = %channel_id,
                    reconnect = connected_before,
                    "Realtime channel active"
                );
                attempt = 0;
                connected_before = true;

                let reason = loop {
                    let message = tokio::select! {
                        biased;
                        _ = token.cancelled() => None,
                        message = channel.next_message() => Some(message),
                    };
                    let notice = match message {
                        // Stopped: the slot is already inactive.
                        None => {
                            close_channel(domain, channel).await;
                            return;
                        }
                        Some(Some(TransportMessage::Event(event))) => ChannelNotice::Event(event),
                        Some(Some(TransportMessage::Lagged(missed))) => {
                            tracing::warn!(domain = %domain, missed, "Realtime channel lagged");
                            ChannelNotice::Gap { missed }
                        }
                        Some(Some(TransportMessage::Disconnected(reason))) => break reason,
                        Some(None) => break "channel closed by transport".to_string(),
                    };
                    if !shared.deliver(domain, epoch, &handler, notice) {
                        close_channel(domain, channel).await;
                        return;
                    }
                };

                close_channel(domain, channel).await;
                tracing::warn!(domain = %domain, reason = %reason, "Realtime channel dropped");
            }
            Err(e) => {
                tracing::warn!(
                    domain = %domain,
                    attempt,
                    error = %e,
                    "Realtime connect failed"
                );
            }
        }

        if !shared.with_current(domain, epoch, |slot| {
            slot.status = SubscriptionStatus::Error;
            slot.channel_id = None;
        }) {
            return;
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        tracing::debug!(domain = %domain, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");

        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
