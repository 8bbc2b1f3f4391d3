//! Debounced refresh scheduler
//!
//! Collapses bursts of refresh requests into a single authoritative reload
//! per domain (trailing edge: the reload fires once the domain has been
//! quiet for the whole window, never on the leading call).
//!
//! Each domain gets one worker task that runs reloads one at a time, so a
//! reload is never invoked concurrently with itself. Requests that arrive
//! while a reload is in flight are kept and fire as soon as it completes,
//! if their own quiet window has already elapsed by then.
//!
//! `cancel_all` retires workers but cannot stop a reload mid-flight. A
//! per-domain lock that outlives the workers keeps a replacement worker
//! from starting its reload until the retired one has finished.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::Domain;

type InFlight = Arc<tokio::sync::Mutex<()>>;

type ReloadFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

struct Request {
    at: Instant,
    reload: ReloadFn,
}

/// Per-domain reload statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStats {
    /// Requests accepted by `schedule`
    pub requested: usize,
    /// Reloads invoked
    pub fired: usize,
    /// Reloads that returned an error or panicked
    pub failed: usize,
}

struct Workers {
    senders: HashMap<Domain, mpsc::UnboundedSender<Request>>,
    token: CancellationToken,
}

/// Trailing-edge debouncer for per-domain reloads
pub struct RefreshScheduler {
    window: Duration,
    workers: Mutex<Workers>,
    /// Held for the duration of each reload; survives `cancel_all`
    in_flight: Mutex<HashMap<Domain, InFlight>>,
    stats: Arc<Mutex<BTreeMap<Domain, RefreshStats>>>,
}

impl RefreshScheduler {
    /// Default quiet window
    pub const DEFAULT_WINDOW: Duration = Duration::from_millis(600);

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            workers: Mutex::new(Workers {
                senders: HashMap::new(),
                token: CancellationToken::new(),
            }),
            in_flight: Mutex::new(HashMap::new()),
            stats: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Request a reload of `domain`.
    ///
    /// The most recent `reload` of a burst is the one invoked. Must be
    /// called from within a tokio runtime.
    pub fn schedule<F, Fut>(&self, domain: Domain, reload: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let request = Request {
            at: Instant::now(),
            reload: Box::new(move || reload().boxed()),
        };
        record(&self.stats, domain, |stats| stats.requested += 1);

        let mut workers = self.lock_workers();
        let request = match workers.senders.get(&domain) {
            Some(sender) => match sender.send(request) {
                Ok(()) => return,
                Err(mpsc::error::SendError(request)) => request,
            },
            None => request,
        };

        // No live worker for this domain yet (or it exited): start one.
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = workers.token.child_token();
        tokio::spawn(run_worker(
            domain,
            self.window,
            receiver,
            token,
            self.in_flight_lock(domain),
            Arc::clone(&self.stats),
        ));
        if sender.send(request).is_err() {
            tracing::warn!(domain = %domain, "Refresh worker exited before first request");
        }
        workers.senders.insert(domain, sender);
    }

    /// Drop every pending request and stop all workers.
    ///
    /// Reloads already in flight run to completion. Later calls to
    /// `schedule` start fresh workers, whose reloads wait for them.
    pub fn cancel_all(&self) {
        let mut workers = self.lock_workers();
        workers.token.cancel();
        workers.token = CancellationToken::new();
        workers.senders.clear();
    }

    /// Statistics for one domain
    pub fn stats(&self, domain: Domain) -> RefreshStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&domain)
            .copied()
            .unwrap_or_default()
    }

    fn lock_workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight_lock(&self, domain: Domain) -> InFlight {
        let mut locks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(domain).or_default())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.lock_workers().token.cancel();
    }
}

fn record(
    stats: &Mutex<BTreeMap<Domain, RefreshStats>>,
    domain: Domain,
    update: impl FnOnce(&mut RefreshStats),
) {
    let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
    update(stats.entry(domain).or_default());
}

async fn run_worker(
    domain: Domain,
    window: Duration,
    mut receiver: mpsc::UnboundedReceiver<Request>,
    token: CancellationToken,
    in_flight: InFlight,
    stats: Arc<Mutex<BTreeMap<Domain, RefreshStats>>>,
) {
    loop {
        let mut pending = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            request = receiver.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        // Quiet window, measured from the latest request's arrival.
        loop {
            let deadline = pending.at + window;
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                request = receiver.recv() => match request {
                    Some(request) => pending = request,
                    None => return,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        // A reload from a retired worker may still be running.
        let _running = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            guard = Arc::clone(&in_flight).lock_owned() => guard,
        };

        record(&stats, domain, |s| s.fired += 1);
        tracing::debug!(domain = %domain, "Running debounced reload");

        let reload = pending.reload;
        let outcome = AssertUnwindSafe(async move { reload().await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                record(&stats, domain, |s| s.failed += 1);
                tracing::warn!(domain = %domain, error = %e, "Reload failed");
            }
            Err(_) => {
                record(&stats, domain, |s| s.failed += 1);
                tracing::error!(domain = %domain, "Reload panicked");
            }
        }
    }
}
