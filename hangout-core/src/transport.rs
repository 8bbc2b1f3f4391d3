//! Realtime transport abstraction
//!
//! The change-notification transport is owned by the managed backend; this
//! crate only needs to open one channel per domain, read messages from it
//! and close it. [`LocalTransport`] is an in-process implementation used for
//! replaying captured change streams and for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::types::{ChangeEvent, Domain, Session};

/// Message read from an open channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportMessage {
    /// A change to one entity
    Event(ChangeEvent),
    /// The transport dropped this many messages (receiver fell behind)
    Lagged(u64),
    /// The channel is no longer usable and must be reopened
    Disconnected(String),
}

/// An open realtime channel for one domain
#[async_trait]
pub trait RealtimeChannel: Send {
    /// Wait for the next message. `None` means the channel was closed.
    async fn next_message(&mut self) -> Option<TransportMessage>;

    /// Release the channel
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens realtime channels
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn open_channel(
        &self,
        domain: Domain,
        session: &Session,
    ) -> Result<Box<dyn RealtimeChannel>>;
}

#[derive(Debug, Clone)]
enum LocalFrame {
    Event(ChangeEvent),
    Drop(String),
}

#[derive(Default)]
struct LocalState {
    feeds: HashMap<Domain, broadcast::Sender<LocalFrame>>,
    failing_connects: HashMap<Domain, usize>,
    connect_log: HashMap<Domain, Vec<Instant>>,
    connect_delay: Duration,
}

struct LocalInner {
    state: Mutex<LocalState>,
    open_channels: AtomicUsize,
    capacity: usize,
}

/// In-process broadcast transport with fault injection
#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<LocalInner>,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl LocalTransport {
    /// Per-channel buffer used by `default()`
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Create a transport whose channels buffer up to `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                state: Mutex::new(LocalState::default()),
                open_channels: AtomicUsize::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LocalState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn feed(&self, state: &mut LocalState, domain: Domain) -> broadcast::Sender<LocalFrame> {
        state
            .feeds
            .entry(domain)
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone()
    }

    /// Push a change event to every open channel of its domain.
    ///
    /// Returns the number of channels it was delivered to.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut state = self.lock();
        let feed = self.feed(&mut state, event.domain);
        feed.send(LocalFrame::Event(event)).unwrap_or(0)
    }

    /// Drop every open channel of `domain`, as a network failure would
    pub fn disconnect(&self, domain: Domain, reason: &str) {
        let mut state = self.lock();
        let feed = self.feed(&mut state, domain);
        let _ = feed.send(LocalFrame::Drop(reason.to_string()));
        // Channels opened after this point get a fresh feed.
        state.feeds.remove(&domain);
    }

    /// Make the next `count` connection attempts for `domain` fail
    pub fn fail_next_connects(&self, domain: Domain, count: usize) {
        self.lock().failing_connects.insert(domain, count);
    }

    /// Delay every connection attempt
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// When each connection attempt for `domain` was made
    pub fn connect_attempts(&self, domain: Domain) -> Vec<Instant> {
        self.lock()
            .connect_log
            .get(&domain)
            .cloned()
            .unwrap_or_default()
    }

    /// Channels currently open across all domains
    pub fn open_channels(&self) -> usize {
        self.inner.open_channels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RealtimeTransport for LocalTransport {
    async fn open_channel(
        &self,
        domain: Domain,
        session: &Session,
    ) -> Result<Box<dyn RealtimeChannel>> {
        let delay = {
            let mut state = self.lock();
            state.connect_log.entry(domain).or_default().push(Instant::now());
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if session.access_token.is_empty() {
            return Err(Error::Unauthenticated);
        }

        let mut state = self.lock();
        if let Some(remaining) = state.failing_connects.get_mut(&domain) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Transport {
                    domain: domain.to_string(),
                    message: "connection refused".to_string(),
                });
            }
        }

        let receiver = self.feed(&mut state, domain).subscribe();
        self.inner.open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalChannel {
            receiver,
            inner: Arc::clone(&self.inner),
            released: false,
        }))
    }
}

struct LocalChannel {
    receiver: broadcast::Receiver<LocalFrame>,
    inner: Arc<LocalInner>,
    released: bool,
}

impl LocalChannel {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RealtimeChannel for LocalChannel {
    async fn next_message(&mut self) -> Option<TransportMessage> {
        if self.released {
            return None;
        }
        match self.receiver.recv().await {
            Ok(LocalFrame::Event(event)) => Some(TransportMessage::Event(event)),
            Ok(LocalFrame::Drop(reason)) => {
                self.release();
                Some(TransportMessage::Disconnected(reason))
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(TransportMessage::Lagged(missed))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut channel = self;
        channel.release();
        Ok(())
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.release();
    }
}
