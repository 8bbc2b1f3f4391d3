//! # hangout-core
//!
//! Realtime view-consistency layer for the hangout app.
//!
//! This library keeps local copies of a user's plans, friends, invitations
//! and notifications consistent with the backend while the app is open:
//! - Change subscriptions per domain with reconnect and backoff
//! - Debounced authoritative reloads
//! - Stale-write rejection and deferred deletes when merging events
//! - Unread counts recomputed after every change
//!
//! ## Architecture
//!
//! Data flows through three layers:
//! - **Transport:** realtime channels ([`transport`]) and REST reloads ([`backend`])
//! - **Reconciliation:** per-domain collections merged by [`reconcile`] and
//!   published by [`state`]
//! - **Presentation:** [`SyncService`] exposes snapshots, unread counts and
//!   observers
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hangout_core::{Config, LocalTransport, RestDataSource, Session, SyncService};
//!
//! # async fn run() -> hangout_core::Result<()> {
//! let config = Config::load()?;
//! let source = Arc::new(RestDataSource::new(config.backend.clone())?);
//! let service = SyncService::new(&config, Arc::new(LocalTransport::default()), source)?;
//!
//! service.on_session_acquired(Session::new("access-token"));
//! let mut counts = service.watch_unread_counts();
//! counts.changed().await.ok();
//! println!("{} unread", counts.borrow().total());
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use backend::{DataSource, MemoryDataSource, RestDataSource};
pub use config::Config;
pub use counter::{Section, UnreadCounts};
pub use error::{Error, Result};
pub use reconcile::{ApplyOutcome, Collection, Reconciler};
pub use scheduler::RefreshScheduler;
pub use service::{ConnectionSignal, SyncService};
pub use state::{ObserverHandle, StateStore};
pub use subscription::{SubscriptionManager, SubscriptionStatus};
pub use transport::{LocalTransport, RealtimeChannel, RealtimeTransport, TransportMessage};
pub use types::*;

// Public modules
pub mod backend;
pub mod config;
pub mod counter;
pub mod error;
pub mod format;
pub mod logging;
pub mod reconcile;
pub mod replay;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod subscription;
pub mod transport;
pub mod types;
