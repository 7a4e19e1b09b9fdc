//! The set of connected subscribers.
//!
//! The registry is a single-writer / multi-reader structure:
//!
//! ```text
//!  transport (per connection)          Broadcaster (per line)
//!  add / remove ── write lock          snapshot ── read lock, held for the
//!                                                  whole fan-out of one line
//! ```
//!
//! Because a snapshot holds the read lock until the line has been delivered
//! to everyone in it, `remove` cannot complete while a delivery to that
//! subscriber is in flight, and no delivery starts after `remove` returns.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Capacity and duplicate violations are returned as `RegistryError`

mod sink;

pub use sink::{LineSink, SendError};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::debug;

use crate::config::DEFAULT_MAX_SUBSCRIBERS;

/// Identity of one subscriber, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A registered subscriber: its identity and its outbound sink.
#[derive(Clone)]
pub struct Subscriber {
    id: SubscriberId,
    sink: Arc<dyn LineSink>,
}

impl Subscriber {
    pub fn new(id: SubscriberId, sink: Arc<dyn LineSink>) -> Self {
        Self { id, sink }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn sink(&self) -> &dyn LineSink {
        self.sink.as_ref()
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("peer", &self.sink.peer())
            .finish()
    }
}

/// Concurrency-safe set of active subscribers.
///
/// Cheap to clone; clones share the same set.
#[derive(Clone)]
pub struct SubscriberRegistry {
    subscribers: Arc<RwLock<HashMap<SubscriberId, Subscriber>>>,
    max_subscribers: usize,
}

impl SubscriberRegistry {
    /// Creates an empty registry holding at most `max_subscribers`.
    pub fn new(max_subscribers: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            max_subscribers,
        }
    }

    /// Registers a subscriber.
    ///
    /// Waits for any in-progress broadcast to finish first.
    ///
    /// # Errors
    ///
    /// - `RegistryError::AlreadyRegistered` if the id is present
    /// - `RegistryError::Full` if the registry is at capacity
    pub async fn add(&self, subscriber: Subscriber) -> Result<(), RegistryError> {
        let mut subs = self.subscribers.write().await;
        let id = subscriber.id();

        if subs.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered { id });
        }
        if subs.len() >= self.max_subscribers {
            return Err(RegistryError::Full {
                max: self.max_subscribers,
            });
        }

        subs.insert(id, subscriber);
        debug!(subscriber = %id, total = subs.len(), "Added subscriber");
        Ok(())
    }

    /// Deregisters a subscriber. Returns false if it was not registered.
    ///
    /// Once this returns, no further delivery to `id` is attempted.
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let mut subs = self.subscribers.write().await;
        let removed = subs.remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, total = subs.len(), "Removed subscriber");
        }
        removed
    }

    pub async fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscribers.read().await.is_empty()
    }

    /// Takes shared access for one broadcast.
    ///
    /// Add and remove wait until the returned snapshot is dropped.
    pub async fn snapshot(&self) -> RegistrySnapshot<'_> {
        RegistrySnapshot {
            guard: self.subscribers.read().await,
        }
    }

    /// Removes every subscriber.
    pub async fn clear(&self) {
        self.subscribers.write().await.clear();
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBSCRIBERS)
    }
}

/// Broadcast-scoped read access to the registry.
pub struct RegistrySnapshot<'a> {
    guard: RwLockReadGuard<'a, HashMap<SubscriberId, Subscriber>>,
}

impl RegistrySnapshot<'_> {
    pub fn iter(&self) -> impl Iterator<Item = &Subscriber> {
        self.guard.values()
    }

    pub fn len(&self) -> usize {
        self.guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard.is_empty()
    }
}

/// Errors that can occur in registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Subscriber already registered: {id}")]
    AlreadyRegistered { id: SubscriberId },

    #[error("Too many subscribers (max: {max})")]
    Full { max: usize },
}
