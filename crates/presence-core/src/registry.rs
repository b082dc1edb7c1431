//! Registry of currently present clients.
//!
//! The registry maps a device id to its [`TrackedClient`] behind a single
//! mutex. The consumer task holds the lock for a whole lookup-then-mutate
//! sequence through [`ClientRegistry::lock`], and the sweep holds it for a full
//! expiry pass, so the two never interleave on the same record.
//!
//! Observers are notified synchronously while the lock is held. They receive a
//! snapshot of the client and must not call back into the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace};

use crate::client::TrackedClient;

/// Contract violations of the insert/update split.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// `upsert_new` was called for an id that is already tracked.
    #[error("client {device_id} is already registered")]
    AlreadyRegistered {
        /// Offending device id.
        device_id: String,
    },

    /// `update` was called for an id that is not tracked.
    #[error("client {device_id} is not registered")]
    NotRegistered {
        /// Offending device id.
        device_id: String,
    },
}

/// Result alias for registry operations.
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;

/// Receives add/remove notifications from a [`ClientRegistry`].
pub trait RegistryObserver: Send + Sync {
    /// A brand-new client was inserted.
    fn client_added(&self, client: &TrackedClient);

    /// A client was removed by a sweep.
    fn client_removed(&self, client: &TrackedClient);
}

#[derive(Default)]
struct RegistryState {
    clients: HashMap<String, TrackedClient>,
    observers: Vec<Arc<dyn RegistryObserver>>,
}

/// Concurrent store of tracked clients keyed by device id.
#[derive(Default)]
pub struct ClientRegistry {
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("clients", &self.len())
            .finish_non_exhaustive()
    }
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for add/remove notifications.
    pub fn subscribe(&self, observer: Arc<dyn RegistryObserver>) {
        self.lock().state.observers.push(observer);
    }

    /// Acquire the registry lock for a composite operation.
    ///
    /// A panic on another thread while holding the lock does not leave a
    /// half-written record behind (every mutation is a single map operation),
    /// so a poisoned lock is recovered rather than propagated.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Snapshot of the client with `device_id`, if tracked.
    #[must_use]
    pub fn lookup(&self, device_id: &str) -> Option<TrackedClient> {
        self.lock().lookup(device_id).cloned()
    }

    /// Insert a brand-new client, see [`RegistryGuard::upsert_new`].
    pub fn upsert_new(&self, client: TrackedClient) -> RegistryResult<()> {
        self.lock().upsert_new(client)
    }

    /// Replace an existing client, see [`RegistryGuard::update`].
    pub fn update(&self, client: TrackedClient) -> RegistryResult<()> {
        self.lock().update(client)
    }

    /// Remove every client idle for longer than `max_age_ms`, as of now.
    pub fn sweep(&self, max_age_ms: u64) -> Vec<TrackedClient> {
        self.sweep_at(Utc::now(), max_age_ms)
    }

    /// Remove every client whose `now - last_seen_at` exceeds `max_age_ms`.
    ///
    /// Each removed client is reported to the observers before the call
    /// returns; the removed records are returned in no particular order.
    pub fn sweep_at(&self, now: DateTime<Utc>, max_age_ms: u64) -> Vec<TrackedClient> {
        let max_age = i64::try_from(max_age_ms).unwrap_or(i64::MAX);
        let mut guard = self.lock();
        let state = &mut *guard.state;

        let stale: Vec<String> = state
            .clients
            .values()
            .filter(|client| client.idle_millis(now) > max_age)
            .map(|client| client.device_id().to_string())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for device_id in stale {
            if let Some(client) = state.clients.remove(&device_id) {
                debug!(device_id = %device_id, idle_ms = client.idle_millis(now), "Client expired");
                for observer in &state.observers {
                    observer.client_removed(&client);
                }
                removed.push(client);
            }
        }

        removed
    }

    /// Number of tracked clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().state.clients.len()
    }

    /// Whether no client is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all tracked clients, sorted.
    #[must_use]
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().state.clients.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}

/// Exclusive access to the registry for a lookup-then-mutate sequence.
pub struct RegistryGuard<'a> {
    state: MutexGuard<'a, RegistryState>,
}

impl RegistryGuard<'_> {
    /// The client with `device_id`, if tracked.
    #[must_use]
    pub fn lookup(&self, device_id: &str) -> Option<&TrackedClient> {
        self.state.clients.get(device_id)
    }

    /// Insert a brand-new client and notify observers.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if the id is already
    /// tracked; the registry is left unchanged.
    pub fn upsert_new(&mut self, client: TrackedClient) -> RegistryResult<()> {
        let state = &mut *self.state;
        if state.clients.contains_key(client.device_id()) {
            return Err(RegistryError::AlreadyRegistered {
                device_id: client.device_id().to_string(),
            });
        }

        trace!(device_id = client.device_id(), "Client registered");
        for observer in &state.observers {
            observer.client_added(&client);
        }
        state.clients.insert(client.device_id().to_string(), client);
        Ok(())
    }

    /// Replace the stored record for an already tracked client.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if the id is not tracked.
    pub fn update(&mut self, client: TrackedClient) -> RegistryResult<()> {
        match self.state.clients.get_mut(client.device_id()) {
            Some(slot) => {
                *slot = client;
                Ok(())
            }
            None => Err(RegistryError::NotRegistered {
                device_id: client.device_id().to_string(),
            }),
        }
    }
}
