//! In-process store implementation.
//!
//! Backs the control plane with a `RwLock`-guarded map per kind. Versions
//! come from one monotone counter, so a version token observed on any
//! object is never reused. Watch events fan out over a tokio broadcast
//! channel; slow subscribers lag (and observe `Lagged`) rather than block
//! writers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::broadcast;

use super::{AdmissionHook, Resource, ResourceKey, Stored, WatchEvent};
use crate::error::{Error, Result};

/// Capacity of the watch broadcast channel.
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// How many times CAS-retry helpers re-read on conflict before giving up.
const CAS_RETRY_LIMIT: u32 = 8;

/// A versioned, watched map of one resource kind.
pub struct TypedStore<T: Resource> {
    objects: RwLock<HashMap<ResourceKey, Stored<T>>>,
    hooks: RwLock<Vec<Box<dyn AdmissionHook<T>>>>,
    next_version: AtomicU64,
    watch_tx: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Resource> Default for TypedStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> TypedStore<T> {
    /// Creates an empty store with no admission hooks.
    #[must_use]
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            hooks: RwLock::new(Vec::new()),
            next_version: AtomicU64::new(1),
            watch_tx,
        }
    }

    /// Registers an admission hook. Hooks run in registration order on
    /// every subsequent create/update.
    pub fn register_hook(&self, hook: Box<dyn AdmissionHook<T>>) {
        self.hooks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(hook);
    }

    /// Subscribes to change events.
    #[must_use]
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.watch_tx.subscribe()
    }

    /// Creates a resource.
    ///
    /// # Errors
    ///
    /// `Conflict` if the key already exists; any admission hook error.
    pub fn create(&self, resource: T) -> Result<Stored<T>> {
        let key = resource.key();
        {
            let hooks = self
                .hooks
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for hook in hooks.iter() {
                hook.validate_create(&resource)?;
            }
        }

        let stored = {
            let mut objects = self
                .objects
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if objects.contains_key(&key) {
                return Err(Error::conflict(
                    "AlreadyExists",
                    format!("{} {key} already exists", T::KIND),
                ));
            }
            let stored = Stored {
                resource,
                version: self.next_version.fetch_add(1, Ordering::Relaxed),
            };
            objects.insert(key, stored.clone());
            stored
        };

        let _ = self.watch_tx.send(WatchEvent::Created(stored.clone()));
        Ok(stored)
    }

    /// Fetches a resource by key.
    #[must_use]
    pub fn get(&self, tenant: &str, name: &str) -> Option<Stored<T>> {
        self.objects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&ResourceKey::new(tenant, name))
            .cloned()
    }

    /// Lists all resources in a tenant.
    #[must_use]
    pub fn list(&self, tenant: &str) -> Vec<Stored<T>> {
        self.objects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .filter(|s| s.resource.tenant() == tenant)
            .cloned()
            .collect()
    }

    /// Lists all resources across tenants.
    #[must_use]
    pub fn list_all(&self) -> Vec<Stored<T>> {
        self.objects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Replaces a resource under compare-and-set.
    ///
    /// # Errors
    ///
    /// `Conflict` with reason `StaleVersion` when `expected_version` does
    /// not match; `NotFound` when the key is absent; any admission hook
    /// error.
    pub fn update(&self, expected_version: u64, resource: T) -> Result<Stored<T>> {
        let key = resource.key();

        // Snapshot the old object for hook validation outside the write
        // lock; the version check under the lock makes a stale snapshot
        // harmless (the CAS would fail anyway).
        let old = self.get(key.tenant.as_str(), key.name.as_str()).ok_or_else(|| {
            Error::not_found("NoSuchResource", format!("{} {key} not found", T::KIND))
        })?;
        if old.version != expected_version {
            return Err(stale_version::<T>(&key, expected_version, old.version));
        }
        {
            let hooks = self
                .hooks
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for hook in hooks.iter() {
                hook.validate_update(&old.resource, &resource)?;
            }
        }

        let stored = {
            let mut objects = self
                .objects
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let current = objects.get(&key).ok_or_else(|| {
                Error::not_found("NoSuchResource", format!("{} {key} not found", T::KIND))
            })?;
            if current.version != expected_version {
                return Err(stale_version::<T>(&key, expected_version, current.version));
            }
            let stored = Stored {
                resource,
                version: self.next_version.fetch_add(1, Ordering::Relaxed),
            };
            objects.insert(key, stored.clone());
            stored
        };

        let _ = self.watch_tx.send(WatchEvent::Updated(stored.clone()));
        Ok(stored)
    }

    /// Read-modify-write helper: fetches the object, applies `mutate`, and
    /// commits under CAS, retrying on `StaleVersion` up to a small bound.
    ///
    /// # Errors
    ///
    /// `NotFound` when the key is absent, `Conflict` when the retry bound
    /// is exhausted, or any error returned by `mutate` / admission hooks.
    pub fn update_with(
        &self,
        tenant: &str,
        name: &str,
        mut mutate: impl FnMut(&mut T) -> Result<()>,
    ) -> Result<Stored<T>> {
        for _ in 0..CAS_RETRY_LIMIT {
            let current = self.get(tenant, name).ok_or_else(|| {
                Error::not_found(
                    "NoSuchResource",
                    format!("{} {tenant}/{name} not found", T::KIND),
                )
            })?;
            let mut updated = current.resource.clone();
            mutate(&mut updated)?;
            match self.update(current.version, updated) {
                Ok(stored) => return Ok(stored),
                Err(e) if e.reason() == "StaleVersion" => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(
            "RetryExhausted",
            format!("{} {tenant}/{name}: too many concurrent writers", T::KIND),
        ))
    }

    /// Deletes a resource.
    ///
    /// # Errors
    ///
    /// `NotFound` when the key is absent.
    pub fn delete(&self, tenant: &str, name: &str) -> Result<T> {
        let key = ResourceKey::new(tenant, name);
        let removed = {
            let mut objects = self
                .objects
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            objects.remove(&key).ok_or_else(|| {
                Error::not_found("NoSuchResource", format!("{} {key} not found", T::KIND))
            })?
        };
        let _ = self.watch_tx.send(WatchEvent::Deleted(key));
        Ok(removed.resource)
    }
}

fn stale_version<T: Resource>(key: &ResourceKey, expected: u64, actual: u64) -> Error {
    Error::conflict(
        "StaleVersion",
        format!("{} {key}: expected version {expected}, found {actual}", T::KIND),
    )
}
