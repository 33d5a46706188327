//! In-memory registry store
//!
//! The authoritative table of [`ServiceRecord`]s, keyed by service name, and
//! the only place staleness eviction is applied. The store never sweeps on its
//! own; the registry server (or any other owner) decides when to call
//! [`RegistryStore::remove_stale_services`].

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::types::{ServiceInfo, ServiceRecord, ServiceUpdate};

/// Thread-safe registry store. Clones share the same table.
#[derive(Clone)]
pub struct RegistryStore {
    services: Arc<DashMap<String, ServiceRecord>>,
    clock: Arc<dyn Clock>,
}

impl RegistryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    #[must_use]
    pub fn with_clock(clock: impl Clock) -> Self {
        Self {
            services: Arc::new(DashMap::new()),
            clock: Arc::new(clock),
        }
    }

    /// Insert or overwrite the record for `name`, stamping it alive now.
    pub fn register(&self, name: impl Into<String>, info: ServiceInfo) -> ServiceRecord {
        let name = name.into();
        let now = self.clock.now();

        match self.services.entry(name.clone()) {
            Entry::Occupied(mut entry) => {
                let last_heartbeat = entry.get().last_heartbeat.max(now);
                let record = ServiceRecord::new(name, info, last_heartbeat);
                entry.insert(record.clone());
                tracing::info!(service = %record.name, url = %record.url, "Service re-registered");
                record
            }
            Entry::Vacant(entry) => {
                let record = ServiceRecord::new(name, info, now);
                entry.insert(record.clone());
                tracing::info!(service = %record.name, url = %record.url, "Service registered");
                record
            }
        }
    }

    /// Merge `update` into an existing record and refresh its heartbeat.
    ///
    /// Returns `None` without creating anything when `name` is unknown.
    pub fn update(&self, name: &str, update: ServiceUpdate) -> Option<ServiceRecord> {
        let now = self.clock.now();
        let mut record = self.services.get_mut(name)?;
        update.apply_to(&mut record);
        record.last_heartbeat = record.last_heartbeat.max(now);
        tracing::info!(service = %name, "Service updated");
        Some(record.clone())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn get_all(&self) -> HashMap<String, ServiceRecord> {
        self.services
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Refresh the liveness timestamp of `name`.
    ///
    /// Returns the new timestamp, or `None` if the service is unknown.
    pub fn record_heartbeat(&self, name: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let mut record = self.services.get_mut(name)?;
        record.last_heartbeat = record.last_heartbeat.max(now);
        tracing::debug!(service = %name, "Heartbeat recorded");
        Some(record.last_heartbeat)
    }

    /// Evict every record whose last heartbeat precedes `now - max_age_secs`.
    ///
    /// Returns the names of the evicted services.
    pub fn remove_stale_services(&self, max_age_secs: u64) -> Vec<String> {
        let now = self.clock.now();
        let max_age = i64::try_from(max_age_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        let threshold = now
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut evicted = Vec::new();
        self.services.retain(|name, record| {
            if record.is_stale_at(threshold) {
                evicted.push(name.clone());
                false
            } else {
                true
            }
        });

        for name in &evicted {
            tracing::info!(service = %name, max_age_secs, "Evicted stale service");
        }

        evicted
    }

    /// Remove the record for `name`, returning whether one existed.
    pub fn delete(&self, name: &str) -> bool {
        let removed = self.services.remove(name).is_some();
        if removed {
            tracing::info!(service = %name, "Service removed");
        }
        removed
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.services.len()
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegistryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryStore")
            .field("services", &self.services.len())
            .finish_non_exhaustive()
    }
}
