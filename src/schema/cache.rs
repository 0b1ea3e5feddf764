//! Process-wide schema cache
//!
//! Ready snapshots live in one `DashMap`; in-flight fetches in another. The first
//! caller that finds a key missing or stale spawns the fetch and every other
//! caller for that key waits on the same `watch` channel. The fetch runs as its
//! own task, so a waiter going away never aborts it.

use crate::db::ConnectionParams;
use crate::error::{QueryError, Result};
use crate::schema::fetcher::SchemaFetcher;
use crate::schema::types::{ConnectionKey, SchemaCacheEntry, SchemaSnapshot};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|p| *p.into_inner())
    }
}

type FetchOutcome = Option<std::result::Result<Arc<SchemaSnapshot>, String>>;

/// Clears the in-flight slot when the fetch task ends, including by panic.
struct InFlightGuard {
    cache: Arc<SchemaCache>,
    key: ConnectionKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.cache.in_flight.remove(&self.key);
    }
}

pub struct SchemaCache {
    entries: DashMap<ConnectionKey, SchemaCacheEntry>,
    in_flight: DashMap<ConnectionKey, watch::Receiver<FetchOutcome>>,
    fetcher: Arc<dyn SchemaFetcher>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl SchemaCache {
    pub fn new(fetcher: Arc<dyn SchemaFetcher>, ttl: chrono::Duration) -> Self {
        Self::with_clock(fetcher, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(fetcher: Arc<dyn SchemaFetcher>, ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            fetcher,
            clock,
            ttl,
        }
    }

    /// Fresh snapshot for the connection, fetching on miss or expiry.
    pub async fn get(self: &Arc<Self>, params: &ConnectionParams) -> Result<Arc<SchemaSnapshot>> {
        let key = ConnectionKey::from(params);

        if let Some(snapshot) = self.fresh(&key) {
            debug!("Schema cache hit for {}", key);
            return Ok(snapshot);
        }

        let mut receiver = self.join_or_start_fetch(&key, params);
        let outcome = receiver
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| QueryError::Schema(format!("Schema fetch for {} was dropped", key)))?
            .clone();

        match outcome {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(message)) => Err(QueryError::Connection(message)),
            None => Err(QueryError::Schema(format!("Schema fetch for {} produced no result", key))),
        }
    }

    fn fresh(&self, key: &ConnectionKey) -> Option<Arc<SchemaSnapshot>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(self.clock.now(), self.ttl) {
            None
        } else {
            Some(Arc::clone(&entry.snapshot))
        }
    }

    fn join_or_start_fetch(self: &Arc<Self>, key: &ConnectionKey, params: &ConnectionParams) -> watch::Receiver<FetchOutcome> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().has_changed().is_ok() {
                    debug!("Joining in-flight schema fetch for {}", key);
                    return existing.get().clone();
                }
                warn!("Abandoned schema fetch for {}; starting a new one", key);
                let (tx, rx) = watch::channel(None);
                existing.insert(rx.clone());
                self.spawn_fetch(tx, key, params);
                rx
            }
            Entry::Vacant(slot) => {
                // Another caller may have finished a fetch between our miss and here
                if let Some(snapshot) = self.fresh(key) {
                    let (_tx, rx) = watch::channel(Some(Ok(snapshot)));
                    return rx;
                }

                let (tx, rx) = watch::channel(None);
                slot.insert(rx.clone());
                self.spawn_fetch(tx, key, params);
                rx
            }
        }
    }

    /// Runs the fetch as its own task and publishes the outcome on `tx`.
    fn spawn_fetch(self: &Arc<Self>, tx: watch::Sender<FetchOutcome>, key: &ConnectionKey, params: &ConnectionParams) {
        let cache = Arc::clone(self);
        let key = key.clone();
        let params = params.clone();
        let guard = InFlightGuard {
            cache: Arc::clone(&cache),
            key: key.clone(),
        };
        tokio::spawn(async move {
            info!("Fetching schema for {}", key);
            let outcome = match cache.fetcher.fetch(&params).await {
                Ok(snapshot) => {
                    let snapshot = Arc::new(snapshot);
                    cache.entries.insert(
                        key.clone(),
                        SchemaCacheEntry {
                            snapshot: Arc::clone(&snapshot),
                            fetched_at: cache.clock.now(),
                        },
                    );
                    info!("Cached schema for {} ({} tables)", key, snapshot.tables.len());
                    Ok(snapshot)
                }
                Err(e) => {
                    warn!("Schema fetch for {} failed: {}", key, e);
                    Err(match e {
                        QueryError::Connection(message) => message,
                        other => other.to_string(),
                    })
                }
            };
            drop(guard);
            let _ = tx.send(Some(outcome));
        });
    }

    pub fn invalidate(&self, params: &ConnectionParams) {
        self.entries.remove(&ConnectionKey::from(params));
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn cached_keys(&self) -> Vec<ConnectionKey> {
        let mut keys: Vec<ConnectionKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}
