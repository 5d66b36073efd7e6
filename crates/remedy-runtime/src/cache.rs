//! Decision cache keyed by failure fingerprint.
//!
//! Backed by a moka future cache with LRU eviction at capacity and a
//! per-entry TTL (successes and refusals live for different lengths of
//! time). A background task sweeps expired entries on an interval so stale
//! entries disappear even when nobody reads them; reads never return an
//! expired entry regardless of the sweep.
//!
//! ## One evaluation per fingerprint
//!
//! Concurrent misses for the same fingerprint block and share. The first
//! caller runs the evaluation and receives an [`InFlightGuard`]; callers
//! arriving while it runs, or after it finished but before the guard is
//! dropped, receive the same result without evaluating. The leader holds
//! the guard until it has written the cache, which closes the window in
//! which a late caller could miss both the in-flight slot and the cache.
//!
//! ## Persistence
//!
//! [`DecisionCache::save_to`] and [`DecisionCache::load_from`] move live
//! entries through a JSON file. They return errors for the caller to log;
//! a failed save or load never affects the in-memory cache.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;

use remedy_core::{Fingerprint, HealDecision};

use crate::orchestrator::OrchestratorError;

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: u64,

    /// Lifetime of an accepted decision
    #[serde(with = "crate::config::humantime_duration")]
    pub success_ttl: Duration,

    /// Lifetime of a cached guardrail refusal
    #[serde(with = "crate::config::humantime_duration")]
    pub refusal_ttl: Duration,

    /// Interval of the background expiry sweep
    #[serde(with = "crate::config::humantime_duration")]
    pub sweep_interval: Duration,

    /// Where the engine loads the cache at startup and saves it at shutdown
    pub persist_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            success_ttl: Duration::from_secs(24 * 3600),
            refusal_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            persist_path: None,
        }
    }
}

/// Errors from cache persistence.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid cache file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Cache counters and size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: u64,
    pub max_size: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub in_flight: usize,
}

/// A live entry as written to durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub decision: HealDecision,
    pub inserted_at: DateTime<Utc>,
    #[serde(with = "crate::config::humantime_duration")]
    pub ttl: Duration,
    #[serde(default)]
    pub last_access: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hits: u64,
}

impl CacheEntry {
    /// Time left before expiry, or `None` once expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        let age = (now - self.inserted_at).to_std().unwrap_or(Duration::ZERO);
        self.ttl.checked_sub(age).filter(|d| !d.is_zero())
    }
}

/// Stored value. Access bookkeeping is interior so moka can hand out
/// cheap `Arc` clones.
#[derive(Debug)]
struct Slot {
    decision: HealDecision,
    inserted_at: DateTime<Utc>,
    ttl: Duration,
    /// Expiry measured from insertion into this process
    expires_in: Duration,
    hits: AtomicU64,
    last_access: Mutex<Option<DateTime<Utc>>>,
}

struct SlotExpiry;

impl Expiry<Fingerprint, Arc<Slot>> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &Arc<Slot>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_in)
    }

    fn expire_after_update(
        &self,
        _key: &Fingerprint,
        value: &Arc<Slot>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_in)
    }
}

/// Value shared by every caller of one in-flight evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluated {
    pub decision: HealDecision,
    /// Set when the leader found the decision already cached.
    pub from_cache: bool,
}

impl Evaluated {
    pub fn cached(decision: HealDecision) -> Self {
        Self {
            decision,
            from_cache: true,
        }
    }
}

impl From<HealDecision> for Evaluated {
    fn from(decision: HealDecision) -> Self {
        Self {
            decision,
            from_cache: false,
        }
    }
}

type Shared = Result<Evaluated, OrchestratorError>;
type InFlightMap = Arc<Mutex<HashMap<Fingerprint, Arc<OnceCell<Shared>>>>>;

/// Held by the caller that ran an evaluation. Dropping it releases the
/// fingerprint's in-flight slot.
pub struct InFlightGuard {
    map: InFlightMap,
    fingerprint: Fingerprint,
    cell: Arc<OnceCell<Shared>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut map = self.map.lock();
        if map
            .get(&self.fingerprint)
            .is_some_and(|c| Arc::ptr_eq(c, &self.cell))
        {
            map.remove(&self.fingerprint);
        }
    }
}

/// Result of [`DecisionCache::coalesce`].
pub struct Coalesced {
    pub result: Shared,
    /// `Some` for the caller whose evaluation ran.
    pub leader: Option<InFlightGuard>,
}

impl Coalesced {
    pub fn is_leader(&self) -> bool {
        self.leader.is_some()
    }
}

pub struct DecisionCache {
    cache: Cache<Fingerprint, Arc<Slot>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
    in_flight: InFlightMap,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DecisionCache {
    /// Build the cache. When called inside a tokio runtime, the expiry
    /// sweep is started on it.
    pub fn new(config: CacheConfig) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let counter = evictions.clone();

        let cache: Cache<Fingerprint, Arc<Slot>> = Cache::builder()
            .max_capacity(config.max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(SlotExpiry)
            .eviction_listener(move |_key, _value, cause| {
                if matches!(cause, RemovalCause::Size | RemovalCause::Expired) {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(sweep(
                cache.clone(),
                config.sweep_interval,
                shutdown_rx,
            ))),
            Err(_) => {
                tracing::debug!("No tokio runtime, cache expiry sweep disabled");
                None
            }
        };

        Self {
            cache,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            sweeper: Mutex::new(sweeper),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<HealDecision> {
        match self.cache.get(fingerprint).await {
            Some(slot) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                slot.hits.fetch_add(1, Ordering::Relaxed);
                *slot.last_access.lock() = Some(Utc::now());
                Some(slot.decision.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Read without touching hit/miss counters.
    pub async fn peek(&self, fingerprint: &Fingerprint) -> Option<HealDecision> {
        self.cache
            .get(fingerprint)
            .await
            .map(|slot| slot.decision.clone())
    }

    /// Insert or replace the decision for `fingerprint`, expiring after `ttl`.
    pub async fn put(&self, fingerprint: Fingerprint, decision: HealDecision, ttl: Duration) {
        let slot = Slot {
            decision,
            inserted_at: Utc::now(),
            ttl,
            expires_in: ttl,
            hits: AtomicU64::new(0),
            last_access: Mutex::new(None),
        };
        self.cache.insert(fingerprint, Arc::new(slot)).await;
    }

    pub async fn remove(&self, fingerprint: &Fingerprint) {
        self.cache.invalidate(fingerprint).await;
    }

    /// Run `evaluate` unless an evaluation for `fingerprint` is already in
    /// flight, in which case wait for and share its result.
    pub async fn coalesce<F, Fut>(&self, fingerprint: &Fingerprint, evaluate: F) -> Coalesced
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Shared>,
    {
        let cell = self
            .in_flight
            .lock()
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let ran = AtomicBool::new(false);
        let ran_ref = &ran;
        let result = cell
            .get_or_init(|| async move {
                ran_ref.store(true, Ordering::SeqCst);
                evaluate().await
            })
            .await
            .clone();

        let leader = ran.load(Ordering::SeqCst).then(|| InFlightGuard {
            map: self.in_flight.clone(),
            fingerprint: fingerprint.clone(),
            cell,
        });
        if leader.is_none() {
            tracing::debug!(fingerprint = %fingerprint.short(), "Shared in-flight evaluation");
        }

        Coalesced { result, leader }
    }

    /// Counters and current size. Pending maintenance is applied first so
    /// `size` is exact.
    pub async fn stats(&self) -> CacheStats {
        self.cache.run_pending_tasks().await;
        CacheStats {
            size: self.cache.entry_count(),
            max_size: self.config.max_entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            in_flight: self.in_flight.lock().len(),
        }
    }

    /// Drop every entry. Counters are kept.
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks().await;
    }

    /// Snapshot of live entries.
    pub fn export(&self) -> Vec<CacheEntry> {
        let now = Utc::now();
        let mut entries: Vec<CacheEntry> = self
            .cache
            .iter()
            .map(|(fingerprint, slot)| CacheEntry {
                fingerprint: (*fingerprint).clone(),
                decision: slot.decision.clone(),
                inserted_at: slot.inserted_at,
                ttl: slot.ttl,
                last_access: *slot.last_access.lock(),
                hits: slot.hits.load(Ordering::Relaxed),
            })
            .filter(|e| e.remaining_ttl(now).is_some())
            .collect();
        entries.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        entries
    }

    /// Restore entries, keeping each one's remaining lifetime. Expired
    /// entries are skipped. Returns how many were restored.
    pub async fn import(&self, entries: Vec<CacheEntry>) -> usize {
        let now = Utc::now();
        let mut restored = 0;
        for entry in entries {
            let Some(remaining) = entry.remaining_ttl(now) else {
                continue;
            };
            let slot = Slot {
                decision: entry.decision,
                inserted_at: entry.inserted_at,
                ttl: entry.ttl,
                expires_in: remaining,
                hits: AtomicU64::new(entry.hits),
                last_access: Mutex::new(entry.last_access),
            };
            self.cache.insert(entry.fingerprint, Arc::new(slot)).await;
            restored += 1;
        }
        restored
    }

    pub fn save_to(&self, path: &Path) -> Result<usize, PersistenceError> {
        let entries = self.export();
        let json = serde_json::to_string_pretty(&entries)?;
        fs::write(path, json).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), entries = entries.len(), "Decision cache saved");
        Ok(entries.len())
    }

    pub async fn load_from(&self, path: &Path) -> Result<usize, PersistenceError> {
        let json = fs::read_to_string(path).map_err(|source| PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<CacheEntry> = serde_json::from_str(&json)?;
        let restored = self.import(entries).await;
        tracing::debug!(path = %path.display(), restored, "Decision cache loaded");
        Ok(restored)
    }

    /// Stop the sweep task and wait for it to finish.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Cache sweep task ended abnormally");
            }
        }
        self.cache.run_pending_tasks().await;
    }
}

async fn sweep(
    cache: Cache<Fingerprint, Arc<Slot>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
    loop {
        tokio::select! {
            _ = ticker.tick() => cache.run_pending_tasks().await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
