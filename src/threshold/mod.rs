//! Event thresholding caches
//!
//! Decides per (event, source) pair whether it duplicates a still-active
//! threshold window, and registers/refreshes windows. Two families of
//! implementations exist: process-local memory caches for single-pass
//! recurrence detection inside statistics evaluation, and a durable cache
//! backed by the external event store for the live reporting pipeline.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::error::{WardenError, WardenResult};
use crate::models::{Event, Severity};
use crate::services::EventStore;

/// Target name for thresholding operational logs
const TARGET_THRESHOLD: &str = "threshold";

/// Separator between the class and source components of a cache key.
const KEY_SEPARATOR: &str = "+++";

/// Relapsed event together with the cache keys that matched it.
#[derive(Debug, Clone)]
pub struct RelapsedEvent {
    pub event: Event,
    pub key_ids: Vec<String>,
}

/// Counts returned by a cache cleanup sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupStats {
    /// Expired threshold records removed
    pub thresholds: usize,
    /// Stale hit registrations removed
    pub events: usize,
}

/// Derive the canonical cache key for an event and source.
///
/// The key is the event class (falling back to the slash-joined sorted
/// category list when no class is set) joined with the source address.
/// Relapse detection depends on this derivation staying stable.
pub fn cache_key(event: &Event, source: Option<&str>) -> String {
    let class = match event.ext.event_class.as_deref() {
        Some(class) if !class.is_empty() => class.to_string(),
        _ => {
            let mut categories = event.category.clone();
            categories.sort();
            categories.join("/")
        }
    };
    format!("{}{}{}", class, KEY_SEPARATOR, source.unwrap_or(""))
}

/// Recover the source component of a cache key.
pub fn source_from_key(key: &str) -> &str {
    match key.split_once(KEY_SEPARATOR) {
        Some((_, source)) => source,
        None => key,
    }
}

/// Thresholding cache interface.
///
/// Storage errors propagate as [`WardenError::Storage`] and abort the
/// reporting unit; there is no fallback to "never thresholded" (duplicate
/// notification storms) nor to "always thresholded" (silently dropped
/// incidents).
pub trait ThresholdingCache: Send + Sync {
    /// True iff an active record exists for the derived key whose expiry
    /// lies beyond `reference`. No side effects.
    fn event_is_thresholded(
        &self,
        event: &Event,
        source: Option<&str>,
        reference: DateTime<Utc>,
    ) -> WardenResult<bool>;

    /// Create or refresh a threshold window. Refreshing extends the expiry
    /// monotonically; a flapping source can never reset itself into a
    /// shorter window.
    fn set_threshold(
        &self,
        event: &Event,
        source: Option<&str>,
        threshold_time: DateTime<Utc>,
        relapse_time: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> WardenResult<()>;

    /// Record a suppressed event occurrence for later relapse detection.
    fn register_hit(
        &self,
        event: &Event,
        source: Option<&str>,
        group: &str,
        severity: Severity,
        create_time: DateTime<Utc>,
    ) -> WardenResult<()>;

    /// Events whose window expired as of `ttl` but which accumulated hits
    /// within the relapse period.
    fn relapses(
        &self,
        group: &str,
        severity: Severity,
        ttl: DateTime<Utc>,
    ) -> WardenResult<Vec<RelapsedEvent>>;

    /// Remove records whose expiry predates `ttl`. Driven by a periodic
    /// external sweep, not by the reporting pipeline.
    fn cleanup(&self, ttl: DateTime<Utc>) -> WardenResult<CleanupStats>;

    /// Key derivation used by this cache; overridden by caches that pin
    /// the source component.
    fn key_for(&self, event: &Event, source: Option<&str>) -> String {
        cache_key(event, source)
    }
}

// ============================================================================
// Memory caches
// ============================================================================

/// Process-local cache tracking key presence only.
///
/// "Thresholded" means "the same key was seen earlier in this batch",
/// which is exactly the recurrence notion timeline statistics need.
/// Instantiate one per evaluation call; never share across units.
#[derive(Default)]
pub struct MemoryThresholdingCache {
    seen: RwLock<HashSet<String>>,
}

impl MemoryThresholdingCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThresholdingCache for MemoryThresholdingCache {
    fn event_is_thresholded(
        &self,
        event: &Event,
        source: Option<&str>,
        _reference: DateTime<Utc>,
    ) -> WardenResult<bool> {
        let key = self.key_for(event, source);
        Ok(self.seen.read().unwrap().contains(&key))
    }

    fn set_threshold(
        &self,
        event: &Event,
        source: Option<&str>,
        _threshold_time: DateTime<Utc>,
        _relapse_time: DateTime<Utc>,
        _expiry: DateTime<Utc>,
    ) -> WardenResult<()> {
        let key = self.key_for(event, source);
        self.seen.write().unwrap().insert(key);
        Ok(())
    }

    fn register_hit(
        &self,
        _event: &Event,
        _source: Option<&str>,
        _group: &str,
        _severity: Severity,
        _create_time: DateTime<Utc>,
    ) -> WardenResult<()> {
        Ok(())
    }

    fn relapses(
        &self,
        _group: &str,
        _severity: Severity,
        _ttl: DateTime<Utc>,
    ) -> WardenResult<Vec<RelapsedEvent>> {
        Ok(Vec::new())
    }

    fn cleanup(&self, _ttl: DateTime<Utc>) -> WardenResult<CleanupStats> {
        let mut seen = self.seen.write().unwrap();
        let stats = CleanupStats {
            thresholds: seen.len(),
            events: 0,
        };
        seen.clear();
        Ok(stats)
    }
}

/// Memory cache that pins the source component of every key to one host.
///
/// Used by single-host statistics where recurrence must be judged per
/// event class regardless of which addresses an event lists.
pub struct SingleSourceThresholdingCache {
    inner: MemoryThresholdingCache,
    source: String,
}

impl SingleSourceThresholdingCache {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            inner: MemoryThresholdingCache::new(),
            source: source.into(),
        }
    }
}

impl ThresholdingCache for SingleSourceThresholdingCache {
    fn event_is_thresholded(
        &self,
        event: &Event,
        _source: Option<&str>,
        reference: DateTime<Utc>,
    ) -> WardenResult<bool> {
        self.inner
            .event_is_thresholded(event, Some(&self.source), reference)
    }

    fn set_threshold(
        &self,
        event: &Event,
        _source: Option<&str>,
        threshold_time: DateTime<Utc>,
        relapse_time: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> WardenResult<()> {
        self.inner
            .set_threshold(event, Some(&self.source), threshold_time, relapse_time, expiry)
    }

    fn register_hit(
        &self,
        _event: &Event,
        _source: Option<&str>,
        _group: &str,
        _severity: Severity,
        _create_time: DateTime<Utc>,
    ) -> WardenResult<()> {
        Ok(())
    }

    fn relapses(
        &self,
        _group: &str,
        _severity: Severity,
        _ttl: DateTime<Utc>,
    ) -> WardenResult<Vec<RelapsedEvent>> {
        Ok(Vec::new())
    }

    fn cleanup(&self, ttl: DateTime<Utc>) -> WardenResult<CleanupStats> {
        self.inner.cleanup(ttl)
    }

    fn key_for(&self, event: &Event, _source: Option<&str>) -> String {
        cache_key(event, Some(&self.source))
    }
}

/// Cache that never thresholds anything. Disables the feature for ad hoc
/// reports.
#[derive(Default)]
pub struct NoThresholdingCache;

impl NoThresholdingCache {
    pub fn new() -> Self {
        Self
    }
}

impl ThresholdingCache for NoThresholdingCache {
    fn event_is_thresholded(
        &self,
        _event: &Event,
        _source: Option<&str>,
        _reference: DateTime<Utc>,
    ) -> WardenResult<bool> {
        Ok(false)
    }

    fn set_threshold(
        &self,
        _event: &Event,
        _source: Option<&str>,
        _threshold_time: DateTime<Utc>,
        _relapse_time: DateTime<Utc>,
        _expiry: DateTime<Utc>,
    ) -> WardenResult<()> {
        Ok(())
    }

    fn register_hit(
        &self,
        _event: &Event,
        _source: Option<&str>,
        _group: &str,
        _severity: Severity,
        _create_time: DateTime<Utc>,
    ) -> WardenResult<()> {
        Ok(())
    }

    fn relapses(
        &self,
        _group: &str,
        _severity: Severity,
        _ttl: DateTime<Utc>,
    ) -> WardenResult<Vec<RelapsedEvent>> {
        Ok(Vec::new())
    }

    fn cleanup(&self, _ttl: DateTime<Utc>) -> WardenResult<CleanupStats> {
        Ok(CleanupStats::default())
    }
}

// ============================================================================
// Durable cache
// ============================================================================

/// Durable thresholding cache backed by the external event store.
///
/// Check and set results are memoized per instance so a reporting run
/// touches the backend at most once per key. The memo is advisory only;
/// correctness under concurrent units rests on the backend serializing
/// per-key updates.
pub struct StorageThresholdingCache {
    store: Arc<dyn EventStore>,
    memcache: RwLock<HashMap<String, bool>>,
}

impl StorageThresholdingCache {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            memcache: RwLock::new(HashMap::new()),
        }
    }
}

impl ThresholdingCache for StorageThresholdingCache {
    fn event_is_thresholded(
        &self,
        event: &Event,
        source: Option<&str>,
        reference: DateTime<Utc>,
    ) -> WardenResult<bool> {
        let key = self.key_for(event, source);
        if let Some(&known) = self.memcache.read().unwrap().get(&key) {
            return Ok(known);
        }
        let active = self.store.threshold_check(&key, reference)?;
        self.memcache.write().unwrap().insert(key, active);
        Ok(active)
    }

    fn set_threshold(
        &self,
        event: &Event,
        source: Option<&str>,
        threshold_time: DateTime<Utc>,
        relapse_time: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> WardenResult<()> {
        let key = self.key_for(event, source);
        if self
            .memcache
            .read()
            .unwrap()
            .get(&key)
            .copied()
            .unwrap_or(false)
        {
            return Ok(());
        }
        match self
            .store
            .threshold_set(&key, threshold_time, relapse_time, expiry)
        {
            Ok(()) => {
                info!(
                    target: TARGET_THRESHOLD,
                    key = %key,
                    expiry = %expiry,
                    relapse = %relapse_time,
                    threshold = %threshold_time,
                    "Updated thresholding cache record"
                );
            }
            Err(WardenError::StorageIntegrity(_)) => {
                // Backend signalled an existing record; its expiry was
                // prolonged rather than replaced.
                info!(
                    target: TARGET_THRESHOLD,
                    key = %key,
                    expiry = %expiry,
                    "Prolonged thresholding cache record"
                );
            }
            Err(err) => return Err(err),
        }
        self.memcache.write().unwrap().insert(key, true);
        Ok(())
    }

    fn register_hit(
        &self,
        event: &Event,
        source: Option<&str>,
        group: &str,
        severity: Severity,
        create_time: DateTime<Utc>,
    ) -> WardenResult<()> {
        let key = self.key_for(event, source);
        match self
            .store
            .threshold_save(&event.id, &key, group, severity, create_time)
        {
            Ok(()) => {
                info!(
                    target: TARGET_THRESHOLD,
                    key = %key,
                    event = %event.id,
                    group = %group,
                    severity = %severity,
                    "Recorded thresholded event"
                );
                Ok(())
            }
            Err(WardenError::StorageIntegrity(_)) => {
                debug!(
                    target: TARGET_THRESHOLD,
                    key = %key,
                    event = %event.id,
                    "Event already registered as thresholded"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn relapses(
        &self,
        group: &str,
        severity: Severity,
        ttl: DateTime<Utc>,
    ) -> WardenResult<Vec<RelapsedEvent>> {
        self.store.search_relapsed_events(group, severity, ttl)
    }

    fn cleanup(&self, ttl: DateTime<Utc>) -> WardenResult<CleanupStats> {
        self.memcache.write().unwrap().clear();

        let thresholds = self.store.thresholds_clean(ttl)?;
        info!(
            target: TARGET_THRESHOLD,
            count = thresholds,
            cutoff = %ttl,
            "Cleaned expired records from thresholding cache"
        );
        let events = self.store.thresholded_events_clean()?;
        info!(
            target: TARGET_THRESHOLD,
            count = events,
            "Cleaned stale records from thresholded event registry"
        );
        Ok(CleanupStats { thresholds, events })
    }
}
