//! External collaborator interfaces
//!
//! The reporting core consumes an event store, a whois/network-membership
//! lookup, a report persistence layer and a mailer as opaque collaborators.
//! This module defines those seams and ships in-memory implementations used
//! by the test suite and by ad hoc (non-durable) deployments.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use crate::error::{WardenError, WardenResult};
use crate::models::{Event, Severity};
use crate::report::EventReport;
use crate::threshold::RelapsedEvent;

/// Search parameters for fetching candidate events.
#[derive(Debug, Clone)]
pub struct EventSearchParams {
    /// Lower detection-time boundary (inclusive)
    pub detect_from: DateTime<Utc>,
    /// Upper detection-time boundary (exclusive)
    pub detect_to: DateTime<Utc>,
    /// Abuse groups to match against resolved abuse contacts
    pub groups: Vec<String>,
    pub severities: Vec<Severity>,
    /// Categories to match (or exclude, see `exclude_categories`)
    pub categories: Vec<String>,
    /// When set, `categories` is an exclusion list instead of a match list
    pub exclude_categories: bool,
}

/// Query interface of the external event store, including the threshold
/// record tables backing the durable thresholding cache.
pub trait EventStore: Send + Sync {
    /// Fetch candidate events; returns the match count alongside the batch.
    fn search_events(&self, params: &EventSearchParams) -> WardenResult<(usize, Vec<Event>)>;

    /// Events whose thresholding window expired as of `ttl` but which
    /// accumulated hit registrations within the relapse window.
    fn search_relapsed_events(
        &self,
        group: &str,
        severity: Severity,
        ttl: DateTime<Utc>,
    ) -> WardenResult<Vec<RelapsedEvent>>;

    /// Create or refresh a threshold record. Refreshing is monotonic:
    /// the stored expiry never decreases.
    fn threshold_set(
        &self,
        key: &str,
        threshold_time: DateTime<Utc>,
        relapse_time: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> WardenResult<()>;

    /// True iff an active record exists for `key` with `expiry > reference`.
    fn threshold_check(&self, key: &str, reference: DateTime<Utc>) -> WardenResult<bool>;

    /// Register a suppressed event occurrence under a threshold key.
    /// A duplicate (event, key) registration yields
    /// [`WardenError::StorageIntegrity`].
    fn threshold_save(
        &self,
        event_id: &str,
        key: &str,
        group: &str,
        severity: Severity,
        create_time: DateTime<Utc>,
    ) -> WardenResult<()>;

    /// Remove threshold records whose expiry predates `ttl`; returns the
    /// number removed.
    fn thresholds_clean(&self, ttl: DateTime<Utc>) -> WardenResult<usize>;

    /// Remove hit registrations that are orphaned or predate their
    /// record's threshold window; returns the number removed.
    fn thresholded_events_clean(&self) -> WardenResult<usize>;
}

/// Network-membership lookup used during per-source filter exemption.
pub trait WhoisLookup: Send + Sync {
    /// Whether the given source address belongs to the registered networks.
    fn is_member(&self, source: &str) -> bool;
}

/// Report persistence with an explicit transactional commit boundary.
pub trait ReportPersistence: Send + Sync {
    fn save(&self, report: &EventReport) -> WardenResult<()>;
    fn commit(&self) -> WardenResult<()>;
}

/// Rendered notification handed to the mailer.
#[derive(Debug, Clone)]
pub struct ReportNotice {
    pub to: Vec<String>,
    pub subject: String,
    pub report_label: String,
    pub parent_label: Option<String>,
    pub severity: Severity,
    pub window_from: DateTime<Utc>,
    pub window_to: DateTime<Utc>,
    pub event_count: u64,
    /// Set for per-source extra reports
    pub source: Option<String>,
    pub testdata: bool,
    pub attachments: Vec<std::path::PathBuf>,
}

/// Delivery bookkeeping returned by the mailer.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub destinations: Vec<String>,
}

pub trait Mailer: Send + Sync {
    fn send(&self, notice: &ReportNotice) -> WardenResult<DeliveryReceipt>;
}

// ============================================================================
// CIDR-table whois
// ============================================================================

/// Whois lookup backed by a static table of the abuse group's networks.
pub struct NetworkWhois {
    networks: Vec<IpNetwork>,
}

impl NetworkWhois {
    pub fn new(networks: Vec<IpNetwork>) -> Self {
        Self { networks }
    }

    /// Build from network strings, rejecting malformed entries.
    pub fn from_strings(networks: &[String]) -> WardenResult<Self> {
        let parsed = networks
            .iter()
            .map(|n| {
                n.parse::<IpNetwork>()
                    .map_err(|e| WardenError::Config(format!("invalid network '{n}': {e}")))
            })
            .collect::<WardenResult<Vec<_>>>()?;
        Ok(Self::new(parsed))
    }
}

impl WhoisLookup for NetworkWhois {
    fn is_member(&self, source: &str) -> bool {
        if let Ok(addr) = source.parse::<IpAddr>() {
            return self.networks.iter().any(|net| net.contains(addr));
        }
        // CIDR-shaped sources are owned when they overlap a registered
        // range; two proper CIDR blocks overlap iff one contains the
        // other's network address.
        if let Ok(block) = source.parse::<IpNetwork>() {
            return self
                .networks
                .iter()
                .any(|net| net.contains(block.ip()) || block.contains(net.ip()));
        }
        false
    }
}

// ============================================================================
// In-memory event store
// ============================================================================

#[derive(Debug, Clone)]
struct ThresholdEntry {
    threshold_time: DateTime<Utc>,
    relapse_time: DateTime<Utc>,
    expiry: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct HitRegistration {
    event_id: String,
    key: String,
    group: String,
    severity: Severity,
    create_time: DateTime<Utc>,
}

/// Process-local [`EventStore`] keeping all records in memory.
///
/// Used by the test suite and by ad hoc evaluation runs. Not durable; the
/// live reporting pipeline should use a database-backed implementation.
#[derive(Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<Event>>,
    thresholds: RwLock<HashMap<String, ThresholdEntry>>,
    hits: RwLock<Vec<HitRegistration>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an event batch.
    pub fn insert_events(&self, events: impl IntoIterator<Item = Event>) {
        self.events.write().unwrap().extend(events);
    }

    /// Number of active threshold records (primarily for tests/metrics).
    pub fn threshold_count(&self) -> usize {
        self.thresholds.read().unwrap().len()
    }

    /// Number of hit registrations (primarily for tests/metrics).
    pub fn hit_count(&self) -> usize {
        self.hits.read().unwrap().len()
    }

    fn event_matches(event: &Event, params: &EventSearchParams) -> bool {
        if event.detect_time < params.detect_from || event.detect_time >= params.detect_to {
            return false;
        }
        if !params.groups.is_empty()
            && !event
                .ext
                .resolved_abuses
                .iter()
                .any(|g| params.groups.contains(g))
        {
            return false;
        }
        if !params.severities.is_empty() {
            let matched = event
                .ext
                .event_severity
                .as_deref()
                .and_then(|s| s.parse::<Severity>().ok())
                .map(|s| params.severities.contains(&s))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if !params.categories.is_empty() {
            let overlaps = event
                .category
                .iter()
                .any(|c| params.categories.contains(c));
            if params.exclude_categories {
                if overlaps {
                    return false;
                }
            } else if !overlaps {
                return false;
            }
        }
        true
    }
}

impl EventStore for MemoryEventStore {
    fn search_events(&self, params: &EventSearchParams) -> WardenResult<(usize, Vec<Event>)> {
        let events = self.events.read().unwrap();
        let matched: Vec<Event> = events
            .iter()
            .filter(|e| Self::event_matches(e, params))
            .cloned()
            .collect();
        Ok((matched.len(), matched))
    }

    fn search_relapsed_events(
        &self,
        group: &str,
        severity: Severity,
        ttl: DateTime<Utc>,
    ) -> WardenResult<Vec<RelapsedEvent>> {
        let thresholds = self.thresholds.read().unwrap();
        let hits = self.hits.read().unwrap();
        let events = self.events.read().unwrap();

        // Event id -> matched cache keys, preserving registration order.
        let mut keyed: HashMap<String, Vec<String>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for hit in hits.iter() {
            if hit.group != group || hit.severity != severity {
                continue;
            }
            let Some(entry) = thresholds.get(&hit.key) else {
                continue;
            };
            if entry.expiry > ttl || hit.create_time < entry.relapse_time {
                continue;
            }
            let keys = keyed.entry(hit.event_id.clone()).or_insert_with(|| {
                order.push(hit.event_id.clone());
                Vec::new()
            });
            if !keys.contains(&hit.key) {
                keys.push(hit.key.clone());
            }
        }

        let mut result = Vec::new();
        for event_id in order {
            let Some(event) = events.iter().find(|e| e.id == event_id) else {
                return Err(WardenError::Storage(format!(
                    "thresholded event '{event_id}' missing from event store"
                )));
            };
            result.push(RelapsedEvent {
                event: event.clone(),
                key_ids: keyed.remove(&event_id).unwrap_or_default(),
            });
        }
        Ok(result)
    }

    fn threshold_set(
        &self,
        key: &str,
        threshold_time: DateTime<Utc>,
        relapse_time: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> WardenResult<()> {
        let mut thresholds = self.thresholds.write().unwrap();
        match thresholds.get_mut(key) {
            Some(entry) => {
                // Monotonic refresh: the expiry never shrinks.
                entry.threshold_time = threshold_time;
                entry.relapse_time = relapse_time;
                entry.expiry = entry.expiry.max(expiry);
            }
            None => {
                thresholds.insert(
                    key.to_string(),
                    ThresholdEntry {
                        threshold_time,
                        relapse_time,
                        expiry,
                    },
                );
            }
        }
        Ok(())
    }

    fn threshold_check(&self, key: &str, reference: DateTime<Utc>) -> WardenResult<bool> {
        let thresholds = self.thresholds.read().unwrap();
        Ok(thresholds
            .get(key)
            .map(|entry| entry.expiry > reference)
            .unwrap_or(false))
    }

    fn threshold_save(
        &self,
        event_id: &str,
        key: &str,
        group: &str,
        severity: Severity,
        create_time: DateTime<Utc>,
    ) -> WardenResult<()> {
        let mut hits = self.hits.write().unwrap();
        if hits
            .iter()
            .any(|h| h.event_id == event_id && h.key == key)
        {
            return Err(WardenError::StorageIntegrity(format!(
                "event '{event_id}' already registered under key '{key}'"
            )));
        }
        hits.push(HitRegistration {
            event_id: event_id.to_string(),
            key: key.to_string(),
            group: group.to_string(),
            severity,
            create_time,
        });
        Ok(())
    }

    fn thresholds_clean(&self, ttl: DateTime<Utc>) -> WardenResult<usize> {
        let mut thresholds = self.thresholds.write().unwrap();
        let before = thresholds.len();
        thresholds.retain(|_, entry| entry.expiry >= ttl);
        Ok(before - thresholds.len())
    }

    fn thresholded_events_clean(&self) -> WardenResult<usize> {
        let thresholds = self.thresholds.read().unwrap();
        let mut hits = self.hits.write().unwrap();
        let before = hits.len();
        hits.retain(|hit| {
            thresholds
                .get(&hit.key)
                .map(|entry| hit.create_time >= entry.threshold_time)
                .unwrap_or(false)
        });
        Ok(before - hits.len())
    }
}

// ============================================================================
// In-memory persistence and mailer
// ============================================================================

/// [`ReportPersistence`] collecting saved reports in memory.
#[derive(Default)]
pub struct MemoryPersistence {
    saved: RwLock<Vec<EventReport>>,
    commits: RwLock<usize>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_reports(&self) -> Vec<EventReport> {
        self.saved.read().unwrap().clone()
    }

    pub fn commit_count(&self) -> usize {
        *self.commits.read().unwrap()
    }
}

impl ReportPersistence for MemoryPersistence {
    fn save(&self, report: &EventReport) -> WardenResult<()> {
        self.saved.write().unwrap().push(report.clone());
        Ok(())
    }

    fn commit(&self) -> WardenResult<()> {
        *self.commits.write().unwrap() += 1;
        Ok(())
    }
}

/// [`Mailer`] recording sent notices in memory.
#[derive(Default)]
pub struct MemoryMailer {
    sent: RwLock<Vec<ReportNotice>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_notices(&self) -> Vec<ReportNotice> {
        self.sent.read().unwrap().clone()
    }
}

impl Mailer for MemoryMailer {
    fn send(&self, notice: &ReportNotice) -> WardenResult<DeliveryReceipt> {
        self.sent.write().unwrap().push(notice.clone());
        Ok(DeliveryReceipt {
            destinations: notice.to.clone(),
        })
    }
}
