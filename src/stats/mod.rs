//! Statistics aggregation module
//!
//! Builds count-by-category summaries from event batches, with bounded
//! "toplist" output, timeline bucketing and weekday x hour scatter grids.
//! Sub-window toplists are masked against the global toplist so every time
//! slice of a chart shares the same series set.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::TruncationConfig;
use crate::error::{WardenError, WardenResult};
use crate::models::{Event, ReportType, KEY_UNKNOWN};
use crate::report::EventReport;
use crate::threshold::{
    MemoryThresholdingCache, SingleSourceThresholdingCache, ThresholdingCache,
};

/// Sentinel key absorbing counts trimmed out of a toplist.
pub const KEY_REST: &str = "__REST__";

/// Optimal timeline steps in seconds. Populated with values that round
/// nicely in time calculations: seconds, minutes, hours, then days.
const OPTIMAL_STEPS: [i64; 38] = [
    1,
    2,
    3,
    4,
    5,
    6,
    10,
    12,
    15,
    20,
    30,
    60,
    2 * 60,
    3 * 60,
    4 * 60,
    5 * 60,
    6 * 60,
    10 * 60,
    12 * 60,
    15 * 60,
    20 * 60,
    30 * 60,
    3600,
    2 * 3600,
    3 * 3600,
    4 * 3600,
    6 * 3600,
    8 * 3600,
    12 * 3600,
    86_400,
    2 * 86_400,
    3 * 86_400,
    4 * 86_400,
    5 * 86_400,
    6 * 86_400,
    7 * 86_400,
    10 * 86_400,
    14 * 86_400,
];

/// Per-key event counter for one statistical category.
pub type Counter = BTreeMap<String, u64>;

/// Statistical categories tracked per event batch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StatCategory {
    Ips,
    Analyzers,
    Categories,
    CategorySets,
    Detectors,
    #[serde(rename = "detectorsws")]
    DetectorSoftware,
    Abuses,
    Asns,
    Countries,
    Classes,
    Severities,
    SourcePorts,
    TargetPorts,
    SourceTypes,
    TargetTypes,
    Protocols,
    Emails,
}

impl StatCategory {
    /// Every tracked category.
    pub const ALL: [StatCategory; 17] = [
        StatCategory::Ips,
        StatCategory::Analyzers,
        StatCategory::Categories,
        StatCategory::CategorySets,
        StatCategory::Detectors,
        StatCategory::DetectorSoftware,
        StatCategory::Abuses,
        StatCategory::Asns,
        StatCategory::Countries,
        StatCategory::Classes,
        StatCategory::Severities,
        StatCategory::SourcePorts,
        StatCategory::TargetPorts,
        StatCategory::SourceTypes,
        StatCategory::TargetTypes,
        StatCategory::Protocols,
        StatCategory::Emails,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatCategory::Ips => "ips",
            StatCategory::Analyzers => "analyzers",
            StatCategory::Categories => "categories",
            StatCategory::CategorySets => "category_sets",
            StatCategory::Detectors => "detectors",
            StatCategory::DetectorSoftware => "detectorsws",
            StatCategory::Abuses => "abuses",
            StatCategory::Asns => "asns",
            StatCategory::Countries => "countries",
            StatCategory::Classes => "classes",
            StatCategory::Severities => "severities",
            StatCategory::SourcePorts => "source_ports",
            StatCategory::TargetPorts => "target_ports",
            StatCategory::SourceTypes => "source_types",
            StatCategory::TargetTypes => "target_types",
            StatCategory::Protocols => "protocols",
            StatCategory::Emails => "emails",
        }
    }

    /// Bounded-cardinality categories that keep the relaxed truncation
    /// threshold unless truncation is forced.
    fn truncation_whitelisted(&self) -> bool {
        matches!(
            self,
            StatCategory::Analyzers
                | StatCategory::Categories
                | StatCategory::CategorySets
                | StatCategory::Detectors
                | StatCategory::DetectorSoftware
                | StatCategory::SourceTypes
                | StatCategory::TargetTypes
                | StatCategory::Protocols
                | StatCategory::Abuses
                | StatCategory::Countries
                | StatCategory::Classes
                | StatCategory::Severities
        )
    }
}

/// Primary aggregations: extract all values, count the unknown sentinel
/// when empty.
const PRIMARY_AGGREGATIONS: [(StatCategory, fn(&Event) -> Vec<String>); 9] = [
    (StatCategory::Ips, extract_source_ips),
    (StatCategory::Analyzers, extract_analyzers),
    (StatCategory::Categories, extract_categories),
    (StatCategory::Detectors, extract_detectors),
    (StatCategory::Abuses, extract_abuses),
    (StatCategory::Asns, extract_asns),
    (StatCategory::Countries, extract_countries),
    (StatCategory::Classes, extract_classes),
    (StatCategory::Severities, extract_severities),
];

/// Secondary aggregations: extract all values, skip silently when empty.
const SECONDARY_AGGREGATIONS: [(StatCategory, fn(&Event) -> Vec<String>); 5] = [
    (StatCategory::SourcePorts, extract_source_ports),
    (StatCategory::TargetPorts, extract_target_ports),
    (StatCategory::SourceTypes, extract_source_types),
    (StatCategory::TargetTypes, extract_target_types),
    (StatCategory::Protocols, extract_protocols),
];

/// Categories excluded from single-host statistics; they are constant for
/// one host and would only clutter the output.
const SKIP_SINGLEHOST: [StatCategory; 4] = [
    StatCategory::Ips,
    StatCategory::Abuses,
    StatCategory::Asns,
    StatCategory::Countries,
];

fn extract_source_ips(event: &Event) -> Vec<String> {
    event.source_addresses()
}

fn extract_analyzers(event: &Event) -> Vec<String> {
    event.analyzer_software().to_vec()
}

fn extract_categories(event: &Event) -> Vec<String> {
    event.category.clone()
}

fn extract_detectors(event: &Event) -> Vec<String> {
    event.detector_name().map(|n| vec![n.to_string()]).unwrap_or_default()
}

fn extract_abuses(event: &Event) -> Vec<String> {
    event.ext.resolved_abuses.clone()
}

fn extract_asns(event: &Event) -> Vec<String> {
    event
        .ext
        .source_resolved_asn
        .iter()
        .map(u32::to_string)
        .collect()
}

fn extract_countries(event: &Event) -> Vec<String> {
    event.ext.source_resolved_country.clone()
}

fn extract_classes(event: &Event) -> Vec<String> {
    event.ext.event_class.iter().cloned().collect()
}

fn extract_severities(event: &Event) -> Vec<String> {
    event.ext.event_severity.iter().cloned().collect()
}

fn extract_source_ports(event: &Event) -> Vec<String> {
    event
        .source
        .iter()
        .flat_map(|e| e.port.iter().map(u16::to_string))
        .collect()
}

fn extract_target_ports(event: &Event) -> Vec<String> {
    event
        .target
        .iter()
        .flat_map(|e| e.port.iter().map(u16::to_string))
        .collect()
}

fn extract_source_types(event: &Event) -> Vec<String> {
    event
        .source
        .iter()
        .flat_map(|e| e.endpoint_type.iter().cloned())
        .collect()
}

fn extract_target_types(event: &Event) -> Vec<String> {
    event
        .target
        .iter()
        .flat_map(|e| e.endpoint_type.iter().cloned())
        .collect()
}

fn extract_protocols(event: &Event) -> Vec<String> {
    event
        .source
        .iter()
        .chain(event.target.iter())
        .flat_map(|e| e.proto.iter().cloned())
        .collect()
}

// ============================================================================
// Statistics bundle
// ============================================================================

/// Timeline layout: snapped boundaries, step size and bucket count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineConfig {
    pub dt_from: DateTime<Utc>,
    pub dt_to: DateTime<Utc>,
    pub step_secs: i64,
    pub count: usize,
}

impl TimelineConfig {
    pub fn step(&self) -> Duration {
        Duration::seconds(self.step_secs)
    }

    /// Bucket start times, ascending.
    pub fn bucket_starts(&self) -> Vec<DateTime<Utc>> {
        let mut starts = Vec::with_capacity(self.count);
        let mut cursor = self.dt_from;
        for _ in 0..self.count {
            starts.push(cursor);
            cursor += self.step();
        }
        starts
    }
}

/// One timeline window and its statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineBucket {
    pub start: DateTime<Utc>,
    pub stats: StatsBundle,
}

/// Ordered timeline windows plus their layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeline {
    pub cfg: TimelineConfig,
    pub buckets: Vec<TimelineBucket>,
}

/// Weekday x hour grid (7 rows of 24 cells).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeScatter {
    pub grid: Vec<Vec<StatsBundle>>,
}

impl TimeScatter {
    fn new() -> Self {
        Self {
            grid: (0..7)
                .map(|_| (0..24).map(|_| StatsBundle::default()).collect())
                .collect(),
        }
    }
}

/// Typed statistics record for one event set or time window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsBundle {
    /// Number of alerts in the evaluated batch
    #[serde(default)]
    pub cnt_alerts: u64,
    /// Number of events included
    #[serde(default)]
    pub cnt_events: u64,
    /// Events whose dedup key was already seen in the batch
    #[serde(default)]
    pub cnt_recurring: u64,
    /// Events seen for the first time in the batch
    #[serde(default)]
    pub cnt_unique: u64,

    /// Identifiers of the included events; dropped at truncation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list_ids: Vec<String>,

    /// Per-category counters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<StatCategory, Counter>,

    // Report aggregation counters, populated by aggregate_report_stats.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cnt_reports: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cnt_reports_summary: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cnt_reports_extra: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cnt_emails: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cnt_events_all: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cnt_events_filtered: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cnt_events_thresholded: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cnt_events_new: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cnt_events_relapsed: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dt_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dt_to: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Timeline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timescatter: Option<TimeScatter>,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl StatsBundle {
    /// Counter for one category, if any key was counted.
    pub fn counter(&self, category: StatCategory) -> Option<&Counter> {
        self.counters.get(&category)
    }

    /// Increment one key of one category.
    pub fn counter_inc(&mut self, category: StatCategory, key: &str, increment: u64) {
        *self
            .counters
            .entry(category)
            .or_default()
            .entry(key.to_string())
            .or_insert(0) += increment;
    }

    /// Increment several keys of one category.
    pub fn counter_inc_all<I, S>(&mut self, category: StatCategory, keys: I, increment: u64)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in keys {
            self.counter_inc(category, key.as_ref(), increment);
        }
    }

    /// Include one event into this record.
    pub fn include_event(&mut self, event: &Event, recurring: bool, skip: &[StatCategory]) {
        self.cnt_events += 1;
        if recurring {
            self.cnt_recurring += 1;
        }

        let mut categories_seen: Vec<String> = Vec::new();
        let mut detectors_seen: Vec<String> = Vec::new();
        let mut analyzers_seen: Vec<String> = Vec::new();

        for (category, extract) in PRIMARY_AGGREGATIONS {
            if skip.contains(&category) {
                continue;
            }
            let values = dedup_preserving_order(extract(event));
            if values.is_empty() {
                self.counter_inc(category, KEY_UNKNOWN, 1);
            } else {
                for value in &values {
                    self.counter_inc(category, value, 1);
                }
            }
            match category {
                StatCategory::Categories => categories_seen = values,
                StatCategory::Detectors => detectors_seen = values,
                StatCategory::Analyzers => analyzers_seen = values,
                _ => {}
            }
        }

        for (category, extract) in SECONDARY_AGGREGATIONS {
            if skip.contains(&category) {
                continue;
            }
            for value in dedup_preserving_order(extract(event)) {
                self.counter_inc(category, &value, 1);
            }
        }

        // Derived keys capturing category co-occurrence and the
        // detector/software pairing.
        if !categories_seen.is_empty() && !skip.contains(&StatCategory::CategorySets) {
            let mut sorted = categories_seen;
            sorted.sort();
            self.counter_inc(StatCategory::CategorySets, &sorted.join("/"), 1);
        }
        if !skip.contains(&StatCategory::DetectorSoftware) {
            if !detectors_seen.is_empty() && !analyzers_seen.is_empty() {
                for detector in &detectors_seen {
                    for analyzer in &analyzers_seen {
                        let key = format!("{detector}/{analyzer}");
                        self.counter_inc(StatCategory::DetectorSoftware, &key, 1);
                    }
                }
            } else {
                for detector in &detectors_seen {
                    self.counter_inc(StatCategory::DetectorSoftware, detector, 1);
                }
            }
        }
    }

    /// Derive the unique/recurring split once counting is done.
    pub fn finalize_secondary(&mut self) {
        self.cnt_unique = self.cnt_events.saturating_sub(self.cnt_recurring);
    }

    /// Merge another record's counters into this one, key by key.
    pub fn merge_from(&mut self, other: &StatsBundle) {
        self.cnt_alerts += other.cnt_alerts;
        self.cnt_events = self.cnt_alerts;
        for (category, counter) in &other.counters {
            for (key, value) in counter {
                self.counter_inc(*category, key, *value);
            }
        }
    }

    /// Bound every category to a toplist. The identifier list is dropped;
    /// it can hold thousands of entries. Idempotent.
    pub fn truncate(&mut self, config: &TruncationConfig, force: bool) {
        self.list_ids.clear();
        if self.cnt_alerts == 0 && self.cnt_events == 0 && self.cnt_reports == 0 {
            return;
        }
        for counter_key in StatCategory::ALL {
            if let Some(counter) = self.counters.get_mut(&counter_key) {
                make_toplist(counter, counter_key, config, force);
            }
        }
    }

    /// Bound every category to the key set of the already-truncated global
    /// `mask`, preserving the global top order; everything else collapses
    /// into this window's rest bucket.
    pub fn mask_with(&mut self, mask: &StatsBundle, config: &TruncationConfig, force: bool) {
        self.list_ids.clear();
        if self.cnt_alerts == 0 && self.cnt_events == 0 && self.cnt_reports == 0 {
            return;
        }
        for counter_key in StatCategory::ALL {
            if let Some(counter) = self.counters.get_mut(&counter_key) {
                let empty = Counter::new();
                let mask_counter = mask.counters.get(&counter_key).unwrap_or(&empty);
                mask_toplist(counter, mask_counter, counter_key, config, force);
            }
        }
    }
}

fn dedup_preserving_order(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

/// Keys of a counter ordered for toplist selection: descending by count,
/// ascending by name among ties (the sort is stable over the name order).
fn toplist_order(counter: &Counter) -> Vec<(&String, &u64)> {
    let mut entries: Vec<(&String, &u64)> = counter.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1));
    entries
}

fn truncation_threshold(
    category: StatCategory,
    config: &TruncationConfig,
    force: bool,
) -> usize {
    if category.truncation_whitelisted() && !force {
        config.whitelist_threshold
    } else {
        config.threshold
    }
}

fn make_toplist(
    counter: &mut Counter,
    category: StatCategory,
    config: &TruncationConfig,
    force: bool,
) {
    let keep = truncation_threshold(category, config, force).saturating_sub(1);
    let prior_rest = counter.remove(KEY_REST);

    let mut result = Counter::new();
    let mut rest = 0u64;
    let mut trimmed = false;
    for (index, (key, value)) in toplist_order(counter).into_iter().enumerate() {
        if index < keep {
            result.insert(key.clone(), *value);
        } else {
            trimmed = true;
            rest += *value;
        }
    }
    if trimmed {
        *result.entry(KEY_REST.to_string()).or_insert(0) += rest;
    }
    if let Some(prior) = prior_rest {
        *result.entry(KEY_REST.to_string()).or_insert(0) += prior;
    }
    *counter = result;
}

fn mask_toplist(
    counter: &mut Counter,
    mask_counter: &Counter,
    category: StatCategory,
    config: &TruncationConfig,
    force: bool,
) {
    let keep = truncation_threshold(category, config, force).saturating_sub(1);
    let prior_rest = counter.remove(KEY_REST);

    let keep_keys: Vec<String> = toplist_order(mask_counter)
        .into_iter()
        .map(|(key, _)| key.clone())
        .filter(|key| key != KEY_REST && counter.contains_key(key))
        .take(keep)
        .collect();

    let mut result = Counter::new();
    for key in &keep_keys {
        if let Some(value) = counter.get(key) {
            result.insert(key.clone(), *value);
        }
    }
    let rest: u64 = counter
        .iter()
        .filter(|(key, _)| !keep_keys.contains(key))
        .map(|(_, value)| *value)
        .sum();
    if rest > 0 {
        *result.entry(KEY_REST.to_string()).or_insert(0) += rest;
    }
    if let Some(prior) = prior_rest {
        *result.entry(KEY_REST.to_string()).or_insert(0) += prior;
    }
    *counter = result;
}

// ============================================================================
// Flat and grouped evaluation
// ============================================================================

/// Evaluate statistics for an event batch.
pub fn evaluate_events(events: &[Event]) -> StatsBundle {
    let mut stats = StatsBundle {
        cnt_alerts: events.len() as u64,
        ..Default::default()
    };
    if events.is_empty() {
        return stats;
    }
    for event in events {
        stats.list_ids.push(event.id.clone());
        stats.include_event(event, false, &[]);
    }
    stats.finalize_secondary();
    stats
}

/// Grouped statistics: every event counts into `overall`, and into either
/// `internal` (resolved abuse contacts present) or `external`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupedStats {
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dt_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dt_to: Option<DateTime<Utc>>,
    pub overall: StatsBundle,
    pub internal: StatsBundle,
    pub external: StatsBundle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_cfg: Option<TimelineConfig>,
}

impl GroupedStats {
    fn groups_mut(&mut self) -> [&mut StatsBundle; 3] {
        [&mut self.overall, &mut self.internal, &mut self.external]
    }

    /// Truncate every group to its toplists.
    pub fn truncate(&mut self, config: &TruncationConfig, force: bool) {
        for group in self.groups_mut() {
            group.truncate(config, force);
        }
    }
}

/// Split an event batch by the presence of resolved abuse contacts and
/// evaluate each group separately.
pub fn evaluate_event_groups(events: &[Event]) -> GroupedStats {
    let mut internal = Vec::new();
    let mut external = Vec::new();
    for event in events {
        if event.ext.resolved_abuses.is_empty() {
            external.push(event.clone());
        } else {
            internal.push(event.clone());
        }
    }
    GroupedStats {
        count: events.len() as u64,
        dt_from: None,
        dt_to: None,
        overall: evaluate_events(events),
        internal: evaluate_events(&internal),
        external: evaluate_events(&external),
        timeline_cfg: None,
    }
}

/// Merge multiple persisted grouped records into one. Truncation is the
/// caller's business and happens once, after all merging.
pub fn aggregate_group_stats(records: &[GroupedStats]) -> GroupedStats {
    let mut result = GroupedStats::default();
    for record in records {
        result.count += record.count;
        result.dt_from = merge_min(result.dt_from, record.dt_from);
        result.dt_to = merge_max(result.dt_to, record.dt_to);
        if record.count == 0 {
            continue;
        }
        result.overall.merge_from(&record.overall);
        result.internal.merge_from(&record.internal);
        result.external.merge_from(&record.external);
    }
    for group in result.groups_mut() {
        group.finalize_secondary();
    }
    result
}

/// Merge multiple persisted grouped records into one timeline-sliced
/// record. Each input record lands in the bucket holding its window start.
pub fn aggregate_timeline_group_stats(
    records: &[GroupedStats],
    dt_from: DateTime<Utc>,
    dt_to: DateTime<Utc>,
    max_count: usize,
    min_step_secs: Option<i64>,
    config: &TruncationConfig,
) -> WardenResult<GroupedStats> {
    let mut result = GroupedStats::default();
    if records.is_empty() {
        return Ok(result);
    }

    result.count = records.iter().map(|r| r.count).sum();
    result.dt_from = records.iter().filter_map(|r| r.dt_from).min();
    result.dt_to = records.iter().filter_map(|r| r.dt_to).max();
    if result.count == 0 {
        return Ok(result);
    }

    let timeline_cfg = calculate_timeline_config(dt_from, dt_to, max_count, min_step_secs)?;
    let starts = timeline_cfg.bucket_starts();

    for (group_index, group) in result.groups_mut().into_iter().enumerate() {
        let mut buckets: Vec<TimelineBucket> = starts
            .iter()
            .map(|start| TimelineBucket {
                start: *start,
                stats: StatsBundle::default(),
            })
            .collect();

        for record in records {
            let record_group = match group_index {
                0 => &record.overall,
                1 => &record.internal,
                _ => &record.external,
            };
            group.merge_from(record_group);

            let record_start = record.dt_from.ok_or_else(|| {
                WardenError::DataInconsistency(
                    "statistical record without window start".to_string(),
                )
            })?;
            let index = bucket_index(&starts, record_start)?;
            buckets[index].stats.merge_from(record_group);
        }

        group.finalize_secondary();
        group.truncate(config, false);
        let mask = group.clone();
        for bucket in &mut buckets {
            bucket.stats.mask_with(&mask, config, false);
        }
        group.timeline = Some(Timeline {
            cfg: timeline_cfg.clone(),
            buckets,
        });
    }
    result.timeline_cfg = Some(timeline_cfg);

    Ok(result)
}

// ============================================================================
// Timeline evaluation
// ============================================================================

/// Evaluate an event batch into global plus per-bucket statistics for
/// timeline visualisations. Recurrence is judged with a batch-local
/// thresholding cache; the global toplist masks every bucket.
pub fn evaluate_timeline_events(
    events: &[Event],
    dt_from: DateTime<Utc>,
    dt_to: DateTime<Utc>,
    max_count: usize,
    config: &TruncationConfig,
) -> WardenResult<StatsBundle> {
    let cache = MemoryThresholdingCache::new();
    evaluate_windowed_events(events, dt_from, dt_to, max_count, config, &cache, &[])
}

/// Evaluate an event batch for single host visualisations. Recurrence is
/// judged per event class with the source pinned to `host`; categories
/// constant for one host are skipped.
pub fn evaluate_singlehost_events(
    host: &str,
    events: &[Event],
    dt_from: DateTime<Utc>,
    dt_to: DateTime<Utc>,
    max_count: usize,
    config: &TruncationConfig,
) -> WardenResult<StatsBundle> {
    let cache = SingleSourceThresholdingCache::new(host);
    evaluate_windowed_events(
        events,
        dt_from,
        dt_to,
        max_count,
        config,
        &cache,
        &SKIP_SINGLEHOST,
    )
}

fn evaluate_windowed_events(
    events: &[Event],
    dt_from: DateTime<Utc>,
    dt_to: DateTime<Utc>,
    max_count: usize,
    config: &TruncationConfig,
    cache: &dyn ThresholdingCache,
    skip: &[StatCategory],
) -> WardenResult<StatsBundle> {
    let mut stats = StatsBundle {
        cnt_alerts: events.len() as u64,
        ..Default::default()
    };
    if events.is_empty() {
        return Ok(stats);
    }

    let timeline_cfg = calculate_timeline_config(dt_from, dt_to, max_count, None)?;
    let starts = timeline_cfg.bucket_starts();
    let mut buckets: Vec<TimelineBucket> = starts
        .iter()
        .map(|start| TimelineBucket {
            start: *start,
            stats: StatsBundle::default(),
        })
        .collect();

    for event in events {
        let recurring = cache.event_is_thresholded(event, None, event.detect_time)?;
        cache.set_threshold(
            event,
            None,
            event.detect_time,
            event.detect_time,
            event.detect_time,
        )?;

        stats.include_event(event, recurring, skip);

        let index = bucket_index(&starts, event.detect_time)?;
        buckets[index].stats.include_event(event, recurring, skip);
    }

    stats.finalize_secondary();
    stats.truncate(config, false);
    for bucket in &mut buckets {
        bucket.stats.finalize_secondary();
        bucket.stats.mask_with(&stats, config, false);
    }
    stats.timeline = Some(Timeline {
        cfg: timeline_cfg,
        buckets,
    });

    Ok(stats)
}

// ============================================================================
// Report aggregation
// ============================================================================

/// Merge persisted reports into a daily timeline plus a weekday x hour
/// scatter grid. Summary reports contribute their full statistics; extra
/// reports only their count.
pub fn aggregate_report_stats(
    reports: &[EventReport],
    dt_from: DateTime<Utc>,
    dt_to: DateTime<Utc>,
    config: &TruncationConfig,
) -> WardenResult<StatsBundle> {
    let mut stats = StatsBundle::default();
    if reports.is_empty() {
        return Ok(stats);
    }

    let timeline_cfg = calculate_daily_timeline_config(dt_from, dt_to);
    let starts = timeline_cfg.bucket_starts();
    let mut buckets: Vec<TimelineBucket> = starts
        .iter()
        .map(|start| TimelineBucket {
            start: *start,
            stats: StatsBundle::default(),
        })
        .collect();
    let mut scatter = TimeScatter::new();

    for report in reports {
        let created = report.created;

        include_report(&mut stats, report);

        let index = bucket_index(&starts, created)?;
        include_report(&mut buckets[index].stats, report);

        let weekday = created.weekday().num_days_from_monday() as usize;
        let hour = created.hour() as usize;
        include_report(&mut scatter.grid[weekday][hour], report);
    }

    stats.finalize_secondary();
    stats.truncate(config, false);
    for bucket in &mut buckets {
        bucket.stats.mask_with(&stats, config, false);
    }
    for row in &mut scatter.grid {
        for cell in row.iter_mut() {
            cell.mask_with(&stats, config, false);
        }
    }

    stats.timeline = Some(Timeline {
        cfg: timeline_cfg,
        buckets,
    });
    stats.timescatter = Some(scatter);

    Ok(stats)
}

fn include_report(stats: &mut StatsBundle, report: &EventReport) {
    stats.cnt_reports += 1;
    stats.cnt_emails += report.mail_to.len() as u64;

    if report.report_type == ReportType::Summary {
        stats.cnt_reports_summary += 1;
        stats.cnt_events += report.evcount_rep;
        stats.cnt_events_all += report.evcount_all;
        stats.cnt_events_filtered += report.evcount_flt_blk;
        stats.cnt_events_thresholded += report.evcount_thr_blk;
        stats.cnt_events_new += report.evcount_new;
        stats.cnt_events_relapsed += report.evcount_rlp;

        stats.dt_from = merge_min(stats.dt_from, Some(report.dt_from));
        stats.dt_to = merge_max(stats.dt_to, Some(report.dt_to));

        if let Some(statistics) = &report.statistics {
            for category in StatCategory::ALL {
                // Abuse counts come from report ownership below, so older
                // reports without statistics still chart completely.
                if category == StatCategory::Abuses {
                    continue;
                }
                if let Some(counter) = statistics.counter(category) {
                    for (key, value) in counter {
                        stats.counter_inc(category, key, *value);
                    }
                }
            }
        }

        stats.counter_inc_all(StatCategory::Emails, &report.mail_to, 1);
        stats.counter_inc(StatCategory::Abuses, &report.group, report.evcount_all);
    } else {
        stats.cnt_reports_extra += 1;
    }
}

fn merge_min(
    current: Option<DateTime<Utc>>,
    candidate: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn merge_max(
    current: Option<DateTime<Utc>>,
    candidate: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

// ============================================================================
// Timeline math
// ============================================================================

/// Calculate the optimal timeline layout for a requested window.
///
/// Boundaries are snapped (five-minute marks for sub-hour spans, hours for
/// sub-day spans, days beyond that; aligned boundaries stay put) and the
/// step is rounded up to the nearest entry of the optimal-step table.
pub fn calculate_timeline_config(
    dt_from: DateTime<Utc>,
    dt_to: DateTime<Utc>,
    max_count: usize,
    min_step_secs: Option<i64>,
) -> WardenResult<TimelineConfig> {
    if max_count == 0 {
        return Err(WardenError::Config(
            "timeline bucket count must be positive".to_string(),
        ));
    }
    if dt_to <= dt_from {
        return Err(WardenError::DataInconsistency(format!(
            "empty timeline span {dt_from} -> {dt_to}"
        )));
    }

    let (dt_from, dt_to) = snap_boundaries(dt_from, dt_to);
    let span = (dt_to - dt_from).num_seconds();

    let mut step_secs = (span + max_count as i64 - 1) / max_count as i64;
    if let Some(min_step) = min_step_secs {
        if step_secs < min_step {
            step_secs = min_step;
        }
    }
    if let Some(&optimal) = OPTIMAL_STEPS.iter().find(|&&s| s >= step_secs) {
        step_secs = optimal;
    }

    let count = ((span + step_secs - 1) / step_secs) as usize;

    Ok(TimelineConfig {
        dt_from,
        dt_to,
        step_secs,
        count,
    })
}

/// Timeline layout with the step forced to one day; boundaries are rounded
/// outward to whole days.
pub fn calculate_daily_timeline_config(
    dt_from: DateTime<Utc>,
    dt_to: DateTime<Utc>,
) -> TimelineConfig {
    const DAY: i64 = 86_400;
    let dt_from = floor_to(dt_from, DAY);
    let mut dt_to = ceil_to(dt_to, DAY);
    if dt_to <= dt_from {
        dt_to = dt_from + Duration::days(1);
    }
    let count = ((dt_to - dt_from).num_seconds() / DAY) as usize;
    TimelineConfig {
        dt_from,
        dt_to,
        step_secs: DAY,
        count,
    }
}

/// Index of the bucket holding `time`: the last bucket whose start is not
/// after it. A time before the first bucket start does not fit the
/// timeline and is a hard error, never clamped.
pub fn bucket_index(starts: &[DateTime<Utc>], time: DateTime<Utc>) -> WardenResult<usize> {
    let position = starts.partition_point(|start| *start <= time);
    if position == 0 {
        return Err(WardenError::DataInconsistency(format!(
            "time {time} does not fit into timeline starting at {:?}",
            starts.first()
        )));
    }
    Ok(position - 1)
}

fn snap_boundaries(dt_from: DateTime<Utc>, dt_to: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let delta = dt_to - dt_from;
    let unit = if delta <= Duration::hours(1) {
        300
    } else if delta <= Duration::days(1) {
        3_600
    } else {
        86_400
    };
    (floor_to(dt_from, unit), ceil_to(dt_to, unit))
}

fn floor_to(time: DateTime<Utc>, unit_secs: i64) -> DateTime<Utc> {
    let ts = time.timestamp();
    from_timestamp(ts - ts.rem_euclid(unit_secs))
}

fn ceil_to(time: DateTime<Utc>, unit_secs: i64) -> DateTime<Utc> {
    let ts = time.timestamp();
    let aligned = ts.rem_euclid(unit_secs) == 0 && time.timestamp_subsec_nanos() == 0;
    if aligned {
        time
    } else {
        from_timestamp((ts.div_euclid(unit_secs) + 1) * unit_secs)
    }
}

fn from_timestamp(secs: i64) -> DateTime<Utc> {
    // Derived from valid timestamps by unit arithmetic; always in range.
    DateTime::<Utc>::from_timestamp(secs, 0).expect("timestamp in range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetectorNode, EventEndpoint, ExtensionFields};

    fn event(id: &str, detect: &str, source: &str, categories: &[&str]) -> Event {
        Event {
            id: id.to_string(),
            detect_time: detect.parse().unwrap(),
            create_time: None,
            event_time: None,
            cease_time: None,
            category: categories.iter().map(|c| c.to_string()).collect(),
            description: None,
            note: None,
            source: vec![EventEndpoint {
                ip4: vec![source.to_string()],
                ..Default::default()
            }],
            target: Vec::new(),
            node: vec![DetectorNode {
                name: Some("org.example.kippo".to_string()),
                software: vec!["Kippo".to_string()],
            }],
            conn_count: None,
            flow_count: None,
            packet_count: None,
            byte_count: None,
            ext: ExtensionFields {
                resolved_abuses: vec!["abuse@example.com".to_string()],
                ..Default::default()
            },
        }
    }

    fn counter(entries: &[(&str, u64)]) -> Counter {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn trunc(threshold: usize) -> TruncationConfig {
        TruncationConfig {
            threshold,
            whitelist_threshold: 1000,
        }
    }

    #[test]
    fn evaluate_events_counts_categories() {
        let events = vec![
            event("m1", "2021-01-05T10:05:00Z", "192.0.2.1", &["Fraud.Phishing"]),
            event("m2", "2021-01-05T10:15:00Z", "192.0.2.1", &["Fraud.Phishing"]),
            event("m3", "2021-01-05T10:25:00Z", "192.0.2.9", &["Spam"]),
        ];
        let stats = evaluate_events(&events);

        assert_eq!(stats.cnt_alerts, 3);
        assert_eq!(stats.cnt_events, 3);
        assert_eq!(stats.cnt_unique, 3);
        assert_eq!(stats.list_ids, vec!["m1", "m2", "m3"]);
        assert_eq!(
            stats.counter(StatCategory::Ips).unwrap(),
            &counter(&[("192.0.2.1", 2), ("192.0.2.9", 1)])
        );
        assert_eq!(
            stats.counter(StatCategory::Categories).unwrap(),
            &counter(&[("Fraud.Phishing", 2), ("Spam", 1)])
        );
        assert_eq!(
            stats.counter(StatCategory::DetectorSoftware).unwrap(),
            &counter(&[("org.example.kippo/Kippo", 3)])
        );
        // No class resolved: classes count the unknown sentinel.
        assert_eq!(
            stats.counter(StatCategory::Classes).unwrap(),
            &counter(&[(KEY_UNKNOWN, 3)])
        );
    }

    #[test]
    fn category_sets_capture_cooccurrence_sorted() {
        let mut stats = StatsBundle::default();
        let ev = event(
            "m1",
            "2021-01-05T10:05:00Z",
            "192.0.2.1",
            &["Recon.Scanning", "Availability.DoS"],
        );
        stats.include_event(&ev, false, &[]);
        assert_eq!(
            stats.counter(StatCategory::CategorySets).unwrap(),
            &counter(&[("Availability.DoS/Recon.Scanning", 1)])
        );
    }

    #[test]
    fn toplist_truncation_keeps_top_and_sums_rest() {
        let mut c = counter(&[("a", 10), ("b", 9), ("c", 8), ("d", 1)]);
        make_toplist(&mut c, StatCategory::Ips, &trunc(3), false);
        assert_eq!(c, counter(&[("a", 10), ("b", 9), (KEY_REST, 9)]));
    }

    #[test]
    fn toplist_truncation_is_idempotent() {
        let mut once = counter(&[("a", 10), ("b", 9), ("c", 8), ("d", 1)]);
        make_toplist(&mut once, StatCategory::Ips, &trunc(3), false);
        let mut twice = once.clone();
        make_toplist(&mut twice, StatCategory::Ips, &trunc(3), false);
        assert_eq!(once, twice);
    }

    #[test]
    fn toplist_tie_break_is_deterministic() {
        let mut c = counter(&[("zeta", 5), ("alpha", 5), ("mid", 5)]);
        make_toplist(&mut c, StatCategory::Ips, &trunc(3), false);
        // Ties resolve by ascending key name: alpha and mid survive.
        assert_eq!(c, counter(&[("alpha", 5), ("mid", 5), (KEY_REST, 5)]));
    }

    #[test]
    fn whitelisted_category_uses_relaxed_threshold() {
        let mut c: Counter = (0..150)
            .map(|i| (format!("cat{i:03}"), (i + 1) as u64))
            .collect();
        let config = trunc(100);
        make_toplist(&mut c, StatCategory::Categories, &config, false);
        assert_eq!(c.len(), 150);

        let mut forced: Counter = (0..150)
            .map(|i| (format!("cat{i:03}"), (i + 1) as u64))
            .collect();
        make_toplist(&mut forced, StatCategory::Categories, &config, true);
        assert_eq!(forced.len(), 100);
        assert!(forced.contains_key(KEY_REST));
    }

    #[test]
    fn mask_restricts_to_global_toplist() {
        let mask = counter(&[("a", 10), ("b", 9), (KEY_REST, 9)]);
        let mut window = counter(&[("a", 2), ("c", 5), ("d", 1)]);
        mask_toplist(&mut window, &mask, StatCategory::Ips, &trunc(3), false);

        // Only globally surviving keys remain; everything else is rest.
        assert_eq!(window, counter(&[("a", 2), (KEY_REST, 6)]));
        let masked_keys: Vec<&String> =
            window.keys().filter(|k| *k != KEY_REST).collect();
        for key in masked_keys {
            assert!(mask.contains_key(key));
        }
    }

    #[test]
    fn timeline_config_snaps_to_nice_steps() {
        let cfg = calculate_timeline_config(
            "2021-01-05T00:00:00Z".parse().unwrap(),
            "2021-01-05T01:00:00Z".parse().unwrap(),
            4,
            None,
        )
        .unwrap();
        assert_eq!(cfg.step_secs, 900);
        assert_eq!(cfg.count, 4);
        assert_eq!(cfg.dt_from, "2021-01-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(cfg.dt_to, "2021-01-05T01:00:00Z".parse::<DateTime<Utc>>().unwrap());
        let starts = cfg.bucket_starts();
        assert_eq!(
            starts,
            vec![
                "2021-01-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap(),
                "2021-01-05T00:15:00Z".parse().unwrap(),
                "2021-01-05T00:30:00Z".parse().unwrap(),
                "2021-01-05T00:45:00Z".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn timeline_config_rounds_unaligned_boundaries() {
        let cfg = calculate_timeline_config(
            "2021-01-05T00:03:10Z".parse().unwrap(),
            "2021-01-05T00:57:40Z".parse().unwrap(),
            10,
            None,
        )
        .unwrap();
        // Sub-hour spans snap to five-minute marks.
        assert_eq!(cfg.dt_from, "2021-01-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(cfg.dt_to, "2021-01-05T01:00:00Z".parse::<DateTime<Utc>>().unwrap());

        let cfg = calculate_timeline_config(
            "2021-01-05T03:20:00Z".parse().unwrap(),
            "2021-01-05T21:40:00Z".parse().unwrap(),
            12,
            None,
        )
        .unwrap();
        // Sub-day spans snap to whole hours.
        assert_eq!(cfg.dt_from, "2021-01-05T03:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(cfg.dt_to, "2021-01-05T22:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn timeline_config_honors_min_step() {
        let cfg = calculate_timeline_config(
            "2021-01-05T00:00:00Z".parse().unwrap(),
            "2021-01-05T01:00:00Z".parse().unwrap(),
            60,
            Some(600),
        )
        .unwrap();
        assert_eq!(cfg.step_secs, 600);
        assert_eq!(cfg.count, 6);
    }

    #[test]
    fn timeline_config_rejects_empty_span() {
        let at: DateTime<Utc> = "2021-01-05T00:00:00Z".parse().unwrap();
        assert!(matches!(
            calculate_timeline_config(at, at, 4, None),
            Err(WardenError::DataInconsistency(_))
        ));
    }

    #[test]
    fn bucket_lookup_covers_window_and_rejects_early_events() {
        let starts: Vec<DateTime<Utc>> = vec![
            "2021-01-05T00:00:00Z".parse().unwrap(),
            "2021-01-05T00:15:00Z".parse().unwrap(),
            "2021-01-05T00:30:00Z".parse().unwrap(),
            "2021-01-05T00:45:00Z".parse().unwrap(),
        ];
        // Exactly on the first boundary belongs to the first bucket.
        assert_eq!(bucket_index(&starts, starts[0]).unwrap(), 0);
        assert_eq!(
            bucket_index(&starts, "2021-01-05T00:14:59Z".parse().unwrap()).unwrap(),
            0
        );
        assert_eq!(bucket_index(&starts, starts[2]).unwrap(), 2);
        assert_eq!(
            bucket_index(&starts, "2021-01-05T00:59:59Z".parse().unwrap()).unwrap(),
            3
        );
        assert!(matches!(
            bucket_index(&starts, "2021-01-04T23:59:59Z".parse().unwrap()),
            Err(WardenError::DataInconsistency(_))
        ));
    }

    #[test]
    fn timeline_evaluation_assigns_each_event_once() {
        let events = vec![
            event("m1", "2021-01-05T00:01:00Z", "192.0.2.1", &["Spam"]),
            event("m2", "2021-01-05T00:20:00Z", "192.0.2.1", &["Spam"]),
            event("m3", "2021-01-05T00:20:30Z", "192.0.2.2", &["Spam"]),
            event("m4", "2021-01-05T00:59:59Z", "192.0.2.3", &["Spam"]),
        ];
        let stats = evaluate_timeline_events(
            &events,
            "2021-01-05T00:00:00Z".parse().unwrap(),
            "2021-01-05T01:00:00Z".parse().unwrap(),
            4,
            &trunc(100),
        )
        .unwrap();

        let timeline = stats.timeline.as_ref().unwrap();
        let bucket_events: Vec<u64> =
            timeline.buckets.iter().map(|b| b.stats.cnt_events).collect();
        assert_eq!(bucket_events, vec![1, 2, 0, 1]);
        assert_eq!(bucket_events.iter().sum::<u64>(), stats.cnt_events);
    }

    #[test]
    fn timeline_evaluation_detects_recurring_events() {
        // Timeline recurrence is keyed per event class: after the first
        // Spam event, every further Spam event counts as recurring, while
        // the first Phishing event does not.
        let mut phishing = event("m4", "2021-01-05T00:50:00Z", "192.0.2.2", &["Phishing"]);
        phishing.ext.event_class = Some("phishing-site".to_string());
        let events = vec![
            event("m1", "2021-01-05T00:01:00Z", "192.0.2.1", &["Spam"]),
            event("m2", "2021-01-05T00:20:00Z", "192.0.2.1", &["Spam"]),
            event("m3", "2021-01-05T00:40:00Z", "192.0.2.3", &["Spam"]),
            phishing,
        ];
        let stats = evaluate_timeline_events(
            &events,
            "2021-01-05T00:00:00Z".parse().unwrap(),
            "2021-01-05T01:00:00Z".parse().unwrap(),
            4,
            &trunc(100),
        )
        .unwrap();
        assert_eq!(stats.cnt_recurring, 2);
        assert_eq!(stats.cnt_unique, 2);
    }

    #[test]
    fn timeline_event_before_window_is_fatal() {
        let events = vec![event(
            "m1",
            "2021-01-04T23:00:00Z",
            "192.0.2.1",
            &["Spam"],
        )];
        let result = evaluate_timeline_events(
            &events,
            "2021-01-05T00:00:00Z".parse().unwrap(),
            "2021-01-05T01:00:00Z".parse().unwrap(),
            4,
            &trunc(100),
        );
        assert!(matches!(result, Err(WardenError::DataInconsistency(_))));
    }

    #[test]
    fn timeline_buckets_respect_global_mask() {
        let mut events = Vec::new();
        // 30 distinct sources, each twice, spread over one hour; the
        // per-bucket toplists must stay inside the forced global toplist.
        for i in 0..30 {
            for j in 0..2 {
                events.push(event(
                    &format!("m{i}-{j}"),
                    &format!("2021-01-05T00:{:02}:00Z", (i + j * 29) % 60),
                    &format!("192.0.2.{i}"),
                    &["Spam"],
                ));
            }
        }
        let stats = evaluate_timeline_events(
            &events,
            "2021-01-05T00:00:00Z".parse().unwrap(),
            "2021-01-05T01:00:00Z".parse().unwrap(),
            4,
            &trunc(10),
        )
        .unwrap();

        let global_ips = stats.counter(StatCategory::Ips).unwrap();
        for bucket in &stats.timeline.as_ref().unwrap().buckets {
            if let Some(window_ips) = bucket.stats.counter(StatCategory::Ips) {
                for key in window_ips.keys().filter(|k| *k != KEY_REST) {
                    assert!(
                        global_ips.contains_key(key),
                        "bucket key {key} absent from global toplist"
                    );
                }
            }
        }
    }

    #[test]
    fn singlehost_evaluation_skips_host_constant_categories() {
        let events = vec![event(
            "m1",
            "2021-01-05T00:01:00Z",
            "192.0.2.1",
            &["Spam"],
        )];
        let stats = evaluate_singlehost_events(
            "192.0.2.1",
            &events,
            "2021-01-05T00:00:00Z".parse().unwrap(),
            "2021-01-05T01:00:00Z".parse().unwrap(),
            4,
            &trunc(100),
        )
        .unwrap();
        assert!(stats.counter(StatCategory::Ips).is_none());
        assert!(stats.counter(StatCategory::Abuses).is_none());
        assert!(stats.counter(StatCategory::Categories).is_some());
    }

    #[test]
    fn grouped_evaluation_splits_on_resolved_abuses() {
        let mut external = event("m2", "2021-01-05T00:10:00Z", "192.0.2.2", &["Spam"]);
        external.ext.resolved_abuses.clear();
        let events = vec![
            event("m1", "2021-01-05T00:01:00Z", "192.0.2.1", &["Spam"]),
            external,
        ];
        let grouped = evaluate_event_groups(&events);
        assert_eq!(grouped.count, 2);
        assert_eq!(grouped.overall.cnt_events, 2);
        assert_eq!(grouped.internal.cnt_events, 1);
        assert_eq!(grouped.external.cnt_events, 1);
    }

    #[test]
    fn group_aggregation_merges_key_by_key() {
        let events_a = vec![event("m1", "2021-01-05T00:01:00Z", "192.0.2.1", &["Spam"])];
        let events_b = vec![
            event("m2", "2021-01-06T00:01:00Z", "192.0.2.1", &["Spam"]),
            event("m3", "2021-01-06T00:02:00Z", "192.0.2.2", &["Phishing"]),
        ];
        let mut rec_a = evaluate_event_groups(&events_a);
        rec_a.dt_from = Some("2021-01-05T00:00:00Z".parse().unwrap());
        rec_a.dt_to = Some("2021-01-06T00:00:00Z".parse().unwrap());
        let mut rec_b = evaluate_event_groups(&events_b);
        rec_b.dt_from = Some("2021-01-06T00:00:00Z".parse().unwrap());
        rec_b.dt_to = Some("2021-01-07T00:00:00Z".parse().unwrap());

        let merged = aggregate_group_stats(&[rec_a, rec_b]);
        assert_eq!(merged.count, 3);
        assert_eq!(merged.dt_from, Some("2021-01-05T00:00:00Z".parse().unwrap()));
        assert_eq!(merged.dt_to, Some("2021-01-07T00:00:00Z".parse().unwrap()));
        assert_eq!(
            merged.overall.counter(StatCategory::Ips).unwrap(),
            &counter(&[("192.0.2.1", 2), ("192.0.2.2", 1)])
        );
    }

    #[test]
    fn timeline_group_aggregation_places_records_by_window_start() {
        let events_a = vec![event("m1", "2021-01-05T06:00:00Z", "192.0.2.1", &["Spam"])];
        let events_b = vec![event("m2", "2021-01-06T06:00:00Z", "192.0.2.2", &["Spam"])];
        let mut rec_a = evaluate_event_groups(&events_a);
        rec_a.dt_from = Some("2021-01-05T00:00:00Z".parse().unwrap());
        rec_a.dt_to = Some("2021-01-06T00:00:00Z".parse().unwrap());
        let mut rec_b = evaluate_event_groups(&events_b);
        rec_b.dt_from = Some("2021-01-06T00:00:00Z".parse().unwrap());
        rec_b.dt_to = Some("2021-01-07T00:00:00Z".parse().unwrap());

        let merged = aggregate_timeline_group_stats(
            &[rec_a, rec_b],
            "2021-01-05T00:00:00Z".parse().unwrap(),
            "2021-01-07T00:00:00Z".parse().unwrap(),
            2,
            None,
            &trunc(100),
        )
        .unwrap();

        let timeline = merged.overall.timeline.as_ref().unwrap();
        assert_eq!(timeline.cfg.step_secs, 86_400);
        let bucket_counts: Vec<u64> = timeline
            .buckets
            .iter()
            .map(|b| b.stats.cnt_events)
            .collect();
        assert_eq!(bucket_counts, vec![1, 1]);
    }

    #[test]
    fn daily_timeline_rounds_outward() {
        let cfg = calculate_daily_timeline_config(
            "2021-01-05T07:30:00Z".parse().unwrap(),
            "2021-01-07T00:00:00Z".parse().unwrap(),
        );
        assert_eq!(cfg.dt_from, "2021-01-05T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(cfg.dt_to, "2021-01-07T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(cfg.count, 2);
    }

    #[test]
    fn report_aggregation_builds_daily_timeline_and_scatter() {
        use crate::models::{ReportType, Severity};
        use crate::report::EventReport;

        let window_from: DateTime<Utc> = "2021-01-05T00:00:00Z".parse().unwrap();
        let window_to: DateTime<Utc> = "2021-01-05T12:00:00Z".parse().unwrap();

        // Tuesday 2021-01-05 at 13:00.
        let mut summary = EventReport::new(
            "abuse@example.com",
            None,
            ReportType::Summary,
            Severity::Medium,
            window_from,
            window_to,
            "2021-01-05T13:00:00Z".parse().unwrap(),
        );
        summary.evcount_rep = 3;
        summary.evcount_all = 7;
        summary.evcount_new = 5;
        summary.evcount_flt_blk = 2;
        summary.mail_to = vec!["abuse@example.com".to_string()];
        summary.statistics = Some(evaluate_events(&[event(
            "m1",
            "2021-01-05T10:00:00Z",
            "192.0.2.1",
            &["Spam"],
        )]));

        // Wednesday 2021-01-06 at 09:30.
        let mut extra = EventReport::new(
            "abuse@example.com",
            Some("parent".to_string()),
            ReportType::Extra,
            Severity::Medium,
            window_from,
            window_to,
            "2021-01-06T09:30:00Z".parse().unwrap(),
        );
        extra.evcount_rep = 1;
        extra.mail_to = vec!["abuse@example.com".to_string()];

        let stats = aggregate_report_stats(
            &[summary, extra],
            "2021-01-05T00:00:00Z".parse().unwrap(),
            "2021-01-07T00:00:00Z".parse().unwrap(),
            &trunc(100),
        )
        .unwrap();

        assert_eq!(stats.cnt_reports, 2);
        assert_eq!(stats.cnt_reports_summary, 1);
        assert_eq!(stats.cnt_reports_extra, 1);
        assert_eq!(stats.cnt_emails, 2);
        assert_eq!(stats.cnt_events, 3);
        assert_eq!(stats.cnt_events_all, 7);
        assert_eq!(stats.cnt_events_filtered, 2);

        // Summary statistics flow into the merged counters; abuse counts
        // come from report ownership weighted by the total event count.
        assert_eq!(
            stats.counter(StatCategory::Ips).unwrap(),
            &counter(&[("192.0.2.1", 1)])
        );
        assert_eq!(
            stats.counter(StatCategory::Abuses).unwrap(),
            &counter(&[("abuse@example.com", 7)])
        );
        assert_eq!(
            stats.counter(StatCategory::Emails).unwrap(),
            &counter(&[("abuse@example.com", 1)])
        );

        let timeline = stats.timeline.as_ref().unwrap();
        assert_eq!(timeline.cfg.step_secs, 86_400);
        let per_day: Vec<u64> = timeline
            .buckets
            .iter()
            .map(|b| b.stats.cnt_reports)
            .collect();
        assert_eq!(per_day, vec![1, 1]);

        let scatter = stats.timescatter.as_ref().unwrap();
        // 2021-01-05 is a Tuesday (weekday index 1), 13:00.
        assert_eq!(scatter.grid[1][13].cnt_reports, 1);
        // 2021-01-06 is a Wednesday (weekday index 2), 09:30.
        assert_eq!(scatter.grid[2][9].cnt_reports, 1);
        assert_eq!(scatter.grid[0][0].cnt_reports, 0);
    }

    #[test]
    fn stats_bundle_serializes_with_category_names() {
        let events = vec![event("m1", "2021-01-05T00:01:00Z", "192.0.2.1", &["Spam"])];
        let stats = evaluate_events(&events);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["counters"]["ips"]["192.0.2.1"], 1);
        assert_eq!(json["counters"]["detectorsws"]["org.example.kippo/Kippo"], 1);

        let back: StatsBundle = serde_json::from_value(json).unwrap();
        assert_eq!(back.cnt_events, 1);
    }
}
