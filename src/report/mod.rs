//! Event report pipeline
//!
//! Orchestrates one reporting unit (abuse group x severity x time window):
//! fetch -> filter -> threshold -> relapse-detect -> aggregate -> persist
//! -> notify. Failures during fetch/filter/threshold propagate to the
//! caller; the external scheduler runs one unit per invocation so a failed
//! unit never corrupts others and stays retryable wholesale.

pub mod attachments;

use chrono::{DateTime, Datelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::WardenResult;
use crate::filter::{FilterEngine, FilterRule, KEY_FILTER_ERROR};
use crate::models::{
    AttachmentMode, Event, ReportType, ReportingMode, Severity, KEY_UNKNOWN,
};
use crate::services::{
    EventSearchParams, EventStore, Mailer, NetworkWhois, ReportNotice, ReportPersistence,
    WhoisLookup,
};
use crate::stats::{self, StatsBundle};
use crate::threshold::{
    source_from_key, CleanupStats, NoThresholdingCache, RelapsedEvent,
    StorageThresholdingCache, ThresholdingCache,
};

/// Target name for report pipeline operational logs
const TARGET_REPORT: &str = "report";

/// Subject for summary report notifications.
const SUBJECT_SUMMARY: &str = "Notice about possible problems in your network";

/// Subject for per-source extra report notifications.
const SUBJECT_EXTRA: &str = "Notice about possible problems regarding host";

/// Category whose events are test data, excluded from regular runs.
const TEST_CATEGORY: &str = "Test";

/// Events aggregated by source address.
pub type EventsBySource = BTreeMap<String, Vec<Event>>;

// ============================================================================
// Reporting settings
// ============================================================================

/// Per-abuse-group reporting settings, provided by the embedding
/// application (group management is outside this crate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportingSettings {
    /// Abuse group name (the organizational report recipient)
    pub group_name: String,
    /// Report destinations; defaults to the group name
    #[serde(default)]
    pub emails: Vec<String>,
    /// Networks registered to the group, as CIDR strings
    #[serde(default)]
    pub networks: Vec<String>,
    /// Group-specific filter rules, evaluated in order
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    pub mode: ReportingMode,
    pub attachments: AttachmentMode,
    /// Suppress all notification mail
    #[serde(default)]
    pub mute: bool,
    /// Redirect notifications to these addresses instead of `emails`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Vec<String>>,
    /// Compress attachment dumps
    #[serde(default)]
    pub compress: bool,
    /// Rendering timezone recorded into structured data
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl ReportingSettings {
    pub fn new(group_name: impl Into<String>) -> Self {
        let group_name = group_name.into();
        Self {
            emails: vec![group_name.clone()],
            group_name,
            networks: Vec::new(),
            filters: Vec::new(),
            mode: ReportingMode::Summary,
            attachments: AttachmentMode::All,
            mute: false,
            redirect: None,
            compress: false,
            timezone: default_timezone(),
        }
    }

    /// Notification destinations after applying the redirect override.
    fn destinations(&self) -> Vec<String> {
        match &self.redirect {
            Some(redirect) => redirect.clone(),
            None => self.emails.clone(),
        }
    }
}

// ============================================================================
// Report records
// ============================================================================

/// Persisted report record, summary or per-source extra.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReport {
    /// Unique report label
    pub label: String,
    pub group: String,
    /// Label of the parent summary report (extra reports only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_label: Option<String>,
    pub report_type: ReportType,
    pub severity: Severity,
    pub dt_from: DateTime<Utc>,
    pub dt_to: DateTime<Utc>,
    /// Window length in seconds
    pub delta_secs: i64,
    pub created: DateTime<Utc>,

    pub evcount_rep: u64,
    pub evcount_all: u64,
    pub evcount_new: u64,
    pub evcount_flt: u64,
    pub evcount_flt_blk: u64,
    pub evcount_thr: u64,
    pub evcount_thr_blk: u64,
    pub evcount_rlp: u64,

    pub flag_testdata: bool,
    pub flag_mailed: bool,
    #[serde(default)]
    pub mail_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail_dt: Option<DateTime<Utc>>,

    /// Filtering log: rule name -> blocked event count
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filtering: BTreeMap<String, u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<StatsBundle>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_data: Option<StructuredData>,
}

impl EventReport {
    pub fn new(
        group: impl Into<String>,
        parent_label: Option<String>,
        report_type: ReportType,
        severity: Severity,
        dt_from: DateTime<Utc>,
        dt_to: DateTime<Utc>,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            label: generate_label(report_type, severity, created),
            group: group.into(),
            parent_label,
            report_type,
            severity,
            dt_from,
            dt_to,
            delta_secs: (dt_to - dt_from).num_seconds(),
            created,
            evcount_rep: 0,
            evcount_all: 0,
            evcount_new: 0,
            evcount_flt: 0,
            evcount_flt_blk: 0,
            evcount_thr: 0,
            evcount_thr_blk: 0,
            evcount_rlp: 0,
            flag_testdata: false,
            flag_mailed: false,
            mail_to: Vec::new(),
            mail_dt: None,
            filtering: BTreeMap::new(),
            statistics: None,
            structured_data: None,
        }
    }
}

/// Generate a report label: `M{year}{month}{day}{type}{severity}-{suffix}`.
fn generate_label(report_type: ReportType, severity: Severity, now: DateTime<Utc>) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!(
        "M{:04}{:02}{:02}{}{}-{}",
        now.year(),
        now.month(),
        now.day(),
        report_type.as_str()[..1].to_uppercase(),
        severity.as_str()[..1].to_uppercase(),
        suffix
    )
}

/// Outcome of one reporting run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportOutcome {
    #[serde(rename = "reported")]
    Reported,
    #[serde(rename = "skipped-no-events")]
    SkippedNoEvents,
}

/// Aggregated result of one `report()` invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ReportResult {
    pub ts_from: DateTime<Utc>,
    pub ts_to: DateTime<Utc>,

    pub evcount_new: u64,
    pub evcount_flt: u64,
    pub evcount_flt_blk: u64,
    pub evcount_thr: u64,
    pub evcount_thr_blk: u64,
    pub evcount_rlp: u64,
    pub evcount_rep: u64,
    pub evcount_all: u64,

    /// Filtering log: rule name -> blocked event count
    pub filtering: BTreeMap<String, u64>,

    pub outcome: ReportOutcome,
    pub summary_label: Option<String>,
    pub extra_labels: Vec<String>,
    pub mail_to: Vec<String>,
}

impl ReportResult {
    fn new(ts_from: DateTime<Utc>, ts_to: DateTime<Utc>) -> Self {
        Self {
            ts_from,
            ts_to,
            evcount_new: 0,
            evcount_flt: 0,
            evcount_flt_blk: 0,
            evcount_thr: 0,
            evcount_thr_blk: 0,
            evcount_rlp: 0,
            evcount_rep: 0,
            evcount_all: 0,
            filtering: BTreeMap::new(),
            outcome: ReportOutcome::SkippedNoEvents,
            summary_label: None,
            extra_labels: Vec::new(),
            mail_to: Vec::new(),
        }
    }
}

// ============================================================================
// Structured per-source aggregation
// ============================================================================

/// Sorted value sets describing one side (source or target) of an
/// aggregated event slice.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointDetails {
    pub hostname: Vec<String>,
    pub mac: Vec<String>,
    pub port: Vec<u16>,
    pub proto: Vec<String>,
    pub url: Vec<String>,
    pub email: Vec<String>,
}

/// Aggregate of one source address within one event class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceAggregate {
    pub first_time: DateTime<Utc>,
    pub last_time: DateTime<Utc>,
    pub count: u64,
    /// Number of distinct detectors that reported the source
    pub detectors_count: u64,
    pub approx_conn_count: u64,
    pub conn_count: u64,
    pub flow_count: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub source: EndpointDetails,
    pub target: EndpointDetails,
}

/// Event class -> source address -> aggregate.
pub type SourceAggregates = BTreeMap<String, BTreeMap<String, SourceAggregate>>;

/// Structured data persisted with a report, feeding message generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredData {
    pub regular: SourceAggregates,
    pub relapsed: SourceAggregates,
    pub timezone: String,
}

#[derive(Default)]
struct SourceAggregateBuilder {
    first_time: Option<DateTime<Utc>>,
    last_time: Option<DateTime<Utc>>,
    count: u64,
    detectors: BTreeSet<String>,
    approx_conn_count: u64,
    conn_count: u64,
    flow_count: u64,
    packet_count: u64,
    byte_count: u64,
    source: EndpointSetBuilder,
    target: EndpointSetBuilder,
}

#[derive(Default)]
struct EndpointSetBuilder {
    hostname: BTreeSet<String>,
    mac: BTreeSet<String>,
    port: BTreeSet<u16>,
    proto: BTreeSet<String>,
    url: BTreeSet<String>,
    email: BTreeSet<String>,
}

impl EndpointSetBuilder {
    fn absorb(&mut self, endpoints: &[crate::models::EventEndpoint]) {
        for endpoint in endpoints {
            self.hostname.extend(endpoint.hostname.iter().cloned());
            self.mac.extend(endpoint.mac.iter().cloned());
            self.port.extend(endpoint.port.iter().copied());
            self.proto.extend(endpoint.proto.iter().cloned());
            self.url.extend(endpoint.url.iter().cloned());
            self.email.extend(endpoint.email.iter().cloned());
        }
    }

    fn build(self) -> EndpointDetails {
        EndpointDetails {
            hostname: self.hostname.into_iter().collect(),
            mac: self.mac.into_iter().collect(),
            port: self.port.into_iter().collect(),
            proto: self.proto.into_iter().collect(),
            url: self.url.into_iter().collect(),
            email: self.email.into_iter().collect(),
        }
    }
}

impl SourceAggregateBuilder {
    fn absorb(&mut self, event: &Event) {
        let first = event.first_time();
        let last = event.last_time();
        self.first_time = Some(self.first_time.map_or(first, |t| t.min(first)));
        self.last_time = Some(self.last_time.map_or(last, |t| t.max(last)));
        self.count += 1;
        if let Some(detector) = event.detector_name() {
            self.detectors.insert(detector.to_string());
        }
        self.approx_conn_count += event.approx_conn_count();
        self.conn_count += event.conn_count.unwrap_or(0);
        self.flow_count += event.flow_count.unwrap_or(0);
        self.packet_count += event.packet_count.unwrap_or(0);
        self.byte_count += event.byte_count.unwrap_or(0);
        self.source.absorb(&event.source);
        self.target.absorb(&event.target);
    }

    fn build(self) -> SourceAggregate {
        SourceAggregate {
            // absorb() ran at least once before build()
            first_time: self.first_time.expect("aggregate absorbed no event"),
            last_time: self.last_time.expect("aggregate absorbed no event"),
            count: self.count,
            detectors_count: self.detectors.len() as u64,
            approx_conn_count: self.approx_conn_count,
            conn_count: self.conn_count,
            flow_count: self.flow_count,
            packet_count: self.packet_count,
            byte_count: self.byte_count,
            source: self.source.build(),
            target: self.target.build(),
        }
    }
}

/// Aggregate events per event class and source address into the structure
/// feeding report message generation.
pub fn aggregate_events(events_by_source: &EventsBySource) -> SourceAggregates {
    let mut builders: BTreeMap<String, BTreeMap<String, SourceAggregateBuilder>> = BTreeMap::new();
    for (source, events) in events_by_source {
        for event in events {
            let class = event
                .ext
                .event_class
                .clone()
                .unwrap_or_else(|| KEY_UNKNOWN.to_string());
            builders
                .entry(class)
                .or_default()
                .entry(source.clone())
                .or_default()
                .absorb(event);
        }
    }
    builders
        .into_iter()
        .map(|(class, sources)| {
            (
                class,
                sources
                    .into_iter()
                    .map(|(source, builder)| (source, builder.build()))
                    .collect(),
            )
        })
        .collect()
}

// ============================================================================
// Reporter
// ============================================================================

struct FilterDecision {
    matched_rule: Option<String>,
    sources: BTreeSet<String>,
}

/// Event reporting pipeline for one deployment.
///
/// The thresholding cache is instantiated per reporting run, never shared
/// across units, so concurrent units stay independent; durability comes
/// from the event store backend.
pub struct EventReporter {
    config: EngineConfig,
    event_store: Arc<dyn EventStore>,
    persistence: Arc<dyn ReportPersistence>,
    mailer: Arc<dyn Mailer>,
    thresholding: bool,
}

impl EventReporter {
    pub fn new(
        config: EngineConfig,
        event_store: Arc<dyn EventStore>,
        persistence: Arc<dyn ReportPersistence>,
        mailer: Arc<dyn Mailer>,
        thresholding: bool,
    ) -> Self {
        Self {
            config,
            event_store,
            persistence,
            mailer,
            thresholding,
        }
    }

    fn make_cache(&self) -> Box<dyn ThresholdingCache> {
        if self.thresholding {
            Box::new(StorageThresholdingCache::new(self.event_store.clone()))
        } else {
            Box::new(NoThresholdingCache::new())
        }
    }

    /// Remove thresholding records older than `ttl`. Driven by a periodic
    /// external sweep.
    pub fn cleanup(&self, ttl: DateTime<Utc>) -> WardenResult<CleanupStats> {
        self.make_cache().cleanup(ttl)
    }

    /// Perform reporting for one abuse group, severity and time window.
    pub fn report(
        &self,
        settings: &ReportingSettings,
        severity: Severity,
        time_l: DateTime<Utc>,
        time_h: DateTime<Utc>,
        testdata: bool,
    ) -> WardenResult<ReportResult> {
        let mut result = ReportResult::new(time_l, time_h);
        let tcache = self.make_cache();

        let mut regular: Vec<Event> = Vec::new();
        let mut regular_aggr = EventsBySource::new();

        // A: fetch candidate events from the event store.
        let events_fetched =
            self.fetch_severity_events(settings, severity, time_l, time_h, testdata)?;
        result.evcount_new = events_fetched.len() as u64;
        result.evcount_all = result.evcount_new;

        if !events_fetched.is_empty() {
            // B: event filtering by group rules, aggregated by source.
            let (events_flt, events_aggr, fltlog) =
                self.filter_events(&events_fetched, settings)?;
            result.evcount_flt = events_flt.len() as u64;
            result.evcount_flt_blk = result.evcount_new - result.evcount_flt;
            result.filtering = fltlog;

            if !events_flt.is_empty() {
                // C: thresholding per (source, event).
                let (events_thr, aggr_thr) = self.threshold_events(
                    tcache.as_ref(),
                    &events_aggr,
                    settings,
                    severity,
                    time_h,
                )?;
                result.evcount_thr = events_thr.len() as u64;
                result.evcount_thr_blk = result.evcount_flt - result.evcount_thr;
                if !events_thr.is_empty() {
                    regular = events_thr;
                    regular_aggr = aggr_thr;
                }
            }
        }

        // D: relapse detection for windows that expired by now.
        let relapsed_raw = self.relapse_events(tcache.as_ref(), settings, severity, time_h)?;
        result.evcount_rlp = relapsed_raw.len() as u64;
        result.evcount_all += result.evcount_rlp;
        let (relapsed, relapsed_aggr) = aggregate_relapsed_events(relapsed_raw);

        if regular.is_empty() && relapsed.is_empty() {
            result.evcount_rep = 0;
            result.outcome = ReportOutcome::SkippedNoEvents;
            return Ok(result);
        }
        result.evcount_rep = (regular.len() + relapsed.len()) as u64;

        // E: summary report for the whole group.
        let summary = self.report_summary(
            &mut result,
            &regular,
            &regular_aggr,
            &relapsed,
            &relapsed_aggr,
            settings,
            severity,
            time_l,
            time_h,
            testdata,
        )?;

        // F: per-source extra reports.
        self.report_extra(
            &summary,
            &mut result,
            &regular_aggr,
            &relapsed_aggr,
            settings,
            severity,
            time_l,
            time_h,
            testdata,
        )?;

        // G: register fresh threshold windows for every reported source.
        self.update_thresholding_cache(
            tcache.as_ref(),
            &regular_aggr,
            &relapsed_aggr,
            severity,
            time_h,
        )?;

        result.outcome = ReportOutcome::Reported;
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Pipeline stages
    // ------------------------------------------------------------------

    fn fetch_severity_events(
        &self,
        settings: &ReportingSettings,
        severity: Severity,
        time_l: DateTime<Utc>,
        time_h: DateTime<Utc>,
        testdata: bool,
    ) -> WardenResult<Vec<Event>> {
        let (count, events) = self.event_store.search_events(&EventSearchParams {
            detect_from: time_l,
            detect_to: time_h,
            groups: vec![settings.group_name.clone()],
            severities: vec![severity],
            categories: vec![TEST_CATEGORY.to_string()],
            exclude_categories: !testdata,
        })?;
        if events.is_empty() {
            debug!(
                target: TARGET_REPORT,
                group = %settings.group_name,
                severity = %severity,
                from = %time_l,
                to = %time_h,
                "Found no events for the reporting window"
            );
        } else {
            info!(
                target: TARGET_REPORT,
                group = %settings.group_name,
                severity = %severity,
                from = %time_l,
                to = %time_h,
                count = count,
                "Found events for the reporting window"
            );
        }
        Ok(events)
    }

    /// Filter events by group rules; compute per-source exemptions for
    /// multi-source events and aggregate survivors by source address.
    fn filter_events(
        &self,
        events: &[Event],
        settings: &ReportingSettings,
    ) -> WardenResult<(Vec<Event>, EventsBySource, BTreeMap<String, u64>)> {
        let now = Utc::now();
        let whois = NetworkWhois::from_strings(&settings.networks)?;
        let mut whois_cache: HashMap<String, bool> = HashMap::new();
        let engine = FilterEngine::compile(&settings.filters, now)?;

        let mut result = Vec::new();
        let mut aggregated = EventsBySource::new();
        let mut fltlog: BTreeMap<String, u64> = BTreeMap::new();

        for event in events {
            let decision =
                match self.filter_single_event(&engine, event, &whois, &mut whois_cache, now) {
                    Ok(decision) => decision,
                    Err(err) => {
                        // Recoverable boundary: a bad evaluation skips just
                        // this event, recorded in the filtering log.
                        warn!(
                            target: TARGET_REPORT,
                            event = %event.id,
                            error = %err,
                            "Filter evaluation failed, skipping event"
                        );
                        *fltlog.entry(KEY_FILTER_ERROR.to_string()).or_insert(0) += 1;
                        continue;
                    }
                };

            if let Some(rule) = &decision.matched_rule {
                if decision.sources.is_empty() {
                    debug!(
                        target: TARGET_REPORT,
                        event = %event.id,
                        rule = %rule,
                        "Event matched filtering rule, all sources filtered"
                    );
                    *fltlog.entry(rule.clone()).or_insert(0) += 1;
                } else {
                    debug!(
                        target: TARGET_REPORT,
                        event = %event.id,
                        rule = %rule,
                        "Event matched filtering rule, some sources allowed through"
                    );
                }
            }

            if !decision.sources.is_empty() {
                result.push(event.clone());
                for source in &decision.sources {
                    aggregated
                        .entry(source.clone())
                        .or_default()
                        .push(event.clone());
                }
            }
        }

        if result.is_empty() {
            info!(
                target: TARGET_REPORT,
                group = %settings.group_name,
                blocked = events.len(),
                "Filters blocked all events, nothing to report"
            );
        } else {
            info!(
                target: TARGET_REPORT,
                group = %settings.group_name,
                passed = result.len(),
                blocked = events.len() - result.len(),
                "Filters let events through"
            );
        }
        Ok((result, aggregated, fltlog))
    }

    fn filter_single_event(
        &self,
        engine: &FilterEngine,
        event: &Event,
        whois: &dyn WhoisLookup,
        whois_cache: &mut HashMap<String, bool>,
        now: DateTime<Utc>,
    ) -> WardenResult<FilterDecision> {
        let matched_rule = engine
            .match_event(event, true, now)?
            .map(str::to_string);
        let mut sources = BTreeSet::new();

        match &matched_rule {
            Some(_) => {
                let ip4s: BTreeSet<String> = event
                    .source
                    .iter()
                    .flat_map(|e| e.ip4.iter().cloned())
                    .collect();
                let ip6s: BTreeSet<String> = event
                    .source
                    .iter()
                    .flat_map(|e| e.ip6.iter().cloned())
                    .collect();

                // A whole-event match with multiple source addresses may
                // still leave individual addresses reportable: re-evaluate
                // with one address present at a time.
                if ip4s.len() + ip6s.len() > 1 {
                    let mut copy = event.clone();
                    for endpoint in &mut copy.source {
                        endpoint.ip4.clear();
                        endpoint.ip6.clear();
                    }
                    for source in &ip4s {
                        copy.source[0].ip4 = vec![source.clone()];
                        if engine.match_event(&copy, false, now)?.is_none() {
                            whois_filter(&mut sources, source, whois, whois_cache);
                        }
                    }
                    copy.source[0].ip4.clear();
                    for source in &ip6s {
                        copy.source[0].ip6 = vec![source.clone()];
                        if engine.match_event(&copy, false, now)?.is_none() {
                            whois_filter(&mut sources, source, whois, whois_cache);
                        }
                    }
                }
            }
            None => {
                let addresses: BTreeSet<String> =
                    event.source_addresses().into_iter().collect();
                for source in &addresses {
                    whois_filter(&mut sources, source, whois, whois_cache);
                }
            }
        }

        Ok(FilterDecision {
            matched_rule,
            sources,
        })
    }

    /// Suppress events whose dedup key has an active window, persistent or
    /// seen earlier in this batch; suppressed occurrences are registered
    /// for relapse tracking.
    fn threshold_events(
        &self,
        tcache: &dyn ThresholdingCache,
        events_aggr: &EventsBySource,
        settings: &ReportingSettings,
        severity: Severity,
        time_h: DateTime<Utc>,
    ) -> WardenResult<(Vec<Event>, EventsBySource)> {
        let mut result: BTreeMap<String, Event> = BTreeMap::new();
        let mut aggregated = EventsBySource::new();
        let mut suppressed: BTreeSet<String> = BTreeSet::new();
        let mut batch_seen: BTreeSet<String> = BTreeSet::new();

        for (source, events) in events_aggr {
            for event in events {
                let key = tcache.key_for(event, Some(source));
                let thresholded = batch_seen.contains(&key)
                    || tcache.event_is_thresholded(event, Some(source), time_h)?;
                if thresholded {
                    suppressed.insert(event.id.clone());
                    tcache.register_hit(
                        event,
                        Some(source),
                        &settings.group_name,
                        severity,
                        time_h,
                    )?;
                } else {
                    batch_seen.insert(key);
                    aggregated
                        .entry(source.clone())
                        .or_default()
                        .push(event.clone());
                    result.insert(event.id.clone(), event.clone());
                }
            }
        }

        for id in result.keys() {
            suppressed.remove(id);
        }
        if result.is_empty() {
            info!(
                target: TARGET_REPORT,
                group = %settings.group_name,
                blocked = suppressed.len(),
                "Thresholds blocked all events, nothing to report"
            );
        } else {
            info!(
                target: TARGET_REPORT,
                group = %settings.group_name,
                passed = result.len(),
                blocked = suppressed.len(),
                "Thresholds let events through"
            );
        }
        Ok((result.into_values().collect(), aggregated))
    }

    fn relapse_events(
        &self,
        tcache: &dyn ThresholdingCache,
        settings: &ReportingSettings,
        severity: Severity,
        time_h: DateTime<Utc>,
    ) -> WardenResult<Vec<RelapsedEvent>> {
        let events = tcache.relapses(&settings.group_name, severity, time_h)?;
        if events.is_empty() {
            debug!(
                target: TARGET_REPORT,
                group = %settings.group_name,
                severity = %severity,
                ttl = %time_h,
                "No relapsed events"
            );
        } else {
            info!(
                target: TARGET_REPORT,
                group = %settings.group_name,
                severity = %severity,
                ttl = %time_h,
                count = events.len(),
                "Found relapsed events"
            );
        }
        Ok(events)
    }

    #[allow(clippy::too_many_arguments)]
    fn report_summary(
        &self,
        result: &mut ReportResult,
        regular: &[Event],
        regular_aggr: &EventsBySource,
        relapsed: &[Event],
        relapsed_aggr: &EventsBySource,
        settings: &ReportingSettings,
        severity: Severity,
        time_l: DateTime<Utc>,
        time_h: DateTime<Utc>,
        testdata: bool,
    ) -> WardenResult<EventReport> {
        let mut report = EventReport::new(
            settings.group_name.clone(),
            None,
            ReportType::Summary,
            severity,
            time_l,
            time_h,
            Utc::now(),
        );
        report.evcount_rep = result.evcount_rep;
        report.evcount_all = result.evcount_all;
        report.evcount_new = result.evcount_new;
        report.evcount_flt = result.evcount_flt;
        report.evcount_flt_blk = result.evcount_flt_blk;
        report.evcount_thr = result.evcount_thr;
        report.evcount_thr_blk = result.evcount_thr_blk;
        report.evcount_rlp = result.evcount_rlp;
        report.flag_testdata = testdata;
        report.filtering = result.filtering.clone();

        let mut events_all: Vec<Event> = regular.to_vec();
        events_all.extend(relapsed.iter().cloned());

        let mut statistics = stats::evaluate_events(&events_all);
        statistics.truncate(&self.config.truncation, false);
        report.statistics = Some(statistics);

        report.structured_data = Some(StructuredData {
            regular: aggregate_events(regular_aggr),
            relapsed: aggregate_events(relapsed_aggr),
            timezone: settings.timezone.clone(),
        });

        let attachment_files = self.save_attachments(&events_all, &report.label, settings)?;

        if !settings.mute && settings.mode.wants_summary() {
            self.mail_report(&mut report, settings, &attachment_files, result, None)?;
        }

        self.persistence.save(&report)?;
        self.persistence.commit()?;

        result.summary_label = Some(report.label.clone());
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn report_extra(
        &self,
        parent: &EventReport,
        result: &mut ReportResult,
        regular_aggr: &EventsBySource,
        relapsed_aggr: &EventsBySource,
        settings: &ReportingSettings,
        severity: Severity,
        time_l: DateTime<Utc>,
        time_h: DateTime<Utc>,
        testdata: bool,
    ) -> WardenResult<()> {
        if !settings.mode.wants_extra() {
            return Ok(());
        }

        let sources: BTreeSet<&String> = regular_aggr
            .keys()
            .chain(relapsed_aggr.keys())
            .collect();

        for source in sources {
            let events_regular = regular_aggr.get(source).cloned().unwrap_or_default();
            let events_relapsed = relapsed_aggr.get(source).cloned().unwrap_or_default();
            let mut events_all = events_regular.clone();
            events_all.extend(events_relapsed.iter().cloned());

            let mut report = EventReport::new(
                settings.group_name.clone(),
                Some(parent.label.clone()),
                ReportType::Extra,
                severity,
                time_l,
                time_h,
                Utc::now(),
            );
            report.evcount_rep = events_all.len() as u64;
            report.evcount_all = result.evcount_rep;
            report.flag_testdata = testdata;

            let mut statistics = stats::evaluate_events(&events_all);
            statistics.truncate(&self.config.truncation, false);
            report.statistics = Some(statistics);

            report.structured_data = Some(StructuredData {
                regular: aggregate_events(&single_source_map(source, events_regular)),
                relapsed: aggregate_events(&single_source_map(source, events_relapsed)),
                timezone: settings.timezone.clone(),
            });

            let attachment_files =
                self.save_attachments(&events_all, &report.label, settings)?;

            if !settings.mute {
                self.mail_report(
                    &mut report,
                    settings,
                    &attachment_files,
                    result,
                    Some(source.as_str()),
                )?;
            }

            self.persistence.save(&report)?;
            self.persistence.commit()?;

            result.extra_labels.push(report.label.clone());
        }
        Ok(())
    }

    /// Register or extend the threshold window for every source that made
    /// it into a report, regular or relapsed: the relapse window nests at
    /// the tail of the absolute expiry.
    fn update_thresholding_cache(
        &self,
        tcache: &dyn ThresholdingCache,
        regular_aggr: &EventsBySource,
        relapsed_aggr: &EventsBySource,
        severity: Severity,
        time_h: DateTime<Utc>,
    ) -> WardenResult<()> {
        let timing = self.config.timing.for_severity(severity);
        let ttl = time_h + timing.threshold_window();
        let relapse = ttl - timing.relapse_window();
        for (source, events) in regular_aggr.iter().chain(relapsed_aggr.iter()) {
            for event in events {
                tcache.set_threshold(event, Some(source), time_h, relapse, ttl)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Artifacts and notification
    // ------------------------------------------------------------------

    /// Write the JSON and CSV dumps for a report and pick the files to
    /// attach according to the group's attachment policy.
    fn save_attachments(
        &self,
        events: &[Event],
        label: &str,
        settings: &ReportingSettings,
    ) -> WardenResult<Vec<PathBuf>> {
        let directory = &self.config.reports.directory;
        let compress = settings.compress || self.config.reports.compress;

        let json_dump = attachments::save_json_dump(
            events,
            directory,
            &format!("security-report-{label}.json"),
            compress,
        )?;
        let csv_dump = attachments::save_csv_dump(
            events,
            directory,
            &format!("security-report-{label}.csv"),
            compress,
        )?;

        let mut candidates = Vec::new();
        if settings.attachments.wants_json() {
            candidates.push(json_dump.attachable().to_path_buf());
        }
        if settings.attachments.wants_csv() {
            candidates.push(csv_dump.attachable().to_path_buf());
        }
        Ok(attachments::choose_attachments(
            candidates,
            self.config.reports.max_attachment_size,
        ))
    }

    fn mail_report(
        &self,
        report: &mut EventReport,
        settings: &ReportingSettings,
        attachment_files: &[PathBuf],
        result: &mut ReportResult,
        source: Option<&str>,
    ) -> WardenResult<()> {
        let severity_title = capitalize(report.severity.as_str());
        let subject = match source {
            None => format!("[{}] {} - {}", report.label, severity_title, SUBJECT_SUMMARY),
            Some(source) => format!(
                "[{}] {} - {} {}",
                report.label, severity_title, SUBJECT_EXTRA, source
            ),
        };

        let notice = ReportNotice {
            to: settings.destinations(),
            subject,
            report_label: report.label.clone(),
            parent_label: report.parent_label.clone(),
            severity: report.severity,
            window_from: report.dt_from,
            window_to: report.dt_to,
            event_count: report.evcount_rep,
            source: source.map(str::to_string),
            testdata: report.flag_testdata,
            attachments: attachment_files.to_vec(),
        };

        let receipt = self.mailer.send(&notice)?;
        report.flag_mailed = true;
        report.mail_to = receipt.destinations.clone();
        report.mail_dt = Some(Utc::now());

        let mut destinations: BTreeSet<String> =
            result.mail_to.iter().cloned().collect();
        destinations.extend(receipt.destinations);
        result.mail_to = destinations.into_iter().collect();
        Ok(())
    }
}

/// Aggregate relapsed events by the source recovered from their cache
/// keys.
fn aggregate_relapsed_events(relapsed: Vec<RelapsedEvent>) -> (Vec<Event>, EventsBySource) {
    let mut events = Vec::new();
    let mut aggregated = EventsBySource::new();
    for entry in relapsed {
        for key in &entry.key_ids {
            aggregated
                .entry(source_from_key(key).to_string())
                .or_default()
                .push(entry.event.clone());
        }
        events.push(entry.event);
    }
    (events, aggregated)
}

fn single_source_map(source: &str, events: Vec<Event>) -> EventsBySource {
    if events.is_empty() {
        return EventsBySource::new();
    }
    let mut map = EventsBySource::new();
    map.insert(source.to_string(), events);
    map
}

fn whois_filter(
    sources: &mut BTreeSet<String>,
    source: &str,
    whois: &dyn WhoisLookup,
    cache: &mut HashMap<String, bool>,
) {
    let member = *cache
        .entry(source.to_string())
        .or_insert_with(|| whois.is_member(source));
    if member {
        sources.insert(source.to_string());
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetectorNode, EventEndpoint, ExtensionFields};
    use crate::services::{MemoryEventStore, MemoryMailer, MemoryPersistence};
    use crate::stats::StatCategory;

    fn test_config(name: &str) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.reports.directory = std::env::temp_dir()
            .join(format!("warden-report-{}", std::process::id()))
            .join(name);
        config
    }

    fn event(id: &str, detect: &str, sources: &[&str], categories: &[&str]) -> Event {
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
                ip4: sources.iter().map(|s| s.to_string()).collect(),
                port: vec![4444],
                proto: vec!["tcp".to_string()],
                ..Default::default()
            }],
            target: Vec::new(),
            node: vec![DetectorNode {
                name: Some("org.example.kippo".to_string()),
                software: vec!["Kippo".to_string()],
            }],
            conn_count: Some(2),
            flow_count: None,
            packet_count: None,
            byte_count: None,
            ext: ExtensionFields {
                resolved_abuses: vec!["abuse@example.com".to_string()],
                event_severity: Some("medium".to_string()),
                ..Default::default()
            },
        }
    }

    struct Harness {
        store: Arc<MemoryEventStore>,
        persistence: Arc<MemoryPersistence>,
        mailer: Arc<MemoryMailer>,
        reporter: EventReporter,
    }

    fn harness(name: &str) -> Harness {
        let store = Arc::new(MemoryEventStore::new());
        let persistence = Arc::new(MemoryPersistence::new());
        let mailer = Arc::new(MemoryMailer::new());
        let reporter = EventReporter::new(
            test_config(name),
            store.clone(),
            persistence.clone(),
            mailer.clone(),
            true,
        );
        Harness {
            store,
            persistence,
            mailer,
            reporter,
        }
    }

    fn settings() -> ReportingSettings {
        let mut settings = ReportingSettings::new("abuse@example.com");
        settings.networks = vec!["1.2.3.0/24".to_string(), "192.0.2.0/24".to_string()];
        settings
    }

    #[test]
    fn scenario_single_source_burst_yields_one_reported_event() {
        let h = harness("burst");
        h.store.insert_events((0..5).map(|i| {
            event(
                &format!("e{i}"),
                &format!("2021-01-05T10:{:02}:00Z", i * 10 + 5),
                &["1.2.3.4"],
                &["Spam"],
            )
        }));

        let result = h
            .reporter
            .report(
                &settings(),
                Severity::Medium,
                "2021-01-05T10:00:00Z".parse().unwrap(),
                "2021-01-05T11:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();

        assert_eq!(result.outcome, ReportOutcome::Reported);
        assert_eq!(result.evcount_new, 5);
        assert_eq!(result.evcount_flt, 5);
        assert_eq!(result.evcount_flt_blk, 0);
        assert_eq!(result.evcount_thr, 1);
        assert_eq!(result.evcount_thr_blk, 4);
        assert_eq!(result.evcount_rlp, 0);
        assert_eq!(result.evcount_rep, 1);

        let reports = h.persistence.saved_reports();
        assert_eq!(reports.len(), 1);
        let summary = &reports[0];
        assert_eq!(summary.report_type, ReportType::Summary);
        assert_eq!(summary.evcount_rep, 1);
        assert!(summary.flag_mailed);
        assert_eq!(summary.mail_to, vec!["abuse@example.com"]);

        // One window registered for the source, four suppressed hits.
        assert_eq!(h.store.threshold_count(), 1);
        assert_eq!(h.store.hit_count(), 4);
        assert_eq!(h.mailer.sent_notices().len(), 1);
    }

    #[test]
    fn filter_counts_are_additive() {
        let h = harness("additive");
        h.store.insert_events(vec![
            event("e1", "2021-01-05T10:05:00Z", &["1.2.3.4"], &["Spam"]),
            event("e2", "2021-01-05T10:10:00Z", &["1.2.3.5"], &["Recon.Scanning"]),
            event("e3", "2021-01-05T10:15:00Z", &["1.2.3.6"], &["Spam"]),
        ]);

        let mut cfg = settings();
        cfg.filters = FilterRule::from_yaml(
            r#"
name: drop-scans
selections:
  sel:
    Category|contains: "Recon"
"#,
        )
        .unwrap();

        let result = h
            .reporter
            .report(
                &cfg,
                Severity::Medium,
                "2021-01-05T10:00:00Z".parse().unwrap(),
                "2021-01-05T11:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();

        assert_eq!(result.evcount_new, 3);
        assert_eq!(result.evcount_flt, 2);
        assert_eq!(result.evcount_flt_blk, 1);
        assert_eq!(result.evcount_flt + result.evcount_flt_blk, result.evcount_new);
        assert_eq!(result.filtering.get("drop-scans"), Some(&1));
    }

    #[test]
    fn empty_window_is_skipped_without_artifacts() {
        let h = harness("empty");
        let result = h
            .reporter
            .report(
                &settings(),
                Severity::Medium,
                "2021-01-05T10:00:00Z".parse().unwrap(),
                "2021-01-05T11:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();

        assert_eq!(result.outcome, ReportOutcome::SkippedNoEvents);
        assert_eq!(result.evcount_rep, 0);
        assert!(result.summary_label.is_none());
        assert!(h.persistence.saved_reports().is_empty());
        assert!(h.mailer.sent_notices().is_empty());
    }

    #[test]
    fn thresholded_source_relapses_after_window_expiry() {
        let h = harness("relapse");
        let cfg = settings();

        // Run 1: a fresh event is reported and a 48h window opens.
        h.store.insert_events(vec![event(
            "e1",
            "2021-01-05T11:00:00Z",
            &["1.2.3.4"],
            &["Spam"],
        )]);
        let r1 = h
            .reporter
            .report(
                &cfg,
                Severity::Medium,
                "2021-01-05T10:00:00Z".parse().unwrap(),
                "2021-01-05T12:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();
        assert_eq!(r1.outcome, ReportOutcome::Reported);
        assert_eq!(h.store.threshold_count(), 1);

        // Run 2, inside the window: the recurrence is suppressed but its
        // hit lands in the relapse period (window tail).
        h.store.insert_events(vec![event(
            "e2",
            "2021-01-07T03:00:00Z",
            &["1.2.3.4"],
            &["Spam"],
        )]);
        let r2 = h
            .reporter
            .report(
                &cfg,
                Severity::Medium,
                "2021-01-05T12:00:00Z".parse().unwrap(),
                "2021-01-07T04:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();
        assert_eq!(r2.outcome, ReportOutcome::SkippedNoEvents);
        assert_eq!(r2.evcount_thr, 0);
        assert_eq!(r2.evcount_thr_blk, 1);
        assert_eq!(h.store.hit_count(), 1);

        // Run 3, after expiry: the suppressed event surfaces as a relapse
        // even though the window fetched no new events.
        let r3 = h
            .reporter
            .report(
                &cfg,
                Severity::Medium,
                "2021-01-07T04:00:00Z".parse().unwrap(),
                "2021-01-07T16:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();
        assert_eq!(r3.outcome, ReportOutcome::Reported);
        assert_eq!(r3.evcount_new, 0);
        assert_eq!(r3.evcount_rlp, 1);
        assert_eq!(r3.evcount_rep, 1);

        let reports = h.persistence.saved_reports();
        let relapse_report = reports.last().unwrap();
        let structured = relapse_report.structured_data.as_ref().unwrap();
        assert!(structured.relapsed[KEY_UNKNOWN].contains_key("1.2.3.4"));
    }

    #[test]
    fn extra_mode_produces_one_report_per_source() {
        let h = harness("extra");
        h.store.insert_events(vec![
            event("e1", "2021-01-05T10:05:00Z", &["1.2.3.4"], &["Spam"]),
            event("e2", "2021-01-05T10:10:00Z", &["1.2.3.5"], &["Spam"]),
        ]);

        let mut cfg = settings();
        cfg.mode = ReportingMode::Both;

        let result = h
            .reporter
            .report(
                &cfg,
                Severity::Medium,
                "2021-01-05T10:00:00Z".parse().unwrap(),
                "2021-01-05T11:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();

        assert_eq!(result.evcount_rep, 2);
        assert_eq!(result.extra_labels.len(), 2);

        let reports = h.persistence.saved_reports();
        assert_eq!(reports.len(), 3);
        let summary = &reports[0];
        assert_eq!(summary.report_type, ReportType::Summary);

        let extras: Vec<&EventReport> = reports
            .iter()
            .filter(|r| r.report_type == ReportType::Extra)
            .collect();
        assert_eq!(extras.len(), 2);
        for extra in &extras {
            assert_eq!(extra.parent_label.as_deref(), Some(summary.label.as_str()));
            assert_eq!(extra.evcount_rep, 1);
            assert_eq!(extra.evcount_all, 2);
        }

        // Summary plus two extra notifications.
        let notices = h.mailer.sent_notices();
        assert_eq!(notices.len(), 3);
        assert!(notices[0].subject.contains(SUBJECT_SUMMARY));
        assert!(notices[1].subject.contains(SUBJECT_EXTRA));
        assert!(notices[1].source.is_some());
    }

    #[test]
    fn multi_source_event_keeps_exempt_addresses() {
        let h = harness("exempt");
        h.store.insert_events(vec![event(
            "e1",
            "2021-01-05T10:05:00Z",
            &["192.0.2.1", "192.0.2.2"],
            &["Spam"],
        )]);

        let mut cfg = settings();
        cfg.filters = FilterRule::from_yaml(
            r#"
name: drop-known-host
selections:
  sel:
    Source.IP4|cidr: "192.0.2.1/32"
"#,
        )
        .unwrap();

        let result = h
            .reporter
            .report(
                &cfg,
                Severity::Medium,
                "2021-01-05T10:00:00Z".parse().unwrap(),
                "2021-01-05T11:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();

        // The rule matched the whole event, yet the second address did not
        // match on its own and stays reportable.
        assert_eq!(result.evcount_flt, 1);
        assert_eq!(result.evcount_rep, 1);
        assert!(result.filtering.is_empty());

        let reports = h.persistence.saved_reports();
        let structured = reports[0].structured_data.as_ref().unwrap();
        let per_ip = &structured.regular[KEY_UNKNOWN];
        assert!(per_ip.contains_key("192.0.2.2"));
        assert!(!per_ip.contains_key("192.0.2.1"));
    }

    #[test]
    fn summary_statistics_and_attachments_are_generated() {
        let h = harness("artifacts");
        h.store.insert_events(vec![
            event("e1", "2021-01-05T10:05:00Z", &["1.2.3.4"], &["Spam"]),
            event("e2", "2021-01-05T10:10:00Z", &["1.2.3.5"], &["Spam"]),
        ]);

        let mut cfg = settings();
        cfg.compress = true;

        let result = h
            .reporter
            .report(
                &cfg,
                Severity::Medium,
                "2021-01-05T10:00:00Z".parse().unwrap(),
                "2021-01-05T11:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();
        let label = result.summary_label.unwrap();

        let reports = h.persistence.saved_reports();
        let statistics = reports[0].statistics.as_ref().unwrap();
        assert_eq!(statistics.cnt_events, 2);
        assert!(statistics.counter(StatCategory::Ips).is_some());
        // Truncation drops the identifier list before persistence.
        assert!(statistics.list_ids.is_empty());

        let notices = h.mailer.sent_notices();
        assert_eq!(notices[0].attachments.len(), 2);
        for path in &notices[0].attachments {
            assert!(path.to_string_lossy().ends_with(".zip"));
            assert!(path.exists());
            assert!(path.to_string_lossy().contains(&label));
        }
    }

    #[test]
    fn muted_group_reports_without_mailing() {
        let h = harness("muted");
        h.store.insert_events(vec![event(
            "e1",
            "2021-01-05T10:05:00Z",
            &["1.2.3.4"],
            &["Spam"],
        )]);

        let mut cfg = settings();
        cfg.mute = true;

        let result = h
            .reporter
            .report(
                &cfg,
                Severity::Medium,
                "2021-01-05T10:00:00Z".parse().unwrap(),
                "2021-01-05T11:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();

        assert_eq!(result.outcome, ReportOutcome::Reported);
        assert!(h.mailer.sent_notices().is_empty());
        let reports = h.persistence.saved_reports();
        assert!(!reports[0].flag_mailed);
    }

    #[test]
    fn redirect_overrides_destinations() {
        let h = harness("redirect");
        h.store.insert_events(vec![event(
            "e1",
            "2021-01-05T10:05:00Z",
            &["1.2.3.4"],
            &["Spam"],
        )]);

        let mut cfg = settings();
        cfg.redirect = Some(vec!["operator@example.org".to_string()]);

        let result = h
            .reporter
            .report(
                &cfg,
                Severity::Medium,
                "2021-01-05T10:00:00Z".parse().unwrap(),
                "2021-01-05T11:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();

        assert_eq!(result.mail_to, vec!["operator@example.org"]);
    }

    #[test]
    fn cleanup_sweeps_expired_records() {
        let h = harness("cleanup");
        h.store.insert_events(vec![event(
            "e1",
            "2021-01-05T11:00:00Z",
            &["1.2.3.4"],
            &["Spam"],
        )]);
        h.reporter
            .report(
                &settings(),
                Severity::Medium,
                "2021-01-05T10:00:00Z".parse().unwrap(),
                "2021-01-05T12:00:00Z".parse().unwrap(),
                false,
            )
            .unwrap();
        assert_eq!(h.store.threshold_count(), 1);

        // Before expiry nothing is swept; afterwards the record goes.
        let stats = h
            .reporter
            .cleanup("2021-01-06T00:00:00Z".parse().unwrap())
            .unwrap();
        assert_eq!(stats.thresholds, 0);
        let stats = h
            .reporter
            .cleanup("2021-02-01T00:00:00Z".parse().unwrap())
            .unwrap();
        assert_eq!(stats.thresholds, 1);
        assert_eq!(h.store.threshold_count(), 0);
    }

    #[test]
    fn aggregate_events_builds_per_class_source_slices() {
        let mut by_source = EventsBySource::new();
        let mut e1 = event("e1", "2021-01-05T10:05:00Z", &["1.2.3.4"], &["Spam"]);
        e1.ext.event_class = Some("spam".to_string());
        e1.cease_time = Some("2021-01-05T10:30:00Z".parse().unwrap());
        let mut e2 = event("e2", "2021-01-05T10:20:00Z", &["1.2.3.4"], &["Spam"]);
        e2.ext.event_class = Some("spam".to_string());
        e2.node = vec![DetectorNode {
            name: Some("org.example.dionaea".to_string()),
            software: vec!["Dionaea".to_string()],
        }];
        by_source.insert("1.2.3.4".to_string(), vec![e1, e2]);

        let aggregates = aggregate_events(&by_source);
        let entry = &aggregates["spam"]["1.2.3.4"];
        assert_eq!(entry.count, 2);
        assert_eq!(entry.detectors_count, 2);
        assert_eq!(entry.conn_count, 4);
        assert_eq!(entry.approx_conn_count, 4);
        assert_eq!(
            entry.first_time,
            "2021-01-05T10:05:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            entry.last_time,
            "2021-01-05T10:30:00Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(entry.source.port, vec![4444]);
        assert_eq!(entry.source.proto, vec!["tcp"]);
    }

    #[test]
    fn report_label_format() {
        let created: DateTime<Utc> = "2021-01-05T10:00:00Z".parse().unwrap();
        let label = generate_label(ReportType::Summary, Severity::Medium, created);
        assert!(label.starts_with("M20210105SM-"));
        assert_eq!(label.len(), "M20210105SM-".len() + 5);

        let extra = generate_label(ReportType::Extra, Severity::Critical, created);
        assert!(extra.starts_with("M20210105EC-"));
    }
}
