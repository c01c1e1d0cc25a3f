//! Data models module
//!
//! Defines the security event structure consumed by the reporting core,
//! together with the enums describing severities, report types and
//! reporting modes. Events are produced by an external event store and are
//! read-only to this crate; the wire format keeps the original PascalCase
//! field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::WardenError;

/// Sentinel key counted when an aggregation extracts no values.
pub const KEY_UNKNOWN: &str = "__unknown__";

/// Single detected security incident.
///
/// Only the fields consumed by the reporting core are modeled; unknown
/// fields in the wire representation are ignored on input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    #[serde(rename = "ID")]
    pub id: String,

    /// Detection timestamp
    #[serde(rename = "DetectTime")]
    pub detect_time: DateTime<Utc>,

    #[serde(rename = "CreateTime", skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,

    #[serde(rename = "EventTime", skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,

    #[serde(rename = "CeaseTime", skip_serializing_if = "Option::is_none")]
    pub cease_time: Option<DateTime<Utc>>,

    /// Incident categories (taxonomy labels)
    #[serde(rename = "Category", default)]
    pub category: Vec<String>,

    #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "Note", skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    /// Offending endpoints
    #[serde(rename = "Source", default)]
    pub source: Vec<EventEndpoint>,

    /// Victim endpoints
    #[serde(rename = "Target", default)]
    pub target: Vec<EventEndpoint>,

    /// Detector chain; the last entry is the authoritative detector
    #[serde(rename = "Node", default)]
    pub node: Vec<DetectorNode>,

    #[serde(rename = "ConnCount", skip_serializing_if = "Option::is_none")]
    pub conn_count: Option<u64>,

    #[serde(rename = "FlowCount", skip_serializing_if = "Option::is_none")]
    pub flow_count: Option<u64>,

    #[serde(rename = "PacketCount", skip_serializing_if = "Option::is_none")]
    pub packet_count: Option<u64>,

    #[serde(rename = "ByteCount", skip_serializing_if = "Option::is_none")]
    pub byte_count: Option<u64>,

    /// Vendor extension block with enrichment results
    #[serde(rename = "_Ext", default)]
    pub ext: ExtensionFields,
}

/// Structured endpoint descriptor shared by `Source` and `Target`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventEndpoint {
    #[serde(rename = "Type", default, skip_serializing_if = "Vec::is_empty")]
    pub endpoint_type: Vec<String>,

    #[serde(rename = "IP4", default, skip_serializing_if = "Vec::is_empty")]
    pub ip4: Vec<String>,

    #[serde(rename = "IP6", default, skip_serializing_if = "Vec::is_empty")]
    pub ip6: Vec<String>,

    #[serde(rename = "Hostname", default, skip_serializing_if = "Vec::is_empty")]
    pub hostname: Vec<String>,

    #[serde(rename = "MAC", default, skip_serializing_if = "Vec::is_empty")]
    pub mac: Vec<String>,

    #[serde(rename = "Port", default, skip_serializing_if = "Vec::is_empty")]
    pub port: Vec<u16>,

    #[serde(rename = "Proto", default, skip_serializing_if = "Vec::is_empty")]
    pub proto: Vec<String>,

    #[serde(rename = "URL", default, skip_serializing_if = "Vec::is_empty")]
    pub url: Vec<String>,

    #[serde(rename = "Email", default, skip_serializing_if = "Vec::is_empty")]
    pub email: Vec<String>,
}

/// Detector descriptor from the `Node` chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorNode {
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "SW", default, skip_serializing_if = "Vec::is_empty")]
    pub software: Vec<String>,
}

/// Vendor extension block carrying resolution/enrichment results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionFields {
    /// Resolved abuse contacts for the event sources
    #[serde(
        rename = "ResolvedAbuses",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub resolved_abuses: Vec<String>,

    #[serde(
        rename = "SourceResolvedASN",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub source_resolved_asn: Vec<u32>,

    #[serde(
        rename = "SourceResolvedCountry",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub source_resolved_country: Vec<String>,

    #[serde(rename = "EventClass", skip_serializing_if = "Option::is_none")]
    pub event_class: Option<String>,

    #[serde(rename = "EventSeverity", skip_serializing_if = "Option::is_none")]
    pub event_severity: Option<String>,

    #[serde(rename = "Impact", skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
}

impl Event {
    /// All source addresses (IPv4 followed by IPv6) across all endpoints.
    pub fn source_addresses(&self) -> Vec<String> {
        let mut out = Vec::new();
        for endpoint in &self.source {
            out.extend(endpoint.ip4.iter().cloned());
        }
        for endpoint in &self.source {
            out.extend(endpoint.ip6.iter().cloned());
        }
        out
    }

    /// Name of the last (authoritative) detector node.
    pub fn detector_name(&self) -> Option<&str> {
        self.node.last().and_then(|n| n.name.as_deref())
    }

    /// Analyzer software of the last detector node.
    pub fn analyzer_software(&self) -> &[String] {
        self.node
            .last()
            .map(|n| n.software.as_slice())
            .unwrap_or(&[])
    }

    /// Earliest known activity time: `EventTime`, falling back to
    /// `DetectTime`.
    pub fn first_time(&self) -> DateTime<Utc> {
        self.event_time.unwrap_or(self.detect_time)
    }

    /// Latest known activity time: `CeaseTime`, then `EventTime`, then
    /// `DetectTime`.
    pub fn last_time(&self) -> DateTime<Utc> {
        self.cease_time
            .or(self.event_time)
            .unwrap_or(self.detect_time)
    }

    /// Approximate connection count: `ConnCount`, or half of `FlowCount`
    /// when only flows were counted.
    pub fn approx_conn_count(&self) -> u64 {
        match self.conn_count {
            Some(count) => count,
            None => self.flow_count.unwrap_or(0) / 2,
        }
    }

    /// Multi-valued lookup of a named event field.
    ///
    /// This is the accessor used by the filter engine; the supported names
    /// mirror the wire representation (`Source.IP4`, `Node.Name`,
    /// `_Ext.EventClass`, ...). Returns `None` for unknown field names so
    /// rule compilation can reject them up front.
    pub fn field_values(&self, field: &str) -> Option<Vec<String>> {
        let values = match field {
            "ID" => vec![self.id.clone()],
            "Category" => self.category.clone(),
            "Description" => self.description.iter().cloned().collect(),
            "Note" => self.note.iter().cloned().collect(),
            "DetectTime" => vec![self.detect_time.to_rfc3339()],
            "ConnCount" => self.conn_count.iter().map(u64::to_string).collect(),
            "Source.IP4" => collect(&self.source, |e| cloned(&e.ip4)),
            "Source.IP6" => collect(&self.source, |e| cloned(&e.ip6)),
            "Source.Port" => collect(&self.source, |e| ports(&e.port)),
            "Source.Proto" => collect(&self.source, |e| cloned(&e.proto)),
            "Source.Hostname" => collect(&self.source, |e| cloned(&e.hostname)),
            "Source.MAC" => collect(&self.source, |e| cloned(&e.mac)),
            "Source.URL" => collect(&self.source, |e| cloned(&e.url)),
            "Source.Email" => collect(&self.source, |e| cloned(&e.email)),
            "Source.Type" => collect(&self.source, |e| cloned(&e.endpoint_type)),
            "Target.IP4" => collect(&self.target, |e| cloned(&e.ip4)),
            "Target.IP6" => collect(&self.target, |e| cloned(&e.ip6)),
            "Target.Port" => collect(&self.target, |e| ports(&e.port)),
            "Target.Proto" => collect(&self.target, |e| cloned(&e.proto)),
            "Target.Hostname" => collect(&self.target, |e| cloned(&e.hostname)),
            "Target.MAC" => collect(&self.target, |e| cloned(&e.mac)),
            "Target.URL" => collect(&self.target, |e| cloned(&e.url)),
            "Target.Email" => collect(&self.target, |e| cloned(&e.email)),
            "Target.Type" => collect(&self.target, |e| cloned(&e.endpoint_type)),
            "Node.Name" => self.node.iter().filter_map(|n| n.name.clone()).collect(),
            "Node.SW" => self.node.iter().flat_map(|n| n.software.clone()).collect(),
            "_Ext.ResolvedAbuses" => self.ext.resolved_abuses.clone(),
            "_Ext.SourceResolvedASN" => self
                .ext
                .source_resolved_asn
                .iter()
                .map(u32::to_string)
                .collect(),
            "_Ext.SourceResolvedCountry" => self.ext.source_resolved_country.clone(),
            "_Ext.EventClass" => self.ext.event_class.iter().cloned().collect(),
            "_Ext.EventSeverity" => self.ext.event_severity.iter().cloned().collect(),
            "_Ext.Impact" => self.ext.impact.iter().cloned().collect(),
            _ => return None,
        };
        Some(values)
    }

    /// Whether a field name is resolvable by [`Event::field_values`].
    pub fn is_known_field(field: &str) -> bool {
        const KNOWN: &[&str] = &[
            "ID",
            "Category",
            "Description",
            "Note",
            "DetectTime",
            "ConnCount",
            "Source.IP4",
            "Source.IP6",
            "Source.Port",
            "Source.Proto",
            "Source.Hostname",
            "Source.MAC",
            "Source.URL",
            "Source.Email",
            "Source.Type",
            "Target.IP4",
            "Target.IP6",
            "Target.Port",
            "Target.Proto",
            "Target.Hostname",
            "Target.MAC",
            "Target.URL",
            "Target.Email",
            "Target.Type",
            "Node.Name",
            "Node.SW",
            "_Ext.ResolvedAbuses",
            "_Ext.SourceResolvedASN",
            "_Ext.SourceResolvedCountry",
            "_Ext.EventClass",
            "_Ext.EventSeverity",
            "_Ext.Impact",
        ];
        KNOWN.contains(&field)
    }
}

fn cloned(values: &[String]) -> Vec<String> {
    values.to_vec()
}

fn ports(values: &[u16]) -> Vec<String> {
    values.iter().map(u16::to_string).collect()
}

fn collect<F>(endpoints: &[EventEndpoint], extract: F) -> Vec<String>
where
    F: Fn(&EventEndpoint) -> Vec<String>,
{
    endpoints.iter().flat_map(|e| extract(e)).collect()
}

/// Reporting severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// All severities in ascending order.
    pub fn all() -> [Severity; 4] {
        [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ]
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = WardenError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(WardenError::Config(format!("invalid severity '{other}'"))),
        }
    }
}

/// Type of a generated report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    /// One report covering the whole abuse group
    Summary,
    /// Per-source report carrying a single source's slice of events
    Extra,
}

impl ReportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportType::Summary => "summary",
            ReportType::Extra => "extra",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which reports a group receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportingMode {
    Summary,
    Extra,
    Both,
}

impl ReportingMode {
    pub fn wants_summary(&self) -> bool {
        matches!(self, ReportingMode::Summary | ReportingMode::Both)
    }

    pub fn wants_extra(&self) -> bool {
        matches!(self, ReportingMode::Extra | ReportingMode::Both)
    }
}

/// Which attachment dumps accompany a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentMode {
    None,
    Json,
    Csv,
    All,
}

impl AttachmentMode {
    pub fn wants_json(&self) -> bool {
        matches!(self, AttachmentMode::Json | AttachmentMode::All)
    }

    pub fn wants_csv(&self) -> bool {
        matches!(self, AttachmentMode::Csv | AttachmentMode::All)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        serde_json::from_value(serde_json::json!({
            "ID": "ev-01",
            "DetectTime": "2021-01-05T10:00:07Z",
            "EventTime": "2021-01-05T09:58:00Z",
            "Category": ["Recon.Scanning"],
            "Source": [
                {"IP4": ["192.0.2.1", "192.0.2.2"], "Port": [22], "Proto": ["tcp", "ssh"]}
            ],
            "Target": [
                {"Port": [2222], "Proto": ["tcp"]}
            ],
            "Node": [
                {"Name": "cz.example.relay", "SW": ["Relay"]},
                {"Name": "cz.example.honeypot", "SW": ["Kippo"]}
            ],
            "FlowCount": 11,
            "_Ext": {
                "ResolvedAbuses": ["abuse@example.com"],
                "EventClass": "attempt-login"
            }
        }))
        .unwrap()
    }

    #[test]
    fn source_addresses_concatenate_families() {
        let mut event = sample_event();
        event.source.push(EventEndpoint {
            ip6: vec!["2001:db8::1".to_string()],
            ..Default::default()
        });
        assert_eq!(
            event.source_addresses(),
            vec!["192.0.2.1", "192.0.2.2", "2001:db8::1"]
        );
    }

    #[test]
    fn detector_accessors_use_last_node() {
        let event = sample_event();
        assert_eq!(event.detector_name(), Some("cz.example.honeypot"));
        assert_eq!(event.analyzer_software(), ["Kippo".to_string()]);
    }

    #[test]
    fn time_accessors_fall_back() {
        let event = sample_event();
        assert_eq!(event.first_time(), event.event_time.unwrap());
        assert_eq!(event.last_time(), event.event_time.unwrap());
        assert_eq!(event.approx_conn_count(), 5);
    }

    #[test]
    fn field_values_resolve_known_names() {
        let event = sample_event();
        assert_eq!(
            event.field_values("Source.IP4").unwrap(),
            vec!["192.0.2.1", "192.0.2.2"]
        );
        assert_eq!(event.field_values("Target.Port").unwrap(), vec!["2222"]);
        assert_eq!(
            event.field_values("_Ext.EventClass").unwrap(),
            vec!["attempt-login"]
        );
        assert!(event.field_values("Source.Nonsense").is_none());
        assert!(Event::is_known_field("Node.SW"));
        assert!(!Event::is_known_field("Node.Bogus"));
    }

    #[test]
    fn severity_round_trip() {
        for severity in Severity::all() {
            assert_eq!(severity.as_str().parse::<Severity>().unwrap(), severity);
        }
        assert!("bogus".parse::<Severity>().is_err());
    }
}
