//! Filter rule engine
//!
//! Compiles abuse-group filter rules from their YAML definitions and
//! evaluates them against events. A rule consists of named selections
//! (field criteria compiled to matchers) and an optional boolean condition
//! expression over the selection names; without a condition, any matching
//! selection matches the rule.
//!
//! Rules evaluate in configured order and the first match wins. Hit
//! counters are advisory statistics updated with atomic increments.

use chrono::{DateTime, Utc};
use evalexpr::{ContextWithMutableVariables, HashMapContext, Node, Value};
use ipnetwork::IpNetwork;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, RwLock};
use tracing::debug;

use crate::error::{WardenError, WardenResult};
use crate::models::Event;

/// Target name for filter engine operational logs
const TARGET_FILTER: &str = "filter";

/// Filtering-log key counting events skipped after a recovered evaluation
/// failure.
pub const KEY_FILTER_ERROR: &str = "__ERROR__";

/// Regex for replacing "and" keywords (case-insensitive word match)
static AND_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\band\b").expect("AND_REGEX pattern is valid"));

/// Regex for replacing "or" keywords (case-insensitive word match)
static OR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bor\b").expect("OR_REGEX pattern is valid"));

/// Regex for replacing "not" keywords (case-insensitive word match)
static NOT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bnot\b").expect("NOT_REGEX pattern is valid"));

/// Regex for validating selection identifiers
static IDENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("IDENT_REGEX pattern is valid"));

// ============================================================================
// Rule definitions
// ============================================================================

/// Filter rule as configured per abuse group (YAML representation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    /// Rule name, reported in the filtering log
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Disabled rules are excluded at compile time
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,

    /// Named selections: field criteria, AND logic between fields
    pub selections: HashMap<String, serde_yaml::Value>,

    /// Boolean expression over selection names; defaults to OR of all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl FilterRule {
    /// Parse rules from a (possibly multi-document) YAML string.
    pub fn from_yaml(content: &str) -> WardenResult<Vec<FilterRule>> {
        serde_yaml::Deserializer::from_str(content)
            .map(|doc| {
                FilterRule::deserialize(doc)
                    .map_err(|e| WardenError::Config(format!("malformed filter rule: {e}")))
            })
            .collect()
    }
}

/// Pattern matcher type parsed from a field modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatternMatcher {
    /// Auto-detect: wildcard when the pattern contains `*`/`?`, else exact
    Default,
    Contains,
    StartsWith,
    EndsWith,
    /// All patterns must match (instead of any)
    All,
}

/// Compiled matcher for one field value
#[derive(Debug, Clone)]
enum FieldPattern {
    /// Exact match (case-insensitive)
    Exact(String),
    /// Contains substring (case-insensitive)
    Contains(String),
    /// Starts with prefix (case-insensitive)
    StartsWith(String),
    /// Ends with suffix (case-insensitive)
    EndsWith(String),
    /// Regex match
    Regex(Regex),
    /// CIDR network match
    Cidr(IpNetwork),
    /// Field has no values
    Null,
    /// Field has at least one value
    NotNull,
}

/// Field criterion: one field, one or more patterns
#[derive(Debug, Clone)]
struct FieldCriterion {
    field: String,
    patterns: Vec<FieldPattern>,
    match_all: bool,
}

/// Compiled selection (AND logic between field criteria)
#[derive(Debug, Clone)]
struct Selection {
    field_criteria: Vec<FieldCriterion>,
}

/// Filter rule compiled for evaluation, carrying its hit statistics.
pub struct CompiledFilter {
    /// Rule name
    pub name: String,
    selections: HashMap<String, Selection>,
    condition: Node,
    hits: AtomicU64,
    last_hit: RwLock<Option<DateTime<Utc>>>,
}

impl CompiledFilter {
    /// Number of events this rule has matched.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Timestamp of the most recent match.
    pub fn last_hit(&self) -> Option<DateTime<Utc>> {
        *self.last_hit.read().unwrap()
    }

    fn record_hit(&self, now: DateTime<Utc>) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        *self.last_hit.write().unwrap() = Some(now);
    }
}

/// Hit counter snapshot for persistence by the embedding application.
#[derive(Debug, Clone, Serialize)]
pub struct RuleHits {
    pub name: String,
    pub hits: u64,
    pub last_hit: Option<DateTime<Utc>>,
}

// ============================================================================
// Engine
// ============================================================================

/// Compiled filter rule set for one abuse group.
pub struct FilterEngine {
    filters: Vec<CompiledFilter>,
}

impl FilterEngine {
    /// Compile the enabled rules that are inside their validity window at
    /// `now`. Malformed rules are configuration errors; nothing is
    /// silently skipped.
    pub fn compile(rules: &[FilterRule], now: DateTime<Utc>) -> WardenResult<Self> {
        let mut filters = Vec::new();
        for rule in rules {
            if !rule.enabled {
                debug!(target: TARGET_FILTER, rule = %rule.name, "Skipping disabled rule");
                continue;
            }
            if let Some(from) = rule.valid_from {
                if now < from {
                    continue;
                }
            }
            if let Some(to) = rule.valid_to {
                if now > to {
                    continue;
                }
            }
            filters.push(Self::compile_rule(rule)?);
        }
        Ok(Self { filters })
    }

    /// Number of active compiled rules.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Hit counter snapshot across all rules.
    pub fn hit_stats(&self) -> Vec<RuleHits> {
        self.filters
            .iter()
            .map(|f| RuleHits {
                name: f.name.clone(),
                hits: f.hits(),
                last_hit: f.last_hit(),
            })
            .collect()
    }

    /// Evaluate rules in order against the whole event; the first match
    /// wins. With `count_hit` the matching rule's counter is incremented
    /// (per-source re-evaluation passes pass `false`).
    pub fn match_event(
        &self,
        event: &Event,
        count_hit: bool,
        now: DateTime<Utc>,
    ) -> WardenResult<Option<&str>> {
        for filter in &self.filters {
            if self.matches_filter(event, filter)? {
                if count_hit {
                    filter.record_hit(now);
                }
                return Ok(Some(filter.name.as_str()));
            }
        }
        Ok(None)
    }

    fn matches_filter(&self, event: &Event, filter: &CompiledFilter) -> WardenResult<bool> {
        let mut context = HashMapContext::new();
        for (name, selection) in &filter.selections {
            let matched = Self::matches_selection(event, selection);
            context
                .set_value(name.clone(), Value::Boolean(matched))
                .map_err(|e| {
                    WardenError::Config(format!(
                        "filter '{}': cannot bind selection '{}': {}",
                        filter.name, name, e
                    ))
                })?;
        }
        filter
            .condition
            .eval_boolean_with_context(&context)
            .map_err(|e| {
                WardenError::Config(format!(
                    "filter '{}': condition evaluation failed: {}",
                    filter.name, e
                ))
            })
    }

    fn matches_selection(event: &Event, selection: &Selection) -> bool {
        selection
            .field_criteria
            .iter()
            .all(|criterion| Self::matches_criterion(event, criterion))
    }

    fn matches_criterion(event: &Event, criterion: &FieldCriterion) -> bool {
        let values = event
            .field_values(&criterion.field)
            .unwrap_or_default();

        if values.is_empty() {
            return criterion
                .patterns
                .iter()
                .any(|pattern| matches!(pattern, FieldPattern::Null));
        }

        if criterion.match_all {
            criterion
                .patterns
                .iter()
                .all(|pattern| values.iter().any(|value| Self::matches_pattern(pattern, value)))
        } else {
            criterion
                .patterns
                .iter()
                .any(|pattern| values.iter().any(|value| Self::matches_pattern(pattern, value)))
        }
    }

    fn matches_pattern(pattern: &FieldPattern, value: &str) -> bool {
        match pattern {
            FieldPattern::Exact(expected) => value.eq_ignore_ascii_case(expected),
            FieldPattern::Contains(needle) => value
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            FieldPattern::StartsWith(prefix) => value
                .to_ascii_lowercase()
                .starts_with(&prefix.to_ascii_lowercase()),
            FieldPattern::EndsWith(suffix) => value
                .to_ascii_lowercase()
                .ends_with(&suffix.to_ascii_lowercase()),
            FieldPattern::Regex(regex) => regex.is_match(value),
            FieldPattern::Cidr(network) => value
                .parse::<IpAddr>()
                .map(|addr| network.contains(addr))
                .unwrap_or(false),
            FieldPattern::Null => false,
            FieldPattern::NotNull => true,
        }
    }

    // ------------------------------------------------------------------
    // Compilation
    // ------------------------------------------------------------------

    fn compile_rule(rule: &FilterRule) -> WardenResult<CompiledFilter> {
        if rule.selections.is_empty() {
            return Err(WardenError::Config(format!(
                "filter '{}' has no selections",
                rule.name
            )));
        }

        let mut selections = HashMap::new();
        for (selection_id, selection_value) in &rule.selections {
            if !IDENT_REGEX.is_match(selection_id) {
                return Err(WardenError::Config(format!(
                    "filter '{}': invalid selection name '{}'",
                    rule.name, selection_id
                )));
            }
            let fields = selection_value.as_mapping().ok_or_else(|| {
                WardenError::Config(format!(
                    "filter '{}': selection '{}' must be a field mapping",
                    rule.name, selection_id
                ))
            })?;

            let mut field_criteria = Vec::new();
            for (field_key, field_value) in fields {
                let field_key = field_key.as_str().ok_or_else(|| {
                    WardenError::Config(format!(
                        "filter '{}': non-string field key in selection '{}'",
                        rule.name, selection_id
                    ))
                })?;
                let (field_name, modifiers) = Self::parse_field_key(field_key);

                if !Event::is_known_field(field_name) {
                    return Err(WardenError::Config(format!(
                        "filter '{}': unknown event field '{}'",
                        rule.name, field_name
                    )));
                }

                let matcher = Self::parse_matcher(&rule.name, &modifiers)?;
                let patterns =
                    Self::parse_field_value(&rule.name, field_value, &modifiers, matcher)?;
                field_criteria.push(FieldCriterion {
                    field: field_name.to_string(),
                    patterns,
                    match_all: matcher == PatternMatcher::All,
                });
            }

            selections.insert(selection_id.clone(), Selection { field_criteria });
        }

        let condition = Self::compile_condition(rule, &selections)?;

        Ok(CompiledFilter {
            name: rule.name.clone(),
            selections,
            condition,
            hits: AtomicU64::new(0),
            last_hit: RwLock::new(None),
        })
    }

    /// Parse field key with modifiers (e.g., "Source.IP4|cidr").
    fn parse_field_key(key: &str) -> (&str, Vec<&str>) {
        let mut parts = key.split('|');
        // split() always yields at least one element
        let field = parts.next().unwrap_or_default();
        (field, parts.collect())
    }

    fn parse_matcher(rule_name: &str, modifiers: &[&str]) -> WardenResult<PatternMatcher> {
        let mut matcher = PatternMatcher::Default;
        for modifier in modifiers {
            matcher = match *modifier {
                "contains" => PatternMatcher::Contains,
                "startswith" => PatternMatcher::StartsWith,
                "endswith" => PatternMatcher::EndsWith,
                "all" => PatternMatcher::All,
                "re" | "cidr" | "exists" => continue,
                other => {
                    return Err(WardenError::Config(format!(
                        "filter '{rule_name}': unknown field modifier '{other}'"
                    )))
                }
            };
        }
        Ok(matcher)
    }

    fn parse_field_value(
        rule_name: &str,
        value: &serde_yaml::Value,
        modifiers: &[&str],
        matcher: PatternMatcher,
    ) -> WardenResult<Vec<FieldPattern>> {
        let scalars: Vec<serde_yaml::Value> = match value {
            serde_yaml::Value::Sequence(seq) => seq.clone(),
            other => vec![other.clone()],
        };

        let mut patterns = Vec::with_capacity(scalars.len());
        for scalar in &scalars {
            patterns.push(Self::parse_scalar_pattern(
                rule_name, scalar, modifiers, matcher,
            )?);
        }
        if patterns.is_empty() {
            return Err(WardenError::Config(format!(
                "filter '{rule_name}': empty pattern list"
            )));
        }
        Ok(patterns)
    }

    fn parse_scalar_pattern(
        rule_name: &str,
        value: &serde_yaml::Value,
        modifiers: &[&str],
        matcher: PatternMatcher,
    ) -> WardenResult<FieldPattern> {
        if modifiers.contains(&"exists") {
            let wanted = value.as_bool().ok_or_else(|| {
                WardenError::Config(format!(
                    "filter '{rule_name}': 'exists' expects a boolean"
                ))
            })?;
            return Ok(if wanted {
                FieldPattern::NotNull
            } else {
                FieldPattern::Null
            });
        }

        if value.is_null() {
            return Ok(FieldPattern::Null);
        }

        let text = match value {
            serde_yaml::Value::String(s) => s.clone(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            other => {
                return Err(WardenError::Config(format!(
                    "filter '{rule_name}': unsupported pattern value {other:?}"
                )))
            }
        };

        if modifiers.contains(&"cidr") {
            let network = text.parse::<IpNetwork>().map_err(|e| {
                WardenError::Config(format!(
                    "filter '{rule_name}': invalid CIDR '{text}': {e}"
                ))
            })?;
            return Ok(FieldPattern::Cidr(network));
        }

        if modifiers.contains(&"re") {
            let regex = Regex::new(&text).map_err(|e| {
                WardenError::Config(format!(
                    "filter '{rule_name}': invalid regex '{text}': {e}"
                ))
            })?;
            return Ok(FieldPattern::Regex(regex));
        }

        Ok(match matcher {
            PatternMatcher::Contains => FieldPattern::Contains(text),
            PatternMatcher::StartsWith => FieldPattern::StartsWith(text),
            PatternMatcher::EndsWith => FieldPattern::EndsWith(text),
            PatternMatcher::Default | PatternMatcher::All => {
                if text.contains('*') || text.contains('?') {
                    let regex_str =
                        format!("(?i)^{}$", Self::wildcard_to_regex(&text));
                    let regex = Regex::new(&regex_str).map_err(|e| {
                        WardenError::Config(format!(
                            "filter '{rule_name}': invalid wildcard '{text}': {e}"
                        ))
                    })?;
                    FieldPattern::Regex(regex)
                } else {
                    FieldPattern::Exact(text)
                }
            }
        })
    }

    /// Convert a wildcard pattern to regex with escape handling:
    /// `\*` -> literal asterisk, `\?` -> literal question mark,
    /// `\\` -> literal backslash.
    fn wildcard_to_regex(pattern: &str) -> String {
        let mut regex = String::new();
        let mut chars = pattern.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.peek().copied() {
                    Some(next @ ('*' | '?')) => {
                        regex.push_str(&regex::escape(&next.to_string()));
                        chars.next();
                    }
                    Some('\\') => {
                        regex.push_str("\\\\");
                        chars.next();
                    }
                    _ => regex.push_str("\\\\"),
                }
            } else if c == '*' {
                regex.push_str(".*");
            } else if c == '?' {
                regex.push('.');
            } else {
                regex.push_str(&regex::escape(&c.to_string()));
            }
        }
        regex
    }

    /// Transpile the rule condition into an evalexpr operator tree,
    /// replacing the and/or/not keywords and validating that every
    /// identifier refers to a selection.
    fn compile_condition(
        rule: &FilterRule,
        selections: &HashMap<String, Selection>,
    ) -> WardenResult<Node> {
        let condition = match &rule.condition {
            Some(condition) => {
                let mut result = condition.clone();
                result = AND_REGEX.replace_all(&result, "&&").to_string();
                result = OR_REGEX.replace_all(&result, "||").to_string();
                result = NOT_REGEX.replace_all(&result, "!").to_string();
                result
            }
            // Implied OR over all selections.
            None => {
                let mut names: Vec<&str> =
                    selections.keys().map(String::as_str).collect();
                names.sort_unstable();
                names.join(" || ")
            }
        };

        let node = evalexpr::build_operator_tree(&condition).map_err(|e| {
            WardenError::Config(format!(
                "filter '{}': malformed condition '{}': {}",
                rule.name, condition, e
            ))
        })?;

        for identifier in node.iter_variable_identifiers() {
            if !selections.contains_key(identifier) {
                return Err(WardenError::Config(format!(
                    "filter '{}': condition references unknown selection '{}'",
                    rule.name, identifier
                )));
            }
        }

        Ok(node)
    }
}
