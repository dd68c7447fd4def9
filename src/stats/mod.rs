use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::error::ConfigError;

pub mod csv;
pub mod report;
mod series;

pub use series::{CounterStats, GaugeStats, RateStats, SeriesStats, TrendStats};
use series::Series;

/// Sorted so that a tag set has exactly one canonical series key.
pub type Tags = BTreeMap<String, String>;

/// Metrics emitted by the engine itself.
pub mod builtin {
    use super::MetricKind;

    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATION_ERRORS: &str = "iteration_errors";
    pub const CHECKS: &str = "checks";
    pub const CHECK_PREDICATES: &str = "check_predicates";
    pub const GROUP_DURATION: &str = "group_duration";
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const DATA_RECEIVED: &str = "data_received";
    pub const DATA_SENT: &str = "data_sent";
    pub const VUS: &str = "vus";

    pub fn kind_of(name: &str) -> Option<MetricKind> {
        let kind = match name {
            ITERATIONS | ITERATION_ERRORS | HTTP_REQS | DATA_RECEIVED | DATA_SENT => {
                MetricKind::Counter
            }
            ITERATION_DURATION | GROUP_DURATION | HTTP_REQ_DURATION => MetricKind::Trend,
            CHECKS | CHECK_PREDICATES | HTTP_REQ_FAILED => MetricKind::Rate,
            VUS => MetricKind::Gauge,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "counter",
            MetricKind::Rate => "rate",
            MetricKind::Trend => "trend",
            MetricKind::Gauge => "gauge",
        };
        f.write_str(s)
    }
}

/// A single observation. Immutable once handed to the sink.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: Tags,
    pub timestamp: Instant,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, kind: MetricKind, value: f64, tags: Tags) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
            tags,
            timestamp: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub name: String,
    pub tags: Tags,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.tags.is_empty() {
            f.write_str("{")?;
            for (i, (k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}:{}", k, v)?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

/// `name` or `name{key:value,...}`. A series matches when its name is equal and
/// its tags contain every selector tag. The key ends at the first `:`, so
/// `group:::Login` selects `group = "::Login"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub name: String,
    pub tags: Tags,
}

impl Selector {
    pub fn metric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Tags::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let invalid =
            |reason: &str| ConfigError::InvalidSelector(input.to_string(), reason.to_string());
        let input_trimmed = input.trim();

        let (name, filter) = match input_trimmed.find('{') {
            Some(open) => {
                let rest = &input_trimmed[open + 1..];
                let inner = rest
                    .strip_suffix('}')
                    .ok_or_else(|| invalid("missing closing '}'"))?;
                (&input_trimmed[..open], Some(inner))
            }
            None => (input_trimmed, None),
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("metric name is empty"));
        }
        if name.contains(|c: char| c.is_whitespace() || c == '}') {
            return Err(invalid("metric name contains invalid characters"));
        }

        let mut tags = Tags::new();
        if let Some(inner) = filter {
            for pair in inner.split(',') {
                let pair = pair.trim();
                if pair.is_empty() {
                    continue;
                }
                let (key, value) = pair
                    .split_once(':')
                    .ok_or_else(|| invalid("tag filter must be key:value"))?;
                let key = key.trim();
                if key.is_empty() {
                    return Err(invalid("tag key is empty"));
                }
                tags.insert(key.to_string(), value.trim().to_string());
            }
        }

        Ok(Self {
            name: name.to_string(),
            tags,
        })
    }

    pub fn matches(&self, key: &SeriesKey) -> bool {
        key.name == self.name
            && self
                .tags
                .iter()
                .all(|(k, v)| key.tags.get(k).is_some_and(|have| have == v))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = SeriesKey {
            name: self.name.clone(),
            tags: self.tags.clone(),
        };
        write!(f, "{}", key)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("metric '{name}' is a {existing}, cannot record a {attempted} sample")]
    KindMismatch {
        name: String,
        existing: MetricKind,
        attempted: MetricKind,
    },
}

/// Aggregated statistics for one selector at the time of the call.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub series_matched: usize,
    pub stats: SeriesStats,
}

#[derive(Default)]
struct Registry {
    kinds: HashMap<String, MetricKind>,
    series: HashMap<SeriesKey, Arc<Series>>,
}

/// Concurrent accumulator for every metric emitted during a run.
///
/// The registry lock is only write-locked when a new `(name, tags)` series
/// appears; recording into an existing series takes a read lock to find it
/// and then that series' own mutex.
#[derive(Default)]
pub struct MetricSink {
    registry: RwLock<Registry>,
}

pub type SharedSink = Arc<MetricSink>;

impl MetricSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: MetricSample) -> Result<(), RecordError> {
        let MetricSample {
            name,
            kind,
            value,
            tags,
            timestamp,
        } = sample;
        let key = SeriesKey { name, tags };

        let existing = self.registry.read().series.get(&key).cloned();
        let series = match existing {
            Some(series) if series.kind() != kind => {
                return Err(RecordError::KindMismatch {
                    name: key.name,
                    existing: series.kind(),
                    attempted: kind,
                });
            }
            Some(series) => series,
            None => {
                let mut reg = self.registry.write();
                let known = *reg.kinds.entry(key.name.clone()).or_insert(kind);
                if known != kind {
                    return Err(RecordError::KindMismatch {
                        name: key.name,
                        existing: known,
                        attempted: kind,
                    });
                }
                reg.series
                    .entry(key)
                    .or_insert_with(|| Arc::new(Series::new(kind)))
                    .clone()
            }
        };

        series.record(value, timestamp);
        Ok(())
    }

    /// Kind registered for `name`, if anything was recorded under it.
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.registry.read().kinds.get(name).copied()
    }

    /// Merge every series matched by `selector`. `None` when nothing matched.
    pub fn snapshot(&self, selector: &Selector) -> Option<Snapshot> {
        let matching: Vec<Arc<Series>> = {
            let reg = self.registry.read();
            reg.series
                .iter()
                .filter(|(key, _)| selector.matches(key))
                .map(|(_, series)| series.clone())
                .collect()
        };

        let first = matching.first()?;
        let mut stats = SeriesStats::empty(first.kind());
        for series in &matching {
            series.merge_into(&mut stats);
        }
        Some(Snapshot {
            series_matched: matching.len(),
            stats,
        })
    }

    /// Every series with its current statistics, ordered by key.
    pub fn series(&self) -> Vec<(SeriesKey, SeriesStats)> {
        let all: Vec<(SeriesKey, Arc<Series>)> = {
            let reg = self.registry.read();
            reg.series
                .iter()
                .map(|(key, series)| (key.clone(), series.clone()))
                .collect()
        };
        let mut out: Vec<_> = all
            .into_iter()
            .map(|(key, series)| (key, series.stats()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Registered metric names in sorted order.
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.read().kinds.keys().cloned().collect();
        names.sort();
        names
    }
}
