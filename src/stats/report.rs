use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::{builtin, MetricKind, MetricSink, Selector, SeriesStats, Tags};
use crate::threshold::{ThresholdResult, Verdict};
use crate::utils::format_duration;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every stage finished and the pool drained to the final target.
    Completed,
    /// A fatal threshold failed.
    Aborted,
    /// An operator asked the run to stop.
    Cancelled,
    /// The global run timeout elapsed.
    TimedOut,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Completed => "completed",
            Outcome::Aborted => "aborted",
            Outcome::Cancelled => "cancelled",
            Outcome::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Serializable aggregate of one metric or series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter {
        count: f64,
        rate: f64,
    },
    Rate {
        #[serde(skip_serializing_if = "Option::is_none")]
        rate: Option<f64>,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: u64,
        avg: f64,
        min: f64,
        med: f64,
        max: f64,
        p90: f64,
        p95: f64,
        p99: f64,
    },
    Gauge {
        value: f64,
        min: f64,
        max: f64,
    },
}

impl MetricSummary {
    pub fn from_stats(stats: &SeriesStats, elapsed_secs: f64) -> Self {
        match stats {
            SeriesStats::Counter(c) => MetricSummary::Counter {
                count: c.sum,
                rate: c.per_second(elapsed_secs),
            },
            SeriesStats::Rate(r) => MetricSummary::Rate {
                rate: r.rate(),
                passes: r.successes,
                fails: r.total - r.successes,
            },
            SeriesStats::Trend(t) if t.count == 0 => MetricSummary::Trend {
                count: 0,
                avg: 0.0,
                min: 0.0,
                med: 0.0,
                max: 0.0,
                p90: 0.0,
                p95: 0.0,
                p99: 0.0,
            },
            SeriesStats::Trend(t) => MetricSummary::Trend {
                count: t.count,
                avg: t.avg(),
                min: t.min,
                med: t.med(),
                max: t.max,
                p90: t.percentile(90.0),
                p95: t.percentile(95.0),
                p99: t.percentile(99.0),
            },
            SeriesStats::Gauge(g) => MetricSummary::Gauge {
                value: g.value,
                min: if g.min.is_finite() { g.min } else { 0.0 },
                max: if g.max.is_finite() { g.max } else { 0.0 },
            },
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSummary::Counter { .. } => MetricKind::Counter,
            MetricSummary::Rate { .. } => MetricKind::Rate,
            MetricSummary::Trend { .. } => MetricKind::Trend,
            MetricSummary::Gauge { .. } => MetricKind::Gauge,
        }
    }

    /// `(stat, value)` pairs in display order.
    pub fn fields(&self) -> Vec<(&'static str, f64)> {
        match *self {
            MetricSummary::Counter { count, rate } => vec![("count", count), ("rate", rate)],
            MetricSummary::Rate {
                rate,
                passes,
                fails,
            } => {
                let mut out = Vec::with_capacity(3);
                if let Some(rate) = rate {
                    out.push(("rate", rate));
                }
                out.push(("passes", passes as f64));
                out.push(("fails", fails as f64));
                out
            }
            MetricSummary::Trend {
                count,
                avg,
                min,
                med,
                max,
                p90,
                p95,
                p99,
            } => vec![
                ("avg", avg),
                ("min", min),
                ("med", med),
                ("max", max),
                ("p90", p90),
                ("p95", p95),
                ("p99", p99),
                ("count", count as f64),
            ],
            MetricSummary::Gauge { value, min, max } => {
                vec![("value", value), ("min", min), ("max", max)]
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesReport {
    pub name: String,
    pub tags: Tags,
    pub summary: MetricSummary,
}

/// Everything a run produced. Built once, after the pool drained and the
/// thresholds had their final evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub duration_secs: f64,
    /// Every series of a metric merged together, keyed by metric name.
    pub metrics: BTreeMap<String, MetricSummary>,
    pub series: Vec<SeriesReport>,
    pub thresholds: Vec<ThresholdResult>,
}

impl RunReport {
    pub fn build(
        outcome: Outcome,
        abort_reason: Option<String>,
        duration: Duration,
        sink: &MetricSink,
        thresholds: Vec<ThresholdResult>,
    ) -> Self {
        let elapsed_secs = duration.as_secs_f64();
        let metrics = sink
            .metric_names()
            .into_iter()
            .filter_map(|name| {
                let snapshot = sink.snapshot(&Selector::metric(name.clone()))?;
                Some((name, MetricSummary::from_stats(&snapshot.stats, elapsed_secs)))
            })
            .collect();
        let series = sink
            .series()
            .into_iter()
            .map(|(key, stats)| SeriesReport {
                name: key.name,
                tags: key.tags,
                summary: MetricSummary::from_stats(&stats, elapsed_secs),
            })
            .collect();

        Self {
            outcome,
            abort_reason,
            duration_secs: elapsed_secs,
            metrics,
            series,
            thresholds,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }

    pub fn thresholds_failed(&self) -> bool {
        self.thresholds.iter().any(ThresholdResult::failed)
    }

    /// Non-zero only when the run was stopped early. Failed non-fatal
    /// thresholds are reported but leave a completed run at 0.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Completed => 0,
            Outcome::Aborted | Outcome::Cancelled | Outcome::TimedOut => 1,
        }
    }

    /// Pass/fail counts per check name, summed across groups.
    pub fn checks(&self) -> BTreeMap<String, (u64, u64)> {
        let mut out: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for series in self.series.iter().filter(|s| s.name == builtin::CHECK_PREDICATES) {
            let (Some(check), MetricSummary::Rate { passes, fails, .. }) =
                (series.tags.get("check"), &series.summary)
            else {
                continue;
            };
            let entry = out.entry(check.clone()).or_default();
            entry.0 += passes;
            entry.1 += fails;
        }
        out
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn print_summary(&self) {
        println!("\n--- Run Summary ---");
        match &self.abort_reason {
            Some(reason) => println!("Outcome:  {} ({})", self.outcome, reason),
            None => println!("Outcome:  {}", self.outcome),
        }
        println!("Duration: {}", format_duration(self.duration()));

        if !self.thresholds.is_empty() {
            println!("\nThresholds:");
            for t in &self.thresholds {
                let mark = match t.verdict {
                    Verdict::Passed => "✓",
                    Verdict::Failed => "✗",
                    Verdict::Undetermined => "?",
                };
                let observed = match (t.observed, &t.detail) {
                    (Some(v), _) => format!("observed {:.4}", v),
                    (None, Some(detail)) => detail.clone(),
                    (None, None) => "no data".to_string(),
                };
                let mut flags = Vec::new();
                if t.fatal {
                    flags.push("abortOnFail");
                }
                if t.aborted_run {
                    flags.push("aborted run");
                }
                let flags = if flags.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", flags.join(", "))
                };
                println!("  {} {}: {} ({}){}", mark, t.metric, t.expression, observed, flags);
            }
        }

        let checks = self.checks();
        if !checks.is_empty() {
            println!("\nChecks:");
            for (name, (passes, fails)) in checks {
                let total = passes + fails;
                let percent = if total > 0 {
                    passes as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                if fails > 0 {
                    println!(
                        "  ✗ {} : {:.2}% ({} passed, {} failed)",
                        name, percent, passes, fails
                    );
                } else {
                    println!("  ✓ {} : 100% ({} passed)", name, passes);
                }
            }
        }

        if self.metrics.is_empty() {
            println!("\nNo metrics collected.");
        } else {
            println!("\nMetrics:");
            let width = self.metrics.keys().map(String::len).max().unwrap_or(0) + 2;
            for (name, summary) in &self.metrics {
                let fields: Vec<String> = summary
                    .fields()
                    .into_iter()
                    .map(|(stat, value)| format!("{}={}", stat, format_value(stat, value)))
                    .collect();
                println!("  {:.<width$} {}", format!("{} ", name), fields.join(" "), width = width);
            }
        }
        println!("-------------------\n");
    }
}

fn format_value(stat: &str, value: f64) -> String {
    match stat {
        "count" | "passes" | "fails" if value.fract() == 0.0 => format!("{}", value as u64),
        "rate" => format!("{:.4}", value),
        _ => format!("{:.2}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{MetricSample, Tags};

    fn sink_with_checks() -> MetricSink {
        let sink = MetricSink::new();
        for (group, ok) in [("::A", 1.0), ("::A", 0.0), ("::B", 1.0)] {
            let mut tags = Tags::new();
            tags.insert("group".to_string(), group.to_string());
            sink.record(MetricSample::new(builtin::CHECKS, MetricKind::Rate, ok, tags.clone()))
                .unwrap();
            tags.insert("check".to_string(), "status is 200".to_string());
            sink.record(MetricSample::new(builtin::CHECK_PREDICATES, MetricKind::Rate, ok, tags))
                .unwrap();
        }
        for v in [10.0, 20.0, 30.0] {
            sink.record(MetricSample::new(
                builtin::HTTP_REQ_DURATION,
                MetricKind::Trend,
                v,
                Tags::new(),
            ))
            .unwrap();
        }
        sink
    }

    #[test]
    fn test_build_merges_series_per_metric() {
        let sink = sink_with_checks();
        let report = RunReport::build(
            Outcome::Completed,
            None,
            Duration::from_secs(2),
            &sink,
            Vec::new(),
        );
        assert_eq!(report.series.len(), 5);
        match &report.metrics[builtin::CHECKS] {
            MetricSummary::Rate { passes, fails, .. } => {
                assert_eq!(*passes, 2);
                assert_eq!(*fails, 1);
            }
            other => panic!("unexpected summary {:?}", other),
        }
        match &report.metrics[builtin::HTTP_REQ_DURATION] {
            MetricSummary::Trend { count, avg, min, max, .. } => {
                assert_eq!(*count, 3);
                assert_eq!(*avg, 20.0);
                assert_eq!(*min, 10.0);
                assert_eq!(*max, 30.0);
            }
            other => panic!("unexpected summary {:?}", other),
        }
        assert_eq!(report.checks()["status is 200"], (2, 1));
    }

    #[test]
    fn test_exit_code() {
        let sink = MetricSink::new();
        let ok = RunReport::build(Outcome::Completed, None, Duration::ZERO, &sink, Vec::new());
        assert_eq!(ok.exit_code(), 0);

        let aborted = RunReport::build(
            Outcome::Aborted,
            Some("threshold crossed".to_string()),
            Duration::ZERO,
            &sink,
            Vec::new(),
        );
        assert_eq!(aborted.exit_code(), 1);

        let failed_threshold = ThresholdResult {
            metric: "http_req_failed".to_string(),
            expression: "rate<0.01".to_string(),
            fatal: false,
            verdict: Verdict::Failed,
            observed: Some(0.5),
            detail: None,
            aborted_run: false,
        };
        let mut undetermined = failed_threshold.clone();
        undetermined.verdict = Verdict::Undetermined;
        undetermined.observed = None;

        let completed_but_failed = RunReport::build(
            Outcome::Completed,
            None,
            Duration::ZERO,
            &sink,
            vec![failed_threshold],
        );
        assert!(completed_but_failed.thresholds_failed());
        assert_eq!(completed_but_failed.exit_code(), 0);

        let no_data =
            RunReport::build(Outcome::Completed, None, Duration::ZERO, &sink, vec![undetermined]);
        assert_eq!(no_data.exit_code(), 0);
    }

    #[test]
    fn test_json_export() {
        let sink = sink_with_checks();
        let report = RunReport::build(
            Outcome::Aborted,
            Some("threshold 'rate<=0.05' on 'check_failure_rate' crossed".to_string()),
            Duration::from_millis(1500),
            &sink,
            Vec::new(),
        );
        let value: serde_json::Value = serde_json::from_str(&report.to_json()).unwrap();
        assert_eq!(value["outcome"], "aborted");
        assert_eq!(value["duration_secs"], 1.5);
        assert_eq!(value["metrics"]["checks"]["type"], "rate");
        assert_eq!(value["metrics"]["http_req_duration"]["count"], 3);
        assert!(value["abort_reason"].as_str().unwrap().contains("rate<=0.05"));
    }
}
