//! Pass/fail rules over aggregated metrics, evaluated on a fixed cadence while
//! the run is in progress and once more after it drains.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::state::RunState;
use crate::error::ConfigError;
use crate::stats::{builtin, MetricKind, MetricSink, Selector};

pub mod expr;

pub use expr::{Comparator, Statistic, ThresholdExpr};

/// One threshold, parsed once at startup.
#[derive(Debug, Clone)]
pub struct ThresholdSpec {
    pub selector: Selector,
    /// Selector as written in the configuration, used in reports.
    pub metric: String,
    pub expr: ThresholdExpr,
    pub source: String,
    pub fatal: bool,
    /// Fatal thresholds may not abort before this much run time.
    pub delay_abort_eval: Duration,
}

impl ThresholdSpec {
    pub fn parse(metric: &str, expression: &str) -> Result<Self, ConfigError> {
        let selector = Selector::parse(metric)?;
        let expr: ThresholdExpr =
            expression
                .parse()
                .map_err(|reason| ConfigError::InvalidExpression {
                    selector: metric.to_string(),
                    expr: expression.to_string(),
                    reason,
                })?;
        let spec = Self {
            selector,
            metric: metric.trim().to_string(),
            expr,
            source: expression.trim().to_string(),
            fatal: false,
            delay_abort_eval: Duration::ZERO,
        };
        if let Some(kind) = builtin::kind_of(&spec.selector.name) {
            spec.ensure_applicable(kind)?;
        }
        Ok(spec)
    }

    pub fn fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn delay_abort_eval(mut self, delay: Duration) -> Self {
        self.delay_abort_eval = delay;
        self
    }

    fn ensure_applicable(&self, kind: MetricKind) -> Result<(), ConfigError> {
        if self.expr.stat.applies_to(kind) {
            Ok(())
        } else {
            Err(ConfigError::StatisticNotApplicable {
                selector: self.metric.clone(),
                expr: self.source.clone(),
                stat: self.expr.stat.to_string(),
                kind: kind.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No sample matched the selector yet. Never aborts, never fails the run.
    Undetermined,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub fatal: bool,
    pub verdict: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Set on the threshold whose failure aborted the run.
    pub aborted_run: bool,
}

impl ThresholdResult {
    fn pending(spec: &ThresholdSpec) -> Self {
        Self {
            metric: spec.metric.clone(),
            expression: spec.source.clone(),
            fatal: spec.fatal,
            verdict: Verdict::Undetermined,
            observed: None,
            detail: None,
            aborted_run: false,
        }
    }

    pub fn failed(&self) -> bool {
        self.verdict == Verdict::Failed
    }
}

pub struct ThresholdEvaluator {
    specs: Vec<ThresholdSpec>,
    results: Mutex<Vec<ThresholdResult>>,
}

impl ThresholdEvaluator {
    pub fn new(specs: Vec<ThresholdSpec>) -> Self {
        let results = specs.iter().map(ThresholdResult::pending).collect();
        Self {
            specs,
            results: Mutex::new(results),
        }
    }

    pub fn specs(&self) -> &[ThresholdSpec] {
        &self.specs
    }

    /// Evaluate every threshold against the sink and remember the outcome.
    pub fn evaluate(&self, sink: &MetricSink, elapsed: Duration) -> Vec<ThresholdResult> {
        let elapsed_secs = elapsed.as_secs_f64();
        let mut results = self.results.lock();
        for (spec, result) in self.specs.iter().zip(results.iter_mut()) {
            let Some(snapshot) = sink.snapshot(&spec.selector) else {
                result.verdict = Verdict::Undetermined;
                result.observed = None;
                result.detail = None;
                continue;
            };

            let kind = snapshot.stats.kind();
            if !spec.expr.stat.applies_to(kind) {
                result.verdict = Verdict::Failed;
                result.observed = None;
                result.detail = Some(format!(
                    "statistic '{}' is not defined for {} metrics",
                    spec.expr.stat, kind
                ));
                continue;
            }

            match spec.expr.evaluate(&snapshot.stats, elapsed_secs) {
                Some((passed, observed)) => {
                    result.verdict = if passed {
                        Verdict::Passed
                    } else {
                        Verdict::Failed
                    };
                    result.observed = Some(observed);
                    result.detail = None;
                }
                None => {
                    result.verdict = Verdict::Undetermined;
                    result.observed = None;
                    result.detail = None;
                }
            }
        }
        results.clone()
    }

    /// One evaluator tick. Aborts the run when a fatal threshold fails past its
    /// `delay_abort_eval`; returns `true` if this tick did so.
    pub fn tick(&self, sink: &MetricSink, state: &RunState) -> bool {
        let elapsed = state.elapsed();
        let results = self.evaluate(sink, elapsed);
        for (idx, (spec, result)) in self.specs.iter().zip(results.iter()).enumerate() {
            if !spec.fatal || !result.failed() || elapsed < spec.delay_abort_eval {
                continue;
            }
            let reason = match (result.observed, &result.detail) {
                (Some(observed), _) => format!(
                    "threshold '{}' on '{}' crossed (observed {:.4})",
                    spec.source, spec.metric, observed
                ),
                (None, Some(detail)) => format!(
                    "threshold '{}' on '{}' failed: {}",
                    spec.source, spec.metric, detail
                ),
                (None, None) => format!("threshold '{}' on '{}' failed", spec.source, spec.metric),
            };
            if state.abort(reason.clone()) {
                warn!(
                    threshold = %spec.source,
                    metric = %spec.metric,
                    reason = %reason,
                    "Aborting run"
                );
                if let Some(stored) = self.results.lock().get_mut(idx) {
                    stored.aborted_run = true;
                }
                return true;
            }
            // Someone else already aborted; later ticks cannot change that.
            return false;
        }
        false
    }

    /// Latest outcome of every threshold, in declaration order.
    pub fn results(&self) -> Vec<ThresholdResult> {
        self.results.lock().clone()
    }

    /// Tick every `interval` on a background thread until the run starts
    /// stopping. The final evaluation is the controller's job.
    pub fn spawn(
        self: &Arc<Self>,
        sink: Arc<MetricSink>,
        state: Arc<RunState>,
        interval: Duration,
    ) -> std::io::Result<JoinHandle<()>> {
        let evaluator = Arc::clone(self);
        let interval = interval.max(Duration::from_millis(10));
        thread::Builder::new()
            .name("thresholds".to_string())
            .spawn(move || {
                let slice = interval.min(Duration::from_millis(50));
                'ticks: loop {
                    let mut waited = Duration::ZERO;
                    while waited < interval {
                        if state.should_stop() || state.is_finished() {
                            break 'ticks;
                        }
                        thread::sleep(slice);
                        waited += slice;
                    }
                    if evaluator.tick(&sink, &state) {
                        break;
                    }
                }
                debug!("Threshold evaluator stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{MetricSample, Tags};

    fn record(sink: &MetricSink, name: &str, kind: MetricKind, value: f64, tags: Tags) {
        sink.record(MetricSample::new(name, kind, value, tags)).unwrap();
    }

    #[test]
    fn test_parse_rejects_bad_expression() {
        let err = ThresholdSpec::parse("http_req_failed", "rate <> 0.01").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidExpression { .. }));
        let err = ThresholdSpec::parse("http_req_failed{group", "rate<0.01").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSelector(..)));
    }

    #[test]
    fn test_parse_checks_builtin_applicability() {
        let err = ThresholdSpec::parse("http_req_failed", "avg<200").unwrap_err();
        assert!(matches!(err, ConfigError::StatisticNotApplicable { .. }));
        assert!(ThresholdSpec::parse("group_duration{group:::Metadata}", "avg<200").is_ok());
        // Custom metrics are checked when they have data.
        assert!(ThresholdSpec::parse("check_failure_rate", "avg<200").is_ok());
    }

    #[test]
    fn test_zero_samples_is_undetermined() {
        let sink = MetricSink::new();
        let state = RunState::new();
        let spec = ThresholdSpec::parse("check_failure_rate", "rate<=0.05")
            .unwrap()
            .fatal(true);
        let evaluator = ThresholdEvaluator::new(vec![spec]);
        assert!(!evaluator.tick(&sink, &state));
        let results = evaluator.results();
        assert_eq!(results[0].verdict, Verdict::Undetermined);
        assert!(!state.is_aborted());
    }

    #[test]
    fn test_fatal_failure_aborts_once() {
        let sink = MetricSink::new();
        let state = RunState::new();
        for _ in 0..10 {
            record(&sink, "check_failure_rate", MetricKind::Rate, 1.0, Tags::new());
        }
        let specs = vec![
            ThresholdSpec::parse("check_failure_rate", "rate<0.01").unwrap(),
            ThresholdSpec::parse("check_failure_rate", "rate<=0.05")
                .unwrap()
                .fatal(true),
        ];
        let evaluator = ThresholdEvaluator::new(specs);
        assert!(evaluator.tick(&sink, &state));
        assert!(!evaluator.tick(&sink, &state));

        let reason = state.abort_reason().unwrap();
        assert!(reason.contains("rate<=0.05"));
        assert!(reason.contains("check_failure_rate"));

        let results = evaluator.results();
        assert_eq!(results[0].verdict, Verdict::Failed);
        assert!(!results[0].aborted_run);
        assert_eq!(results[1].verdict, Verdict::Failed);
        assert!(results[1].aborted_run);
        assert_eq!(results[1].observed, Some(1.0));
    }

    #[test]
    fn test_non_fatal_failure_does_not_abort() {
        let sink = MetricSink::new();
        let state = RunState::new();
        record(&sink, "http_req_failed", MetricKind::Rate, 1.0, Tags::new());
        let spec = ThresholdSpec::parse("http_req_failed", "rate<0.01").unwrap();
        let evaluator = ThresholdEvaluator::new(vec![spec]);
        assert!(!evaluator.tick(&sink, &state));
        assert!(!state.is_aborted());
        assert!(evaluator.results()[0].failed());
    }

    #[test]
    fn test_delay_abort_eval_holds_back_abort() {
        let sink = MetricSink::new();
        let state = RunState::new();
        record(&sink, "errors", MetricKind::Rate, 1.0, Tags::new());
        let spec = ThresholdSpec::parse("errors", "rate<0.5")
            .unwrap()
            .fatal(true)
            .delay_abort_eval(Duration::from_secs(3600));
        let evaluator = ThresholdEvaluator::new(vec![spec]);
        assert!(!evaluator.tick(&sink, &state));
        assert!(!state.is_aborted());
        assert!(evaluator.results()[0].failed());
    }

    #[test]
    fn test_group_selector_filters_series() {
        let sink = MetricSink::new();
        let mut metadata = Tags::new();
        metadata.insert("group".to_string(), "::Metadata".to_string());
        let mut content = Tags::new();
        content.insert("group".to_string(), "::Content".to_string());
        record(&sink, "group_duration", MetricKind::Trend, 50.0, metadata);
        record(&sink, "group_duration", MetricKind::Trend, 900.0, content);

        let evaluator = ThresholdEvaluator::new(vec![
            ThresholdSpec::parse("group_duration{group:::Metadata}", "avg<200").unwrap(),
            ThresholdSpec::parse("group_duration", "avg<200").unwrap(),
        ]);
        let results = evaluator.evaluate(&sink, Duration::from_secs(1));
        assert_eq!(results[0].verdict, Verdict::Passed);
        assert_eq!(results[0].observed, Some(50.0));
        assert_eq!(results[1].verdict, Verdict::Failed);
        assert_eq!(results[1].observed, Some(475.0));
    }

    #[test]
    fn test_inapplicable_statistic_on_custom_metric_fails() {
        let sink = MetricSink::new();
        record(&sink, "queue_depth", MetricKind::Gauge, 4.0, Tags::new());
        let evaluator =
            ThresholdEvaluator::new(vec![ThresholdSpec::parse("queue_depth", "p(95)<10").unwrap()]);
        let results = evaluator.evaluate(&sink, Duration::from_secs(1));
        assert_eq!(results[0].verdict, Verdict::Failed);
        assert!(results[0].detail.as_deref().unwrap().contains("gauge"));
    }

    #[test]
    fn test_counter_rate_is_per_second() {
        let sink = MetricSink::new();
        for _ in 0..20 {
            record(&sink, "http_reqs", MetricKind::Counter, 1.0, Tags::new());
        }
        let evaluator = ThresholdEvaluator::new(vec![
            ThresholdSpec::parse("http_reqs", "rate>5").unwrap(),
            ThresholdSpec::parse("http_reqs", "count==20").unwrap(),
        ]);
        let results = evaluator.evaluate(&sink, Duration::from_secs(2));
        assert_eq!(results[0].observed, Some(10.0));
        assert_eq!(results[0].verdict, Verdict::Passed);
        assert_eq!(results[1].verdict, Verdict::Passed);
    }
}
