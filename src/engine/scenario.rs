//! One iteration of user logic for one virtual user.
//!
//! Scenario code receives a [`VuContext`] that carries the current group path
//! explicitly. Every metric recorded through the context is tagged with that
//! path, so selectors such as `group_duration{group:::Metadata}` work.

use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use http::Request;
use tracing::{debug, warn};

use super::state::RunState;
use super::transport::{HttpResponse, Transport};
use crate::stats::{builtin, MetricKind, MetricSample, MetricSink, Tags};

/// Separator between group names in the `group` tag.
pub const GROUP_SEPARATOR: &str = "::";

/// User logic executed once per iteration.
pub trait Scenario: Send + Sync {
    fn run(&self, ctx: &mut VuContext<'_>) -> anyhow::Result<()>;
}

impl<F> Scenario for F
where
    F: Fn(&mut VuContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, ctx: &mut VuContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// Per-run knobs that shape what the runner records.
#[derive(Debug, Clone)]
pub struct VuOptions {
    /// Tag HTTP samples with their URL.
    pub endpoint_tracking: bool,
    pub request_timeout: Option<Duration>,
}

impl Default for VuOptions {
    fn default() -> Self {
        Self {
            endpoint_tracking: true,
            request_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Result of a single predicate: plain `bool`, or a `Result` whose error
/// counts as a failed check.
pub trait CheckOutcome {
    fn into_outcome(self) -> Result<bool, String>;
}

impl CheckOutcome for bool {
    fn into_outcome(self) -> Result<bool, String> {
        Ok(self)
    }
}

impl<E: Display> CheckOutcome for Result<bool, E> {
    fn into_outcome(self) -> Result<bool, String> {
        self.map_err(|e| e.to_string())
    }
}

type Predicate<'c, T> = Box<dyn Fn(&T) -> Result<bool, String> + 'c>;

/// Named predicates evaluated together by [`VuContext::check`].
pub struct Checks<'c, T: ?Sized> {
    entries: Vec<(String, Predicate<'c, T>)>,
}

impl<'c, T: ?Sized> Checks<'c, T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn with<F, O>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&T) -> O + 'c,
        O: CheckOutcome,
    {
        let predicate: Predicate<'c, T> =
            Box::new(move |value: &T| predicate(value).into_outcome());
        self.entries.push((name.into(), predicate));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: ?Sized> Default for Checks<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct VuContext<'a> {
    vu: u64,
    iteration: u64,
    sink: &'a MetricSink,
    transport: &'a dyn Transport,
    options: &'a VuOptions,
    group_path: Vec<String>,
    sleep_after: Duration,
}

impl<'a> VuContext<'a> {
    pub fn new(
        vu: u64,
        iteration: u64,
        sink: &'a MetricSink,
        transport: &'a dyn Transport,
        options: &'a VuOptions,
    ) -> Self {
        Self {
            vu,
            iteration,
            sink,
            transport,
            options,
            group_path: Vec::new(),
            sleep_after: Duration::ZERO,
        }
    }

    pub fn vu_id(&self) -> u64 {
        self.vu
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// `::A::B` inside nested groups A and B, `None` at the top level.
    pub fn group_path(&self) -> Option<String> {
        if self.group_path.is_empty() {
            None
        } else {
            let mut path = String::new();
            for name in &self.group_path {
                path.push_str(GROUP_SEPARATOR);
                path.push_str(name);
            }
            Some(path)
        }
    }

    fn tags(&self) -> Tags {
        let mut tags = Tags::new();
        if let Some(path) = self.group_path() {
            tags.insert("group".to_string(), path);
        }
        tags
    }

    fn emit(&self, name: &str, kind: MetricKind, value: f64, tags: Tags) {
        if let Err(e) = self.sink.record(MetricSample::new(name, kind, value, tags)) {
            warn!(vu = self.vu, error = %e, "Dropped metric sample");
        }
    }

    /// Run `f` inside group `name`. Metrics recorded by `f` carry the nested
    /// group path, and the group's wall time goes to `group_duration`.
    pub fn group<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        if name.is_empty() || name.contains(GROUP_SEPARATOR) {
            bail!("invalid group name '{}'", name);
        }
        self.group_path.push(name.to_string());
        let start = Instant::now();
        let result = f(self);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.emit(
            builtin::GROUP_DURATION,
            MetricKind::Trend,
            elapsed_ms,
            self.tags(),
        );
        self.group_path.pop();
        result
    }

    /// Evaluate every predicate against `value`. Records one `checks` sample
    /// for the whole call (1 only if all passed) and one `check_predicates`
    /// sample per predicate, tagged with its name. A predicate that errors or
    /// panics counts as failed.
    pub fn check<T: ?Sized>(&self, value: &T, checks: Checks<'_, T>) -> bool {
        let mut all_passed = true;
        for (name, predicate) in checks.entries {
            let passed = match panic::catch_unwind(AssertUnwindSafe(|| predicate(value))) {
                Ok(Ok(passed)) => passed,
                Ok(Err(e)) => {
                    debug!(vu = self.vu, check = %name, error = %e, "Check predicate failed");
                    false
                }
                Err(payload) => {
                    debug!(
                        vu = self.vu,
                        check = %name,
                        panic = %panic_message(&*payload),
                        "Check predicate panicked"
                    );
                    false
                }
            };
            all_passed &= passed;
            let mut tags = self.tags();
            tags.insert("check".to_string(), name);
            self.emit(
                builtin::CHECK_PREDICATES,
                MetricKind::Rate,
                if passed { 1.0 } else { 0.0 },
                tags,
            );
        }
        self.emit(
            builtin::CHECKS,
            MetricKind::Rate,
            if all_passed { 1.0 } else { 0.0 },
            self.tags(),
        );
        all_passed
    }

    pub fn get(&self, url: &str) -> HttpResponse {
        self.request("GET", url)
    }

    pub fn request(&self, method: &str, url: &str) -> HttpResponse {
        self.batch(&[(method, url)]).pop().unwrap_or_else(|| {
            HttpResponse::failed(method.to_string(), url.to_string(), "no response".to_string())
        })
    }

    /// Issue `(method, url)` pairs concurrently; responses come back in the same order.
    pub fn batch(&self, requests: &[(&str, &str)]) -> Vec<HttpResponse> {
        let built = requests
            .iter()
            .map(|(method, url)| {
                Request::builder()
                    .method(*method)
                    .uri(*url)
                    .header(http::header::USER_AGENT, concat!("volley/", env!("CARGO_PKG_VERSION")))
                    .body(String::new())
                    .map_err(|e| (method.to_string(), url.to_string(), e.to_string()))
            })
            .collect();
        self.dispatch(built)
    }

    /// Send fully built requests as one batch.
    pub fn send(&self, requests: Vec<Request<String>>) -> Vec<HttpResponse> {
        self.dispatch(requests.into_iter().map(Ok).collect())
    }

    fn dispatch(
        &self,
        requests: Vec<Result<Request<String>, (String, String, String)>>,
    ) -> Vec<HttpResponse> {
        let mut slots: Vec<Option<HttpResponse>> = Vec::with_capacity(requests.len());
        let mut outgoing = Vec::new();
        let mut labels = Vec::new();
        for req in requests {
            match req {
                Ok(req) => {
                    labels.push((req.method().to_string(), req.uri().to_string()));
                    outgoing.push(req);
                    slots.push(None);
                }
                Err((method, url, error)) => {
                    slots.push(Some(HttpResponse::failed(method, url, error)));
                }
            }
        }

        let mut answers = if outgoing.is_empty() {
            Vec::new().into_iter()
        } else {
            self.transport
                .round_trip(outgoing, self.options.request_timeout)
                .into_iter()
        };
        let mut labels = labels.into_iter();

        slots
            .into_iter()
            .map(|slot| {
                let response = match slot {
                    Some(failed) => failed,
                    None => {
                        let (method, url) = labels.next().unwrap_or_default();
                        let result = answers
                            .next()
                            .unwrap_or_else(|| Err("transport returned no response".to_string()));
                        HttpResponse::from_result(method, url, result)
                    }
                };
                self.record_http(&response);
                response
            })
            .collect()
    }

    fn record_http(&self, res: &HttpResponse) {
        let mut tags = self.tags();
        tags.insert("method".to_string(), res.method.clone());
        tags.insert("status".to_string(), res.status.to_string());
        if self.options.endpoint_tracking {
            tags.insert("url".to_string(), res.url.clone());
        }

        self.emit(builtin::HTTP_REQS, MetricKind::Counter, 1.0, tags.clone());
        if res.error.is_none() {
            self.emit(
                builtin::HTTP_REQ_DURATION,
                MetricKind::Trend,
                res.timings.duration.as_secs_f64() * 1000.0,
                tags.clone(),
            );
        }
        if res.timings.request_size > 0 {
            self.emit(
                builtin::DATA_SENT,
                MetricKind::Counter,
                res.timings.request_size as f64,
                tags.clone(),
            );
        }
        if res.timings.response_size > 0 {
            self.emit(
                builtin::DATA_RECEIVED,
                MetricKind::Counter,
                res.timings.response_size as f64,
                tags.clone(),
            );
        }
        let failed = if res.is_success() { 0.0 } else { 1.0 };
        self.emit(builtin::HTTP_REQ_FAILED, MetricKind::Rate, failed, tags);
    }

    pub fn counter(&self, name: &str, value: f64) {
        self.emit(name, MetricKind::Counter, value, self.tags());
    }

    pub fn rate(&self, name: &str, hit: bool) {
        self.emit(name, MetricKind::Rate, if hit { 1.0 } else { 0.0 }, self.tags());
    }

    pub fn trend(&self, name: &str, value: f64) {
        self.emit(name, MetricKind::Trend, value, self.tags());
    }

    pub fn gauge(&self, name: &str, value: f64) {
        self.emit(name, MetricKind::Gauge, value, self.tags());
    }

    /// Pause after this iteration. Calls add up.
    pub fn sleep(&mut self, duration: Duration) {
        self.sleep_after += duration;
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs iterations of one scenario and records the per-iteration metrics.
pub struct ScenarioRunner {
    scenario: Arc<dyn Scenario>,
    sink: Arc<MetricSink>,
    transport: Arc<dyn Transport>,
    options: VuOptions,
}

impl ScenarioRunner {
    pub fn new(
        scenario: Arc<dyn Scenario>,
        sink: Arc<MetricSink>,
        transport: Arc<dyn Transport>,
        options: VuOptions,
    ) -> Self {
        Self {
            scenario,
            sink,
            transport,
            options,
        }
    }

    pub fn sink(&self) -> &Arc<MetricSink> {
        &self.sink
    }

    /// Execute one iteration and return how long the scenario asked to sleep.
    /// Errors and panics inside the scenario are counted, never propagated.
    pub fn run_once(&self, vu: u64, iteration: u64) -> Duration {
        let mut ctx = VuContext::new(
            vu,
            iteration,
            &self.sink,
            self.transport.as_ref(),
            &self.options,
        );
        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.scenario.run(&mut ctx)));
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(format!("panic: {}", panic_message(&*payload))),
        };
        if let Some(error) = error {
            debug!(vu, iteration, error = %error, "Iteration failed");
            ctx.emit(builtin::ITERATION_ERRORS, MetricKind::Counter, 1.0, Tags::new());
        }
        ctx.emit(
            builtin::ITERATION_DURATION,
            MetricKind::Trend,
            elapsed_ms,
            Tags::new(),
        );
        ctx.emit(builtin::ITERATIONS, MetricKind::Counter, 1.0, Tags::new());
        ctx.sleep_after
    }

    /// Sleep in short slices, giving up as soon as `keep_going` turns false.
    pub fn pause(&self, duration: Duration, keep_going: impl Fn() -> bool) {
        const SLICE: Duration = Duration::from_millis(100);
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || !keep_going() {
                return;
            }
            may::coroutine::sleep((deadline - now).min(SLICE));
        }
    }

    /// Run iterations until `keep_going` returns false between them.
    pub fn run_loop(&self, vu: u64, state: &RunState, keep_going: impl Fn() -> bool) -> u64 {
        let mut iteration = 0;
        while keep_going() && !state.should_stop() {
            let pause = self.run_once(vu, iteration);
            iteration += 1;
            if !pause.is_zero() {
                self.pause(pause, || keep_going() && !state.should_stop());
            }
        }
        iteration
    }
}
