pub mod control;
pub mod http_client;
pub mod io_bridge;
pub mod pool;
pub mod scenario;
pub mod scheduler;
pub mod state;
pub mod transport;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::ConfigError;
use crate::stats::report::{Outcome, RunReport};
use crate::stats::{builtin, MetricKind, MetricSample, MetricSink, Tags};
use crate::threshold::{ThresholdEvaluator, ThresholdSpec};
use crate::utils::format_duration;

pub use control::{ControlCommand, EngineHandle};
pub use pool::VuPool;
pub use scenario::{Checks, Scenario, ScenarioRunner, VuContext, VuOptions};
pub use scheduler::{Stage, StageScheduler};
pub use state::{RunState, RunStatus};
pub use transport::{HttpResponse, Transport};

pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_THRESHOLD_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub stages: Vec<Stage>,
    pub thresholds: Vec<ThresholdSpec>,
    /// Stop the run after this long regardless of stages.
    pub timeout: Option<Duration>,
    /// How long in-flight iterations get to finish at shutdown.
    pub graceful_stop: Duration,
    pub stack_size: usize,
    pub tick_interval: Duration,
    pub threshold_interval: Duration,
    pub vu: VuOptions,
}

impl EngineOptions {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            thresholds: Vec::new(),
            timeout: None,
            graceful_stop: DEFAULT_GRACEFUL_STOP,
            stack_size: DEFAULT_STACK_SIZE,
            tick_interval: DEFAULT_TICK_INTERVAL,
            threshold_interval: DEFAULT_THRESHOLD_INTERVAL,
            vu: VuOptions::default(),
        }
    }
}

/// Owns one run: scheduler, pool, evaluator and sink.
pub struct Engine {
    scheduler: Arc<StageScheduler>,
    evaluator: Arc<ThresholdEvaluator>,
    sink: Arc<MetricSink>,
    state: Arc<RunState>,
    runner: Arc<ScenarioRunner>,
    timeout: Option<Duration>,
    graceful_stop: Duration,
    stack_size: usize,
    tick_interval: Duration,
    threshold_interval: Duration,
}

fn require_positive(value: Duration, context: &str) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        Err(ConfigError::InvalidDuration {
            value: format_duration(value),
            context: context.to_string(),
        })
    } else {
        Ok(value)
    }
}

impl Engine {
    /// Validate the configuration. Nothing runs until [`Engine::run`].
    pub fn new(
        options: EngineOptions,
        scenario: Arc<dyn Scenario>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        let scheduler = StageScheduler::new(options.stages)?;
        let tick_interval = require_positive(options.tick_interval, "tickInterval")?;
        let threshold_interval = require_positive(options.threshold_interval, "thresholdInterval")?;
        if let Some(timeout) = options.timeout {
            require_positive(timeout, "timeout")?;
        }

        let sink = Arc::new(MetricSink::new());
        let runner = Arc::new(ScenarioRunner::new(
            scenario,
            sink.clone(),
            transport,
            options.vu,
        ));

        Ok(Self {
            scheduler: Arc::new(scheduler),
            evaluator: Arc::new(ThresholdEvaluator::new(options.thresholds)),
            sink,
            state: Arc::new(RunState::new()),
            runner,
            timeout: options.timeout,
            graceful_stop: options.graceful_stop,
            stack_size: options.stack_size,
            tick_interval,
            threshold_interval,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle::new(self.state.clone())
    }

    pub fn sink(&self) -> &Arc<MetricSink> {
        &self.sink
    }

    fn record_vus(&self) {
        let sample = MetricSample::new(
            builtin::VUS,
            MetricKind::Gauge,
            self.state.active_vus() as f64,
            Tags::new(),
        );
        if let Err(e) = self.sink.record(sample) {
            warn!(error = %e, "Dropped vus sample");
        }
    }

    /// Drive the run to one of its exit conditions and produce the report.
    pub fn run(self) -> std::io::Result<RunReport> {
        let state = &self.state;
        state.start();
        info!(
            stages = self.scheduler.stages().len(),
            duration = %format_duration(self.scheduler.total_duration()),
            max_vus = self.scheduler.max_target(),
            thresholds = self.evaluator.specs().len(),
            "Starting run"
        );

        let scheduler_thread = self.scheduler.spawn(state.clone(), self.tick_interval)?;
        let evaluator_thread =
            self.evaluator
                .spawn(self.sink.clone(), state.clone(), self.threshold_interval)?;
        let mut pool = VuPool::new(self.runner.clone(), state.clone(), self.stack_size);
        let final_target = self.scheduler.final_target();

        let mut outcome = 'main_loop: loop {
            if state.is_aborted() {
                break 'main_loop Outcome::Aborted;
            }
            if state.is_cancelled() {
                break 'main_loop Outcome::Cancelled;
            }
            if self.timeout.is_some_and(|limit| state.elapsed() >= limit) {
                state.mark_timed_out();
                info!("Run timeout reached");
                break 'main_loop Outcome::TimedOut;
            }

            if let Err(e) = pool.scale_to(state.target()) {
                error!(error = %e, target = state.target(), "Failed to spawn VU");
            }
            self.record_vus();

            if state.stages_completed() && pool.len() == final_target {
                break 'main_loop Outcome::Completed;
            }
            thread::sleep(self.tick_interval);
        };

        // Shutdown: no new iterations, finish in-flight ones.
        state.begin_drain();
        pool.revoke_all();
        let remaining = pool.wait_drained(self.graceful_stop);
        if remaining > 0 {
            warn!(
                remaining,
                graceful_stop = %format_duration(self.graceful_stop),
                "Some VUs did not finish in time"
            );
        }
        self.record_vus();

        if scheduler_thread.join().is_err() {
            error!("Stage scheduler thread panicked");
        }
        if evaluator_thread.join().is_err() {
            error!("Threshold evaluator thread panicked");
        }
        // An abort that landed while the loop was exiting still wins.
        if outcome == Outcome::Completed && state.is_aborted() {
            outcome = Outcome::Aborted;
        }

        let duration = state.elapsed();
        let results = self.evaluator.evaluate(&self.sink, duration);
        for failed in results.iter().filter(|r| r.failed()) {
            warn!(metric = %failed.metric, threshold = %failed.expression, "Threshold failed");
        }
        state.finish();

        let abort_reason = match outcome {
            Outcome::Aborted => state.abort_reason().map(str::to_string),
            _ => None,
        };
        info!(outcome = %outcome, duration = %format_duration(duration), "Run finished");
        Ok(RunReport::build(
            outcome,
            abort_reason,
            duration,
            &self.sink,
            results,
        ))
    }
}
