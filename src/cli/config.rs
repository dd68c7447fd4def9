use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::plan::Plan;
use crate::engine::{EngineOptions, Stage, VuOptions};
use crate::error::ConfigError;
use crate::threshold::ThresholdSpec;
use crate::utils::parse_duration_str;

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct StageConfig {
    /// Ramp length, e.g. "3m", "8m30s"
    pub duration: String,
    /// VU count reached at the end of the stage
    pub target: usize,
}

/// One threshold: a bare expression, or an expression with abort settings.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(untagged)]
pub enum ThresholdEntry {
    Expr(String),
    Detailed {
        threshold: String,
        /// Abort the whole run as soon as this threshold fails
        #[serde(default, alias = "abortOnFail")]
        abort_on_fail: bool,
        /// Earliest run time at which a failure may abort, e.g. "10s"
        #[serde(default, alias = "delayAbortEval")]
        delay_abort_eval: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct Config {
    /// Ramping schedule (k6: stages)
    #[serde(alias = "schedule")]
    pub stages: Option<Vec<StageConfig>>,
    /// Pass/fail criteria keyed by metric selector, e.g. `http_req_duration{group:::Metadata}`
    #[serde(alias = "criteria")]
    pub thresholds: Option<BTreeMap<String, Vec<ThresholdEntry>>>,
    /// Stop the run after this long even if stages remain
    pub timeout: Option<String>,
    /// How long in-flight iterations get to finish at shutdown (default: 30s)
    #[serde(alias = "gracefulStop", alias = "stop")]
    pub graceful_stop: Option<String>,
    /// VU coroutine stack size in bytes (default: 256KB)
    #[serde(alias = "stackSize")]
    pub stack_size: Option<usize>,
    /// Disable per-endpoint (per-URL) tagging of HTTP metrics.
    /// Endpoint tracking is ON by default.
    #[serde(alias = "noEndpointTracking")]
    pub no_endpoint_tracking: Option<bool>,
    /// Per-request timeout (default: 60s)
    #[serde(alias = "requestTimeout")]
    pub request_timeout: Option<String>,
    /// Stage scheduler and controller tick (default: 100ms)
    #[serde(alias = "tickInterval")]
    pub tick_interval: Option<String>,
    /// Threshold evaluation period (default: 1s)
    #[serde(alias = "thresholdInterval")]
    pub threshold_interval: Option<String>,
    /// Declarative HTTP scenario run by `volley run`
    pub plan: Option<Plan>,
}

fn duration_field(value: &str, context: &str) -> Result<Duration, ConfigError> {
    parse_duration_str(value).ok_or_else(|| ConfigError::InvalidDuration {
        value: value.to_string(),
        context: context.to_string(),
    })
}

impl Config {
    /// Read a YAML (`.yaml`/`.yml`) or JSON (`.json`) file. Unknown
    /// extensions are tried as YAML, which also accepts JSON.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parsed: Result<Config, String> = if ext.eq_ignore_ascii_case("json") {
            serde_json::from_str(&content).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&content).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| ConfigError::Parse {
            path: display,
            reason,
        })
    }

    pub fn stages(&self) -> Result<Vec<Stage>, ConfigError> {
        let steps = self.stages.as_deref().unwrap_or_default();
        if steps.is_empty() {
            return Err(ConfigError::EmptyStages);
        }
        steps
            .iter()
            .enumerate()
            .map(|(idx, step)| {
                let duration = duration_field(&step.duration, &format!("stage {}", idx + 1))?;
                Ok(Stage::new(step.target, duration))
            })
            .collect()
    }

    pub fn threshold_specs(&self) -> Result<Vec<ThresholdSpec>, ConfigError> {
        let mut specs = Vec::new();
        let Some(thresholds) = &self.thresholds else {
            return Ok(specs);
        };
        for (metric, entries) in thresholds {
            for entry in entries {
                let spec = match entry {
                    ThresholdEntry::Expr(expr) => ThresholdSpec::parse(metric, expr)?,
                    ThresholdEntry::Detailed {
                        threshold,
                        abort_on_fail,
                        delay_abort_eval,
                    } => {
                        let mut spec =
                            ThresholdSpec::parse(metric, threshold)?.fatal(*abort_on_fail);
                        if let Some(delay) = delay_abort_eval {
                            let context = format!("delayAbortEval of '{}'", metric);
                            spec = spec.delay_abort_eval(duration_field(delay, &context)?);
                        }
                        spec
                    }
                };
                specs.push(spec);
            }
        }
        Ok(specs)
    }

    /// Everything the engine needs, validated. The plan is not included.
    pub fn engine_options(&self) -> Result<EngineOptions, ConfigError> {
        let mut options = EngineOptions::new(self.stages()?);
        options.thresholds = self.threshold_specs()?;
        if let Some(t) = &self.timeout {
            options.timeout = Some(duration_field(t, "timeout")?);
        }
        if let Some(g) = &self.graceful_stop {
            options.graceful_stop = duration_field(g, "gracefulStop")?;
        }
        if let Some(size) = self.stack_size {
            options.stack_size = size;
        }
        if let Some(t) = &self.tick_interval {
            options.tick_interval = duration_field(t, "tickInterval")?;
        }
        if let Some(t) = &self.threshold_interval {
            options.threshold_interval = duration_field(t, "thresholdInterval")?;
        }
        let mut vu = VuOptions::default();
        if let Some(no_tracking) = self.no_endpoint_tracking {
            vu.endpoint_tracking = !no_tracking;
        }
        if let Some(t) = &self.request_timeout {
            vu.request_timeout = Some(duration_field(t, "requestTimeout")?);
        }
        options.vu = vu;
        Ok(options)
    }

    /// The plan, validated. Required by `volley run`.
    pub fn plan(&self) -> Result<&Plan, ConfigError> {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| {
                ConfigError::InvalidPlan("no 'plan' section in configuration".to_string())
            })?;
        plan.validate()?;
        Ok(plan)
    }
}
