//! HTTP scenario described as data.
//!
//! A plan is a list of groups. Each group fires its requests as one parallel
//! batch, checks every response, and optionally feeds a failure-rate metric.
//! After all groups the VU sleeps a random time within `sleep`.

use std::time::Duration;

use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::engine::scenario::{Checks, Scenario, VuContext, GROUP_SEPARATOR};
use crate::engine::transport::HttpResponse;
use crate::error::ConfigError;
use crate::utils::parse_duration_str;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// Rate metric fed with `true` whenever a group's checks did not all pass
    #[serde(default, alias = "failure_metric")]
    pub failure_metric: Option<String>,
    /// Think time after each iteration, drawn uniformly from `[min, max]`
    #[serde(default)]
    pub sleep: Option<SleepRange>,
    pub groups: Vec<GroupPlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SleepRange {
    pub min: String,
    pub max: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GroupPlan {
    pub name: String,
    pub requests: Vec<RequestPlan>,
    #[serde(default)]
    pub checks: Vec<CheckRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RequestPlan {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A named assertion applied to every response of a group's batch.
/// Each rule carries exactly one assertion.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum CheckRule {
    Status(StatusCheck),
    Json(JsonFieldCheck),
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StatusCheck {
    pub name: String,
    pub status: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JsonFieldCheck {
    pub name: String,
    pub json: JsonCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct JsonCheck {
    /// Dotted path into the response body, e.g. `Type` or `items.0.id`
    pub path: String,
    pub equals: serde_json::Value,
}

impl CheckRule {
    pub fn name(&self) -> &str {
        match self {
            CheckRule::Status(rule) => &rule.name,
            CheckRule::Json(rule) => &rule.name,
        }
    }

    fn holds(&self, response: &HttpResponse) -> bool {
        match self {
            CheckRule::Status(rule) => response.status == rule.status,
            CheckRule::Json(rule) => {
                response.json(&rule.json.path).as_ref() == Some(&rule.json.equals)
            }
        }
    }
}

impl Plan {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.groups.is_empty() {
            return Err(ConfigError::InvalidPlan("at least one group is required".to_string()));
        }
        for group in &self.groups {
            if group.name.is_empty() || group.name.contains(GROUP_SEPARATOR) {
                return Err(ConfigError::InvalidPlan(format!(
                    "group name '{}' must be non-empty and must not contain '{}'",
                    group.name, GROUP_SEPARATOR
                )));
            }
            if group.requests.is_empty() {
                return Err(ConfigError::InvalidPlan(format!(
                    "group '{}' has no requests",
                    group.name
                )));
            }
            for req in &group.requests {
                http::Method::from_bytes(req.method.as_bytes()).map_err(|_| {
                    ConfigError::InvalidPlan(format!(
                        "group '{}': invalid method '{}'",
                        group.name, req.method
                    ))
                })?;
                let uri: http::Uri = req.url.parse().map_err(|e| {
                    ConfigError::InvalidPlan(format!(
                        "group '{}': invalid url '{}': {}",
                        group.name, req.url, e
                    ))
                })?;
                if uri.scheme().is_none() || uri.host().is_none() {
                    return Err(ConfigError::InvalidPlan(format!(
                        "group '{}': url '{}' must be absolute",
                        group.name, req.url
                    )));
                }
            }
        }
        if let Some(metric) = &self.failure_metric {
            if metric.is_empty() {
                return Err(ConfigError::InvalidPlan("failureMetric must not be empty".to_string()));
            }
        }
        self.sleep_bounds()?;
        Ok(())
    }

    /// Parsed `(min, max)` think time.
    pub fn sleep_bounds(&self) -> Result<Option<(Duration, Duration)>, ConfigError> {
        let Some(range) = &self.sleep else {
            return Ok(None);
        };
        let parse = |value: &str, context: &str| {
            parse_duration_str(value).ok_or_else(|| ConfigError::InvalidDuration {
                value: value.to_string(),
                context: context.to_string(),
            })
        };
        let min = parse(&range.min, "plan.sleep.min")?;
        let max = parse(&range.max, "plan.sleep.max")?;
        if min > max {
            return Err(ConfigError::InvalidPlan(format!(
                "sleep min {} is greater than max {}",
                range.min, range.max
            )));
        }
        Ok(Some((min, max)))
    }

    fn think_time(&self) -> Duration {
        match self.sleep_bounds() {
            Ok(Some((min, max))) if max > min => rand::thread_rng().gen_range(min..=max),
            Ok(Some((min, _))) => min,
            _ => Duration::ZERO,
        }
    }
}

impl Scenario for Plan {
    fn run(&self, ctx: &mut VuContext<'_>) -> anyhow::Result<()> {
        for group in &self.groups {
            ctx.group(&group.name, |ctx| {
                let pairs: Vec<(&str, &str)> = group
                    .requests
                    .iter()
                    .map(|r| (r.method.as_str(), r.url.as_str()))
                    .collect();
                let responses = ctx.batch(&pairs);

                let checks = group.checks.iter().fold(Checks::new(), |checks, rule| {
                    checks.with(rule.name(), move |batch: &[HttpResponse]| {
                        batch.iter().all(|r| rule.holds(r))
                    })
                });
                let passed = ctx.check(responses.as_slice(), checks);
                if let Some(metric) = &self.failure_metric {
                    ctx.rate(metric, !passed);
                }
                Ok(())
            })?;
        }
        let pause = self.think_time();
        if !pause.is_zero() {
            ctx.sleep(pause);
        }
        Ok(())
    }
}
