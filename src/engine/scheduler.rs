use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use super::state::RunState;
use crate::error::ConfigError;
use crate::utils::format_duration;

/// One ramp segment: reach `target` VUs linearly over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub target: usize,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

fn serialize_duration<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

impl Stage {
    pub fn new(target: usize, duration: Duration) -> Self {
        Self { target, duration }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePhase {
    Pending(usize),
    Ramping {
        stage: usize,
        elapsed_in_stage: Duration,
    },
    Completed,
}

impl SchedulePhase {
    fn stage(&self) -> Option<usize> {
        match self {
            SchedulePhase::Pending(idx) => Some(*idx),
            SchedulePhase::Ramping { stage, .. } => Some(*stage),
            SchedulePhase::Completed => None,
        }
    }
}

/// Maps elapsed run time to a VU target over an ordered stage list.
/// The first stage ramps up from zero.
#[derive(Debug, Clone)]
pub struct StageScheduler {
    stages: Vec<Stage>,
}

impl StageScheduler {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptyStages);
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Concurrency the run settles at once every stage is over.
    pub fn final_target(&self) -> usize {
        self.stages.last().map(|s| s.target).unwrap_or(0)
    }

    pub fn max_target(&self) -> usize {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    pub fn phase_at(&self, elapsed: Duration) -> SchedulePhase {
        let mut offset = Duration::ZERO;
        for (idx, stage) in self.stages.iter().enumerate() {
            if elapsed < offset + stage.duration {
                return SchedulePhase::Ramping {
                    stage: idx,
                    elapsed_in_stage: elapsed - offset,
                };
            }
            offset += stage.duration;
        }
        SchedulePhase::Completed
    }

    /// Linear interpolation between the previous stage's target and the
    /// current one, rounded down. Zero-length stages jump straight to their
    /// target.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut offset = Duration::ZERO;
        let mut prev = 0usize;
        for stage in &self.stages {
            if elapsed < offset + stage.duration {
                let progress = (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
                let delta = stage.target as f64 - prev as f64;
                let value = prev as f64 + delta * progress;
                return value.max(0.0).floor() as usize;
            }
            offset += stage.duration;
            prev = stage.target;
        }
        prev
    }

    /// Publish the target for `elapsed` into the run state.
    pub fn apply(&self, elapsed: Duration, state: &RunState) -> SchedulePhase {
        let phase = self.phase_at(elapsed);
        let target = self.target_at(elapsed);
        match phase {
            SchedulePhase::Completed => {
                state.set_stage(self.stages.len().saturating_sub(1), target);
                state.mark_stages_completed();
            }
            _ => state.set_stage(phase.stage().unwrap_or(0), target),
        }
        phase
    }

    /// Tick on a background thread until every stage is over or the run stops.
    pub fn spawn(
        self: &Arc<Self>,
        state: Arc<RunState>,
        tick: Duration,
    ) -> std::io::Result<JoinHandle<()>> {
        let scheduler = Arc::clone(self);
        let tick = tick.max(Duration::from_millis(1));
        thread::Builder::new()
            .name("stage-scheduler".to_string())
            .spawn(move || {
                let mut phase = SchedulePhase::Pending(0);
                loop {
                    if state.should_stop() {
                        debug!("Stage scheduler stopped early");
                        break;
                    }
                    let next = scheduler.apply(state.elapsed(), &state);
                    if next.stage() != phase.stage() {
                        match next {
                            SchedulePhase::Ramping { stage, .. } => {
                                let s = scheduler.stages[stage];
                                info!(
                                    stage,
                                    target = s.target,
                                    duration = %format_duration(s.duration),
                                    "Entering stage"
                                );
                            }
                            SchedulePhase::Completed => {
                                info!(
                                    final_target = scheduler.final_target(),
                                    "All stages completed"
                                );
                            }
                            SchedulePhase::Pending(_) => {}
                        }
                    }
                    phase = next;
                    if phase == SchedulePhase::Completed {
                        break;
                    }
                    thread::sleep(tick);
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn observed_stages() -> StageScheduler {
        StageScheduler::new(vec![
            Stage::new(200, secs(180)),
            Stage::new(150, secs(510)),
            Stage::new(30, secs(60)),
            Stage::new(0, secs(30)),
        ])
        .unwrap()
    }

    #[test]
    fn test_empty_stages_rejected() {
        assert!(matches!(
            StageScheduler::new(Vec::new()),
            Err(ConfigError::EmptyStages)
        ));
    }

    #[test]
    fn test_linear_ramp() {
        let s = StageScheduler::new(vec![Stage::new(10, secs(10))]).unwrap();
        assert_eq!(s.target_at(Duration::ZERO), 0);
        assert_eq!(s.target_at(secs(5)), 5);
        assert_eq!(s.target_at(Duration::from_millis(9_999)), 9);
        assert_eq!(s.target_at(secs(10)), 10);
        assert_eq!(s.phase_at(secs(10)), SchedulePhase::Completed);
    }

    #[test]
    fn test_ramp_between_stages() {
        let s = observed_stages();
        assert_eq!(s.total_duration(), secs(780));
        assert_eq!(s.target_at(secs(90)), 100);
        assert_eq!(s.target_at(secs(180)), 200);
        // halfway through 200 -> 150
        assert_eq!(s.target_at(secs(180 + 255)), 175);
        assert_eq!(s.target_at(secs(780)), 0);
        assert_eq!(
            s.phase_at(secs(200)),
            SchedulePhase::Ramping {
                stage: 1,
                elapsed_in_stage: secs(20)
            }
        );
    }

    #[test]
    fn test_target_stays_within_bounds_and_rounding() {
        let s = observed_stages();
        let max = s.max_target();
        let mut t = Duration::ZERO;
        while t <= s.total_duration() + secs(1) {
            let target = s.target_at(t);
            assert!(target <= max, "target {} above max at {:?}", target, t);

            // Exact interpolated value, recomputed independently.
            let mut offset = 0.0;
            let mut prev = 0.0;
            let mut exact = 0.0;
            let now = t.as_secs_f64();
            for stage in s.stages() {
                let d = stage.duration.as_secs_f64();
                if now < offset + d {
                    exact = prev + (stage.target as f64 - prev) * ((now - offset) / d);
                    break;
                }
                offset += d;
                prev = stage.target as f64;
                exact = prev;
            }
            assert!((target as f64 - exact).abs() < 1.0, "at {:?}: {} vs {}", t, target, exact);
            t += Duration::from_millis(700);
        }
    }

    #[test]
    fn test_zero_duration_stage_jumps() {
        let s = StageScheduler::new(vec![
            Stage::new(5, Duration::ZERO),
            Stage::new(5, secs(10)),
            Stage::new(0, Duration::ZERO),
        ])
        .unwrap();
        assert_eq!(s.target_at(Duration::ZERO), 5);
        assert_eq!(s.target_at(secs(3)), 5);
        assert_eq!(s.target_at(secs(10)), 0);
        assert_eq!(s.final_target(), 0);
    }

    #[test]
    fn test_apply_marks_completion() {
        let s = StageScheduler::new(vec![Stage::new(4, secs(2))]).unwrap();
        let state = RunState::new();
        assert!(matches!(s.apply(secs(1), &state), SchedulePhase::Ramping { stage: 0, .. }));
        assert_eq!(state.target(), 2);
        assert!(!state.stages_completed());
        assert_eq!(s.apply(secs(3), &state), SchedulePhase::Completed);
        assert_eq!(state.target(), 4);
        assert!(state.stages_completed());
    }
}
