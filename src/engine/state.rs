use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Process-wide state of one run.
///
/// Every field has exactly one writer:
/// - stage index, target, stages-completed: the stage scheduler
/// - active VU count: the VU pool
/// - abort flag and reason: the threshold evaluator
/// - cancel flag: the operator handle
/// - start time, timeout, draining and finished flags: the engine controller
///
/// Everyone else only reads.
pub struct RunState {
    started: OnceLock<Instant>,

    stage_index: AtomicUsize,
    target: AtomicUsize,
    stages_completed: AtomicBool,

    active_vus: AtomicUsize,

    aborted: AtomicBool,
    abort_reason: OnceLock<String>,

    cancelled: AtomicBool,

    timed_out: AtomicBool,
    draining: AtomicBool,
    finished: AtomicBool,
}

/// Point-in-time copy of [`RunState`] for status output.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub elapsed_secs: f64,
    pub stage: usize,
    pub target_vus: usize,
    pub active_vus: usize,
    pub stages_completed: bool,
    pub aborted: bool,
    pub cancelled: bool,
    pub draining: bool,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            started: OnceLock::new(),
            stage_index: AtomicUsize::new(0),
            target: AtomicUsize::new(0),
            stages_completed: AtomicBool::new(false),
            active_vus: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            abort_reason: OnceLock::new(),
            cancelled: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    /// Start the run clock. Later calls are ignored.
    pub(crate) fn start(&self) {
        let _ = self.started.set(Instant::now());
    }

    /// Time since the run started; zero before that.
    pub fn elapsed(&self) -> Duration {
        self.started
            .get()
            .map(Instant::elapsed)
            .unwrap_or(Duration::ZERO)
    }

    // -- scheduler --

    pub(crate) fn set_stage(&self, index: usize, target: usize) {
        self.stage_index.store(index, Ordering::SeqCst);
        self.target.store(target, Ordering::SeqCst);
    }

    pub(crate) fn mark_stages_completed(&self) {
        self.stages_completed.store(true, Ordering::SeqCst);
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    pub fn stages_completed(&self) -> bool {
        self.stages_completed.load(Ordering::SeqCst)
    }

    // -- pool --

    pub(crate) fn vu_started(&self) {
        self.active_vus.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn vu_finished(&self) {
        self.active_vus.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_vus(&self) -> usize {
        self.active_vus.load(Ordering::SeqCst)
    }

    // -- evaluator --

    /// Returns `true` only for the call that actually aborted the run.
    pub(crate) fn abort(&self, reason: String) -> bool {
        if self.abort_reason.set(reason).is_ok() {
            self.aborted.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.get().map(String::as_str)
    }

    // -- operator --

    /// Returns `true` if this call flipped the flag.
    pub(crate) fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    // -- controller --

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Workers and background tasks stop starting new work once this is true.
    pub fn should_stop(&self) -> bool {
        self.is_aborted() || self.is_cancelled() || self.is_timed_out() || self.is_draining()
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            elapsed_secs: self.elapsed().as_secs_f64(),
            stage: self.stage_index(),
            target_vus: self.target(),
            active_vus: self.active_vus(),
            stages_completed: self.stages_completed(),
            aborted: self.is_aborted(),
            cancelled: self.is_cancelled(),
            draining: self.is_draining(),
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_abort_is_idempotent() {
        let state = RunState::new();
        assert!(!state.should_stop());
        assert!(state.abort("first".to_string()));
        assert!(!state.abort("second".to_string()));
        assert!(state.is_aborted());
        assert_eq!(state.abort_reason(), Some("first"));
        assert!(state.should_stop());
    }

    #[test]
    fn test_concurrent_abort_has_one_winner() {
        let state = Arc::new(RunState::new());
        let winners: usize = (0..8)
            .map(|i| {
                let state = state.clone();
                thread::spawn(move || state.abort(format!("reason {}", i)))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
        assert!(state.abort_reason().is_some());
    }

    #[test]
    fn test_cancel_reports_first_call() {
        let state = RunState::new();
        assert!(state.cancel());
        assert!(!state.cancel());
        assert!(state.is_cancelled());
        assert!(state.abort_reason().is_none());
    }

    #[test]
    fn test_status_reflects_writers() {
        let state = RunState::new();
        state.set_stage(2, 30);
        state.vu_started();
        state.vu_started();
        state.vu_finished();
        let status = state.status();
        assert_eq!(status.stage, 2);
        assert_eq!(status.target_vus, 30);
        assert_eq!(status.active_vus, 1);
        assert!(!status.stages_completed);
    }
}
