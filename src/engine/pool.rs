use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::scenario::ScenarioRunner;
use super::state::RunState;

static SCHEDULER_INIT: Once = Once::new();

/// Size the coroutine scheduler once per process.
pub fn configure_scheduler(stack_size: usize) {
    SCHEDULER_INIT.call_once(|| {
        may::config()
            .set_workers(num_cpus::get())
            .set_stack_size(stack_size);
    });
}

/// Stop signal held by one worker. The worker's slot generation moves on
/// when the pool shrinks past it, which kills every token issued before.
#[derive(Clone)]
pub struct StopToken {
    slot_generation: Arc<AtomicU64>,
    issued: u64,
}

impl StopToken {
    pub fn is_live(&self) -> bool {
        self.slot_generation.load(Ordering::Acquire) == self.issued
    }
}

/// Decrements the active count however the coroutine exits.
struct ActiveGuard {
    state: Arc<RunState>,
    done: Arc<AtomicBool>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.state.vu_finished();
        self.done.store(true, Ordering::Release);
    }
}

struct Worker {
    vu: u64,
    slot: usize,
    done: Arc<AtomicBool>,
    handle: may::coroutine::JoinHandle<()>,
}

/// Resizable set of VU coroutines.
///
/// Workers occupy slots `0..live.len()`. Shrinking revokes the highest slots
/// first; a revoked worker finishes its current iteration and exits, and the
/// slot can be handed to a new worker straight away under a new generation.
pub struct VuPool {
    runner: Arc<ScenarioRunner>,
    state: Arc<RunState>,
    stack_size: usize,
    slots: Vec<Arc<AtomicU64>>,
    live: Vec<Worker>,
    draining: Vec<Worker>,
    next_vu: u64,
}

impl VuPool {
    pub fn new(runner: Arc<ScenarioRunner>, state: Arc<RunState>, stack_size: usize) -> Self {
        configure_scheduler(stack_size);
        Self {
            runner,
            state,
            stack_size,
            slots: Vec::new(),
            live: Vec::new(),
            draining: Vec::new(),
            next_vu: 1,
        }
    }

    /// Workers that have not been told to stop.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Revoked workers still finishing an iteration.
    pub fn draining(&self) -> usize {
        self.draining.len()
    }

    /// Grow or shrink to `target` live workers.
    pub fn scale_to(&mut self, target: usize) -> std::io::Result<()> {
        self.reap();
        let current = self.live.len();
        if target > current {
            for _ in current..target {
                self.spawn()?;
            }
            debug!(from = current, to = target, "Scaled VU pool up");
        } else if target < current {
            for _ in target..current {
                self.revoke_last();
            }
            debug!(from = current, to = target, "Scaled VU pool down");
        }
        Ok(())
    }

    /// Tell every worker to stop after its current iteration.
    pub fn revoke_all(&mut self) {
        while !self.live.is_empty() {
            self.revoke_last();
        }
    }

    /// Wait up to `grace` for revoked workers to finish. Returns how many are
    /// still running when it gives up.
    pub fn wait_drained(&mut self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        loop {
            self.reap();
            if self.draining.is_empty() {
                return 0;
            }
            if Instant::now() >= deadline {
                let left = self.draining.len();
                info!(remaining = left, "Graceful stop period elapsed with VUs still running");
                return left;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn spawn(&mut self) -> std::io::Result<()> {
        let slot = self.live.len();
        if slot == self.slots.len() {
            self.slots.push(Arc::new(AtomicU64::new(0)));
        }
        let generation = self.slots[slot].clone();
        let token = StopToken {
            issued: generation.load(Ordering::Acquire),
            slot_generation: generation,
        };

        let vu = self.next_vu;
        self.next_vu += 1;
        let done = Arc::new(AtomicBool::new(false));
        self.state.vu_started();
        let guard = ActiveGuard {
            state: self.state.clone(),
            done: done.clone(),
        };
        let runner = self.runner.clone();
        let state = self.state.clone();

        // SAFETY: the stack size is configured for the scenario runner's call depth.
        let spawned = unsafe {
            may::coroutine::Builder::new()
                .name(format!("vu-{}", vu))
                .stack_size(self.stack_size)
                .spawn(move || {
                    let _guard = guard;
                    let iterations = runner.run_loop(vu, &state, || token.is_live());
                    debug!(vu, iterations, "VU stopped");
                })
        };
        // On failure the closure, and with it the guard, has already been dropped.
        let handle = spawned?;
        self.live.push(Worker {
            vu,
            slot,
            done,
            handle,
        });
        Ok(())
    }

    fn revoke_last(&mut self) {
        if let Some(worker) = self.live.pop() {
            self.slots[worker.slot].fetch_add(1, Ordering::AcqRel);
            debug!(vu = worker.vu, slot = worker.slot, "Revoked VU");
            self.draining.push(worker);
        }
    }

    fn reap(&mut self) {
        let (finished, running): (Vec<Worker>, Vec<Worker>) = self
            .draining
            .drain(..)
            .partition(|w| w.done.load(Ordering::Acquire));
        self.draining = running;
        for worker in finished {
            let _ = worker.handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::scenario::tests::FakeTransport;
    use crate::engine::scenario::{Checks, VuContext, VuOptions};
    use crate::engine::transport::HttpResponse;
    use crate::stats::{MetricSink, Selector, SeriesStats};

    fn pool(delay: Duration) -> (VuPool, Arc<RunState>, Arc<MetricSink>) {
        let sink = Arc::new(MetricSink::new());
        let state = Arc::new(RunState::new());
        let mut transport = FakeTransport::new(200, "{}");
        transport.delay = delay;
        let runner = Arc::new(ScenarioRunner::new(
            Arc::new(|ctx: &mut VuContext<'_>| {
                let res = ctx.get("http://svc/metadata");
                ctx.check(
                    &res,
                    Checks::new().with("status is 200", |r: &HttpResponse| r.status == 200),
                );
                Ok(())
            }),
            sink.clone(),
            Arc::new(transport),
            VuOptions::default(),
        ));
        (VuPool::new(runner, state.clone(), 256 * 1024), state, sink)
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn test_stop_token_generation() {
        let generation = Arc::new(AtomicU64::new(3));
        let token = StopToken {
            slot_generation: generation.clone(),
            issued: 3,
        };
        assert!(token.is_live());
        generation.fetch_add(1, Ordering::AcqRel);
        assert!(!token.is_live());
        let reissued = StopToken {
            slot_generation: generation.clone(),
            issued: generation.load(Ordering::Acquire),
        };
        assert!(reissued.is_live());
        assert!(!token.is_live());
    }

    #[test]
    fn test_scale_up_and_down() {
        let (mut pool, state, _sink) = pool(Duration::from_millis(5));
        pool.scale_to(10).unwrap();
        assert_eq!(pool.len(), 10);
        assert!(wait_for(|| state.active_vus() == 10));

        pool.scale_to(4).unwrap();
        assert_eq!(pool.len(), 4);
        assert!(wait_for(|| state.active_vus() == 4));

        pool.scale_to(6).unwrap();
        assert_eq!(pool.len(), 6);
        pool.revoke_all();
        assert_eq!(pool.wait_drained(Duration::from_secs(5)), 0);
        assert_eq!(state.active_vus(), 0);
    }

    #[test]
    fn test_shrink_to_zero_never_truncates_an_iteration() {
        let (mut pool, state, sink) = pool(Duration::from_millis(20));
        pool.scale_to(50).unwrap();
        std::thread::sleep(Duration::from_millis(200));
        pool.scale_to(0).unwrap();
        assert_eq!(pool.wait_drained(Duration::from_secs(5)), 0);
        assert_eq!(state.active_vus(), 0);

        let checks = match sink.snapshot(&Selector::metric("checks")).unwrap().stats {
            SeriesStats::Rate(r) => r.total,
            other => panic!("unexpected stats {:?}", other),
        };
        let iterations = match sink
            .snapshot(&Selector::metric("iteration_duration"))
            .unwrap()
            .stats
        {
            SeriesStats::Trend(t) => t.count,
            other => panic!("unexpected stats {:?}", other),
        };
        assert!(iterations >= 50);
        assert_eq!(checks, iterations);
    }

    #[test]
    fn test_workers_stop_on_abort() {
        let (mut pool, state, _sink) = pool(Duration::from_millis(5));
        pool.scale_to(8).unwrap();
        assert!(wait_for(|| state.active_vus() == 8));
        state.abort("test".to_string());
        assert!(wait_for(|| state.active_vus() == 0));
    }
}
