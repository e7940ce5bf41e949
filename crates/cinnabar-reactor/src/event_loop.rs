//! The cooperative event loop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::error;

/// Upper bound on internal events dispatched per tick, so that timers and
/// once-jobs stay responsive under event bursts.
const EVENT_QUOTA: usize = 128;

/// Sleep applied when a tick found no work, to avoid spinning the CPU.
const IDLE_TICK: Duration = Duration::from_millis(1);

/// Caller-side handle to a scheduled job.
///
/// The scheduler owns the job; the caller keeps this weak handle and may
/// [`invalidate`](JobHandle::invalidate) it. An invalidated job stays in its
/// queue until naturally dequeued and is a no-op when its turn comes.
#[derive(Debug, Clone, Default)]
pub struct JobHandle {
    valid: Weak<Cell<bool>>,
}

impl JobHandle {
    /// A handle connected to nothing; invalidating it does nothing.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Cancels the job. Harmless if the job already ran.
    pub fn invalidate(&self) {
        if let Some(valid) = self.valid.upgrade() {
            valid.set(false);
        }
    }

    /// Whether the job is still scheduled and uncancelled.
    pub fn is_pending(&self) -> bool {
        self.valid.upgrade().is_some_and(|valid| valid.get())
    }
}

/// A validity flag shared between the queue entry and its [`JobHandle`].
fn new_flag() -> (Rc<Cell<bool>>, JobHandle) {
    let valid = Rc::new(Cell::new(true));
    let handle = JobHandle {
        valid: Rc::downgrade(&valid),
    };
    (valid, handle)
}

struct OnceJob {
    valid: Rc<Cell<bool>>,
    func: Box<dyn FnOnce()>,
}

struct RepeatJob {
    valid: Rc<Cell<bool>>,
    func: Box<dyn FnMut()>,
}

struct TimerJob {
    valid: Rc<Cell<bool>>,
    deadline: Instant,
    func: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct Queues {
    once: VecDeque<OnceJob>,
    repeat: Vec<RepeatJob>,
    timers: Vec<TimerJob>,
    events: VecDeque<OnceJob>,
    stopped: bool,
}

/// Cloneable handle for scheduling work onto the loop.
#[derive(Clone)]
pub struct LoopHandle {
    queues: Rc<RefCell<Queues>>,
}

impl LoopHandle {
    /// Schedules `func` to run once, on the current tick's once-queue drain
    /// (or the next tick if the loop is past that phase).
    pub fn post(&self, func: impl FnOnce() + 'static) -> JobHandle {
        let (valid, handle) = new_flag();
        self.queues.borrow_mut().once.push_back(OnceJob {
            valid,
            func: Box::new(func),
        });
        handle
    }

    /// Schedules `func` to run on every tick, in registration order, until
    /// its handle is invalidated.
    pub fn post_repeating(&self, func: impl FnMut() + 'static) -> JobHandle {
        let (valid, handle) = new_flag();
        self.queues.borrow_mut().repeat.push(RepeatJob {
            valid,
            func: Box::new(func),
        });
        handle
    }

    /// Schedules `func` to run once `delay` has elapsed.
    ///
    /// Firing is checked against a monotonic clock once per tick, so the
    /// deadline may be exceeded by at most one tick.
    pub fn set_timeout(&self, delay: Duration, func: impl FnOnce() + 'static) -> JobHandle {
        let (valid, handle) = new_flag();
        self.queues.borrow_mut().timers.push(TimerJob {
            valid,
            deadline: Instant::now() + delay,
            func: Box::new(func),
        });
        handle
    }

    /// Enqueues `func` on the internal event queue, which is drained up to
    /// a bounded quota per tick.
    pub fn defer(&self, func: impl FnOnce() + 'static) -> JobHandle {
        let (valid, handle) = new_flag();
        self.queues.borrow_mut().events.push_back(OnceJob {
            valid,
            func: Box::new(func),
        });
        handle
    }

    /// Makes [`EventLoop::run`] return after the current tick completes.
    pub fn stop(&self) {
        self.queues.borrow_mut().stopped = true;
    }
}

/// The single-threaded cooperative scheduler.
///
/// Each tick drains, in order: once-jobs (to empty, including jobs posted
/// mid-drain), repeating jobs, due timers, then up to [`EVENT_QUOTA`]
/// internal events. Job failures are logged and the loop continues.
#[derive(Default)]
pub struct EventLoop {
    queues: Rc<RefCell<Queues>>,
}

/// Runs a job, shielding the loop from its panics.
fn guarded(what: &str, func: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(func)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        error!(what, reason = %reason, "job failed; loop continues");
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle for scheduling work onto this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            queues: Rc::clone(&self.queues),
        }
    }

    /// Runs ticks until [`LoopHandle::stop`] is called.
    pub fn run(&mut self) {
        loop {
            let worked = self.tick();
            if self.queues.borrow().stopped {
                return;
            }
            if !worked {
                std::thread::sleep(IDLE_TICK);
            }
        }
    }

    /// Executes one tick. Returns whether any job actually ran.
    pub fn tick(&mut self) -> bool {
        let mut worked = false;
        worked |= self.drain_once();
        worked |= self.run_repeating();
        worked |= self.fire_timers();
        worked |= self.drain_events();
        worked
    }

    fn drain_once(&mut self) -> bool {
        let mut worked = false;
        loop {
            let Some(job) = self.queues.borrow_mut().once.pop_front() else {
                return worked;
            };
            if job.valid.get() {
                worked = true;
                guarded("once-job", job.func);
            }
        }
    }

    fn run_repeating(&mut self) -> bool {
        // Take the list so jobs can register new repeat-jobs while running;
        // additions joined at the tail keep insertion order for next tick.
        let mut jobs = std::mem::take(&mut self.queues.borrow_mut().repeat);
        let mut worked = false;
        jobs.retain_mut(|job| {
            if !job.valid.get() {
                return false;
            }
            worked = true;
            guarded("repeat-job", &mut job.func);
            job.valid.get()
        });

        let mut queues = self.queues.borrow_mut();
        let added = std::mem::take(&mut queues.repeat);
        jobs.extend(added);
        queues.repeat = jobs;
        worked
    }

    fn fire_timers(&mut self) -> bool {
        let now = Instant::now();
        let due: Vec<TimerJob> = {
            let mut queues = self.queues.borrow_mut();
            let timers = std::mem::take(&mut queues.timers);
            let (due, pending): (Vec<_>, Vec<_>) =
                timers.into_iter().partition(|t| t.deadline <= now);
            queues.timers = pending;
            due
        };

        let mut worked = false;
        for timer in due {
            if timer.valid.get() {
                worked = true;
                guarded("timed-job", timer.func);
            }
        }
        worked
    }

    fn drain_events(&mut self) -> bool {
        let mut worked = false;
        for _ in 0..EVENT_QUOTA {
            let Some(job) = self.queues.borrow_mut().events.pop_front() else {
                return worked;
            };
            if job.valid.get() {
                worked = true;
                guarded("event", job.func);
            }
        }
        worked
    }
}
