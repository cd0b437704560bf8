//! A cooperative executor bound to one interrupter's event ring.
//!
//! Every asynchronous phase in this core — a command-ring completion, a timer, the several-step
//! enumeration state machine, a `CancelAll` drain — is represented as a plain `FnOnce` boxed
//! continuation rather than a general `Future`: the source driver's promise chains only ever
//! represent one of those three things, so there is no need for a polling abstraction here.
//! [`TrbContext::Completion::Command`](crate::rings::Completion::Command) is the seam: a command
//! ring completion invokes one such continuation, which may itself schedule more work (the next
//! step of the enumeration, or another command) before returning.
//!
//! Continuations scheduled here always run on the thread that calls
//! [`Executor::run_until_idle`] — the interrupter's IRQ thread — never re-entrantly from within
//! the event-ring dispatch loop itself; they are queued and drained afterwards, matching
//! `EventRing::handle_irq`'s `run_until_idle()` call after advancing ERDP.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

/// A scheduled unit of work: either a command-ring completion, a `CancelAll`/unbind drain step,
/// or one leg of the enumeration state machine.
type Task = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline_ns: u64,
    task: Task,
}

/// Bound to one interrupter. Owns two queues: tasks ready to run now, and tasks waiting for a
/// deadline (the enumerator's 10ms USB 2.0 reset-recovery wait, xHCI §9.2.6).
#[derive(Default)]
pub struct Executor {
    ready: Mutex<VecDeque<Task>>,
    timers: Mutex<Vec<TimerEntry>>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Queues a continuation to run on the next [`run_until_idle`](Self::run_until_idle). Safe to
    /// call from within a running task (it only appends; it does not recurse).
    pub fn schedule(&self, task: Task) {
        self.ready.lock().push_back(task);
    }

    /// Queues a continuation to run once `now_nanos() >= deadline_ns` on some future
    /// [`run_until_idle`](Self::run_until_idle) call.
    pub fn schedule_after(&self, deadline_ns: u64, task: Task) {
        self.timers.lock().push(TimerEntry { deadline_ns, task });
    }

    /// The earliest deadline of any pending timer, if any. A binding that can choose how long to
    /// block waiting for the next interrupt may use this to bound that wait so timers still fire
    /// close to on time with no other controller traffic.
    pub fn next_timer_deadline(&self) -> Option<u64> {
        self.timers.lock().iter().map(|t| t.deadline_ns).min()
    }

    /// Runs every ready continuation, and every timer continuation whose deadline has passed,
    /// until no more work is ready. A continuation that schedules more work (another command, the
    /// next enumeration step) is picked up in the same call rather than requiring the caller to
    /// loop.
    pub fn run_until_idle(&self, now_ns: u64) {
        loop {
            {
                let mut timers = self.timers.lock();
                let mut ready = self.ready.lock();
                let mut i = 0;
                while i < timers.len() {
                    if timers[i].deadline_ns <= now_ns {
                        ready.push_back(timers.remove(i).task);
                    } else {
                        i += 1;
                    }
                }
            }

            let next = self.ready.lock().pop_front();
            match next {
                Some(task) => task(),
                None => break,
            }
        }
    }
}
