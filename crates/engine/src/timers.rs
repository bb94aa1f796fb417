// SPDX-License-Identifier: Apache-2.0

//! The timer wheel.
//!
//! One dedicated thread multiplexes every scheduled task: request expiries,
//! the pulse monitor, the garbage collector. Expiration never mutates engine
//! state directly; callbacks are expected to enqueue a message and return
//! quickly. Cancel and restart are safe against a timer already being fired:
//! once the wheel has committed to running a callback, cancel reports that by
//! returning false.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Identifier of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Work run on expiry, on the wheel thread. Keep it cheap.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct Entry {
    deadline: Instant,
    period: Option<Duration>,
    callback: TimerCallback,
}

#[derive(Default)]
struct WheelState {
    entries: HashMap<u64, Entry>,
    /// May hold stale deadlines for cancelled or restarted timers; the
    /// entries map is authoritative.
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    next_id: u64,
    shutdown: bool,
}

struct Inner {
    state: Mutex<WheelState>,
    changed: Condvar,
}

/// Handle to the wheel. Cloneable and shareable across threads.
#[derive(Clone)]
pub struct TimerWheel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("timers", &self.inner.state.lock().entries.len())
            .finish_non_exhaustive()
    }
}

impl TimerWheel {
    /// Starts the wheel thread and returns the shared handle plus the join
    /// handle the owner keeps for shutdown.
    #[must_use]
    pub fn spawn() -> (Self, thread::JoinHandle<()>) {
        let inner = Arc::new(Inner {
            state: Mutex::new(WheelState::default()),
            changed: Condvar::new(),
        });
        let wheel = Self {
            inner: inner.clone(),
        };
        let join = thread::Builder::new()
            .name("restune-timer".to_owned())
            .spawn(move || run_wheel(&inner))
            .expect("failed to spawn timer thread");
        (wheel, join)
    }

    /// Schedules a one-shot timer.
    pub fn arm_oneshot(&self, after: Duration, callback: TimerCallback) -> TimerId {
        self.arm(after, None, callback)
    }

    /// Schedules a periodic timer with the period as its first delay.
    pub fn arm_periodic(&self, period: Duration, callback: TimerCallback) -> TimerId {
        self.arm(period, Some(period), callback)
    }

    fn arm(&self, after: Duration, period: Option<Duration>, callback: TimerCallback) -> TimerId {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let deadline = Instant::now() + after;
        let _ = state.entries.insert(
            id,
            Entry {
                deadline,
                period,
                callback,
            },
        );
        state.heap.push(Reverse((deadline, id)));
        drop(state);
        let _ = self.inner.changed.notify_one();
        TimerId(id)
    }

    /// Cancels a timer. Returns false when it already fired (a one-shot) or
    /// was never armed; a queued untune from a fired timer is then handled
    /// by the dispatcher's status checks, not here.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.inner.state.lock();
        state.entries.remove(&id.0).is_some()
    }

    /// Atomically rearms a timer with a new delay. Returns false when the
    /// timer is no longer live.
    pub fn restart(&self, id: TimerId, after: Duration) -> bool {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.entries.get_mut(&id.0) else {
            return false;
        };
        let deadline = Instant::now() + after;
        entry.deadline = deadline;
        state.heap.push(Reverse((deadline, id.0)));
        drop(state);
        let _ = self.inner.changed.notify_one();
        true
    }

    /// Number of live timers.
    #[must_use]
    pub fn live_timers(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Stops the wheel thread. Pending timers are dropped unfired.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        drop(state);
        let _ = self.inner.changed.notify_one();
    }
}

fn run_wheel(inner: &Inner) {
    let mut state = inner.state.lock();
    loop {
        if state.shutdown {
            debug!("timer wheel stopping");
            return;
        }

        // Drop stale heap tops: cancelled timers and superseded deadlines.
        while let Some(&Reverse((deadline, id))) = state.heap.peek() {
            let live = state
                .entries
                .get(&id)
                .is_some_and(|entry| entry.deadline == deadline);
            if live {
                break;
            }
            let _ = state.heap.pop();
        }

        let now = Instant::now();
        let mut due: Vec<TimerCallback> = Vec::new();
        while let Some(&Reverse((deadline, id))) = state.heap.peek() {
            if deadline > now {
                break;
            }
            let _ = state.heap.pop();
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if entry.deadline != deadline {
                continue;
            }
            match entry.period {
                Some(period) => {
                    entry.deadline = now + period;
                    due.push(entry.callback.clone());
                    let next = entry.deadline;
                    state.heap.push(Reverse((next, id)));
                }
                None => {
                    // Committed: from here on cancel() reports the miss.
                    if let Some(entry) = state.entries.remove(&id) {
                        due.push(entry.callback);
                    }
                }
            }
        }

        if !due.is_empty() {
            drop(state);
            for callback in due {
                callback();
            }
            state = inner.state.lock();
            continue;
        }

        match state.heap.peek() {
            Some(&Reverse((deadline, _))) => {
                let timeout = deadline.saturating_duration_since(now);
                let _ = inner.changed.wait_for(&mut state, timeout);
            }
            None => inner.changed.wait(&mut state),
        }
    }
}
