//! Deferred one-shot callbacks, tagged by owner.
//!
//! A single dedicated thread owns a deadline heap. Callbacks run on that
//! thread and are expected to acquire the gate themselves; the service never
//! holds its own lock while a callback runs, so callbacks may schedule and
//! cancel freely.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rackpool_types::HostId;
use tracing::debug;

/// A deferred callback.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// The scheduling surface the host state machine depends on.
///
/// The production implementation routes expirations back into the registry
/// under the gate; tests substitute a recorder.
pub trait TimeoutScheduler: Send + Sync {
    /// Schedules the host's state timeout to fire after `after`.
    fn schedule(&self, host: &HostId, after: Duration);

    /// Cancels every pending timeout for the host. Idempotent.
    fn cancel(&self, host: &HostId);
}

struct Entry<T> {
    deadline: Instant,
    seq: u64,
    tag: T,
    callback: TimerCallback,
}

// Ordered for a min-heap on (deadline, seq); the callback takes no part.
impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<Entry<T>>,
    cancelled: HashSet<u64>,
    by_tag: HashMap<T, Vec<u64>>,
    next_seq: u64,
    shutdown: bool,
}

impl<T: Eq + Hash> State<T> {
    fn detach(&mut self, tag: &T, seq: u64) {
        if let Some(seqs) = self.by_tag.get_mut(tag) {
            seqs.retain(|&s| s != seq);
            if seqs.is_empty() {
                self.by_tag.remove(tag);
            }
        }
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// One-shot timer service with cancel-by-tag.
pub struct TimerService<T: Clone + Eq + Hash + Send + 'static> {
    shared: Arc<Shared<T>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<T: Clone + Eq + Hash + Send + 'static> TimerService<T> {
    /// Starts the timer thread.
    pub fn start() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
                by_tag: HashMap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = thread::Builder::new()
            .name("timers".to_string())
            .spawn(move || Self::run(&worker))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Schedules `callback` to run once, `after` from now, under `tag`.
    pub fn schedule_in(&self, after: Duration, tag: T, callback: TimerCallback) {
        let mut state = self.shared.state.lock().expect("timer state poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Entry {
            deadline: Instant::now() + after,
            seq,
            tag: tag.clone(),
            callback,
        });
        state.by_tag.entry(tag).or_default().push(seq);
        self.shared.cond.notify_one();
    }

    /// Cancels every pending timer scheduled under `tag`. Idempotent.
    pub fn cancel_all_by_tag(&self, tag: &T) {
        let mut state = self.shared.state.lock().expect("timer state poisoned");
        if let Some(seqs) = state.by_tag.remove(tag) {
            debug!(count = seqs.len(), "cancelling timers");
            for seq in seqs {
                state.cancelled.insert(seq);
            }
        }
    }

    /// Number of live timers currently scheduled under `tag`.
    pub fn pending_for_tag(&self, tag: &T) -> usize {
        let state = self.shared.state.lock().expect("timer state poisoned");
        state.by_tag.get(tag).map_or(0, Vec::len)
    }

    fn run(shared: &Shared<T>) {
        let mut state = shared.state.lock().expect("timer state poisoned");
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(entry) = state.heap.peek() {
                if entry.deadline > now {
                    break;
                }
                let entry = state.heap.pop().expect("peeked entry vanished");
                if state.cancelled.remove(&entry.seq) {
                    continue;
                }
                state.detach(&entry.tag, entry.seq);
                due.push(entry.callback);
            }
            if !due.is_empty() {
                // Callbacks take the gate; never run them under our lock.
                drop(state);
                for callback in due {
                    callback();
                }
                state = shared.state.lock().expect("timer state poisoned");
                continue;
            }
            state = match state.heap.peek().map(|entry| entry.deadline) {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(now);
                    shared
                        .cond
                        .wait_timeout(state, wait)
                        .expect("timer state poisoned")
                        .0
                }
                None => shared.cond.wait(state).expect("timer state poisoned"),
            };
        }
    }
}

impl<T: Clone + Eq + Hash + Send + 'static> Drop for TimerService<T> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("timer state poisoned");
            state.shutdown = true;
        }
        self.shared.cond.notify_one();
        if let Some(thread) = self.thread.take() {
            // The last handle can be dropped by a callback running on the
            // timer thread itself; joining there would deadlock.
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}
