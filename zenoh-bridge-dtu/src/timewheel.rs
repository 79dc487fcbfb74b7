//! Hashed time wheel for periodic tasks.
//!
//! A ring of `slots` buckets advanced once per `tick`. A task with an interval
//! of `n` ticks is placed `n` slots ahead of the cursor; intervals longer than
//! one revolution carry a round counter that is decremented each time the
//! cursor passes the task's slot.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

/// Default tick length.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Default number of slots.
pub const DEFAULT_SLOTS: usize = 180;

/// Callback invoked with a clone of the task's payload when it fires.
pub type TaskCallback<P> = Arc<dyn Fn(P) + Send + Sync>;

/// Scheduler errors. Keys are rendered with their `Debug` form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("Task already scheduled: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid repetition count {0}: use -1 for infinite or a positive count")]
    InvalidRepetitions(i64),
}

/// How many times a task fires before it is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repetition {
    Infinite,
    Times(u32),
}

impl Repetition {
    /// Map the `-1 = infinite, n > 0 = n times` convention.
    pub fn from_count(count: i64) -> Result<Self, SchedulerError> {
        match count {
            -1 => Ok(Repetition::Infinite),
            n if n > 0 => Ok(Repetition::Times(u32::try_from(n).unwrap_or(u32::MAX))),
            n => Err(SchedulerError::InvalidRepetitions(n)),
        }
    }
}

struct Entry<P> {
    /// Distinguishes this scheduling from a later one under the same key.
    id: u64,
    interval_ticks: usize,
    remaining: Repetition,
    rounds: usize,
    slot: usize,
    payload: P,
    callback: TaskCallback<P>,
}

/// A fire collected under the lock, invoked after it is released.
struct Due<K, P> {
    key: K,
    id: u64,
    last: bool,
    callback: TaskCallback<P>,
    payload: P,
}

struct WheelState<K, P> {
    current: usize,
    next_id: u64,
    slots: Vec<Vec<K>>,
    tasks: HashMap<K, Entry<P>>,
}

impl<K: Clone + Eq, P> WheelState<K, P> {
    /// Slot and round count for a task due `ticks` ticks from now.
    fn placement(&self, ticks: usize) -> (usize, usize) {
        let len = self.slots.len();
        ((self.current + ticks) % len, (ticks - 1) / len)
    }

    fn unlink(&mut self, slot: usize, key: &K) {
        self.slots[slot].retain(|k| k != key);
    }
}

/// Time wheel keyed by `K`, carrying payloads of type `P`.
///
/// Add, remove, update and firing are serialized by one lock. Callbacks run
/// after the lock is released, so a callback may call back into the wheel.
pub struct TimeWheel<K, P> {
    tick: Duration,
    state: Mutex<WheelState<K, P>>,
}

impl<K, P> TimeWheel<K, P>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
    P: Clone + Send + 'static,
{
    /// Create a wheel. Zero values fall back to one millisecond and one slot.
    pub fn new(tick: Duration, slots: usize) -> Self {
        let tick = if tick.is_zero() {
            Duration::from_millis(1)
        } else {
            tick
        };
        let slots = slots.max(1);
        Self {
            tick,
            state: Mutex::new(WheelState {
                current: 0,
                next_id: 0,
                slots: vec![Vec::new(); slots],
                tasks: HashMap::new(),
            }),
        }
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick
    }

    pub fn slot_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Whole ticks in `interval`, at least one.
    pub fn ticks_for(&self, interval: Duration) -> usize {
        let ticks = interval.as_nanos() / self.tick.as_nanos();
        usize::try_from(ticks).unwrap_or(usize::MAX).max(1)
    }

    /// Schedule a task.
    pub fn add_task(
        &self,
        interval: Duration,
        repetition: Repetition,
        key: K,
        payload: P,
        callback: TaskCallback<P>,
    ) -> Result<(), SchedulerError> {
        let ticks = self.ticks_for(interval);
        let mut state = self.state.lock();

        if state.tasks.contains_key(&key) {
            return Err(SchedulerError::DuplicateTask(format!("{:?}", key)));
        }

        let (slot, rounds) = state.placement(ticks);
        let id = state.next_id;
        state.next_id += 1;
        state.slots[slot].push(key.clone());
        state.tasks.insert(
            key,
            Entry {
                id,
                interval_ticks: ticks,
                remaining: repetition,
                rounds,
                slot,
                payload,
                callback,
            },
        );
        Ok(())
    }

    /// Cancel a task.
    ///
    /// A fire taken from the wheel by a concurrent `tick` but not yet invoked
    /// is dropped. A callback already running is unaffected.
    pub fn remove_task(&self, key: &K) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        let entry = state
            .tasks
            .remove(key)
            .ok_or_else(|| SchedulerError::TaskNotFound(format!("{:?}", key)))?;
        state.unlink(entry.slot, key);
        Ok(())
    }

    /// Replace a task's interval and payload, keeping its repetition count.
    ///
    /// The task is re-placed one full new interval from the current tick.
    pub fn update_task(&self, key: &K, interval: Duration, payload: P) -> Result<(), SchedulerError> {
        let ticks = self.ticks_for(interval);
        let mut state = self.state.lock();

        let old_slot = match state.tasks.get(key) {
            Some(entry) => entry.slot,
            None => return Err(SchedulerError::TaskNotFound(format!("{:?}", key))),
        };
        state.unlink(old_slot, key);

        let (slot, rounds) = state.placement(ticks);
        state.slots[slot].push(key.clone());
        if let Some(entry) = state.tasks.get_mut(key) {
            entry.interval_ticks = ticks;
            entry.rounds = rounds;
            entry.slot = slot;
            entry.payload = payload;
        }
        Ok(())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().tasks.contains_key(key)
    }

    /// Current payload of a task.
    pub fn payload(&self, key: &K) -> Option<P> {
        self.state.lock().tasks.get(key).map(|e| e.payload.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advance the cursor by one slot and fire every task that is due.
    ///
    /// Due tasks are collected under the lock and invoked after it is
    /// released; a task removed in between is skipped. Returns the number of
    /// callbacks invoked.
    pub fn tick(&self) -> usize {
        let due = {
            let mut state = self.state.lock();
            let len = state.slots.len();
            state.current = (state.current + 1) % len;
            let current = state.current;

            let keys = std::mem::take(&mut state.slots[current]);
            let mut waiting = Vec::new();
            let mut rescheduled = Vec::new();
            let mut due = Vec::new();

            for key in keys {
                let Some(entry) = state.tasks.get_mut(&key) else {
                    continue;
                };

                if entry.rounds > 0 {
                    entry.rounds -= 1;
                    waiting.push(key);
                    continue;
                }

                let fire = Due {
                    key: key.clone(),
                    id: entry.id,
                    last: false,
                    callback: entry.callback.clone(),
                    payload: entry.payload.clone(),
                };

                let keep = match entry.remaining {
                    Repetition::Infinite => true,
                    Repetition::Times(n) if n > 1 => {
                        entry.remaining = Repetition::Times(n - 1);
                        true
                    }
                    Repetition::Times(_) => false,
                };

                if keep {
                    rescheduled.push((key, entry.interval_ticks));
                    due.push(fire);
                } else {
                    state.tasks.remove(&key);
                    due.push(Due { last: true, ..fire });
                }
            }

            state.slots[current] = waiting;
            for (key, ticks) in rescheduled {
                let (slot, rounds) = state.placement(ticks);
                state.slots[slot].push(key.clone());
                if let Some(entry) = state.tasks.get_mut(&key) {
                    entry.slot = slot;
                    entry.rounds = rounds;
                }
            }

            due
        };

        let mut fired = 0;
        for fire in due {
            // the final run already left the map; anything else must still be scheduled
            if !fire.last && !self.is_current(&fire.key, fire.id) {
                tracing::trace!(key = ?fire.key, "Task removed before firing");
                continue;
            }
            (fire.callback)(fire.payload);
            fired += 1;
        }
        fired
    }

    fn is_current(&self, key: &K, id: u64) -> bool {
        self.state
            .lock()
            .tasks
            .get(key)
            .is_some_and(|entry| entry.id == id)
    }

    /// Drive the wheel from a timer until `shutdown` flips to `true`.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let wheel = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + wheel.tick, wheel.tick);

            tracing::info!(
                tick_ms = wheel.tick.as_millis() as u64,
                slots = wheel.slot_count(),
                "Time wheel started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let fired = wheel.tick();
                        if fired > 0 {
                            tracing::trace!(fired, "Time wheel tick");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Time wheel stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Wheel = TimeWheel<&'static str, u32>;

    fn recorder() -> (Arc<Mutex<Vec<(usize, u32)>>>, Arc<AtomicUsize>) {
        (Arc::new(Mutex::new(Vec::new())), Arc::new(AtomicUsize::new(0)))
    }

    /// Callback that logs `(tick, payload)` using a shared tick counter.
    fn logging(
        log: &Arc<Mutex<Vec<(usize, u32)>>>,
        clock: &Arc<AtomicUsize>,
    ) -> TaskCallback<u32> {
        let log = log.clone();
        let clock = clock.clone();
        Arc::new(move |p| log.lock().push((clock.load(Ordering::SeqCst), p)))
    }

    fn run(wheel: &Wheel, clock: &AtomicUsize, ticks: usize) {
        for _ in 0..ticks {
            clock.fetch_add(1, Ordering::SeqCst);
            wheel.tick();
        }
    }

    fn fired_at(log: &Mutex<Vec<(usize, u32)>>) -> Vec<usize> {
        log.lock().iter().map(|(t, _)| *t).collect()
    }

    #[test]
    fn test_infinite_task_fires_every_interval_until_removed() {
        let wheel = Wheel::new(Duration::from_secs(1), 180);
        let (log, clock) = recorder();

        wheel
            .add_task(Duration::from_secs(2), Repetition::Infinite, "a", 1, logging(&log, &clock))
            .unwrap();

        run(&wheel, &clock, 7);
        assert_eq!(fired_at(&log), vec![2, 4, 6]);

        wheel.remove_task(&"a").unwrap();
        run(&wheel, &clock, 10);
        assert_eq!(fired_at(&log), vec![2, 4, 6]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_bounded_repetitions() {
        let wheel = Wheel::new(Duration::from_secs(1), 8);
        let (log, clock) = recorder();

        wheel
            .add_task(Duration::from_secs(3), Repetition::Times(2), "a", 7, logging(&log, &clock))
            .unwrap();

        run(&wheel, &clock, 12);
        assert_eq!(*log.lock(), vec![(3, 7), (6, 7)]);
        assert!(!wheel.contains(&"a"));
    }

    #[test]
    fn test_interval_longer_than_one_revolution() {
        let wheel = Wheel::new(Duration::from_secs(1), 4);
        let (log, clock) = recorder();

        wheel
            .add_task(Duration::from_secs(10), Repetition::Infinite, "long", 0, logging(&log, &clock))
            .unwrap();
        wheel
            .add_task(Duration::from_secs(4), Repetition::Infinite, "full", 1, logging(&log, &clock))
            .unwrap();
        wheel
            .add_task(Duration::from_secs(8), Repetition::Times(1), "twice", 2, logging(&log, &clock))
            .unwrap();

        run(&wheel, &clock, 20);

        let log = log.lock();
        let by = |p: u32| -> Vec<usize> {
            log.iter().filter(|(_, x)| *x == p).map(|(t, _)| *t).collect()
        };
        assert_eq!(by(0), vec![10, 20]);
        assert_eq!(by(1), vec![4, 8, 12, 16, 20]);
        assert_eq!(by(2), vec![8]);
    }

    #[test]
    fn test_sub_tick_interval_is_one_tick() {
        let wheel = Wheel::new(Duration::from_secs(1), 180);
        let (log, clock) = recorder();

        wheel
            .add_task(Duration::from_millis(200), Repetition::Times(3), "fast", 0, logging(&log, &clock))
            .unwrap();

        run(&wheel, &clock, 5);
        assert_eq!(fired_at(&log), vec![1, 2, 3]);
    }

    #[test]
    fn test_duplicate_and_missing_keys() {
        let wheel = Wheel::new(Duration::from_secs(1), 180);
        let noop: TaskCallback<u32> = Arc::new(|_| {});

        wheel
            .add_task(Duration::from_secs(5), Repetition::Infinite, "a", 0, noop.clone())
            .unwrap();
        assert!(matches!(
            wheel.add_task(Duration::from_secs(5), Repetition::Infinite, "a", 0, noop),
            Err(SchedulerError::DuplicateTask(_))
        ));

        assert!(matches!(
            wheel.remove_task(&"missing"),
            Err(SchedulerError::TaskNotFound(_))
        ));
        assert!(matches!(
            wheel.update_task(&"missing", Duration::from_secs(1), 0),
            Err(SchedulerError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_update_replaces_interval_and_payload() {
        let wheel = Wheel::new(Duration::from_secs(1), 180);
        let (log, clock) = recorder();

        wheel
            .add_task(Duration::from_secs(5), Repetition::Infinite, "a", 1, logging(&log, &clock))
            .unwrap();
        run(&wheel, &clock, 1);

        wheel.update_task(&"a", Duration::from_secs(2), 9).unwrap();
        assert_eq!(wheel.payload(&"a"), Some(9));

        run(&wheel, &clock, 5);
        assert_eq!(*log.lock(), vec![(3, 9), (5, 9)]);
    }

    #[test]
    fn test_task_removed_after_collection_does_not_fire() {
        let wheel = Arc::new(Wheel::new(Duration::from_secs(1), 10));
        let (log, clock) = recorder();

        // "a" fires first in the shared slot and cancels "b" before its turn
        let weak = Arc::downgrade(&wheel);
        let b_callback = logging(&log, &clock);
        let canceller: TaskCallback<u32> = Arc::new(move |_| {
            if let Some(wheel) = weak.upgrade() {
                wheel.remove_task(&"b").unwrap();
                wheel
                    .add_task(Duration::from_secs(5), Repetition::Infinite, "b", 2, b_callback.clone())
                    .unwrap();
            }
        });

        wheel
            .add_task(Duration::from_secs(1), Repetition::Times(1), "a", 1, canceller)
            .unwrap();
        wheel
            .add_task(Duration::from_secs(1), Repetition::Infinite, "b", 1, logging(&log, &clock))
            .unwrap();

        clock.fetch_add(1, Ordering::SeqCst);
        assert_eq!(wheel.tick(), 1);
        assert!(log.lock().is_empty());
        assert!(wheel.contains(&"b"));

        run(&wheel, &clock, 5);
        assert_eq!(*log.lock(), vec![(6, 2)]);
    }

    #[test]
    fn test_callback_can_remove_its_own_task() {
        let wheel = Arc::new(Wheel::new(Duration::from_secs(1), 10));
        let count = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&wheel);
        let seen = count.clone();
        let callback: TaskCallback<u32> = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            if let Some(wheel) = weak.upgrade() {
                let _ = wheel.remove_task(&"self");
            }
        });

        wheel
            .add_task(Duration::from_secs(1), Repetition::Infinite, "self", 0, callback)
            .unwrap();
        for _ in 0..5 {
            wheel.tick();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_repetition_from_count() {
        assert_eq!(Repetition::from_count(-1), Ok(Repetition::Infinite));
        assert_eq!(Repetition::from_count(3), Ok(Repetition::Times(3)));
        assert_eq!(
            Repetition::from_count(0),
            Err(SchedulerError::InvalidRepetitions(0))
        );
        assert!(Repetition::from_count(-2).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_loop_drives_ticks() {
        let wheel = Arc::new(Wheel::new(Duration::from_millis(100), 16));
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();

        wheel
            .add_task(
                Duration::from_millis(200),
                Repetition::Infinite,
                "a",
                0,
                Arc::new(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = wheel.start(stop_rx);

        tokio::time::sleep(Duration::from_millis(650)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
