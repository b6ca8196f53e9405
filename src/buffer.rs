use crate::cancel::CancelToken;
use crate::error::{PipelineError, Result};
use crate::scalar::{zeroed, Record, Scalar};
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::trace;

/// How often a cancellable wait re-checks its token
pub(crate) const WAIT_TICK: Duration = Duration::from_millis(2);

/// Sleep used once spinning and yielding have been exhausted
const IDLE_SLEEP: Duration = Duration::from_micros(20);

/// Slot storage and cursors, guarded by the buffer's mutex
struct Slots<T> {
    records: Box<[Record<T>]>,
    read: usize,
    write: usize,
    occupied: usize,
}

impl<T: Scalar> Slots<T> {
    fn new(capacity: usize, width: usize) -> Self {
        Self {
            records: (0..capacity).map(|_| zeroed(width)).collect(),
            read: 0,
            write: 0,
            occupied: 0,
        }
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.occupied == self.records.len()
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    fn push(&mut self, record: &[T]) {
        let capacity = self.records.len();
        self.records[self.write].copy_from_slice(record);
        self.write = (self.write + 1) % capacity;
        self.occupied += 1;
        assert!(self.occupied <= capacity, "ring buffer occupancy exceeds capacity");
    }

    fn pop(&mut self, out: &mut [T]) {
        assert!(self.occupied > 0, "ring buffer popped while empty");
        out.copy_from_slice(&self.records[self.read]);
        self.read = (self.read + 1) % self.records.len();
        self.occupied -= 1;
    }

    fn clear(&mut self) {
        for record in self.records.iter_mut() {
            record.fill(T::default());
        }
        self.read = 0;
        self.write = 0;
        self.occupied = 0;
    }
}

/// A bounded circular queue of fixed-width records.
///
/// One producer and one consumer per buffer. Records are copied in on push and
/// copied out on pop, so neither side ever holds a reference into the slots.
/// `stop()` wakes every waiter and makes all later transfers fail until
/// `reset()`.
pub struct RingBuffer<T: Scalar> {
    slots: Mutex<Slots<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    stopped: AtomicBool,
    capacity: usize,
    width: usize,
}

impl<T: Scalar> RingBuffer<T> {
    /// Create a buffer of `capacity` slots holding records of `width` elements
    pub fn new(capacity: usize, width: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::InvalidCapacity(capacity));
        }
        Ok(Self {
            slots: Mutex::new(Slots::new(capacity, width)),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            stopped: AtomicBool::new(false),
            capacity,
            width,
        })
    }

    /// Copy `record` into the next free slot without blocking.
    /// Returns false if the buffer is full or stopped.
    pub fn try_push(&self, record: &[T]) -> bool {
        self.check_width(record.len());
        if self.is_stopped() {
            return false;
        }
        let mut slots = self.slots.lock();
        if slots.is_full() {
            return false;
        }
        slots.push(record);
        drop(slots);
        self.not_empty.notify_one();
        true
    }

    /// Block until a slot frees up, then push.
    /// Returns false without pushing if the buffer is stopped.
    pub fn wait_push(&self, record: &[T]) -> bool {
        self.wait_push_inner(record, None)
    }

    /// Like [`wait_push`](Self::wait_push) but also gives up once `cancel` fires
    pub fn wait_push_cancellable(&self, record: &[T], cancel: &CancelToken) -> bool {
        self.wait_push_inner(record, Some(cancel))
    }

    /// Copy the oldest record into `out` without blocking.
    /// Returns false if the buffer is empty or stopped.
    pub fn try_pop(&self, out: &mut [T]) -> bool {
        self.check_width(out.len());
        if self.is_stopped() {
            return false;
        }
        let mut slots = self.slots.lock();
        if slots.is_empty() {
            return false;
        }
        slots.pop(out);
        drop(slots);
        self.not_full.notify_one();
        true
    }

    /// Block until a record is available, then pop it into `out`.
    /// Returns false without popping if the buffer is stopped.
    pub fn wait_pop(&self, out: &mut [T]) -> bool {
        self.wait_pop_inner(out, None)
    }

    /// Like [`wait_pop`](Self::wait_pop) but also gives up once `cancel` fires
    pub fn wait_pop_cancellable(&self, out: &mut [T], cancel: &CancelToken) -> bool {
        self.wait_pop_inner(out, Some(cancel))
    }

    fn wait_push_inner(&self, record: &[T], cancel: Option<&CancelToken>) -> bool {
        self.check_width(record.len());
        let mut slots = self.slots.lock();
        loop {
            if self.is_stopped() || cancel.is_some_and(CancelToken::is_cancelled) {
                return false;
            }
            if !slots.is_full() {
                slots.push(record);
                drop(slots);
                self.not_empty.notify_one();
                return true;
            }
            match cancel {
                Some(_) => {
                    self.not_full.wait_for(&mut slots, WAIT_TICK);
                }
                None => self.not_full.wait(&mut slots),
            }
        }
    }

    fn wait_pop_inner(&self, out: &mut [T], cancel: Option<&CancelToken>) -> bool {
        self.check_width(out.len());
        let mut slots = self.slots.lock();
        loop {
            if self.is_stopped() || cancel.is_some_and(CancelToken::is_cancelled) {
                return false;
            }
            if !slots.is_empty() {
                slots.pop(out);
                drop(slots);
                self.not_full.notify_one();
                return true;
            }
            match cancel {
                Some(_) => {
                    self.not_empty.wait_for(&mut slots, WAIT_TICK);
                }
                None => self.not_empty.wait(&mut slots),
            }
        }
    }

    /// Mark the buffer stopped and wake every waiter
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        // Taking the lock orders the flag before any waiter re-checks it.
        let _slots = self.slots.lock();
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Return to the empty, running state.
    ///
    /// Only call while no thread is pushing or popping.
    pub fn reset(&self) {
        self.slots.lock().clear();
        self.stopped.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.lock().occupied
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of elements per record
    pub fn width(&self) -> usize {
        self.width
    }

    /// Occupancy as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() * 100) / self.capacity).min(100) as u32
    }

    #[inline]
    fn check_width(&self, len: usize) {
        assert_eq!(
            len, self.width,
            "record of {len} elements does not fit a buffer of width {}",
            self.width
        );
    }
}

impl<T: Scalar> fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("kind", &T::KIND)
            .field("capacity", &self.capacity)
            .field("width", &self.width)
            .field("len", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Escalating pause for retry loops around the non-blocking calls:
/// spin, then yield, then short sleeps.
pub(crate) struct Pacer {
    backoff: Backoff,
    idle: Cell<bool>,
}

impl Pacer {
    pub(crate) fn new() -> Self {
        Self {
            backoff: Backoff::new(),
            idle: Cell::new(false),
        }
    }

    #[inline]
    pub(crate) fn pause(&self) {
        if self.backoff.is_completed() {
            if !self.idle.replace(true) {
                trace!("backoff exhausted, falling back to sleeps");
            }
            thread::sleep(IDLE_SLEEP);
        } else {
            self.backoff.snooze();
        }
    }

    #[inline]
    pub(crate) fn reset(&self) {
        self.backoff.reset();
        self.idle.set(false);
    }
}
