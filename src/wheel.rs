use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Default slot count, rounded up to a power of two if overridden.
const DEFAULT_SLOTS: u32 = 256;

/// Default tick resolution: one millisecond.
const DEFAULT_RESOLUTION_NS: u64 = 1_000_000;

/// A hashed timer wheel with per-slot locking.
///
/// Timers hash into `slots` (a power of two) by their absolute expiry
/// tick. [`add`](Self::add) may be called from any thread; a single
/// driving thread is expected to call [`tick`](Self::tick) with a
/// monotonic nanosecond clock. A timer scheduled further than one wheel
/// revolution away lands in an already-used slot and is re-hashed into its
/// real slot when the wheel first sweeps past it.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use std::sync::Arc;
/// use troika::TimerWheel;
///
/// let hits = Arc::new(AtomicU64::new(0));
/// let wheel = {
///     let hits = Arc::clone(&hits);
///     TimerWheel::with_config(64, 1_000, move |_: u64| {
///         hits.fetch_add(1, Ordering::Relaxed);
///     })
/// };
///
/// wheel.add(2_000, 7);
/// assert_eq!(wheel.tick(1_000), 0);
/// assert_eq!(wheel.tick(2_000), 1);
/// assert_eq!(hits.load(Ordering::Relaxed), 1);
/// ```
pub struct TimerWheel<T> {
    slots: Box<[Mutex<Vec<Timer<T>>>]>,
    mask: u64,
    tick_resolution: u64,
    current_tick: AtomicU64,
    expire_cb: Box<dyn Fn(T) + Send + Sync>,
    counters: Counters,
}

struct Timer<T> {
    /// Absolute expiry in nanoseconds, rounded up to a tick boundary.
    expiry: u64,
    data: T,
}

#[derive(Default)]
struct Counters {
    adds: AtomicU64,
    expirations: AtomicU64,
    deferrals: AtomicU64,
    late_adds: AtomicU64,
}

impl<T> TimerWheel<T> {
    /// Creates a wheel with 256 slots and a 1 ms tick.
    pub fn new(expire_cb: impl Fn(T) + Send + Sync + 'static) -> TimerWheel<T> {
        Self::with_config(DEFAULT_SLOTS, DEFAULT_RESOLUTION_NS, expire_cb)
    }

    /// Creates a wheel with `slots` slots (rounded up to a power of two)
    /// and `tick_resolution_ns` nanoseconds per tick. Zero selects the
    /// default for either parameter.
    pub fn with_config(
        slots: u32,
        tick_resolution_ns: u64,
        expire_cb: impl Fn(T) + Send + Sync + 'static,
    ) -> TimerWheel<T> {
        let slots = if slots == 0 { DEFAULT_SLOTS } else { slots }.next_power_of_two();
        let tick_resolution = if tick_resolution_ns == 0 {
            DEFAULT_RESOLUTION_NS
        } else {
            tick_resolution_ns
        };
        TimerWheel {
            slots: (0..slots).map(|_| Mutex::new(Vec::new())).collect(),
            mask: u64::from(slots - 1),
            tick_resolution,
            current_tick: AtomicU64::new(0),
            expire_cb: Box::new(expire_cb),
            counters: Counters::default(),
        }
    }

    /// Schedules `data` to fire `delay_ns` nanoseconds from the wheel's
    /// current tick, rounding the delay up to a whole tick.
    ///
    /// A zero delay never schedules; the data is dropped and the call is a
    /// no-op. If the driving thread sweeps past the target tick while the
    /// timer is being linked, it fires immediately instead of lying
    /// dormant for a full revolution.
    pub fn add(&self, delay_ns: u64, data: T) {
        self.counters.adds.fetch_add(1, Ordering::Relaxed);
        if delay_ns == 0 {
            return;
        }
        let ticks_delay = delay_ns.div_ceil(self.tick_resolution);
        let expiry_tick = self
            .current_tick
            .load(Ordering::SeqCst)
            .wrapping_add(ticks_delay);
        let timer = Timer {
            expiry: expiry_tick.saturating_mul(self.tick_resolution),
            data,
        };

        let slot = (expiry_tick & self.mask) as usize;
        let mut list = self.slots[slot].lock();
        if expiry_tick < self.current_tick.load(Ordering::SeqCst) {
            // The driver won the race and already swept the target tick.
            drop(list);
            tracing::debug!(expiry_tick, "timer added behind the wheel, firing now");
            (self.expire_cb)(timer.data);
            self.counters.late_adds.fetch_add(1, Ordering::Relaxed);
            return;
        }
        list.push(timer);
    }

    /// Advances the wheel to `now_ns`, draining every slot the sweep
    /// passes over and firing expired timers. Returns the number fired.
    ///
    /// A `now_ns` behind the wheel's current tick is not an error; the
    /// call returns 0 and waits for the clock to catch up.
    pub fn tick(&self, now_ns: u64) -> usize {
        let target_tick = now_ns / self.tick_resolution;
        let mut tick = self.current_tick.load(Ordering::SeqCst);
        if target_tick < tick {
            return 0;
        }

        let mut fired = 0;
        while tick <= target_tick {
            let slot = (tick & self.mask) as usize;
            let drained = mem::take(&mut *self.slots[slot].lock());
            for timer in drained {
                if timer.expiry <= now_ns {
                    (self.expire_cb)(timer.data);
                    fired += 1;
                } else {
                    // Multi-round timer: park it in its real slot. The mask
                    // maps a timer a whole revolution out back to this one.
                    let next = ((timer.expiry / self.tick_resolution) & self.mask) as usize;
                    self.slots[next].lock().push(timer);
                    self.counters.deferrals.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.current_tick.fetch_add(1, Ordering::SeqCst);
            tick += 1;
        }
        self.counters
            .expirations
            .fetch_add(fired as u64, Ordering::Relaxed);
        fired
    }

    /// Tears the wheel down, optionally firing the callback for every
    /// pending timer. Dropping the wheel instead discards pending timers
    /// without firing.
    pub fn shutdown(self, fire_pending: bool) {
        for slot in self.slots.iter() {
            for timer in mem::take(&mut *slot.lock()) {
                if fire_pending {
                    (self.expire_cb)(timer.data);
                }
            }
        }
    }

    /// Returns the slot count.
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    /// Returns the tick resolution in nanoseconds.
    pub fn tick_resolution(&self) -> u64 {
        self.tick_resolution
    }

    /// Returns the current tick.
    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::SeqCst)
    }

    /// Returns a snapshot of the wheel's advisory counters.
    pub fn stats(&self) -> WheelStats {
        WheelStats {
            adds: self.counters.adds.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            deferrals: self.counters.deferrals.load(Ordering::Relaxed),
            late_adds: self.counters.late_adds.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for TimerWheel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerWheel")
            .field("slots", &self.slots.len())
            .field("tick_resolution", &self.tick_resolution)
            .field("current_tick", &self.current_tick())
            .finish()
    }
}

/// A point-in-time snapshot of a wheel's advisory counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct WheelStats {
    /// `add` calls, including zero-delay no-ops.
    pub adds: u64,
    /// Timers fired from `tick`.
    pub expirations: u64,
    /// Multi-round timers re-hashed into a later slot during a sweep.
    pub deferrals: u64,
    /// Timers that were added behind the sweep and fired immediately.
    pub late_adds: u64,
}
