//! The sampling clock: one background thread advancing a shared counter.
//!
//! Monitors never read a timer on their hot path. They watch a single
//! `AtomicU32` that the clock thread bumps once per sampling interval; a
//! changed value means at least one tick elapsed, and the size of the change
//! is the sample weight. The thread is refcounted across every context
//! sharing the clock, starts with a random phase offset so concurrent
//! processes do not tick in lockstep, and corrects for sleep overshoot so
//! counter values track wall time instead of wake counts.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};

use crate::profiler::config::{
    SourceMode, DEFAULT_MAX_SEGMENT_SIZE, DEFAULT_SAMPLING_INTERVAL_US, DEFAULT_STACK_DEPTH,
};
use crate::profiler::error::ProfileError;
use crate::profiler::identity::Lcg;

/// Stack reserved for the clock thread. The loop body is tiny.
const CLOCK_THREAD_STACK: usize = 64 * 1024;

/// Time access for the clock thread, injectable so tests can drive the
/// thread deterministically.
pub trait TimeSource: Send + Sync {
    /// Monotonic reading in nanoseconds, or `None` when the platform has no
    /// usable monotonic clock; the thread then falls back to one tick per
    /// wake.
    fn monotonic_ns(&self) -> Option<u64>;

    fn sleep_ns(&self, ns: u64);
}

/// `CLOCK_MONOTONIC` and a plain thread sleep.
#[derive(Debug, Default)]
pub struct RealTime;

impl TimeSource for RealTime {
    fn monotonic_ns(&self) -> Option<u64> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid out-pointer and CLOCK_MONOTONIC is always
        // available on the platforms we build for.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
    }

    fn sleep_ns(&self, ns: u64) {
        thread::sleep(Duration::from_nanos(ns));
    }
}

/// Resolution of the monotonic clock, in nanoseconds.
pub fn clock_precision_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer.
    unsafe {
        libc::clock_getres(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Deterministic clock for tests.
///
/// Every sleep blocks until the test grants it, then virtual time advances
/// by the requested duration plus a fixed overshoot. Tests can wait for the
/// clock thread to finish a given number of sleeps instead of spinning.
pub struct ManualTime {
    inner: Mutex<ManualState>,
    wake: Condvar,
    overshoot_ns: u64,
    has_monotonic: bool,
}

struct ManualState {
    now_ns: u64,
    permits: u64,
    completed: u64,
}

impl ManualTime {
    pub fn new() -> ManualTime {
        ManualTime::with_overshoot(0)
    }

    /// Every sleep overshoots its requested duration by `overshoot_ns`.
    pub fn with_overshoot(overshoot_ns: u64) -> ManualTime {
        ManualTime {
            inner: Mutex::new(ManualState {
                now_ns: 0,
                permits: 0,
                completed: 0,
            }),
            wake: Condvar::new(),
            overshoot_ns,
            has_monotonic: true,
        }
    }

    /// Simulates a platform with no monotonic clock.
    pub fn without_monotonic() -> ManualTime {
        ManualTime {
            has_monotonic: false,
            ..ManualTime::new()
        }
    }

    /// Allow `count` further sleeps to complete.
    pub fn grant(&self, count: u64) {
        let mut state = self.inner.lock();
        state.permits += count;
        self.wake.notify_all();
    }

    /// Block until `target` sleeps have completed in total. Returns `false`
    /// on timeout.
    pub fn wait_sleeps(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock();
        while state.completed < target {
            if self.wake.wait_until(&mut state, deadline).timed_out() {
                return state.completed >= target;
            }
        }
        true
    }

    pub fn now_ns(&self) -> u64 {
        self.inner.lock().now_ns
    }

    pub fn sleeps_completed(&self) -> u64 {
        self.inner.lock().completed
    }
}

impl Default for ManualTime {
    fn default() -> ManualTime {
        ManualTime::new()
    }
}

impl TimeSource for ManualTime {
    fn monotonic_ns(&self) -> Option<u64> {
        if self.has_monotonic {
            Some(self.inner.lock().now_ns)
        } else {
            None
        }
    }

    fn sleep_ns(&self, ns: u64) {
        let mut state = self.inner.lock();
        while state.permits == 0 {
            self.wake.wait(&mut state);
        }
        state.permits -= 1;
        state.now_ns += ns + self.overshoot_ns;
        state.completed += 1;
        self.wake.notify_all();
    }
}

/// Sampling parameters shared by every context on a clock. Published as a
/// whole so readers always see a consistent set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingParams {
    /// Tick interval in microseconds. Never zero.
    pub interval_us: u32,
    /// Frames captured per sample.
    pub stack_depth: u32,
    /// Segment size after which a template output rotates.
    pub max_segment_size: u64,
    pub source_mode: SourceMode,
}

impl Default for SamplingParams {
    fn default() -> SamplingParams {
        SamplingParams {
            interval_us: DEFAULT_SAMPLING_INTERVAL_US,
            stack_depth: DEFAULT_STACK_DEPTH,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            source_mode: SourceMode::None,
        }
    }
}

impl SamplingParams {
    fn normalized(mut self) -> SamplingParams {
        if self.interval_us == 0 {
            tracing::warn!(
                "sampling interval below one microsecond is not supported, using one microsecond"
            );
            self.interval_us = 1;
        }
        self
    }
}

/// Startup handle passed to the clock thread: the initial random delay that
/// staggers clock phases between processes. Read once, then discarded.
struct CounterCxt {
    start_delay_us: u32,
}

struct ClockControl {
    /// Monitors currently holding the clock. The thread itself is not
    /// counted.
    refcount: u32,
    /// True while a clock thread is alive, including its countdown window.
    thread_running: bool,
    /// Threads spawned over this clock's lifetime, for observing countdown
    /// reuse.
    threads_started: u64,
    rng: Lcg,
}

/// Shared clock: the counter every monitor polls, the refcounted thread
/// control, and the published sampling parameters.
pub struct ClockState {
    counter: AtomicU32,
    control: Mutex<ClockControl>,
    params: ArcSwap<SamplingParams>,
    time: Arc<dyn TimeSource>,
}

impl ClockState {
    /// Clock over the real monotonic timer.
    pub fn new(params: SamplingParams) -> Arc<ClockState> {
        ClockState::with_time_source(params, Arc::new(RealTime))
    }

    pub fn with_time_source(params: SamplingParams, time: Arc<dyn TimeSource>) -> Arc<ClockState> {
        Arc::new(ClockState {
            counter: AtomicU32::new(0),
            control: Mutex::new(ClockControl {
                refcount: 0,
                thread_running: false,
                threads_started: 0,
                rng: Lcg::seeded(),
            }),
            params: ArcSwap::from_pointee(params.normalized()),
            time,
        })
    }

    /// Current tick counter. Wraps.
    pub fn counter(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Snapshot of the published sampling parameters.
    pub fn params(&self) -> Arc<SamplingParams> {
        self.params.load_full()
    }

    pub fn thread_alive(&self) -> bool {
        self.control.lock().thread_running
    }

    pub fn threads_started(&self) -> u64 {
        self.control.lock().threads_started
    }

    fn referenced(&self) -> bool {
        self.control.lock().refcount > 0
    }

    /// Take a reference to the clock, spawning the thread on the first one.
    /// A thread still in its exit countdown is reused instead of respawned.
    pub fn start(self: &Arc<Self>) -> Result<(), ProfileError> {
        let mut control = self.control.lock();
        control.refcount += 1;
        if control.refcount == 1 && !control.thread_running {
            let interval_us = self.params.load().interval_us.max(1);
            // The low-order LCG bits are the least random; shift them out
            // before taking the phase offset.
            let delay_us = (control.rng.next() >> 8) % interval_us;
            if let Err(err) = self.spawn_clock_thread(CounterCxt {
                start_delay_us: delay_us,
            }) {
                control.refcount -= 1;
                return Err(ProfileError::ClockStart(err));
            }
            control.thread_running = true;
            control.threads_started += 1;
        }
        Ok(())
    }

    /// Drop a reference. When the last one goes, the thread notices on its
    /// next wake and begins its exit countdown.
    pub fn stop(&self) {
        let mut control = self.control.lock();
        debug_assert!(control.refcount > 0, "unbalanced clock stop");
        control.refcount = control.refcount.saturating_sub(1);
    }

    /// Replace the sampling interval. Ignored with a warning while any
    /// monitor is running; a zero interval is clamped to one microsecond.
    pub fn set_sampling_interval_us(&self, interval_us: u32) {
        if self.referenced() {
            tracing::warn!("ignoring sampling interval change while monitoring is in progress");
            return;
        }
        let mut params = SamplingParams::clone(&self.params.load());
        params.interval_us = interval_us;
        self.params.store(Arc::new(params.normalized()));
    }

    /// Replace the per-sample stack depth. Ignored with a warning while any
    /// monitor is running.
    pub fn set_stack_depth(&self, depth: u32) {
        if self.referenced() {
            tracing::warn!("ignoring stack depth change while monitoring is in progress");
            return;
        }
        let mut params = SamplingParams::clone(&self.params.load());
        params.stack_depth = depth;
        self.params.store(Arc::new(params));
    }

    /// Replace the rotation threshold. Safe at any time; the next sample
    /// sees the new value.
    pub fn set_max_segment_size(&self, bytes: u64) {
        let mut params = SamplingParams::clone(&self.params.load());
        params.max_segment_size = bytes;
        self.params.store(Arc::new(params));
    }

    /// Replace the eval source-saving mode. Safe at any time.
    pub fn set_source_mode(&self, mode: SourceMode) {
        let mut params = SamplingParams::clone(&self.params.load());
        params.source_mode = mode;
        self.params.store(Arc::new(params));
    }

    /// Take the control lock ahead of `fork(2)` so the child never inherits
    /// it held mid-operation by another thread. Must be paired with
    /// [`fork_unlock`] in the parent and [`fork_reset`] in the child.
    ///
    /// [`fork_unlock`]: ClockState::fork_unlock
    /// [`fork_reset`]: ClockState::fork_reset
    pub fn fork_lock(&self) {
        mem::forget(self.control.lock());
    }

    /// Parent side of the fork protocol: release the lock taken by
    /// [`fork_lock`](ClockState::fork_lock).
    pub fn fork_unlock(&self) {
        // SAFETY: paired with a fork_lock on this same thread.
        unsafe { self.control.force_unlock() };
    }

    /// Child side of the fork protocol. The clock thread did not survive
    /// the fork; reset the control state and, when the child still holds a
    /// monitor reference, respawn the thread immediately.
    pub fn fork_reset(self: &Arc<Self>, monitoring: bool) -> Result<(), ProfileError> {
        // SAFETY: the child inherits the lock taken by fork_lock.
        unsafe { self.control.force_unlock() };
        let mut control = self.control.lock();
        control.thread_running = false;
        control.threads_started = 0;
        control.refcount = u32::from(monitoring);
        if monitoring {
            let interval_us = self.params.load().interval_us.max(1);
            let delay_us = (control.rng.next() >> 8) % interval_us;
            self.spawn_clock_thread(CounterCxt {
                start_delay_us: delay_us,
            })
            .map_err(ProfileError::ForkClock)?;
            control.thread_running = true;
            control.threads_started += 1;
        }
        Ok(())
    }

    fn spawn_clock_thread(self: &Arc<Self>, cxt: CounterCxt) -> io::Result<()> {
        let state = Arc::clone(self);
        thread::Builder::new()
            .name("tickprof-clock".into())
            .stack_size(CLOCK_THREAD_STACK)
            .spawn(move || state.clock_loop(cxt))?;
        Ok(())
    }

    fn clock_loop(self: Arc<Self>, cxt: CounterCxt) {
        tracing::debug!(delay_us = cxt.start_delay_us, "sampling clock started");
        let mut delay_ns = u64::from(cxt.start_delay_us) * 1_000;
        let mut carry_ns = 0u64;
        let mut prev = self.time.monotonic_ns();
        let mut countdown: Option<u32> = None;

        loop {
            self.time.sleep_ns(delay_ns);
            let interval_us = self.params.load().interval_us.max(1);
            let interval_ns = u64::from(interval_us) * 1_000;
            delay_ns = interval_ns;

            match (prev, self.time.monotonic_ns()) {
                (Some(before), Some(now)) => {
                    // Sleep overshoot accumulates; credit whole elapsed
                    // intervals and carry the remainder so the counter
                    // tracks wall time, not wake counts.
                    let elapsed = now.saturating_sub(before) + carry_ns;
                    let ticks = elapsed / interval_ns;
                    carry_ns = elapsed % interval_ns;
                    if ticks > 0 {
                        self.counter.fetch_add(ticks as u32, Ordering::Relaxed);
                    }
                    prev = Some(now);
                }
                (_, now) => {
                    // No usable monotonic reading: one tick per wake.
                    self.counter.fetch_add(1, Ordering::Relaxed);
                    prev = now;
                }
            }

            let mut control = self.control.lock();
            if control.refcount > 0 {
                countdown = None;
                continue;
            }
            // Unreferenced: linger for about a second of wakes so a quick
            // restart reuses this thread instead of spawning a new one.
            let remaining = countdown.get_or_insert_with(|| countdown_wakes(interval_us));
            if *remaining <= 1 {
                control.thread_running = false;
                tracing::debug!("sampling clock stopped");
                return;
            }
            *remaining -= 1;
        }
    }
}

fn countdown_wakes(interval_us: u32) -> u32 {
    (1_000_000 / interval_us.max(1)).max(1)
}
