//! Poll Loop (component F): the background thread that samples the
//! reference clock at a fixed cadence, advances any in-progress slew,
//! runs the active servo, and republishes its output as the timebase's
//! frequency bias.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::consts::{LOCK_STREAK_TICKS, PHASE_EPSILON_NS};
use crate::log::{Event, EventKind, EventRing};
use crate::reference::now_ref_ns;
use crate::servo::{AnyServo, Servo};
use crate::timebase::Timebase;

/// Shared, poll-thread-owned lock status: phase error within
/// `PHASE_EPSILON_NS` for `LOCK_STREAK_TICKS` consecutive ticks. Cheap to
/// read from any thread; only the poll thread writes it.
#[derive(Default)]
pub struct LockTracker {
    streak: AtomicU32,
    locked: AtomicBool,
}

impl LockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the streak/lock state for this tick. Returns `Some(now_locked)`
    /// when this sample flipped the locked state — a threshold cross —
    /// `None` if the state held from the previous tick.
    fn observe(&self, in_threshold: bool) -> Option<bool> {
        if in_threshold {
            let streak = self.streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= LOCK_STREAK_TICKS && !self.locked.swap(true, Ordering::Relaxed) {
                return Some(true);
            }
        } else {
            self.streak.store(0, Ordering::Relaxed);
            if self.locked.swap(false, Ordering::Relaxed) {
                return Some(false);
            }
        }
        None
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// One full tick's worth of work, split out so it can be unit tested
/// without spinning up a thread.
pub fn run_tick(
    timebase: &Timebase,
    servo: &mut AnyServo,
    poll_ns: i64,
    ring: &EventRing,
    lock: &LockTracker,
) {
    let Ok(now) = now_ref_ns() else { return };

    let (consumed_ns, residual_reached_zero) = timebase.advance_slew(now);
    if consumed_ns != 0 && residual_reached_zero {
        ring.push(Event::new(
            now,
            EventKind::SlewComplete,
            "slew residual reached zero",
        ));
    }

    let phase_residual_ns = timebase.phase_residual_ns();
    let phase_error_s = phase_residual_ns as f64 / 1e9;
    let dt_s = poll_ns as f64 / 1e9;

    let was_enabled = servo.enabled();
    let output_ppm = servo.update(phase_error_s, dt_s);
    if !was_enabled && servo.enabled() {
        tracing::debug!(phase_error_ns = phase_residual_ns, "servo auto-enabled");
        ring.push(Event::new(now, EventKind::PiEnable, "servo enabled"));
    }

    // spec.md §4.C step 4: publish to the timebase only while the servo
    // is enabled; a dormant servo must not steer the frequency bias.
    let applied = if servo.enabled() {
        let applied = timebase.set_frequency(output_ppm, now);
        // Step 3's own clamp (`servo.last_clamped()`) is the signal spec.md
        // §4.C wants `FREQUENCY_CLAMP` to track, not whether
        // `Timebase::set_frequency`'s clamp to the same `±MAX_PPM` range
        // happened to change anything — it never does, since the servo
        // output already arrives pre-clamped.
        if servo.last_clamped() {
            tracing::warn!(output_ppm, "servo output clamped");
            ring.push(Event::with_detail(
                now,
                EventKind::FrequencyClamp,
                format_args!("output={output_ppm:.3}ppm"),
            ));
        }
        applied
    } else {
        timebase.frequency_ppm()
    };

    if let Some(now_locked) = lock.observe(phase_residual_ns.abs() <= PHASE_EPSILON_NS) {
        ring.push(Event::with_detail(
            now,
            EventKind::ThresholdCross,
            format_args!("phase lock {}", if now_locked { "acquired" } else { "lost" }),
        ));
    }

    ring.push(Event::with_detail(
        now,
        EventKind::PiStep,
        format_args!("phase_error_ns={phase_residual_ns} output_ppm={applied:.3}"),
    ));
}

/// Owns the background poll thread. Dropping this does not stop the
/// thread; callers shut it down explicitly via [`PollLoop::stop`] so the
/// clock lifecycle (component K) controls ordering against the writer
/// thread.
pub struct PollLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PollLoop {
    pub fn spawn(
        timebase: Arc<Timebase>,
        servo: Arc<Mutex<AnyServo>>,
        ring: Arc<EventRing>,
        lock: Arc<LockTracker>,
        poll_ns: i64,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("swclock-poll".into())
            .spawn(move || {
                while thread_running.load(Ordering::Acquire) {
                    {
                        let mut servo = servo.lock().unwrap();
                        run_tick(&timebase, &mut servo, poll_ns, &ring, &lock);
                    }
                    thread::sleep(Duration::from_nanos(poll_ns.max(0) as u64));
                }
            })
            .expect("failed to spawn poll thread");

        Self {
            running,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
