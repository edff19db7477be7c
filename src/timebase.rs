//! Synthetic Timebase (component B): nanosecond-precision realtime and
//! monotonic timestamps synthesized from the reference clock plus a
//! frequency bias and an in-progress phase slew.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consts::MAX_PPM;

/// Which of the three clock ids `gettime` answers for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockId {
    Realtime,
    Monotonic,
    /// Passthrough of the reference clock. Never disciplined: there is no
    /// public operation that steps or re-rates this identity.
    MonotonicRaw,
}

#[derive(Clone, Copy, Debug)]
struct Inner {
    base_rt_ns: i64,
    base_mono_ns: i64,
    ref_at_anchor_ns: i64,
    freq_bias_ppm: f64,
    phase_residual_ns: i64,
    slew_rate_ppm: f64,
    tai_offset_s: i32,
}

/// Read-only snapshot used for CSV rows and status queries.
#[derive(Clone, Copy, Debug)]
pub struct TimebaseSnapshot {
    pub base_rt_ns: i64,
    pub base_mono_ns: i64,
    pub freq_bias_ppm: f64,
    pub phase_residual_ns: i64,
    pub slew_rate_ppm: f64,
    pub tai_offset_s: i32,
}

struct Extrapolation {
    rt_ns: i64,
    mono_ns: i64,
    remaining_residual_ns: i64,
}

fn extrapolate(inner: &Inner, now_ref_ns: i64) -> Extrapolation {
    let elapsed = (now_ref_ns - inner.ref_at_anchor_ns).max(0);
    let advanced = (elapsed as f64 * (1.0 + inner.freq_bias_ppm * 1e-6)).round() as i64;

    let max_consume = (elapsed as f64 * inner.slew_rate_ppm.abs() * 1e-6).round() as i64;
    let residual = inner.phase_residual_ns;
    let consumed = match residual.cmp(&0) {
        std::cmp::Ordering::Greater => max_consume.min(residual),
        std::cmp::Ordering::Less => -(max_consume.min(-residual)),
        std::cmp::Ordering::Equal => 0,
    };

    Extrapolation {
        rt_ns: inner.base_rt_ns + advanced + consumed,
        mono_ns: inner.base_mono_ns + advanced + consumed,
        remaining_residual_ns: residual - consumed,
    }
}

fn reanchor(inner: &mut Inner, now_ref_ns: i64) {
    let ex = extrapolate(inner, now_ref_ns);
    inner.base_rt_ns = ex.rt_ns;
    inner.base_mono_ns = ex.mono_ns;
    inner.phase_residual_ns = ex.remaining_residual_ns;
    inner.ref_at_anchor_ns = now_ref_ns;
}

/// The synthetic timebase. Cheap to snapshot under its lock; all the
/// arithmetic happens outside the critical section in the caller.
pub struct Timebase {
    inner: Mutex<Inner>,
}

impl Timebase {
    /// Anchors the timebase to the current wall-clock time, with the
    /// reference clock's current reading as the monotonic anchor.
    pub fn new(now_ref_ns: i64, tai_offset_s: i32) -> Self {
        let base_rt_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self {
            inner: Mutex::new(Inner {
                base_rt_ns,
                base_mono_ns: 0,
                ref_at_anchor_ns: now_ref_ns,
                freq_bias_ppm: 0.0,
                phase_residual_ns: 0,
                slew_rate_ppm: 0.0,
                tai_offset_s,
            }),
        }
    }

    /// `gettime(clock_id)`, spec.md §4.B.
    pub fn gettime(&self, id: ClockId, now_ref_ns: i64) -> i64 {
        if id == ClockId::MonotonicRaw {
            return now_ref_ns;
        }
        let inner = *self.inner.lock().unwrap();
        let ex = extrapolate(&inner, now_ref_ns);
        match id {
            ClockId::Realtime => ex.rt_ns,
            ClockId::Monotonic => ex.mono_ns,
            ClockId::MonotonicRaw => unreachable!(),
        }
    }

    /// `set_frequency(ppm)`, spec.md §4.B. Returns the clamped value that
    /// was actually applied.
    pub fn set_frequency(&self, ppm: f64, now_ref_ns: i64) -> f64 {
        let clamped = ppm.clamp(-MAX_PPM, MAX_PPM);
        let mut inner = self.inner.lock().unwrap();
        reanchor(&mut inner, now_ref_ns);
        inner.freq_bias_ppm = clamped;
        clamped
    }

    pub fn frequency_ppm(&self) -> f64 {
        self.inner.lock().unwrap().freq_bias_ppm
    }

    /// `step(delta_ns)`, spec.md §4.B: a discontinuous realtime step.
    pub fn step(&self, delta_ns: i64, now_ref_ns: i64) {
        let mut inner = self.inner.lock().unwrap();
        reanchor(&mut inner, now_ref_ns);
        inner.base_rt_ns += delta_ns;
    }

    /// `begin_slew(phase_ns)`, spec.md §4.B: additive, never collapses a
    /// prior in-progress slew.
    pub fn begin_slew(&self, phase_ns: i64, slew_rate_ppm: f64, now_ref_ns: i64) {
        let mut inner = self.inner.lock().unwrap();
        reanchor(&mut inner, now_ref_ns);
        inner.phase_residual_ns += phase_ns;
        inner.slew_rate_ppm = slew_rate_ppm;
    }

    /// Commits the slew consumption accrued since the timebase was last
    /// anchored. Called once per poll tick (component F, step 3). Returns
    /// `(consumed_ns, residual_reached_zero)`.
    pub fn advance_slew(&self, now_ref_ns: i64) -> (i64, bool) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.phase_residual_ns;
        reanchor(&mut inner, now_ref_ns);
        let consumed = before - inner.phase_residual_ns;
        (consumed, inner.phase_residual_ns == 0 && before != 0)
    }

    pub fn phase_residual_ns(&self) -> i64 {
        self.inner.lock().unwrap().phase_residual_ns
    }

    pub fn set_tai_offset_s(&self, tai_s: i32) {
        self.inner.lock().unwrap().tai_offset_s = tai_s;
    }

    pub fn tai_offset_s(&self) -> i32 {
        self.inner.lock().unwrap().tai_offset_s
    }

    pub fn snapshot(&self) -> TimebaseSnapshot {
        let inner = *self.inner.lock().unwrap();
        TimebaseSnapshot {
            base_rt_ns: inner.base_rt_ns,
            base_mono_ns: inner.base_mono_ns,
            freq_bias_ppm: inner.freq_bias_ppm,
            phase_residual_ns: inner.phase_residual_ns,
            slew_rate_ppm: inner.slew_rate_ppm,
            tai_offset_s: inner.tai_offset_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_gettime_never_regresses() {
        let tb = Timebase::new(0, 37);
        let a = tb.gettime(ClockId::Monotonic, 1_000_000);
        let b = tb.gettime(ClockId::Monotonic, 2_000_000);
        assert!(b >= a);
    }

    #[test]
    fn set_frequency_clamps_to_max_ppm() {
        let tb = Timebase::new(0, 37);
        let applied = tb.set_frequency(10_000.0, 0);
        assert_eq!(applied, MAX_PPM);
        assert_eq!(tb.frequency_ppm(), MAX_PPM);

        let applied = tb.set_frequency(-10_000.0, 0);
        assert_eq!(applied, -MAX_PPM);
    }

    #[test]
    fn frequency_change_introduces_no_discontinuity() {
        let tb = Timebase::new(0, 37);
        let before = tb.gettime(ClockId::Realtime, 5_000_000);
        tb.set_frequency(50.0, 5_000_000);
        let after = tb.gettime(ClockId::Realtime, 5_000_000);
        assert_eq!(before, after);
    }

    #[test]
    fn step_applies_signed_delta() {
        let tb = Timebase::new(0, 37);
        let before = tb.gettime(ClockId::Realtime, 0);
        tb.step(100_000_000, 0);
        let after = tb.gettime(ClockId::Realtime, 0);
        assert_eq!(after - before, 100_000_000);
    }

    #[test]
    fn slew_residual_monotonically_decreases_in_magnitude() {
        let tb = Timebase::new(0, 37);
        tb.begin_slew(1_000_000, 500.0, 0);
        let mut prev = tb.phase_residual_ns().abs();
        let mut t = 0i64;
        for _ in 0..50 {
            t += 10_000_000;
            let (_, _done) = tb.advance_slew(t);
            let now = tb.phase_residual_ns().abs();
            assert!(now <= prev);
            prev = now;
        }
        assert_eq!(tb.phase_residual_ns(), 0);
    }

    #[test]
    fn monotonic_raw_is_a_pure_passthrough() {
        let tb = Timebase::new(0, 37);
        assert_eq!(tb.gettime(ClockId::MonotonicRaw, 123_456), 123_456);
        tb.set_frequency(100.0, 0);
        assert_eq!(tb.gettime(ClockId::MonotonicRaw, 999), 999);
    }
}
