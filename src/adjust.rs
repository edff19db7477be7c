//! Adjustment Router (component E): a timex-compatible request/reply
//! surface that dispatches onto the [`Timebase`][crate::timebase::Timebase].
//!
//! Grounded on `pendulum-project/clock-steering`'s `UnixClock` (the
//! `libc::timex` field layout and its ppm/scaled-ppm conversions) and on
//! the mode-mask idiom from `marcfir/linux-rt`'s use of `bitflags!` for
//! kernel-facing flag sets.

use bitflags::bitflags;

use crate::consts::PPM_SCALE;
use crate::error::{Error, Result};
use crate::timebase::Timebase;

bitflags! {
    /// Mirrors the subset of `timex.modes` this router understands.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Modes: u32 {
        const OFFSET    = 0x0001;
        const FREQUENCY = 0x0002;
        const MAXERROR  = 0x0004;
        const ESTERROR  = 0x0008;
        const STATUS    = 0x0010;
        const TIMECONST = 0x0020;
        const TAI       = 0x0080;
        const SETOFFSET = 0x0100;
        const NANO      = 0x2000;
        const MICRO     = 0x4000;
        const TICK      = 0x4000_0000;
    }
}

bitflags! {
    /// Mirrors `timex.status` (`STA_*`). These bits are accepted and
    /// reflected back verbatim; none of them currently change behavior
    /// (spec.md §4.E: "accept and reflect" rather than strict rejection).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Status: u32 {
        const PLL        = 0x0001;
        const PPSFREQ    = 0x0002;
        const PPSTIME    = 0x0004;
        const FLL        = 0x0008;
        const INS        = 0x0010;
        const DEL        = 0x0020;
        const UNSYNC     = 0x0040;
        const FREQHOLD   = 0x0080;
        const NANO       = 0x2000;
    }
}

/// A single adjustment request, one field per `timex` member this router
/// understands. Unset fields are `None` / not requested via `modes`.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdjustRequest {
    pub modes: Modes,
    /// Seconds component of the requested `ADJ_OFFSET`/`ADJ_SETOFFSET`
    /// time step (spec.md: `time_step = sec + subsec`). Unconstrained —
    /// only `offset_subsec` is range-checked.
    pub offset_sec: i64,
    /// Subsecond component, in nanoseconds if `modes.contains(NANO)` else
    /// microseconds; must satisfy `|offset_subsec| < 1_000_000` in
    /// microsecond mode.
    pub offset_subsec: i64,
    /// Scaled ppm, i.e. `ppm * 2^16`, per the timex wire convention.
    pub freq_scaled: i64,
    pub maxerror_us: i64,
    pub esterror_us: i64,
    pub status: Status,
    pub timeconst: i64,
    pub tai_s: i32,
}

/// Side effects of an `adjust()` call that only the caller (which owns a
/// ring) can turn into events — `AdjustRouter` itself has no ring access.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdjustSideEffects {
    /// Set to the nudge, in seconds, when `ADJ_OFFSET` began a nonzero
    /// slew — the trigger for a `PHASE_SLEW_START` event.
    pub slew_begun_s: Option<f64>,
    /// Set to `(requested_ppm, applied_ppm)` when `ADJ_FREQUENCY`'s
    /// requested magnitude exceeded `MAX_PPM` and was clamped — the
    /// trigger for a `FREQUENCY_CLAMP` event.
    pub freq_clamped: Option<(f64, f64)>,
}

/// The router's reply: the clock's state after applying the request,
/// in the same units `adjtimex(2)` returns.
#[derive(Clone, Copy, Debug)]
pub struct AdjustReply {
    pub offset_ns: i64,
    pub freq_scaled: i64,
    pub maxerror_us: i64,
    pub esterror_us: i64,
    pub status: Status,
    pub tai_s: i32,
    /// `TIME_OK`-style discipline state; always `0` (synchronized) once a
    /// slew or frequency correction has ever been applied.
    pub state: i32,
}

/// Bits this router recognizes at all. Any mask bit outside this set is
/// an "unknown bit" for the purposes of strict-mode rejection.
const KNOWN_BITS: u32 = Modes::OFFSET.bits()
    | Modes::FREQUENCY.bits()
    | Modes::MAXERROR.bits()
    | Modes::ESTERROR.bits()
    | Modes::STATUS.bits()
    | Modes::TIMECONST.bits()
    | Modes::TAI.bits()
    | Modes::SETOFFSET.bits()
    | Modes::NANO.bits()
    | Modes::MICRO.bits()
    | Modes::TICK.bits();

/// Combines a `time_step = sec + subsec` pair into nanoseconds, bounding
/// only the subsecond component the way `timex` leaves `tv_sec`
/// unconstrained (spec.md §4.E) — a multi-second offset in microsecond
/// mode is not an overflow, only `|offset_subsec| >= 1_000_000` is.
fn offset_ns(modes: Modes, offset_sec: i64, offset_subsec: i64, err_msg: &'static str) -> Result<i64> {
    let subsec_ns = if modes.contains(Modes::NANO) {
        offset_subsec
    } else {
        if offset_subsec.unsigned_abs() >= 1_000_000 {
            return Err(Error::InvalidArgument(err_msg));
        }
        offset_subsec * 1_000
    };
    Ok(offset_sec * 1_000_000_000 + subsec_ns)
}

pub struct AdjustRouter {
    status: Status,
    maxerror_us: i64,
    esterror_us: i64,
    timeconst: i64,
    ever_disciplined: bool,
    /// spec.md §4.E: "any unknown bits when a strict-mode toggle is set"
    /// are rejected; off by default, matching the permissive default the
    /// rest of the router already takes toward STATUS bits.
    strict: bool,
}

impl AdjustRouter {
    pub fn new() -> Self {
        Self::with_strict(false)
    }

    pub fn with_strict(strict: bool) -> Self {
        Self {
            status: Status::UNSYNC,
            maxerror_us: 16_000_000,
            esterror_us: 0,
            timeconst: 2,
            ever_disciplined: false,
            strict,
        }
    }

    /// Applies `req` to `tb` and returns the post-adjustment state, the
    /// way a single `adjtimex(2)` call does. `nudge_phase_s`, if any, is
    /// how much an `ADJ_OFFSET` command should additionally nudge the
    /// active servo's phase-error input (spec.md §4.E: "the PI servo's
    /// phase-error input is simultaneously nudged by the same amount").
    pub fn adjust(
        &mut self,
        tb: &Timebase,
        req: &AdjustRequest,
        now_ref_ns: i64,
    ) -> Result<(AdjustReply, AdjustSideEffects)> {
        // TIMECONST and TICK are rejected outright; unknown bits only
        // under strict mode (spec.md §4.E).
        if req.modes.contains(Modes::TIMECONST) {
            return Err(Error::InvalidArgument("ADJ_TIMECONST is not supported"));
        }
        if req.modes.contains(Modes::TICK) {
            return Err(Error::InvalidArgument("ADJ_TICK is not supported"));
        }
        if self.strict && (req.modes.bits() & !KNOWN_BITS) != 0 {
            return Err(Error::InvalidArgument(
                "unrecognized modes bit set under strict mode",
            ));
        }

        let mut effects = AdjustSideEffects::default();

        if req.modes.contains(Modes::SETOFFSET) {
            self.apply_setoffset(tb, req, now_ref_ns)?;
        } else if req.modes.contains(Modes::OFFSET) {
            effects.slew_begun_s = self.apply_offset(tb, req, now_ref_ns)?;
        }

        if req.modes.contains(Modes::FREQUENCY) {
            let ppm = req.freq_scaled as f64 / PPM_SCALE;
            let applied = tb.set_frequency(ppm, now_ref_ns);
            if (applied - ppm).abs() > f64::EPSILON {
                effects.freq_clamped = Some((ppm, applied));
            }
            self.ever_disciplined = true;
        }

        if req.modes.contains(Modes::TAI) {
            tb.set_tai_offset_s(req.tai_s);
        }

        if req.modes.contains(Modes::MAXERROR) {
            self.maxerror_us = req.maxerror_us;
        }

        if req.modes.contains(Modes::ESTERROR) {
            self.esterror_us = req.esterror_us;
        }

        if req.modes.contains(Modes::STATUS) {
            self.status = req.status;
        }

        Ok((self.reply(tb, now_ref_ns), effects))
    }

    pub fn maxerror_us(&self) -> i64 {
        self.maxerror_us
    }

    pub fn esterror_us(&self) -> i64 {
        self.esterror_us
    }

    pub fn timeconst(&self) -> i64 {
        self.timeconst
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// `ADJ_OFFSET` is a no-op at zero: no slew, no nudge, no event
    /// (spec.md §8 boundary behavior).
    fn apply_offset(
        &mut self,
        tb: &Timebase,
        req: &AdjustRequest,
        now_ref_ns: i64,
    ) -> Result<Option<f64>> {
        let offset_ns = offset_ns(
            req.modes,
            req.offset_sec,
            req.offset_subsec,
            "microsecond ADJ_OFFSET must satisfy |usec| < 1_000_000",
        )?;
        if offset_ns == 0 {
            return Ok(None);
        }
        // A gradual slew, not a discontinuous step (spec.md §4.E).
        tb.begin_slew(offset_ns, crate::consts::DEFAULT_SLEW_RATE_PPM, now_ref_ns);
        self.ever_disciplined = true;
        Ok(Some(offset_ns as f64 / 1e9))
    }

    fn apply_setoffset(
        &mut self,
        tb: &Timebase,
        req: &AdjustRequest,
        now_ref_ns: i64,
    ) -> Result<()> {
        // ADJ_SETOFFSET carries a seconds/subsecond pair in whichever unit
        // NANO/MICRO selects; only the subsecond component is bounded, the
        // way `timex.time.tv_sec`/`tv_usec` leave `tv_sec` unconstrained.
        let offset_ns = offset_ns(
            req.modes,
            req.offset_sec,
            req.offset_subsec,
            "microsecond ADJ_SETOFFSET must satisfy |usec| < 1_000_000",
        )?;
        tb.step(offset_ns, now_ref_ns);
        self.ever_disciplined = true;
        Ok(())
    }

    fn reply(&self, tb: &Timebase, _now_ref_ns: i64) -> AdjustReply {
        AdjustReply {
            offset_ns: tb.phase_residual_ns(),
            freq_scaled: (tb.frequency_ppm() * PPM_SCALE).round() as i64,
            maxerror_us: self.maxerror_us,
            esterror_us: self.esterror_us,
            status: self.status,
            tai_s: tb.tai_offset_s(),
            state: if self.ever_disciplined { 0 } else { 1 },
        }
    }
}

impl Default for AdjustRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any ppm value within the servo's clamp range survives a
        /// scaled-ppm encode/decode round trip (spec.md §8's scaled-ppm
        /// law) to within the precision `PPM_SCALE` affords.
        #[test]
        fn scaled_ppm_round_trips(ppm in -200.0f64..=200.0) {
            let scaled = (ppm * PPM_SCALE).round() as i64;
            let decoded = scaled as f64 / PPM_SCALE;
            prop_assert!((decoded - ppm).abs() < 1e-6);
        }

        /// Routing an arbitrary in-range ppm value through
        /// `AdjustRouter::adjust` and back out via `reply` reproduces the
        /// same scaled value that was requested.
        #[test]
        fn frequency_adjust_round_trips_through_the_router(ppm in -200.0f64..=200.0) {
            let tb = Timebase::new(0, 37);
            let mut router = AdjustRouter::new();
            let req = AdjustRequest {
                modes: Modes::FREQUENCY,
                freq_scaled: (ppm * PPM_SCALE).round() as i64,
                ..Default::default()
            };
            let (reply, _) = router.adjust(&tb, &req, 0).unwrap();
            prop_assert_eq!(reply.freq_scaled, req.freq_scaled);
        }
    }

    #[test]
    fn frequency_request_decodes_scaled_ppm() {
        let tb = Timebase::new(0, 37);
        let mut router = AdjustRouter::new();
        let req = AdjustRequest {
            modes: Modes::FREQUENCY,
            freq_scaled: (50.0 * PPM_SCALE) as i64,
            ..Default::default()
        };
        let (reply, effects) = router.adjust(&tb, &req, 0).unwrap();
        assert_eq!(reply.freq_scaled, (50.0 * PPM_SCALE) as i64);
        assert_eq!(tb.frequency_ppm(), 50.0);
        assert!(effects.slew_begun_s.is_none());
    }

    #[test]
    fn microsecond_offset_rejects_out_of_range_usec() {
        let tb = Timebase::new(0, 37);
        let mut router = AdjustRouter::new();
        let req = AdjustRequest {
            modes: Modes::OFFSET,
            offset_subsec: 1_000_000,
            ..Default::default()
        };
        assert!(router.adjust(&tb, &req, 0).is_err());
    }

    #[test]
    fn nanosecond_offset_accepts_full_range() {
        let tb = Timebase::new(0, 37);
        let mut router = AdjustRouter::new();
        let req = AdjustRequest {
            modes: Modes::OFFSET | Modes::NANO,
            offset_subsec: 999_999_999,
            ..Default::default()
        };
        assert!(router.adjust(&tb, &req, 0).is_ok());
    }

    #[test]
    fn multi_second_offset_in_microsecond_mode_is_accepted() {
        // offset_sec is unconstrained; only offset_subsec's magnitude is
        // bounded to a single microsecond mode's worth of range.
        let tb = Timebase::new(0, 37);
        let mut router = AdjustRouter::new();
        let req = AdjustRequest {
            modes: Modes::OFFSET | Modes::MICRO,
            offset_sec: 5,
            offset_subsec: 500,
            ..Default::default()
        };
        let (_, effects) = router.adjust(&tb, &req, 0).unwrap();
        assert_eq!(tb.phase_residual_ns(), 5_000_500_000);
        assert!(effects.slew_begun_s.is_some());
    }

    #[test]
    fn tai_mode_updates_timebase() {
        let tb = Timebase::new(0, 37);
        let mut router = AdjustRouter::new();
        let req = AdjustRequest {
            modes: Modes::TAI,
            tai_s: 38,
            ..Default::default()
        };
        router.adjust(&tb, &req, 0).unwrap();
        assert_eq!(tb.tai_offset_s(), 38);
    }

    #[test]
    fn status_bits_are_reflected_not_rejected() {
        let tb = Timebase::new(0, 37);
        let mut router = AdjustRouter::new();
        let req = AdjustRequest {
            modes: Modes::STATUS,
            status: Status::PLL | Status::FLL,
            ..Default::default()
        };
        let (reply, _) = router.adjust(&tb, &req, 0).unwrap();
        assert_eq!(reply.status, Status::PLL | Status::FLL);
    }

    #[test]
    fn offset_slews_rather_than_steps() {
        let tb = Timebase::new(0, 37);
        let mut router = AdjustRouter::new();
        let before = tb.gettime(crate::timebase::ClockId::Realtime, 0);
        let req = AdjustRequest {
            modes: Modes::OFFSET | Modes::MICRO,
            offset_subsec: 1_000,
            ..Default::default()
        };
        let (_, effects) = router.adjust(&tb, &req, 0).unwrap();
        // A slew does not move gettime() instantaneously the way step()
        // would; the residual is drained gradually by the poll loop.
        let after = tb.gettime(crate::timebase::ClockId::Realtime, 0);
        assert_eq!(before, after);
        assert_eq!(tb.phase_residual_ns(), 1_000_000);
        assert!(effects.slew_begun_s.is_some());
    }

    #[test]
    fn zero_offset_is_a_no_op() {
        let tb = Timebase::new(0, 37);
        let mut router = AdjustRouter::new();
        let req = AdjustRequest {
            modes: Modes::OFFSET | Modes::NANO,
            offset_subsec: 0,
            ..Default::default()
        };
        let (_, effects) = router.adjust(&tb, &req, 0).unwrap();
        assert_eq!(tb.phase_residual_ns(), 0);
        assert!(effects.slew_begun_s.is_none());
    }

    #[test]
    fn setoffset_usec_overflow_is_rejected() {
        let tb = Timebase::new(0, 37);
        let mut router = AdjustRouter::new();
        let req = AdjustRequest {
            modes: Modes::SETOFFSET | Modes::MICRO,
            offset_subsec: 1_000_000,
            ..Default::default()
        };
        assert!(router.adjust(&tb, &req, 0).is_err());
    }

    #[test]
    fn timeconst_and_tick_are_rejected() {
        let tb = Timebase::new(0, 37);
        let mut router = AdjustRouter::new();
        let req = AdjustRequest {
            modes: Modes::TIMECONST,
            timeconst: 2,
            ..Default::default()
        };
        assert!(router.adjust(&tb, &req, 0).is_err());

        let req = AdjustRequest {
            modes: Modes::TICK,
            ..Default::default()
        };
        assert!(router.adjust(&tb, &req, 0).is_err());
    }

    #[test]
    fn unknown_bits_rejected_only_under_strict_mode() {
        let tb = Timebase::new(0, 37);
        let unknown = Modes::from_bits_retain(0x8000);
        let req = AdjustRequest {
            modes: unknown,
            ..Default::default()
        };

        let mut lenient = AdjustRouter::new();
        assert!(lenient.adjust(&tb, &req, 0).is_ok());

        let mut strict = AdjustRouter::with_strict(true);
        assert!(strict.adjust(&tb, &req, 0).is_err());
    }
}
