//! PI Servo (component C): drives residual phase error toward zero via a
//! frequency correction, with anti-windup and output clamping.
//!
//! Grounded on the Axia-style PI controller in
//! `casterplay/BassAES67`'s `ClockServo` (proportional/integral gains,
//! output clamp, lock/unlock hysteresis), adapted from its fixed-size
//! sample-batch form to a continuous `(phase_error_s, dt_s)` update.

use super::Servo;
use crate::consts::{KI_PPM_PER_S2, KP_PPM_PER_S, MAX_PPM};

/// Consecutive in-threshold samples required to call the servo "locked".
const LOCK_STREAK: u32 = 3;
/// Consecutive out-of-threshold samples required to call it "unlocked".
const UNLOCK_STREAK: u32 = 5;
/// Phase error (seconds) above which the servo auto-enables if it was
/// dormant, per spec.md §4.C's state machine.
const AUTO_ENABLE_THRESHOLD_S: f64 = 1e-3;

pub struct PiServo {
    kp_ppm_per_s: f64,
    ki_ppm_per_s2: f64,
    integ_error_s: f64,
    last_freq_ppm: f64,
    enabled: bool,
    last_clamped: bool,
    samples_in_lock: u32,
    samples_out_of_lock: u32,
    locked: bool,
}

impl PiServo {
    pub fn new(kp_ppm_per_s: f64, ki_ppm_per_s2: f64) -> Self {
        Self {
            kp_ppm_per_s,
            ki_ppm_per_s2,
            integ_error_s: 0.0,
            last_freq_ppm: 0.0,
            enabled: false,
            last_clamped: false,
            samples_in_lock: 0,
            samples_out_of_lock: 0,
            locked: false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn update_lock_state(&mut self, phase_error_s: f64) {
        if phase_error_s.abs() * 1e9 < crate::consts::PHASE_EPSILON_NS as f64 {
            self.samples_in_lock += 1;
            self.samples_out_of_lock = 0;
            if self.samples_in_lock >= LOCK_STREAK {
                self.locked = true;
            }
        } else {
            self.samples_in_lock = 0;
            if self.locked {
                self.samples_out_of_lock += 1;
                if self.samples_out_of_lock >= UNLOCK_STREAK {
                    self.locked = false;
                    self.samples_out_of_lock = 0;
                }
            }
        }
    }
}

impl Default for PiServo {
    fn default() -> Self {
        Self::new(KP_PPM_PER_S, KI_PPM_PER_S2)
    }
}

impl Servo for PiServo {
    fn update(&mut self, phase_error_s: f64, dt_s: f64) -> f64 {
        if !self.enabled && phase_error_s.abs() >= AUTO_ENABLE_THRESHOLD_S {
            self.enabled = true;
        }

        // 1. Accumulate and clamp the integral so `ki * integ` alone can
        //    never exceed MAX_PPM (anti-windup).
        self.integ_error_s += phase_error_s * dt_s;
        let integ_cap_s = MAX_PPM / self.ki_ppm_per_s2;
        self.integ_error_s = self.integ_error_s.clamp(-integ_cap_s, integ_cap_s);

        // 2. Proportional + integral.
        let u = self.kp_ppm_per_s * phase_error_s + self.ki_ppm_per_s2 * self.integ_error_s;

        // 3. Clamp output; do not credit the clamped excess back into the
        //    integrator (back-calculation).
        let clamped = u.clamp(-MAX_PPM, MAX_PPM);
        self.last_clamped = clamped != u;

        self.last_freq_ppm = clamped;
        if self.enabled {
            self.update_lock_state(phase_error_s);
        }
        clamped
    }

    fn last_output_ppm(&self) -> f64 {
        self.last_freq_ppm
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    /// Whether the previous `update` clamped its output (drives the
    /// `FREQUENCY_CLAMP` event, spec.md §4.C).
    fn last_clamped(&self) -> bool {
        self.last_clamped
    }

    fn reset(&mut self) {
        self.integ_error_s = 0.0;
        self.last_freq_ppm = 0.0;
        self.last_clamped = false;
        self.samples_in_lock = 0;
        self.samples_out_of_lock = 0;
        self.locked = false;
    }

    fn nudge_phase(&mut self, offset_s: f64) {
        let integ_cap_s = MAX_PPM / self.ki_ppm_per_s2;
        self.integ_error_s = (self.integ_error_s + offset_s).clamp(-integ_cap_s, integ_cap_s);
    }

    fn integral_error_s(&self) -> f64 {
        self.integ_error_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// For any phase error and positive dt, a single `update` call's
        /// output is always within `[-MAX_PPM, MAX_PPM]` (spec.md §8's
        /// clamp-idempotence law: clamping an already-clamped value is a
        /// no-op).
        #[test]
        fn update_output_is_always_within_clamp_bounds(
            phase_error_s in -10.0f64..10.0,
            dt_s in 0.001f64..2.0,
        ) {
            let mut servo = PiServo::default();
            let u = servo.update(phase_error_s, dt_s);
            prop_assert!(u.abs() <= MAX_PPM);
            prop_assert!(u.clamp(-MAX_PPM, MAX_PPM) == u);
        }
    }

    #[test]
    fn output_never_exceeds_max_ppm() {
        let mut servo = PiServo::default();
        let u = servo.update(10.0, 1.0);
        assert!(u.abs() <= MAX_PPM);
        assert!(servo.last_clamped());
    }

    #[test]
    fn zero_error_converges_to_zero_output() {
        let mut servo = PiServo::default();
        for _ in 0..1000 {
            servo.update(0.0, 0.01);
        }
        assert_eq!(servo.last_output_ppm(), 0.0);
    }

    #[test]
    fn integrator_is_bounded_by_anti_windup_cap() {
        let mut servo = PiServo::default();
        for _ in 0..100_000 {
            servo.update(1.0, 1.0);
        }
        let u = servo.update(1.0, 1.0);
        assert!(u.abs() <= MAX_PPM);
    }

    #[test]
    fn auto_enables_above_threshold() {
        let mut servo = PiServo::default();
        assert!(!servo.enabled());
        servo.update(0.01, 0.01);
        assert!(servo.enabled());
    }

    #[test]
    fn locks_after_consecutive_in_threshold_samples() {
        let mut servo = PiServo::default();
        servo.enable();
        for _ in 0..LOCK_STREAK {
            servo.update(0.0, 0.01);
        }
        assert!(servo.is_locked());
    }

    #[test]
    fn nudge_phase_moves_the_integrator_and_is_clamped() {
        let mut servo = PiServo::default();
        servo.nudge_phase(1e-3);
        let u = servo.update(0.0, 0.01);
        assert!(u > 0.0);

        let integ_cap_s = MAX_PPM / KI_PPM_PER_S2;
        servo.nudge_phase(1e6);
        servo.update(0.0, 0.0);
        assert!(servo.integ_error_s <= integ_cap_s);
    }
}
