//! EKF Servo (component D): a two-state (offset, drift) Kalman filter
//! disciplining estimate, with innovation gating and holdover decay.
//!
//! Grounded on the estimator/track split in
//! `vsrinivas/fuchsia`'s `timekeeper::clock_manager` (`Estimator`, `Track`,
//! rate-correction constants) and the gain-clamping discipline common to
//! the PTP controllers in the pack (`zbynekdrlik/dantesync`'s
//! `PtpController`), adapted to this crate's scalar phase-error input.

use super::Servo;
use crate::consts::MAX_PPM;

/// Process noise on offset, s^2 per second of prediction.
const Q_OFFSET: f64 = 1e-18;
/// Process noise on drift, (s/s)^2 per second of prediction.
const Q_DRIFT: f64 = 1e-22;
/// Floor of the measurement noise, s^2.
const R_FLOOR: f64 = 1e-12;
/// `R_eff` inflation applied per consecutive missed (gated-out) sample.
const R_INFLATE_PER_MISS: f64 = 4.0;
/// Soft-gate threshold, in innovation standard deviations.
const SOFT_GATE_SIGMA: f64 = 3.5;
/// Hard-gate threshold: innovations beyond this are rejected outright.
const HARD_GATE_SIGMA: f64 = 4.5;
/// Drift is decayed by this factor on a gap or after `DECAY_PERIOD` updates.
const DRIFT_DECAY: f64 = 0.998;
const DECAY_PERIOD: u32 = 80;
/// EWMA weight for the quantization-noise floor tracker.
const QUANT_EWMA_ALPHA: f64 = 0.05;
/// EWMA weight for the inter-sample `dt` tracker used for gap detection.
const DT_EWMA_ALPHA: f64 = 0.1;
/// A sample whose `dt` exceeds this multiple of the running `dt` EWMA is
/// treated as following a missed-sample gap (spec.md §4.D step 3).
const GAP_DT_MULTIPLIER: f64 = 1.8;
/// Ceiling on `R_eff` inflation while a gap is active, as a multiple of
/// the nominal (non-inflated) measurement noise.
const MAX_R_INFLATION: f64 = 30.0;

pub struct EkfServo {
    offset_s: f64,
    drift_s_per_s: f64,
    /// Covariance, row-major 2x2: `[[p00, p01], [p10, p11]]`.
    p: [[f64; 2]; 2],
    quant_floor_s: f64,
    last_measurement_s: Option<f64>,
    dt_ewma_s: f64,
    gap_active: bool,
    updates_since_decay: u32,
    enabled: bool,
    last_output_ppm: f64,
    last_clamped: bool,
}

impl EkfServo {
    pub fn new() -> Self {
        Self {
            offset_s: 0.0,
            drift_s_per_s: 0.0,
            p: [[1e-6, 0.0], [0.0, 1e-12]],
            quant_floor_s: R_FLOOR.sqrt(),
            last_measurement_s: None,
            dt_ewma_s: 0.0,
            gap_active: false,
            updates_since_decay: 0,
            enabled: false,
            last_output_ppm: 0.0,
            last_clamped: false,
        }
    }

    /// Clamps `raw` to `±MAX_PPM`, recording whether that clamp changed
    /// the value so `last_clamped()` can drive the `FREQUENCY_CLAMP`
    /// event the same way the PI servo does.
    fn clamp_output(&mut self, raw: f64) -> f64 {
        let clamped = raw.clamp(-MAX_PPM, MAX_PPM);
        self.last_clamped = clamped != raw;
        self.last_output_ppm = clamped;
        clamped
    }

    pub fn offset_s(&self) -> f64 {
        self.offset_s
    }

    pub fn drift_ppm(&self) -> f64 {
        self.drift_s_per_s * 1e6
    }

    fn predict(&mut self, dt_s: f64) {
        // F = [[1, dt], [0, 1]]; P' = F P F^T + Q*dt.
        self.offset_s += self.drift_s_per_s * dt_s;

        let p00 = self.p[0][0] + dt_s * (self.p[1][0] + self.p[0][1]) + dt_s * dt_s * self.p[1][1];
        let p01 = self.p[0][1] + dt_s * self.p[1][1];
        let p10 = self.p[1][0] + dt_s * self.p[1][1];
        let p11 = self.p[1][1];

        self.p = [
            [p00 + Q_OFFSET * dt_s, p01],
            [p10, p11 + Q_DRIFT * dt_s],
        ];
    }

    fn r_eff(&self) -> f64 {
        let nominal = R_FLOOR + self.quant_floor_s * self.quant_floor_s;
        if self.gap_active {
            (nominal * R_INFLATE_PER_MISS).min(nominal * MAX_R_INFLATION)
        } else {
            nominal
        }
    }

    fn decay_drift(&mut self) {
        self.drift_s_per_s *= DRIFT_DECAY;
        self.updates_since_decay = 0;
    }

    /// Updates the `dt` EWMA and returns whether this sample follows a
    /// missed-sample gap (spec.md §4.D step 3: `dt > 1.8 * ewma(dt)`).
    fn detect_gap(&mut self, dt_s: f64) -> bool {
        if self.dt_ewma_s <= 0.0 {
            self.dt_ewma_s = dt_s;
            return false;
        }
        let gap = dt_s > GAP_DT_MULTIPLIER * self.dt_ewma_s;
        self.dt_ewma_s = (1.0 - DT_EWMA_ALPHA) * self.dt_ewma_s + DT_EWMA_ALPHA * dt_s;
        gap
    }
}

impl Default for EkfServo {
    fn default() -> Self {
        Self::new()
    }
}

impl Servo for EkfServo {
    fn update(&mut self, phase_error_s: f64, dt_s: f64) -> f64 {
        if !self.enabled {
            self.enabled = true;
        }

        let dt_s = dt_s.max(0.0);
        self.gap_active = self.detect_gap(dt_s);
        self.predict(dt_s);

        // Treat `phase_error_s` (the poll loop's running error) as the
        // raw measurement `z_k` for the quantization-floor tracker.
        if let Some(prev) = self.last_measurement_s {
            let step = (phase_error_s - prev).abs();
            self.quant_floor_s =
                (1.0 - QUANT_EWMA_ALPHA) * self.quant_floor_s + QUANT_EWMA_ALPHA * step;
        }
        self.last_measurement_s = Some(phase_error_s);

        let r_eff = self.r_eff();
        let innovation = phase_error_s - self.offset_s;
        let s = self.p[0][0] + r_eff;
        let sigma = s.sqrt();
        let gate = if self.gap_active {
            HARD_GATE_SIGMA
        } else {
            SOFT_GATE_SIGMA
        };

        // spec.md §4.D step 4: innovations outside the gate are never
        // rejected outright, only gain-scaled down by `gate/n_sigma` so a
        // genuine outlier still nudges the estimate, just a lot less.
        let n_sigma = if sigma > 0.0 { innovation.abs() / sigma } else { 0.0 };
        let gain_scale = if n_sigma > gate {
            (gate / n_sigma).min(1.0)
        } else {
            1.0
        };

        let mut k0 = (self.p[0][0] / s) * gain_scale;
        let mut k1 = (self.p[1][0] / s) * gain_scale;

        let k0_max = if innovation >= 0.0 { 0.45 } else { 0.60 };
        k0 = k0.clamp(0.0, k0_max);
        k1 = k1.clamp(0.0, 0.25);

        // Offset-first update: apply the offset correction, then
        // recompute the innovation against the corrected offset before
        // crediting drift (spec.md §4.D step 6).
        self.offset_s += k0 * innovation;
        let innovation_prime = phase_error_s - self.offset_s;
        self.drift_s_per_s += k1 * innovation_prime;

        // Joseph-form-light covariance update: P = (I - K H) P.
        let p00 = self.p[0][0];
        let p01 = self.p[0][1];
        self.p[0][0] = (1.0 - k0) * p00;
        self.p[0][1] = (1.0 - k0) * p01;
        self.p[1][0] -= k1 * p00;
        self.p[1][1] -= k1 * p01;

        self.updates_since_decay += 1;
        if !self.gap_active && self.updates_since_decay >= DECAY_PERIOD {
            self.decay_drift();
        }

        self.clamp_output(-self.drift_s_per_s * 1e6)
    }

    fn last_output_ppm(&self) -> f64 {
        self.last_output_ppm
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

    fn last_clamped(&self) -> bool {
        self.last_clamped
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn nudge_phase(&mut self, offset_s: f64) {
        self.offset_s += offset_s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_toward_a_constant_offset() {
        let mut servo = EkfServo::new();
        for _ in 0..200 {
            servo.update(50e-6, 0.01);
        }
        assert!((servo.offset_s() - 50e-6).abs() < 5e-6);
    }

    #[test]
    fn output_never_exceeds_max_ppm() {
        let mut servo = EkfServo::new();
        let u = servo.update(1.0, 1.0);
        assert!(u.abs() <= MAX_PPM);
    }

    #[test]
    fn gated_outlier_moves_offset_only_a_little() {
        let mut servo = EkfServo::new();
        for _ in 0..50 {
            servo.update(1e-6, 0.01);
        }
        let offset_before = servo.offset_s();
        servo.update(10.0, 0.01);
        let moved = (servo.offset_s() - offset_before).abs();
        // Gain-scaled, not rejected: some movement, but far short of what
        // an in-gate innovation of this size would produce.
        assert!(moved > 0.0);
        assert!(moved < 10.0 * 0.1);
    }

    #[test]
    fn enables_on_first_update() {
        let mut servo = EkfServo::new();
        assert!(!servo.enabled());
        servo.update(0.0, 0.01);
        assert!(servo.enabled());
    }

    #[test]
    fn drift_decays_after_period_with_no_fresh_correction() {
        let mut servo = EkfServo::new();
        for _ in 0..100 {
            servo.update(5e-6, 0.01);
        }
        let drift_at_100 = servo.drift_s_per_s;
        // No fresh disagreement from here on: feed back the servo's own
        // offset each tick so the only thing left acting on drift is the
        // periodic DECAY_PERIOD holdover decay.
        for _ in 0..DECAY_PERIOD * 2 {
            let matched = servo.offset_s();
            servo.update(matched, 0.01);
        }
        assert!(servo.drift_s_per_s.abs() <= drift_at_100.abs());
    }

    #[test]
    fn gap_widens_the_gate_instead_of_rejecting() {
        let mut servo = EkfServo::new();
        for _ in 0..50 {
            servo.update(1e-6, 0.01);
        }
        // A much larger dt than the running EWMA trips gap detection,
        // widening the gate to HARD_GATE_SIGMA rather than rejecting.
        let offset_before = servo.offset_s();
        servo.update(5e-5, 2.0);
        assert_ne!(servo.offset_s(), offset_before);
    }
}
