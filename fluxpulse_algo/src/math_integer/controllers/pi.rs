// Licensed under the Apache License, Version 2.0
// Copyright 2025 Anton Khrustalev, creapunk.com

use super::super::iq::{mpy, sat, Iq};

/// Proportional-integral regulator on Q24 per-unit values.
///
/// **Note**
/// - Works with a constant tick period: `ki` is the integral gain already
///   multiplied by the tick period, i.e. the accumulator grows by
///   `ki * error` per call.
/// - Anti-windup is the clamped-integrator policy: the accumulator is
///   clamped to the output limit, and accumulation is skipped while the
///   output is saturated in the direction the error keeps pushing.
pub struct PiController {
    kp: Iq,
    ki: Iq,
    integral: Iq,
    output: Iq,
}

impl PiController {
    pub fn new(kp: Iq, ki: Iq) -> Self {
        Self {
            kp,
            ki,
            integral: 0,
            output: 0,
        }
    }

    /// Advances the regulator by one tick.
    ///
    /// ### Arguments
    /// * `error` - reference minus measurement
    /// * `limit` - symmetric output bound (also bounds the accumulator)
    pub fn tick(&mut self, error: Iq, limit: Iq) -> Iq {
        let p = mpy(self.kp, error);
        let delta = mpy(self.ki, error);

        let unsat = p + self.integral + delta;
        let pushing_high = unsat > limit && delta > 0;
        let pushing_low = unsat < -limit && delta < 0;
        if !pushing_high && !pushing_low {
            self.integral = sat(self.integral + delta, limit);
        }

        self.output = sat(p + self.integral, limit);
        self.output
    }

    pub fn output(&self) -> Iq {
        self.output
    }

    pub fn integral(&self) -> Iq {
        self.integral
    }

    /// Replaces both gains. The accumulator is kept so a retune does not
    /// bump the output.
    pub fn set_gains(&mut self, kp: Iq, ki: Iq) {
        self.kp = kp;
        self.ki = ki;
    }

    pub fn gains(&self) -> (Iq, Iq) {
        (self.kp, self.ki)
    }

    pub fn reset(&mut self) {
        self.integral = 0;
        self.output = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math_integer::iq::{iq, IQ_ONE};

    #[test]
    fn tracks_in_range_reference_without_leaving_bounds() {
        // Plant: pure integrator y += 0.1 * u, reference within the limit.
        let mut pi = PiController::new(iq(0.2), iq(0.05));
        let limit = iq(0.8);
        let reference = iq(0.5);
        let mut y: Iq = 0;
        for _ in 0..5_000 {
            let u = pi.tick(reference - y, limit);
            assert!(u.abs() <= limit);
            assert!(pi.integral().abs() <= limit);
            y += mpy(iq(0.1), u);
        }
        assert!((reference - y).abs() < iq(0.01));
    }

    #[test]
    fn step_beyond_limit_saturates_without_divergence() {
        let mut pi = PiController::new(iq(0.5), iq(0.1));
        let limit = iq(0.6);
        // Reference far outside the limit: error stays large and positive.
        for _ in 0..10_000 {
            let out = pi.tick(IQ_ONE, limit);
            assert!(out <= limit);
            assert!(pi.integral() <= limit);
        }
        assert_eq!(pi.output(), limit);

        // Error reversal must unwind immediately; a wound-up accumulator
        // would hold the output pinned high.
        let out = pi.tick(-IQ_ONE, limit);
        assert!(out < limit);
    }

    #[test]
    fn symmetric_behavior_for_negative_saturation() {
        let mut pi = PiController::new(iq(0.5), iq(0.1));
        let limit = iq(0.6);
        for _ in 0..10_000 {
            let out = pi.tick(-IQ_ONE, limit);
            assert!(out >= -limit);
            assert!(pi.integral() >= -limit);
        }
        assert_eq!(pi.output(), -limit);
    }

    #[test]
    fn gain_update_keeps_accumulator() {
        let mut pi = PiController::new(iq(0.2), iq(0.05));
        for _ in 0..100 {
            pi.tick(iq(0.1), IQ_ONE);
        }
        let integral = pi.integral();
        pi.set_gains(iq(0.4), iq(0.1));
        assert_eq!(pi.integral(), integral);
    }
}
