// Licensed under the Apache License, Version 2.0
// Copyright 2025 Anton Khrustalev, creapunk.com

//! Voltage-model flux observer with an angle-tracking PLL.
//!
//! The stator flux is the leaky integral of (v - Rs*i) in the stationary
//! frame; subtracting Ls*i leaves the rotor flux vector, whose direction is
//! the electrical angle. A PLL tracks that direction instead of computing
//! an arctangent: the cross product of the flux vector with the estimated
//! unit vector is sin(angle error), a PI loop turns it into a speed
//! estimate, and integrating the speed closes the angle. The leak bounds
//! integrator drift from residual DC in the measurements.

use crate::config::Config;
use crate::math_integer::filters::FilterLPF;
use crate::math_integer::iq::{div, iq, mag, mpy, sat, Iq};
use crate::math_integer::trigonometry::sincos_iq;

/// Flux magnitudes below this are noise; the phase detector is not
/// normalized against them.
const MIN_FLUX: Iq = iq(0.005);

/// Leak pole of the flux integrator, 2^-10 of the estimator rate: low
/// enough not to distort the flux vector at the identification speed,
/// high enough to bound drift from residual measurement DC.
const LEAK_SHIFT: u32 = 10;

/// Speed output smoothing pole, Q24.
const SPEED_FILTER_ALPHA: Iq = iq(0.05);

/// Q32 angle increment for one tick of `omega` pu at the given rates.
#[inline]
pub(crate) fn angle_step(omega: Iq, fs_hz: i32, est_hz: u32) -> u32 {
    let step = ((omega as i64 * fs_hz as i64) / est_hz as i64) << 8;
    step.clamp(i32::MIN as i64, i32::MAX as i64) as i32 as u32
}

pub struct FluxObserverPll {
    rs: Iq,
    ls: Iq,

    psi_alpha: Iq,
    psi_beta: Iq,

    theta: u32,
    omega: Iq,
    phase_err: Iq,

    speed_filter: FilterLPF,
    flux_filter: FilterLPF,

    k_psi: Iq,
    kp: Iq,
    ki: Iq,
    fs_hz: i32,
    est_hz: u32,
}

impl FluxObserverPll {
    pub fn new(cfg: &Config) -> Self {
        Self {
            rs: 0,
            ls: 0,
            psi_alpha: 0,
            psi_beta: 0,
            theta: 0,
            omega: 0,
            phase_err: 0,
            speed_filter: FilterLPF::new(0, SPEED_FILTER_ALPHA),
            flux_filter: FilterLPF::new(0, SPEED_FILTER_ALPHA),
            k_psi: cfg.k_psi,
            kp: cfg.pll_kp,
            ki: cfg.pll_ki,
            fs_hz: cfg.user.full_scale_freq_hz,
            est_hz: cfg.est_freq_hz,
        }
    }

    /// Installs the electrical parameters the observer model needs. Until
    /// identification provides them the observer output is meaningless.
    pub fn set_params(&mut self, rs: Iq, ls: Iq) {
        self.rs = rs;
        self.ls = ls;
    }

    /// Seeds angle and speed, used at the forced-ramp handoff so the loop
    /// starts from the commanded trajectory instead of pulling in from
    /// zero.
    pub fn seed(&mut self, theta: u32, omega: Iq) {
        self.theta = theta;
        self.omega = omega;
        self.speed_filter.preload(omega);
    }

    pub fn reset(&mut self) {
        self.psi_alpha = 0;
        self.psi_beta = 0;
        self.theta = 0;
        self.omega = 0;
        self.phase_err = 0;
        self.speed_filter.preload(0);
        self.flux_filter.preload(0);
    }

    /// Advances the observer by one estimator tick.
    pub fn tick(&mut self, i_ab: (Iq, Iq), v_ab: (Iq, Iq)) {
        // Back-EMF behind the stator resistance.
        let e_alpha = v_ab.0 - mpy(self.rs, i_ab.0);
        let e_beta = v_ab.1 - mpy(self.rs, i_ab.1);

        // Leaky integration to stator flux.
        self.psi_alpha += mpy(self.k_psi, e_alpha) - (self.psi_alpha >> LEAK_SHIFT);
        self.psi_beta += mpy(self.k_psi, e_beta) - (self.psi_beta >> LEAK_SHIFT);

        // Rotor flux: remove the stator leakage term.
        let rot_alpha = self.psi_alpha - mpy(self.ls, i_ab.0);
        let rot_beta = self.psi_beta - mpy(self.ls, i_ab.1);

        let flux_mag = self.flux_filter.tick(mag(rot_alpha, rot_beta));

        // Phase detector: |psi| * sin(theta - theta_hat), normalized to
        // approximately sin() by the filtered magnitude.
        let (sin, cos) = sincos_iq(self.theta_u16());
        let cross = mpy(rot_beta, cos) - mpy(rot_alpha, sin);
        let err = sat(div(cross, flux_mag.max(MIN_FLUX)), iq(1.0));
        self.phase_err = err;

        // PI loop filter on the phase error gives electrical speed.
        self.omega = sat(self.omega + mpy(self.ki, err), iq(2.0));
        let omega_out = self.omega + mpy(self.kp, err);

        self.advance_theta(omega_out);
        self.speed_filter.tick(self.omega);
    }

    /// Integrates the angle by one tick of the given pu speed.
    fn advance_theta(&mut self, omega: Iq) {
        self.theta = self
            .theta
            .wrapping_add(angle_step(omega, self.fs_hz, self.est_hz));
    }

    pub fn theta_u16(&self) -> u16 {
        (self.theta >> 16) as u16
    }

    pub fn theta_u32(&self) -> u32 {
        self.theta
    }

    /// Filtered electrical speed, signed pu.
    pub fn speed(&self) -> Iq {
        self.speed_filter.output()
    }

    /// Filtered rotor flux magnitude, pu.
    pub fn flux_mag(&self) -> Iq {
        self.flux_filter.output()
    }

    /// Last normalized phase-detector output, ~sin of the angle error.
    pub fn phase_err(&self) -> Iq {
        self.phase_err
    }
}
