// Licensed under the Apache License, Version 2.0
// Copyright 2025 Anton Khrustalev, creapunk.com

//! Cascaded FOC pipeline: current regulation in the rotating frame plus
//! the decimated speed loop that feeds it.
//!
//! Per current tick the order is fixed: Park the measured alpha/beta
//! currents with the estimator angle, regulate Id and Iq, circle-limit the
//! d/q voltage (d axis has priority, q gets the remainder), inverse Park,
//! bus-compensate, and generate SVPWM duties.

pub mod svpwm;
pub mod traj;
pub mod transforms;

use crate::config::{Config, TAU};
use crate::math_integer::controllers::PiController;
use crate::math_integer::filters::FilterLPF;
use crate::math_integer::iq::{div, iq, mag, mpy, sat, sqrt, Iq};
use transforms::{inverse_park, park};

/// d/q current references for one current tick.
#[derive(Clone, Copy, Default)]
pub struct CurrentCommand {
    pub id_ref: Iq,
    pub iq_ref: Iq,
}

/// Conservative gains used until identification yields real ones.
const DEFAULT_KP: Iq = iq(0.1);
const DEFAULT_KI: Iq = iq(0.005);

/// The bus-compensation divisor is floored here; below this the bus
/// measurement is garbage and scaling up further would only amplify it.
const MIN_BUS_PU: Iq = iq(0.1);

/// Current PI gains from identified motor parameters and the configured
/// loop bandwidth: kp = L_pu * f_bw / f_fs, ki(per tick) =
/// R_pu * 2*pi*f_bw / f_current.
pub fn calc_current_gains(rs: Iq, ls: Iq, cfg: &Config) -> (Iq, Iq) {
    let kp = ((ls as i64 * cfg.user.current_bw_hz as i64)
        / cfg.user.full_scale_freq_hz as i64) as Iq;
    let k_int = ((TAU as i64 * cfg.user.current_bw_hz as i64)
        / cfg.current_freq_hz as i64) as Iq;
    let ki = mpy(rs, k_int);
    (kp.max(1), ki.max(1))
}

pub struct CurrentController {
    pi_id: PiController,
    pi_iq: PiController,
    vbus_filter: FilterLPF,
    max_vs: Iq,

    id_meas: Iq,
    iq_meas: Iq,
    vd: Iq,
    vq: Iq,
    duty: [Iq; 3],
}

impl CurrentController {
    pub fn new(cfg: &Config) -> Self {
        let (kp, ki) = if cfg.user.enable_user_motor_params {
            calc_current_gains(cfg.user.motor.rs, cfg.user.motor.ls, cfg)
        } else {
            (DEFAULT_KP, DEFAULT_KI)
        };
        Self {
            pi_id: PiController::new(kp, ki),
            pi_iq: PiController::new(kp, ki),
            vbus_filter: FilterLPF::new(iq(1.0), cfg.bias_pole_gain),
            max_vs: cfg.max_vs_mag,
            id_meas: 0,
            iq_meas: 0,
            vd: 0,
            vq: 0,
            duty: svpwm::idle_duty(),
        }
    }

    /// Runs one current tick.
    ///
    /// ### Arguments
    /// * `i_ab` - measured stationary-frame currents
    /// * `sincos` - sine/cosine of the estimator angle, Q24
    /// * `cmd` - d/q current references
    /// * `v_bus` - raw bus voltage sample, pu
    ///
    /// ### Returns
    /// * Phase duty triple for the PWM compare registers.
    pub fn tick(&mut self, i_ab: (Iq, Iq), sincos: (Iq, Iq), cmd: CurrentCommand, v_bus: Iq) -> [Iq; 3] {
        let (sin, cos) = sincos;
        let (id, iq_m) = park(sin, cos, i_ab.0, i_ab.1);
        self.id_meas = id;
        self.iq_meas = iq_m;

        // d axis gets the full budget; q is limited to what remains on the
        // voltage circle so the flux axis never starves.
        self.vd = self.pi_id.tick(cmd.id_ref - id, self.max_vs);
        let vq_limit = sqrt(mpy(self.max_vs, self.max_vs) - mpy(self.vd, self.vd));
        self.vq = self.pi_iq.tick(cmd.iq_ref - iq_m, vq_limit);

        let (v_alpha, v_beta) = inverse_park(sin, cos, self.vd, self.vq);

        // DC bus compensation: duty space is pu of the actual bus, not of
        // the nominal full scale.
        let bus = self.vbus_filter.tick(v_bus).max(MIN_BUS_PU);
        let m_alpha = div(v_alpha, bus);
        let m_beta = div(v_beta, bus);

        self.duty = svpwm::svpwm(m_alpha, m_beta);
        self.duty
    }

    /// Magnitude of the last commanded voltage vector.
    pub fn vs(&self) -> Iq {
        mag(self.vd, self.vq)
    }

    /// Filtered DC bus voltage used for duty compensation, pu.
    pub fn v_bus(&self) -> Iq {
        self.vbus_filter.output()
    }

    /// True when the last command sits on the voltage limit.
    pub fn vs_saturated(&self) -> bool {
        self.vs() >= self.max_vs - (self.max_vs >> 7)
    }

    pub fn vd(&self) -> Iq {
        self.vd
    }

    pub fn vq(&self) -> Iq {
        self.vq
    }

    pub fn id(&self) -> Iq {
        self.id_meas
    }

    pub fn iq_axis(&self) -> Iq {
        self.iq_meas
    }

    pub fn duty(&self) -> [Iq; 3] {
        self.duty
    }

    pub fn set_gains(&mut self, kp: Iq, ki: Iq) {
        self.pi_id.set_gains(kp, ki);
        self.pi_iq.set_gains(kp, ki);
    }

    pub fn gains(&self) -> (Iq, Iq) {
        self.pi_id.gains()
    }

    pub fn reset(&mut self) {
        self.pi_id.reset();
        self.pi_iq.reset();
        self.vd = 0;
        self.vq = 0;
        self.duty = svpwm::idle_duty();
    }
}

/// Decimated outer speed loop producing the Iq reference.
pub struct SpeedController {
    pi: PiController,
}

impl SpeedController {
    pub fn new(cfg: &Config) -> Self {
        Self {
            pi: PiController::new(cfg.user.speed_kp, cfg.user.speed_ki),
        }
    }

    pub fn tick(&mut self, speed_ref: Iq, speed: Iq, max_current: Iq) -> Iq {
        self.pi.tick(speed_ref - speed, max_current)
    }

    pub fn set_gains(&mut self, kp: Iq, ki: Iq) {
        self.pi.set_gains(kp, ki);
    }

    pub fn reset(&mut self) {
        self.pi.reset();
    }

    pub fn output(&self) -> Iq {
        self.pi.output()
    }
}

/// Clamp helper for operator-facing references.
pub fn limit_current_ref(reference: Iq, max_current: Iq) -> Iq {
    sat(reference, max_current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::transforms::clarke3;
    use crate::config::UserParams;
    use crate::math_integer::iq::IQ_ONE;
    use crate::math_integer::trigonometry::sincos_iq;

    fn test_cfg() -> Config {
        UserParams::default().build().unwrap()
    }

    #[test]
    fn svpwm_round_trip_through_pipeline_stage() {
        // Feed Vd = 0.3 pu, Vq = 0 at angle 0 directly through inverse
        // Park + bus compensation + SVPWM and reconstruct with Clarke.
        let (sin, cos) = sincos_iq(0);
        let (v_alpha, v_beta) = inverse_park(sin, cos, iq(0.3), 0);
        let duty = svpwm::svpwm(v_alpha, v_beta);
        let (alpha, beta) = clarke3(duty[0], duty[1], duty[2]);
        assert!((alpha - iq(0.3)).abs() < iq(0.002), "alpha {alpha}");
        assert!(beta.abs() < iq(0.002), "beta {beta}");
    }

    #[test]
    fn regulates_simulated_rl_load_to_reference() {
        // Plant: first-order R-L phase model in the rotating frame with the
        // rotor locked at angle 0, so d/q decouple and alpha == d.
        let cfg = test_cfg();
        let mut ctrl = CurrentController::new(&cfg);
        ctrl.set_gains(iq(0.5), iq(0.02));

        let rs = iq(0.9);
        let k_plant = iq(0.05); // ohm-per-tick integration factor
        let (sin, cos) = sincos_iq(0);
        let mut i_d: Iq = 0;
        let cmd = CurrentCommand {
            id_ref: iq(0.1),
            iq_ref: 0,
        };
        for _ in 0..20_000 {
            let duty = ctrl.tick((i_d, 0), (sin, cos), cmd, IQ_ONE);
            // Recover the applied alpha voltage from the duty triple.
            let (v_alpha, _) = clarke3(duty[0], duty[1], duty[2]);
            i_d += mpy(k_plant, v_alpha - mpy(rs, i_d));
        }
        assert!((ctrl.id() - cmd.id_ref).abs() < iq(0.01));
        // Steady state voltage is R*i.
        assert!((ctrl.vd() - mpy(rs, cmd.id_ref)).abs() < iq(0.02));
    }

    #[test]
    fn vq_limit_shrinks_when_vd_takes_the_circle() {
        let cfg = test_cfg();
        let mut ctrl = CurrentController::new(&cfg);
        ctrl.set_gains(iq(4.0), iq(0.5));
        let (sin, cos) = sincos_iq(0);
        // Huge opposing errors force both axes into saturation.
        let cmd = CurrentCommand {
            id_ref: IQ_ONE,
            iq_ref: IQ_ONE,
        };
        for _ in 0..100 {
            ctrl.tick((0, 0), (sin, cos), cmd, IQ_ONE);
        }
        let vs = ctrl.vs();
        assert!(vs <= cfg.max_vs_mag + 64);
        assert!(ctrl.vs_saturated());
        assert_eq!(ctrl.vd(), cfg.max_vs_mag);
    }

    #[test]
    fn computed_gains_scale_with_motor_parameters() {
        let cfg = test_cfg();
        let (kp1, ki1) = calc_current_gains(iq(0.5), iq(10.0), &cfg);
        let (kp2, ki2) = calc_current_gains(iq(1.0), iq(20.0), &cfg);
        assert_eq!(kp2, kp1 * 2);
        assert!((ki2 - ki1 * 2).abs() <= 2);
        assert!(kp1 > 0 && ki1 > 0);
    }

    #[test]
    fn speed_loop_output_bounded_by_current_limit() {
        let cfg = test_cfg();
        let mut spd = SpeedController::new(&cfg);
        for _ in 0..1000 {
            let iq_ref = spd.tick(IQ_ONE, 0, cfg.max_current);
            assert!(iq_ref.abs() <= cfg.max_current);
        }
    }
}
