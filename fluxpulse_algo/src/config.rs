// Licensed under the Apache License, Version 2.0
// Copyright 2025 Anton Khrustalev, creapunk.com

//! User parameter set and its validated, derived form.
//!
//! All board/motor variation enters the core through this one struct,
//! resolved once at startup; the hot path never branches on build flags.
//! Engineering quantities are integers in milli-units (the
//! mV/mA/mΩ convention); per-unit quantities are Q24 [`Iq`] fractions of
//! the full scales configured here.

use crate::math_integer::iq::{iq, Iq, IQ_ONE};

/// 2*pi in Q24, used when converting hertz to per-tick increments.
pub const TAU: Iq = iq(6.283185307179586);

/// Fixed per-motor parameters for skipping identification, all per-unit
/// (see [`Config`] for the base definitions).
#[derive(Clone, Copy, Default, Debug)]
pub struct MotorParams {
    /// Stator resistance, pu of V_fs/I_fs.
    pub rs: Iq,
    /// Stator inductance, pu of (V_fs/I_fs)/(2*pi*f_fs).
    pub ls: Iq,
    /// Rated flux linkage, pu of V_fs/(2*pi*f_fs).
    pub rated_flux: Iq,
}

/// Operator-supplied configuration, consumed once at startup.
#[derive(Clone, Copy, Debug)]
pub struct UserParams {
    /// Full-scale phase current in milliamps; 1.0 pu of any current equals
    /// this.
    pub full_scale_current_ma: i32,
    /// Full-scale phase voltage in millivolts.
    pub full_scale_voltage_mv: i32,
    /// Full-scale electrical frequency in hertz; 1.0 pu speed equals this.
    pub full_scale_freq_hz: i32,

    /// ISR (ADC trigger) rate in hertz.
    pub isr_freq_hz: u32,
    /// Motor pole pairs.
    pub pole_pairs: u8,
    /// Phase current sensors populated on the board (2 or 3).
    pub num_current_sensors: u8,

    /// ISR ticks per control tick.
    pub isr_per_ctrl: u16,
    /// Control ticks per current-loop tick.
    pub ctrl_per_current: u16,
    /// Control ticks per estimator tick.
    pub ctrl_per_est: u16,
    /// Control ticks per speed-loop tick.
    pub ctrl_per_speed: u16,
    /// Control ticks per trajectory tick.
    pub ctrl_per_traj: u16,

    /// Pole frequency of the ADC offset estimator, hertz.
    pub bias_pole_hz: u32,

    /// Current injected during resistance identification, milliamps.
    pub res_est_current_ma: i32,
    /// Current injected during inductance identification, milliamps.
    pub ind_est_current_ma: i32,
    /// Electrical frequency of the forced rotation during inductance
    /// identification, hertz.
    pub ind_est_freq_hz: i32,
    /// Electrical frequency the flux stage ramps to, hertz.
    pub flux_est_freq_hz: i32,

    /// Hard limit on any current command, milliamps.
    pub max_current_ma: i32,
    /// Voltage vector magnitude limit, pu (0, 1].
    pub max_vs_mag: Iq,
    /// Current-loop bandwidth for the auto-computed PI gains, hertz.
    pub current_bw_hz: i32,

    /// Speed-loop gains (per-unit error to per-unit Iq command); the
    /// integral gain is per speed tick.
    pub speed_kp: Iq,
    pub speed_ki: Iq,

    /// Run the speed PI; when false the external Iq reference is used
    /// directly (current-command operation).
    pub enable_speed_ctrl: bool,
    /// Estimate ADC offsets during OffLine instead of loading
    /// `static_bias`.
    pub enable_offset_calc: bool,
    /// Use the forced-angle ramp below the zero-speed limit.
    pub enable_force_angle: bool,
    /// Trust `motor` instead of running full identification.
    pub enable_user_motor_params: bool,

    /// Calibration constants used when `enable_offset_calc` is false.
    pub static_bias_current: [Iq; 3],
    pub static_bias_voltage: [Iq; 3],

    /// Known motor parameters (used when `enable_user_motor_params`).
    pub motor: MotorParams,
}

impl Default for UserParams {
    fn default() -> Self {
        Self {
            full_scale_current_ma: 10_000,
            full_scale_voltage_mv: 24_000,
            full_scale_freq_hz: 1000,
            isr_freq_hz: 10_000,
            pole_pairs: 4,
            num_current_sensors: 3,
            isr_per_ctrl: 1,
            ctrl_per_current: 1,
            ctrl_per_est: 1,
            ctrl_per_speed: 10,
            ctrl_per_traj: 10,
            bias_pole_hz: 20,
            res_est_current_ma: 1000,
            ind_est_current_ma: 1000,
            ind_est_freq_hz: 100,
            flux_est_freq_hz: 20,
            max_current_ma: 4000,
            max_vs_mag: iq(0.5),
            current_bw_hz: 100,
            speed_kp: iq(2.0),
            speed_ki: iq(0.02),
            enable_speed_ctrl: false,
            enable_offset_calc: true,
            enable_force_angle: true,
            enable_user_motor_params: false,
            static_bias_current: [0; 3],
            static_bias_voltage: [0; 3],
            motor: MotorParams::default(),
        }
    }
}

/// Startup configuration faults. Any of these keeps the state machine in
/// Idle permanently; the motor is never driven with a contradictory
/// parameter set.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConfigError {
    ZeroFullScale,
    ZeroIsrFrequency,
    ZeroPolePairs,
    BadSensorCount(u8),
    BadDecimation(&'static str),
    BadVsMagnitude,
    BadCurrentLimit,
    BadBiasPole,
    BadIdentificationSetup,
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::ZeroFullScale => write!(f, "full-scale value is zero"),
            ConfigError::ZeroIsrFrequency => {
                write!(f, "ISR rate is zero or too slow for the decimations")
            }
            ConfigError::ZeroPolePairs => write!(f, "pole pair count is zero"),
            ConfigError::BadSensorCount(n) => {
                write!(f, "unsupported current sensor count {n}")
            }
            ConfigError::BadDecimation(stage) => {
                write!(f, "{stage} decimation outside 1..=15")
            }
            ConfigError::BadVsMagnitude => write!(f, "max Vs magnitude outside (0, 1]"),
            ConfigError::BadCurrentLimit => {
                write!(f, "current limit outside (0, full-scale]")
            }
            ConfigError::BadBiasPole => {
                write!(f, "bias pole not below the ISR Nyquist rate")
            }
            ConfigError::BadIdentificationSetup => {
                write!(f, "identification currents/frequencies out of range")
            }
        }
    }
}

/// Validated configuration plus the fixed-point factors derived from it.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub user: UserParams,

    /// Control / current / estimator / speed tick rates, hertz.
    pub ctrl_freq_hz: u32,
    pub current_freq_hz: u32,
    pub est_freq_hz: u32,
    pub speed_freq_hz: u32,

    /// Offset-estimator pole gain per ISR tick, Q24.
    pub bias_pole_gain: Iq,

    /// Flux-observer integration factor 2*pi*f_fs/f_est, Q24.
    pub k_psi: Iq,
    /// PLL proportional/integral gains, Q24 (integral per estimator tick).
    pub pll_kp: Iq,
    pub pll_ki: Iq,

    /// Identification setpoints, pu.
    pub res_est_current: Iq,
    pub ind_est_current: Iq,
    pub ind_est_speed: Iq,
    pub flux_est_speed: Iq,

    /// Run-time limits, pu.
    pub max_current: Iq,
    pub max_vs_mag: Iq,

    /// Speed below which the angle is considered unobservable, pu.
    pub zero_speed_limit: Iq,
    /// Forced-angle ramp speed, pu.
    pub force_angle_speed: Iq,

    /// Housekeeping decimations, ISR ticks.
    pub led_ticks: u32,
    pub vars_ticks: u32,
    pub print_ticks: u32,
}

/// Status LED blink rate, hertz.
const LED_BLINK_FREQ_HZ: u32 = 5;
/// Watch-variable refresh rate, hertz.
const VARS_REFRESH_FREQ_HZ: u32 = 20;
/// Telemetry line rate, hertz.
const PRINT_FREQ_HZ: u32 = 10;

impl UserParams {
    /// Validates the parameter set and derives the fixed-point factors.
    pub fn build(self) -> Result<Config, ConfigError> {
        if self.full_scale_current_ma <= 0
            || self.full_scale_voltage_mv <= 0
            || self.full_scale_freq_hz <= 0
        {
            return Err(ConfigError::ZeroFullScale);
        }
        if self.isr_freq_hz == 0 {
            return Err(ConfigError::ZeroIsrFrequency);
        }
        if self.pole_pairs == 0 {
            return Err(ConfigError::ZeroPolePairs);
        }
        if !matches!(self.num_current_sensors, 2 | 3) {
            return Err(ConfigError::BadSensorCount(self.num_current_sensors));
        }
        for (name, ratio) in [
            ("control", self.isr_per_ctrl),
            ("current", self.ctrl_per_current),
            ("estimator", self.ctrl_per_est),
            ("speed", self.ctrl_per_speed),
            ("trajectory", self.ctrl_per_traj),
        ] {
            if !(1..=15).contains(&ratio) {
                return Err(ConfigError::BadDecimation(name));
            }
        }
        if self.max_vs_mag <= 0 || self.max_vs_mag > IQ_ONE {
            return Err(ConfigError::BadVsMagnitude);
        }
        if self.max_current_ma <= 0 || self.max_current_ma > self.full_scale_current_ma {
            return Err(ConfigError::BadCurrentLimit);
        }
        // The single-pole bias filter needs its pole well below the sample
        // rate for the per-tick gain approximation to hold.
        if self.bias_pole_hz == 0 || self.bias_pole_hz * 10 > self.isr_freq_hz {
            return Err(ConfigError::BadBiasPole);
        }
        if self.res_est_current_ma <= 0
            || self.res_est_current_ma > self.max_current_ma
            || self.ind_est_current_ma <= 0
            || self.ind_est_current_ma > self.max_current_ma
            || self.ind_est_freq_hz <= 0
            || self.ind_est_freq_hz > self.full_scale_freq_hz
            || self.flux_est_freq_hz <= 0
            || self.flux_est_freq_hz > self.full_scale_freq_hz
        {
            return Err(ConfigError::BadIdentificationSetup);
        }

        let ctrl_freq_hz = self.isr_freq_hz / self.isr_per_ctrl as u32;
        let current_freq_hz = ctrl_freq_hz / self.ctrl_per_current as u32;
        let est_freq_hz = ctrl_freq_hz / self.ctrl_per_est as u32;
        let speed_freq_hz = ctrl_freq_hz / self.ctrl_per_speed as u32;
        // A decimation ladder that divides the ISR rate down to nothing is
        // as fatal as a zero ISR rate.
        if current_freq_hz == 0 || est_freq_hz == 0 || speed_freq_hz == 0 {
            return Err(ConfigError::ZeroIsrFrequency);
        }

        // alpha = 2*pi*f_pole/f_isr, the small-pole approximation of
        // 1 - exp(-2*pi*f_pole/f_isr).
        let bias_pole_gain =
            ((TAU as i64 * self.bias_pole_hz as i64) / self.isr_freq_hz as i64) as Iq;

        let k_psi =
            ((TAU as i64 * self.full_scale_freq_hz as i64) / est_freq_hz as i64) as Iq;

        // PLL gains: the per-tick proportional angle correction is
        // a = kp * 2*pi * f_fs / f_est; a = 0.25 keeps the lock loop well
        // inside stability for every legal decimation, ki an octave below.
        let pll_kp = (((IQ_ONE / 4) as i64 * est_freq_hz as i64)
            / ((TAU as i64 * self.full_scale_freq_hz as i64) >> 24))
            .min(iq(8.0) as i64) as Iq;
        let pll_ki = pll_kp >> 6;

        let fs_current = self.full_scale_current_ma as i64;
        let fs_freq = self.full_scale_freq_hz as i64;
        let to_pu_current = move |ma: i32| (((ma as i64) << 24) / fs_current) as Iq;
        let to_pu_freq = move |hz: i32| (((hz as i64) << 24) / fs_freq) as Iq;

        // 0.5 Hz expressed in pu of the full-scale frequency.
        let zero_speed_limit = to_pu_freq(1) / 2;

        Ok(Config {
            ctrl_freq_hz,
            current_freq_hz,
            est_freq_hz,
            speed_freq_hz,
            bias_pole_gain,
            k_psi,
            pll_kp,
            pll_ki,
            res_est_current: to_pu_current(self.res_est_current_ma),
            ind_est_current: to_pu_current(self.ind_est_current_ma),
            ind_est_speed: to_pu_freq(self.ind_est_freq_hz),
            flux_est_speed: to_pu_freq(self.flux_est_freq_hz),
            max_current: to_pu_current(self.max_current_ma),
            max_vs_mag: self.max_vs_mag,
            zero_speed_limit,
            force_angle_speed: zero_speed_limit * 4,
            led_ticks: (self.isr_freq_hz / LED_BLINK_FREQ_HZ).max(1),
            vars_ticks: (self.isr_freq_hz / VARS_REFRESH_FREQ_HZ).max(1),
            print_ticks: (self.isr_freq_hz / PRINT_FREQ_HZ).max(1),
            user: self,
        })
    }
}

impl Config {
    /// Q24 pu current from milliamps.
    pub fn current_to_pu(&self, ma: i32) -> Iq {
        (((ma as i64) << 24) / self.user.full_scale_current_ma as i64) as Iq
    }

    /// Milliamps from Q24 pu current.
    pub fn pu_to_current_ma(&self, pu: Iq) -> i32 {
        ((pu as i64 * self.user.full_scale_current_ma as i64) >> 24) as i32
    }

    /// Millivolts from Q24 pu voltage.
    pub fn pu_to_voltage_mv(&self, pu: Iq) -> i32 {
        ((pu as i64 * self.user.full_scale_voltage_mv as i64) >> 24) as i32
    }

    /// Milliohms from a pu resistance (base V_fs/I_fs).
    pub fn pu_to_res_mohm(&self, pu: Iq) -> i32 {
        let z_base_mohm = (self.user.full_scale_voltage_mv as i64 * 1000)
            / self.user.full_scale_current_ma as i64;
        ((pu as i64 * z_base_mohm) >> 24) as i32
    }

    /// Microhenries from a pu inductance (base Z_base/(2*pi*f_fs)).
    pub fn pu_to_ind_uh(&self, pu: Iq) -> i32 {
        let z_base_mohm = (self.user.full_scale_voltage_mv as i64 * 1000)
            / self.user.full_scale_current_ma as i64;
        // L_base in microhenries = Z_base_mohm * 1000 / (2*pi*f_fs)
        let l_base_uh =
            (z_base_mohm * 1000 * IQ_ONE as i64) / (TAU as i64 * self.user.full_scale_freq_hz as i64);
        ((pu as i64 * l_base_uh) >> 24) as i32
    }

    /// Flux linkage in mV/Hz from pu flux (base V_fs/(2*pi*f_fs)).
    pub fn pu_to_flux_mvphz(&self, pu: Iq) -> i32 {
        ((pu as i64 * self.user.full_scale_voltage_mv as i64)
            / self.user.full_scale_freq_hz as i64
            >> 24) as i32
    }

    /// Speed in Q24 kRPM from pu electrical speed.
    pub fn speed_pu_to_krpm(&self, pu: Iq) -> Iq {
        let k = ((self.user.full_scale_freq_hz as i64 * 60) << 24)
            / (self.user.pole_pairs as i64 * 1000);
        ((pu as i64 * k) >> 24) as Iq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_validate() {
        let cfg = UserParams::default().build().expect("default config");
        assert_eq!(cfg.ctrl_freq_hz, 10_000);
        assert_eq!(cfg.speed_freq_hz, 1000);
        assert!(cfg.bias_pole_gain > 0 && cfg.bias_pole_gain < IQ_ONE);
        assert!(cfg.k_psi > 0);
        assert!(cfg.pll_kp > 0 && cfg.pll_ki > 0);
    }

    #[test]
    fn rejects_bad_sensor_count() {
        let mut p = UserParams::default();
        p.num_current_sensors = 1;
        assert_eq!(p.build().unwrap_err(), ConfigError::BadSensorCount(1));
    }

    #[test]
    fn rejects_out_of_range_decimation() {
        let mut p = UserParams::default();
        p.ctrl_per_speed = 16;
        assert_eq!(p.build().unwrap_err(), ConfigError::BadDecimation("speed"));
        p.ctrl_per_speed = 0;
        assert_eq!(p.build().unwrap_err(), ConfigError::BadDecimation("speed"));
    }

    #[test]
    fn rejects_zero_scales_and_limits() {
        let mut p = UserParams::default();
        p.full_scale_current_ma = 0;
        assert_eq!(p.build().unwrap_err(), ConfigError::ZeroFullScale);

        let mut p = UserParams::default();
        p.max_vs_mag = 0;
        assert_eq!(p.build().unwrap_err(), ConfigError::BadVsMagnitude);

        let mut p = UserParams::default();
        p.max_current_ma = p.full_scale_current_ma + 1;
        assert_eq!(p.build().unwrap_err(), ConfigError::BadCurrentLimit);
    }

    #[test]
    fn unit_conversions_round_trip() {
        let cfg = UserParams::default().build().unwrap();
        let pu = cfg.current_to_pu(2_500);
        assert_eq!(cfg.pu_to_current_ma(pu), 2_500);
        // 1.0 pu resistance is V_fs/I_fs = 24 V / 10 A = 2.4 ohm.
        assert_eq!(cfg.pu_to_res_mohm(IQ_ONE), 2_400);
    }
}
