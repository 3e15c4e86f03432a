#![cfg_attr(not(test), no_std)]

// Implements the control core of a sensorless FOC motor drive.
//
// Key Features:
// - Periodic ISR entry point running the sampling/estimation/control
//   pipeline under a fixed tick budget
// - Idle/OffLine/OnLine state machine gating PWM and identification
// - Multi-rate decimation for the current, estimator, speed and
//   trajectory stages
// - Serial telemetry and current-command input over bounded FIFOs
//
// Detailed Operation:
// The board layer calls isr_tick() from the ADC conversion-complete
// interrupt and background_tick() from its idle loop. All hardware access
// goes through the MotorHal capability trait, so the core is independent
// of any particular MCU. State transitions are level-triggered on the
// operator flags re-evaluated every tick; any fault collapses the drive
// to Idle with PWM disabled within the tick that observed it.

// Licensed under the Apache License, Version 2.0
// Copyright 2025 Anton Khrustalev, creapunk.com

pub mod analog;
pub mod config;
pub mod controller;
pub mod estimator;
pub mod hal;
pub mod math_integer;
pub mod serial;
pub mod tick;
pub mod vars;

use analog::BiasBank;
use config::{Config, ConfigError, UserParams};
use controller::traj::TrajRamp;
use controller::transforms::{clarke2, clarke3};
use controller::{
    calc_current_gains, limit_current_ref, svpwm, CurrentCommand, CurrentController,
    SpeedController,
};
use estimator::{EstimatorState, FluxEstimator};
use hal::{MotorHal, SampleFrame};
use log::{info, warn};
use math_integer::fifo_buffer::BufferFIFO;
use math_integer::iq::{iq, Iq};
use math_integer::trigonometry::sincos_iq;
use serial::{telemetry, CommandParser};
use tick::Decimator;
use vars::{FaultKind, MotorVars};

/// Outer control state. PWM is enabled exactly in OffLine and OnLine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CtrlState {
    /// PWM disabled, no control computation.
    Idle,
    /// PWM enabled, identification running, no torque command accepted.
    OffLine,
    /// PWM enabled, motor identified, closed-loop control active.
    OnLine,
}

/// Telemetry queue capacity (one slot is the full sentinel).
const TELEMETRY_QUEUE: usize = 200;

/// Control-tick count with the voltage command pinned at the limit before
/// it is treated as loss of control; one second's worth.
fn saturation_trip_ticks(cfg: &Config) -> u32 {
    cfg.current_freq_hz
}

pub struct FocCore {
    cfg: Config,
    state: CtrlState,

    bias: BiasBank,
    estimator: FluxEstimator,
    current_ctrl: CurrentController,
    speed_ctrl: SpeedController,

    iq_ramp: TrajRamp,
    speed_ramp: TrajRamp,
    speed_iq_ref: Iq,

    dec_ctrl: Decimator,
    dec_current: Decimator,
    dec_est: Decimator,
    dec_speed: Decimator,
    dec_traj: Decimator,
    dec_led: Decimator,
    dec_vars: Decimator,
    dec_print: Decimator,

    telemetry: BufferFIFO<u8, TELEMETRY_QUEUE>,
    command: CommandParser,

    pub vars: MotorVars,

    sat_ticks: u32,
    gains_published: bool,
    duty: [Iq; 3],
}

impl FocCore {
    /// Validates the configuration and builds the core. A configuration
    /// error is fatal: there is no core to run and the caller must not
    /// start the periodic interrupt.
    pub fn new(params: UserParams) -> Result<Self, ConfigError> {
        let cfg = params.build()?;

        let traj_hz = (cfg.ctrl_freq_hz / cfg.user.ctrl_per_traj as u32).max(1);
        // Current references reach the limit in one second, speed
        // references cross the full scale in five.
        let mut iq_ramp = TrajRamp::new((cfg.max_current / traj_hz as i32).max(1));
        iq_ramp.force(0);
        let speed_ramp = TrajRamp::new((iq(1.0) / (5 * traj_hz as i32)).max(1));

        Ok(Self {
            state: CtrlState::Idle,
            bias: BiasBank::new(&cfg),
            estimator: FluxEstimator::new(&cfg),
            current_ctrl: CurrentController::new(&cfg),
            speed_ctrl: SpeedController::new(&cfg),
            iq_ramp,
            speed_ramp,
            speed_iq_ref: 0,
            dec_ctrl: Decimator::new(cfg.user.isr_per_ctrl as u32),
            dec_current: Decimator::new(cfg.user.ctrl_per_current as u32),
            dec_est: Decimator::new(cfg.user.ctrl_per_est as u32),
            dec_speed: Decimator::new(cfg.user.ctrl_per_speed as u32),
            dec_traj: Decimator::new(cfg.user.ctrl_per_traj as u32),
            dec_led: Decimator::new(cfg.led_ticks),
            dec_vars: Decimator::new(cfg.vars_ticks),
            dec_print: Decimator::new(cfg.print_ticks),
            telemetry: BufferFIFO::new(),
            command: CommandParser::new(),
            vars: MotorVars::default(),
            sat_ticks: 0,
            gains_published: false,
            duty: svpwm::idle_duty(),
            cfg,
        })
    }

    /// The periodic entry point, called once per ADC conversion-complete
    /// interrupt. Single-pass and non-reentrant; the interrupt controller
    /// must not allow re-entry.
    pub fn isr_tick<H: MotorHal>(&mut self, hal: &mut H) {
        // Hardware trip bits first: nothing else may run on a tripped
        // bridge.
        let trip = hal.read_fault_flags();
        if trip.any() && self.state != CtrlState::Idle {
            self.vars.fault_bits = trip;
            self.fault(hal, FaultKind::Hardware);
        }

        // Level-triggered state transitions, re-evaluated every tick.
        self.update_state(hal);

        let raw = hal.acquire_sample_frame();
        self.bias.tick(&raw);
        let frame = self.bias.correct(&raw);

        if self.state != CtrlState::Idle && self.dec_ctrl.tick() {
            self.ctrl_tick(&frame);
            if self.sat_ticks > saturation_trip_ticks(&self.cfg) {
                self.fault(hal, FaultKind::Saturation);
            }
        }
        hal.write_duty_cycles(self.duty);

        // Slow housekeeping on its own decimations.
        if self.dec_led.tick() {
            hal.toggle_status_led();
        }
        if self.dec_vars.tick() {
            self.refresh_vars();
        }
        if self.dec_print.tick() && self.state != CtrlState::Idle {
            telemetry::emit_value(&mut self.telemetry, self.vars.speed_krpm);
        }
    }

    /// Cooperative background work: applies operator requests that must
    /// not race the ISR. Call from the idle loop at any rate.
    pub fn background_tick(&mut self) {
        // Seed the forced-angle startup direction from the sign of the
        // requested torque so the ramp rotates the way the operator wants
        // to go.
        let direction = if self.vars.iq_ref > 0 {
            iq(1.0)
        } else if self.vars.iq_ref < 0 {
            iq(-1.0)
        } else {
            0
        };
        self.estimator.set_direction(direction);

        self.iq_ramp
            .set_target(limit_current_ref(self.vars.iq_ref, self.cfg.max_current));
        self.speed_ramp.set_target(self.vars.speed_ref);
    }

    /// Writes an operator gain pair and raises the latch last, so the ISR
    /// can never observe half an update.
    pub fn request_gains(&mut self, kp: Iq, ki: Iq) {
        self.vars.kp_idq = kp;
        self.vars.ki_idq = ki;
        self.vars.gains_pending = true;
    }

    /// Feeds one received serial byte; a complete decimal line (amperes)
    /// becomes the new Iq reference.
    pub fn on_rx_byte(&mut self, byte: u8) {
        if let Some(amps) = self.command.push_byte(byte) {
            let pu = ((amps as i64 * 1000) / self.cfg.user.full_scale_current_ma as i64) as Iq;
            self.vars.iq_ref = limit_current_ref(pu, self.cfg.max_current);
        }
    }

    /// Hands the transmit interrupt its next telemetry byte.
    pub fn pop_tx_byte(&mut self) -> Option<u8> {
        self.telemetry.pop()
    }

    pub fn state(&self) -> CtrlState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Electrical speed estimate, pu.
    pub fn speed_pu(&self) -> Iq {
        self.estimator.speed()
    }

    fn update_state<H: MotorHal>(&mut self, hal: &mut H) {
        let run_request = self.vars.flag_enable_sys && self.vars.flag_run_identify;
        match self.state {
            CtrlState::Idle => {
                if run_request {
                    self.enter_offline(hal);
                }
            }
            CtrlState::OffLine => {
                if !run_request {
                    self.enter_idle(hal);
                } else if self.estimator.is_identified() {
                    self.enter_online(hal);
                } else if self.estimator.is_failed() {
                    // Non-fatal: stay OffLine with zero output; the next
                    // enable cycle re-arms identification.
                    self.vars.flag_ident_failed = true;
                }
            }
            CtrlState::OnLine => {
                if !run_request {
                    self.enter_idle(hal);
                }
            }
        }
    }

    fn enter_offline<H: MotorHal>(&mut self, hal: &mut H) {
        self.state = CtrlState::OffLine;
        self.vars.fault = FaultKind::None;
        self.vars.fault_bits = hal::FaultFlags::NONE;
        self.vars.flag_ident_failed = false;

        hal.enable_pwm();
        if self.cfg.user.enable_offset_calc {
            self.bias.start_estimation();
        }
        self.estimator.start();
        self.current_ctrl.reset();
        self.speed_ctrl.reset();
        self.iq_ramp.force(0);
        self.speed_ramp.force(0);
        self.speed_iq_ref = 0;
        self.sat_ticks = 0;
        self.gains_published = false;

        // Align every pipeline stage to this activation tick.
        self.dec_ctrl.reset();
        self.dec_current.reset();
        self.dec_est.reset();
        self.dec_speed.reset();
        self.dec_traj.reset();

        info!("CTRL: offline, identification armed");
    }

    fn enter_online<H: MotorHal>(&mut self, hal: &mut H) {
        self.state = CtrlState::OnLine;

        // Commit the bias set (estimated or static) and read it back as
        // one operation before the first OnLine controller tick.
        self.bias.commit(&self.cfg, hal);

        if !self.gains_published {
            let (kp, ki) =
                calc_current_gains(self.estimator.rs(), self.estimator.ls(), &self.cfg);
            self.current_ctrl.set_gains(kp, ki);
            self.vars.kp_active = kp;
            self.vars.ki_active = ki;
            // Seed the watch window so the operator tunes from the
            // computed values rather than from zero; an update already
            // latched by the operator wins over the seed.
            if !self.vars.gains_pending {
                self.vars.kp_idq = kp;
                self.vars.ki_idq = ki;
            }
            self.gains_published = true;
        }

        self.vars.flag_motor_identified = true;
        self.iq_ramp.force(0);
        self.speed_ramp.force(self.estimator.speed());
        info!("CTRL: online");
    }

    fn enter_idle<H: MotorHal>(&mut self, hal: &mut H) {
        self.state = CtrlState::Idle;
        hal.disable_pwm();
        self.duty = svpwm::idle_duty();

        // Identification progress is discarded; the next enable starts
        // fresh.
        self.estimator.reset();
        self.bias.stop_estimation();
        self.current_ctrl.reset();
        self.speed_ctrl.reset();
        self.iq_ramp.force(0);
        self.speed_ramp.force(0);
        self.speed_iq_ref = 0;
        self.sat_ticks = 0;
        self.vars.flag_run_identify = false;
        self.vars.flag_motor_identified = false;
        info!("CTRL: idle");
    }

    fn fault<H: MotorHal>(&mut self, hal: &mut H, kind: FaultKind) {
        warn!("CTRL: fault, stopping drive");
        self.vars.fault = kind;
        self.enter_idle(hal);
    }

    /// One control tick: transforms, decimated estimator/speed/trajectory
    /// stages, and the current loop.
    fn ctrl_tick(&mut self, frame: &SampleFrame) {
        let i_ab = if self.cfg.user.num_current_sensors == 3 {
            clarke3(frame.i_abc[0], frame.i_abc[1], frame.i_abc[2])
        } else {
            clarke2(frame.i_abc[0], frame.i_abc[1])
        };
        let v_ab = clarke3(frame.v_abc[0], frame.v_abc[1], frame.v_abc[2]);

        if self.dec_est.tick() {
            self.estimator.tick(i_ab, v_ab);
            self.estimator.advance_forced_angle();
            // Once identification starts injecting, the injection must not
            // be averaged into the offsets.
            if self.bias.is_estimating() && self.estimator.state() != EstimatorState::Settle {
                self.bias.stop_estimation();
            }
        }

        if self.dec_traj.tick() {
            self.iq_ramp.tick();
            self.speed_ramp.tick();
        }

        if self.dec_speed.tick()
            && self.cfg.user.enable_speed_ctrl
            && self.state == CtrlState::OnLine
        {
            self.speed_iq_ref = self.speed_ctrl.tick(
                self.speed_ramp.value(),
                self.estimator.speed(),
                self.cfg.max_current,
            );
        }

        if self.dec_current.tick() {
            // While the offset estimator settles, the bridge must idle at
            // the midpoint: a regulating current loop would drive a real
            // DC current straight into the offset estimate.
            if self.estimator.state() == EstimatorState::Settle {
                self.current_ctrl.reset();
                self.duty = svpwm::idle_duty();
                return;
            }

            // Safe point for the gain latch: no PI computation is in
            // flight between current ticks.
            if self.vars.gains_pending
                && self.state == CtrlState::OnLine
                && self.vars.flag_motor_identified
            {
                self.current_ctrl
                    .set_gains(self.vars.kp_idq, self.vars.ki_idq);
                self.vars.kp_active = self.vars.kp_idq;
                self.vars.ki_active = self.vars.ki_idq;
                self.vars.gains_pending = false;
            }

            // Identification owns the references until the motor is
            // identified; once OnLine the operator's (or the speed
            // loop's) command flows through. OffLine never accepts a
            // torque command, including after a failed identification.
            let cmd = match self.estimator.current_command() {
                Some(cmd) => cmd,
                None if self.state == CtrlState::OnLine => CurrentCommand {
                    id_ref: 0,
                    iq_ref: if self.cfg.user.enable_speed_ctrl {
                        self.speed_iq_ref
                    } else {
                        self.iq_ramp.value()
                    },
                },
                None => CurrentCommand::default(),
            };

            let sincos = sincos_iq(self.estimator.angle());
            self.duty = self.current_ctrl.tick(i_ab, sincos, cmd, frame.v_bus);

            if self.state == CtrlState::OnLine && self.current_ctrl.vs_saturated() {
                self.sat_ticks += 1;
            } else {
                self.sat_ticks = 0;
            }
        }
    }

    /// Refreshes the watch-window readouts (decimated; the conversions
    /// are not worth paying every tick).
    fn refresh_vars(&mut self) {
        let v = &mut self.vars;
        v.ctrl_state = self.state;
        v.est_state = self.estimator.state();

        v.speed_pu = self.estimator.speed();
        v.speed_krpm = self.cfg.speed_pu_to_krpm(v.speed_pu);

        v.rs_pu = self.estimator.rs();
        v.rs_mohm = self.cfg.pu_to_res_mohm(v.rs_pu);
        v.ls_pu = self.estimator.ls();
        v.ls_uh = self.cfg.pu_to_ind_uh(v.ls_pu);
        v.flux_pu = self.estimator.flux();
        v.flux_mvphz = self.cfg.pu_to_flux_mvphz(v.flux_pu);

        v.vd = self.current_ctrl.vd();
        v.vq = self.current_ctrl.vq();
        v.vs = self.current_ctrl.vs();
        v.id = self.current_ctrl.id();
        v.iq_axis = self.current_ctrl.iq_axis();
        v.is_mag = math_integer::iq::mag(v.id, v.iq_axis);
        v.v_bus = self.current_ctrl.v_bus();
    }
}
