// Licensed under the Apache License, Version 2.0
// Copyright 2025 Anton Khrustalev, creapunk.com

//! Operator-facing variables: the watch-window surface of the core.
//!
//! One explicit struct instead of process-wide globals, with field
//! ownership split by execution context:
//!
//! - *request* fields are written by the background loop (operator input)
//!   and only read by the ISR;
//! - *status/readout* fields are written by the ISR and only read by the
//!   background loop.
//!
//! Gain updates cross the boundary through a latch: the background loop
//! writes both gains first and raises `gains_pending` last; the ISR
//! consumes the pair at a point where no PI computation is in flight and
//! clears the flag. A half-written gain set is therefore never applied.

use crate::estimator::EstimatorState;
use crate::hal::FaultFlags;
use crate::math_integer::iq::Iq;
use crate::CtrlState;

/// Why the last run was stopped.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FaultKind {
    #[default]
    None,
    /// Hardware trip-zone bits were set.
    Hardware,
    /// The voltage command sat pinned at its limit long enough to indicate
    /// loss of control.
    Saturation,
}

#[derive(Clone, Copy)]
pub struct MotorVars {
    // ---- request fields (background-owned) -------------------------------
    /// Master enable; clearing it stops the motor from any state.
    pub flag_enable_sys: bool,
    /// Run/identify request; the Idle -> OffLine trigger.
    pub flag_run_identify: bool,
    /// Iq reference, pu of full-scale current (current-command mode).
    pub iq_ref: Iq,
    /// Speed reference, pu of full-scale frequency (speed mode).
    pub speed_ref: Iq,
    /// Operator current-loop gains, applied through the latch below.
    /// Seeded once by the core with the computed values when
    /// identification completes; operator-owned afterwards.
    pub kp_idq: Iq,
    pub ki_idq: Iq,
    /// Raised by the background loop after BOTH gains above are written;
    /// cleared by the ISR when it applies them.
    pub gains_pending: bool,

    // ---- status/readout fields (ISR-owned) -------------------------------
    pub ctrl_state: CtrlState,
    pub est_state: EstimatorState,
    pub flag_motor_identified: bool,
    pub flag_ident_failed: bool,
    pub fault: FaultKind,
    /// Raw hardware trip bits captured at the fault.
    pub fault_bits: FaultFlags,

    /// Electrical speed, pu and Q24 kRPM.
    pub speed_pu: Iq,
    pub speed_krpm: Iq,

    /// Identified motor parameters, pu and engineering units.
    pub rs_pu: Iq,
    pub rs_mohm: i32,
    pub ls_pu: Iq,
    pub ls_uh: i32,
    pub flux_pu: Iq,
    pub flux_mvphz: i32,

    /// Controller outputs, pu.
    pub vd: Iq,
    pub vq: Iq,
    pub vs: Iq,
    pub id: Iq,
    pub iq_axis: Iq,
    pub is_mag: Iq,
    pub v_bus: Iq,

    /// Gains currently installed in the current loop (published by the
    /// core after identification for the operator to start from).
    pub kp_active: Iq,
    pub ki_active: Iq,
}

impl Default for MotorVars {
    fn default() -> Self {
        Self {
            flag_enable_sys: true,
            flag_run_identify: false,
            iq_ref: 0,
            speed_ref: 0,
            kp_idq: 0,
            ki_idq: 0,
            gains_pending: false,
            ctrl_state: CtrlState::Idle,
            est_state: EstimatorState::Idle,
            flag_motor_identified: false,
            flag_ident_failed: false,
            fault: FaultKind::None,
            fault_bits: FaultFlags::NONE,
            speed_pu: 0,
            speed_krpm: 0,
            rs_pu: 0,
            rs_mohm: 0,
            ls_pu: 0,
            ls_uh: 0,
            flux_pu: 0,
            flux_mvphz: 0,
            vd: 0,
            vq: 0,
            vs: 0,
            id: 0,
            iq_axis: 0,
            is_mag: 0,
            v_bus: 0,
            kp_active: 0,
            ki_active: 0,
        }
    }
}
