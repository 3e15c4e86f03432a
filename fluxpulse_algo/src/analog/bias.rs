// Licensed under the Apache License, Version 2.0
// Copyright 2025 Anton Khrustalev, creapunk.com

//! Per-channel ADC offset estimation.
//!
//! Each current/voltage channel carries a DC offset from its sense network.
//! While the drive idles at 50% duty (OffLine), every raw sample is the
//! offset plus noise, so a low-pass filter per channel recovers it. The
//! committed set is written to the board's bias registers and read back as
//! one operation on OnLine entry; the correction path only ever sees a
//! complete, consistent set of six values.

use crate::config::Config;
use crate::hal::{MotorHal, SampleFrame, SensorKind};
use crate::math_integer::filters::FilterLPF;
use crate::math_integer::iq::Iq;

pub struct BiasBank {
    current: [FilterLPF; 3],
    voltage: [FilterLPF; 3],
    /// Committed values used for sample correction once frozen.
    frozen_current: [Iq; 3],
    frozen_voltage: [Iq; 3],
    estimating: bool,
    committed: bool,
}

impl BiasBank {
    pub fn new(cfg: &Config) -> Self {
        let gain = cfg.bias_pole_gain;
        let ch = |seed: Iq| FilterLPF::new(seed, gain);
        Self {
            current: [
                ch(cfg.user.static_bias_current[0]),
                ch(cfg.user.static_bias_current[1]),
                ch(cfg.user.static_bias_current[2]),
            ],
            voltage: [
                ch(cfg.user.static_bias_voltage[0]),
                ch(cfg.user.static_bias_voltage[1]),
                ch(cfg.user.static_bias_voltage[2]),
            ],
            frozen_current: cfg.user.static_bias_current,
            frozen_voltage: cfg.user.static_bias_voltage,
            estimating: false,
            committed: false,
        }
    }

    /// Starts (re)estimation from raw samples. Called on OffLine entry when
    /// auto-offset is enabled.
    pub fn start_estimation(&mut self) {
        self.estimating = true;
        self.committed = false;
    }

    /// Holds the estimates where they are. Called once the drive starts
    /// injecting current, which would otherwise be averaged into the
    /// offsets.
    pub fn stop_estimation(&mut self) {
        self.estimating = false;
    }

    pub fn is_estimating(&self) -> bool {
        self.estimating
    }

    /// Advances every channel filter by one raw sample frame.
    pub fn tick(&mut self, frame: &SampleFrame) {
        if !self.estimating {
            return;
        }
        for ch in 0..3 {
            self.current[ch].tick(frame.i_abc[ch]);
            self.voltage[ch].tick(frame.v_abc[ch]);
        }
    }

    /// Commits the bias set: writes all six channels to the board registers
    /// and reads every one back before returning, so the correction path
    /// never observes a partially-updated set.
    ///
    /// With auto-offset disabled the static calibration constants are
    /// committed instead of the filter outputs.
    pub fn commit<H: MotorHal>(&mut self, cfg: &Config, hal: &mut H) {
        for ch in 0..3 {
            let (i_bias, v_bias) = if cfg.user.enable_offset_calc {
                (self.current[ch].output(), self.voltage[ch].output())
            } else {
                (
                    cfg.user.static_bias_current[ch],
                    cfg.user.static_bias_voltage[ch],
                )
            };
            hal.set_bias(SensorKind::Current, ch, i_bias);
            hal.set_bias(SensorKind::Voltage, ch, v_bias);
        }
        for ch in 0..3 {
            self.frozen_current[ch] = hal.get_bias(SensorKind::Current, ch);
            self.frozen_voltage[ch] = hal.get_bias(SensorKind::Voltage, ch);
        }
        self.estimating = false;
        self.committed = true;
    }

    /// Removes the offsets from a raw frame. Until commit the live filter
    /// outputs are used; afterwards only the committed set.
    pub fn correct(&self, frame: &SampleFrame) -> SampleFrame {
        let mut out = *frame;
        for ch in 0..3 {
            let (i_bias, v_bias) = if self.committed {
                (self.frozen_current[ch], self.frozen_voltage[ch])
            } else {
                (self.current[ch].output(), self.voltage[ch].output())
            };
            out.i_abc[ch] -= i_bias;
            out.v_abc[ch] -= v_bias;
        }
        out
    }

    pub fn bias(&self, kind: SensorKind, channel: usize) -> Iq {
        match kind {
            SensorKind::Current => self.frozen_current[channel],
            SensorKind::Voltage => self.frozen_voltage[channel],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserParams;
    use crate::hal::FaultFlags;
    use crate::math_integer::iq::iq;

    struct BiasHal {
        current: [Iq; 3],
        voltage: [Iq; 3],
    }

    impl MotorHal for BiasHal {
        fn acquire_sample_frame(&mut self) -> SampleFrame {
            SampleFrame::default()
        }
        fn write_duty_cycles(&mut self, _duty: [Iq; 3]) {}
        fn enable_pwm(&mut self) {}
        fn disable_pwm(&mut self) {}
        fn set_bias(&mut self, kind: SensorKind, channel: usize, value: Iq) {
            match kind {
                SensorKind::Current => self.current[channel] = value,
                SensorKind::Voltage => self.voltage[channel] = value,
            }
        }
        fn get_bias(&self, kind: SensorKind, channel: usize) -> Iq {
            match kind {
                SensorKind::Current => self.current[channel],
                SensorKind::Voltage => self.voltage[channel],
            }
        }
        fn read_fault_flags(&mut self) -> FaultFlags {
            FaultFlags::NONE
        }
        fn toggle_status_led(&mut self) {}
    }

    #[test]
    fn estimates_and_commits_constant_offsets() {
        let cfg = UserParams::default().build().unwrap();
        let mut bank = BiasBank::new(&cfg);
        let mut hal = BiasHal {
            current: [0; 3],
            voltage: [0; 3],
        };

        let mut frame = SampleFrame::default();
        frame.i_abc = [iq(0.01), iq(-0.02), iq(0.015)];
        frame.v_abc = [iq(0.005), iq(0.004), iq(-0.006)];

        bank.start_estimation();
        for _ in 0..50_000 {
            bank.tick(&frame);
        }
        bank.commit(&cfg, &mut hal);

        for ch in 0..3 {
            assert!((bank.bias(SensorKind::Current, ch) - frame.i_abc[ch]).abs() < iq(0.001));
            assert!((bank.bias(SensorKind::Voltage, ch) - frame.v_abc[ch]).abs() < iq(0.001));
            // Committed values are what the board registers report back.
            assert_eq!(bank.bias(SensorKind::Current, ch), hal.current[ch]);
        }

        let corrected = bank.correct(&frame);
        for ch in 0..3 {
            assert!(corrected.i_abc[ch].abs() < iq(0.001));
            assert!(corrected.v_abc[ch].abs() < iq(0.001));
        }
    }

    #[test]
    fn static_bias_used_when_offset_calc_disabled() {
        let mut params = UserParams::default();
        params.enable_offset_calc = false;
        params.static_bias_current = [iq(0.03), iq(0.02), iq(0.01)];
        let cfg = params.build().unwrap();

        let mut bank = BiasBank::new(&cfg);
        let mut hal = BiasHal {
            current: [0; 3],
            voltage: [0; 3],
        };
        bank.commit(&cfg, &mut hal);
        assert_eq!(bank.bias(SensorKind::Current, 0), iq(0.03));
        assert_eq!(hal.current[1], iq(0.02));
    }
}
