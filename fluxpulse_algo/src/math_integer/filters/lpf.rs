use super::super::iq::{mpy, Iq, IQ_ONE};

/// Single-pole low-pass filter on Q24 per-unit values.
///
/// `state += alpha * (input - state)` with `alpha` in (0, 1). The step
/// toward the target never exceeds the remaining gap, so for a constant
/// input the output approaches it monotonically without overshoot.
pub struct FilterLPF {
    alpha: Iq,
    state: Iq,
}

impl FilterLPF {
    /// Creates a filter preloaded with `initial`. `alpha` is clamped into
    /// the open unit interval; a pole gain at or beyond 1.0 would stop
    /// being a filter.
    pub fn new(initial: Iq, alpha: Iq) -> Self {
        Self {
            alpha: alpha.clamp(1, IQ_ONE - 1),
            state: initial,
        }
    }

    /// Advances the filter by one sample.
    pub fn tick(&mut self, input: Iq) -> Iq {
        self.state += mpy(self.alpha, input - self.state);
        self.state
    }

    pub fn output(&self) -> Iq {
        self.state
    }

    /// Overwrites the filter state, e.g. when seeding from a calibration
    /// constant.
    pub fn preload(&mut self, value: Iq) {
        self.state = value;
    }

    pub fn set_alpha(&mut self, alpha: Iq) {
        self.alpha = alpha.clamp(1, IQ_ONE - 1);
    }
}
