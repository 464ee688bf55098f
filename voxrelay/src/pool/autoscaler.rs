use crate::config::ScalingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Grow,
    Shrink,
    Hold,
}

/// Hysteresis on queue depth: a decision needs the same signal for several
/// consecutive samples, and the counter resets once acted on.
#[derive(Debug, Clone)]
pub struct Autoscaler {
    config: ScalingConfig,
    above: u32,
    below: u32,
}

impl Autoscaler {
    pub fn new(config: ScalingConfig) -> Self {
        Self {
            config,
            above: 0,
            below: 0,
        }
    }

    pub fn observe(&mut self, queue_depth: usize, size: usize, min: usize, max: usize) -> ScaleDecision {
        if queue_depth > self.config.high_water {
            self.above = self.above.saturating_add(1);
            self.below = 0;
        } else if queue_depth < self.config.low_water {
            self.below = self.below.saturating_add(1);
            self.above = 0;
        } else {
            self.above = 0;
            self.below = 0;
        }

        if self.above >= self.config.grow_after_samples && size < max {
            self.above = 0;
            return ScaleDecision::Grow;
        }
        if self.below >= self.config.shrink_after_samples && size > min {
            self.below = 0;
            return ScaleDecision::Shrink;
        }
        ScaleDecision::Hold
    }
}
