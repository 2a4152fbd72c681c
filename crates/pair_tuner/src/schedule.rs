//! Learning-rate schedule
//!
//! Linear warmup followed by linear decay to zero. The only mutable state
//! is the update counter, which round-trips through checkpoints as
//! `schedule.json`.

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleState {
    pub step: usize,
}

pub struct LinearSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl LinearSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
        }
    }

    /// LR at the current position, without advancing.
    pub fn lr(&self) -> f64 {
        if self.step < self.warmup_steps {
            self.base_lr * self.step as f64 / self.warmup_steps as f64
        } else {
            let span = self.total_steps.saturating_sub(self.warmup_steps).max(1);
            let remaining = self.total_steps.saturating_sub(self.step) as f64 / span as f64;
            self.base_lr * remaining.clamp(0.0, 1.0)
        }
    }

    /// Returns the LR for this update and moves to the next position.
    pub fn advance(&mut self) -> f64 {
        let lr = self.lr();
        self.step += 1;
        lr
    }

    pub fn state(&self) -> ScheduleState {
        ScheduleState { step: self.step }
    }

    pub fn restore(&mut self, state: ScheduleState) {
        self.step = state.step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warmup_ramps_linearly() {
        let mut sched = LinearSchedule::new(1.0, 4, 8);
        let lrs: Vec<f64> = (0..4).map(|_| sched.advance()).collect();
        assert_eq!(lrs, vec![0.0, 0.25, 0.5, 0.75]);
    }

    #[test]
    fn decays_to_zero_at_total_steps() {
        let mut sched = LinearSchedule::new(1.0, 2, 6);
        for _ in 0..6 {
            sched.advance();
        }
        assert_eq!(sched.lr(), 0.0);
        // Advancing past the end stays at zero.
        sched.advance();
        assert_eq!(sched.lr(), 0.0);
    }

    #[test]
    fn state_round_trips() {
        let mut a = LinearSchedule::new(3e-4, 10, 100);
        for _ in 0..37 {
            a.advance();
        }
        let mut b = LinearSchedule::new(3e-4, 10, 100);
        b.restore(a.state());
        assert_eq!(a.lr(), b.lr());
        assert_eq!(b.state().step, 37);
    }

    #[test]
    fn zero_warmup_starts_at_base_lr() {
        let sched = LinearSchedule::new(0.5, 0, 10);
        assert_eq!(sched.lr(), 0.5);
    }
}
