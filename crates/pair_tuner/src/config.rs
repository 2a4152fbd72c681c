//! Run configuration
//!
//! The hyperparameter tuple driving one training invocation. Persisted as
//! `run_config.json` inside every checkpoint so a snapshot is
//! self-describing.

use serde::{Deserialize, Serialize};

use crate::train::TrainArgs;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub lr: f64,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub warmup_steps: usize,
    pub grad_accum: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lr: 2e-5,
            num_epochs: 3,
            batch_size: 16,
            seed: 42,
            warmup_steps: 100,
            grad_accum: 1,
        }
    }
}

impl RunConfig {
    pub fn from_args(args: &TrainArgs) -> Self {
        Self {
            lr: args.lr,
            num_epochs: args.num_epochs,
            batch_size: args.batch_size,
            seed: args.seed,
            warmup_steps: args.warmup_steps,
            // 0 would stall the optimizer forever
            grad_accum: args.grad_accum.max(1),
        }
    }
}
