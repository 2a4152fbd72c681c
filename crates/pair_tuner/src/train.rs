//! Train module: resumable fine-tuning pipeline
//!
//! - args: CLI arguments for training
//! - checkpoint: snapshot naming, persistence and resume resolution
//! - training_loop: the epoch/batch loop itself

pub mod args;
pub mod checkpoint;
pub mod training_loop;

pub use args::TrainArgs;
pub use checkpoint::{CheckpointInterval, CheckpointTag, ResumePosition, TrainError};
pub use training_loop::{run, train, RunReport};
