//! pair_tuner: fine-tune a small sequence-pair classifier with periodic,
//! resumable training checkpoints.
//!
//! The training loop persists full run state (model weights, optimizer
//! moments, LR-schedule position, RNG reseed word) into per-checkpoint
//! directories named `epoch_{E}` or `step_{S}`, and can pick the run back
//! up mid-epoch from the most recent snapshot.

pub mod cli;
pub mod config;
pub mod data;
pub mod evaluate;
pub mod model;
pub mod optim;
pub mod schedule;
pub mod session;
pub mod train;
