//! Data providers
//!
//! The training loop consumes batches through the `BatchProvider` trait so
//! the data source is picked at startup: a JSONL sentence-pair corpus for
//! real runs, or a deterministic synthetic provider for smoke tests.

use anyhow::Result;
use candle_core::{Device, Tensor};

pub mod jsonl;
pub mod synthetic;

pub use jsonl::{JsonlProvider, PadPolicy};
pub use synthetic::SyntheticProvider;

pub struct Batch {
    /// [B, L] u32
    pub input_ids: Tensor,
    /// [B, L] f32, 1.0 for real tokens, 0.0 for padding
    pub attention_mask: Tensor,
    /// [B] u32
    pub labels: Tensor,
}

pub trait BatchProvider {
    /// Batches per epoch. Fixed for the lifetime of the provider.
    fn num_batches(&self) -> usize;

    /// Called once at the top of each epoch (e.g. to reshuffle).
    fn begin_epoch(&mut self, _epoch: usize) {}

    /// Materialize batch `index` (0-based within the epoch) on `device`.
    fn batch(&mut self, index: usize, device: &Device) -> Result<Batch>;
}
