//! Training arguments

use std::path::PathBuf;

use clap::Args;

use crate::session::Precision;

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Mixed precision mode
    #[arg(long, value_enum, default_value = "no")]
    pub mixed_precision: Precision,

    /// Force CPU even when a GPU is available
    #[arg(long, action)]
    pub cpu: bool,

    /// Save state every N steps, or "epoch" for each epoch. Unset: never.
    #[arg(long)]
    pub checkpointing_steps: Option<String>,

    /// Directory holding checkpoint folders
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Checkpoint directory to resume from, or "latest"
    #[arg(long)]
    pub resume_from_checkpoint: Option<String>,

    #[arg(long, default_value_t = 2e-5)]
    pub lr: f64,

    #[arg(long, default_value_t = 3)]
    pub num_epochs: usize,

    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 100)]
    pub warmup_steps: usize,

    /// Micro-batches per optimizer update
    #[arg(long, default_value_t = 1)]
    pub grad_accum: usize,

    /// Token truncation length
    #[arg(long, default_value_t = 128)]
    pub max_len: usize,

    /// Pad every batch to this fixed length instead of to the longest row
    #[arg(long)]
    pub pad_to_length: Option<usize>,

    /// Use the deterministic synthetic data provider
    #[arg(long, action)]
    pub synthetic: bool,

    #[arg(long, default_value_t = 10)]
    pub synthetic_batches: usize,

    /// Directory containing train.jsonl / validation.jsonl
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// tokenizer.json path (default: <data>/tokenizer.json)
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    #[arg(long, default_value_t = 128)]
    pub dim: usize,

    #[arg(long, default_value_t = 2)]
    pub layers: usize,
}
