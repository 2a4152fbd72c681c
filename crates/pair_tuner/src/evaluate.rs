//! Evaluation: accuracy and F1 over a validation split
//!
//! Used in two places: the per-epoch evaluation phase of the training loop,
//! and the standalone `evaluate` subcommand which loads a checkpoint.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use candle_core::{Device, D};
use candle_nn::{VarBuilder, VarMap};
use clap::Args;
use tokenizers::Tokenizer;
use tracing::info;

use crate::data::{BatchProvider, JsonlProvider, PadPolicy, SyntheticProvider};
use crate::model::PairClassifier;
use crate::session::{Precision, Session};
use crate::train::checkpoint;

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    /// Checkpoint directory to evaluate
    #[arg(long)]
    pub checkpoint: PathBuf,

    /// Directory containing validation.jsonl
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// tokenizer.json path (default: <data>/tokenizer.json)
    #[arg(long)]
    pub tokenizer: Option<PathBuf>,

    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 128)]
    pub max_len: usize,

    #[arg(long, action)]
    pub cpu: bool,

    /// Evaluate against the synthetic provider instead of a dataset
    #[arg(long, action)]
    pub synthetic: bool,

    #[arg(long, default_value_t = 10)]
    pub synthetic_batches: usize,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub accuracy: f64,
    pub f1: f64,
    pub examples: usize,
}

pub fn run(args: EvaluateArgs) -> Result<()> {
    info!("--- Evaluation ---");
    info!("Checkpoint: {}", args.checkpoint.display());

    let session = Session::new(args.cpu, Precision::No)?;
    let model_config = checkpoint::load_model_config(&args.checkpoint)?;

    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, candle_core::DType::F32, &session.device);
    let model = PairClassifier::new(&model_config, vb)?;
    varmap
        .load(args.checkpoint.join("model.safetensors"))
        .with_context(|| format!("failed to load weights from {}", args.checkpoint.display()))?;
    info!("✅ Checkpoint loaded.");

    let mut provider: Box<dyn BatchProvider> = if args.synthetic {
        Box::new(SyntheticProvider::new(
            args.synthetic_batches,
            args.batch_size,
            32,
            model_config.vocab_size,
            model_config.num_labels,
            args.seed,
        ))
    } else {
        let data_dir = args
            .data
            .as_ref()
            .ok_or_else(|| anyhow!("--data is required unless --synthetic is set"))?;
        let tokenizer_path = args
            .tokenizer
            .clone()
            .unwrap_or_else(|| data_dir.join("tokenizer.json"));
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer {}: {e}", tokenizer_path.display()))?;
        Box::new(JsonlProvider::load(
            data_dir.join("validation.jsonl"),
            &tokenizer,
            args.batch_size,
            args.max_len,
            PadPolicy::Longest,
            None,
        )?)
    };

    let metrics = evaluate_provider(&model, provider.as_mut(), &session.device)?;
    info!(
        "accuracy: {:.4} | f1: {:.4} ({} examples)",
        metrics.accuracy, metrics.f1, metrics.examples
    );
    Ok(())
}

/// Run the model over every batch of a provider and aggregate metrics.
pub fn evaluate_provider(
    model: &PairClassifier,
    data: &mut dyn BatchProvider,
    device: &Device,
) -> Result<EvalMetrics> {
    let mut predictions = Vec::new();
    let mut references = Vec::new();
    for index in 0..data.num_batches() {
        let batch = data.batch(index, device)?;
        let logits = model.forward(&batch.input_ids, &batch.attention_mask)?;
        let preds = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
        let labels = batch.labels.to_vec1::<u32>()?;
        predictions.extend(preds);
        references.extend(labels);
    }
    Ok(classification_metrics(&predictions, &references))
}

/// Accuracy plus binary F1 with label 1 as the positive class.
pub fn classification_metrics(predictions: &[u32], references: &[u32]) -> EvalMetrics {
    let examples = references.len();
    if examples == 0 {
        return EvalMetrics {
            accuracy: 0.0,
            f1: 0.0,
            examples: 0,
        };
    }

    let mut correct = 0usize;
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut fn_ = 0usize;
    for (&p, &r) in predictions.iter().zip(references.iter()) {
        if p == r {
            correct += 1;
        }
        match (p, r) {
            (1, 1) => tp += 1,
            (1, _) => fp += 1,
            (_, 1) => fn_ += 1,
            _ => {}
        }
    }

    let accuracy = correct as f64 / examples as f64;
    let denom = 2 * tp + fp + fn_;
    let f1 = if denom == 0 {
        0.0
    } else {
        2.0 * tp as f64 / denom as f64
    };
    EvalMetrics {
        accuracy,
        f1,
        examples,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions_score_one() {
        let m = classification_metrics(&[0, 1, 1, 0], &[0, 1, 1, 0]);
        assert_eq!(m.accuracy, 1.0);
        assert_eq!(m.f1, 1.0);
        assert_eq!(m.examples, 4);
    }

    #[test]
    fn mixed_predictions() {
        // preds: TP, FP, FN, TN
        let m = classification_metrics(&[1, 1, 0, 0], &[1, 0, 1, 0]);
        assert_eq!(m.accuracy, 0.5);
        // f1 = 2*1 / (2*1 + 1 + 1) = 0.5
        assert_eq!(m.f1, 0.5);
    }

    #[test]
    fn empty_input_is_zero_not_nan() {
        let m = classification_metrics(&[], &[]);
        assert_eq!(m.accuracy, 0.0);
        assert_eq!(m.f1, 0.0);
    }
}
