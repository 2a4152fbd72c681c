//! JSONL sentence-pair provider
//!
//! One record per line: `{"sentence1": ..., "sentence2": ..., "label": 0|1}`.
//! Pairs are tokenized up front; batches are padded to the longest sequence
//! in the batch, or to a fixed length when the backend wants static shapes.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::info;

use super::{Batch, BatchProvider};

#[derive(Deserialize)]
struct PairRecord {
    sentence1: String,
    sentence2: String,
    label: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PadPolicy {
    /// Pad each batch to its longest sequence.
    Longest,
    /// Pad (and truncate) every batch to a fixed length.
    Fixed(usize),
}

struct EncodedPair {
    ids: Vec<u32>,
    label: u32,
}

pub struct JsonlProvider {
    examples: Vec<EncodedPair>,
    order: Vec<usize>,
    batch_size: usize,
    pad: PadPolicy,
    shuffle_seed: Option<u64>,
}

impl JsonlProvider {
    /// `shuffle_seed: Some(_)` reshuffles the example order at each epoch
    /// boundary, deterministically from (seed, epoch). Resumed runs that skip
    /// batches therefore skip the same examples the original run consumed.
    pub fn load<P: AsRef<Path>>(
        path: P,
        tokenizer: &Tokenizer,
        batch_size: usize,
        max_len: usize,
        pad: PadPolicy,
        shuffle_seed: Option<u64>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open dataset {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut examples = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: PairRecord = serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: bad record", path.display(), lineno + 1))?;
            let encoding = tokenizer
                .encode((record.sentence1.as_str(), record.sentence2.as_str()), true)
                .map_err(|e| anyhow!("tokenization failed at {}:{}: {e}", path.display(), lineno + 1))?;
            let mut ids = encoding.get_ids().to_vec();
            ids.truncate(max_len);
            if ids.is_empty() {
                continue;
            }
            examples.push(EncodedPair {
                ids,
                label: record.label,
            });
        }

        if examples.len() < batch_size {
            bail!(
                "dataset {} has {} usable examples, need at least one batch of {}",
                path.display(),
                examples.len(),
                batch_size
            );
        }
        info!(
            "Loaded {} examples from {} ({} batches/epoch)",
            examples.len(),
            path.display(),
            examples.len() / batch_size
        );

        let order = (0..examples.len()).collect();
        Ok(Self {
            examples,
            order,
            batch_size,
            pad,
            shuffle_seed,
        })
    }
}

impl BatchProvider for JsonlProvider {
    fn num_batches(&self) -> usize {
        // Trailing partial batch is dropped.
        self.examples.len() / self.batch_size
    }

    fn begin_epoch(&mut self, epoch: usize) {
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            self.order.shuffle(&mut rng);
        }
    }

    fn batch(&mut self, index: usize, device: &Device) -> Result<Batch> {
        let start = index * self.batch_size;
        let picks = &self.order[start..start + self.batch_size];
        let rows: Vec<(&[u32], u32)> = picks
            .iter()
            .map(|&i| {
                let ex = &self.examples[i];
                (ex.ids.as_slice(), ex.label)
            })
            .collect();
        let (ids, mask, labels, seq_len) = pad_batch(&rows, self.pad);

        let input_ids = Tensor::from_vec(ids, (self.batch_size, seq_len), device)?;
        let attention_mask = Tensor::from_vec(mask, (self.batch_size, seq_len), device)?;
        let labels = Tensor::from_vec(labels, self.batch_size, device)?;
        Ok(Batch {
            input_ids,
            attention_mask,
            labels,
        })
    }
}

/// Flatten a batch of variable-length rows into padded id/mask buffers.
fn pad_batch(rows: &[(&[u32], u32)], pad: PadPolicy) -> (Vec<u32>, Vec<f32>, Vec<u32>, usize) {
    let seq_len = match pad {
        PadPolicy::Fixed(len) => len,
        PadPolicy::Longest => rows.iter().map(|(ids, _)| ids.len()).max().unwrap_or(1),
    }
    .max(1);

    let mut ids = Vec::with_capacity(rows.len() * seq_len);
    let mut mask = Vec::with_capacity(rows.len() * seq_len);
    let mut labels = Vec::with_capacity(rows.len());
    for (row, label) in rows {
        let take = row.len().min(seq_len);
        ids.extend_from_slice(&row[..take]);
        mask.extend(std::iter::repeat(1f32).take(take));
        ids.extend(std::iter::repeat(0u32).take(seq_len - take));
        mask.extend(std::iter::repeat(0f32).take(seq_len - take));
        labels.push(*label);
    }
    (ids, mask, labels, seq_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_to_longest_in_batch() {
        let rows: Vec<(&[u32], u32)> = vec![(&[1, 2, 3], 1), (&[4], 0)];
        let (ids, mask, labels, seq_len) = pad_batch(&rows, PadPolicy::Longest);
        assert_eq!(seq_len, 3);
        assert_eq!(ids, vec![1, 2, 3, 4, 0, 0]);
        assert_eq!(mask, vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
        assert_eq!(labels, vec![1, 0]);
    }

    #[test]
    fn fixed_padding_truncates_long_rows() {
        let rows: Vec<(&[u32], u32)> = vec![(&[1, 2, 3, 4, 5], 1)];
        let (ids, mask, _, seq_len) = pad_batch(&rows, PadPolicy::Fixed(4));
        assert_eq!(seq_len, 4);
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(mask, vec![1.0; 4]);
    }

    #[test]
    fn record_lines_parse() {
        let line = r#"{"sentence1": "a b", "sentence2": "c", "label": 1}"#;
        let record: PairRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.sentence1, "a b");
        assert_eq!(record.label, 1);
    }
}
