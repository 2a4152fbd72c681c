//! Synthetic provider
//!
//! Deterministic random batches for smoke tests and dry runs. Selected
//! explicitly at startup with `--synthetic`, no test-only patching of the
//! data path.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Batch, BatchProvider};

pub struct SyntheticProvider {
    batches: usize,
    batch_size: usize,
    seq_len: usize,
    vocab_size: usize,
    num_labels: usize,
    seed: u64,
    epoch: usize,
}

impl SyntheticProvider {
    pub fn new(
        batches: usize,
        batch_size: usize,
        seq_len: usize,
        vocab_size: usize,
        num_labels: usize,
        seed: u64,
    ) -> Self {
        Self {
            batches,
            batch_size,
            seq_len,
            vocab_size,
            num_labels,
            seed,
            epoch: 0,
        }
    }
}

impl BatchProvider for SyntheticProvider {
    fn num_batches(&self) -> usize {
        self.batches
    }

    fn begin_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    fn batch(&mut self, index: usize, device: &Device) -> Result<Batch> {
        // Batch content depends only on (seed, epoch, index), so a resumed
        // run sees the same data a fresh run would.
        let key = self
            .seed
            .wrapping_add((self.epoch as u64) << 32)
            .wrapping_add(index as u64);
        let mut rng = StdRng::seed_from_u64(key);

        let n = self.batch_size * self.seq_len;
        let ids: Vec<u32> = (0..n)
            .map(|_| rng.gen_range(0..self.vocab_size as u32))
            .collect();
        let labels: Vec<u32> = (0..self.batch_size)
            .map(|_| rng.gen_range(0..self.num_labels as u32))
            .collect();

        let input_ids = Tensor::from_vec(ids, (self.batch_size, self.seq_len), device)?;
        let attention_mask = Tensor::ones((self.batch_size, self.seq_len), DType::F32, device)?;
        let labels = Tensor::from_vec(labels, self.batch_size, device)?;
        Ok(Batch {
            input_ids,
            attention_mask,
            labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_are_deterministic_per_epoch_and_index() -> Result<()> {
        let device = Device::Cpu;
        let mut a = SyntheticProvider::new(4, 2, 8, 100, 2, 7);
        let mut b = SyntheticProvider::new(4, 2, 8, 100, 2, 7);
        a.begin_epoch(1);
        b.begin_epoch(1);
        let ba = a.batch(2, &device)?.input_ids.to_vec2::<u32>()?;
        let bb = b.batch(2, &device)?.input_ids.to_vec2::<u32>()?;
        assert_eq!(ba, bb);

        b.begin_epoch(2);
        let bc = b.batch(2, &device)?.input_ids.to_vec2::<u32>()?;
        assert_ne!(ba, bc);
        Ok(())
    }

    #[test]
    fn shapes_match_configuration() -> Result<()> {
        let device = Device::Cpu;
        let mut p = SyntheticProvider::new(3, 4, 16, 50, 2, 0);
        assert_eq!(p.num_batches(), 3);
        let batch = p.batch(0, &device)?;
        assert_eq!(batch.input_ids.dims(), &[4, 16]);
        assert_eq!(batch.attention_mask.dims(), &[4, 16]);
        assert_eq!(batch.labels.dims(), &[4]);
        Ok(())
    }
}
