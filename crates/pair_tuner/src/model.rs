//! Sequence-pair classifier
//!
//! A deliberately small model: token embedding, a stack of pre-norm
//! feed-forward blocks, masked mean pooling, and a linear classification
//! head. Enough to exercise a real forward/backward pass without dragging
//! in a full transformer.

use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub num_labels: usize,
}

struct Block {
    norm: LayerNorm,
    up: Linear,
    down: Linear,
}

impl Block {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.norm.forward(x)?;
        let h = self.up.forward(&h)?.gelu()?;
        let h = self.down.forward(&h)?;
        Ok((x + h)?)
    }
}

pub struct PairClassifier {
    embed: Embedding,
    blocks: Vec<Block>,
    final_norm: LayerNorm,
    head: Linear,
}

impl PairClassifier {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.hidden_dim;
        let embed = embedding(config.vocab_size, dim, vb.pp("embed"))?;
        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let vb = vb.pp(format!("blocks.{i}"));
            blocks.push(Block {
                norm: layer_norm(dim, 1e-5, vb.pp("norm"))?,
                up: linear(dim, dim * 4, vb.pp("up"))?,
                down: linear(dim * 4, dim, vb.pp("down"))?,
            });
        }
        let final_norm = layer_norm(dim, 1e-5, vb.pp("final_norm"))?;
        let head = linear(dim, config.num_labels, vb.pp("head"))?;
        Ok(Self {
            embed,
            blocks,
            final_norm,
            head,
        })
    }

    /// `input_ids`: [B, L] u32, `attention_mask`: [B, L] f32 (1.0 = real token).
    /// Returns logits [B, num_labels].
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let mut x = self.embed.forward(input_ids)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let x = self.final_norm.forward(&x)?;

        // Masked mean pool over the sequence dimension
        let mask = attention_mask.unsqueeze(2)?;
        let summed = x.broadcast_mul(&mask)?.sum(1)?;
        let counts = attention_mask.sum(D::Minus1)?.maximum(1f32)?.unsqueeze(1)?;
        let pooled = summed.broadcast_div(&counts)?;

        Ok(self.head.forward(&pooled)?)
    }
}
