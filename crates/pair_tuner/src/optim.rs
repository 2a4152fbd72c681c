//! AdamW optimizer with persistable moments
//!
//! candle-nn ships an AdamW, but its moment buffers are private and cannot
//! be serialized, so a resumed run would restart with cold moments. This
//! implementation keeps the moments as `Var`s and saves them to a
//! safetensors file alongside the model weights.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor, Var};

#[derive(Clone, Copy, Debug)]
pub struct ParamsAdamW {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for ParamsAdamW {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

pub struct AdamW {
    vars: Vec<Var>,
    m: Vec<Var>,
    v: Vec<Var>,
    params: ParamsAdamW,
    t: usize,
}

impl AdamW {
    pub fn new(vars: Vec<Var>, params: ParamsAdamW) -> Result<Self> {
        let m = vars
            .iter()
            .map(|var| Var::zeros(var.dims(), var.dtype(), var.device()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let v = vars
            .iter()
            .map(|var| Var::zeros(var.dims(), var.dtype(), var.device()))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            m,
            v,
            params,
            t: 0,
        })
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    /// Apply one update from per-variable gradients (indexed like `vars()`).
    /// `loss_scale` undoes mixed-precision loss scaling before the update.
    pub fn step_grads(&mut self, grads: &[Option<Tensor>], loss_scale: f32) -> Result<()> {
        self.t += 1;
        let b1 = self.params.beta1;
        let b2 = self.params.beta2;
        let scale_m = 1.0 / (1.0 - b1.powi(self.t as i32));
        let scale_v = 1.0 / (1.0 - b2.powi(self.t as i32));

        for i in 0..self.vars.len() {
            let Some(grad) = &grads[i] else { continue };
            let grad = if loss_scale != 1.0 {
                (grad / loss_scale as f64)?
            } else {
                grad.clone()
            };
            let theta = &self.vars[i];

            let next_m = ((self.m[i].as_tensor() * b1)? + (&grad * (1.0 - b1))?)?;
            let next_v = ((self.v[i].as_tensor() * b2)? + (grad.sqr()? * (1.0 - b2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let denom = (v_hat.sqrt()? + self.params.eps)?;
            let delta = ((m_hat / denom)? * self.params.lr)?;

            let mut next_theta = (theta.as_tensor() - delta)?;
            if self.params.weight_decay > 0.0 {
                // Decoupled weight decay
                let decay = (theta.as_tensor() * (self.params.lr * self.params.weight_decay))?;
                next_theta = (next_theta - decay)?;
            }

            self.m[i].set(&next_m)?;
            self.v[i].set(&next_v)?;
            self.vars[i].set(&next_theta)?;
        }
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors = HashMap::new();
        for (i, (m, v)) in self.m.iter().zip(self.v.iter()).enumerate() {
            tensors.insert(format!("m{i}"), m.as_tensor().clone());
            tensors.insert(format!("v{i}"), v.as_tensor().clone());
        }
        tensors.insert(
            "t".to_string(),
            Tensor::new(&[self.t as f32], &Device::Cpu)?,
        );
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P, device: &Device) -> Result<()> {
        let tensors = candle_core::safetensors::load(path, device)?;
        for i in 0..self.vars.len() {
            let m = tensors
                .get(&format!("m{i}"))
                .with_context(|| format!("optimizer state is missing moment m{i}"))?;
            let v = tensors
                .get(&format!("v{i}"))
                .with_context(|| format!("optimizer state is missing moment v{i}"))?;
            self.m[i].set(m)?;
            self.v[i].set(v)?;
        }
        let Some(t) = tensors.get("t") else {
            bail!("optimizer state is missing the step counter");
        };
        self.t = t.to_vec1::<f32>()?[0] as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimizes_a_quadratic() -> Result<()> {
        let device = Device::Cpu;
        let x = Var::new(&[5f32], &device)?;
        let mut opt = AdamW::new(
            vec![x.clone()],
            ParamsAdamW {
                lr: 0.1,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        for _ in 0..500 {
            let loss = (x.as_tensor() - 3.0)?.sqr()?.sum_all()?;
            let grads = loss.backward()?;
            let g = grads.get(&x).cloned();
            opt.step_grads(&[g], 1.0)?;
        }
        let v = x.as_tensor().to_vec1::<f32>()?[0];
        assert!((v - 3.0).abs() < 0.1, "x = {v}");
        Ok(())
    }

    #[test]
    fn loss_scale_is_unscaled_before_update() -> Result<()> {
        let device = Device::Cpu;
        let a = Var::new(&[1f32], &device)?;
        let b = Var::new(&[1f32], &device)?;
        let params = ParamsAdamW {
            lr: 0.01,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut opt_a = AdamW::new(vec![a.clone()], params)?;
        let mut opt_b = AdamW::new(vec![b.clone()], params)?;

        let grad = Tensor::new(&[0.5f32], &device)?;
        opt_a.step_grads(&[Some(grad.clone())], 1.0)?;
        let scaled = (&grad * 1024.0)?;
        opt_b.step_grads(&[Some(scaled)], 1024.0)?;

        let va = a.as_tensor().to_vec1::<f32>()?[0];
        let vb = b.as_tensor().to_vec1::<f32>()?[0];
        assert!((va - vb).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn state_survives_save_and_load() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("optimizer.safetensors");

        let x = Var::new(&[2f32], &device)?;
        let mut opt = AdamW::new(vec![x.clone()], ParamsAdamW::default())?;
        let grad = Tensor::new(&[0.25f32], &device)?;
        for _ in 0..3 {
            opt.step_grads(&[Some(grad.clone())], 1.0)?;
        }
        opt.save(&path)?;

        let y = Var::from_tensor(x.as_tensor())?;
        let mut restored = AdamW::new(vec![y.clone()], ParamsAdamW::default())?;
        restored.load(&path, &device)?;

        // The next update must match the original optimizer exactly.
        opt.step_grads(&[Some(grad.clone())], 1.0)?;
        restored.step_grads(&[Some(grad.clone())], 1.0)?;
        let a = x.as_tensor().to_vec1::<f32>()?[0];
        let b = y.as_tensor().to_vec1::<f32>()?[0];
        assert!((a - b).abs() < 1e-6);
        Ok(())
    }
}
