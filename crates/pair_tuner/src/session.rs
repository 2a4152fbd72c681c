//! Device and precision session
//!
//! Owns device selection and the mixed-precision loss scaler. Reduced
//! precision on the training math itself is a device/kernel concern; what
//! this layer guarantees is the run-state contract: when mixed precision is
//! active, the loss is scaled before backward, gradients are unscaled at the
//! optimizer, and the scaler state travels with every checkpoint.

use anyhow::Result;
use candle_core::Device;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    No,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn is_mixed(&self) -> bool {
        !matches!(self, Precision::No)
    }
}

/// Static loss scaler. State is persisted as `scaler.json` in snapshots.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct LossScaler {
    pub scale: f32,
}

impl LossScaler {
    pub fn for_precision(precision: Precision) -> Option<Self> {
        match precision {
            Precision::No => None,
            // fp16 overflows without scaling; bf16 keeps the f32 exponent range.
            Precision::Fp16 => Some(Self { scale: 65536.0 }),
            Precision::Bf16 => Some(Self { scale: 1.0 }),
        }
    }
}

pub struct Session {
    pub device: Device,
    pub precision: Precision,
}

impl Session {
    pub fn new(cpu: bool, precision: Precision) -> Result<Self> {
        let device = if cpu {
            Device::Cpu
        } else {
            Device::cuda_if_available(0).unwrap_or(Device::Cpu)
        };
        info!("Device initialized: {:?}", device);
        if precision.is_mixed() {
            info!("Mixed precision: {:?}", precision);
        }
        Ok(Self { device, precision })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_precision_has_no_scaler() {
        assert!(!Precision::No.is_mixed());
        assert!(LossScaler::for_precision(Precision::No).is_none());
    }

    #[test]
    fn mixed_precision_carries_scaler_state() {
        let fp16 = LossScaler::for_precision(Precision::Fp16).unwrap();
        assert!(fp16.scale > 1.0);
        let bf16 = LossScaler::for_precision(Precision::Bf16).unwrap();
        assert_eq!(bf16.scale, 1.0);
    }
}
