//! RMSNorm - length-normalize and scale
//!
//! Normalizes the last axis to unit L2 length and rescales by `sqrt(dim)`,
//! which is the same as dividing by the root mean square. The learned gain is
//! dropped when a layer is driven by an adaptive conditioning function.

use anyhow::Result;
use burn::{
    module::{Module, Param},
    prelude::*,
    tensor::{backend::Backend, Tensor},
};

use crate::loader::LoadedWeights;

/// Smallest norm `F.normalize`-style division is allowed to see
const NORM_EPS: f64 = 1e-12;

/// RMSNorm configuration
#[derive(Config, Debug)]
pub struct RmsNormConfig {
    pub dim: usize,
    /// Learn a per-feature gain
    #[config(default = true)]
    pub affine: bool,
}

impl RmsNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> RmsNorm<B> {
        let gamma = self
            .affine
            .then(|| Param::from_tensor(Tensor::ones([self.dim], device)));

        RmsNorm {
            gamma,
            scale: (self.dim as f64).sqrt(),
        }
    }
}

/// RMSNorm module
#[derive(Module, Debug)]
pub struct RmsNorm<B: Backend> {
    gamma: Option<Param<Tensor<B, 1>>>,
    #[module(skip)]
    scale: f64,
}

impl<B: Backend> RmsNorm<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let norm = x
            .clone()
            .powf_scalar(2.0)
            .sum_dim(D - 1)
            .sqrt()
            .clamp_min(NORM_EPS);
        let normalized = (x / norm) * self.scale;

        match &self.gamma {
            Some(gamma) => normalized * gamma.val().unsqueeze::<D>(),
            None => normalized,
        }
    }

    pub fn is_affine(&self) -> bool {
        self.gamma.is_some()
    }

    /// Load the gain from `{prefix}.gamma` (no-op for non-affine norms)
    pub fn load_weights(
        &mut self,
        weights: &LoadedWeights,
        prefix: &str,
        device: &B::Device,
    ) -> Result<()> {
        if let Some(current) = self.gamma.as_mut() {
            let gamma = weights.tensor::<B, 1>(&format!("{prefix}.gamma"), device)?;
            let [dim] = current.val().dims();
            let [loaded] = gamma.dims();
            if loaded != dim {
                anyhow::bail!("Weight '{prefix}.gamma' has shape [{loaded}], expected [{dim}]");
            }
            *current = Param::from_tensor(gamma);
        }
        Ok(())
    }
}
