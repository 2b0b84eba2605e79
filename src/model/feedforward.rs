//! Position-wise feed-forward block
//!
//! Pre-normalized two-layer MLP with a GELU gate and dropout after each
//! projection. When `adaptive_ln` is set the norm has no gain of its own and
//! the caller's conditioning function is applied to the normalized input.

use anyhow::Result;
use burn::{
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::*,
    tensor::{activation::gelu, backend::Backend, Tensor},
};

use super::{
    normalization::{RmsNorm, RmsNormConfig},
    CondFn,
};
use crate::loader::{load_linear, LoadedWeights};

/// Feed-forward configuration
#[derive(Config, Debug)]
pub struct FeedForwardConfig {
    pub dim: usize,
    /// Hidden width as a multiple of `dim`
    #[config(default = 4.0)]
    pub mult: f64,
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = false)]
    pub adaptive_ln: bool,
}

impl FeedForwardConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeedForward<B> {
        let inner_dim = (self.dim as f64 * self.mult) as usize;

        FeedForward {
            norm: RmsNormConfig::new(self.dim)
                .with_affine(!self.adaptive_ln)
                .init(device),
            proj_in: LinearConfig::new(self.dim, inner_dim).init(device),
            proj_out: LinearConfig::new(inner_dim, self.dim).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            adaptive_ln: self.adaptive_ln,
        }
    }
}

/// Feed-forward module
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    norm: RmsNorm<B>,
    proj_in: Linear<B>,
    proj_out: Linear<B>,
    dropout: Dropout,
    #[module(skip)]
    adaptive_ln: bool,
}

impl<B: Backend> FeedForward<B> {
    pub fn forward(&self, x: Tensor<B, 3>, cond_fn: Option<&CondFn<B>>) -> Tensor<B, 3> {
        let x = self.norm.forward(x);

        assert_eq!(
            cond_fn.is_some(),
            self.adaptive_ln,
            "a conditioning function must be given exactly when adaptive_ln is enabled"
        );
        let x = match cond_fn {
            Some(cond_fn) => cond_fn(x),
            None => x,
        };

        let hidden = self.dropout.forward(gelu(self.proj_in.forward(x)));
        self.dropout.forward(self.proj_out.forward(hidden))
    }

    /// Load `{prefix}.norm.gamma`, `{prefix}.net.0` and `{prefix}.net.3`
    pub fn load_weights(
        &mut self,
        weights: &LoadedWeights,
        prefix: &str,
        device: &B::Device,
    ) -> Result<()> {
        self.norm
            .load_weights(weights, &format!("{prefix}.norm"), device)?;
        load_linear(&mut self.proj_in, weights, &format!("{prefix}.net.0"), device)?;
        load_linear(&mut self.proj_out, weights, &format!("{prefix}.net.3"), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn keeps_token_shape() {
        let device = Default::default();
        let ff: FeedForward<TestBackend> = FeedForwardConfig::new(8).init(&device);
        let x = Tensor::random([2, 3, 8], Distribution::Default, &device);

        assert_eq!(ff.forward(x, None).dims(), [2, 3, 8]);
    }

    #[test]
    fn adaptive_block_applies_condition() {
        let device = Default::default();
        let ff: FeedForward<TestBackend> = FeedForwardConfig::new(8)
            .with_adaptive_ln(true)
            .init(&device);
        let x = Tensor::random([1, 2, 8], Distribution::Default, &device);

        let silence = |t: Tensor<TestBackend, 3>| t.zeros_like();
        let zeroed = ff.forward(x.clone(), Some(&silence));
        let identity = |t: Tensor<TestBackend, 3>| t;
        let passed = ff.forward(x, Some(&identity));

        let diff: f32 = (zeroed - passed).abs().sum().into_scalar();
        assert!(diff > 0.0);
    }

    #[test]
    #[should_panic(expected = "adaptive_ln")]
    fn condition_without_adaptive_ln_panics() {
        let device = Default::default();
        let ff: FeedForward<TestBackend> = FeedForwardConfig::new(4).init(&device);
        let identity = |t: Tensor<TestBackend, 3>| t;

        ff.forward(Tensor::zeros([1, 1, 4], &device), Some(&identity));
    }
}
