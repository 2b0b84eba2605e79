//! Q-value heads mapping transformer tokens to per-bin values

use anyhow::Result;
use burn::{
    module::{Module, Param},
    nn::{Initializer, Linear, LinearConfig},
    prelude::*,
    tensor::{
        activation::{relu, sigmoid, silu},
        backend::Backend,
        Tensor,
    },
};

use crate::loader::{load_linear, LoadedWeights};

/// Dueling head configuration
#[derive(Config, Debug)]
pub struct DuelingHeadConfig {
    pub dim: usize,
    #[config(default = 2)]
    pub expansion_factor: usize,
    #[config(default = 256)]
    pub action_bins: usize,
}

impl DuelingHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DuelingHead<B> {
        let dim_hidden = self.dim * self.expansion_factor;

        DuelingHead {
            stem: LinearConfig::new(self.dim, dim_hidden).init(device),
            to_values: LinearConfig::new(dim_hidden, 1).init(device),
            to_advantages: LinearConfig::new(dim_hidden, self.action_bins).init(device),
        }
    }
}

/// Dueling head: `sigmoid(value + advantage - mean(advantage))`
#[derive(Module, Debug)]
pub struct DuelingHead<B: Backend> {
    stem: Linear<B>,
    to_values: Linear<B>,
    to_advantages: Linear<B>,
}

impl<B: Backend> DuelingHead<B> {
    /// (batch, n, dim) -> (batch, n, action_bins), every entry in (0, 1)
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = silu(self.stem.forward(x));
        let values = self.to_values.forward(hidden.clone());
        let advantages = self.centered_advantages(hidden);

        sigmoid(values + advantages)
    }

    /// Per-bin advantages with their mean over the bins removed
    pub fn advantages(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.centered_advantages(silu(self.stem.forward(x)))
    }

    fn centered_advantages(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let advantages = self.to_advantages.forward(hidden);
        advantages.clone() - advantages.mean_dim(2)
    }

    pub fn load_weights(
        &mut self,
        weights: &LoadedWeights,
        prefix: &str,
        device: &B::Device,
    ) -> Result<()> {
        load_linear(&mut self.stem, weights, &format!("{prefix}.stem.0"), device)?;
        load_linear(&mut self.to_values, weights, &format!("{prefix}.to_values.0"), device)?;
        load_linear(
            &mut self.to_advantages,
            weights,
            &format!("{prefix}.to_advantages.0"),
            device,
        )
    }
}

/// Plain MLP value head configuration
#[derive(Config, Debug)]
pub struct ValueHeadConfig {
    pub dim: usize,
    #[config(default = 256)]
    pub action_bins: usize,
    /// Added to every bias after initialization
    #[config(default = 0.5)]
    pub bias_shift: f64,
}

impl ValueHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ValueHead<B> {
        let init = Initializer::KaimingNormal {
            gain: 2.0_f64.sqrt(),
            fan_out_only: false,
        };
        let linear = |d_input: usize, d_output: usize| {
            let mut linear = LinearConfig::new(d_input, d_output)
                .with_initializer(init.clone())
                .init(device);
            // Kaiming weights, uniform fan-in biases.
            let bound = (d_input as f64).powf(-0.5);
            let bias: Param<Tensor<B, 1>> = Initializer::Uniform {
                min: -bound,
                max: bound,
            }
            .init([d_output], device);
            linear.bias = Some(Param::from_tensor(bias.val() + self.bias_shift));
            linear
        };

        ValueHead {
            linear_1: linear(self.dim, self.action_bins),
            linear_2: linear(self.action_bins, self.action_bins),
        }
    }
}

/// Linear -> ReLU -> linear value head, unbounded output
#[derive(Module, Debug)]
pub struct ValueHead<B: Backend> {
    linear_1: Linear<B>,
    linear_2: Linear<B>,
}

impl<B: Backend> ValueHead<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.linear_2.forward(relu(self.linear_1.forward(x)))
    }

    pub fn load_weights(
        &mut self,
        weights: &LoadedWeights,
        prefix: &str,
        device: &B::Device,
    ) -> Result<()> {
        load_linear(&mut self.linear_1, weights, &format!("{prefix}.linear_1"), device)?;
        load_linear(&mut self.linear_2, weights, &format!("{prefix}.linear_2"), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn tokens(shape: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::random(shape, Distribution::Normal(0.0, 3.0), &Default::default())
    }

    #[test]
    fn advantages_have_zero_mean() {
        let device = Default::default();
        let head: DuelingHead<TestBackend> = DuelingHeadConfig::new(8)
            .with_action_bins(16)
            .init(&device);

        let means = head.advantages(tokens([3, 4, 8])).mean_dim(2);
        let worst: f32 = means.abs().max().into_scalar();
        assert!(worst < 1e-5, "advantage mean {worst}");
    }

    #[test]
    fn dueling_q_values_are_bounded() {
        let device = Default::default();
        let head: DuelingHead<TestBackend> = DuelingHeadConfig::new(8)
            .with_action_bins(16)
            .init(&device);

        let q = head.forward(tokens([2, 5, 8]));
        assert_eq!(q.dims(), [2, 5, 16]);
        assert!(q.into_data().iter::<f32>().all(|v| v > 0.0 && v < 1.0));
    }

    #[test]
    fn value_head_biases_are_shifted() {
        let device = Default::default();
        let head: ValueHead<TestBackend> = ValueHeadConfig::new(8)
            .with_action_bins(4096)
            .init(&device);

        let bias = head.linear_2.bias.as_ref().map(|bias| bias.val());
        let mean: f32 = bias.map(|bias| bias.mean().into_scalar()).unwrap_or_default();
        assert!((mean - 0.5).abs() < 0.05, "bias mean {mean}");
    }

    #[test]
    fn value_head_biases_stay_within_fan_in_bound() {
        let device = Default::default();
        let head: ValueHead<TestBackend> = ValueHeadConfig::new(8)
            .with_action_bins(4096)
            .init(&device);

        let bound = 8.0f32.powf(-0.5);
        let bias: Vec<f32> = head
            .linear_1
            .bias
            .as_ref()
            .map(|bias| bias.val().into_data().iter::<f32>().collect())
            .unwrap_or_default();
        assert_eq!(bias.len(), 4096);
        assert!(bias.iter().all(|b| (b - 0.5).abs() <= bound + 1e-6));
    }
}
