//! Observation and action embeddings
//!
//! The state encoder turns one observation into one token. Actions are
//! embedded from their one-hot bin with an independent projection per action
//! slot, so slot `i` only ever learns from action `i`.

use anyhow::Result;
use burn::{
    module::Module,
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::{activation::relu, backend::Backend, Int, Tensor},
};

use crate::loader::{load_linear, LoadedWeights};

/// One-hot encode action bins: (batch, n) -> (batch, n, action_bins)
pub fn one_hot_actions<B: Backend>(actions: Tensor<B, 2, Int>, action_bins: usize) -> Tensor<B, 3> {
    let [batch, num_actions] = actions.dims();
    let device = actions.device();

    Tensor::zeros([batch, num_actions, action_bins], &device).scatter(
        2,
        actions.unsqueeze_dim(2),
        Tensor::ones([batch, num_actions, 1], &device),
    )
}

/// Action embedding configuration
#[derive(Config, Debug)]
pub struct ActionEmbeddingConfig {
    pub dim: usize,
    pub action_bins: usize,
    pub num_actions: usize,
}

impl ActionEmbeddingConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ActionEmbedding<B> {
        ActionEmbedding {
            slots: (0..self.num_actions)
                .map(|_| LinearConfig::new(self.action_bins, self.dim).init(device))
                .collect(),
            action_bins: self.action_bins,
        }
    }
}

/// Per-slot action embedding
#[derive(Module, Debug)]
pub struct ActionEmbedding<B: Backend> {
    slots: Vec<Linear<B>>,
    #[module(skip)]
    action_bins: usize,
}

impl<B: Backend> ActionEmbedding<B> {
    /// Embed the first `n` action slots: (batch, n) bins -> (batch, n, dim)
    pub fn forward(&self, actions: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.forward_one_hot(one_hot_actions(actions, self.action_bins))
    }

    /// Embed one-hot (or soft) bin vectors: (batch, n, action_bins) -> (batch, n, dim)
    pub fn forward_one_hot(&self, one_hot: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, num_actions, action_bins] = one_hot.dims();
        assert!(
            num_actions <= self.slots.len(),
            "{num_actions} actions given but only {} embedding slots exist",
            self.slots.len()
        );
        assert!(num_actions > 0, "at least one action is needed to embed");
        assert_eq!(action_bins, self.action_bins, "unexpected number of action bins");

        let tokens = self
            .slots
            .iter()
            .enumerate()
            .take(num_actions)
            .map(|(i, slot)| {
                let slice = one_hot
                    .clone()
                    .slice([0..batch, i..i + 1, 0..action_bins]);
                slot.forward(slice)
            })
            .collect();

        Tensor::cat(tokens, 1)
    }

    pub fn load_weights(
        &mut self,
        weights: &LoadedWeights,
        prefix: &str,
        device: &B::Device,
    ) -> Result<()> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            load_linear(slot, weights, &format!("{prefix}.linear_layers.{i}"), device)?;
        }
        Ok(())
    }
}

/// State encoder configuration
#[derive(Config, Debug)]
pub struct StateEncoderConfig {
    pub obs_dim: usize,
    pub dim: usize,
    #[config(default = 256)]
    pub hidden_dim: usize,
}

impl StateEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> StateEncoder<B> {
        StateEncoder {
            fc_1: LinearConfig::new(self.obs_dim, self.hidden_dim).init(device),
            fc_2: LinearConfig::new(self.hidden_dim, self.dim).init(device),
        }
    }
}

/// Linear -> ReLU -> linear observation encoder
#[derive(Module, Debug)]
pub struct StateEncoder<B: Backend> {
    fc_1: Linear<B>,
    fc_2: Linear<B>,
}

impl<B: Backend> StateEncoder<B> {
    /// (batch, obs_dim) -> (batch, 1, dim)
    pub fn forward(&self, obs: Tensor<B, 2>) -> Tensor<B, 3> {
        let x = relu(self.fc_1.forward(obs));
        self.fc_2.forward(x).unsqueeze_dim(1)
    }

    pub fn load_weights(
        &mut self,
        weights: &LoadedWeights,
        prefix: &str,
        device: &B::Device,
    ) -> Result<()> {
        load_linear(&mut self.fc_1, weights, &format!("{prefix}.layers.0"), device)?;
        load_linear(&mut self.fc_2, weights, &format!("{prefix}.layers.2"), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray;

    fn actions(values: Vec<i64>, shape: [usize; 2]) -> Tensor<TestBackend, 2, Int> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    #[test]
    fn one_hot_marks_the_chosen_bin() {
        let one_hot = one_hot_actions(actions(vec![2, 0, 3, 1], [2, 2]), 4);
        let values: Vec<f32> = one_hot.into_data().iter::<f32>().collect();

        assert_eq!(
            values,
            vec![
                0.0, 0.0, 1.0, 0.0, //
                1.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 1.0, //
                0.0, 1.0, 0.0, 0.0,
            ]
        );
    }

    #[test]
    fn slots_are_independent() {
        let device = Default::default();
        let embed: ActionEmbedding<TestBackend> = ActionEmbeddingConfig::new(6, 5, 3).init(&device);

        let a = embed.forward(actions(vec![1, 4, 2], [1, 3]));
        let b = embed.forward(actions(vec![1, 0, 2], [1, 3]));

        let same = |t: Tensor<TestBackend, 3>, i: usize| t.slice([0..1, i..i + 1, 0..6]);
        let diff = |x: Tensor<TestBackend, 3>, y: Tensor<TestBackend, 3>| -> f32 {
            (x - y).abs().max().into_scalar()
        };
        assert_eq!(diff(same(a.clone(), 0), same(b.clone(), 0)), 0.0);
        assert_eq!(diff(same(a.clone(), 2), same(b.clone(), 2)), 0.0);
        assert!(diff(same(a, 1), same(b, 1)) > 0.0);
    }

    #[test]
    fn prefix_of_actions_uses_leading_slots() {
        let device = Default::default();
        let embed: ActionEmbedding<TestBackend> = ActionEmbeddingConfig::new(6, 5, 3).init(&device);

        let full = embed.forward(actions(vec![3, 1, 4], [1, 3]));
        let prefix = embed.forward(actions(vec![3, 1], [1, 2]));
        assert_eq!(prefix.dims(), [1, 2, 6]);

        let diff: f32 = (full.slice([0..1, 0..2, 0..6]) - prefix).abs().max().into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    #[should_panic(expected = "embedding slots")]
    fn too_many_actions_panics() {
        let device = Default::default();
        let embed: ActionEmbedding<TestBackend> = ActionEmbeddingConfig::new(6, 5, 2).init(&device);
        embed.forward(actions(vec![0, 1, 2], [1, 3]));
    }

    #[test]
    fn state_encoder_emits_one_token() {
        let device = Default::default();
        let encoder: StateEncoder<TestBackend> = StateEncoderConfig::new(11, 32).init(&device);
        let obs = Tensor::random([4, 11], Distribution::Default, &device);

        assert_eq!(encoder.forward(obs).dims(), [4, 1, 32]);
    }
}
