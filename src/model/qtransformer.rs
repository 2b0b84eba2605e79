//! Q-Transformer policy: state encoder + multi-action Q-head

use anyhow::{anyhow, Result};
use burn::{
    module::Module,
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::{backend::Backend, Distribution, Int, Tensor},
};
use std::path::Path;
use tracing::{debug, info};

use super::{
    embedding::{StateEncoder, StateEncoderConfig},
    q_head::{QHeadConfig, QHeadMultipleActions},
};
use crate::loader::LoadedWeights;

/// Q-Transformer configuration
#[derive(Config, Debug)]
pub struct QTransformerConfig {
    pub num_actions: usize,
    pub action_bins: usize,
    /// Width of every token
    #[config(default = 512)]
    pub dim: usize,
    #[config(default = 11)]
    pub obs_dim: usize,
    #[config(default = 256)]
    pub state_hidden_dim: usize,
    #[config(default = 2)]
    pub attn_depth: usize,
    #[config(default = 64)]
    pub attn_dim_head: usize,
    #[config(default = 8)]
    pub attn_heads: usize,
    #[config(default = 4)]
    pub num_mem_kv: usize,
    #[config(default = true)]
    pub dueling: bool,
    #[config(default = true)]
    pub flash_attn: bool,
}

impl QTransformerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> QTransformer<B> {
        assert!(self.num_actions >= 1, "at least one action dimension is required");

        info!(
            "building q-transformer: obs_dim={} num_actions={} action_bins={} dim={}",
            self.obs_dim, self.num_actions, self.action_bins, self.dim
        );

        QTransformer {
            state_encode: StateEncoderConfig::new(self.obs_dim, self.dim)
                .with_hidden_dim(self.state_hidden_dim)
                .init(device),
            q_head: QHeadConfig::new(self.dim, self.num_actions, self.action_bins)
                .with_attn_depth(self.attn_depth)
                .with_attn_dim_head(self.attn_dim_head)
                .with_attn_heads(self.attn_heads)
                .with_num_mem_kv(self.num_mem_kv)
                .with_dueling(self.dueling)
                .with_flash_attn(self.flash_attn)
                .init(device),
        }
    }
}

/// Q-Transformer policy model
#[derive(Module, Debug)]
pub struct QTransformer<B: Backend> {
    state_encode: StateEncoder<B>,
    q_head: QHeadMultipleActions<B>,
}

impl<B: Backend> QTransformer<B> {
    pub fn num_actions(&self) -> usize {
        self.q_head.num_actions()
    }

    pub fn action_bins(&self) -> usize {
        self.q_head.action_bins()
    }

    pub fn q_head(&self) -> &QHeadMultipleActions<B> {
        &self.q_head
    }

    /// Observations (batch, obs_dim) to state tokens (batch, 1, dim)
    pub fn encode(&self, obs: Tensor<B, 2>) -> Tensor<B, 3> {
        self.state_encode.forward(obs)
    }

    /// Teacher-forced Q-values for ground-truth actions (batch, num_actions)
    pub fn predict_q_values(
        &self,
        state_token: Tensor<B, 3>,
        actions: Tensor<B, 2, Int>,
    ) -> Tensor<B, 3> {
        let [_, num_actions] = actions.dims();
        assert_eq!(
            num_actions,
            self.num_actions(),
            "teacher forcing needs one action per dimension"
        );
        self.q_head.forward(state_token, Some(actions))
    }

    /// Encode and run the Q-head, with or without actions
    pub fn forward(&self, obs: Tensor<B, 2>, actions: Option<Tensor<B, 2, Int>>) -> Tensor<B, 3> {
        let encoded_state = self.encode(obs);
        self.q_head.forward(encoded_state, actions)
    }

    /// Greedy autoregressive actions (batch, num_actions).
    ///
    /// Run on `model.valid()` when training with an autodiff backend so that
    /// dropout is disabled and no graph is recorded.
    pub fn select_actions(&self, obs: Tensor<B, 2>) -> Tensor<B, 2, Int> {
        let [batch, _] = obs.dims();
        debug!("selecting actions for a batch of {}", batch);

        let encoded_state = self.encode(obs.detach()).detach();
        self.q_head.get_optimal_actions(encoded_state)
    }

    /// Uniformly random bins (batch, num_actions)
    pub fn random_actions(&self, batch: usize, device: &B::Device) -> Tensor<B, 2, Int> {
        Tensor::<B, 2>::random(
            [batch, self.num_actions()],
            Distribution::Uniform(0.0, self.action_bins() as f64),
            device,
        )
        .floor()
        .clamp(0.0, (self.action_bins() - 1) as f64)
        .int()
    }

    /// Save parameters as named MessagePack
    pub fn save(self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        info!("Saving checkpoint to: {:?}", path);

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.save_file(path.to_path_buf(), &recorder)
            .map_err(|e| anyhow!("Failed to save checkpoint {:?}: {:?}", path, e))
    }

    /// Load parameters written by [`QTransformer::save`]
    pub fn load(self, path: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading checkpoint from: {:?}", path);

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path.to_path_buf(), &recorder, device)
            .map_err(|e| anyhow!("Failed to load checkpoint {:?}: {:?}", path, e))
    }

    /// Import a PyTorch state dict exported to safetensors
    pub fn load_weights(&mut self, weights: &LoadedWeights, device: &B::Device) -> Result<()> {
        self.state_encode
            .load_weights(weights, "state_encode", device)?;
        self.q_head.load_weights(weights, "q_head", device)?;

        info!("Imported {} weights", weights.tensors.len());
        Ok(())
    }
}
