//! Model configuration as exchanged with training pipelines

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::model::QTransformerConfig;

/// Model configuration, defaults tuned for the D4RL walker2d setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Experiment-facing model name
    pub name: String,
    /// Observation vector length
    pub obs_dim: usize,
    /// Number of action dimensions decoded per step
    pub num_actions: usize,
    /// Discrete bins per action dimension
    pub action_bins: usize,
    /// Token width
    pub dim: usize,
    /// State encoder hidden width
    pub state_hidden_dim: usize,
    /// Transformer layers in the Q-head
    pub attn_depth: usize,
    /// Attention heads
    pub attn_heads: usize,
    /// Width of each attention head
    pub attn_dim_head: usize,
    /// Learned memory key/values per attention layer
    pub num_mem_kv: usize,
    /// Use the bounded dueling head. Exported PyTorch checkpoints carry the
    /// MLP value head instead and need `false`.
    pub dueling: bool,
    /// Use the fused attention path
    pub flash_attn: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "walker2d-qtransformer".to_string(),
            obs_dim: 11,
            num_actions: 7,
            action_bins: 256,
            dim: 512,
            state_hidden_dim: 256,
            attn_depth: 2,
            attn_heads: 8,
            attn_dim_head: 64,
            num_mem_kv: 4,
            dueling: true,
            flash_attn: true,
        }
    }
}

impl ModelConfig {
    /// Read a JSON model configuration; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).with_context(|| format!("Failed to write config: {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_actions == 0 {
            anyhow::bail!("num_actions must be at least 1");
        }
        if self.action_bins == 0 {
            anyhow::bail!("action_bins must be at least 1");
        }
        if self.attn_heads == 0 || self.attn_dim_head == 0 {
            anyhow::bail!("attention needs at least one head of non-zero width");
        }
        Ok(())
    }
}

impl From<&ModelConfig> for QTransformerConfig {
    fn from(config: &ModelConfig) -> Self {
        QTransformerConfig::new(config.num_actions, config.action_bins)
            .with_dim(config.dim)
            .with_obs_dim(config.obs_dim)
            .with_state_hidden_dim(config.state_hidden_dim)
            .with_attn_depth(config.attn_depth)
            .with_attn_heads(config.attn_heads)
            .with_attn_dim_head(config.attn_dim_head)
            .with_num_mem_kv(config.num_mem_kv)
            .with_dueling(config.dueling)
            .with_flash_attn(config.flash_attn)
    }
}
