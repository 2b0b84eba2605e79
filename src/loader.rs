//! Pretrained weight loader
//!
//! Reads safetensors state dicts exported from the PyTorch Q-Transformer and
//! exposes them by parameter name so each module can pull its own tensors.

use anyhow::{Context, Result};
use burn::{
    module::Param,
    nn::Linear,
    tensor::{backend::Backend, Tensor, TensorData},
};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Weights loaded from a safetensors file, converted to f32
#[derive(Debug, Default, Clone)]
pub struct LoadedWeights {
    pub tensors: HashMap<String, Vec<f32>>,
    pub shapes: HashMap<String, Vec<usize>>,
}

impl LoadedWeights {
    /// Register a tensor by name (used when building weights in memory)
    pub fn insert(&mut self, name: impl Into<String>, data: Vec<f32>, shape: Vec<usize>) {
        let name = name.into();
        self.tensors.insert(name.clone(), data);
        self.shapes.insert(name, shape);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Get a tensor of rank `D` by name
    pub fn tensor<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        let data = self
            .tensors
            .get(name)
            .with_context(|| format!("Weight '{}' not found", name))?;
        let shape = self
            .shapes
            .get(name)
            .with_context(|| format!("Shape for '{}' not found", name))?;

        if shape.len() != D {
            anyhow::bail!("Expected {}D tensor for '{}', got {}D", D, name, shape.len());
        }

        let tensor_data = TensorData::new(data.clone(), shape.clone());
        Ok(Tensor::from_data(tensor_data, device))
    }
}

/// Copy `{prefix}.weight` (and `{prefix}.bias` when the layer has one) into a linear layer.
///
/// PyTorch stores linear weights as `[out, in]`, Burn as `[in, out]`.
pub fn load_linear<B: Backend>(
    linear: &mut Linear<B>,
    weights: &LoadedWeights,
    prefix: &str,
    device: &B::Device,
) -> Result<()> {
    let weight = weights.tensor::<B, 2>(&format!("{prefix}.weight"), device)?;
    let [d_input, d_output] = linear.weight.val().dims();
    let [out_features, in_features] = weight.dims();
    if (in_features, out_features) != (d_input, d_output) {
        anyhow::bail!(
            "Weight '{prefix}.weight' has shape [{out_features}, {in_features}], expected [{d_output}, {d_input}]"
        );
    }
    linear.weight = Param::from_tensor(weight.transpose());

    if linear.bias.is_some() {
        let bias = weights.tensor::<B, 1>(&format!("{prefix}.bias"), device)?;
        let [bias_len] = bias.dims();
        if bias_len != d_output {
            anyhow::bail!("Weight '{prefix}.bias' has shape [{bias_len}], expected [{d_output}]");
        }
        linear.bias = Some(Param::from_tensor(bias));
    }

    Ok(())
}

/// Weight loader for exported Q-Transformer checkpoints
#[derive(Debug, Default)]
pub struct WeightLoader;

impl WeightLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load weights from a safetensors file
    pub fn load_safetensors(&self, path: impl AsRef<Path>) -> Result<LoadedWeights> {
        let path = path.as_ref();
        info!("Loading weights from: {:?}", path);

        let file_data =
            fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))?;

        self.load_bytes(&file_data)
    }

    /// Load weights from an in-memory safetensors buffer
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<LoadedWeights> {
        let tensors =
            SafeTensors::deserialize(bytes).context("Failed to deserialize safetensors")?;

        let mut loaded = LoadedWeights::default();

        for (name, tensor_view) in tensors.tensors() {
            let shape: Vec<usize> = tensor_view.shape().to_vec();
            let bytes = tensor_view.data();

            let data: Vec<f32> = match tensor_view.dtype() {
                safetensors::Dtype::F32 => bytes
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect(),
                safetensors::Dtype::F16 => bytes
                    .chunks_exact(2)
                    .map(|b| half::f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                    .collect(),
                safetensors::Dtype::BF16 => bytes
                    .chunks_exact(2)
                    .map(|b| half::bf16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                    .collect(),
                dtype => {
                    warn!("Unsupported dtype {:?} for tensor {}, skipping", dtype, name);
                    continue;
                }
            };

            loaded.insert(name, data, shape);
        }

        info!("Loaded {} tensors", loaded.tensors.len());

        Ok(loaded)
    }
}
