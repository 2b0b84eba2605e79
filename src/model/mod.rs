//! Q-Transformer model implementation using Burn
//!
//! Implements an autoregressive multi-action Q-value decoder with:
//! - RMSNorm (length normalization scaled by sqrt(dim))
//! - Causal attention with learned memory key/values
//! - KV-cache threaded explicitly through every decode step
//! - Dueling (value + centered advantage) Q-value head

mod attend;
mod attention;
mod embedding;
mod feedforward;
mod heads;
mod normalization;
mod q_head;
mod qtransformer;
mod transformer;

pub use attend::{causal_mask, Attend, AttendConfig, MASK_VALUE};
pub use attention::{KvCache, TransformerAttention, TransformerAttentionConfig};
pub use embedding::{
    one_hot_actions, ActionEmbedding, ActionEmbeddingConfig, StateEncoder, StateEncoderConfig,
};
pub use feedforward::{FeedForward, FeedForwardConfig};
pub use heads::{DuelingHead, DuelingHeadConfig, ValueHead, ValueHeadConfig};
pub use normalization::{RmsNorm, RmsNormConfig};
pub use q_head::{DecodeState, QHeadConfig, QHeadMultipleActions};
pub use qtransformer::{QTransformer, QTransformerConfig};
pub use transformer::{Transformer, TransformerCache, TransformerConfig, TransformerLayer};

use burn::tensor::{backend::Backend, Tensor};

/// Adaptive conditioning applied to normalized activations before projection
pub type CondFn<B> = dyn Fn(Tensor<B, 3>) -> Tensor<B, 3>;

/// Greedy bin per row of `q_values` (batch, bins).
///
/// Ties go to the lowest bin index.
pub fn argmax_first<B: Backend>(q_values: Tensor<B, 2>) -> Vec<usize> {
    let [_, bins] = q_values.dims();
    let values: Vec<f32> = q_values.into_data().iter::<f32>().collect();

    values
        .chunks(bins.max(1))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, best_value), (bin, &value)| {
                    if value > best_value {
                        (bin, value)
                    } else {
                        (best, best_value)
                    }
                })
                .0
        })
        .collect()
}
