//! Transformer attention layer with KV-cache and memory key/values
//!
//! Used both for causal self-attention over the action tokens and for
//! cross-attention onto the encoded state. The cache is an explicit value:
//! it is passed in by the caller and the merged keys/values come back out.

use anyhow::Result;
use burn::{
    module::{Module, Param},
    nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig},
    prelude::*,
    tensor::{backend::Backend, Bool, Tensor},
};

use super::{
    attend::{full_mask, Attend, AttendConfig},
    normalization::{RmsNorm, RmsNormConfig},
    CondFn,
};
use crate::loader::{load_linear, LoadedWeights};

/// Keys and values seen so far by a single attention layer
#[derive(Debug, Clone)]
pub struct KvCache<B: Backend> {
    /// (batch, heads, cached_len, dim_head)
    pub k: Tensor<B, 4>,
    /// (batch, heads, cached_len, dim_head)
    pub v: Tensor<B, 4>,
}

impl<B: Backend> KvCache<B> {
    pub fn new(k: Tensor<B, 4>, v: Tensor<B, 4>) -> Self {
        assert_eq!(k.dims(), v.dims(), "cached keys and values must share a shape");
        Self { k, v }
    }

    /// Number of cached positions
    pub fn len(&self) -> usize {
        self.k.dims()[2]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append new keys/values after the cached ones
    pub fn append(self, k: Tensor<B, 4>, v: Tensor<B, 4>) -> Self {
        Self {
            k: Tensor::cat(vec![self.k, k], 2),
            v: Tensor::cat(vec![self.v, v], 2),
        }
    }

    /// Keep only the first `len` positions
    pub fn truncate(self, len: usize) -> Self {
        let [batch, heads, cached, dim_head] = self.k.dims();
        assert!(len <= cached, "cannot truncate a cache of {cached} positions to {len}");

        Self {
            k: self.k.slice([0..batch, 0..heads, 0..len, 0..dim_head]),
            v: self.v.slice([0..batch, 0..heads, 0..len, 0..dim_head]),
        }
    }

    /// Stack into (2, batch, heads, cached_len, dim_head)
    pub fn into_tensor(self) -> Tensor<B, 5> {
        Tensor::stack(vec![self.k, self.v], 0)
    }
}

/// Attention layer configuration
#[derive(Config, Debug)]
pub struct TransformerAttentionConfig {
    pub dim: usize,
    #[config(default = 64)]
    pub dim_head: usize,
    /// Feature size of the cross-attention context (defaults to `dim`)
    pub dim_context: Option<usize>,
    #[config(default = 8)]
    pub heads: usize,
    /// Learned key/value pairs every query can attend to
    #[config(default = 4)]
    pub num_mem_kv: usize,
    /// Normalize a context tensor; set exactly for cross-attention layers
    #[config(default = false)]
    pub norm_context: bool,
    #[config(default = false)]
    pub adaptive_ln: bool,
    #[config(default = 0.1)]
    pub dropout: f64,
    #[config(default = true)]
    pub flash: bool,
    #[config(default = false)]
    pub causal: bool,
}

impl TransformerAttentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TransformerAttention<B> {
        let inner_dim = self.dim_head * self.heads;
        let dim_context = self.dim_context.unwrap_or(self.dim);

        let mem_kv = (self.num_mem_kv > 0).then(|| {
            Initializer::Normal {
                mean: 0.0,
                std: 1.0,
            }
            .init([2, self.heads, self.num_mem_kv, self.dim_head], device)
        });

        TransformerAttention {
            norm: RmsNormConfig::new(self.dim)
                .with_affine(!self.adaptive_ln)
                .init(device),
            context_norm: self
                .norm_context
                .then(|| RmsNormConfig::new(dim_context).init(device)),
            to_q: LinearConfig::new(self.dim, inner_dim)
                .with_bias(false)
                .init(device),
            to_kv: LinearConfig::new(dim_context, inner_dim * 2)
                .with_bias(false)
                .init(device),
            mem_kv,
            attend: AttendConfig::new()
                .with_dropout(self.dropout)
                .with_causal(self.causal)
                .with_flash(self.flash)
                .init(),
            to_out: LinearConfig::new(inner_dim, self.dim)
                .with_bias(false)
                .init(device),
            out_dropout: DropoutConfig::new(self.dropout).init(),
            heads: self.heads,
            adaptive_ln: self.adaptive_ln,
        }
    }
}

/// Attention layer module
#[derive(Module, Debug)]
pub struct TransformerAttention<B: Backend> {
    norm: RmsNorm<B>,
    context_norm: Option<RmsNorm<B>>,
    to_q: Linear<B>,
    to_kv: Linear<B>,
    /// (2, heads, num_mem_kv, dim_head)
    mem_kv: Option<Param<Tensor<B, 4>>>,
    attend: Attend,
    to_out: Linear<B>,
    out_dropout: Dropout,
    #[module(skip)]
    heads: usize,
    #[module(skip)]
    adaptive_ln: bool,
}

impl<B: Backend> TransformerAttention<B> {
    /// Attend `x` (batch, n, dim) over itself or over `context` (batch, m, dim_context).
    ///
    /// Returns the layer output and the cache holding every key/value the
    /// queries attended to, excluding the memory key/values.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        context: Option<Tensor<B, 3>>,
        mask: Option<Tensor<B, 2, Bool>>,
        attn_mask: Option<Tensor<B, 4, Bool>>,
        cond_fn: Option<&CondFn<B>>,
        cache: Option<KvCache<B>>,
    ) -> (Tensor<B, 3>, KvCache<B>) {
        let [batch, seq_len, _] = x.dims();
        let device = x.device();

        assert_eq!(
            context.is_some(),
            self.context_norm.is_some(),
            "a context must be given exactly when the layer normalizes context"
        );

        // Self-attention keys/values are projected from the raw input.
        let kv_input = match (context, &self.context_norm) {
            (Some(context), Some(context_norm)) => context_norm.forward(context),
            _ => x.clone(),
        };

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

        let q = self.split_heads(self.to_q.forward(x));
        let mut kv = self.to_kv.forward(kv_input).chunk(2, 2).into_iter();
        let (k, v) = match (kv.next(), kv.next()) {
            (Some(k), Some(v)) => (self.split_heads(k), self.split_heads(v)),
            _ => unreachable!("kv projection has an even width"),
        };

        let new_cache = match cache {
            Some(cache) => cache.append(k, v),
            None => KvCache::new(k, v),
        };

        let mut k = new_cache.k.clone();
        let mut v = new_cache.v.clone();
        let mut mask = mask;
        let mut attn_mask = attn_mask;

        if let Some(mem_kv) = &self.mem_kv {
            let [_, heads, num_mem, dim_head] = mem_kv.val().dims();
            let memory = |idx: usize| {
                mem_kv
                    .val()
                    .slice([idx..idx + 1, 0..heads, 0..num_mem, 0..dim_head])
                    .repeat_dim(0, batch)
            };

            k = Tensor::cat(vec![memory(0), k], 2);
            v = Tensor::cat(vec![memory(1), v], 2);

            mask = mask.map(|mask| {
                let [mask_batch, _] = mask.dims();
                Tensor::cat(vec![full_mask([mask_batch, num_mem], &device), mask], 1)
            });
            attn_mask = attn_mask.map(|attn_mask| {
                let [d0, d1, d2, _] = attn_mask.dims();
                Tensor::cat(vec![full_mask([d0, d1, d2, num_mem], &device), attn_mask], 3)
            });
        }

        let out = self.attend.forward(q, k, v, mask, attn_mask);

        let [_, heads, _, dim_head] = out.dims();
        let out = out
            .swap_dims(1, 2)
            .reshape([batch, seq_len, heads * dim_head]);
        let out = self.out_dropout.forward(self.to_out.forward(out));

        (out, new_cache)
    }

    /// (batch, n, heads * dim_head) -> (batch, heads, n, dim_head)
    fn split_heads(&self, t: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch, seq_len, inner] = t.dims();
        t.reshape([batch, seq_len, self.heads, inner / self.heads])
            .swap_dims(1, 2)
    }

    pub fn num_mem_kv(&self) -> usize {
        self.mem_kv.as_ref().map_or(0, |mem_kv| mem_kv.val().dims()[2])
    }

    /// Load a PyTorch `TransformerAttention` rooted at `prefix`
    pub fn load_weights(
        &mut self,
        weights: &LoadedWeights,
        prefix: &str,
        device: &B::Device,
    ) -> Result<()> {
        self.norm
            .load_weights(weights, &format!("{prefix}.norm"), device)?;
        if let Some(context_norm) = self.context_norm.as_mut() {
            context_norm.load_weights(weights, &format!("{prefix}.context_norm"), device)?;
        }
        load_linear(&mut self.to_q, weights, &format!("{prefix}.to_q"), device)?;
        load_linear(&mut self.to_kv, weights, &format!("{prefix}.to_kv"), device)?;
        load_linear(&mut self.to_out, weights, &format!("{prefix}.to_out.0"), device)?;

        if let Some(mem_kv) = self.mem_kv.as_mut() {
            let loaded = weights.tensor::<B, 4>(&format!("{prefix}.mem_kv"), device)?;
            if loaded.dims() != mem_kv.val().dims() {
                anyhow::bail!(
                    "Weight '{prefix}.mem_kv' has shape {:?}, expected {:?}",
                    loaded.dims(),
                    mem_kv.val().dims()
                );
            }
            *mem_kv = Param::from_tensor(loaded);
        }

        Ok(())
    }
}
