//! Transformer stack with incremental (KV-cached) decoding
//!
//! Each layer is self-attention, an optional cross-attention onto a context
//! tensor, and a feed-forward block, all residual. With a cache only the
//! newest token runs through the layers; earlier tokens are reattached to the
//! output unchanged.

use anyhow::Result;
use burn::{
    module::Module,
    prelude::*,
    tensor::{backend::Backend, Bool, Tensor},
};
use tracing::debug;

use super::{
    attention::{KvCache, TransformerAttention, TransformerAttentionConfig},
    feedforward::{FeedForward, FeedForwardConfig},
    normalization::{RmsNorm, RmsNormConfig},
    CondFn,
};
use crate::loader::LoadedWeights;

/// Per-layer caches of a whole stack
#[derive(Debug, Clone)]
pub struct TransformerCache<B: Backend> {
    layers: Vec<KvCache<B>>,
}

impl<B: Backend> TransformerCache<B> {
    pub fn new(layers: Vec<KvCache<B>>) -> Self {
        Self { layers }
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Number of cached token positions
    pub fn len(&self) -> usize {
        self.layers.first().map_or(0, KvCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep the first `len` positions of every layer
    pub fn truncate(self, len: usize) -> Self {
        Self {
            layers: self
                .layers
                .into_iter()
                .map(|cache| cache.truncate(len))
                .collect(),
        }
    }

    /// Stack into (depth, 2, batch, heads, cached_len, dim_head)
    pub fn into_tensor(self) -> Tensor<B, 6> {
        Tensor::stack(
            self.layers.into_iter().map(KvCache::into_tensor).collect(),
            0,
        )
    }
}

/// One self-attention / cross-attention / feed-forward block
#[derive(Module, Debug)]
pub struct TransformerLayer<B: Backend> {
    attn: TransformerAttention<B>,
    cross_attn: Option<TransformerAttention<B>>,
    ff: FeedForward<B>,
}

/// Transformer stack configuration
#[derive(Config, Debug)]
pub struct TransformerConfig {
    pub dim: usize,
    #[config(default = 64)]
    pub dim_head: usize,
    #[config(default = 8)]
    pub heads: usize,
    #[config(default = 6)]
    pub depth: usize,
    #[config(default = 4)]
    pub num_mem_kv: usize,
    #[config(default = 0.0)]
    pub attn_dropout: f64,
    #[config(default = 0.0)]
    pub ff_dropout: f64,
    #[config(default = false)]
    pub adaptive_ln: bool,
    #[config(default = true)]
    pub flash_attn: bool,
    #[config(default = false)]
    pub cross_attend: bool,
    #[config(default = false)]
    pub causal: bool,
    #[config(default = false)]
    pub final_norm: bool,
}

impl TransformerConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Transformer<B> {
        let attn_config = TransformerAttentionConfig::new(self.dim)
            .with_heads(self.heads)
            .with_dim_head(self.dim_head)
            .with_num_mem_kv(self.num_mem_kv)
            .with_dropout(self.attn_dropout)
            .with_flash(self.flash_attn);

        let layers = (0..self.depth)
            .map(|_| TransformerLayer {
                attn: attn_config
                    .clone()
                    .with_causal(self.causal)
                    .with_adaptive_ln(self.adaptive_ln)
                    .init(device),
                cross_attn: self
                    .cross_attend
                    .then(|| attn_config.clone().with_norm_context(true).init(device)),
                ff: FeedForwardConfig::new(self.dim)
                    .with_dropout(self.ff_dropout)
                    .with_adaptive_ln(self.adaptive_ln)
                    .init(device),
            })
            .collect();

        debug!(
            "transformer: depth={} heads={} dim_head={} causal={} cross_attend={}",
            self.depth, self.heads, self.dim_head, self.causal, self.cross_attend
        );

        Transformer {
            layers,
            norm: self.final_norm.then(|| RmsNormConfig::new(self.dim).init(device)),
        }
    }
}

/// Transformer stack
#[derive(Module, Debug)]
pub struct Transformer<B: Backend> {
    layers: Vec<TransformerLayer<B>>,
    norm: Option<RmsNorm<B>>,
}

impl<B: Backend> Transformer<B> {
    /// Run the stack over `x` (batch, n, dim).
    ///
    /// `cond_fns` are consumed in order: layer 0 attention, layer 0
    /// feed-forward, layer 1 attention, and so on. With a cache, it must hold
    /// exactly `n - 1` positions; only the last token is recomputed.
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        cond_fns: Option<&[&CondFn<B>]>,
        attn_mask: Option<Tensor<B, 4, Bool>>,
        context: Option<Tensor<B, 3>>,
        cache: Option<TransformerCache<B>>,
    ) -> (Tensor<B, 3>, TransformerCache<B>) {
        let [batch, seq_len, dim] = x.dims();

        let (x_prev, mut x) = match &cache {
            Some(cache) => {
                assert_eq!(
                    cache.depth(),
                    self.layers.len(),
                    "cache depth does not match the transformer depth"
                );
                assert_eq!(
                    cache.len() + 1,
                    seq_len,
                    "an incremental step needs a cache of exactly one fewer position than the tokens"
                );
                (
                    Some(x.clone().slice([0..batch, 0..seq_len - 1, 0..dim])),
                    x.slice([0..batch, seq_len - 1..seq_len, 0..dim]),
                )
            }
            None => (None, x),
        };

        let mut cond_fns = cond_fns.unwrap_or_default().iter().copied();
        let mut layer_caches = cache.map(|cache| cache.layers.into_iter());
        let mut new_caches = Vec::with_capacity(self.layers.len());

        for layer in &self.layers {
            let layer_cache = layer_caches.as_mut().and_then(Iterator::next);
            let (attn_out, new_cache) = layer.attn.forward(
                x.clone(),
                None,
                None,
                attn_mask.clone(),
                cond_fns.next(),
                layer_cache,
            );
            new_caches.push(new_cache);

            x = x + attn_out;

            if let Some(cross_attn) = &layer.cross_attn {
                let context = context
                    .clone()
                    .expect("a cross-attending transformer needs a context");
                let (cross_out, _) = cross_attn.forward(x.clone(), Some(context), None, None, None, None);
                x = x + cross_out;
            }

            x = layer.ff.forward(x.clone(), cond_fns.next()) + x;
        }

        if let Some(x_prev) = x_prev {
            x = Tensor::cat(vec![x_prev, x], 1);
        }

        let out = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };

        (out, TransformerCache::new(new_caches))
    }

    /// Load a PyTorch `Transformer` rooted at `prefix`
    pub fn load_weights(
        &mut self,
        weights: &LoadedWeights,
        prefix: &str,
        device: &B::Device,
    ) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let layer_prefix = format!("{prefix}.layers.{i}");
            layer
                .attn
                .load_weights(weights, &format!("{layer_prefix}.0"), device)?;
            if let Some(cross_attn) = layer.cross_attn.as_mut() {
                cross_attn.load_weights(weights, &format!("{layer_prefix}.1"), device)?;
            }
            layer
                .ff
                .load_weights(weights, &format!("{layer_prefix}.2"), device)?;
        }

        if let Some(norm) = self.norm.as_mut() {
            norm.load_weights(weights, &format!("{prefix}.norm"), device)?;
        }

        Ok(())
    }
}
