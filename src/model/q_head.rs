//! Multi-action Q-head
//!
//! Actions are decided one dimension at a time. The token sequence is the
//! state token followed by the embeddings of the actions decided so far; the
//! Q-values for the next dimension are read off the newest token. Before any
//! action is known the state token is simply repeated, giving `[state, state]`.

use anyhow::Result;
use burn::{
    module::Module,
    prelude::*,
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use tracing::debug;

use super::{
    argmax_first,
    embedding::{ActionEmbedding, ActionEmbeddingConfig},
    heads::{DuelingHead, DuelingHeadConfig, ValueHead, ValueHeadConfig},
    transformer::{Transformer, TransformerCache, TransformerConfig},
};
use crate::loader::LoadedWeights;

/// Q-head configuration
#[derive(Config, Debug)]
pub struct QHeadConfig {
    pub dim: usize,
    pub num_actions: usize,
    pub action_bins: usize,
    #[config(default = 2)]
    pub attn_depth: usize,
    #[config(default = 32)]
    pub attn_dim_head: usize,
    #[config(default = 8)]
    pub attn_heads: usize,
    #[config(default = 4)]
    pub num_mem_kv: usize,
    /// Bounded dueling head; otherwise the unbounded MLP value head
    #[config(default = true)]
    pub dueling: bool,
    #[config(default = true)]
    pub flash_attn: bool,
}

impl QHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> QHeadMultipleActions<B> {
        assert!(self.num_actions >= 1, "at least one action dimension is required");
        assert!(self.action_bins >= 1, "at least one action bin is required");

        let transformer = TransformerConfig::new(self.dim)
            .with_depth(self.attn_depth)
            .with_dim_head(self.attn_dim_head)
            .with_heads(self.attn_heads)
            .with_num_mem_kv(self.num_mem_kv)
            .with_flash_attn(self.flash_attn)
            .with_causal(true)
            .init(device);

        let (dueling_head, value_head) = if self.dueling {
            let head = DuelingHeadConfig::new(self.dim)
                .with_action_bins(self.action_bins)
                .init(device);
            (Some(head), None)
        } else {
            let head = ValueHeadConfig::new(self.dim)
                .with_action_bins(self.action_bins)
                .init(device);
            (None, Some(head))
        };

        QHeadMultipleActions {
            transformer,
            action_embed: ActionEmbeddingConfig::new(self.dim, self.action_bins, self.num_actions)
                .init(device),
            dueling_head,
            value_head,
            num_actions: self.num_actions,
            action_bins: self.action_bins,
        }
    }
}

/// Autoregressive decode progress, threaded through [`QHeadMultipleActions::decode_step`]
#[derive(Debug, Clone)]
pub struct DecodeState<B: Backend> {
    encoded_state: Tensor<B, 3>,
    actions: Option<Tensor<B, 2, Int>>,
    cache: Option<TransformerCache<B>>,
}

impl<B: Backend> DecodeState<B> {
    /// Fresh decode for an encoded state (batch, 1, dim)
    pub fn new(encoded_state: Tensor<B, 3>) -> Self {
        Self {
            encoded_state: encoded_state.detach(),
            actions: None,
            cache: None,
        }
    }

    /// Number of action dimensions already decided
    pub fn step(&self) -> usize {
        self.actions.as_ref().map_or(0, |actions| actions.dims()[1])
    }

    /// Decided actions so far, (batch, step)
    pub fn actions(&self) -> Option<&Tensor<B, 2, Int>> {
        self.actions.as_ref()
    }

    pub fn cache(&self) -> Option<&TransformerCache<B>> {
        self.cache.as_ref()
    }

    pub fn into_actions(self) -> Option<Tensor<B, 2, Int>> {
        self.actions
    }
}

/// Q-head over multiple discretized action dimensions
#[derive(Module, Debug)]
pub struct QHeadMultipleActions<B: Backend> {
    transformer: Transformer<B>,
    action_embed: ActionEmbedding<B>,
    dueling_head: Option<DuelingHead<B>>,
    value_head: Option<ValueHead<B>>,
    #[module(skip)]
    num_actions: usize,
    #[module(skip)]
    action_bins: usize,
}

impl<B: Backend> QHeadMultipleActions<B> {
    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn action_bins(&self) -> usize {
        self.action_bins
    }

    /// `[state, state]` without actions, `[state, a_0, .., a_{k-1}]` otherwise
    pub fn state_append_actions(
        &self,
        state: Tensor<B, 3>,
        actions: Option<Tensor<B, 2, Int>>,
    ) -> Tensor<B, 3> {
        match actions {
            None => Tensor::cat(vec![state.clone(), state], 1),
            Some(actions) => {
                let actions = self.action_embed.forward(actions);
                Tensor::cat(vec![state, actions], 1)
            }
        }
    }

    /// Teacher-forced Q-values: (batch, n, action_bins), one row per given action
    /// (a single row when no actions are given).
    pub fn forward(
        &self,
        encoded_state: Tensor<B, 3>,
        actions: Option<Tensor<B, 2, Int>>,
    ) -> Tensor<B, 3> {
        let tokens = self.state_append_actions(encoded_state.clone(), actions);
        let (embed, _) = self
            .transformer
            .forward(tokens, None, None, Some(encoded_state), None);

        let [batch, seq_len, dim] = embed.dims();
        self.q_values(embed.slice([0..batch, 1..seq_len, 0..dim]))
    }

    /// Decide one more action dimension greedily.
    ///
    /// Returns the advanced state and the Q-values (batch, action_bins) the
    /// decision was made from.
    pub fn decode_step(&self, state: DecodeState<B>) -> (DecodeState<B>, Tensor<B, 2>) {
        let step = state.step();
        assert!(
            step < self.num_actions,
            "all {} action dimensions are already decided",
            self.num_actions
        );

        let DecodeState {
            encoded_state,
            actions,
            cache,
        } = state;
        let tokens = self.state_append_actions(encoded_state.clone(), actions.clone());
        let (embed, cache) =
            self.transformer
                .forward(tokens, None, None, Some(encoded_state.clone()), cache);

        let [batch, seq_len, dim] = embed.dims();
        let newest = embed.slice([0..batch, seq_len - 1..seq_len, 0..dim]);
        let q_values = self
            .q_values(newest)
            .reshape([batch, self.action_bins])
            .detach();

        // The duplicated state token is not part of any later sequence.
        let cache = if step == 0 { cache.truncate(1) } else { cache };

        let chosen = argmax_first(q_values.clone());
        debug!("decoded action dimension {}: {:?}", step, chosen);

        let chosen: Vec<i64> = chosen.into_iter().map(|bin| bin as i64).collect();
        let chosen = Tensor::<B, 2, Int>::from_data(
            TensorData::new(chosen, [batch, 1]),
            &encoded_state.device(),
        );
        let actions = match actions {
            Some(actions) => Tensor::cat(vec![actions, chosen], 1),
            None => chosen,
        };

        let next = DecodeState {
            encoded_state,
            actions: Some(actions),
            cache: Some(cache),
        };
        (next, q_values)
    }

    /// Greedily decode every action dimension: (batch, num_actions) bin indices
    pub fn get_optimal_actions(&self, encoded_state: Tensor<B, 3>) -> Tensor<B, 2, Int> {
        let [batch, _, _] = encoded_state.dims();
        let device = encoded_state.device();

        let state = (0..self.num_actions).fold(DecodeState::new(encoded_state), |state, _| {
            self.decode_step(state).0
        });

        state
            .into_actions()
            .unwrap_or_else(|| Tensor::zeros([batch, 0], &device))
    }

    fn q_values(&self, embed: Tensor<B, 3>) -> Tensor<B, 3> {
        match (&self.dueling_head, &self.value_head) {
            (Some(head), _) => head.forward(embed),
            (None, Some(head)) => head.forward(embed),
            (None, None) => unreachable!("a q-head always carries a value head"),
        }
    }

    /// Load the PyTorch `QHeadMultipleActions` rooted at `prefix`
    pub fn load_weights(
        &mut self,
        weights: &LoadedWeights,
        prefix: &str,
        device: &B::Device,
    ) -> Result<()> {
        self.transformer
            .load_weights(weights, &format!("{prefix}.transformer"), device)?;
        self.action_embed.load_weights(
            weights,
            &format!("{prefix}.DynamicMultiActionEmbedding"),
            device,
        )?;
        if let Some(head) = self.dueling_head.as_mut() {
            let dueling = format!("{prefix}.dueling_head");
            if !weights.contains(&format!("{dueling}.stem.0.weight"))
                && weights.contains(&format!("{prefix}.get_q_value_fuction.linear_1.weight"))
            {
                anyhow::bail!(
                    "Checkpoint has an MLP value head at '{prefix}.get_q_value_fuction' but no '{dueling}'; build the model with dueling = false"
                );
            }
            head.load_weights(weights, &dueling, device)?;
        }
        if let Some(head) = self.value_head.as_mut() {
            head.load_weights(weights, &format!("{prefix}.get_q_value_fuction"), device)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn head(dueling: bool) -> QHeadMultipleActions<TestBackend> {
        QHeadConfig::new(16, 3, 5)
            .with_attn_heads(2)
            .with_attn_dim_head(8)
            .with_dueling(dueling)
            .init(&Default::default())
    }

    fn state(batch: usize) -> Tensor<TestBackend, 3> {
        Tensor::random([batch, 1, 16], Distribution::Normal(0.0, 1.0), &Default::default())
    }

    fn ints(t: Tensor<TestBackend, 2, Int>) -> Vec<i64> {
        t.into_data().iter::<i64>().collect()
    }

    #[test]
    fn initial_sequence_repeats_state() {
        let head = head(true);
        let state = state(2);

        let tokens = head.state_append_actions(state.clone(), None);
        assert_eq!(tokens.dims(), [2, 2, 16]);

        let diff: f32 = (tokens.clone().slice([0..2, 1..2, 0..16]) - state)
            .abs()
            .max()
            .into_scalar();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn teacher_forced_shapes() {
        let head = head(false);
        let state = state(2);
        let actions = Tensor::<TestBackend, 2, Int>::from_data(
            TensorData::new(vec![0i64, 4, 2, 1, 3, 0], [2, 3]),
            &Default::default(),
        );

        assert_eq!(head.forward(state.clone(), Some(actions)).dims(), [2, 3, 5]);
        assert_eq!(head.forward(state, None).dims(), [2, 1, 5]);
    }

    #[test]
    fn decode_steps_grow_cache_by_one() {
        let head = head(true);
        let mut decode = DecodeState::new(state(2));

        for step in 0..3 {
            let (next, q_values) = head.decode_step(decode);
            assert_eq!(q_values.dims(), [2, 5]);
            assert_eq!(next.step(), step + 1);
            assert_eq!(next.cache().map(TransformerCache::len), Some(step + 1));
            decode = next;
        }
    }

    #[test]
    fn decode_steps_match_uncached_sequences() {
        let head = head(true);
        let encoded = state(2);

        let (first, q_0) = head.decode_step(DecodeState::new(encoded.clone()));
        let expected_0 = head.forward(encoded.clone(), None).reshape([2, 5]);
        let diff: f32 = (q_0 - expected_0).abs().max().into_scalar();
        assert!(diff < 1e-4);

        let known = first.actions().cloned();
        let (_, q_1) = head.decode_step(first);
        let full = head.forward(encoded, known).reshape([2, 5]);
        let diff: f32 = (q_1 - full).abs().max().into_scalar();
        assert!(diff < 1e-4);
    }

    #[test]
    fn optimal_actions_are_in_range() {
        let head = head(true);
        let actions = head.get_optimal_actions(state(4));

        assert_eq!(actions.dims(), [4, 3]);
        assert!(ints(actions).into_iter().all(|bin| (0..5).contains(&bin)));
    }

    #[test]
    fn tied_q_values_pick_the_lowest_bin() {
        let device = Default::default();
        let mut head = head(true);

        let mut weights = LoadedWeights::default();
        weights.insert("d.stem.0.weight", vec![0.1; 32 * 16], vec![32, 16]);
        weights.insert("d.stem.0.bias", vec![0.0; 32], vec![32]);
        weights.insert("d.to_values.0.weight", vec![0.1; 32], vec![1, 32]);
        weights.insert("d.to_values.0.bias", vec![0.0], vec![1]);
        weights.insert("d.to_advantages.0.weight", vec![0.0; 5 * 32], vec![5, 32]);
        weights.insert("d.to_advantages.0.bias", vec![0.0; 5], vec![5]);
        head.dueling_head
            .as_mut()
            .unwrap()
            .load_weights(&weights, "d", &device)
            .unwrap();

        let actions = head.get_optimal_actions(state(3));
        assert_eq!(ints(actions), vec![0; 9]);
    }

    #[test]
    #[should_panic(expected = "already decided")]
    fn decoding_past_the_last_action_panics() {
        let head = head(true);
        let decode = (0..4).fold(DecodeState::new(state(1)), |decode, _| head.decode_step(decode).0);
        drop(decode);
    }
}
