//! Scaled dot-product attention kernel
//!
//! Masks follow the "true means attendable" convention. Masked similarities
//! are filled with `f32::MIN` rather than `-inf` so fully masked rows soften
//! to a uniform distribution instead of producing NaNs.

use burn::{
    module::Module,
    nn::{Dropout, DropoutConfig},
    prelude::*,
    tensor::{activation::softmax, backend::Backend, Bool, Tensor, TensorData},
};
use tracing::debug;

/// Value written into masked similarity entries
pub const MASK_VALUE: f32 = f32::MIN;

/// Attention kernel configuration
#[derive(Config, Debug)]
pub struct AttendConfig {
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = false)]
    pub causal: bool,
    /// Combine every mask up front and apply it in a single fill
    #[config(default = false)]
    pub flash: bool,
}

impl AttendConfig {
    pub fn init(&self) -> Attend {
        if self.flash {
            debug!("using fused attention path");
        }

        Attend {
            dropout: DropoutConfig::new(self.dropout).init(),
            causal: self.causal,
            flash: self.flash,
        }
    }
}

/// Attention kernel module (parameter free)
#[derive(Module, Clone, Debug)]
pub struct Attend {
    dropout: Dropout,
    #[module(skip)]
    causal: bool,
    #[module(skip)]
    flash: bool,
}

impl Attend {
    /// Attend `q` (b, h, i, d) over `k`/`v` (b, h, j, d).
    ///
    /// `mask` is a key padding mask (b, j); `attn_mask` must broadcast to (b, h, i, j).
    pub fn forward<B: Backend>(
        &self,
        q: Tensor<B, 4>,
        k: Tensor<B, 4>,
        v: Tensor<B, 4>,
        mask: Option<Tensor<B, 2, Bool>>,
        attn_mask: Option<Tensor<B, 4, Bool>>,
    ) -> Tensor<B, 4> {
        let [batch, heads, q_len, dim_head] = q.dims();
        let [k_batch, k_heads, k_len, k_dim] = k.dims();
        assert_eq!(k.dims(), v.dims(), "keys and values must share a shape");
        assert_eq!(
            (batch, heads, dim_head),
            (k_batch, k_heads, k_dim),
            "queries and keys disagree on batch, heads or feature size"
        );

        let device = q.device();
        let shape = [batch, heads, q_len, k_len];
        let scale = (dim_head as f64).powf(-0.5);

        let sim = q.matmul(k.swap_dims(2, 3)) * scale;

        let causal = self
            .causal
            .then(|| broadcast_mask(causal_mask::<B>(q_len, k_len, &device).unsqueeze(), shape));
        let mask = mask.map(|mask| broadcast_mask(mask.reshape([batch, 1, 1, k_len]), shape));
        let attn_mask = attn_mask.map(|mask| broadcast_mask(mask, shape));

        let sim = if self.flash {
            match [causal, mask, attn_mask]
                .into_iter()
                .flatten()
                .reduce(and_masks)
            {
                Some(keep) => sim.mask_fill(keep.bool_not(), MASK_VALUE),
                None => sim,
            }
        } else {
            [causal, mask, attn_mask]
                .into_iter()
                .flatten()
                .fold(sim, |sim, keep| sim.mask_fill(keep.bool_not(), MASK_VALUE))
        };

        let attn = softmax(sim, 3);
        let attn = self.dropout.forward(attn);

        attn.matmul(v)
    }
}

/// Causal visibility for `q_len` queries over `k_len` keys.
///
/// Queries are aligned to the end of the key sequence, so with cached keys
/// (`k_len > q_len`) every query still sees the whole valid prefix.
pub fn causal_mask<B: Backend>(q_len: usize, k_len: usize, device: &B::Device) -> Tensor<B, 2, Bool> {
    let offset = k_len as isize - q_len as isize;
    let visible: Vec<bool> = (0..q_len)
        .flat_map(|i| (0..k_len).map(move |j| j as isize <= i as isize + offset))
        .collect();

    Tensor::from_data(TensorData::new(visible, [q_len, k_len]), device)
}

/// All-true mask of the given shape
pub fn full_mask<B: Backend, const D: usize>(shape: [usize; D], device: &B::Device) -> Tensor<B, D, Bool> {
    let len = shape.iter().product();
    Tensor::from_data(TensorData::new(vec![true; len], shape), device)
}

fn and_masks<B: Backend, const D: usize>(a: Tensor<B, D, Bool>, b: Tensor<B, D, Bool>) -> Tensor<B, D, Bool> {
    (a.int() * b.int()).equal_elem(1)
}

/// Repeat singleton axes of a mask up to `shape`
fn broadcast_mask<B: Backend>(mask: Tensor<B, 4, Bool>, shape: [usize; 4]) -> Tensor<B, 4, Bool> {
    let dims = mask.dims();
    dims.iter()
        .zip(shape)
        .enumerate()
        .fold(mask, |mask, (axis, (&have, want))| {
            if have == want {
                mask
            } else {
                assert_eq!(have, 1, "mask axis {axis} of size {have} cannot broadcast to {want}");
                mask.repeat_dim(axis, want)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn random(shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), &Default::default())
    }

    fn max_abs_diff(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    #[test]
    fn causal_mask_is_offset_by_cache_length() {
        let device = Default::default();
        let mask: Vec<bool> = causal_mask::<TestBackend>(2, 4, &device).into_data().iter::<bool>().collect();
        assert_eq!(
            mask,
            vec![true, true, true, false, true, true, true, true]
        );

        let square: Vec<bool> = causal_mask::<TestBackend>(3, 3, &device).into_data().iter::<bool>().collect();
        assert_eq!(
            square,
            vec![true, false, false, true, true, false, true, true, true]
        );
    }

    #[test]
    fn fused_and_explicit_paths_agree() {
        let device = Default::default();
        let (q, k, v) = (random([2, 2, 3, 4]), random([2, 2, 5, 4]), random([2, 2, 5, 4]));
        let padding = Tensor::<TestBackend, 2, Bool>::from_data(
            TensorData::new(
                vec![true, true, false, true, true, true, true, true, true, false],
                [2, 5],
            ),
            &device,
        );

        let explicit = AttendConfig::new().with_causal(true).init();
        let fused = AttendConfig::new().with_causal(true).with_flash(true).init();

        let a = explicit.forward(q.clone(), k.clone(), v.clone(), Some(padding.clone()), None);
        let b = fused.forward(q, k, v, Some(padding), None);
        assert!(max_abs_diff(a, b) < 1e-6);
    }

    #[test]
    fn padded_keys_do_not_contribute() {
        let device = Default::default();
        let attend = AttendConfig::new().init();
        let (q, k, v) = (random([1, 1, 2, 4]), random([1, 1, 3, 4]), random([1, 1, 3, 4]));
        let padding = Tensor::<TestBackend, 2, Bool>::from_data(
            TensorData::new(vec![true, true, false], [1, 3]),
            &device,
        );

        let masked = attend.forward(q.clone(), k.clone(), v.clone(), Some(padding), None);
        let truncated = attend.forward(
            q,
            k.slice([0..1, 0..1, 0..2, 0..4]),
            v.slice([0..1, 0..1, 0..2, 0..4]),
            None,
            None,
        );
        assert!(max_abs_diff(masked, truncated) < 1e-6);
    }

    #[test]
    fn fully_masked_rows_stay_finite() {
        let device = Default::default();
        let attend = AttendConfig::new().init();
        let (q, k, v) = (random([1, 2, 2, 4]), random([1, 2, 3, 4]), random([1, 2, 3, 4]));
        let nothing = Tensor::<TestBackend, 4, Bool>::from_data(
            TensorData::new(vec![false; 6], [1, 1, 2, 3]),
            &device,
        );

        let out = attend.forward(q, k, v, None, Some(nothing));
        assert!(out.into_data().iter::<f32>().all(f32::is_finite));
    }

    #[test]
    fn dropout_only_applies_while_training() {
        type TrainBackend = burn::backend::Autodiff<TestBackend>;
        let attend = AttendConfig::new().with_dropout(0.5).init();
        let (q, k, v) = (random([2, 2, 4, 8]), random([2, 2, 6, 8]), random([2, 2, 6, 8]));

        let a = attend.forward(q.clone(), k.clone(), v.clone(), None, None);
        let b = attend.forward(q.clone(), k.clone(), v.clone(), None, None);
        assert_eq!(max_abs_diff(a, b), 0.0);

        let train = |t: Tensor<TestBackend, 4>| Tensor::<TrainBackend, 4>::from_inner(t);
        let a = attend.forward(train(q.clone()), train(k.clone()), train(v.clone()), None, None);
        let b = attend.forward(train(q), train(k), train(v), None, None);
        let diff: f32 = (a - b).abs().max().into_scalar();
        assert!(diff > 1e-3, "dropout left training outputs unchanged");
    }

    #[test]
    #[should_panic(expected = "disagree")]
    fn mismatched_feature_size_panics() {
        let attend = AttendConfig::new().init();
        attend.forward(random([1, 1, 2, 4]), random([1, 1, 2, 8]), random([1, 1, 2, 8]), None, None);
    }
}
