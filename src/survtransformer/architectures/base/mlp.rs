//! Feed-forward building blocks: ELU, alpha dropout, the
//! self-normalising block used by the pathway encoders and the
//! pre-normalised feed-forward used by the classification head.

use burn::module::Module;
use burn::nn::{Dropout, LayerNorm};
use burn::prelude::*;
use burn::tensor::{activation, Distribution};

use super::transformer::{DeterministicLinear, ExecutionContext};

/// Negative saturation value of SELU (`-scale * alpha`).
const ALPHA_PRIME: f64 = -1.758_099_340_847_376_6;

/// ELU with alpha = 1: `x` for positive inputs, `exp(x) - 1` otherwise.
pub fn elu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let negative = x.clone().clamp_max(0.0).exp().sub_scalar(1.0);
    activation::relu(x) + negative
}

/// Dropout that keeps self-normalising activations at zero mean and unit
/// variance: dropped units are set to the SELU saturation value and the
/// result is affinely rescaled.
///
/// Like `burn::nn::Dropout`, it is the identity unless the backend is
/// tracking gradients.
#[derive(Module, Clone, Debug)]
pub struct AlphaDropout {
    pub prob: f64,
}

impl AlphaDropout {
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    pub fn forward<B: Backend, const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        if !B::ad_enabled() || self.prob == 0.0 {
            return input;
        }

        let p = self.prob;
        let a = ((1.0 - p) * (1.0 + p * ALPHA_PRIME * ALPHA_PRIME)).powf(-0.5);
        let b = -a * ALPHA_PRIME * p;

        let keep = Tensor::<B, D>::random(
            input.shape(),
            Distribution::Bernoulli(1.0 - p),
            &input.device(),
        );
        let dropped = keep.clone().neg().add_scalar(1.0);

        (input * keep + dropped.mul_scalar(ALPHA_PRIME))
            .mul_scalar(a)
            .add_scalar(b)
    }
}

/// `Linear → ELU → AlphaDropout`.
#[derive(Module, Debug)]
pub struct SnnBlock<B: Backend> {
    pub linear: DeterministicLinear<B>,
    pub dropout: AlphaDropout,
}

impl<B: Backend> SnnBlock<B> {
    pub fn new(
        input_dim: usize,
        output_dim: usize,
        dropout: f64,
        ctx: &ExecutionContext<B>,
        seed_offset: u64,
    ) -> Self {
        Self {
            linear: ctx.linear(input_dim, output_dim, true, seed_offset),
            dropout: AlphaDropout::new(dropout),
        }
    }

    /// input shape: [batch, input_dim]
    /// output shape: [batch, output_dim]
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.dropout.forward(elu(self.linear.forward(x)))
    }

    pub fn l1_norm(&self) -> Tensor<B, 1> {
        self.linear.l1_norm()
    }
}

/// Pre-normalised feed-forward:
/// `LayerNorm → Linear(dim, dim·mult) → GELU → Dropout → Linear(dim·mult, dim)`.
///
/// There is no residual connection; the output replaces the input.
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    pub norm: LayerNorm<B>,
    pub linear1: DeterministicLinear<B>,
    pub dropout: Dropout,
    pub linear2: DeterministicLinear<B>,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(
        dim: usize,
        mult: usize,
        dropout: f64,
        layer_norm_eps: f64,
        ctx: &ExecutionContext<B>,
        seed_offset: u64,
    ) -> Self {
        Self {
            norm: ctx.layer_norm(dim, layer_norm_eps),
            linear1: ctx.linear(dim, dim * mult, true, seed_offset),
            dropout: ctx.dropout(dropout),
            linear2: ctx.linear(dim * mult, dim, true, seed_offset + 1),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.norm.forward(x);
        let x = activation::gelu(self.linear1.forward(x));
        let x = self.dropout.forward(x);
        self.linear2.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn test_elu_values() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-2.0, -0.5, 0.0, 1.5], &device);
        let y: Vec<f32> = elu(x).into_data().to_vec().unwrap();

        let expected = [(-2.0f32).exp() - 1.0, (-0.5f32).exp() - 1.0, 0.0, 1.5];
        for (got, want) in y.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "elu mismatch: {} vs {}", got, want);
        }
    }

    #[test]
    fn test_alpha_dropout_identity_without_autodiff() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![0.1f32, -0.3, 0.7, 1.2], [2, 2]),
            &device,
        );
        let y = AlphaDropout::new(0.25).forward(x.clone());
        assert_eq!(
            x.into_data().to_vec::<f32>().unwrap(),
            y.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_alpha_dropout_preserves_moments_in_training() {
        let device = Default::default();
        let x = Tensor::<TestAutodiffBackend, 1>::random(
            [20_000],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let y: Vec<f32> = AlphaDropout::new(0.25)
            .forward(x)
            .into_data()
            .to_vec()
            .unwrap();

        let n = y.len() as f32;
        let mean = y.iter().sum::<f32>() / n;
        let var = y.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        assert!(mean.abs() < 0.05, "mean drifted: {}", mean);
        assert!((var - 1.0).abs() < 0.1, "variance drifted: {}", var);
    }

    #[test]
    fn test_snn_block_shape_and_determinism() {
        let device = Default::default();
        let ctx = ExecutionContext::<TestBackend>::new(42, device);

        let block_a = SnnBlock::new(12, 8, 0.25, &ctx, 100);
        let block_b = SnnBlock::new(12, 8, 0.25, &ctx, 100);

        let x = Tensor::<TestBackend, 2>::ones([3, 12], ctx.device());
        let ya = block_a.forward(x.clone());
        let yb = block_b.forward(x);

        assert_eq!(ya.dims(), [3, 8]);
        assert_eq!(
            ya.into_data().to_vec::<f32>().unwrap(),
            yb.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn test_feed_forward_shape() {
        let device = Default::default();
        let ctx = ExecutionContext::<TestBackend>::new(3, device);
        let ff = FeedForward::new(16, 1, 0.1, 1e-5, &ctx, 10);

        let x = Tensor::<TestBackend, 2>::random([4, 16], Distribution::Default, ctx.device());
        let y = ff.forward(x);
        assert_eq!(y.dims(), [4, 16]);
    }
}
