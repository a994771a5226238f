use burn::module::Module;
use burn::nn::Dropout;
use burn::prelude::*;
use burn::tensor::activation;

use super::super::transformer::{DeterministicLinear, ExecutionContext};

/// Gated attention scorer: `c(tanh(a(x)) ⊙ sigmoid(b(x)))`, one unnormalised
/// score per token.
#[derive(Module, Debug)]
pub struct GatedAttentionPool<B: Backend> {
    pub attention_a: DeterministicLinear<B>,
    pub attention_b: DeterministicLinear<B>,
    pub attention_c: DeterministicLinear<B>,
}

impl<B: Backend> GatedAttentionPool<B> {
    pub fn new(dim: usize, ctx: &ExecutionContext<B>, seed_offset: u64) -> Self {
        Self {
            attention_a: ctx.linear(dim, dim, true, seed_offset),
            attention_b: ctx.linear(dim, dim, true, seed_offset + 1),
            attention_c: ctx.linear(dim, 1, true, seed_offset + 2),
        }
    }

    /// input shape: [batch, tokens, dim]
    /// output shape: [batch, tokens, 1]
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, tokens, _] = x.dims();
        if tokens == 0 {
            return Tensor::zeros([batch, 0, 1], &x.device());
        }
        let a = self.attention_a.forward_3d(x.clone()).tanh();
        let b = activation::sigmoid(self.attention_b.forward_3d(x));
        self.attention_c.forward_3d(a * b)
    }

    pub fn l1_norm(&self) -> Tensor<B, 1> {
        self.attention_a.l1_norm() + self.attention_b.l1_norm() + self.attention_c.l1_norm()
    }
}

/// Softmax-pools `values` with `scores` over the token axis of each sample.
///
/// scores: [batch, tokens, 1], values: [batch, tokens, dim] → [batch, dim].
/// A group with no tokens pools to zeros.
pub fn softmax_pool<B: Backend>(scores: Tensor<B, 3>, values: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, tokens, dim] = values.dims();
    if tokens == 0 {
        return Tensor::zeros([batch, dim], &values.device());
    }
    let weights = activation::softmax(scores, 1).swap_dims(1, 2);
    weights.matmul(values).reshape([batch, dim])
}

/// Pairwise fusion of two pooled token groups.
///
/// Each group is softmax-pooled with its own scores, passed through its own
/// `Linear → ReLU → Dropout`, and the concatenation is mixed by
/// `Linear(2d, d) → ReLU → Linear(d, d) → ReLU`.
#[derive(Module, Debug)]
pub struct AttentionFusion<B: Backend> {
    pub linear1: DeterministicLinear<B>,
    pub dropout1: Dropout,
    pub linear2: DeterministicLinear<B>,
    pub dropout2: Dropout,
    pub mix1: DeterministicLinear<B>,
    pub mix2: DeterministicLinear<B>,
}

/// Fused vector plus both pooled, transformed groups.
#[derive(Debug, Clone)]
pub struct FusionOutput<B: Backend> {
    /// [batch, dim]
    pub fusion: Tensor<B, 2>,
    pub pooled_first: Tensor<B, 2>,
    pub pooled_second: Tensor<B, 2>,
}

impl<B: Backend> AttentionFusion<B> {
    pub fn new(dim: usize, dropout: f64, ctx: &ExecutionContext<B>, seed_offset: u64) -> Self {
        Self {
            linear1: ctx.linear(dim, dim, true, seed_offset),
            dropout1: ctx.dropout(dropout),
            linear2: ctx.linear(dim, dim, true, seed_offset + 1),
            dropout2: ctx.dropout(dropout),
            mix1: ctx.linear(2 * dim, dim, true, seed_offset + 2),
            mix2: ctx.linear(dim, dim, true, seed_offset + 3),
        }
    }

    pub fn forward(
        &self,
        scores_first: Tensor<B, 3>,
        scores_second: Tensor<B, 3>,
        first: Tensor<B, 3>,
        second: Tensor<B, 3>,
    ) -> FusionOutput<B> {
        let h1 = softmax_pool(scores_first, first);
        let h1 = self.dropout1.forward(activation::relu(self.linear1.forward(h1)));

        let h2 = softmax_pool(scores_second, second);
        let h2 = self.dropout2.forward(activation::relu(self.linear2.forward(h2)));

        let fusion = Tensor::cat(vec![h1.clone(), h2.clone()], 1);
        let fusion = activation::relu(self.mix1.forward(fusion));
        let fusion = activation::relu(self.mix2.forward(fusion));

        FusionOutput {
            fusion,
            pooled_first: h1,
            pooled_second: h2,
        }
    }

    pub fn l1_norm(&self) -> Tensor<B, 1> {
        self.linear1.l1_norm() + self.linear2.l1_norm() + self.mix1.l1_norm() + self.mix2.l1_norm()
    }
}
