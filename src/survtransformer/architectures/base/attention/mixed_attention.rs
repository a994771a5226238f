//! Mixed cross-modal attention over a `[pathway tokens][image tokens]` bag.
//!
//! Pathway tokens always take part in the quadratic relations (pathway
//! self-attention and both cross directions); the image tokens, which can
//! number in the thousands, interact among themselves only through a
//! kernelised linear attention plus a depthwise-convolution local mixing
//! term. The four resulting token groups are gate-pooled and fused pairwise.

use burn::module::{Ignored, Module, Param};
use burn::nn::Dropout;
use burn::prelude::*;
use burn::tensor::activation;

use super::find_closest_factors;
use super::pooling::{AttentionFusion, GatedAttentionPool};
use super::super::config::ModelConfig;
use super::super::transformer::{DepthwiseConv2d, DeterministicLinear, ExecutionContext};
use crate::error::{Result, SurvivalError};

/// Offset added to kernelised features so they stay strictly positive.
const FEATURE_FLOOR: f64 = 1e-6;
/// Stabiliser of the linear-attention normaliser.
const NORMALIZER_EPS: f64 = 1e-6;

#[derive(Module, Debug)]
pub struct MixedAttention<B: Backend> {
    /// Shared bias-free projection producing `[q | k | v]`
    pub to_qkv: DeterministicLinear<B>,
    /// Learned per-channel scale of the linear-attention feature map, [1, 1, dim]
    pub scale_linear: Param<Tensor<B, 3>>,
    pub dwc: DepthwiseConv2d<B>,
    pub feamap_linear: DeterministicLinear<B>,
    pub feamap_dropout: Dropout,
    pub gated_pool: GatedAttentionPool<B>,
    pub fusion: AttentionFusion<B>,
    num_pathways: Ignored<usize>,
    dim: Ignored<usize>,
    focusing_factor: Ignored<f32>,
}

/// Raw scaled dot-product scores (before softmax), detached from the graph.
#[derive(Debug, Clone)]
pub struct AttentionMaps<B: Backend> {
    /// Pathway queries × pathway keys, [batch, pathways, pathways]
    pub pathway_self: Tensor<B, 3>,
    /// Pathway queries × image keys, [batch, pathways, patches]
    pub pathway_to_image: Tensor<B, 3>,
    /// Image queries × pathway keys, [batch, patches, pathways]
    pub image_to_pathway: Tensor<B, 3>,
}

#[derive(Debug, Clone)]
pub struct MixedAttentionOutput<B: Backend> {
    /// `[cross fusion | self fusion]`, [batch, 2 * dim]
    pub fused: Tensor<B, 2>,
    pub attention: Option<AttentionMaps<B>>,
}

impl<B: Backend> MixedAttention<B> {
    pub fn new(config: &ModelConfig, ctx: &ExecutionContext<B>) -> Self {
        let dim = config.wsi_projection_dim;
        Self {
            to_qkv: ctx.linear(dim, 3 * dim, false, 2000),
            scale_linear: Param::from_tensor(ctx.zeros([1, 1, dim])),
            dwc: ctx.depthwise_conv2d(dim, config.kernel_size, 2001),
            feamap_linear: ctx.linear(dim, dim, true, 2002),
            feamap_dropout: ctx.dropout(config.dropout),
            gated_pool: GatedAttentionPool::new(dim, ctx, 2010),
            fusion: AttentionFusion::new(dim, config.dropout, ctx, 2020),
            num_pathways: Ignored(config.num_pathways()),
            dim: Ignored(dim),
            focusing_factor: Ignored(config.focusing_factor),
        }
    }

    pub fn num_pathways(&self) -> usize {
        *self.num_pathways
    }

    /// input shape: [batch, pathways + patches, dim]
    /// mask shape: [batch, pathways + patches], 1.0 = real token
    /// output shape: [batch, 2 * dim]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        mask: Option<Tensor<B, 2>>,
        return_attention: bool,
    ) -> Result<MixedAttentionOutput<B>> {
        let [batch, tokens, dim] = x.dims();
        let m = *self.num_pathways;
        if dim != *self.dim {
            return Err(SurvivalError::Shape {
                context: "mixed attention",
                detail: format!("token width {} but layer width {}", dim, *self.dim),
            });
        }
        if tokens < m {
            return Err(SurvivalError::Shape {
                context: "mixed attention",
                detail: format!("{} tokens cannot hold {} pathway tokens", tokens, m),
            });
        }
        let n = tokens - m;
        let device = x.device();

        let qkv = self.to_qkv.forward_3d(x);
        let mut q = qkv.clone().slice([0..batch, 0..tokens, 0..dim]);
        let mut k = qkv.clone().slice([0..batch, 0..tokens, dim..2 * dim]);
        let mut v = qkv.slice([0..batch, 0..tokens, 2 * dim..3 * dim]);

        if let Some(mask) = mask {
            if mask.dims() != [batch, tokens] {
                return Err(SurvivalError::Shape {
                    context: "mixed attention",
                    detail: format!("mask {:?} for tokens [{}, {}]", mask.dims(), batch, tokens),
                });
            }
            let mask = mask.unsqueeze_dim::<3>(2);
            q = q * mask.clone();
            k = k * mask.clone();
            v = v * mask;
        }

        let scale = (dim as f64).powf(-0.5);
        let q_pathway = q.clone().slice([0..batch, 0..m, 0..dim]);
        let k_pathway = k.clone().slice([0..batch, 0..m, 0..dim]);
        let v_pathway = v.clone().slice([0..batch, 0..m, 0..dim]);

        let pathway_self = q_pathway
            .clone()
            .mul_scalar(scale)
            .matmul(k_pathway.clone().swap_dims(1, 2));
        let out_self_pathway = activation::softmax(pathway_self.clone(), 2).matmul(v_pathway.clone());

        let (out_cross_image, out_cross_pathway, out_self_image, pathway_to_image, image_to_pathway) =
            if n == 0 {
                (
                    Tensor::zeros([batch, 0, dim], &device),
                    Tensor::zeros([batch, m, dim], &device),
                    Tensor::zeros([batch, 0, dim], &device),
                    Tensor::zeros([batch, m, 0], &device),
                    Tensor::zeros([batch, 0, m], &device),
                )
            } else {
                let q_image = q.slice([0..batch, m..tokens, 0..dim]);
                let k_image = k.slice([0..batch, m..tokens, 0..dim]);
                let v_image = v.slice([0..batch, m..tokens, 0..dim]);

                let image_to_pathway = q_image.clone().mul_scalar(scale).matmul(k_pathway.swap_dims(1, 2));
                let out_cross_image = activation::softmax(image_to_pathway.clone(), 2).matmul(v_pathway);

                let pathway_to_image = q_pathway.mul_scalar(scale).matmul(k_image.clone().swap_dims(1, 2));
                let out_cross_pathway = activation::softmax(pathway_to_image.clone(), 2).matmul(v_image.clone());

                let linear = self.linear_attention(q_image, k_image, v_image.clone());
                let local = self.local_mixing(v_image);
                let out_self_image = self
                    .feamap_dropout
                    .forward(self.feamap_linear.forward_3d(linear + local));

                (out_cross_image, out_cross_pathway, out_self_image, pathway_to_image, image_to_pathway)
            };

        let cross = self.fusion.forward(
            self.gated_pool.forward(out_cross_pathway.clone()),
            self.gated_pool.forward(out_cross_image.clone()),
            out_cross_pathway,
            out_cross_image,
        );
        let own = self.fusion.forward(
            self.gated_pool.forward(out_self_pathway.clone()),
            self.gated_pool.forward(out_self_image.clone()),
            out_self_pathway,
            out_self_image,
        );
        let fused = Tensor::cat(vec![cross.fusion, own.fusion], 1);

        let attention = return_attention.then(|| AttentionMaps {
            pathway_self: pathway_self.detach(),
            pathway_to_image: pathway_to_image.detach(),
            image_to_pathway: image_to_pathway.detach(),
        });

        Ok(MixedAttentionOutput { fused, attention })
    }

    /// Kernelised attention over image tokens with a focused feature map.
    ///
    /// `φ(x) = focus(relu(x) + 1e-6) / softplus(scale)`, then
    /// `out_i = φ(q_i)·Σ_j φ(k_j)ᵀ v_j / (φ(q_i)·Σ_j φ(k_j) + 1e-6)`.
    pub fn linear_attention(&self, q: Tensor<B, 3>, k: Tensor<B, 3>, v: Tensor<B, 3>) -> Tensor<B, 3> {
        let divisor = activation::softplus(self.scale_linear.val(), 1.0);
        let q = activation::relu(q).add_scalar(FEATURE_FLOOR) / divisor.clone();
        let k = activation::relu(k).add_scalar(FEATURE_FLOOR) / divisor;

        let q = focus(q, *self.focusing_factor);
        let k = focus(k, *self.focusing_factor);

        // [batch, n, 1]
        let z = q
            .clone()
            .matmul(k.clone().sum_dim(1).swap_dims(1, 2))
            .add_scalar(NORMALIZER_EPS)
            .recip();
        // [batch, dim, dim]
        let kv = k.swap_dims(1, 2).matmul(v);
        q.matmul(kv) * z
    }

    /// Depthwise convolution of the image values laid out on a
    /// `find_closest_factors(n)` grid.
    pub fn local_mixing(&self, v: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, n, dim] = v.dims();
        let (w, h) = find_closest_factors(n);

        // b (w h) c -> b c w h
        let grid = v.reshape([batch, w, h, dim]).swap_dims(1, 3).swap_dims(2, 3);
        let mixed = self.dwc.forward(grid);
        // b c w h -> b (w h) c
        mixed.swap_dims(2, 3).swap_dims(1, 3).reshape([batch, n, dim])
    }

    pub fn l1_norm(&self) -> Tensor<B, 1> {
        self.to_qkv.l1_norm()
            + self.scale_linear.val().abs().sum()
            + self.dwc.l1_norm()
            + self.feamap_linear.l1_norm()
            + self.gated_pool.l1_norm()
            + self.fusion.l1_norm()
    }
}

/// Raises the (positive) features to `power` and rescales every row back to
/// its original L2 norm.
fn focus<B: Backend>(x: Tensor<B, 3>, power: f32) -> Tensor<B, 3> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(2).sqrt();
    let powered = x.powf_scalar(power);
    let powered_norm = powered.clone().powf_scalar(2.0).sum_dim(2).sqrt();
    powered / powered_norm * norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{Distribution, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn layer(num_pathways: usize, dim: usize) -> (MixedAttention<TestBackend>, ExecutionContext<TestBackend>) {
        let device = Default::default();
        let ctx = ExecutionContext::<TestBackend>::new(11, device);
        let mut config = ModelConfig::new(vec![4; num_pathways]);
        config.wsi_projection_dim = dim;
        (MixedAttention::new(&config, &ctx), ctx)
    }

    #[test]
    fn test_output_width_is_twice_dim() {
        let (attn, ctx) = layer(3, 16);
        let x = Tensor::<TestBackend, 3>::random([2, 3 + 12, 16], Distribution::Default, ctx.device());
        let out = attn.forward(x, None, false).unwrap();
        assert_eq!(out.fused.dims(), [2, 32]);
        assert!(out.attention.is_none());
    }

    #[test]
    fn test_attention_maps_shapes() {
        let (attn, ctx) = layer(3, 8);
        let x = Tensor::<TestBackend, 3>::random([1, 3 + 7, 8], Distribution::Default, ctx.device());
        let maps = attn.forward(x, None, true).unwrap().attention.unwrap();
        assert_eq!(maps.pathway_self.dims(), [1, 3, 3]);
        assert_eq!(maps.pathway_to_image.dims(), [1, 3, 7]);
        assert_eq!(maps.image_to_pathway.dims(), [1, 7, 3]);
    }

    #[test]
    fn test_zero_image_tokens() {
        let (attn, ctx) = layer(2, 8);
        let x = Tensor::<TestBackend, 3>::random([2, 2, 8], Distribution::Default, ctx.device());
        let out = attn.forward(x, None, false).unwrap();
        assert_eq!(out.fused.dims(), [2, 16]);
        let values: Vec<f32> = out.fused.into_data().to_vec().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_rejects_short_bag_and_bad_mask() {
        let (attn, ctx) = layer(3, 8);
        let x = Tensor::<TestBackend, 3>::zeros([1, 2, 8], ctx.device());
        assert!(attn.forward(x, None, false).is_err());

        let x = Tensor::<TestBackend, 3>::zeros([1, 5, 8], ctx.device());
        let mask = Tensor::<TestBackend, 2>::ones([1, 4], ctx.device());
        assert!(attn.forward(x, Some(mask), false).is_err());
    }

    #[test]
    fn test_padding_tokens_do_not_change_output() {
        let (attn, ctx) = layer(2, 8);
        let real = Tensor::<TestBackend, 3>::random([1, 2 + 4, 8], Distribution::Default, ctx.device());
        let noise = Tensor::<TestBackend, 3>::random([1, 2 + 4, 8], Distribution::Default, ctx.device());
        let mask = Tensor::<TestBackend, 2>::from_data(
            TensorData::new(vec![1.0f32, 1.0, 1.0, 1.0, 0.0, 0.0], [1, 6]),
            ctx.device(),
        );
        // masked positions carry different garbage in each input
        let keep = mask.clone().unsqueeze_dim::<3>(2);
        let drop = keep.clone().neg().add_scalar(1.0);
        let a = real.clone() * keep.clone() + noise.clone() * drop.clone();
        let b = real * keep + noise.mul_scalar(-3.0) * drop;

        let out_a: Vec<f32> = attn.forward(a, Some(mask.clone()), false).unwrap().fused.into_data().to_vec().unwrap();
        let out_b: Vec<f32> = attn.forward(b, Some(mask), false).unwrap().fused.into_data().to_vec().unwrap();
        for (x, y) in out_a.iter().zip(out_b.iter()) {
            assert!((x - y).abs() < 1e-5, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_local_mixing_with_identity_kernel() {
        let (mut attn, ctx) = layer(1, 4);
        let mut kernel = vec![0.0f32; 4 * 5 * 5];
        for c in 0..4 {
            kernel[c * 25 + 12] = 1.0;
        }
        attn.dwc = DepthwiseConv2d::new(
            Tensor::from_data(TensorData::new(kernel, [4, 1, 5, 5]), ctx.device()),
            Tensor::zeros([4], ctx.device()),
        );

        let v = Tensor::<TestBackend, 3>::random([2, 6, 4], Distribution::Default, ctx.device());
        let mixed: Vec<f32> = attn.local_mixing(v.clone()).into_data().to_vec().unwrap();
        let original: Vec<f32> = v.into_data().to_vec().unwrap();
        for (x, y) in mixed.iter().zip(original.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_linear_attention_is_convex_combination_of_values() {
        let (attn, ctx) = layer(1, 4);
        let q = Tensor::<TestBackend, 3>::random([1, 5, 4], Distribution::Default, ctx.device());
        let k = Tensor::<TestBackend, 3>::random([1, 5, 4], Distribution::Default, ctx.device());
        // constant values → every output row equals that constant
        let v = Tensor::<TestBackend, 3>::ones([1, 5, 4], ctx.device()).mul_scalar(2.5);
        let out: Vec<f32> = attn.linear_attention(q, k, v).into_data().to_vec().unwrap();
        for value in out {
            assert!((value - 2.5).abs() < 1e-3, "got {}", value);
        }
    }
}
