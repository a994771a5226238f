use burn::{
    module::{Ignored, Module, Param},
    nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig},
    tensor::{
        activation,
        backend::Backend,
        module::conv2d,
        ops::ConvOptions,
        Tensor,
    },
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use super::attention::{AttentionMaps, MixedAttention};
use super::config::ModelConfig;
use super::data::{OmicsBag, SurvivalBatch};
use super::encoders::{FeatureProjector, PathwayEncoderBank};
use super::mlp::FeedForward;
use crate::error::{Result, SurvivalError};

/// Linear layer whose weights are generated from an explicit seed.
///
/// Same contract as `burn::nn::Linear` (`y = x Wᵀ + b`), but parameters are
/// produced by [`ExecutionContext::linear`] so that model construction is
/// reproducible independent of the backend's global RNG.
#[derive(Module, Debug)]
pub struct DeterministicLinear<B: Backend> {
    /// Weight matrix of shape [output_dim, input_dim]
    pub weight: Param<Tensor<B, 2>>,
    /// Optional bias vector of shape [output_dim]
    pub bias: Option<Param<Tensor<B, 1>>>,
}

impl<B: Backend> DeterministicLinear<B> {
    pub fn new(weight: Tensor<B, 2>, bias: Option<Tensor<B, 1>>) -> Self {
        Self {
            weight: Param::from_tensor(weight),
            bias: bias.map(Param::from_tensor),
        }
    }

    pub fn output_dim(&self) -> usize {
        self.weight.val().dims()[0]
    }

    /// input shape: [batch, input_dim]
    /// output shape: [batch, output_dim]
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let output = input.matmul(self.weight.val().transpose());
        match &self.bias {
            Some(bias) => output.add(bias.val().unsqueeze()),
            None => output,
        }
    }

    /// Applies the layer to the last dimension of a [batch, tokens, input_dim] tensor.
    pub fn forward_3d(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, tokens, input_dim] = input.dims();
        let output_dim = self.output_dim();

        let reshaped_input = input.reshape([batch * tokens, input_dim]);
        self.forward(reshaped_input).reshape([batch, tokens, output_dim])
    }

    /// Sum of absolute values of every parameter of the layer.
    pub fn l1_norm(&self) -> Tensor<B, 1> {
        let weight = self.weight.val().abs().sum();
        match &self.bias {
            Some(bias) => weight + bias.val().abs().sum(),
            None => weight,
        }
    }
}

/// Per-channel (groups == channels) 2D convolution with bias.
#[derive(Module, Debug)]
pub struct DepthwiseConv2d<B: Backend> {
    /// Kernel of shape [channels, 1, kernel, kernel]
    pub weight: Param<Tensor<B, 4>>,
    /// Bias of shape [channels]
    pub bias: Param<Tensor<B, 1>>,
    kernel_size: Ignored<usize>,
}

impl<B: Backend> DepthwiseConv2d<B> {
    pub fn new(weight: Tensor<B, 4>, bias: Tensor<B, 1>) -> Self {
        let kernel_size = weight.dims()[2];
        Self {
            weight: Param::from_tensor(weight),
            bias: Param::from_tensor(bias),
            kernel_size: Ignored(kernel_size),
        }
    }

    /// input shape: [batch, channels, height, width]
    /// output shape: same as input ("same" padding, stride 1)
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let channels = self.weight.val().dims()[0];
        let padding = *self.kernel_size / 2;
        let options = ConvOptions::new([1, 1], [padding, padding], [1, 1], channels);
        conv2d(input, self.weight.val(), Some(self.bias.val()), options)
    }

    pub fn l1_norm(&self) -> Tensor<B, 1> {
        self.weight.val().abs().sum() + self.bias.val().abs().sum()
    }
}

/// Compute device plus base seed for every parameterised component.
///
/// SEED OFFSET POLICY:
/// - Base seed: model seed supplied by the training configuration
/// - +100 series: projector and classification head
/// - +1000 series: pathway encoders (one +10 slot per pathway)
/// - +2000 series: mixed attention fusion layer
///
/// Components never read a global device or seed; they receive a context
/// at construction time.
#[derive(Debug, Clone)]
pub struct ExecutionContext<B: Backend> {
    pub seed: u64,
    device: B::Device,
}

impl<B: Backend> ExecutionContext<B> {
    pub fn new(seed: u64, device: B::Device) -> Self {
        Self { seed, device }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// StdRng seeded with seed + offset.
    pub fn rng(&self, offset: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed.wrapping_add(offset))
    }

    /// Xavier-normal weights, small normal bias.
    pub fn linear(
        &self,
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        offset: u64,
    ) -> DeterministicLinear<B> {
        let mut rng = self.rng(offset);

        let std = (2.0 / (input_dim + output_dim) as f32).sqrt();
        let weight = self.normal_tensor([output_dim, input_dim], &mut rng, 0.0, std);
        let bias_tensor = bias.then(|| self.normal_tensor([output_dim], &mut rng, 0.0, 0.01));

        DeterministicLinear::new(weight, bias_tensor)
    }

    /// Depthwise kernel initialised with fan-in scaled normal weights.
    pub fn depthwise_conv2d(
        &self,
        channels: usize,
        kernel_size: usize,
        offset: u64,
    ) -> DepthwiseConv2d<B> {
        let mut rng = self.rng(offset);
        let std = (1.0 / (kernel_size * kernel_size) as f32).sqrt();
        let weight = self.normal_tensor([channels, 1, kernel_size, kernel_size], &mut rng, 0.0, std);
        let bias = self.normal_tensor([channels], &mut rng, 0.0, 0.01);
        DepthwiseConv2d::new(weight, bias)
    }

    pub fn layer_norm(&self, d_model: usize, eps: f64) -> LayerNorm<B> {
        LayerNormConfig::new(d_model)
            .with_epsilon(eps)
            .init(&self.device)
    }

    /// Dropout draws its mask from the backend RNG during forward, and only
    /// when the backend tracks gradients.
    pub fn dropout(&self, prob: f64) -> Dropout {
        DropoutConfig::new(prob).init()
    }

    pub fn normal_tensor<const D: usize>(
        &self,
        shape: [usize; D],
        rng: &mut StdRng,
        mean: f32,
        std: f32,
    ) -> Tensor<B, D> {
        let total_elements: usize = shape.iter().product();
        let data: Vec<f32> = match Normal::new(mean, std) {
            Ok(normal) => (0..total_elements).map(|_| normal.sample(rng)).collect(),
            // std == 0 (or non-finite) degenerates to a constant tensor
            Err(_) => vec![mean; total_elements],
        };

        Tensor::<B, 1>::from_floats(data.as_slice(), &self.device).reshape(shape)
    }

    pub fn zeros<const D: usize>(&self, shape: [usize; D]) -> Tensor<B, D> {
        Tensor::zeros(shape, &self.device)
    }
}

/// Per-modality logits and the token bags they were pooled from.
#[derive(Debug, Clone)]
pub struct AuxiliaryOutputs<B: Backend> {
    /// [batch, pathways, dim]
    pub pathway_tokens: Tensor<B, 3>,
    /// [batch, patches, dim]
    pub image_tokens: Tensor<B, 3>,
    /// [batch, bins]
    pub pathway_logits: Tensor<B, 2>,
    /// [batch, bins]
    pub image_logits: Tensor<B, 2>,
}

#[derive(Debug, Clone)]
pub struct SurvivalOutput<B: Backend> {
    /// Hazard logits, [batch, bins]
    pub logits: Tensor<B, 2>,
    pub attention: Option<AttentionMaps<B>>,
    /// Present only when the model was built with `contrast_loss`.
    pub aux: Option<AuxiliaryOutputs<B>>,
}

/// Multimodal survival network.
///
/// Patch embeddings are projected to the token width, each pathway group is
/// encoded into one token, the bag `[pathway tokens][image tokens]` goes
/// through [`MixedAttention`], and the `2 · dim` fusion vector is mapped to
/// per-bin hazard logits by
/// `FeedForward → LayerNorm → Linear(2d, d) → ReLU → Linear(d, bins)`.
#[derive(Module, Debug)]
pub struct SurvTransformer<B: Backend> {
    pub wsi_net: FeatureProjector<B>,
    pub pathway_encoders: PathwayEncoderBank<B>,
    pub mixed_attention: MixedAttention<B>,
    pub feed_forward: FeedForward<B>,
    pub layer_norm: LayerNorm<B>,
    pub to_logits_hidden: DeterministicLinear<B>,
    pub to_logits: DeterministicLinear<B>,
    pub pathway_head: Option<DeterministicLinear<B>>,
    pub image_head: Option<DeterministicLinear<B>>,
    num_pathways: Ignored<usize>,
    num_bins: Ignored<usize>,
}

impl<B: Backend> SurvTransformer<B> {
    pub fn new(config: &ModelConfig, ctx: &ExecutionContext<B>) -> Result<Self> {
        config.validate_consistent()?;
        let dim = config.wsi_projection_dim;

        let (pathway_head, image_head) = if config.contrast_loss {
            (
                Some(ctx.linear(dim, config.num_bins, true, 130)),
                Some(ctx.linear(dim, config.num_bins, true, 131)),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            wsi_net: FeatureProjector::new(config.wsi_embedding_dim, dim, ctx, 100),
            pathway_encoders: PathwayEncoderBank::new(&config.omic_sizes, dim, config.omic_dropout, ctx),
            mixed_attention: MixedAttention::new(config, ctx),
            feed_forward: FeedForward::new(2 * dim, 1, config.dropout, config.layer_norm_eps, ctx, 110),
            layer_norm: ctx.layer_norm(2 * dim, config.layer_norm_eps),
            to_logits_hidden: ctx.linear(2 * dim, dim, true, 120),
            to_logits: ctx.linear(dim, config.num_bins, true, 121),
            pathway_head,
            image_head,
            num_pathways: Ignored(config.num_pathways()),
            num_bins: Ignored(config.num_bins),
        })
    }

    pub fn num_bins(&self) -> usize {
        *self.num_bins
    }

    pub fn has_auxiliary_heads(&self) -> bool {
        self.pathway_head.is_some() && self.image_head.is_some()
    }

    pub fn forward_batch(&self, batch: &SurvivalBatch<B>, return_attention: bool) -> Result<SurvivalOutput<B>> {
        self.forward(batch.wsi.clone(), &batch.omics, batch.mask.clone(), return_attention)
    }

    /// wsi: [batch, patches, embedding_dim], one omics field per pathway,
    /// mask: [batch, pathways + patches] with 1.0 on real tokens.
    pub fn forward(
        &self,
        wsi: Tensor<B, 3>,
        omics: &OmicsBag<B>,
        mask: Option<Tensor<B, 2>>,
        return_attention: bool,
    ) -> Result<SurvivalOutput<B>> {
        let [batch, patches, _] = wsi.dims();
        if omics.batch_size() != batch {
            return Err(SurvivalError::Shape {
                context: "survival model",
                detail: format!("{} slides but {} omics rows", batch, omics.batch_size()),
            });
        }

        let image_tokens = self.wsi_net.forward(wsi);
        let pathway_tokens = self.pathway_encoders.forward(omics)?;
        let tokens = Tensor::cat(vec![pathway_tokens.clone(), image_tokens.clone()], 1);

        let image_mask = mask.as_ref().map(|m| {
            let m_pathways = *self.num_pathways;
            m.clone().slice([0..batch, m_pathways..m_pathways + patches])
        });

        let attended = self.mixed_attention.forward(tokens, mask, return_attention)?;

        let h = self.feed_forward.forward(attended.fused);
        let h = self.layer_norm.forward(h);
        let h = activation::relu(self.to_logits_hidden.forward(h));
        let logits = self.to_logits.forward(h);

        let aux = match (&self.pathway_head, &self.image_head) {
            (Some(pathway_head), Some(image_head)) => {
                let pathway_logits = pathway_head.forward(masked_token_mean(pathway_tokens.clone(), None));
                let image_logits = image_head.forward(masked_token_mean(image_tokens.clone(), image_mask));
                Some(AuxiliaryOutputs {
                    pathway_tokens,
                    image_tokens,
                    pathway_logits,
                    image_logits,
                })
            }
            _ => None,
        };

        Ok(SurvivalOutput {
            logits,
            attention: attended.attention,
            aux,
        })
    }

    /// L1 norm of the pathway encoders and the mixed attention layer.
    pub fn l1_regularization(&self) -> Tensor<B, 1> {
        let device = self.to_logits.weight.val().device();
        self.pathway_encoders.l1_norm(&device) + self.mixed_attention.l1_norm()
    }
}

/// Mean over real tokens; an empty (or fully masked) bag pools to zeros.
fn masked_token_mean<B: Backend>(tokens: Tensor<B, 3>, mask: Option<Tensor<B, 2>>) -> Tensor<B, 2> {
    let [batch, count, dim] = tokens.dims();
    if count == 0 {
        return Tensor::zeros([batch, dim], &tokens.device());
    }
    match mask {
        Some(mask) => {
            let mask = mask.unsqueeze_dim::<3>(2);
            let total = (tokens * mask.clone()).sum_dim(1).reshape([batch, dim]);
            let counts = mask.sum_dim(1).reshape([batch, 1]).clamp_min(1.0);
            total / counts
        }
        None => tokens.mean_dim(1).reshape([batch, dim]),
    }
}
