//! Input encoders: the patch-embedding projector and the per-pathway
//! omics encoders that turn each pathway group into one token.

use burn::module::Module;
use burn::prelude::*;

use super::data::OmicsBag;
use super::mlp::SnnBlock;
use super::transformer::{DeterministicLinear, ExecutionContext};
use crate::error::{Result, SurvivalError};

/// Linear projection of patch embeddings into the shared token width.
#[derive(Module, Debug)]
pub struct FeatureProjector<B: Backend> {
    pub linear: DeterministicLinear<B>,
}

impl<B: Backend> FeatureProjector<B> {
    pub fn new(embedding_dim: usize, projection_dim: usize, ctx: &ExecutionContext<B>, seed_offset: u64) -> Self {
        Self {
            linear: ctx.linear(embedding_dim, projection_dim, true, seed_offset),
        }
    }

    /// input shape: [batch, patches, embedding_dim]
    /// output shape: [batch, patches, projection_dim]
    pub fn forward(&self, patches: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, n_patches, _] = patches.dims();
        if n_patches == 0 {
            return Tensor::zeros([batch, 0, self.linear.output_dim()], &patches.device());
        }
        self.linear.forward_3d(patches)
    }
}

/// Stack of self-normalising blocks for one pathway group.
#[derive(Module, Debug)]
pub struct PathwayEncoder<B: Backend> {
    pub blocks: Vec<SnnBlock<B>>,
}

impl<B: Backend> PathwayEncoder<B> {
    /// `hidden` lists the output width of each block; the first block takes
    /// `input_dim` features.
    pub fn new(
        input_dim: usize,
        hidden: &[usize],
        dropout: f64,
        ctx: &ExecutionContext<B>,
        seed_offset: u64,
    ) -> Self {
        let mut blocks = Vec::with_capacity(hidden.len());
        let mut in_dim = input_dim;
        for (i, &out_dim) in hidden.iter().enumerate() {
            blocks.push(SnnBlock::new(in_dim, out_dim, dropout, ctx, seed_offset + i as u64));
            in_dim = out_dim;
        }
        Self { blocks }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.blocks.iter().fold(x, |h, block| block.forward(h))
    }

    pub fn l1_norm(&self, device: &B::Device) -> Tensor<B, 1> {
        self.blocks
            .iter()
            .fold(Tensor::zeros([1], device), |acc, block| acc + block.l1_norm())
    }
}

/// One independent encoder per pathway group.
#[derive(Module, Debug)]
pub struct PathwayEncoderBank<B: Backend> {
    pub encoders: Vec<PathwayEncoder<B>>,
}

impl<B: Backend> PathwayEncoderBank<B> {
    /// Encoder `p` maps `omic_sizes[p]` features through two blocks of
    /// width `token_dim`.
    pub fn new(omic_sizes: &[usize], token_dim: usize, dropout: f64, ctx: &ExecutionContext<B>) -> Self {
        let hidden = [token_dim, token_dim];
        let encoders = omic_sizes
            .iter()
            .enumerate()
            .map(|(p, &size)| PathwayEncoder::new(size, &hidden, dropout, ctx, 1000 + 10 * p as u64))
            .collect();
        Self { encoders }
    }

    pub fn num_pathways(&self) -> usize {
        self.encoders.len()
    }

    /// One token per pathway, in pathway order.
    ///
    /// output shape: [batch, pathways, token_dim]
    pub fn forward(&self, omics: &OmicsBag<B>) -> Result<Tensor<B, 3>> {
        if omics.num_pathways() != self.encoders.len() {
            return Err(SurvivalError::Shape {
                context: "pathway encoders",
                detail: format!(
                    "expected {} pathway fields, got {}",
                    self.encoders.len(),
                    omics.num_pathways()
                ),
            });
        }

        let tokens = self
            .encoders
            .iter()
            .zip(omics.fields.iter())
            .map(|(encoder, field)| encoder.forward(field.clone()))
            .collect();
        Ok(Tensor::stack(tokens, 1))
    }

    /// L1 norm over every encoder parameter.
    pub fn l1_norm(&self, device: &B::Device) -> Tensor<B, 1> {
        self.encoders
            .iter()
            .fold(Tensor::zeros([1], device), |acc, encoder| acc + encoder.l1_norm(device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_projector_shape() {
        let device = Default::default();
        let ctx = ExecutionContext::<TestBackend>::new(42, device);
        let projector = FeatureProjector::new(32, 8, &ctx, 100);

        let x = Tensor::<TestBackend, 3>::random([2, 5, 32], Distribution::Default, ctx.device());
        assert_eq!(projector.forward(x).dims(), [2, 5, 8]);

        let empty = Tensor::<TestBackend, 3>::zeros([2, 0, 32], ctx.device());
        assert_eq!(projector.forward(empty).dims(), [2, 0, 8]);
    }

    #[test]
    fn test_bank_stacks_one_token_per_pathway() {
        let device = Default::default();
        let ctx = ExecutionContext::<TestBackend>::new(42, device);
        let bank = PathwayEncoderBank::new(&[10, 15, 20], 16, 0.25, &ctx);

        let omics = OmicsBag {
            fields: [10, 15, 20]
                .iter()
                .map(|&s| Tensor::<TestBackend, 2>::random([2, s], Distribution::Default, ctx.device()))
                .collect(),
        };
        let tokens = bank.forward(&omics).unwrap();
        assert_eq!(tokens.dims(), [2, 3, 16]);
    }

    #[test]
    fn test_bank_rejects_wrong_field_count() {
        let device = Default::default();
        let ctx = ExecutionContext::<TestBackend>::new(42, device);
        let bank = PathwayEncoderBank::new(&[4, 4], 8, 0.25, &ctx);
        let omics = OmicsBag {
            fields: vec![Tensor::<TestBackend, 2>::zeros([1, 4], ctx.device())],
        };
        assert!(bank.forward(&omics).is_err());
    }

    #[test]
    fn test_pathway_seeds_differ() {
        let device = Default::default();
        let ctx = ExecutionContext::<TestBackend>::new(1, device);
        let bank = PathwayEncoderBank::new(&[6, 6], 4, 0.25, &ctx);
        let w0: Vec<f32> = bank.encoders[0].blocks[0].linear.weight.val().into_data().to_vec().unwrap();
        let w1: Vec<f32> = bank.encoders[1].blocks[0].linear.weight.val().into_data().to_vec().unwrap();
        assert_ne!(w0, w1);
    }
}
