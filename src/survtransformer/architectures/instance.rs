//! Backend aliases, model dispatch and the trait the fold driver trains.

use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// Always include ndarray backend as the default
use burn_autodiff::Autodiff as AutodiffWrapper;
use burn_ndarray::NdArray;

#[cfg(feature = "wgpu")]
use burn_wgpu::Wgpu;

#[cfg(feature = "cuda")]
use burn_cuda::Cuda;

use super::base::config::ModelConfig;
use super::base::data::SurvivalBatch;
use super::base::transformer::{ExecutionContext, SurvTransformer, SurvivalOutput};
use crate::error::{Result, SurvivalError};

pub type CpuBackend = NdArray<f32>;

#[cfg(feature = "wgpu")]
pub type WgpuBackend = Wgpu<f32, i32>;

#[cfg(feature = "cuda")]
pub type CudaBackend = Cuda<f32, i32>;

/// Training backend with autodiff support
pub type CpuAutodiffBackend = AutodiffWrapper<CpuBackend>;

#[cfg(feature = "wgpu")]
pub type WgpuAutodiffBackend = AutodiffWrapper<WgpuBackend>;

#[cfg(feature = "cuda")]
pub type CudaAutodiffBackend = AutodiffWrapper<CudaBackend>;

/// Model families selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    SurvTransformer,
}

impl FromStr for ModelKind {
    type Err = SurvivalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SurvTransformer" | "survtransformer" => Ok(ModelKind::SurvTransformer),
            _ => Err(SurvivalError::UnsupportedModel(s.to_string())),
        }
    }
}

/// What the fold driver needs from a survival network.
pub trait SurvivalModel<B: Backend> {
    fn forward_batch(&self, batch: &SurvivalBatch<B>, return_attention: bool) -> Result<SurvivalOutput<B>>;

    /// Penalty over the sub-networks selected for L1 regularisation.
    fn l1_regularization(&self) -> Tensor<B, 1>;

    fn num_bins(&self) -> usize;

    /// Whether forward passes also produce per-modality logits and tokens.
    fn has_auxiliary_heads(&self) -> bool;
}

impl<B: Backend> SurvivalModel<B> for SurvTransformer<B> {
    fn forward_batch(&self, batch: &SurvivalBatch<B>, return_attention: bool) -> Result<SurvivalOutput<B>> {
        SurvTransformer::forward_batch(self, batch, return_attention)
    }

    fn l1_regularization(&self) -> Tensor<B, 1> {
        SurvTransformer::l1_regularization(self)
    }

    fn num_bins(&self) -> usize {
        SurvTransformer::num_bins(self)
    }

    fn has_auxiliary_heads(&self) -> bool {
        SurvTransformer::has_auxiliary_heads(self)
    }
}

/// Builds the network for `kind`.
pub fn build_model<B: Backend>(
    kind: ModelKind,
    config: &ModelConfig,
    ctx: &ExecutionContext<B>,
) -> Result<SurvTransformer<B>> {
    match kind {
        ModelKind::SurvTransformer => {
            log::info!(
                "building SurvTransformer: {} pathways, {} -> {}, {} bins",
                config.num_pathways(),
                config.wsi_embedding_dim,
                config.wsi_projection_dim,
                config.num_bins
            );
            SurvTransformer::new(config, ctx)
        }
    }
}
