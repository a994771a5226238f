use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::data::PathwayGroup;
use crate::error::{Result, SurvivalError};

/// Optimizers the fold driver knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = SurvivalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            _ => Err(SurvivalError::UnsupportedOptimizer(s.to_string())),
        }
    }
}

/// Bag-level survival objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BagLoss {
    NllSurv,
}

impl FromStr for BagLoss {
    type Err = SurvivalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "nll_surv" => Ok(BagLoss::NllSurv),
            _ => Err(SurvivalError::UnsupportedLoss(s.to_string())),
        }
    }
}

/// Which parameters receive the L1 penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegularizationKind {
    None,
    /// Pathway encoders plus the fusion layer.
    PathCell,
}

impl FromStr for RegularizationKind {
    type Err = SurvivalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(RegularizationKind::None),
            "pathcell" => Ok(RegularizationKind::PathCell),
            _ => Err(SurvivalError::UnsupportedRegularization(s.to_string())),
        }
    }
}

/// Architecture configuration for the survival transformer.
///
/// Dimensions that depend on the cohort (`omic_sizes`, `omic_names`) are
/// fixed when the model is constructed; all other fields carry the
/// defaults used for the reference experiments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Input width of each pathway encoder, one entry per pathway group
    pub omic_sizes: Vec<usize>,

    /// Optional pathway group names (same order as `omic_sizes`)
    #[serde(default)]
    pub omic_names: Vec<String>,

    /// Width of the pre-extracted patch embeddings
    #[serde(default = "default_wsi_embedding_dim")]
    pub wsi_embedding_dim: usize,

    /// Shared token width `d`
    #[serde(default = "default_wsi_projection_dim")]
    pub wsi_projection_dim: usize,

    /// Number of discrete survival bins (hazard logits per sample)
    #[serde(default = "default_num_bins")]
    pub num_bins: usize,

    /// Dropout used by the fusion blocks and the classification head
    #[serde(default = "default_dropout")]
    pub dropout: f64,

    /// Alpha dropout probability inside the pathway encoders
    #[serde(default = "default_omic_dropout")]
    pub omic_dropout: f64,

    /// Attention heads; only single-head fusion is supported
    #[serde(default = "default_heads")]
    pub heads: usize,

    /// Depthwise convolution kernel for the image local-mixing term (odd)
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,

    /// Power applied to the linear-attention feature map
    #[serde(default = "default_focusing_factor")]
    pub focusing_factor: f32,

    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// Adds per-modality heads used by the consistency objective
    #[serde(default)]
    pub contrast_loss: bool,
}

fn default_wsi_embedding_dim() -> usize { 1024 }
fn default_wsi_projection_dim() -> usize { 256 }
fn default_num_bins() -> usize { 4 }
fn default_dropout() -> f64 { 0.1 }
fn default_omic_dropout() -> f64 { 0.25 }
fn default_heads() -> usize { 1 }
fn default_kernel_size() -> usize { 5 }
fn default_focusing_factor() -> f32 { 3.0 }
fn default_layer_norm_eps() -> f64 { 1e-5 }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            omic_sizes: Vec::new(),
            omic_names: Vec::new(),
            wsi_embedding_dim: default_wsi_embedding_dim(),
            wsi_projection_dim: default_wsi_projection_dim(),
            num_bins: default_num_bins(),
            dropout: default_dropout(),
            omic_dropout: default_omic_dropout(),
            heads: default_heads(),
            kernel_size: default_kernel_size(),
            focusing_factor: default_focusing_factor(),
            layer_norm_eps: default_layer_norm_eps(),
            contrast_loss: false,
        }
    }
}

impl ModelConfig {
    pub fn new(omic_sizes: Vec<usize>) -> Self {
        Self {
            omic_sizes,
            ..Self::default()
        }
    }

    /// Sizes and names taken from intersected pathway groups.
    pub fn from_pathways(groups: &[PathwayGroup]) -> Self {
        Self {
            omic_sizes: groups.iter().map(PathwayGroup::size).collect(),
            omic_names: groups.iter().map(|g| g.name.clone()).collect(),
            ..Self::default()
        }
    }

    /// Number of pathway tokens at the head of every token bag.
    pub fn num_pathways(&self) -> usize {
        self.omic_sizes.len()
    }

    pub fn validate_consistent(&self) -> Result<()> {
        log::debug!(
            "validating model config: {} pathways, {} -> {}, {} bins",
            self.omic_sizes.len(),
            self.wsi_embedding_dim,
            self.wsi_projection_dim,
            self.num_bins
        );

        if self.omic_sizes.is_empty() {
            return Err(SurvivalError::InvalidConfig(
                "at least one pathway group is required".to_string(),
            ));
        }
        if let Some(idx) = self.omic_sizes.iter().position(|&s| s == 0) {
            return Err(SurvivalError::InvalidConfig(format!(
                "pathway group {} has no features",
                idx
            )));
        }
        if !self.omic_names.is_empty() && self.omic_names.len() != self.omic_sizes.len() {
            return Err(SurvivalError::InvalidConfig(format!(
                "{} pathway names for {} pathway groups",
                self.omic_names.len(),
                self.omic_sizes.len()
            )));
        }
        if self.wsi_embedding_dim == 0 || self.wsi_projection_dim == 0 {
            return Err(SurvivalError::InvalidConfig(
                "embedding and projection dimensions must be positive".to_string(),
            ));
        }
        if self.num_bins == 0 {
            return Err(SurvivalError::InvalidConfig(
                "num_bins must be positive".to_string(),
            ));
        }
        if self.heads != 1 {
            return Err(SurvivalError::InvalidConfig(format!(
                "only single-head fusion is supported, got heads={}",
                self.heads
            )));
        }
        if self.kernel_size % 2 == 0 {
            return Err(SurvivalError::InvalidConfig(format!(
                "kernel_size must be odd, got {}",
                self.kernel_size
            )));
        }
        for (name, p) in [("dropout", self.dropout), ("omic_dropout", self.omic_dropout)] {
            if !(0.0..1.0).contains(&p) {
                return Err(SurvivalError::InvalidConfig(format!(
                    "{} must lie in [0, 1), got {}",
                    name, p
                )));
            }
        }
        if !(self.focusing_factor > 0.0) {
            return Err(SurvivalError::InvalidConfig(format!(
                "focusing_factor must be positive, got {}",
                self.focusing_factor
            )));
        }
        Ok(())
    }
}
