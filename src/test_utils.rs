// Test utilities for backend-aware tensor construction and tiny cohorts
//
// Helpers shared by unit and integration tests. Tensors are built with the
// Vec<T> + .as_slice() pattern; cohorts are small synthetic ones whose
// labels are already discretised.

use burn::{
    prelude::*,
    tensor::{backend::Backend, Int, Tensor},
};

use crate::error::Result;
use crate::survtransformer::architectures::base::config::ModelConfig;
use crate::survtransformer::architectures::base::data::{
    discretize_survival_times, synthetic_cohort, PatientSample, SurvivalSplit, SyntheticCohortConfig,
};

/// Create f32 tensor from data slice with specified shape
pub fn tensor_from_f32_vec<B: Backend, const D: usize>(
    data: &[f32],
    shape: [usize; D],
    device: &B::Device,
) -> Tensor<B, D> {
    let expected_size: usize = shape.iter().product();
    assert_eq!(
        data.len(),
        expected_size,
        "Data length {} doesn't match shape {:?}",
        data.len(),
        shape
    );
    Tensor::<B, 1>::from_floats(data.to_vec().as_slice(), device).reshape(shape)
}

pub fn labels_from_vec<B: Backend>(labels: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::<B, 1, Int>::from_ints(labels.to_vec().as_slice(), device)
}

/// Logits whose sigmoid is exactly `hazards` (row-major, `[rows, bins]`).
pub fn logits_from_hazards<B: Backend>(hazards: &[f32], bins: usize, device: &B::Device) -> Tensor<B, 2> {
    let logits: Vec<f32> = hazards.iter().map(|&p| (p / (1.0 - p)).ln()).collect();
    tensor_from_f32_vec(&logits, [hazards.len() / bins, bins], device)
}

/// Small architecture for fast tests: 32-dim patches projected to 16.
pub fn tiny_model_config(omic_sizes: Vec<usize>) -> ModelConfig {
    let mut config = ModelConfig::new(omic_sizes);
    config.wsi_embedding_dim = 32;
    config.wsi_projection_dim = 16;
    config
}

/// Synthetic patients with discretised labels, split into `(train, val)`
/// at `n_train`. Bin edges come from the whole cohort.
pub fn tiny_splits(
    num_patients: usize,
    n_train: usize,
    omic_sizes: Vec<usize>,
    seed: u64,
) -> Result<(SurvivalSplit, SurvivalSplit)> {
    let cohort_config = SyntheticCohortConfig {
        num_patients,
        omic_sizes,
        embedding_dim: 32,
        min_patches: 6,
        max_patches: 12,
        censoring_rate: 0.3,
    };
    let mut patients: Vec<PatientSample> = synthetic_cohort(&cohort_config, seed)?;
    let edges = discretize_survival_times(&mut patients, 4)?;
    let val = patients.split_off(n_train);
    Ok((
        SurvivalSplit::new(patients, edges.clone()),
        SurvivalSplit::new(val, edges),
    ))
}
