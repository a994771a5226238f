//! surv-transformer-rs: multimodal survival prediction from whole-slide
//! image embeddings and pathway-grouped omics.

pub mod error;
pub mod survtransformer;

pub use error::{Result, SurvivalError};
pub use survtransformer::settings::Settings;

/// Test utilities for backend-aware tensor construction and tiny cohorts.
///
/// Test support only: helpers assert on their inputs and panic on misuse.
/// Integration tests enable it through the `test-utils` feature.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
