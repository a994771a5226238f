//! Runtime settings: built-in defaults, then an optional
//! `survtransformer.{toml,json,yaml}` file, then `SURVTRANSFORMER__*`
//! environment variables (e.g. `SURVTRANSFORMER__TRAINING__LR=0.001`).

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::architectures::base::config::ModelConfig;
use super::architectures::base::data::SyntheticCohortConfig;
use super::architectures::base::train::TrainingConfig;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub wsi_embedding_dim: usize,
    pub wsi_projection_dim: usize,
    pub num_bins: usize,
    pub dropout: f64,
    pub kernel_size: usize,
    pub focusing_factor: f32,
    /// Adds the per-modality heads and the consistency objective.
    pub contrast_loss: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            wsi_embedding_dim: 1024,
            wsi_projection_dim: 256,
            num_bins: 4,
            dropout: 0.1,
            kernel_size: 5,
            focusing_factor: 3.0,
            contrast_loss: false,
        }
    }
}

/// Option names follow the command-line vocabulary of the training script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSettings {
    pub modality: String,
    pub opt: String,
    pub bag_loss: String,
    pub reg_type: String,
    pub reduction: String,
    pub lambda_reg: f64,
    pub alpha_surv: f64,
    pub lr: f64,
    pub max_epochs: usize,
    pub batch_size: usize,
    pub weighted_sample: bool,
    pub num_patches: usize,
    pub early_stopping: bool,
    pub seed: u64,
    pub consistency_temperature: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            modality: "SurvTransformer".to_string(),
            opt: "adam".to_string(),
            bag_loss: "nll_surv".to_string(),
            reg_type: "None".to_string(),
            reduction: "sum".to_string(),
            lambda_reg: 1e-5,
            alpha_surv: 0.0,
            lr: 1e-4,
            max_epochs: 20,
            batch_size: 1,
            weighted_sample: false,
            num_patches: 4096,
            early_stopping: true,
            seed: 666,
            consistency_temperature: 0.08,
        }
    }
}

/// Cohort shape and cross-validation layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSettings {
    /// Number of folds
    pub k: usize,
    pub num_patients: usize,
    pub omic_sizes: Vec<usize>,
    pub min_patches: usize,
    pub max_patches: usize,
    pub censoring_rate: f64,
    /// Checkpoints and result tables go here; nothing is written when unset.
    pub results_dir: Option<PathBuf>,
}

impl Default for CohortSettings {
    fn default() -> Self {
        Self {
            k: 5,
            num_patients: 40,
            omic_sizes: vec![10, 15, 20],
            min_patches: 20,
            max_patches: 80,
            censoring_rate: 0.3,
            results_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub model: ModelSettings,
    pub training: TrainingSettings,
    pub cohort: CohortSettings,
}

impl Settings {
    /// Defaults, then `survtransformer.*` in the working directory if
    /// present, then environment variables.
    pub fn new() -> std::result::Result<Self, ConfigError> {
        Self::load(File::with_name("survtransformer").required(false))
    }

    /// Same layering with an explicit (required) settings file.
    pub fn from_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        Self::load(File::from(path).required(true))
    }

    fn load<S>(file: S) -> std::result::Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let model = ModelSettings::default();
        let training = TrainingSettings::default();
        let cohort = CohortSettings::default();
        let omic_sizes: Vec<i64> = cohort.omic_sizes.iter().map(|&s| s as i64).collect();

        let settings = Config::builder()
            .set_default("model.wsi_embedding_dim", model.wsi_embedding_dim as i64)?
            .set_default("model.wsi_projection_dim", model.wsi_projection_dim as i64)?
            .set_default("model.num_bins", model.num_bins as i64)?
            .set_default("model.dropout", model.dropout)?
            .set_default("model.kernel_size", model.kernel_size as i64)?
            .set_default("model.focusing_factor", model.focusing_factor as f64)?
            .set_default("model.contrast_loss", model.contrast_loss)?
            .set_default("training.modality", training.modality)?
            .set_default("training.opt", training.opt)?
            .set_default("training.bag_loss", training.bag_loss)?
            .set_default("training.reg_type", training.reg_type)?
            .set_default("training.reduction", training.reduction)?
            .set_default("training.lambda_reg", training.lambda_reg)?
            .set_default("training.alpha_surv", training.alpha_surv)?
            .set_default("training.lr", training.lr)?
            .set_default("training.max_epochs", training.max_epochs as i64)?
            .set_default("training.batch_size", training.batch_size as i64)?
            .set_default("training.weighted_sample", training.weighted_sample)?
            .set_default("training.num_patches", training.num_patches as i64)?
            .set_default("training.early_stopping", training.early_stopping)?
            .set_default("training.seed", training.seed as i64)?
            .set_default("training.consistency_temperature", training.consistency_temperature)?
            .set_default("cohort.k", cohort.k as i64)?
            .set_default("cohort.num_patients", cohort.num_patients as i64)?
            .set_default("cohort.omic_sizes", omic_sizes)?
            .set_default("cohort.min_patches", cohort.min_patches as i64)?
            .set_default("cohort.max_patches", cohort.max_patches as i64)?
            .set_default("cohort.censoring_rate", cohort.censoring_rate)?
            .set_default("cohort.results_dir", None::<String>)?
            .add_source(file)
            .add_source(
                Environment::with_prefix("SURVTRANSFORMER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("cohort.omic_sizes")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }

    /// Model architecture for a cohort with the given pathway sizes.
    pub fn model_config(&self, omic_sizes: Vec<usize>) -> ModelConfig {
        let mut config = ModelConfig::new(omic_sizes);
        config.omic_names = (0..config.omic_sizes.len()).map(|p| format!("pathway_{}", p)).collect();
        config.wsi_embedding_dim = self.model.wsi_embedding_dim;
        config.wsi_projection_dim = self.model.wsi_projection_dim;
        config.num_bins = self.model.num_bins;
        config.dropout = self.model.dropout;
        config.kernel_size = self.model.kernel_size;
        config.focusing_factor = self.model.focusing_factor;
        config.contrast_loss = self.model.contrast_loss;
        config
    }

    /// Parses the string options; unknown names fail with the matching
    /// `Unsupported*` / `InvalidReduction` error.
    pub fn training_config(&self, omic_sizes: Vec<usize>) -> Result<TrainingConfig> {
        let t = &self.training;
        let config = TrainingConfig::new(self.model_config(omic_sizes))
            .with_modality(t.modality.parse()?)
            .with_optimizer(t.opt.parse()?)
            .with_bag_loss(t.bag_loss.parse()?)
            .with_reg_type(t.reg_type.parse()?)
            .with_reduction(t.reduction.parse()?)
            .with_lambda_reg(t.lambda_reg)
            .with_alpha_surv(t.alpha_surv)
            .with_learning_rate(t.lr)
            .with_max_epochs(t.max_epochs)
            .with_batch_size(t.batch_size)
            .with_weighted_sample(t.weighted_sample)
            .with_num_patches(t.num_patches)
            .with_early_stopping(t.early_stopping)
            .with_seed(t.seed)
            .with_consistency_temperature(t.consistency_temperature);
        config.validate_consistent()?;
        Ok(config)
    }

    pub fn synthetic_cohort_config(&self) -> SyntheticCohortConfig {
        SyntheticCohortConfig {
            num_patients: self.cohort.num_patients,
            omic_sizes: self.cohort.omic_sizes.clone(),
            embedding_dim: self.model.wsi_embedding_dim,
            min_patches: self.cohort.min_patches,
            max_patches: self.cohort.max_patches,
            censoring_rate: self.cohort.censoring_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SurvivalError;
    use crate::survtransformer::architectures::base::config::RegularizationKind;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.model.num_bins, 4);
        assert_eq!(settings.model.wsi_projection_dim, 256);
        assert_eq!(settings.training.lr, 1e-4);
        assert_eq!(settings.training.seed, 666);
        assert_eq!(settings.training.reduction, "sum");
        assert_eq!(settings.cohort.omic_sizes, vec![10, 15, 20]);
        assert!(settings.cohort.results_dir.is_none());
    }

    #[test]
    fn test_settings_new_matches_defaults() {
        let settings = Settings::new().unwrap_or_else(|_| Settings::default());
        assert_eq!(settings.model.num_bins, 4);
        assert_eq!(settings.training.bag_loss, "nll_surv");
    }

    #[test]
    fn test_settings_from_file_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[training]\nreg_type = \"pathcell\"\nmax_epochs = 3\n[model]\nnum_bins = 6").unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.training.max_epochs, 3);
        assert_eq!(settings.model.num_bins, 6);
        // untouched keys keep their defaults
        assert_eq!(settings.training.lr, 1e-4);

        let config = settings.training_config(vec![4, 5]).unwrap();
        assert_eq!(config.reg_type, RegularizationKind::PathCell);
        assert_eq!(config.model.num_bins, 6);
        assert_eq!(config.model.omic_names, vec!["pathway_0", "pathway_1"]);
    }

    #[test]
    fn test_unknown_options_are_typed_errors() {
        let mut settings = Settings::default();
        settings.training.reduction = "median".to_string();
        assert!(matches!(
            settings.training_config(vec![4]),
            Err(SurvivalError::InvalidReduction(_))
        ));

        let mut settings = Settings::default();
        settings.training.opt = "sgd".to_string();
        assert!(matches!(
            settings.training_config(vec![4]),
            Err(SurvivalError::UnsupportedOptimizer(_))
        ));

        let mut settings = Settings::default();
        settings.training.modality = "MCAT".to_string();
        assert!(matches!(
            settings.training_config(vec![4]),
            Err(SurvivalError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn test_settings_serialization() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).expect("Should serialize to JSON");
        let back: Settings = serde_json::from_str(&json).expect("Should deserialize from JSON");
        assert_eq!(back, settings);
    }
}
