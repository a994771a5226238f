//! Fold training and evaluation: optimisation epochs, validation passes with
//! survival metrics, the two best-model monitors and result persistence.

use burn::{
    config::Config,
    module::{AutodiffModule, Module},
    optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, GradientsParams, Optimizer},
    record::CompactRecorder,
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion, Tensor},
};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use super::super::instance::{build_model, ModelKind, SurvivalModel};
use super::config::{BagLoss, ModelConfig, OptimizerKind, RegularizationKind};
use super::data::{collate, PatientSample, SamplingStrategy, SurvivalBatch, SurvivalSplit};
use super::loss_utils::{risk_from_logits, ConsistencyLoss, NllSurvLoss, Reduction, SURVIVAL_EPS};
use super::metrics::{EpochAccumulator, PatientResult, SurvivalLabels, SurvivalMetrics};
use super::transformer::{ExecutionContext, SurvivalOutput};
use crate::error::{Result as SurvResult, SurvivalError};

/// Training configuration for one cross-validation run
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Model configuration
    pub model: ModelConfig,
    #[config(default = "ModelKind::SurvTransformer")]
    pub modality: ModelKind,
    #[config(default = "OptimizerKind::Adam")]
    pub optimizer: OptimizerKind,
    #[config(default = "BagLoss::NllSurv")]
    pub bag_loss: BagLoss,
    #[config(default = "RegularizationKind::None")]
    pub reg_type: RegularizationKind,
    #[config(default = "Reduction::Sum")]
    pub reduction: Reduction,
    /// L1 strength applied when `reg_type` is `PathCell`
    #[config(default = 1e-5)]
    pub lambda_reg: f64,
    /// Extra weight of the uncensored term of the survival NLL
    #[config(default = 0.0)]
    pub alpha_surv: f64,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = 20)]
    pub max_epochs: usize,
    #[config(default = 1)]
    pub batch_size: usize,
    /// Class-balanced sampling over `(bin, censorship)` classes
    #[config(default = false)]
    pub weighted_sample: bool,
    /// Patch capacity of every training bag
    #[config(default = 4096)]
    pub num_patches: usize,
    #[config(default = true)]
    pub early_stopping: bool,
    #[config(default = 0)]
    pub es_warmup: usize,
    #[config(default = 10)]
    pub es_patience: usize,
    #[config(default = 20)]
    pub es_stop_epoch: usize,
    #[config(default = 666)]
    pub seed: u64,
    #[config(default = 0.08)]
    pub consistency_temperature: f64,
}

impl TrainingConfig {
    pub fn validate_consistent(&self) -> SurvResult<()> {
        self.model.validate_consistent()?;
        if self.batch_size == 0 {
            return Err(SurvivalError::InvalidConfig("batch_size must be at least 1".to_string()));
        }
        if self.num_patches == 0 {
            return Err(SurvivalError::InvalidConfig("num_patches must be at least 1".to_string()));
        }
        if self.consistency_temperature <= 0.0 {
            return Err(SurvivalError::InvalidConfig(format!(
                "consistency temperature must be positive, got {}",
                self.consistency_temperature
            )));
        }
        Ok(())
    }

    fn sampling_strategy(&self) -> SamplingStrategy {
        if self.weighted_sample {
            SamplingStrategy::ClassBalanced
        } else {
            SamplingStrategy::Shuffled
        }
    }
}

/// What a monitor asks the driver to do after one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonitorStep {
    pub save_checkpoint: bool,
    pub stop: bool,
}

/// Validation-loss early stopping with warmup, patience and a minimum
/// epoch before stopping is allowed.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub warmup: usize,
    pub patience: usize,
    pub stop_epoch: usize,
    pub counter: usize,
    pub best_score: Option<f64>,
    pub early_stop: bool,
    pub val_loss_min: f64,
}

impl EarlyStopping {
    pub fn new(warmup: usize, patience: usize, stop_epoch: usize) -> Self {
        Self {
            warmup,
            patience,
            stop_epoch,
            counter: 0,
            best_score: None,
            early_stop: false,
            val_loss_min: f64::INFINITY,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.es_warmup, config.es_patience, config.es_stop_epoch)
    }

    /// `stop` is set only on the epoch the stop condition first holds.
    pub fn observe(&mut self, epoch: usize, val_loss: f64) -> MonitorStep {
        let score = -val_loss;
        if epoch < self.warmup {
            return MonitorStep::default();
        }

        match self.best_score {
            Some(best) if score < best => {
                self.counter += 1;
                log::info!("early stopping counter: {} out of {}", self.counter, self.patience);
                if self.counter >= self.patience && epoch > self.stop_epoch && !self.early_stop {
                    self.early_stop = true;
                    return MonitorStep {
                        save_checkpoint: false,
                        stop: true,
                    };
                }
                MonitorStep::default()
            }
            _ => {
                log::debug!("validation loss improved ({:.6} --> {:.6})", self.val_loss_min, val_loss);
                self.best_score = Some(score);
                self.val_loss_min = val_loss;
                self.counter = 0;
                MonitorStep {
                    save_checkpoint: true,
                    stop: false,
                }
            }
        }
    }
}

/// Tracks the best validation concordance.
#[derive(Debug, Clone, Default)]
pub struct CIndexMonitor {
    pub best_score: Option<f64>,
}

impl CIndexMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `c_index` is the first or a strictly better observation.
    pub fn observe(&mut self, c_index: f64) -> bool {
        match self.best_score {
            Some(best) if c_index <= best => false,
            _ => {
                self.best_score = Some(c_index);
                true
            }
        }
    }
}

/// Checkpoints to write after one validation epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpochDecision {
    pub save_min_loss: bool,
    pub save_max_cindex: bool,
    pub stop: bool,
}

/// Early stopping and the c-index monitor of one fold. The c-index
/// monitor is not consulted on the epoch that stops training.
#[derive(Debug, Clone)]
pub struct FoldMonitors {
    pub early_stopping: EarlyStopping,
    pub cindex: CIndexMonitor,
}

impl FoldMonitors {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            early_stopping: EarlyStopping::from_config(config),
            cindex: CIndexMonitor::new(),
        }
    }

    pub fn observe(&mut self, epoch: usize, val_loss: f64, c_index: f64) -> EpochDecision {
        let step = self.early_stopping.observe(epoch, val_loss);
        if step.stop {
            return EpochDecision {
                save_min_loss: step.save_checkpoint,
                save_max_cindex: false,
                stop: true,
            };
        }
        EpochDecision {
            save_min_loss: step.save_checkpoint,
            save_max_cindex: self.cindex.observe(c_index),
            stop: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainEpochSummary {
    pub epoch: usize,
    pub loss: f64,
    pub loss_reg: f64,
    pub c_index: f64,
}

/// Outputs and metrics of one gradient-free pass over a split.
#[derive(Debug, Clone)]
pub struct EvaluationPass {
    pub loss: f64,
    pub loss_reg: f64,
    pub metrics: SurvivalMetrics,
    pub outputs: EpochAccumulator,
}

/// Bag-level objective: survival NLL, plus the auxiliary heads and the
/// cross-modal consistency term when the model produced them.
pub fn batch_objective<B: Backend>(
    output: &SurvivalOutput<B>,
    batch: &SurvivalBatch<B>,
    nll: &NllSurvLoss,
    consistency: &ConsistencyLoss,
) -> SurvResult<Tensor<B, 1>> {
    let main = nll.forward(output.logits.clone(), batch.labels.clone(), batch.censorship.clone())?;
    let Some(aux) = &output.aux else {
        return Ok(main);
    };

    let pathway = nll.forward(aux.pathway_logits.clone(), batch.labels.clone(), batch.censorship.clone())?;
    let image = nll.forward(aux.image_logits.clone(), batch.labels.clone(), batch.censorship.clone())?;
    let alignment = consistency.forward(
        aux.pathway_tokens.clone(),
        aux.image_tokens.clone(),
        aux.pathway_logits.clone(),
        aux.image_logits.clone(),
        batch.labels.clone(),
    )?;
    Ok(main.mul_scalar(0.5) + pathway.mul_scalar(0.25) + image.mul_scalar(0.25) + alignment.mul_scalar(0.25))
}

fn host_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> SurvResult<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SurvivalError::Data(format!("reading tensor: {:?}", e)))
}

/// Appends risk, survival and logits of one batch to `acc`.
fn record_batch<B: Backend>(acc: &mut EpochAccumulator, logits: Tensor<B, 2>, batch: &SurvivalBatch<B>) -> SurvResult<()> {
    let [_, bins] = logits.dims();
    let (risk, survival) = risk_from_logits(logits.clone());
    acc.push_batch(
        &host_values(risk)?,
        &batch.host_censorship,
        &batch.host_event_times,
        &host_values(survival)?,
        &host_values(logits)?,
        bins,
        &batch.case_ids,
        &batch.clinical,
    );
    Ok(())
}

/// Optimiser state plus the model being trained on one fold.
pub struct SurvivalTrainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + SurvivalModel<B>,
    M::InnerModule: SurvivalModel<B::InnerBackend>,
{
    pub model: M,
    pub config: TrainingConfig,
    optimizer: OptimizerAdaptor<Adam, M, B>,
    nll: NllSurvLoss,
    consistency: ConsistencyLoss,
    rng: StdRng,
    device: B::Device,
}

impl<B, M> SurvivalTrainer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + SurvivalModel<B>,
    M::InnerModule: SurvivalModel<B::InnerBackend>,
{
    pub fn new(config: TrainingConfig, model: M, device: &B::Device) -> SurvResult<Self> {
        config.validate_consistent()?;
        if model.num_bins() != config.model.num_bins {
            return Err(SurvivalError::InvalidConfig(format!(
                "model predicts {} bins but the configuration asks for {}",
                model.num_bins(),
                config.model.num_bins
            )));
        }
        if model.has_auxiliary_heads() != config.model.contrast_loss {
            return Err(SurvivalError::InvalidConfig(format!(
                "contrast_loss is {} but the model {} auxiliary heads",
                config.model.contrast_loss,
                if model.has_auxiliary_heads() { "has" } else { "lacks" }
            )));
        }
        let optimizer = match config.optimizer {
            OptimizerKind::Adam => AdamConfig::new().init(),
        };
        let nll = match config.bag_loss {
            BagLoss::NllSurv => NllSurvLoss {
                alpha: config.alpha_surv,
                eps: SURVIVAL_EPS,
                reduction: config.reduction,
            },
        };

        Ok(Self {
            model,
            optimizer,
            nll,
            consistency: ConsistencyLoss::new(config.consistency_temperature),
            rng: StdRng::seed_from_u64(config.seed),
            device: device.clone(),
            config,
        })
    }

    fn regularization_weight(&self) -> Option<f64> {
        match self.config.reg_type {
            RegularizationKind::None => None,
            RegularizationKind::PathCell => Some(self.config.lambda_reg),
        }
    }

    /// One optimisation pass over `split` in sampler order.
    pub fn train_epoch(&mut self, epoch: usize, split: &SurvivalSplit) -> SurvResult<TrainEpochSummary> {
        if split.is_empty() {
            return Err(SurvivalError::Data("training split is empty".to_string()));
        }
        let order = split.epoch_order(self.config.sampling_strategy(), &mut self.rng)?;

        let mut acc = EpochAccumulator::new();
        let (mut total_loss, mut total_loss_reg) = (0.0, 0.0);

        for chunk in order.chunks(self.config.batch_size) {
            let samples: Vec<&PatientSample> = chunk.iter().map(|&i| &split.samples[i]).collect();
            let bags = samples
                .iter()
                .map(|s| s.sampled_bag(self.config.num_patches, &mut self.rng))
                .collect();
            let batch = collate::<B>(&samples, bags, &self.device)?;

            let output = self.model.forward_batch(&batch, false)?;
            let loss = batch_objective(&output, &batch, &self.nll, &self.consistency)?;
            let loss_value = loss.clone().into_scalar().elem::<f64>();

            let (objective, loss_reg) = match self.regularization_weight() {
                Some(lambda) => {
                    let reg = self.model.l1_regularization().mul_scalar(lambda);
                    let reg_value = reg.clone().into_scalar().elem::<f64>();
                    (loss.div_scalar(batch.batch_size() as f64) + reg, reg_value)
                }
                None => (loss.div_scalar(batch.batch_size() as f64), 0.0),
            };

            record_batch(&mut acc, output.logits.detach(), &batch)?;
            total_loss += loss_value;
            total_loss_reg += loss_value + loss_reg;

            let grads = objective.backward();
            let grads = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optimizer.step(self.config.learning_rate, self.model.clone(), grads);
        }

        let n = split.len() as f64;
        let summary = TrainEpochSummary {
            epoch,
            loss: total_loss / n,
            loss_reg: total_loss_reg / n,
            c_index: acc.concordance(),
        };
        log::info!(
            "Epoch: {}, train_loss: {:.4}, train_loss_reg: {:.4}, train_c_index: {:.4}",
            summary.epoch,
            summary.loss,
            summary.loss_reg,
            summary.c_index
        );
        Ok(summary)
    }

    /// Full-slide pass with batch size 1 and no gradients. `cohort` fits
    /// the censoring distribution used by the weighted metrics.
    pub fn evaluate(&self, split: &SurvivalSplit, cohort: &SurvivalLabels) -> SurvResult<EvaluationPass> {
        if split.is_empty() {
            return Err(SurvivalError::Data("validation split is empty".to_string()));
        }
        let model = self.model.valid();
        let reg_value = match self.regularization_weight() {
            Some(lambda) => model.l1_regularization().into_scalar().elem::<f64>() * lambda,
            None => 0.0,
        };

        let mut acc = EpochAccumulator::new();
        let (mut total_loss, mut total_loss_reg) = (0.0, 0.0);
        for sample in &split.samples {
            let batch = collate::<B::InnerBackend>(&[sample], vec![sample.full_bag()], &self.device)?;
            let output = model.forward_batch(&batch, false)?;
            let loss = batch_objective(&output, &batch, &self.nll, &self.consistency)?;
            let loss_value = loss.into_scalar().elem::<f64>();

            record_batch(&mut acc, output.logits, &batch)?;
            total_loss += loss_value;
            total_loss_reg += loss_value + reg_value;
        }

        let n = split.len() as f64;
        let metrics = acc.finalize(cohort, &split.bin_edges);
        Ok(EvaluationPass {
            loss: total_loss / n,
            loss_reg: total_loss_reg / n,
            metrics,
            outputs: acc,
        })
    }

    /// Writes the current weights to `<dir>/<name>.mpk`.
    pub fn save_checkpoint(&self, dir: &Path, name: &str) -> SurvResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(name);
        self.model
            .clone()
            .save_file(path.clone(), &CompactRecorder::new())
            .map_err(|e| SurvivalError::Checkpoint(format!("{:?}", e)))?;
        log::debug!("saved checkpoint {}", path.display());
        Ok(path.with_extension("mpk"))
    }
}

/// Final per-patient table and headline metrics of one fold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldOutcome {
    pub fold: usize,
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub val_loss: f64,
    pub metrics: SurvivalMetrics,
    pub patients: BTreeMap<String, PatientResult>,
}

impl FoldOutcome {
    /// Writes the outcome as `<dir>/split_<fold>_results.json`.
    pub fn save(&self, dir: &Path) -> SurvResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("split_{}_results.json", self.fold));
        serde_json::to_writer_pretty(File::create(&path)?, self)?;
        Ok(path)
    }
}

pub fn split_labels(split: &SurvivalSplit) -> SurvivalLabels {
    SurvivalLabels::new(split.events(), split.event_times())
}

/// Trains a fresh model on `train`, selects checkpoints on `val` and returns
/// the final validation summary. Nothing is written without `results_dir`.
pub fn run_fold<B: AutodiffBackend>(
    fold: usize,
    train: &SurvivalSplit,
    val: &SurvivalSplit,
    config: &TrainingConfig,
    device: &B::Device,
    results_dir: Option<&Path>,
) -> SurvResult<FoldOutcome> {
    if train.omic_sizes() != config.model.omic_sizes {
        return Err(SurvivalError::InvalidConfig(format!(
            "model expects pathway sizes {:?} but the cohort has {:?}",
            config.model.omic_sizes,
            train.omic_sizes()
        )));
    }
    log::info!("training fold {}: {} train / {} val patients", fold, train.len(), val.len());

    let ctx = ExecutionContext::<B>::new(config.seed, device.clone());
    let model = build_model(config.modality, &config.model, &ctx)?;
    let label_bins = train.bin_edges.len().saturating_sub(1);
    if SurvivalModel::<B>::num_bins(&model) != label_bins {
        return Err(SurvivalError::InvalidConfig(format!(
            "model predicts {} bins but the labels were discretised into {}",
            SurvivalModel::<B>::num_bins(&model),
            label_bins
        )));
    }
    let mut trainer = SurvivalTrainer::new(config.clone(), model, device)?;

    let cohort = split_labels(train).concat(&split_labels(val));
    let mut monitors = config.early_stopping.then(|| FoldMonitors::from_config(config));

    let mut epochs_run = 0;
    let mut stopped_early = false;
    for epoch in 0..config.max_epochs {
        trainer.train_epoch(epoch, train)?;
        let pass = trainer.evaluate(val, &cohort)?;
        epochs_run = epoch + 1;
        log::info!(
            "val epoch: {}, loss: {:.4}, c-index: {:.4}, c-index ipcw: {:.4}, ibs: {:.4}, iauc: {:.4}",
            epoch,
            pass.loss,
            pass.metrics.c_index,
            pass.metrics.c_index_ipcw,
            pass.metrics.ibs,
            pass.metrics.iauc
        );

        let Some(monitors) = monitors.as_mut() else {
            continue;
        };
        let decision = monitors.observe(epoch, pass.loss, pass.metrics.c_index);
        if let (true, Some(dir)) = (decision.save_min_loss, results_dir) {
            trainer.save_checkpoint(dir, &format!("s_{}_minloss_checkpoint", fold))?;
        }
        if decision.stop {
            log::info!("early stopping at epoch {}", epoch);
            stopped_early = true;
            break;
        }
        if let (true, Some(dir)) = (decision.save_max_cindex, results_dir) {
            trainer.save_checkpoint(dir, &format!("s_{}_maxcindex_checkpoint", fold))?;
        }
    }

    let summary = trainer.evaluate(val, &cohort)?;
    log::info!(
        "Final Val c-index: {:.4} | Final Val c-index2: {:.4} | Final Val IBS: {:.4} | Final Val iauc: {:.4}",
        summary.metrics.c_index,
        summary.metrics.c_index_ipcw,
        summary.metrics.ibs,
        summary.metrics.iauc
    );

    let outcome = FoldOutcome {
        fold,
        epochs_run,
        stopped_early,
        val_loss: summary.loss,
        metrics: summary.metrics,
        patients: summary.outputs.patient_results().into_iter().collect(),
    };
    if let Some(dir) = results_dir {
        outcome.save(dir)?;
    }
    Ok(outcome)
}
