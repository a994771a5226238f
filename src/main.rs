use std::fs::File;

use surv_transformer_rs::survtransformer::architectures::base::data::{
    discretize_survival_times, k_fold_splits, synthetic_cohort, OmicsScaler, PatientSample, SurvivalSplit,
};
use surv_transformer_rs::survtransformer::architectures::base::train::{run_fold, FoldOutcome};
use surv_transformer_rs::survtransformer::architectures::instance::CpuAutodiffBackend;
use surv_transformer_rs::{Result, Settings};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let settings = Settings::new()?;
    log::info!("surv-transformer starting with {:?}", settings.training);

    let mut patients = synthetic_cohort(&settings.synthetic_cohort_config(), settings.training.seed)?;
    let bin_edges = discretize_survival_times(&mut patients, settings.model.num_bins)?;
    let config = settings.training_config(settings.cohort.omic_sizes.clone())?;
    let folds = k_fold_splits(patients.len(), settings.cohort.k, config.seed)?;
    let results_dir = settings.cohort.results_dir.as_deref();

    let device = Default::default();
    let mut outcomes: Vec<FoldOutcome> = Vec::with_capacity(folds.len());
    for (fold, (train_idx, val_idx)) in folds.iter().enumerate() {
        let pick = |idx: &[usize]| -> Vec<PatientSample> { idx.iter().map(|&i| patients[i].clone()).collect() };
        let (mut train, mut val) = (pick(train_idx), pick(val_idx));

        // omics are scaled with training statistics only
        let scaler = OmicsScaler::fit(&train)?;
        scaler.transform(&mut train);
        scaler.transform(&mut val);

        let outcome = run_fold::<CpuAutodiffBackend>(
            fold,
            &SurvivalSplit::new(train, bin_edges.clone()),
            &SurvivalSplit::new(val, bin_edges.clone()),
            &config,
            &device,
            results_dir,
        )?;
        outcomes.push(outcome);
    }

    let n = outcomes.len() as f64;
    let mean = |f: fn(&FoldOutcome) -> f64| outcomes.iter().map(f).sum::<f64>() / n;
    log::info!(
        "{} folds: mean c-index {:.4}, mean c-index ipcw {:.4}, mean ibs {:.4}, mean iauc {:.4}",
        outcomes.len(),
        mean(|o| o.metrics.c_index),
        mean(|o| o.metrics.c_index_ipcw),
        mean(|o| o.metrics.ibs),
        mean(|o| o.metrics.iauc)
    );

    if let Some(dir) = results_dir {
        let summary: Vec<_> = outcomes.iter().map(|o| (o.fold, &o.metrics, o.val_loss)).collect();
        serde_json::to_writer_pretty(File::create(dir.join("summary.json"))?, &summary)?;
    }
    Ok(())
}
