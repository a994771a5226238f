use surv_transformer_rs::survtransformer::architectures::base::train::{
    CIndexMonitor, EarlyStopping, TrainingConfig,
};
use surv_transformer_rs::test_utils::tiny_model_config;

/// Epochs at which the monitor asked to stop.
fn stop_epochs(es: &mut EarlyStopping, losses: &[f64]) -> Vec<usize> {
    losses
        .iter()
        .enumerate()
        .filter_map(|(epoch, &loss)| es.observe(epoch, loss).stop.then_some(epoch))
        .collect()
}

#[test]
fn test_strictly_improving_loss_never_stops() {
    let losses: Vec<f64> = (0..50).map(|e| 5.0 / (1.0 + e as f64)).collect();
    let mut es = EarlyStopping::new(0, 3, 0);
    assert!(stop_epochs(&mut es, &losses).is_empty());
    assert!(!es.early_stop);
    assert_eq!(es.counter, 0);
}

#[test]
fn test_plateau_signals_stop_exactly_once() {
    // improves until epoch 4, then flat
    let mut losses: Vec<f64> = (0..5).map(|e| 2.0 - 0.1 * e as f64).collect();
    losses.extend(std::iter::repeat(1.7).take(30));

    let mut es = EarlyStopping::new(0, 10, 20);
    let stops = stop_epochs(&mut es, &losses);

    // patience reached at epoch 14, stopping only allowed past epoch 20
    assert_eq!(stops, vec![21]);
    assert!(es.early_stop);
}

#[test]
fn test_patience_binds_after_stop_epoch() {
    let mut losses = vec![1.0];
    losses.extend(std::iter::repeat(2.0).take(20));

    let mut es = EarlyStopping::new(0, 4, 2);
    assert_eq!(stop_epochs(&mut es, &losses), vec![4]);
}

#[test]
fn test_warmup_epochs_are_ignored() {
    let mut es = EarlyStopping::new(5, 1, 0);
    for epoch in 0..5 {
        let step = es.observe(epoch, 100.0 - epoch as f64);
        assert!(!step.save_checkpoint && !step.stop);
    }
    assert!(es.best_score.is_none());
    assert!(es.observe(5, 3.0).save_checkpoint);
    assert_eq!(es.val_loss_min, 3.0);
}

#[test]
fn test_improvement_resets_counter() {
    let mut es = EarlyStopping::new(0, 3, 0);
    let losses = [1.0, 1.2, 1.3, 0.9, 1.0, 1.1, 1.2];
    let stops = stop_epochs(&mut es, &losses);
    assert_eq!(stops, vec![6]);
    assert_eq!(es.val_loss_min, 0.9);
}

#[test]
fn test_from_config_uses_thresholds() {
    let config = TrainingConfig::new(tiny_model_config(vec![3]))
        .with_es_warmup(2)
        .with_es_patience(7)
        .with_es_stop_epoch(9);
    let es = EarlyStopping::from_config(&config);
    assert_eq!((es.warmup, es.patience, es.stop_epoch), (2, 7, 9));
}

#[test]
fn test_cindex_monitor_keeps_strict_maximum() {
    let mut monitor = CIndexMonitor::new();
    let saves: Vec<bool> = [0.5, 0.6, 0.6, 0.55, 0.7]
        .iter()
        .map(|&c| monitor.observe(c))
        .collect();
    assert_eq!(saves, vec![true, true, false, false, true]);
    assert_eq!(monitor.best_score, Some(0.7));
}
