use approx::assert_abs_diff_eq;
use ndarray::{array, Array1, Array2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use surv_transformer_rs::survtransformer::architectures::base::data::ClinicalRecord;
use surv_transformer_rs::survtransformer::architectures::base::metrics::{
    brier_evaluation_times, concordance_index_censored, concordance_index_ipcw, integrated_brier_score,
    EpochAccumulator, KaplanMeier, MetricOutcome, SurvivalLabels,
};

/// Random cohort with roughly a third censored, ties in neither times nor risks.
fn random_cohort(n: usize, seed: u64) -> (SurvivalLabels, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let events: Vec<bool> = (0..n).map(|i| i % 3 != 0).collect();
    let times: Vec<f64> = (0..n).map(|_| rng.random_range(1.0..100.0)).collect();
    let risk: Array1<f64> = (0..n).map(|_| rng.random_range(-2.0..2.0)).collect();
    (SurvivalLabels::new(events, times), risk)
}

fn c_index(labels: &SurvivalLabels, risk: &Array1<f64>) -> f64 {
    concordance_index_censored(labels, risk.view())
        .value()
        .expect("cohort has events")
        .c_index
}

#[test]
fn test_concordance_invariant_to_monotone_transforms() {
    for seed in 0..5 {
        let (labels, risk) = random_cohort(30, seed);
        let base = c_index(&labels, &risk);

        let scaled = risk.mapv(|r| 3.5 * r);
        let shifted = risk.mapv(|r| r - 10.0);
        let exp = risk.mapv(f64::exp);
        let cubed = risk.mapv(|r| r * r * r);

        for transformed in [scaled, shifted, exp, cubed] {
            assert_abs_diff_eq!(c_index(&labels, &transformed), base, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_ipcw_concordance_invariant_to_scaling() {
    let (labels, risk) = random_cohort(25, 42);
    let base = concordance_index_ipcw(&labels, &labels, risk.view()).value().unwrap().c_index;
    let scaled = risk.mapv(|r| 0.01 * r);
    let other = concordance_index_ipcw(&labels, &labels, scaled.view()).value().unwrap().c_index;
    assert_abs_diff_eq!(base, other, epsilon = 1e-12);
}

#[test]
fn test_perfect_and_reversed_ordering() {
    let labels = SurvivalLabels::new(vec![true; 5], vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    let risk = array![5.0, 4.0, 3.0, 2.0, 1.0];
    assert_abs_diff_eq!(c_index(&labels, &risk), 1.0);
    assert_abs_diff_eq!(c_index(&labels, &risk.mapv(|r| -r)), 0.0);
}

#[test]
fn test_negating_risk_mirrors_concordance() {
    let (labels, risk) = random_cohort(20, 7);
    let forward = c_index(&labels, &risk);
    let backward = c_index(&labels, &risk.mapv(|r| -r));
    assert_abs_diff_eq!(forward + backward, 1.0, epsilon = 1e-12);
}

#[test]
fn test_all_censored_is_degenerate() {
    let labels = SurvivalLabels::new(vec![false; 4], vec![1.0, 2.0, 3.0, 4.0]);
    let outcome = concordance_index_censored(&labels, array![0.1, 0.2, 0.3, 0.4].view());
    assert!(outcome.is_degenerate());
    assert_eq!(outcome.map(|c| c.c_index).or_warn("c-index", 0.0), 0.0);
}

#[test]
fn test_kaplan_meier_is_non_increasing() {
    let (labels, _) = random_cohort(40, 3);
    let km = match KaplanMeier::survival_function(&labels) {
        MetricOutcome::Value(km) => km,
        MetricOutcome::Degenerate(reason) => panic!("unexpected degenerate: {}", reason),
    };
    for w in km.probabilities.windows(2) {
        assert!(w[1] <= w[0]);
    }
    assert!(km.probabilities.iter().all(|&p| (0.0..=1.0).contains(&p)));
}

#[test]
fn test_integrated_brier_score_is_bounded() {
    let (labels, _) = random_cohort(30, 11);
    let times = brier_evaluation_times(labels.times.as_slice().unwrap(), &[0.0, 25.0, 50.0, 75.0, f64::INFINITY]);

    // a constant 0.5 survival estimate everywhere
    let survival = Array2::from_elem((labels.len(), times.len()), 0.5);
    let ibs = integrated_brier_score(&labels, &labels, survival.view(), &times)
        .value()
        .expect("ibs on a regular cohort");
    assert!((0.0..=1.0).contains(&ibs), "ibs {}", ibs);
}

#[test]
fn test_epoch_metrics_skip_non_finite_risks() {
    let mut acc = EpochAccumulator::new();
    let n = 12;
    let mut rng = StdRng::seed_from_u64(5);
    let times: Vec<f32> = (0..n).map(|i| 5.0 + 10.0 * i as f32).collect();
    let censorship: Vec<f32> = (0..n).map(|i| if i % 4 == 0 { 1.0 } else { 0.0 }).collect();
    let mut risks: Vec<f32> = (0..n).map(|i| -(i as f32)).collect();
    risks[3] = f32::NAN;

    let survival: Vec<f32> = (0..n)
        .flat_map(|i| {
            let base = 0.95 - 0.05 * i as f32;
            vec![base, base * 0.8, base * 0.6, base * 0.4]
        })
        .collect();
    let logits: Vec<f32> = (0..n * 4).map(|_| rng.random_range(-1.0..1.0)).collect();
    let ids: Vec<String> = (0..n).map(|i| format!("case-{}", i)).collect();
    let clinical = vec![ClinicalRecord::default(); n];

    acc.push_batch(&risks, &censorship, &times, &survival, &logits, 4, &ids, &clinical);
    let cohort = acc.labels();
    let metrics = acc.finalize(&cohort, &[0.0, 40.0, 80.0, 120.0, f64::INFINITY]);

    // remaining risks are perfectly ordered
    assert_abs_diff_eq!(metrics.c_index, 1.0, epsilon = 1e-12);
    assert!(metrics.c_index_ipcw > 0.99);
    assert_eq!(metrics.brier_scores.len(), 4);
    assert!(metrics.ibs.is_finite());
    assert!((0.0..=1.0).contains(&metrics.iauc));
    assert_eq!(acc.patient_results().len(), n);
}
