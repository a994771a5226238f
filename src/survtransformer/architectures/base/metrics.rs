//! Censoring-aware survival metrics and the per-epoch output accumulator.
//!
//! All estimators work on host `ndarray` arrays. A metric that cannot be
//! computed for the given data returns [`MetricOutcome::Degenerate`] with a
//! reason instead of failing; [`EpochAccumulator::finalize`] logs those and
//! reports zero.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::data::ClinicalRecord;

/// Risk scores closer than this are treated as tied.
pub const TIED_TOLERANCE: f64 = 1e-8;
/// Scores closer than this count as one threshold of the AUC curve.
pub const AUC_TIED_TOLERANCE: f64 = f64::EPSILON;
/// Offset of the first and last Brier evaluation times from the
/// validation follow-up bounds.
pub const BRIER_TIME_MARGIN: f64 = 1e-4;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricOutcome<T> {
    Value(T),
    Degenerate(String),
}

impl<T> MetricOutcome<T> {
    pub fn is_degenerate(&self) -> bool {
        matches!(self, MetricOutcome::Degenerate(_))
    }

    pub fn value(self) -> Option<T> {
        match self {
            MetricOutcome::Value(v) => Some(v),
            MetricOutcome::Degenerate(_) => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MetricOutcome<U> {
        match self {
            MetricOutcome::Value(v) => MetricOutcome::Value(f(v)),
            MetricOutcome::Degenerate(reason) => MetricOutcome::Degenerate(reason),
        }
    }

    pub fn and_then<U>(self, f: impl FnOnce(T) -> MetricOutcome<U>) -> MetricOutcome<U> {
        match self {
            MetricOutcome::Value(v) => f(v),
            MetricOutcome::Degenerate(reason) => MetricOutcome::Degenerate(reason),
        }
    }

    /// Value, or `fallback` after a warning naming the metric.
    pub fn or_warn(self, metric: &str, fallback: T) -> T {
        match self {
            MetricOutcome::Value(v) => v,
            MetricOutcome::Degenerate(reason) => {
                log::warn!("{} is degenerate ({}), reporting zero", metric, reason);
                fallback
            }
        }
    }
}

/// Event indicators and observed times of one cohort.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SurvivalLabels {
    pub events: Array1<bool>,
    pub times: Array1<f64>,
}

impl SurvivalLabels {
    pub fn new(events: Vec<bool>, times: Vec<f64>) -> Self {
        Self {
            events: Array1::from(events),
            times: Array1::from(times),
        }
    }

    /// Labels from censoring flags (1.0 = censored).
    pub fn from_censorship(censorship: &[f32], times: &[f32]) -> Self {
        Self::new(
            censorship.iter().map(|&c| c < 0.5).collect(),
            times.iter().map(|&t| t as f64).collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Concatenation of two cohorts.
    pub fn concat(&self, other: &SurvivalLabels) -> SurvivalLabels {
        let events = self.events.iter().chain(other.events.iter()).copied().collect();
        let times = self.times.iter().chain(other.times.iter()).copied().collect();
        SurvivalLabels::new(events, times)
    }

    fn check(&self) -> MetricOutcome<()> {
        if self.events.len() != self.times.len() {
            return MetricOutcome::Degenerate(format!(
                "{} event flags for {} times",
                self.events.len(),
                self.times.len()
            ));
        }
        if self.is_empty() {
            return MetricOutcome::Degenerate("no samples".to_string());
        }
        if !self.events.iter().any(|&e| e) {
            return MetricOutcome::Degenerate("all samples are censored".to_string());
        }
        MetricOutcome::Value(())
    }
}

/// Concordance index plus pair counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Concordance {
    pub c_index: f64,
    pub concordant: usize,
    pub discordant: usize,
    pub tied_risk: usize,
    pub tied_time: usize,
}

fn stable_argsort(values: ArrayView1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].partial_cmp(&values[b]).unwrap_or(Ordering::Equal));
    order
}

/// Comparable sets keyed by the position (in time order) of each event
/// sample: every sample with a strictly larger time, plus the censored
/// samples tied with it.
fn comparable_pairs(labels: &SurvivalLabels, order: &[usize]) -> (Vec<(usize, Vec<usize>)>, usize) {
    let n = order.len();
    let mut comparable = Vec::new();
    let mut tied_time = 0;

    let mut i = 0;
    while i + 1 < n {
        let time_i = labels.times[order[i]];
        let mut end = i + 1;
        while end < n && labels.times[order[end]] == time_i {
            end += 1;
        }

        let censored_here: Vec<usize> = (i..end).filter(|&k| !labels.events[order[k]]).collect();
        for j in i..end {
            if labels.events[order[j]] {
                let mut partners = censored_here.clone();
                partners.extend(end..n);
                tied_time += censored_here.len();
                comparable.push((j, partners));
            }
        }
        i = end;
    }
    (comparable, tied_time)
}

fn weighted_concordance(
    labels: &SurvivalLabels,
    estimate: ArrayView1<f64>,
    weights: ArrayView1<f64>,
) -> MetricOutcome<Concordance> {
    let order = stable_argsort(labels.times.view());
    let (comparable, tied_time) = comparable_pairs(labels, &order);
    if comparable.is_empty() {
        return MetricOutcome::Degenerate("no comparable pairs".to_string());
    }

    let (mut concordant, mut discordant, mut tied_risk) = (0usize, 0usize, 0usize);
    let (mut numerator, mut denominator) = (0.0f64, 0.0f64);
    for (position, partners) in &comparable {
        let anchor = order[*position];
        let est_i = estimate[anchor];
        let w_i = weights[anchor];

        let mut n_ties = 0usize;
        let mut n_con = 0usize;
        for &p in partners {
            let est = estimate[order[p]];
            if (est - est_i).abs() <= TIED_TOLERANCE {
                n_ties += 1;
            } else if est < est_i {
                n_con += 1;
            }
        }
        numerator += w_i * n_con as f64 + 0.5 * w_i * n_ties as f64;
        denominator += w_i * partners.len() as f64;
        concordant += n_con;
        tied_risk += n_ties;
        discordant += partners.len() - n_con - n_ties;
    }

    if denominator == 0.0 {
        return MetricOutcome::Degenerate("comparable pairs carry zero weight".to_string());
    }
    MetricOutcome::Value(Concordance {
        c_index: numerator / denominator,
        concordant,
        discordant,
        tied_risk,
        tied_time,
    })
}

fn check_estimate(labels: &SurvivalLabels, estimate: ArrayView1<f64>) -> MetricOutcome<()> {
    if estimate.len() != labels.len() {
        return MetricOutcome::Degenerate(format!(
            "{} risk scores for {} samples",
            estimate.len(),
            labels.len()
        ));
    }
    if estimate.iter().any(|v| !v.is_finite()) {
        return MetricOutcome::Degenerate("risk scores contain non-finite values".to_string());
    }
    MetricOutcome::Value(())
}

/// Harrell's concordance index with censoring: higher risk should go with
/// earlier events.
pub fn concordance_index_censored(labels: &SurvivalLabels, risk: ArrayView1<f64>) -> MetricOutcome<Concordance> {
    labels
        .check()
        .and_then(|_| check_estimate(labels, risk))
        .and_then(|_| weighted_concordance(labels, risk, Array1::ones(labels.len()).view()))
}

/// Concordance with every comparable event weighted by `1 / G(t)²`, `G`
/// being the censoring survival function fitted on `cohort`.
pub fn concordance_index_ipcw(
    cohort: &SurvivalLabels,
    labels: &SurvivalLabels,
    risk: ArrayView1<f64>,
) -> MetricOutcome<Concordance> {
    labels
        .check()
        .and_then(|_| check_estimate(labels, risk))
        .and_then(|_| KaplanMeier::censoring_distribution(cohort))
        .and_then(|censoring| censoring.ipcw(labels))
        .and_then(|ipcw| {
            let weights = ipcw.mapv(|w| w * w);
            weighted_concordance(labels, risk, weights.view())
        })
}

/// Step function estimate `P(T > t)` with a leading `(-inf, 1.0)` knot.
#[derive(Debug, Clone, PartialEq)]
pub struct KaplanMeier {
    pub unique_times: Array1<f64>,
    pub probabilities: Array1<f64>,
}

/// Distinct sorted times with event count, at-risk count and censored count.
fn risk_set_counts(labels: &SurvivalLabels) -> (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
    let order = stable_argsort(labels.times.view());
    let n = order.len();
    let (mut times, mut events, mut at_risk, mut censored) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());

    let mut i = 0;
    while i < n {
        let t = labels.times[order[i]];
        let mut j = i;
        let (mut e, mut c) = (0.0, 0.0);
        while j < n && labels.times[order[j]] == t {
            if labels.events[order[j]] {
                e += 1.0;
            } else {
                c += 1.0;
            }
            j += 1;
        }
        times.push(t);
        events.push(e);
        at_risk.push((n - i) as f64);
        censored.push(c);
        i = j;
    }
    (times, events, at_risk, censored)
}

impl KaplanMeier {
    /// `reverse` estimates the censoring distribution instead of the event
    /// distribution.
    fn estimate(labels: &SurvivalLabels, reverse: bool) -> (Vec<f64>, Vec<f64>) {
        let (times, events, mut at_risk, censored) = risk_set_counts(labels);
        let events = if reverse {
            for (r, e) in at_risk.iter_mut().zip(&events) {
                *r -= e;
            }
            censored
        } else {
            events
        };

        let mut running = 1.0;
        let probabilities = events
            .iter()
            .zip(&at_risk)
            .map(|(&e, &r)| {
                let ratio = if e != 0.0 { e / r } else { 0.0 };
                running *= 1.0 - ratio;
                running
            })
            .collect();
        (times, probabilities)
    }

    fn with_origin(times: Vec<f64>, probabilities: Vec<f64>) -> Self {
        let unique_times = std::iter::once(f64::NEG_INFINITY).chain(times).collect();
        let probabilities = std::iter::once(1.0).chain(probabilities).collect();
        Self {
            unique_times,
            probabilities,
        }
    }

    pub fn survival_function(labels: &SurvivalLabels) -> MetricOutcome<Self> {
        labels.check().map(|_| {
            let (times, probabilities) = Self::estimate(labels, false);
            Self::with_origin(times, probabilities)
        })
    }

    /// Survival function of the censoring times. Without any censoring the
    /// distribution is constant 1.
    pub fn censoring_distribution(labels: &SurvivalLabels) -> MetricOutcome<Self> {
        if labels.is_empty() {
            return MetricOutcome::Degenerate("empty censoring cohort".to_string());
        }
        if labels.events.iter().all(|&e| e) {
            let (times, _, _, _) = risk_set_counts(labels);
            let ones = vec![1.0; times.len()];
            return MetricOutcome::Value(Self {
                unique_times: Array1::from(times),
                probabilities: Array1::from(ones),
            });
        }
        let (times, probabilities) = Self::estimate(labels, true);
        MetricOutcome::Value(Self::with_origin(times, probabilities))
    }

    /// Step-function lookup: exact knots take their own value, anything in
    /// between takes the previous knot's.
    pub fn predict(&self, times: ArrayView1<f64>) -> MetricOutcome<Array1<f64>> {
        let last = self.unique_times.len() - 1;
        let last_time = self.unique_times[last];
        if self.probabilities[last] > 0.0 && times.iter().any(|&t| t > last_time) {
            return MetricOutcome::Degenerate(format!(
                "time must be smaller than largest observed time point {}",
                last_time
            ));
        }

        let knots = self.unique_times.as_slice().unwrap_or(&[]);
        let values = times.mapv(|t| {
            let idx = knots.partition_point(|&k| k < t);
            let exact = idx <= last && (self.unique_times[idx] - t).abs() < f64::EPSILON;
            if exact {
                self.probabilities[idx]
            } else if idx == 0 {
                // before the first knot of a distribution without origin
                1.0
            } else {
                self.probabilities[idx - 1]
            }
        });
        MetricOutcome::Value(values)
    }

    /// Inverse probability of censoring weights: `1 / G(t_i)` for events,
    /// zero for censored samples.
    pub fn ipcw(&self, labels: &SurvivalLabels) -> MetricOutcome<Array1<f64>> {
        self.predict(labels.times.view()).and_then(|g| {
            let mut weights = Array1::zeros(labels.len());
            for i in 0..labels.len() {
                if labels.events[i] {
                    if g[i] == 0.0 {
                        return MetricOutcome::Degenerate(
                            "censoring survival function is zero at one or more time points".to_string(),
                        );
                    }
                    weights[i] = 1.0 / g[i];
                }
            }
            MetricOutcome::Value(weights)
        })
    }
}

/// Sorts and de-duplicates the evaluation times and checks they lie in
/// `[min(t), max(t))` of the evaluated cohort and match the estimate width.
fn check_times(labels: &SurvivalLabels, estimate: ArrayView2<f64>, times: &[f64]) -> MetricOutcome<Array1<f64>> {
    let mut sorted: Vec<f64> = times.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    sorted.dedup();
    if sorted.is_empty() {
        return MetricOutcome::Degenerate("no evaluation times".to_string());
    }

    let t_min = labels.times.iter().copied().fold(f64::INFINITY, f64::min);
    let t_max = labels.times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if sorted[sorted.len() - 1] >= t_max || sorted[0] < t_min {
        return MetricOutcome::Degenerate(format!(
            "all times must be within follow-up time of test data: [{}; {}[",
            t_min, t_max
        ));
    }
    if estimate.nrows() != labels.len() {
        return MetricOutcome::Degenerate(format!(
            "estimate has {} rows for {} samples",
            estimate.nrows(),
            labels.len()
        ));
    }
    if estimate.ncols() != sorted.len() {
        return MetricOutcome::Degenerate(format!(
            "expected estimate with {} columns, got {}",
            sorted.len(),
            estimate.ncols()
        ));
    }
    MetricOutcome::Value(Array1::from(sorted))
}

/// Time-dependent Brier score of survival probabilities (one column per
/// evaluation time), weighted by the censoring distribution of `cohort`.
pub fn brier_score(
    cohort: &SurvivalLabels,
    labels: &SurvivalLabels,
    survival: ArrayView2<f64>,
    times: &[f64],
) -> MetricOutcome<(Array1<f64>, Array1<f64>)> {
    let times = match labels.check().and_then(|_| check_times(labels, survival, times)) {
        MetricOutcome::Value(t) => t,
        MetricOutcome::Degenerate(reason) => return MetricOutcome::Degenerate(reason),
    };
    let censoring = match KaplanMeier::censoring_distribution(cohort) {
        MetricOutcome::Value(c) => c,
        MetricOutcome::Degenerate(reason) => return MetricOutcome::Degenerate(reason),
    };

    let zero_to_inf = |g: Array1<f64>| g.mapv(|v| if v == 0.0 { f64::INFINITY } else { v });
    let (g_event, g_times) = match (censoring.predict(labels.times.view()), censoring.predict(times.view())) {
        (MetricOutcome::Value(a), MetricOutcome::Value(b)) => (zero_to_inf(a), zero_to_inf(b)),
        (MetricOutcome::Degenerate(reason), _) | (_, MetricOutcome::Degenerate(reason)) => {
            return MetricOutcome::Degenerate(reason)
        }
    };

    let n = labels.len() as f64;
    let mut scores = Array1::zeros(times.len());
    for (k, &t) in times.iter().enumerate() {
        let column = survival.column(k);
        let mut total = 0.0;
        for i in 0..labels.len() {
            let ti = labels.times[i];
            let est = column[i];
            if ti <= t && labels.events[i] {
                total += est * est / g_event[i];
            } else if ti > t {
                total += (1.0 - est) * (1.0 - est) / g_times[k];
            }
        }
        scores[k] = total / n;
    }
    MetricOutcome::Value((times, scores))
}

fn trapezoid(y: ArrayView1<f64>, x: ArrayView1<f64>) -> f64 {
    (1..x.len())
        .map(|i| (x[i] - x[i - 1]) * (y[i] + y[i - 1]) / 2.0)
        .sum()
}

/// Brier scores integrated over the evaluation times, divided by their span.
pub fn integrated_brier_score(
    cohort: &SurvivalLabels,
    labels: &SurvivalLabels,
    survival: ArrayView2<f64>,
    times: &[f64],
) -> MetricOutcome<f64> {
    brier_score(cohort, labels, survival, times).and_then(|(times, scores)| {
        if times.len() < 2 {
            return MetricOutcome::Degenerate("at least two time points must be given".to_string());
        }
        let span = times[times.len() - 1] - times[0];
        MetricOutcome::Value(trapezoid(scores.view(), times.view()) / span)
    })
}

/// Per-time cumulative/dynamic AUC of a risk estimate (higher = earlier
/// event), and its mean weighted by the Kaplan–Meier survival of `labels`.
pub fn cumulative_dynamic_auc(
    cohort: &SurvivalLabels,
    labels: &SurvivalLabels,
    estimate: ArrayView2<f64>,
    times: &[f64],
) -> MetricOutcome<(Array1<f64>, f64)> {
    let times = match labels.check().and_then(|_| check_times(labels, estimate, times)) {
        MetricOutcome::Value(t) => t,
        MetricOutcome::Degenerate(reason) => return MetricOutcome::Degenerate(reason),
    };
    let ipcw = match KaplanMeier::censoring_distribution(cohort).and_then(|c| c.ipcw(labels)) {
        MetricOutcome::Value(w) => w,
        MetricOutcome::Degenerate(reason) => return MetricOutcome::Degenerate(reason),
    };

    let n = labels.len();
    let mut scores = Array1::zeros(times.len());
    for (k, &t) in times.iter().enumerate() {
        let column = estimate.column(k);
        // descending risk, stable
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| column[b].partial_cmp(&column[a]).unwrap_or(Ordering::Equal));

        let n_controls = order.iter().filter(|&&i| labels.times[i] > t).count() as f64;
        let mut tp = Vec::with_capacity(n);
        let mut fp = Vec::with_capacity(n);
        let mut tied_with_previous = Vec::with_capacity(n);
        let (mut cum_tp, mut cum_fp) = (0.0, 0.0);
        let mut previous = f64::INFINITY;
        for &i in &order {
            if labels.times[i] <= t && labels.events[i] {
                cum_tp += ipcw[i];
            }
            if labels.times[i] > t {
                cum_fp += 1.0;
            }
            tp.push(cum_tp);
            fp.push(cum_fp);
            tied_with_previous.push((column[i] - previous).abs() <= AUC_TIED_TOLERANCE);
            previous = column[i];
        }
        if cum_tp == 0.0 || n_controls == 0.0 {
            return MetricOutcome::Degenerate(format!("no cases or no controls at time {}", t));
        }

        // of a run of tied scores only the last threshold is kept
        let mut curve_tp = vec![0.0];
        let mut curve_fp = vec![0.0];
        for j in 0..n {
            let superseded = j + 1 < n && tied_with_previous[j + 1];
            if !superseded {
                curve_tp.push(tp[j] / cum_tp);
                curve_fp.push(fp[j] / n_controls);
            }
        }
        scores[k] = trapezoid(Array1::from(curve_tp).view(), Array1::from(curve_fp).view());
    }

    if times.len() == 1 {
        return MetricOutcome::Value((scores.clone(), scores[0]));
    }
    KaplanMeier::survival_function(labels)
        .and_then(|km| km.predict(times.view()))
        .and_then(|s_times| {
            let mut previous = 1.0;
            let mut integral = 0.0;
            for k in 0..times.len() {
                integral += scores[k] * (previous - s_times[k]);
                previous = s_times[k];
            }
            let mass = 1.0 - s_times[times.len() - 1];
            if mass == 0.0 {
                return MetricOutcome::Degenerate("survival does not drop over the evaluation times".to_string());
            }
            MetricOutcome::Value((scores, integral / mass))
        })
}

/// Brier evaluation times for a split:
/// `[min(t) + 1e-4, edge[1], edge[2], max(t) - 1e-4]`.
pub fn brier_evaluation_times(times: &[f64], bin_edges: &[f64]) -> Vec<f64> {
    let t_min = times.iter().copied().fold(f64::INFINITY, f64::min);
    let t_max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut points = vec![t_min + BRIER_TIME_MARGIN];
    points.extend(bin_edges.iter().skip(1).take(2).copied());
    points.push(t_max - BRIER_TIME_MARGIN);
    points
}

/// Indices of finite risk scores.
pub fn finite_indices(risk: &[f64]) -> Vec<usize> {
    risk.iter()
        .enumerate()
        .filter(|(_, r)| r.is_finite())
        .map(|(i, _)| i)
        .collect()
}

/// Headline metrics of one evaluation pass; degenerate metrics are zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurvivalMetrics {
    pub c_index: f64,
    pub c_index_ipcw: f64,
    pub brier_scores: Vec<f64>,
    pub ibs: f64,
    pub iauc: f64,
}

/// Per-patient row of the results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientResult {
    pub time: f64,
    pub risk: f64,
    pub censorship: f64,
    pub clinical: (String, String, String),
    pub logits: Vec<f64>,
}

/// Collects model outputs batch by batch over one epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    pub risks: Vec<f64>,
    pub censorship: Vec<f64>,
    pub event_times: Vec<f64>,
    /// One row per sample, one column per bin.
    pub survival: Vec<Vec<f64>>,
    pub logits: Vec<Vec<f64>>,
    pub case_ids: Vec<String>,
    pub clinical: Vec<ClinicalRecord>,
}

impl EpochAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.risks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.risks.is_empty()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push_batch(
        &mut self,
        risks: &[f32],
        censorship: &[f32],
        event_times: &[f32],
        survival: &[f32],
        logits: &[f32],
        num_bins: usize,
        case_ids: &[String],
        clinical: &[ClinicalRecord],
    ) {
        self.risks.extend(risks.iter().map(|&v| v as f64));
        self.censorship.extend(censorship.iter().map(|&v| v as f64));
        self.event_times.extend(event_times.iter().map(|&v| v as f64));
        for row in survival.chunks(num_bins.max(1)) {
            self.survival.push(row.iter().map(|&v| v as f64).collect());
        }
        for row in logits.chunks(num_bins.max(1)) {
            self.logits.push(row.iter().map(|&v| v as f64).collect());
        }
        self.case_ids.extend_from_slice(case_ids);
        self.clinical.extend_from_slice(clinical);
    }

    pub fn labels(&self) -> SurvivalLabels {
        SurvivalLabels::new(
            self.censorship.iter().map(|&c| c < 0.5).collect(),
            self.event_times.clone(),
        )
    }

    /// Plain concordance over all finite risks.
    pub fn concordance(&self) -> f64 {
        let keep = finite_indices(&self.risks);
        let labels = self.subset_labels(&keep);
        let risk: Array1<f64> = keep.iter().map(|&i| self.risks[i]).collect();
        concordance_index_censored(&labels, risk.view())
            .map(|c| c.c_index)
            .or_warn("c-index", 0.0)
    }

    fn subset_labels(&self, keep: &[usize]) -> SurvivalLabels {
        SurvivalLabels::new(
            keep.iter().map(|&i| self.censorship[i] < 0.5).collect(),
            keep.iter().map(|&i| self.event_times[i]).collect(),
        )
    }

    /// Brier grid over every accumulated survival time, dropped risks included.
    pub fn evaluation_times(&self, bin_edges: &[f64]) -> Vec<f64> {
        brier_evaluation_times(&self.event_times, bin_edges)
    }

    /// Every metric on the finite-risk subset. `cohort` supplies the
    /// censoring distribution; `bin_edges` the interior Brier times.
    pub fn finalize(&self, cohort: &SurvivalLabels, bin_edges: &[f64]) -> SurvivalMetrics {
        let keep = finite_indices(&self.risks);
        if keep.len() < self.len() {
            log::warn!("dropping {} samples with non-finite risk", self.len() - keep.len());
        }
        let labels = self.subset_labels(&keep);
        let risk: Array1<f64> = keep.iter().map(|&i| self.risks[i]).collect();

        let bins = self.survival.first().map(Vec::len).unwrap_or(0);
        let mut survival = Array2::<f64>::zeros((keep.len(), bins));
        for (row, &i) in keep.iter().enumerate() {
            for (col, &v) in self.survival[i].iter().enumerate().take(bins) {
                survival[[row, col]] = v;
            }
        }

        let c_index = concordance_index_censored(&labels, risk.view())
            .map(|c| c.c_index)
            .or_warn("c-index", 0.0);
        let c_index_ipcw = concordance_index_ipcw(cohort, &labels, risk.view())
            .map(|c| c.c_index)
            .or_warn("ipcw c-index", 0.0);

        let times = self.evaluation_times(bin_edges);
        let brier_scores = brier_score(cohort, &labels, survival.view(), &times)
            .map(|(_, scores)| scores.to_vec())
            .or_warn("brier score", vec![0.0; times.len()]);
        let ibs = integrated_brier_score(cohort, &labels, survival.view(), &times).or_warn("integrated brier score", 0.0);

        let iauc = if bins > 1 {
            let risk_by_time = survival.slice(ndarray::s![.., 1..]).mapv(|s| 1.0 - s);
            cumulative_dynamic_auc(cohort, &labels, risk_by_time.view(), &times[1..])
                .map(|(_, mean)| mean)
                .or_warn("cumulative dynamic auc", 0.0)
        } else {
            log::warn!("cumulative dynamic auc needs at least two bins, reporting zero");
            0.0
        };

        SurvivalMetrics {
            c_index,
            c_index_ipcw,
            brier_scores,
            ibs,
            iauc,
        }
    }

    /// Per-patient table keyed by case id, in accumulation order.
    pub fn patient_results(&self) -> Vec<(String, PatientResult)> {
        (0..self.len())
            .map(|i| {
                (
                    self.case_ids[i].clone(),
                    PatientResult {
                        time: self.event_times[i],
                        risk: self.risks[i],
                        censorship: self.censorship[i],
                        clinical: self.clinical[i].as_tuple(),
                        logits: self.logits[i].clone(),
                    },
                )
            })
            .collect()
    }
}
