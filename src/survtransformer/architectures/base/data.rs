//! Patient records, label discretisation, omics scaling, patch sampling and
//! batch collation for the survival model.
//!
//! Everything here works on host memory (`Vec<f32>`) until [`collate`]
//! builds backend tensors for one batch.

use burn::prelude::*;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution as _;
use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, SurvivalError};

/// Offset applied to the outermost bin edges so that the extreme event
/// times fall strictly inside the first and last bins.
pub const BIN_EDGE_EPS: f64 = 1e-6;

/// A named gene signature restricted to the measured expression columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathwayGroup {
    pub name: String,
    /// De-duplicated and sorted
    pub genes: Vec<String>,
}

impl PathwayGroup {
    /// Keeps the signature genes that appear in `columns`.
    pub fn from_signature(name: &str, signature: &[String], columns: &[String]) -> Self {
        let available: BTreeSet<&str> = columns.iter().map(String::as_str).collect();
        let genes: BTreeSet<&str> = signature
            .iter()
            .map(String::as_str)
            .filter(|g| available.contains(g))
            .collect();
        Self {
            name: name.to_string(),
            genes: genes.into_iter().map(str::to_string).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.genes.len()
    }

    /// Picks this group's genes out of one expression row laid out by `columns`.
    pub fn select(&self, row: &[f32], columns: &[String]) -> Result<Vec<f32>> {
        if row.len() != columns.len() {
            return Err(SurvivalError::Data(format!(
                "expression row has {} values for {} columns",
                row.len(),
                columns.len()
            )));
        }
        let index: BTreeMap<&str, usize> = columns.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();
        self.genes
            .iter()
            .map(|g| {
                index
                    .get(g.as_str())
                    .map(|&i| row[i])
                    .ok_or_else(|| SurvivalError::Data(format!("gene {} missing from expression columns", g)))
            })
            .collect()
    }
}

/// Optional clinical covariates carried through to the result table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClinicalRecord {
    pub age: Option<f32>,
    pub site: Option<String>,
    pub is_female: Option<bool>,
}

impl ClinicalRecord {
    /// `(age, site, is_female)` with `"N/A"` for missing values.
    pub fn as_tuple(&self) -> (String, String, String) {
        let na = || "N/A".to_string();
        (
            self.age.map(|a| a.to_string()).unwrap_or_else(na),
            self.site.clone().unwrap_or_else(na),
            self.is_female.map(|f| f.to_string()).unwrap_or_else(na),
        )
    }
}

/// One patient: all slides' patch embeddings plus per-pathway omics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientSample {
    pub case_id: String,
    pub slide_ids: Vec<String>,
    /// Row-major `[num_patches, embedding_dim]`
    pub patch_features: Vec<f32>,
    pub embedding_dim: usize,
    /// One vector per pathway group, in model order
    pub omics: Vec<Vec<f32>>,
    /// Raw follow-up time
    pub event_time: f32,
    /// 1.0 when the event was not observed
    pub censorship: f32,
    /// Discretised survival bin, filled by [`discretize_survival_times`]
    pub disc_label: usize,
    pub clinical: ClinicalRecord,
}

impl PatientSample {
    pub fn num_patches(&self) -> usize {
        if self.embedding_dim == 0 {
            0
        } else {
            self.patch_features.len() / self.embedding_dim
        }
    }

    /// Stratification class: the (bin, censorship) pair.
    pub fn label_key(&self) -> (usize, bool) {
        (self.disc_label, self.censorship > 0.5)
    }

    /// Every patch, no mask.
    pub fn full_bag(&self) -> PatchBag {
        PatchBag {
            features: self.patch_features.clone(),
            num_patches: self.num_patches(),
            validity: None,
        }
    }

    /// At most `capacity` distinct patches drawn uniformly (kept in slide
    /// order), zero-padded to exactly `capacity` rows.
    pub fn sampled_bag(&self, capacity: usize, rng: &mut StdRng) -> PatchBag {
        let available = self.num_patches();
        let n_samples = available.min(capacity);

        let mut rows = index::sample(rng, available, n_samples).into_vec();
        rows.sort_unstable();

        let dim = self.embedding_dim;
        let mut features = Vec::with_capacity(capacity * dim);
        for row in rows {
            features.extend_from_slice(&self.patch_features[row * dim..(row + 1) * dim]);
        }
        features.resize(capacity * dim, 0.0);

        let mut validity = vec![1.0f32; n_samples];
        validity.resize(capacity, 0.0);

        PatchBag {
            features,
            num_patches: capacity,
            validity: Some(validity),
        }
    }
}

/// Patch rows ready for collation.
#[derive(Debug, Clone)]
pub struct PatchBag {
    pub features: Vec<f32>,
    pub num_patches: usize,
    /// 1.0 for real rows, 0.0 for padding; `None` means every row is real
    pub validity: Option<Vec<f32>>,
}

/// Quantile bin edges over the uncensored times, widened to cover the
/// whole cohort, and the resulting left-closed bin of every patient.
///
/// Returns the `n_bins + 1` edges.
pub fn discretize_survival_times(samples: &mut [PatientSample], n_bins: usize) -> Result<Vec<f64>> {
    if n_bins == 0 {
        return Err(SurvivalError::InvalidConfig("n_bins must be positive".to_string()));
    }
    let mut uncensored: Vec<f64> = samples
        .iter()
        .filter(|s| s.censorship < 0.5)
        .map(|s| s.event_time as f64)
        .collect();
    if uncensored.is_empty() {
        return Err(SurvivalError::Data(
            "cannot discretize survival times without uncensored patients".to_string(),
        ));
    }
    uncensored.sort_by(|a, b| a.total_cmp(b));

    let mut edges: Vec<f64> = (0..=n_bins)
        .map(|i| quantile_sorted(&uncensored, i as f64 / n_bins as f64))
        .collect();

    let (min_all, max_all) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
        let t = s.event_time as f64;
        (lo.min(t), hi.max(t))
    });
    edges[0] = min_all - BIN_EDGE_EPS;
    edges[n_bins] = max_all + BIN_EDGE_EPS;

    if edges.windows(2).any(|w| w[1] <= w[0]) {
        return Err(SurvivalError::Data(format!(
            "bin edges must be unique, got {:?}",
            edges
        )));
    }

    for sample in samples.iter_mut() {
        sample.disc_label = assign_bin(&edges, sample.event_time as f64);
    }
    log::debug!("survival bin edges: {:?}", edges);
    Ok(edges)
}

/// Linear-interpolated quantile of sorted values.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Bin `i` with `edges[i] <= t < edges[i + 1]`, clamped to the outer bins.
pub fn assign_bin(edges: &[f64], t: f64) -> usize {
    let n_bins = edges.len() - 1;
    edges[1..n_bins]
        .iter()
        .take_while(|&&edge| edge <= t)
        .count()
}

/// Min–max scaler to `[-1, 1]` over all omics values of a split.
///
/// Fitted on the flattened training values; exact zeros are left untouched
/// by [`transform`](Self::transform).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OmicsScaler {
    pub min: f32,
    pub max: f32,
}

impl OmicsScaler {
    pub fn fit(samples: &[PatientSample]) -> Result<Self> {
        let mut values = samples.iter().flat_map(|s| s.omics.iter().flatten().copied());
        let first = values
            .next()
            .ok_or_else(|| SurvivalError::Data("no omics values to fit the scaler".to_string()))?;
        let (min, max) = values.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Ok(Self { min, max })
    }

    pub fn transform_value(&self, v: f32) -> f32 {
        if v == 0.0 {
            return 0.0;
        }
        let range = self.max - self.min;
        if range == 0.0 {
            // sklearn maps a constant feature to the lower bound
            return -1.0;
        }
        (v - self.min) / range * 2.0 - 1.0
    }

    pub fn transform(&self, samples: &mut [PatientSample]) {
        for sample in samples.iter_mut() {
            for field in sample.omics.iter_mut() {
                for v in field.iter_mut() {
                    *v = self.transform_value(*v);
                }
            }
        }
    }
}

/// Order in which a split is visited during one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    Sequential,
    Shuffled,
    /// Draw with replacement, weight `N / |class|` per (bin, censorship) class
    ClassBalanced,
}

/// Patients of one fold split plus the cohort's bin edges.
#[derive(Debug, Clone)]
pub struct SurvivalSplit {
    pub samples: Vec<PatientSample>,
    pub bin_edges: Vec<f64>,
}

impl SurvivalSplit {
    pub fn new(samples: Vec<PatientSample>, bin_edges: Vec<f64>) -> Self {
        Self { samples, bin_edges }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_pathways(&self) -> usize {
        self.samples.first().map(|s| s.omics.len()).unwrap_or(0)
    }

    /// Width of each pathway field, taken from the first patient.
    pub fn omic_sizes(&self) -> Vec<usize> {
        self.samples
            .first()
            .map(|s| s.omics.iter().map(Vec::len).collect())
            .unwrap_or_default()
    }

    pub fn event_times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.event_time as f64).collect()
    }

    /// `true` when the event was observed.
    pub fn events(&self) -> Vec<bool> {
        self.samples.iter().map(|s| s.censorship < 0.5).collect()
    }

    pub fn class_weights(&self) -> Vec<f64> {
        let mut counts: BTreeMap<(usize, bool), usize> = BTreeMap::new();
        for sample in &self.samples {
            *counts.entry(sample.label_key()).or_default() += 1;
        }
        let n = self.samples.len() as f64;
        self.samples
            .iter()
            .map(|s| n / counts[&s.label_key()] as f64)
            .collect()
    }

    pub fn epoch_order(&self, strategy: SamplingStrategy, rng: &mut StdRng) -> Result<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        match strategy {
            SamplingStrategy::Sequential => {}
            SamplingStrategy::Shuffled => order.shuffle(rng),
            SamplingStrategy::ClassBalanced => {
                let sampler = WeightedIndex::new(self.class_weights())
                    .map_err(|e| SurvivalError::Data(format!("class weights: {}", e)))?;
                order = (0..self.samples.len()).map(|_| sampler.sample(rng)).collect();
            }
        }
        Ok(order)
    }
}

/// Per-pathway omics tensors for a batch.
///
/// Stacking rule: field `p` holds pathway `p` of every sample stacked along
/// a new leading batch dimension, `[batch, size_p]`. Fields are never
/// concatenated with each other since their widths differ.
#[derive(Debug, Clone)]
pub struct OmicsBag<B: Backend> {
    pub fields: Vec<Tensor<B, 2>>,
}

impl<B: Backend> OmicsBag<B> {
    pub fn num_pathways(&self) -> usize {
        self.fields.len()
    }

    pub fn batch_size(&self) -> usize {
        self.fields.first().map(|f| f.dims()[0]).unwrap_or(0)
    }
}

/// One collated batch.
#[derive(Debug, Clone)]
pub struct SurvivalBatch<B: Backend> {
    /// [batch, patches, embedding_dim]
    pub wsi: Tensor<B, 3>,
    pub omics: OmicsBag<B>,
    /// [batch, pathways + patches]; `None` when every token is real
    pub mask: Option<Tensor<B, 2>>,
    /// [batch] discretised bins
    pub labels: Tensor<B, 1, Int>,
    /// [batch]
    pub event_times: Tensor<B, 1>,
    /// [batch]
    pub censorship: Tensor<B, 1>,
    pub case_ids: Vec<String>,
    pub clinical: Vec<ClinicalRecord>,
    pub host_event_times: Vec<f32>,
    pub host_censorship: Vec<f32>,
}

impl<B: Backend> SurvivalBatch<B> {
    pub fn batch_size(&self) -> usize {
        self.case_ids.len()
    }
}

/// Stacks patients and their patch bags into backend tensors.
///
/// Bags of different length are zero-padded to the longest one; the mask is
/// produced whenever padding exists or any bag carries its own validity.
pub fn collate<B: Backend>(
    samples: &[&PatientSample],
    bags: Vec<PatchBag>,
    device: &B::Device,
) -> Result<SurvivalBatch<B>> {
    if samples.is_empty() || samples.len() != bags.len() {
        return Err(SurvivalError::Shape {
            context: "collate",
            detail: format!("{} samples for {} patch bags", samples.len(), bags.len()),
        });
    }
    let batch = samples.len();
    let embedding_dim = samples[0].embedding_dim;
    let num_pathways = samples[0].omics.len();
    let omic_sizes: Vec<usize> = samples[0].omics.iter().map(Vec::len).collect();

    for sample in samples {
        if sample.embedding_dim != embedding_dim {
            return Err(SurvivalError::Shape {
                context: "collate",
                detail: format!(
                    "case {} has embedding dim {}, expected {}",
                    sample.case_id, sample.embedding_dim, embedding_dim
                ),
            });
        }
        let sizes: Vec<usize> = sample.omics.iter().map(Vec::len).collect();
        if sizes != omic_sizes {
            return Err(SurvivalError::Shape {
                context: "collate",
                detail: format!(
                    "case {} has pathway sizes {:?}, expected {:?}",
                    sample.case_id, sizes, omic_sizes
                ),
            });
        }
    }

    let max_patches = bags.iter().map(|b| b.num_patches).max().unwrap_or(0);
    let needs_mask = bags
        .iter()
        .any(|b| b.validity.is_some() || b.num_patches != max_patches);

    let mut wsi = Vec::with_capacity(batch * max_patches * embedding_dim);
    let mut mask = Vec::with_capacity(batch * (num_pathways + max_patches));
    for bag in &bags {
        wsi.extend_from_slice(&bag.features);
        wsi.resize(wsi.len() + (max_patches - bag.num_patches) * embedding_dim, 0.0);

        if needs_mask {
            mask.extend(std::iter::repeat(1.0f32).take(num_pathways));
            match &bag.validity {
                Some(validity) => mask.extend_from_slice(validity),
                None => mask.extend(std::iter::repeat(1.0f32).take(bag.num_patches)),
            }
            mask.extend(std::iter::repeat(0.0f32).take(max_patches - bag.num_patches));
        }
    }

    let wsi = Tensor::<B, 1>::from_floats(wsi.as_slice(), device)
        .reshape([batch, max_patches, embedding_dim]);
    let mask = needs_mask.then(|| {
        Tensor::<B, 1>::from_floats(mask.as_slice(), device)
            .reshape([batch, num_pathways + max_patches])
    });

    let fields = (0..num_pathways)
        .map(|p| {
            let values: Vec<f32> = samples
                .iter()
                .flat_map(|s| s.omics[p].iter().copied())
                .collect();
            Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([batch, omic_sizes[p]])
        })
        .collect();

    let labels: Vec<i64> = samples.iter().map(|s| s.disc_label as i64).collect();
    let host_event_times: Vec<f32> = samples.iter().map(|s| s.event_time).collect();
    let host_censorship: Vec<f32> = samples.iter().map(|s| s.censorship).collect();

    Ok(SurvivalBatch {
        wsi,
        omics: OmicsBag { fields },
        mask,
        labels: Tensor::<B, 1, Int>::from_ints(labels.as_slice(), device),
        event_times: Tensor::<B, 1>::from_floats(host_event_times.as_slice(), device),
        censorship: Tensor::<B, 1>::from_floats(host_censorship.as_slice(), device),
        case_ids: samples.iter().map(|s| s.case_id.clone()).collect(),
        clinical: samples.iter().map(|s| s.clinical.clone()).collect(),
        host_event_times,
        host_censorship,
    })
}

/// Deterministic k-fold assignment: `(train, val)` index lists per fold.
pub fn k_fold_splits(n: usize, k: usize, seed: u64) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
    if k < 2 || k > n {
        return Err(SurvivalError::InvalidConfig(format!(
            "cannot build {} folds over {} patients",
            k, n
        )));
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));

    Ok((0..k)
        .map(|fold| {
            let (mut train, mut val) = (Vec::new(), Vec::new());
            for (pos, &idx) in order.iter().enumerate() {
                if pos % k == fold {
                    val.push(idx);
                } else {
                    train.push(idx);
                }
            }
            train.sort_unstable();
            val.sort_unstable();
            (train, val)
        })
        .collect())
}

/// Shape of a generated cohort.
#[derive(Debug, Clone)]
pub struct SyntheticCohortConfig {
    pub num_patients: usize,
    pub omic_sizes: Vec<usize>,
    pub embedding_dim: usize,
    pub min_patches: usize,
    pub max_patches: usize,
    pub censoring_rate: f64,
}

impl Default for SyntheticCohortConfig {
    fn default() -> Self {
        Self {
            num_patients: 40,
            omic_sizes: vec![10, 15, 20],
            embedding_dim: 1024,
            min_patches: 20,
            max_patches: 80,
            censoring_rate: 0.3,
        }
    }
}

/// Patients whose omics and patches carry a shared latent risk, so that a
/// model can learn something. Bins are left at zero; run
/// [`discretize_survival_times`] afterwards.
pub fn synthetic_cohort(config: &SyntheticCohortConfig, seed: u64) -> Result<Vec<PatientSample>> {
    if config.min_patches > config.max_patches {
        return Err(SurvivalError::InvalidConfig(format!(
            "min_patches {} exceeds max_patches {}",
            config.min_patches, config.max_patches
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0f32, 1.0)
        .map_err(|e| SurvivalError::InvalidConfig(format!("normal distribution: {}", e)))?;
    let sites = ["site_a", "site_b", "site_c"];

    let samples = (0..config.num_patients)
        .map(|i| {
            let risk: f32 = normal.sample(&mut rng);

            let omics = config
                .omic_sizes
                .iter()
                .map(|&size| {
                    (0..size)
                        .map(|j| {
                            let signal = if j % 3 == 0 { risk } else { 0.0 };
                            signal + 0.5 * normal.sample(&mut rng)
                        })
                        .collect()
                })
                .collect();

            let n_patches = rng.random_range(config.min_patches..=config.max_patches);
            let patch_features = (0..n_patches * config.embedding_dim)
                .map(|j| {
                    let signal = if j % config.embedding_dim < 8 { 0.5 * risk } else { 0.0 };
                    signal + normal.sample(&mut rng)
                })
                .collect();

            let base: f32 = rng.random_range(0.05f32..1.0);
            let event_time = 60.0 * (-risk).exp() * (-base.ln());
            let censored = rng.random_bool(config.censoring_rate);
            let observed_time = if censored {
                event_time * rng.random_range(0.2f32..1.0)
            } else {
                event_time
            };

            PatientSample {
                case_id: format!("TCGA-{:02}-{:04}", i % 100, i),
                slide_ids: vec![format!("TCGA-{:02}-{:04}-01Z-00-DX1", i % 100, i)],
                patch_features,
                embedding_dim: config.embedding_dim,
                omics,
                event_time: observed_time.max(0.01),
                censorship: if censored { 1.0 } else { 0.0 },
                disc_label: 0,
                clinical: ClinicalRecord {
                    age: Some(rng.random_range(35.0f32..85.0).round()),
                    site: Some(sites[i % sites.len()].to_string()),
                    is_female: Some(rng.random_bool(0.5)),
                },
            }
        })
        .collect();
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn patient(case_id: &str, time: f32, censorship: f32) -> PatientSample {
        PatientSample {
            case_id: case_id.to_string(),
            slide_ids: vec![format!("{}-slide", case_id)],
            patch_features: (0..12).map(|v| v as f32).collect(),
            embedding_dim: 4,
            omics: vec![vec![1.0, 2.0], vec![3.0, 0.0, 5.0]],
            event_time: time,
            censorship,
            disc_label: 0,
            clinical: ClinicalRecord::default(),
        }
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_pathway_group_intersects_and_sorts() {
        let columns = names(&["TP53", "EGFR", "MYC", "KRAS"]);
        let group = PathwayGroup::from_signature("signalling", &names(&["MYC", "EGFR", "BRCA1", "MYC"]), &columns);
        assert_eq!(group.genes, names(&["EGFR", "MYC"]));
        assert_eq!(group.size(), 2);

        let row = [0.1f32, 0.2, 0.3, 0.4];
        assert_eq!(group.select(&row, &columns).unwrap(), vec![0.2, 0.3]);
        assert!(group.select(&row[..3], &columns).is_err());
    }

    #[test]
    fn test_discretize_left_closed_bins() {
        let mut samples: Vec<PatientSample> = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]
            .iter()
            .enumerate()
            .map(|(i, &t)| patient(&format!("p{}", i), t, 0.0))
            .collect();
        samples.push(patient("late", 12.0, 1.0));

        let edges = discretize_survival_times(&mut samples, 4).unwrap();
        assert_eq!(edges.len(), 5);
        assert!((edges[0] - (1.0 - BIN_EDGE_EPS)).abs() < 1e-12);
        assert!((edges[1] - 3.0).abs() < 1e-9);
        assert!((edges[2] - 5.0).abs() < 1e-9);
        assert!((edges[3] - 7.0).abs() < 1e-9);
        assert!((edges[4] - (12.0 + BIN_EDGE_EPS)).abs() < 1e-9);

        let bins: Vec<usize> = samples.iter().map(|s| s.disc_label).collect();
        // t == edge belongs to the bin on its right
        assert_eq!(bins, vec![0, 0, 1, 1, 2, 2, 3, 3, 3, 3]);
    }

    #[test]
    fn test_discretize_rejects_duplicate_edges() {
        let mut samples: Vec<PatientSample> =
            (0..6).map(|i| patient(&format!("p{}", i), 5.0, 0.0)).collect();
        assert!(discretize_survival_times(&mut samples, 4).is_err());
    }

    #[test]
    fn test_scaler_preserves_zeros() {
        let samples = vec![patient("a", 1.0, 0.0)];
        let scaler = OmicsScaler::fit(&samples).unwrap();
        assert_eq!(scaler.min, 0.0);
        assert_eq!(scaler.max, 5.0);

        let mut transformed = samples.clone();
        scaler.transform(&mut transformed);
        let flat: Vec<f32> = transformed[0].omics.iter().flatten().copied().collect();
        let expected = [-0.6f32, -0.2, 0.2, 0.0, 1.0];
        for (got, want) in flat.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "{} vs {}", got, want);
        }
        assert_eq!(transformed[0].omics[1][1], 0.0);
    }

    #[test]
    fn test_sampled_bag_pads_and_masks() {
        let sample = patient("a", 1.0, 0.0);
        let mut rng = StdRng::seed_from_u64(0);

        let bag = sample.sampled_bag(5, &mut rng);
        assert_eq!(bag.num_patches, 5);
        assert_eq!(bag.features.len(), 20);
        assert_eq!(bag.validity, Some(vec![1.0, 1.0, 1.0, 0.0, 0.0]));
        // all three rows kept in order
        assert_eq!(&bag.features[..12], sample.patch_features.as_slice());

        let bag = sample.sampled_bag(2, &mut rng);
        assert_eq!(bag.validity, Some(vec![1.0, 1.0]));
        let first_cols: Vec<f32> = bag.features.chunks(4).map(|row| row[0]).collect();
        assert!(first_cols[0] < first_cols[1]);
    }

    #[test]
    fn test_collate_stacks_fields_and_builds_mask() {
        let device = Default::default();
        let a = patient("a", 1.0, 0.0);
        let mut b = patient("b", 2.0, 1.0);
        b.patch_features.truncate(8);

        let batch = collate::<TestBackend>(&[&a, &b], vec![a.full_bag(), b.full_bag()], &device).unwrap();

        assert_eq!(batch.wsi.dims(), [2, 3, 4]);
        assert_eq!(batch.omics.num_pathways(), 2);
        assert_eq!(batch.omics.fields[0].dims(), [2, 2]);
        assert_eq!(batch.omics.fields[1].dims(), [2, 3]);

        let mask: Vec<f32> = batch.mask.unwrap().into_data().to_vec().unwrap();
        assert_eq!(mask, vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0]);
        assert_eq!(batch.host_censorship, vec![0.0, 1.0]);
    }

    #[test]
    fn test_collate_without_padding_has_no_mask() {
        let device = Default::default();
        let a = patient("a", 1.0, 0.0);
        let batch = collate::<TestBackend>(&[&a], vec![a.full_bag()], &device).unwrap();
        assert!(batch.mask.is_none());
    }

    #[test]
    fn test_collate_rejects_mismatched_pathways() {
        let device = Default::default();
        let a = patient("a", 1.0, 0.0);
        let mut b = patient("b", 2.0, 0.0);
        b.omics.pop();
        let result = collate::<TestBackend>(&[&a, &b], vec![a.full_bag(), b.full_bag()], &device);
        assert!(matches!(result, Err(SurvivalError::Shape { .. })));
    }

    #[test]
    fn test_class_balanced_weights() {
        let mut samples = vec![
            patient("a", 1.0, 0.0),
            patient("b", 2.0, 0.0),
            patient("c", 3.0, 1.0),
        ];
        samples[2].disc_label = 1;
        let split = SurvivalSplit::new(samples, vec![0.0, 2.5, 4.0]);
        assert_eq!(split.class_weights(), vec![1.5, 1.5, 3.0]);

        let mut rng = StdRng::seed_from_u64(1);
        let order = split.epoch_order(SamplingStrategy::ClassBalanced, &mut rng).unwrap();
        assert_eq!(order.len(), 3);
        assert!(order.iter().all(|&i| i < 3));
    }

    #[test]
    fn test_k_fold_partitions_every_patient_once() {
        let folds = k_fold_splits(11, 3, 5).unwrap();
        assert_eq!(folds.len(), 3);
        let mut seen: Vec<usize> = folds.iter().flat_map(|(_, val)| val.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..11).collect::<Vec<_>>());
        for (train, val) in &folds {
            assert_eq!(train.len() + val.len(), 11);
        }
        assert!(k_fold_splits(3, 5, 0).is_err());
    }

    #[test]
    fn test_synthetic_cohort_shapes() {
        let config = SyntheticCohortConfig {
            num_patients: 6,
            embedding_dim: 16,
            ..Default::default()
        };
        let cohort = synthetic_cohort(&config, 9).unwrap();
        assert_eq!(cohort.len(), 6);
        for sample in &cohort {
            assert_eq!(sample.omics.iter().map(Vec::len).collect::<Vec<_>>(), vec![10, 15, 20]);
            assert!(sample.num_patches() >= 20 && sample.num_patches() <= 80);
            assert!(sample.event_time > 0.0);
        }
    }
}
