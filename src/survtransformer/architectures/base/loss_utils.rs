//! Survival objectives and the hazard → survival → risk conversions.
//!
//! Hazard logits are `[batch, bins]`. `sigmoid` gives per-bin hazards, the
//! running product of `1 - hazard` gives the discrete survival function and
//! the negative sum of that function is the risk score.

use burn::prelude::*;
use burn::tensor::{activation, ElementConversion};
use std::str::FromStr;

use crate::error::{Result, SurvivalError};

/// Lower clamp applied before every logarithm of the survival NLL.
pub const SURVIVAL_EPS: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    Sum,
    Mean,
}

impl FromStr for Reduction {
    type Err = SurvivalError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sum" => Ok(Reduction::Sum),
            "mean" => Ok(Reduction::Mean),
            other => Err(SurvivalError::InvalidReduction(other.to_string())),
        }
    }
}

/// Cumulative product of `1 - hazard` along the bin axis.
///
/// input shape: [batch, bins] (hazards in (0, 1))
/// output shape: [batch, bins], non-increasing along bins
pub fn hazards_to_survival<B: Backend>(hazards: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, bins] = hazards.dims();
    let complement = hazards.neg().add_scalar(1.0);

    let mut running = complement.clone().slice([0..batch, 0..1]);
    let mut columns = Vec::with_capacity(bins);
    columns.push(running.clone());
    for bin in 1..bins {
        running = running * complement.clone().slice([0..batch, bin..bin + 1]);
        columns.push(running.clone());
    }
    Tensor::cat(columns, 1)
}

/// Survival function and risk from raw logits.
///
/// Returns `(risk [batch], survival [batch, bins])` with
/// `risk = -Σ_bins survival`.
pub fn risk_from_logits<B: Backend>(logits: Tensor<B, 2>) -> (Tensor<B, 1>, Tensor<B, 2>) {
    let [batch, _] = logits.dims();
    let survival = hazards_to_survival(activation::sigmoid(logits));
    let risk = survival.clone().sum_dim(1).neg().reshape([batch]);
    (risk, survival)
}

/// Checks the per-sample targets line up with a [batch, bins] logit matrix.
pub fn validate_survival_targets<B: Backend>(
    logits: &Tensor<B, 2>,
    labels: &Tensor<B, 1, Int>,
    censorship: &Tensor<B, 1>,
) -> Result<()> {
    let [batch, bins] = logits.dims();
    if bins == 0 {
        return Err(SurvivalError::Shape {
            context: "survival loss",
            detail: "logits have no bins".to_string(),
        });
    }
    if labels.dims()[0] != batch || censorship.dims()[0] != batch {
        return Err(SurvivalError::Shape {
            context: "survival loss",
            detail: format!(
                "logits batch {} but {} labels and {} censoring flags",
                batch,
                labels.dims()[0],
                censorship.dims()[0]
            ),
        });
    }
    if batch > 0 {
        let lowest = labels.clone().min().into_scalar().elem::<i64>();
        let highest = labels.clone().max().into_scalar().elem::<i64>();
        if lowest < 0 || highest >= bins as i64 {
            return Err(SurvivalError::Shape {
                context: "survival loss",
                detail: format!("labels span [{}, {}] but there are {} bins", lowest, highest, bins),
            });
        }
    }
    Ok(())
}

/// Discrete-time negative log-likelihood with censoring.
///
/// For a sample in bin `k` with censoring flag `c`:
///
/// ```text
/// uncensored = -(1 - c) * (log S(k-1) + log h(k))      S(-1) = 1
/// censored   = -c * log S(k)
/// loss       = (1 - alpha) * (uncensored + censored) + alpha * uncensored
/// ```
///
/// All `S` and `h` values are clamped below at `eps` before the log.
#[derive(Debug, Clone, Copy)]
pub struct NllSurvLoss {
    pub alpha: f64,
    pub eps: f64,
    pub reduction: Reduction,
}

impl Default for NllSurvLoss {
    fn default() -> Self {
        Self {
            alpha: 0.0,
            eps: SURVIVAL_EPS,
            reduction: Reduction::Sum,
        }
    }
}

impl NllSurvLoss {
    /// Fails with [`SurvivalError::InvalidReduction`] for anything but
    /// `"sum"` or `"mean"`.
    pub fn new(alpha: f64, eps: f64, reduction: &str) -> Result<Self> {
        Ok(Self {
            alpha,
            eps,
            reduction: reduction.parse()?,
        })
    }

    /// logits: [batch, bins], labels: [batch], censorship: [batch] → [1]
    pub fn forward<B: Backend>(
        &self,
        logits: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
        censorship: Tensor<B, 1>,
    ) -> Result<Tensor<B, 1>> {
        validate_survival_targets(&logits, &labels, &censorship)?;
        let [batch, _] = logits.dims();
        let device = logits.device();

        let hazards = activation::sigmoid(logits);
        let survival = hazards_to_survival(hazards.clone());
        let survival_padded = Tensor::cat(vec![Tensor::ones([batch, 1], &device), survival], 1);

        let y = labels.reshape([batch, 1]);
        let c = censorship.reshape([batch, 1]);

        let s_prev = survival_padded.clone().gather(1, y.clone()).clamp_min(self.eps);
        let h_this = hazards.gather(1, y.clone()).clamp_min(self.eps);
        let s_this = survival_padded.gather(1, y.add_scalar(1)).clamp_min(self.eps);

        let observed = c.clone().neg().add_scalar(1.0);
        let uncensored_loss = (observed * (s_prev.log() + h_this.log())).neg();
        let censored_loss = (c * s_this.log()).neg();
        let neg_l = censored_loss + uncensored_loss.clone();

        let loss = neg_l.mul_scalar(1.0 - self.alpha) + uncensored_loss.mul_scalar(self.alpha);
        Ok(match self.reduction {
            Reduction::Sum => loss.sum(),
            Reduction::Mean => loss.mean(),
        })
    }
}

/// Contrastive alignment of mean-pooled pathway and image representations,
/// conditioned on whether each modality's own top-1 bin is correct.
///
/// Samples where at least one modality is right are selected. A modality
/// that is right while the other is wrong serves as the anchor and is
/// detached, so only the wrong modality moves toward it. When no sample is
/// selected, selection and gradient flags are all inverted.
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyLoss {
    pub temperature: f64,
}

impl Default for ConsistencyLoss {
    fn default() -> Self {
        Self { temperature: 0.08 }
    }
}

impl ConsistencyLoss {
    pub fn new(temperature: f64) -> Self {
        Self { temperature }
    }

    /// pathway_tokens: [batch, pathways, dim], image_tokens: [batch, patches, dim],
    /// per-modality logits: [batch, bins], labels: [batch] → [1]
    ///
    /// The batch must not be empty.
    pub fn forward<B: Backend>(
        &self,
        pathway_tokens: Tensor<B, 3>,
        image_tokens: Tensor<B, 3>,
        pathway_logits: Tensor<B, 2>,
        image_logits: Tensor<B, 2>,
        labels: Tensor<B, 1, Int>,
    ) -> Result<Tensor<B, 1>> {
        let [batch, _, dim] = pathway_tokens.dims();
        if image_tokens.dims()[0] != batch || image_tokens.dims()[2] != dim {
            return Err(SurvivalError::Shape {
                context: "consistency loss",
                detail: format!(
                    "pathway bag {:?} vs image bag {:?}",
                    pathway_tokens.dims(),
                    image_tokens.dims()
                ),
            });
        }
        let device = pathway_tokens.device();

        let labels = int_to_host(labels)?;
        let top_a = int_to_host(pathway_logits.argmax(1).reshape([batch]))?;
        let top_b = int_to_host(image_logits.argmax(1).reshape([batch]))?;

        let a_ok: Vec<bool> = top_a.iter().zip(&labels).map(|(p, y)| p == y).collect();
        let b_ok: Vec<bool> = top_b.iter().zip(&labels).map(|(p, y)| p == y).collect();

        let mut selected: Vec<bool> = a_ok.iter().zip(&b_ok).map(|(&a, &b)| a || b).collect();
        let mut keep_a: Vec<bool> = a_ok.iter().zip(&b_ok).map(|(&a, &b)| !a || (a && b)).collect();
        let mut keep_b: Vec<bool> = b_ok.iter().zip(&a_ok).map(|(&b, &a)| !b || (a && b)).collect();
        if !selected.iter().any(|&s| s) {
            for flags in [&mut selected, &mut keep_a, &mut keep_b] {
                flags.iter_mut().for_each(|f| *f = !*f);
            }
        }
        let selected_count = selected.iter().filter(|&&s| s).count() as f64;

        let a = partially_detached(normalize_rows(mean_tokens(pathway_tokens)), &keep_a, &device);
        let b = partially_detached(normalize_rows(mean_tokens(image_tokens)), &keep_b, &device);

        let logits = a.matmul(b.transpose()).div_scalar(self.temperature);
        let logits_max = logits.clone().max_dim(1).detach();
        let exp_logits = (logits - logits_max).exp();

        let eye: Vec<f32> = (0..batch * batch)
            .map(|i| if i / batch == i % batch { 1.0 } else { 0.0 })
            .collect();
        let eye = Tensor::<B, 1>::from_floats(eye.as_slice(), &device).reshape([batch, batch]);

        let positive = (exp_logits.clone() * eye).sum_dim(1);
        let total = exp_logits.sum_dim(1);
        let probability = positive / total;

        let mask = flags_to_tensor(&selected, &device).reshape([batch, 1]);
        let mean_positive = (probability * mask).sum().div_scalar(selected_count);
        Ok(mean_positive.log().neg())
    }
}

fn int_to_host<B: Backend>(tensor: Tensor<B, 1, Int>) -> Result<Vec<i64>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| SurvivalError::Data(format!("reading integer tensor: {:?}", e)))
}

fn flags_to_tensor<B: Backend>(flags: &[bool], device: &B::Device) -> Tensor<B, 1> {
    let values: Vec<f32> = flags.iter().map(|&f| if f { 1.0 } else { 0.0 }).collect();
    Tensor::<B, 1>::from_floats(values.as_slice(), device)
}

/// [batch, tokens, dim] → [batch, dim]
fn mean_tokens<B: Backend>(tokens: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, count, dim] = tokens.dims();
    if count == 0 {
        return Tensor::zeros([batch, dim], &tokens.device());
    }
    tokens.mean_dim(1).reshape([batch, dim])
}

fn normalize_rows<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
    x / norm
}

/// Rows with `keep[i] == false` are cut from the autodiff graph.
fn partially_detached<B: Backend>(x: Tensor<B, 2>, keep: &[bool], device: &B::Device) -> Tensor<B, 2> {
    let keep = flags_to_tensor::<B>(keep, device).reshape([keep.len(), 1]);
    let cut = keep.clone().neg().add_scalar(1.0);
    x.clone() * keep + x.detach() * cut
}
