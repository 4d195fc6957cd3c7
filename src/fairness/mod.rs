//! Fairness
//!
//! Differentiable group-fairness regularizers added to the local training
//! loss, and the stratified metrics reported at evaluation time.
//!
//! ## Regularizers
//!
//! Both regularizers work on predicted probabilities `p = σ(logits)` and
//! penalize the squared violation of a pair of one-sided constraints per
//! group, `relu(gap)² + relu(-gap)²`, scaled by `alpha`:
//!
//! - [`DemographicParityLoss`]: `gap_a = E[p | S=a] - E[p]`
//! - [`EqualizedOddsLoss`]: `gap_{a,y} = E[p | S=a, Y=y] - E[p | Y=y]`
//!
//! A group with no members in the batch contributes no constraint.

pub mod metrics;

pub use metrics::{ConfusionCounts, FairnessReport, StratifiedConfusion};

use crate::config::{FairnessMode, RunConfig};
use crate::primitives::{sigmoid, to_host};
use crate::{FairHnError, Result};
use candle_core::{DType, Tensor};

/// Sensitive attribute values
const GROUPS: [f32; 2] = [0.0, 1.0];
/// Label values
const LABELS: [f32; 2] = [0.0, 1.0];

/// A fairness penalty on one batch
pub trait FairnessLoss {
    fn name(&self) -> &'static str;

    fn alpha(&self) -> f32;

    /// Scalar penalty for logits `[N, 1]`, sensitive `[N]`, labels `[N, 1]`
    ///
    /// `x` is accepted for regularizers that condition on features; the
    /// built-in ones ignore it.
    fn penalty(&self, x: &Tensor, logits: &Tensor, sensitive: &Tensor, labels: &Tensor) -> Result<Tensor>;
}

/// Mean of `p` over the rows where `mask` is 1, or `None` for an empty group
fn masked_mean(p: &Tensor, mask: &[f32]) -> Result<Option<Tensor>> {
    let count: f32 = mask.iter().sum();
    if count == 0.0 {
        return Ok(None);
    }
    let mask = Tensor::from_vec(mask.to_vec(), mask.len(), p.device())
        .map_err(|e| FairHnError::Tensor(format!("group mask failed: {}", e)))?;
    let mean = p
        .mul(&mask)
        .and_then(|t| t.sum_all())
        .and_then(|t| t.affine(1.0 / count as f64, 0.0))
        .map_err(|e| FairHnError::Tensor(format!("group mean failed: {}", e)))?;
    Ok(Some(mean))
}

/// `alpha * Σ (relu(g)² + relu(-g)²)` over the given gaps
fn constraint_penalty(gaps: Vec<Tensor>, alpha: f32, like: &Tensor) -> Result<Tensor> {
    let mut total = Tensor::zeros((), DType::F32, like.device())
        .map_err(|e| FairHnError::Tensor(format!("penalty init failed: {}", e)))?;
    for gap in gaps {
        let upper = gap.relu().and_then(|t| t.sqr());
        let lower = gap.neg().and_then(|t| t.relu()).and_then(|t| t.sqr());
        total = upper
            .and_then(|u| lower.and_then(|l| u + l))
            .and_then(|v| total + v)
            .map_err(|e| FairHnError::Tensor(format!("penalty accumulate failed: {}", e)))?;
    }
    total
        .affine(alpha as f64, 0.0)
        .map_err(|e| FairHnError::Tensor(format!("penalty scale failed: {}", e)))
}

/// Flattened probabilities and host copies of sensitive values and labels
fn prepare(logits: &Tensor, sensitive: &Tensor, labels: &Tensor) -> Result<(Tensor, Vec<f32>, Vec<f32>)> {
    let p = sigmoid(logits)?
        .flatten_all()
        .map_err(|e| FairHnError::Tensor(format!("probability flatten failed: {}", e)))?;
    let s = to_host(sensitive)?;
    let y = to_host(labels)?;
    if s.len() != p.elem_count() || y.len() != p.elem_count() {
        return Err(FairHnError::Tensor(format!(
            "fairness inputs disagree on batch size: {} logits, {} sensitive, {} labels",
            p.elem_count(),
            s.len(),
            y.len()
        )));
    }
    Ok((p, s, y))
}

fn indicator(values: &[f32], target: f32) -> Vec<f32> {
    values.iter().map(|v| if *v == target { 1.0 } else { 0.0 }).collect()
}

// =============================================================================
// Demographic parity
// =============================================================================

/// Penalizes differences in positive prediction rate between groups
#[derive(Debug, Clone)]
pub struct DemographicParityLoss {
    alpha: f32,
}

impl DemographicParityLoss {
    pub fn new(alpha: f32) -> Self {
        Self { alpha }
    }
}

impl FairnessLoss for DemographicParityLoss {
    fn name(&self) -> &'static str {
        "demographic_parity"
    }

    fn alpha(&self) -> f32 {
        self.alpha
    }

    fn penalty(&self, _x: &Tensor, logits: &Tensor, sensitive: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (p, s, _) = prepare(logits, sensitive, labels)?;
        let overall = p
            .mean_all()
            .map_err(|e| FairHnError::Tensor(format!("overall mean failed: {}", e)))?;

        let mut gaps = Vec::with_capacity(GROUPS.len());
        for group in GROUPS {
            if let Some(mean) = masked_mean(&p, &indicator(&s, group))? {
                gaps.push((mean - &overall)?);
            }
        }
        constraint_penalty(gaps, self.alpha, &p)
    }
}

// =============================================================================
// Equalized odds
// =============================================================================

/// Penalizes group differences in prediction rate within each true label
#[derive(Debug, Clone)]
pub struct EqualizedOddsLoss {
    alpha: f32,
}

impl EqualizedOddsLoss {
    pub fn new(alpha: f32) -> Self {
        Self { alpha }
    }
}

impl FairnessLoss for EqualizedOddsLoss {
    fn name(&self) -> &'static str {
        "equalized_odds"
    }

    fn alpha(&self) -> f32 {
        self.alpha
    }

    fn penalty(&self, _x: &Tensor, logits: &Tensor, sensitive: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (p, s, y) = prepare(logits, sensitive, labels)?;

        let mut gaps = Vec::with_capacity(GROUPS.len() * LABELS.len());
        for label in LABELS {
            let label_mask = indicator(&y, label);
            let Some(label_mean) = masked_mean(&p, &label_mask)? else {
                continue;
            };
            for group in GROUPS {
                let joint: Vec<f32> = indicator(&s, group)
                    .iter()
                    .zip(&label_mask)
                    .map(|(a, b)| a * b)
                    .collect();
                if let Some(mean) = masked_mean(&p, &joint)? {
                    gaps.push((mean - &label_mean)?);
                }
            }
        }
        constraint_penalty(gaps, self.alpha, &p)
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Regularizer for `client` under the configured fairness mode
///
/// In `both` mode even clients get demographic parity with
/// `mixed_dp_alpha` and odd clients equalized odds with `mixed_eo_alpha`.
pub fn select_regularizer(config: &RunConfig, client: usize) -> Option<Box<dyn FairnessLoss>> {
    match config.fairness {
        FairnessMode::None => None,
        FairnessMode::Dp => Some(Box::new(DemographicParityLoss::new(config.alpha))),
        FairnessMode::Eo => Some(Box::new(EqualizedOddsLoss::new(config.alpha))),
        FairnessMode::Both if client % 2 == 0 => {
            Some(Box::new(DemographicParityLoss::new(config.mixed_dp_alpha)))
        }
        FairnessMode::Both => Some(Box::new(EqualizedOddsLoss::new(config.mixed_eo_alpha))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::scalar;
    use candle_core::Device;

    fn column(vals: &[f32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), (vals.len(), 1), &Device::Cpu).unwrap()
    }

    fn vector(vals: &[f32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), vals.len(), &Device::Cpu).unwrap()
    }

    fn x(n: usize) -> Tensor {
        Tensor::zeros((n, 2), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_dp_zero_when_groups_match() {
        let loss = DemographicParityLoss::new(50.0);
        let logits = column(&[1.0, -1.0, 1.0, -1.0]);
        let s = vector(&[0.0, 0.0, 1.0, 1.0]);
        let y = column(&[1.0, 0.0, 1.0, 0.0]);

        let penalty = scalar(&loss.penalty(&x(4), &logits, &s, &y).unwrap()).unwrap();
        assert!(penalty.abs() < 1e-6);
    }

    #[test]
    fn test_dp_matches_closed_form() {
        let loss = DemographicParityLoss::new(2.0);
        let logits = column(&[0.0, 0.0, 10.0, 10.0]);
        let s = vector(&[0.0, 0.0, 1.0, 1.0]);
        let y = column(&[0.0, 1.0, 0.0, 1.0]);

        let p1 = 1.0 / (1.0 + (-10.0f32).exp());
        let mean = (0.5 + p1) / 2.0;
        let expected = 2.0 * ((0.5 - mean).powi(2) + (p1 - mean).powi(2));

        let penalty = scalar(&loss.penalty(&x(4), &logits, &s, &y).unwrap()).unwrap();
        assert!((penalty - expected).abs() < 1e-5);
    }

    #[test]
    fn test_eo_conditions_on_label() {
        let loss = EqualizedOddsLoss::new(1.0);
        // Same rate per label across groups, different rates between labels
        let logits = column(&[2.0, -2.0, 2.0, -2.0]);
        let s = vector(&[0.0, 0.0, 1.0, 1.0]);
        let y = column(&[1.0, 0.0, 1.0, 0.0]);

        let eo = scalar(&loss.penalty(&x(4), &logits, &s, &y).unwrap()).unwrap();
        assert!(eo.abs() < 1e-6);

        // Group 1 is predicted positive regardless of label
        let biased = column(&[2.0, -2.0, 2.0, 2.0]);
        let eo_biased = scalar(&loss.penalty(&x(4), &biased, &s, &y).unwrap()).unwrap();
        assert!(eo_biased > 0.0);
    }

    #[test]
    fn test_empty_group_contributes_nothing() {
        let loss = DemographicParityLoss::new(10.0);
        let logits = column(&[3.0, -1.0]);
        let s = vector(&[0.0, 0.0]);
        let y = column(&[1.0, 0.0]);

        let penalty = scalar(&loss.penalty(&x(2), &logits, &s, &y).unwrap()).unwrap();
        assert!(penalty.is_finite());
        assert!(penalty.abs() < 1e-6);
    }

    #[test]
    fn test_penalty_is_differentiable() {
        let loss = EqualizedOddsLoss::new(5.0);
        let logits = candle_core::Var::from_tensor(&column(&[0.3, -0.2, 1.5, 0.7])).unwrap();
        let s = vector(&[0.0, 1.0, 0.0, 1.0]);
        let y = column(&[1.0, 1.0, 0.0, 0.0]);

        let penalty = loss.penalty(&x(4), logits.as_tensor(), &s, &y).unwrap();
        let grads = penalty.backward().unwrap();
        assert!(grads.get(logits.as_tensor()).is_some());
    }

    #[test]
    fn test_select_regularizer_by_mode_and_parity() {
        let both = RunConfig::default();
        let even = select_regularizer(&both, 2).unwrap();
        let odd = select_regularizer(&both, 3).unwrap();
        assert_eq!(even.name(), "demographic_parity");
        assert_eq!(even.alpha(), 50.0);
        assert_eq!(odd.name(), "equalized_odds");
        assert_eq!(odd.alpha(), 75.0);

        let eo = RunConfig::default().with_fairness(FairnessMode::Eo).with_alpha(5.0);
        let reg = select_regularizer(&eo, 0).unwrap();
        assert_eq!(reg.name(), "equalized_odds");
        assert_eq!(reg.alpha(), 5.0);

        let none = RunConfig::default().with_fairness(FairnessMode::None);
        assert!(select_regularizer(&none, 0).is_none());
    }
}
