//! Training Infrastructure
//!
//! Optimizers, gradient utilities and the hypernetwork personalization loop.
//!
//! ## Overview
//!
//! - **Optimizers**: wrapped candle-nn AdamW
//! - **Gradients**: norm, health check, norm clipping on a `GradStore`
//! - **Reprojection**: weight delta and its pull-back through the hypernetwork
//! - **Loop**: [`PersonalizationLoop`], the outer/inner training schedule
//!
//! ## Example
//!
//! ```ignore
//! use fair_hypernet::training::*;
//!
//! let delta = weight_delta(&inner_state, &final_state)?;
//! let mut grads = reproject(&bundle, &delta)?;
//! clip_grad_norm(&mut grads, &hnet_vars, 50.0)?;
//! optimizer.step(&grads)?;
//! ```

mod personalization;

pub use personalization::{PersonalizationLoop, RunSummary, StepReport};

use crate::models::WeightBundle;
use crate::{FairHnError, Result};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::optim::Optimizer as CandleOptimizer;
use tracing::debug;

// =============================================================================
// Optimizers
// =============================================================================

/// Wrapper around candle-nn's AdamW optimizer
pub struct AdamOptimizer {
    inner: candle_nn::optim::AdamW,
}

impl AdamOptimizer {
    /// Create a new Adam optimizer with decoupled weight decay
    pub fn new(vars: Vec<Var>, learning_rate: f64, weight_decay: f64) -> Result<Self> {
        let params = candle_nn::optim::ParamsAdamW {
            lr: learning_rate,
            weight_decay,
            ..Default::default()
        };

        let inner = <candle_nn::optim::AdamW as CandleOptimizer>::new(vars, params)
            .map_err(|e| FairHnError::Tensor(format!("AdamW init failed: {}", e)))?;

        Ok(Self { inner })
    }

    /// Take a gradient step
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        CandleOptimizer::step(&mut self.inner, grads)
            .map_err(|e| FairHnError::Training(format!("Adam step failed: {}", e)))
    }
}

// =============================================================================
// Loss tracking
// =============================================================================

/// Running record of per-step training loss
#[derive(Debug, Default)]
pub struct LossTracker {
    losses: Vec<f32>,
    best_loss: Option<f32>,
}

impl LossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, loss: f32) {
        self.losses.push(loss);
        if self.best_loss.map_or(true, |best| loss < best) {
            self.best_loss = Some(loss);
        }
    }

    /// Average loss over the last `n` steps
    pub fn average_loss(&self, n: usize) -> Option<f32> {
        if self.losses.is_empty() {
            return None;
        }
        let start = self.losses.len().saturating_sub(n);
        let slice = &self.losses[start..];
        Some(slice.iter().sum::<f32>() / slice.len() as f32)
    }

    pub fn best_loss(&self) -> Option<f32> {
        self.best_loss
    }

    pub fn total_steps(&self) -> usize {
        self.losses.len()
    }
}

// =============================================================================
// Gradient Utilities
// =============================================================================

/// Compute the total L2 norm of all gradients
pub fn compute_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f32> {
    let mut total_sq_norm = 0.0f32;

    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq_norm = grad
                .sqr()
                .and_then(|t| t.sum_all())
                .and_then(|t| t.to_scalar::<f32>())
                .map_err(|e| FairHnError::Tensor(format!("grad norm failed: {}", e)))?;
            total_sq_norm += sq_norm;
        }
    }

    Ok(total_sq_norm.sqrt())
}

/// Check if any gradient contains NaN or Inf
///
/// Returns true if gradients are healthy (no NaN/Inf).
pub fn check_gradients_health(grads: &GradStore, vars: &[Var]) -> bool {
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            if let Ok(vals) = grad.flatten_all().and_then(|t| t.to_vec1::<f32>()) {
                if vals.iter().any(|v| !v.is_finite()) {
                    return false;
                }
            }
        }
    }
    true
}

/// Rescale gradients in place so their joint L2 norm is at most `max_norm`
///
/// The scale factor is `max_norm / (norm + 1e-6)`, applied only when it is
/// below one. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f32) -> Result<f32> {
    let norm = compute_grad_norm(grads, vars)?;
    let coef = max_norm / (norm + 1e-6);
    if coef >= 1.0 {
        return Ok(norm);
    }

    debug!("clipping gradient norm {:.3} to {:.1}", norm, max_norm);
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let scaled = grad
            .affine(coef as f64, 0.0)
            .map_err(|e| FairHnError::Tensor(format!("grad scale failed: {}", e)))?;
        grads.insert(var.as_tensor(), scaled);
    }
    Ok(norm)
}

// =============================================================================
// Reprojection
// =============================================================================

/// `inner_state[k] - final_state[k]` for every key of `inner_state`
///
/// This is the direction the hypernetwork is moved in: its update descends
/// along `-J^T delta`, i.e. towards the locally trained weights.
pub fn weight_delta(inner_state: &WeightBundle, final_state: &WeightBundle) -> Result<WeightBundle> {
    let mut delta = WeightBundle::new();
    for (name, start) in inner_state.iter() {
        let end = final_state.get(name).ok_or_else(|| {
            FairHnError::Training(format!("final state is missing '{}'", name))
        })?;
        let diff = (start - end)
            .map_err(|e| FairHnError::Tensor(format!("delta of '{}' failed: {}", name, e)))?;
        delta.insert(name, diff);
    }
    Ok(delta)
}

/// Pull `delta` back through the graph that produced `bundle`
///
/// Equivalent to a vector-Jacobian product with the bundle tensors as outputs
/// and `delta` as their upstream gradients: backpropagating the surrogate
/// `Σ_k sum(W_k ⊙ stopgrad(δ_k))` yields `Σ_k J_kᵀ δ_k` for every variable
/// upstream of the bundle. The returned store is fresh; nothing accumulates
/// across calls.
pub fn reproject(bundle: &WeightBundle, delta: &WeightBundle) -> Result<GradStore> {
    if delta.is_empty() {
        return Err(FairHnError::Training("empty weight delta".into()));
    }

    let mut terms: Vec<Tensor> = Vec::with_capacity(delta.len());
    for (name, seed) in delta.iter() {
        let generated = bundle.get(name).ok_or_else(|| {
            FairHnError::Training(format!("bundle is missing delta key '{}'", name))
        })?;
        if generated.dims() != seed.dims() {
            return Err(FairHnError::Tensor(format!(
                "delta '{}' has shape {:?}, bundle {:?}",
                name,
                seed.dims(),
                generated.dims()
            )));
        }
        let term = generated
            .mul(&seed.detach())
            .and_then(|t| t.sum_all())
            .map_err(|e| FairHnError::Tensor(format!("surrogate term '{}' failed: {}", name, e)))?;
        terms.push(term);
    }

    let surrogate = Tensor::stack(&terms, 0)
        .and_then(|t| t.sum_all())
        .map_err(|e| FairHnError::Tensor(format!("surrogate sum failed: {}", e)))?;

    surrogate
        .backward()
        .map_err(|e| FairHnError::Training(format!("reprojection backward failed: {}", e)))
}
