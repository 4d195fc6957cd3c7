//! Seeded parameter initialization
//!
//! All random draws of a run come from [`StdRng`] streams derived from the run
//! seed, so two runs with the same config produce bit-identical parameters.

use crate::{Result, FairHnError};
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Independent random streams of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngStream {
    Init,
    ClientSelection,
    Batches,
    Dropout,
    Partition,
}

impl RngStream {
    fn salt(&self) -> u64 {
        match self {
            Self::Init => 0x11,
            Self::ClientSelection => 0x23,
            Self::Batches => 0x37,
            Self::Dropout => 0x41,
            Self::Partition => 0x59,
        }
    }
}

/// Derive the generator for one stream of a seeded run
pub fn seeded_rng(seed: u64, stream: RngStream) -> StdRng {
    StdRng::seed_from_u64(seed ^ stream.salt().wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Tensor with entries drawn from U(-bound, bound)
pub fn uniform_tensor(
    rng: &mut StdRng,
    shape: &[usize],
    bound: f32,
    device: &Device,
) -> Result<Tensor> {
    let count: usize = shape.iter().product();
    let data: Vec<f32> = (0..count).map(|_| rng.gen_range(-bound..=bound)).collect();
    Tensor::from_vec(data, shape, device)
        .map_err(|e| FairHnError::Tensor(format!("uniform init failed: {}", e)))
}

/// Tensor with entries drawn from N(0, std²)
pub fn normal_tensor(rng: &mut StdRng, shape: &[usize], std: f32, device: &Device) -> Result<Tensor> {
    let normal = Normal::new(0.0f32, std)
        .map_err(|e| FairHnError::Config(format!("invalid init std {}: {}", std, e)))?;
    let count: usize = shape.iter().product();
    let data: Vec<f32> = (0..count).map(|_| normal.sample(rng)).collect();
    Tensor::from_vec(data, shape, device)
        .map_err(|e| FairHnError::Tensor(format!("normal init failed: {}", e)))
}

/// Weight `[out, in]` and bias `[out]` of a linear layer
///
/// Both drawn from U(-1/√in, 1/√in).
pub fn linear_vars(
    rng: &mut StdRng,
    in_dim: usize,
    out_dim: usize,
    device: &Device,
) -> Result<(Var, Var)> {
    let bound = 1.0 / (in_dim.max(1) as f32).sqrt();
    let weight = uniform_tensor(rng, &[out_dim, in_dim], bound, device)?;
    let bias = uniform_tensor(rng, &[out_dim], bound, device)?;
    Ok((to_var(&weight)?, to_var(&bias)?))
}

/// Embedding table `[count, dim]` drawn from N(0, 1)
pub fn embedding_var(rng: &mut StdRng, count: usize, dim: usize, device: &Device) -> Result<Var> {
    to_var(&normal_tensor(rng, &[count, dim], 1.0, device)?)
}

fn to_var(tensor: &Tensor) -> Result<Var> {
    Var::from_tensor(tensor).map_err(|e| FairHnError::Tensor(format!("Var creation failed: {}", e)))
}
