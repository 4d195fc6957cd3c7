//! Activation Functions
//!
//! Activations used by the context encoder, the client models and the
//! hypernetwork MLP.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::Rng;
use crate::{Result, FairHnError};

/// Negative slope of the context encoder's leaky ReLU
pub const LEAKY_SLOPE: f64 = 0.01;

/// Sigmoid activation: σ(x) = 1 / (1 + e^(-x))
///
/// Maps logits to probabilities.
pub fn sigmoid(tensor: &Tensor) -> Result<Tensor> {
    let neg = tensor.neg()
        .map_err(|e| FairHnError::Tensor(format!("sigmoid neg failed: {}", e)))?;
    let exp_neg = neg.exp()
        .map_err(|e| FairHnError::Tensor(format!("sigmoid exp failed: {}", e)))?;
    let one_plus = (exp_neg + 1.0)
        .map_err(|e| FairHnError::Tensor(format!("sigmoid add failed: {}", e)))?;
    one_plus.recip()
        .map_err(|e| FairHnError::Tensor(format!("sigmoid recip failed: {}", e)))
}

/// ReLU activation: max(0, x)
pub fn relu(tensor: &Tensor) -> Result<Tensor> {
    tensor.relu()
        .map_err(|e| FairHnError::Tensor(format!("ReLU failed: {}", e)))
}

/// Leaky ReLU activation: max(αx, x)
pub fn leaky_relu(tensor: &Tensor, negative_slope: f64) -> Result<Tensor> {
    let zeros = Tensor::zeros_like(tensor)
        .map_err(|e| FairHnError::Tensor(format!("zeros_like failed: {}", e)))?;

    let positive = tensor.maximum(&zeros)
        .map_err(|e| FairHnError::Tensor(format!("maximum failed: {}", e)))?;

    let negative = tensor.minimum(&zeros)
        .map_err(|e| FairHnError::Tensor(format!("minimum failed: {}", e)))?;

    let scaled_negative = (negative * negative_slope)
        .map_err(|e| FairHnError::Tensor(format!("scale failed: {}", e)))?;

    (positive + scaled_negative)
        .map_err(|e| FairHnError::Tensor(format!("leaky_relu add failed: {}", e)))
}

/// Inverted dropout with a mask drawn from `rng`
///
/// Kept units are scaled by `1 / (1 - rate)` so evaluation needs no rescaling.
/// candle's own random kernels are not seedable on every backend, so the mask
/// is sampled on the host.
pub fn dropout(tensor: &Tensor, rate: f32, rng: &mut StdRng) -> Result<Tensor> {
    if rate <= 0.0 {
        return Ok(tensor.clone());
    }

    let keep = 1.0 - rate;
    let scale = 1.0 / keep;
    let mask: Vec<f32> = (0..tensor.elem_count())
        .map(|_| if rng.gen::<f32>() < keep { scale } else { 0.0 })
        .collect();

    let mask = Tensor::from_vec(mask, tensor.dims(), tensor.device())
        .map_err(|e| FairHnError::Tensor(format!("dropout mask failed: {}", e)))?;
    tensor.mul(&mask)
        .map_err(|e| FairHnError::Tensor(format!("dropout mul failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;

    fn device() -> Device {
        Device::Cpu
    }

    fn tensor(vals: &[f32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), vals.len(), &device()).unwrap()
    }

    #[test]
    fn test_sigmoid() {
        let t = tensor(&[0.0]);
        let s = sigmoid(&t).unwrap();
        let val = s.to_vec1::<f32>().unwrap()[0];

        // sigmoid(0) = 0.5
        assert!((val - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_sigmoid_extremes() {
        let s_large = sigmoid(&tensor(&[100.0])).unwrap();
        assert!((s_large.to_vec1::<f32>().unwrap()[0] - 1.0).abs() < 0.001);

        let s_small = sigmoid(&tensor(&[-100.0])).unwrap();
        assert!(s_small.to_vec1::<f32>().unwrap()[0].abs() < 0.001);
    }

    #[test]
    fn test_relu() {
        let r = relu(&tensor(&[-2.0, -1.0, 0.0, 1.0, 2.0])).unwrap();
        assert_eq!(r.to_vec1::<f32>().unwrap(), vec![0.0, 0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_leaky_relu() {
        let r = leaky_relu(&tensor(&[-2.0, -1.0, 0.0, 1.0, 2.0]), 0.1).unwrap();
        let vals = r.to_vec1::<f32>().unwrap();

        // Negative values scaled by 0.1
        assert!((vals[0] - (-0.2)).abs() < 0.001);
        assert!((vals[1] - (-0.1)).abs() < 0.001);
        assert!(vals[2].abs() < 0.001);
        assert!((vals[4] - 2.0).abs() < 0.001);
    }

    #[test]
    fn test_dropout_is_seeded_and_scaled() {
        let t = tensor(&[1.0; 64]);

        let a = dropout(&t, 0.5, &mut StdRng::seed_from_u64(9)).unwrap().to_vec1::<f32>().unwrap();
        let b = dropout(&t, 0.5, &mut StdRng::seed_from_u64(9)).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);

        // Every unit is either dropped or scaled by 2
        assert!(a.iter().all(|v| *v == 0.0 || (*v - 2.0).abs() < 1e-6));
        assert!(a.iter().any(|v| *v == 0.0));
    }

    #[test]
    fn test_dropout_zero_rate_is_identity() {
        let t = tensor(&[0.3, -0.7]);
        let out = dropout(&t, 0.0, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![0.3, -0.7]);
    }
}
