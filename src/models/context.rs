//! Context encoder
//!
//! `fc1 → leaky ReLU → fc2 → leaky ReLU → context`, averaged over the batch.
//! The result summarizes the client's local data distribution in one vector.
//! With [`ContextKind::Mean`] the encoder has no layers and the context is
//! the batch mean of the raw features.

use super::{linear_layer, ParameterStore};
use crate::config::ContextKind;
use crate::primitives::{init, leaky_relu, LEAKY_SLOPE};
use crate::{FairHnError, Result};
use candle_core::{Device, Tensor};
use candle_nn::Module;
use rand::rngs::StdRng;

const LAYERS: [&str; 3] = ["context.fc1", "context.fc2", "context.out"];

/// Registers its layers in the owning client model's store
#[derive(Debug, Clone)]
pub struct ContextEncoder {
    kind: ContextKind,
}

impl ContextEncoder {
    /// Create the encoder's variables inside `store`
    pub fn register(
        store: &mut ParameterStore,
        kind: ContextKind,
        input_dim: usize,
        hidden: usize,
        context_dim: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        if kind == ContextKind::Mean {
            if context_dim != input_dim {
                return Err(FairHnError::Config(format!(
                    "mean context must be {} wide, got {}",
                    input_dim, context_dim
                )));
            }
            return Ok(Self { kind });
        }

        let sizes = [(input_dim, hidden), (hidden, hidden), (hidden, context_dim)];
        for (prefix, (fan_in, fan_out)) in LAYERS.iter().zip(sizes) {
            let (w, b) = init::linear_vars(rng, fan_in, fan_out, device)?;
            store.insert(format!("{}.weight", prefix), w)?;
            store.insert(format!("{}.bias", prefix), b)?;
        }
        Ok(Self { kind })
    }

    /// Context vector `[context_dim]` of a batch `[N, D]`
    pub fn encode(&self, store: &ParameterStore, x: &Tensor) -> Result<Tensor> {
        if self.kind == ContextKind::Mean {
            return x
                .mean(0)
                .map_err(|e| FairHnError::Tensor(format!("context mean failed: {}", e)));
        }

        let fc1 = linear_layer(store, LAYERS[0])?;
        let fc2 = linear_layer(store, LAYERS[1])?;
        let out = linear_layer(store, LAYERS[2])?;

        let h = leaky_relu(&fc1.forward(x)?, LEAKY_SLOPE)?;
        let h = leaky_relu(&fc2.forward(&h)?, LEAKY_SLOPE)?;
        let per_example = out.forward(&h)?;

        per_example
            .mean(0)
            .map_err(|e| FairHnError::Tensor(format!("context mean failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{seeded_rng, RngStream};

    #[test]
    fn test_encode_shape_and_determinism() {
        let device = Device::Cpu;
        let mut store = ParameterStore::new();
        let mut rng = seeded_rng(0, RngStream::Init);
        let encoder = ContextEncoder::register(&mut store, ContextKind::Learned, 3, 8, 5, &mut rng, &device).unwrap();
        assert_eq!(store.len(), 6);

        let x = Tensor::from_vec(vec![0.1f32, 0.2, 0.3, 1.0, -1.0, 0.5], (2, 3), &device).unwrap();
        let a = encoder.encode(&store, &x).unwrap();
        let b = encoder.encode(&store, &x).unwrap();

        assert_eq!(a.dims(), &[5]);
        assert_eq!(a.to_vec1::<f32>().unwrap(), b.to_vec1::<f32>().unwrap());
    }

    #[test]
    fn test_encode_is_order_invariant() {
        let device = Device::Cpu;
        let mut store = ParameterStore::new();
        let mut rng = seeded_rng(4, RngStream::Init);
        let encoder = ContextEncoder::register(&mut store, ContextKind::Learned, 2, 4, 3, &mut rng, &device).unwrap();

        let x1 = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], (2, 2), &device).unwrap();
        let x2 = Tensor::from_vec(vec![3.0f32, 4.0, 1.0, 2.0], (2, 2), &device).unwrap();
        let a = encoder.encode(&store, &x1).unwrap().to_vec1::<f32>().unwrap();
        let b = encoder.encode(&store, &x2).unwrap().to_vec1::<f32>().unwrap();

        for (u, v) in a.iter().zip(&b) {
            assert!((u - v).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mean_context_is_column_mean() {
        let device = Device::Cpu;
        let mut store = ParameterStore::new();
        let mut rng = seeded_rng(0, RngStream::Init);
        let encoder =
            ContextEncoder::register(&mut store, ContextKind::Mean, 2, 50, 2, &mut rng, &device).unwrap();
        assert!(store.is_empty());

        let x = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 6.0], (2, 2), &device).unwrap();
        let ctx = encoder.encode(&store, &x).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(ctx, vec![2.0, 4.0]);
    }

    #[test]
    fn test_mean_context_rejects_other_width() {
        let mut store = ParameterStore::new();
        let mut rng = seeded_rng(0, RngStream::Init);
        let result = ContextEncoder::register(&mut store, ContextKind::Mean, 3, 8, 5, &mut rng, &Device::Cpu);
        assert!(matches!(result, Err(FairHnError::Config(_))));
    }
}
