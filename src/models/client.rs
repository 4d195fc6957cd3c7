//! Client models
//!
//! Both variants prepend the broadcast context vector to every feature row.
//! Their prediction layers are generated by the hypernetwork; the context
//! encoder layers are their own and persist across outer steps.

use super::{linear_layer, ClientModel, ContextEncoder, ModelDims, ParamSpec, ParameterStore};
use crate::config::ModelKind;
use crate::primitives::{dropout, init, relu};
use crate::{FairHnError, Result};
use candle_core::{Device, Tensor};
use candle_nn::Module;
use rand::rngs::StdRng;

/// `[ctx, x]` for every row of `x`
fn with_context(x: &Tensor, context: &Tensor) -> Result<Tensor> {
    let (n, _) = x
        .dims2()
        .map_err(|e| FairHnError::Tensor(format!("client input must be [N, D]: {}", e)))?;
    let ctx = context
        .unsqueeze(0)
        .and_then(|c| c.broadcast_as((n, context.elem_count())))
        .and_then(|c| c.contiguous())
        .map_err(|e| FairHnError::Tensor(format!("context broadcast failed: {}", e)))?;
    Tensor::cat(&[&ctx, x], 1)
        .map_err(|e| FairHnError::Tensor(format!("context concat failed: {}", e)))
}

/// Register a generated linear layer and record its spec
fn generated_layer(
    store: &mut ParameterStore,
    specs: &mut Vec<ParamSpec>,
    prefix: &str,
    fan_in: usize,
    fan_out: usize,
    rng: &mut StdRng,
    device: &Device,
) -> Result<()> {
    let (w, b) = init::linear_vars(rng, fan_in, fan_out, device)?;
    specs.push(ParamSpec::new(format!("{}.weight", prefix), vec![fan_out, fan_in]));
    specs.push(ParamSpec::new(format!("{}.bias", prefix), vec![fan_out]));
    store.insert(format!("{}.weight", prefix), w)?;
    store.insert(format!("{}.bias", prefix), b)?;
    Ok(())
}

// =============================================================================
// Feed-forward client
// =============================================================================

/// `fc1 → ReLU → dropout → fc2 → ReLU → dropout → out`
pub struct NnClient {
    store: ParameterStore,
    encoder: ContextEncoder,
    generated: Vec<ParamSpec>,
    dropout: f32,
}

impl NnClient {
    pub fn new(dims: &ModelDims, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let mut store = ParameterStore::new();
        let encoder = ContextEncoder::register(
            &mut store,
            dims.context_kind,
            dims.input_dim,
            dims.context_hidden,
            dims.context_dim,
            rng,
            device,
        )?;

        let width = dims.input_dim + dims.context_dim;
        let hidden = dims.client_hidden;
        let mut generated = Vec::new();
        generated_layer(&mut store, &mut generated, "fc1", width, hidden, rng, device)?;
        generated_layer(&mut store, &mut generated, "fc2", hidden, hidden, rng, device)?;
        generated_layer(&mut store, &mut generated, "out", hidden, 1, rng, device)?;

        Ok(Self {
            store,
            encoder,
            generated,
            dropout: dims.dropout,
        })
    }
}

impl ClientModel for NnClient {
    fn kind(&self) -> ModelKind {
        ModelKind::Nn
    }

    fn context(&self, x: &Tensor) -> Result<Tensor> {
        self.encoder.encode(&self.store, x)
    }

    fn forward(&self, x: &Tensor, context: &Tensor, mut train: Option<&mut StdRng>) -> Result<Tensor> {
        let fc1 = linear_layer(&self.store, "fc1")?;
        let fc2 = linear_layer(&self.store, "fc2")?;
        let out = linear_layer(&self.store, "out")?;

        let input = with_context(x, context)?;

        let mut h = relu(&fc1.forward(&input)?)?;
        if let Some(rng) = train.as_deref_mut() {
            h = dropout(&h, self.dropout, rng)?;
        }
        let mut h = relu(&fc2.forward(&h)?)?;
        if let Some(rng) = train.as_deref_mut() {
            h = dropout(&h, self.dropout, rng)?;
        }
        Ok(out.forward(&h)?)
    }

    fn generated_params(&self) -> &[ParamSpec] {
        &self.generated
    }

    fn store(&self) -> &ParameterStore {
        &self.store
    }
}

// =============================================================================
// Logistic regression client
// =============================================================================

/// Single linear layer over `[ctx, x]`
pub struct LrClient {
    store: ParameterStore,
    encoder: ContextEncoder,
    generated: Vec<ParamSpec>,
}

impl LrClient {
    pub fn new(dims: &ModelDims, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let mut store = ParameterStore::new();
        let encoder = ContextEncoder::register(
            &mut store,
            dims.context_kind,
            dims.input_dim,
            dims.context_hidden,
            dims.context_dim,
            rng,
            device,
        )?;

        let width = dims.input_dim + dims.context_dim;
        let mut generated = Vec::new();
        generated_layer(&mut store, &mut generated, "fc1", width, 1, rng, device)?;

        Ok(Self {
            store,
            encoder,
            generated,
        })
    }
}

impl ClientModel for LrClient {
    fn kind(&self) -> ModelKind {
        ModelKind::Lr
    }

    fn context(&self, x: &Tensor) -> Result<Tensor> {
        self.encoder.encode(&self.store, x)
    }

    fn forward(&self, x: &Tensor, context: &Tensor, _train: Option<&mut StdRng>) -> Result<Tensor> {
        let fc1 = linear_layer(&self.store, "fc1")?;
        let input = with_context(x, context)?;
        Ok(fc1.forward(&input)?)
    }

    fn generated_params(&self) -> &[ParamSpec] {
        &self.generated
    }

    fn store(&self) -> &ParameterStore {
        &self.store
    }
}
