//! Models
//!
//! The hypernetwork, the client models and the parameter containers they
//! share.
//!
//! ## Overview
//!
//! - [`HyperNetwork`]: `(context, client) → WeightBundle`
//! - [`ClientModel`]: context encoding, prediction, bundle loading
//! - [`ParameterStore`] / [`WeightBundle`]: named `Var`s and named tensors
//! - [`build_models`]: factory pairing a hypernetwork with a client model
//!
//! The training loop only talks to the two traits, so adding an architecture
//! means adding a variant to [`build_models`].
//!
//! ## Example
//!
//! ```ignore
//! use fair_hypernet::models::*;
//!
//! let dims = ModelDims::from_config(&config, provider.feature_dim());
//! let (hnet, model) = build_models(ModelKind::Nn, &dims, &mut rng, &device)?;
//!
//! let ctx = model.context(&batch.x)?;
//! let bundle = hnet.generate(&ctx.detach(), client)?;
//! model.load(&bundle)?;
//! let logits = model.forward(&batch.x, &ctx, None)?;
//! ```

mod client;
mod context;
mod hypernet;
mod store;

pub use client::{LrClient, NnClient};
pub use context::ContextEncoder;
pub use hypernet::HyperNet;
pub use store::{ParameterStore, WeightBundle};

use crate::config::{Conditioning, ContextKind, ModelKind, RunConfig};
use crate::{FairHnError, Result};
use candle_core::{Device, Tensor, Var};
use candle_nn::Linear;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Shapes
// =============================================================================

/// Name and shape of one generated client tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Resolved layer widths of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDims {
    /// Feature count D
    pub input_dim: usize,
    /// Context vector width E
    pub context_dim: usize,
    pub context_hidden: usize,
    pub client_hidden: usize,
    pub embed_dim: usize,
    pub num_clients: usize,
    pub hyper_hidden: usize,
    pub n_hidden: usize,
    pub dropout: f32,
    pub conditioning: Conditioning,
    pub context_kind: ContextKind,
}

impl ModelDims {
    /// Widths left unset in the config default to the feature count
    ///
    /// A mean context is always as wide as the features.
    pub fn from_config(config: &RunConfig, feature_dim: usize) -> Self {
        let context_dim = match config.context_encoder {
            ContextKind::Learned => config.context_dim.unwrap_or(feature_dim),
            ContextKind::Mean => feature_dim,
        };
        Self {
            input_dim: feature_dim,
            context_dim,
            context_hidden: config.context_hidden,
            client_hidden: config.client_hidden.unwrap_or(feature_dim),
            embed_dim: config.embed_dim.unwrap_or(feature_dim),
            num_clients: config.num_clients,
            hyper_hidden: config.hyper_hidden,
            n_hidden: config.n_hidden,
            dropout: config.dropout,
            conditioning: config.conditioning,
            context_kind: config.context_encoder,
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// Produces client weights from a context vector and a client id
pub trait HyperNetwork {
    /// Weight bundle for `client`, attached to the hypernetwork's graph
    ///
    /// Fails when `client` is out of range or `context` has the wrong width.
    fn generate(&self, context: &Tensor, client: usize) -> Result<WeightBundle>;

    /// The tensors every bundle contains
    fn targets(&self) -> &[ParamSpec];

    fn num_clients(&self) -> usize;

    fn store(&self) -> &ParameterStore;

    /// Trainable variables, the outer optimizer's only target
    fn vars(&self) -> Vec<Var> {
        self.store().vars()
    }
}

/// Client-side model whose prediction layers come from a bundle
pub trait ClientModel {
    fn kind(&self) -> ModelKind;

    /// Context vector `[E]` of a batch `[N, D]`
    fn context(&self, x: &Tensor) -> Result<Tensor>;

    /// Logits `[N, 1]`; `train` carries the dropout generator in training mode
    fn forward(&self, x: &Tensor, context: &Tensor, train: Option<&mut StdRng>) -> Result<Tensor>;

    /// Tensors the hypernetwork must generate
    fn generated_params(&self) -> &[ParamSpec];

    fn store(&self) -> &ParameterStore;

    /// Context from `x`, then logits for `x`
    fn predict(&self, x: &Tensor, train: Option<&mut StdRng>) -> Result<Tensor> {
        let context = self.context(x)?;
        self.forward(x, &context, train)
    }

    /// Overwrite generated parameters from `bundle`; returns keys loaded
    fn load(&self, bundle: &WeightBundle) -> Result<usize> {
        self.store().overwrite(bundle)
    }

    /// Every trainable variable, context encoder included
    fn vars(&self) -> Vec<Var> {
        self.store().vars()
    }
}

/// Build the hypernetwork / client model pair for `kind`
pub fn build_models(
    kind: ModelKind,
    dims: &ModelDims,
    rng: &mut StdRng,
    device: &Device,
) -> Result<(Box<dyn HyperNetwork>, Box<dyn ClientModel>)> {
    if dims.input_dim == 0 {
        return Err(FairHnError::Config("feature width must be at least 1".into()));
    }

    let client: Box<dyn ClientModel> = match kind {
        ModelKind::Nn => Box::new(NnClient::new(dims, rng, device)?),
        ModelKind::Lr => Box::new(LrClient::new(dims, rng, device)?),
    };
    let hnet = HyperNet::new(dims, client.generated_params().to_vec(), rng, device)?;

    info!(
        "Built {} client ({} params) and hypernetwork ({} params) for {} clients",
        client.kind(),
        client.store().num_parameters(),
        hnet.store().num_parameters(),
        dims.num_clients
    );

    Ok((Box::new(hnet), client))
}

/// `candle_nn::Linear` over the current values of `{prefix}.weight` / `{prefix}.bias`
pub(crate) fn linear_layer(store: &ParameterStore, prefix: &str) -> Result<Linear> {
    let weight = store.require(&format!("{}.weight", prefix))?;
    let bias = store.require(&format!("{}.bias", prefix))?;
    Ok(Linear::new(
        weight.as_tensor().clone(),
        Some(bias.as_tensor().clone()),
    ))
}
