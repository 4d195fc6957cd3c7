//! Hypernetwork
//!
//! Client embedding lookup, concatenated with the context vector, through an
//! MLP, then one linear head per generated client tensor:
//!
//! ```text
//! [emb(client) | ctx] → Linear → (ReLU → Linear) × n_hidden → features
//! features → head_k → reshape(shape_k)     for every generated tensor k
//! ```

use super::{linear_layer, HyperNetwork, ModelDims, ParamSpec, ParameterStore, WeightBundle};
use crate::config::Conditioning;
use crate::primitives::{init, relu};
use crate::{FairHnError, Result};
use candle_core::{Device, Tensor};
use candle_nn::Module;
use rand::rngs::StdRng;

const EMBEDDING: &str = "embeddings.weight";

fn head_prefix(target: &str) -> String {
    format!("head.{}", target)
}

/// Context-conditioned hypernetwork over a fixed set of target tensors
pub struct HyperNet {
    store: ParameterStore,
    targets: Vec<ParamSpec>,
    num_clients: usize,
    context_dim: usize,
    n_hidden: usize,
    conditioning: Conditioning,
}

impl HyperNet {
    /// Build a hypernetwork producing `targets`
    pub fn new(
        dims: &ModelDims,
        targets: Vec<ParamSpec>,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        if targets.is_empty() {
            return Err(FairHnError::Config("hypernetwork needs at least one target".into()));
        }

        let mut store = ParameterStore::new();
        store.insert(EMBEDDING, init::embedding_var(rng, dims.num_clients, dims.embed_dim, device)?)?;

        let input_dim = match dims.conditioning {
            Conditioning::EmbeddingAndContext => dims.embed_dim + dims.context_dim,
            Conditioning::EmbeddingOnly => dims.embed_dim,
            Conditioning::ContextOnly => dims.context_dim,
        };

        for layer in 0..=dims.n_hidden {
            let fan_in = if layer == 0 { input_dim } else { dims.hyper_hidden };
            let (w, b) = init::linear_vars(rng, fan_in, dims.hyper_hidden, device)?;
            store.insert(format!("mlp.{}.weight", layer), w)?;
            store.insert(format!("mlp.{}.bias", layer), b)?;
        }

        for target in &targets {
            let (w, b) = init::linear_vars(rng, dims.hyper_hidden, target.numel(), device)?;
            let prefix = head_prefix(&target.name);
            store.insert(format!("{}.weight", prefix), w)?;
            store.insert(format!("{}.bias", prefix), b)?;
        }

        Ok(Self {
            store,
            targets,
            num_clients: dims.num_clients,
            context_dim: dims.context_dim,
            n_hidden: dims.n_hidden,
            conditioning: dims.conditioning,
        })
    }

    /// Conditioning input `[1, in]`
    fn input(&self, context: &Tensor, client: usize) -> Result<Tensor> {
        if client >= self.num_clients {
            return Err(FairHnError::Tensor(format!(
                "client id {} out of range (num_clients = {})",
                client, self.num_clients
            )));
        }
        if context.dims() != [self.context_dim] {
            return Err(FairHnError::Tensor(format!(
                "context vector has shape {:?}, expected [{}]",
                context.dims(),
                self.context_dim
            )));
        }

        let embedding = self
            .store
            .require(EMBEDDING)?
            .as_tensor()
            .narrow(0, client, 1)
            .map_err(|e| FairHnError::Tensor(format!("embedding lookup failed: {}", e)))?;
        let context = context
            .unsqueeze(0)
            .map_err(|e| FairHnError::Tensor(format!("context unsqueeze failed: {}", e)))?;

        match self.conditioning {
            Conditioning::EmbeddingAndContext => Tensor::cat(&[&embedding, &context], 1)
                .map_err(|e| FairHnError::Tensor(format!("conditioning concat failed: {}", e))),
            Conditioning::EmbeddingOnly => Ok(embedding),
            Conditioning::ContextOnly => Ok(context),
        }
    }
}

impl HyperNetwork for HyperNet {
    fn generate(&self, context: &Tensor, client: usize) -> Result<WeightBundle> {
        let mut features = linear_layer(&self.store, "mlp.0")?.forward(&self.input(context, client)?)?;
        for layer in 1..=self.n_hidden {
            let linear = linear_layer(&self.store, &format!("mlp.{}", layer))?;
            features = linear.forward(&relu(&features)?)?;
        }

        let mut bundle = WeightBundle::new();
        for target in &self.targets {
            let head = linear_layer(&self.store, &head_prefix(&target.name))?;
            let flat = head.forward(&features)?;
            let tensor = flat.reshape(target.shape.as_slice()).map_err(|e| {
                FairHnError::Tensor(format!("reshape of '{}' failed: {}", target.name, e))
            })?;
            bundle.insert(target.name.clone(), tensor);
        }
        Ok(bundle)
    }

    fn targets(&self) -> &[ParamSpec] {
        &self.targets
    }

    fn num_clients(&self) -> usize {
        self.num_clients
    }

    fn store(&self) -> &ParameterStore {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::{seeded_rng, RngStream};

    fn dims(conditioning: Conditioning) -> ModelDims {
        ModelDims {
            input_dim: 3,
            context_dim: 2,
            context_hidden: 4,
            client_hidden: 4,
            embed_dim: 3,
            num_clients: 2,
            hyper_hidden: 6,
            n_hidden: 2,
            dropout: 0.0,
            conditioning,
            context_kind: Default::default(),
        }
    }

    fn targets() -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("fc1.weight", vec![4, 5]),
            ParamSpec::new("fc1.bias", vec![4]),
        ]
    }

    fn context() -> Tensor {
        Tensor::from_vec(vec![0.3f32, -0.1], 2, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_generate_shapes_match_targets() {
        let mut rng = seeded_rng(0, RngStream::Init);
        let hnet = HyperNet::new(&dims(Conditioning::EmbeddingAndContext), targets(), &mut rng, &Device::Cpu).unwrap();

        let bundle = hnet.generate(&context(), 1).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.get("fc1.weight").unwrap().dims(), &[4, 5]);
        assert_eq!(bundle.get("fc1.bias").unwrap().dims(), &[4]);
    }

    #[test]
    fn test_store_layout() {
        let mut rng = seeded_rng(0, RngStream::Init);
        let hnet = HyperNet::new(&dims(Conditioning::EmbeddingAndContext), targets(), &mut rng, &Device::Cpu).unwrap();
        // embedding + 3 MLP layers + 2 heads
        assert_eq!(hnet.store().len(), 1 + 3 * 2 + 2 * 2);
        assert_eq!(hnet.store().get("mlp.0.weight").unwrap().dims(), &[6, 5]);
    }

    #[test]
    fn test_clients_get_different_weights() {
        let mut rng = seeded_rng(0, RngStream::Init);
        let hnet = HyperNet::new(&dims(Conditioning::EmbeddingOnly), targets(), &mut rng, &Device::Cpu).unwrap();

        let a = hnet.generate(&context(), 0).unwrap();
        let b = hnet.generate(&context(), 1).unwrap();
        assert_ne!(
            a.get("fc1.bias").unwrap().to_vec1::<f32>().unwrap(),
            b.get("fc1.bias").unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_context_only_ignores_client_identity() {
        let mut rng = seeded_rng(0, RngStream::Init);
        let hnet = HyperNet::new(&dims(Conditioning::ContextOnly), targets(), &mut rng, &Device::Cpu).unwrap();

        let a = hnet.generate(&context(), 0).unwrap();
        let b = hnet.generate(&context(), 1).unwrap();
        assert_eq!(
            a.get("fc1.bias").unwrap().to_vec1::<f32>().unwrap(),
            b.get("fc1.bias").unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_bad_client_and_context_are_errors() {
        let mut rng = seeded_rng(0, RngStream::Init);
        let hnet = HyperNet::new(&dims(Conditioning::EmbeddingAndContext), targets(), &mut rng, &Device::Cpu).unwrap();

        assert!(matches!(hnet.generate(&context(), 2), Err(FairHnError::Tensor(_))));
        let wide = Tensor::from_vec(vec![0.0f32; 3], 3, &Device::Cpu).unwrap();
        assert!(matches!(hnet.generate(&wide, 0), Err(FairHnError::Tensor(_))));
    }

    #[test]
    fn test_bundle_is_differentiable_wrt_hypernet() {
        let mut rng = seeded_rng(0, RngStream::Init);
        let hnet = HyperNet::new(&dims(Conditioning::EmbeddingAndContext), targets(), &mut rng, &Device::Cpu).unwrap();

        let bundle = hnet.generate(&context(), 0).unwrap();
        let loss = bundle.get("fc1.weight").unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let head = hnet.store().get("head.fc1.weight.weight").unwrap();
        assert!(grads.get(head.as_tensor()).is_some());
        let embedding = hnet.store().get("embeddings.weight").unwrap();
        assert!(grads.get(embedding.as_tensor()).is_some());
    }
}
