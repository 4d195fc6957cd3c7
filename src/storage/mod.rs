//! Hypernetwork persistence
//!
//! A trained hypernetwork is stored as a directory holding
//!
//! - `hypernet.safetensors`: every hypernetwork variable by name
//! - `run.json`: [`RunMetadata`] with the config, resolved widths and the
//!   final evaluation
//!
//! Client models are not stored; they are regenerated from the hypernetwork.

use crate::config::RunConfig;
use crate::models::{HyperNetwork, ModelDims, ParamSpec, WeightBundle};
use crate::training::RunSummary;
use crate::{Device, FairHnError, Result, Tensor};
use chrono::{DateTime, Utc};
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

const WEIGHTS_FILE: &str = "hypernet.safetensors";
const METADATA_FILE: &str = "run.json";

// ============================================================================
// Metadata
// ============================================================================

/// Description of the run that produced a stored hypernetwork
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the config's JSON form
    pub config_digest: String,
    pub config: RunConfig,
    pub dims: ModelDims,
    /// Client tensors the hypernetwork generates
    pub targets: Vec<ParamSpec>,
    pub steps: usize,
    pub final_avg_loss: Option<f32>,
    pub final_avg_accuracy: Option<f32>,
}

impl RunMetadata {
    pub fn new(config: &RunConfig, dims: &ModelDims, targets: &[ParamSpec]) -> Result<Self> {
        Ok(Self {
            created_at: Utc::now(),
            config_digest: config_digest(config)?,
            config: config.clone(),
            dims: dims.clone(),
            targets: targets.to_vec(),
            steps: 0,
            final_avg_loss: None,
            final_avg_accuracy: None,
        })
    }

    /// Attach the outcome of a finished run
    pub fn with_summary(mut self, summary: &RunSummary) -> Self {
        self.steps = summary.steps;
        self.final_avg_loss = Some(summary.final_eval.avg_loss);
        self.final_avg_accuracy = Some(summary.final_eval.avg_accuracy);
        self
    }

    /// Whether `config` is the config this run was trained with
    pub fn matches_config(&self, config: &RunConfig) -> bool {
        config_digest(config).map_or(false, |digest| digest == self.config_digest)
    }
}

/// Content hash of a config
pub fn config_digest(config: &RunConfig) -> Result<String> {
    let json = config.to_json()?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

// ============================================================================
// Store
// ============================================================================

/// Directory store for a trained hypernetwork
pub struct HypernetStore {
    dir: PathBuf,

    /// Device for loaded tensors
    device: Device,
}

impl HypernetStore {
    pub fn new(dir: impl AsRef<Path>, device: Device) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            device,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(WEIGHTS_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Check if a hypernetwork is stored
    pub fn exists(&self) -> bool {
        self.weights_path().exists() && self.metadata_path().exists()
    }

    /// Write the hypernetwork's variables and the run metadata
    pub fn save(&self, hnet: &dyn HyperNetwork, metadata: &RunMetadata) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(FairHnError::Io)?;

        // Host copies must outlive the views
        let mut host: Vec<(String, Vec<usize>, Vec<f32>)> = Vec::with_capacity(hnet.store().len());
        for (name, var) in hnet.store().iter() {
            let data: Vec<f32> = var.as_tensor().flatten_all()?.to_vec1()?;
            host.push((name.to_string(), var.dims().to_vec(), data));
        }

        let mut views: HashMap<String, TensorView> = HashMap::with_capacity(host.len());
        for (name, shape, data) in &host {
            let view = TensorView::new(
                safetensors::tensor::Dtype::F32,
                shape.clone(),
                bytemuck::cast_slice(data),
            )
            .map_err(|e| FairHnError::Serialization(e.to_string()))?;
            views.insert(name.clone(), view);
        }

        safetensors::serialize_to_file(views, &None, &self.weights_path())
            .map_err(|e| FairHnError::Serialization(e.to_string()))?;

        let metadata_json = serde_json::to_string_pretty(metadata)
            .map_err(|e| FairHnError::Serialization(e.to_string()))?;
        std::fs::write(self.metadata_path(), metadata_json).map_err(FairHnError::Io)?;

        info!(
            "💾 Saved hypernetwork ({} tensors) to {}",
            host.len(),
            self.dir.display()
        );
        Ok(())
    }

    pub fn load_metadata(&self) -> Result<RunMetadata> {
        let json = std::fs::read_to_string(self.metadata_path()).map_err(FairHnError::Io)?;
        serde_json::from_str(&json).map_err(|e| FairHnError::Serialization(e.to_string()))
    }

    /// Every stored tensor by name
    pub fn load_weights(&self) -> Result<WeightBundle> {
        let data = std::fs::read(self.weights_path()).map_err(FairHnError::Io)?;

        let tensors = SafeTensors::deserialize(&data)
            .map_err(|e| FairHnError::Serialization(e.to_string()))?;

        let mut bundle = WeightBundle::new();
        for name in tensors.names() {
            let view = tensors
                .tensor(name)
                .map_err(|e| FairHnError::Serialization(e.to_string()))?;

            let shape: Vec<usize> = view.shape().to_vec();
            let float_data: Vec<f32> = bytemuck::try_cast_slice(view.data())
                .map_err(|e| FairHnError::Serialization(format!("tensor '{}': {}", name, e)))?
                .to_vec();

            let tensor = Tensor::from_vec(float_data, shape.as_slice(), &self.device)
                .map_err(|e| FairHnError::Tensor(e.to_string()))?;
            bundle.insert(name.to_string(), tensor);
        }
        Ok(bundle)
    }

    /// Overwrite `hnet`'s variables with the stored values
    ///
    /// Every variable must be present in the file with a matching shape.
    pub fn load_into(&self, hnet: &dyn HyperNetwork) -> Result<RunMetadata> {
        let metadata = self.load_metadata()?;
        let weights = self.load_weights()?;

        let missing: Vec<&str> = hnet
            .store()
            .names()
            .filter(|name| !weights.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(FairHnError::Serialization(format!(
                "stored hypernetwork is missing {:?}",
                missing
            )));
        }

        let written = hnet.store().overwrite(&weights)?;
        info!(
            "📂 Loaded {} hypernetwork tensors from {}",
            written,
            self.dir.display()
        );
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelKind;
    use crate::models::build_models;
    use crate::primitives::{seeded_rng, RngStream};

    fn config() -> RunConfig {
        RunConfig::default().with_clients(2).with_hypernet(8, 1)
    }

    fn build(seed: u64) -> (Box<dyn HyperNetwork>, ModelDims) {
        let dims = ModelDims::from_config(&config(), 3);
        let mut rng = seeded_rng(seed, RngStream::Init);
        let (hnet, _) = build_models(ModelKind::Nn, &dims, &mut rng, &Device::Cpu).unwrap();
        (hnet, dims)
    }

    fn values(hnet: &dyn HyperNetwork) -> Vec<Vec<f32>> {
        hnet.store()
            .iter()
            .map(|(_, v)| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_save_and_load_restores_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = HypernetStore::new(dir.path().join("run"), Device::Cpu);

        let (trained, dims) = build(1);
        let metadata = RunMetadata::new(&config(), &dims, trained.targets()).unwrap();
        store.save(trained.as_ref(), &metadata).unwrap();
        assert!(store.exists());

        let (fresh, _) = build(2);
        assert_ne!(values(trained.as_ref()), values(fresh.as_ref()));

        let loaded = store.load_into(fresh.as_ref()).unwrap();
        assert_eq!(values(trained.as_ref()), values(fresh.as_ref()));
        assert_eq!(loaded.targets, trained.targets().to_vec());
        assert!(loaded.matches_config(&config()));
        assert!(!loaded.matches_config(&config().with_seed(9)));
    }

    #[test]
    fn test_load_rejects_incomplete_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = HypernetStore::new(dir.path(), Device::Cpu);

        let (small, dims) = build(1);
        let metadata = RunMetadata::new(&config(), &dims, small.targets()).unwrap();
        store.save(small.as_ref(), &metadata).unwrap();

        // A deeper hypernetwork has variables the file lacks
        let deep = config().with_hypernet(8, 2);
        let deep_dims = ModelDims::from_config(&deep, 3);
        let mut rng = seeded_rng(0, RngStream::Init);
        let (other, _) = build_models(ModelKind::Nn, &deep_dims, &mut rng, &Device::Cpu).unwrap();

        let err = store.load_into(other.as_ref()).unwrap_err();
        assert!(matches!(err, FairHnError::Serialization(_)));
    }

    #[test]
    fn test_missing_store_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = HypernetStore::new(dir.path().join("absent"), Device::Cpu);
        assert!(!store.exists());
        assert!(matches!(store.load_metadata(), Err(FairHnError::Io(_))));
    }

    #[test]
    fn test_config_digest_is_stable() {
        assert_eq!(config_digest(&config()).unwrap(), config_digest(&config()).unwrap());
        assert_eq!(config_digest(&config()).unwrap().len(), 64);
    }
}
