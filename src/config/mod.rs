//! Run configuration
//!
//! Everything a training run depends on lives in [`RunConfig`]: dataset and
//! model choice, outer/inner optimizer settings, hypernetwork shape, fairness
//! mode, seed and device. The config is passed explicitly; there is no global
//! seed or device state.
//!
//! ## Example
//!
//! ```ignore
//! use fair_hypernet::config::*;
//!
//! let config = RunConfig::from_json_file("run.json")?
//!     .with_fairness(FairnessMode::Eo)
//!     .with_seed(7);
//! config.validate()?;
//! ```

use crate::data::GroupRule;
use crate::{FairHnError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

// =============================================================================
// Enumerated choices
// =============================================================================

/// Tabular benchmark the run is built around
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatasetName {
    Adult,
    #[default]
    Compas,
}

impl DatasetName {
    /// Default label column of the pre-encoded CSV
    pub fn label_column(&self) -> &'static str {
        match self {
            Self::Adult => "income_class",
            Self::Compas => "two_year_recid",
        }
    }

    /// Default sensitive attribute column
    pub fn sensitive_column(&self) -> &'static str {
        "sex"
    }

    /// Rule that splits records into the two client groups
    ///
    /// Adult splits on `workclass == 1`, COMPAS on `age <= 31`.
    pub fn group_rule(&self) -> GroupRule {
        match self {
            Self::Adult => GroupRule::equals("workclass", 1.0),
            Self::Compas => GroupRule::at_most("age", 31.0),
        }
    }
}

impl FromStr for DatasetName {
    type Err = FairHnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "adult" => Ok(Self::Adult),
            "compas" => Ok(Self::Compas),
            other => Err(FairHnError::Config(format!("unknown dataset '{}'", other))),
        }
    }
}

impl std::fmt::Display for DatasetName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adult => write!(f, "adult"),
            Self::Compas => write!(f, "compas"),
        }
    }
}

/// Client model / hypernetwork pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelKind {
    /// Feed-forward network with two hidden layers and dropout
    #[default]
    Nn,
    /// Logistic regression over features and context
    Lr,
}

impl FromStr for ModelKind {
    type Err = FairHnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "NN" => Ok(Self::Nn),
            "LR" => Ok(Self::Lr),
            other => Err(FairHnError::Config(format!("unknown model '{}'", other))),
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nn => write!(f, "NN"),
            Self::Lr => write!(f, "LR"),
        }
    }
}

/// Fairness regularization applied during local training
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FairnessMode {
    None,
    /// Demographic parity with `alpha`
    Dp,
    /// Equalized odds with `alpha`
    Eo,
    /// Even clients use demographic parity, odd clients equalized odds
    #[default]
    Both,
}

impl FairnessMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl FromStr for FairnessMode {
    type Err = FairHnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "dp" => Ok(Self::Dp),
            "eo" => Ok(Self::Eo),
            "both" => Ok(Self::Both),
            other => Err(FairHnError::Config(format!(
                "unknown fairness mode '{}' (expected none|dp|eo|both)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for FairnessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Dp => write!(f, "dp"),
            Self::Eo => write!(f, "eo"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// Which signals the hypernetwork is conditioned on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Conditioning {
    /// Client embedding concatenated with the context vector
    #[default]
    EmbeddingAndContext,
    /// Client embedding only
    EmbeddingOnly,
    /// Context vector only
    ContextOnly,
}

/// How the client context vector is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Learned encoder, mean-pooled over the batch
    #[default]
    Learned,
    /// Batch mean of the raw features; the context width is the feature count
    Mean,
}

impl FromStr for ContextKind {
    type Err = FairHnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "learned" => Ok(Self::Learned),
            "mean" => Ok(Self::Mean),
            other => Err(FairHnError::Config(format!("unknown context encoder '{}'", other))),
        }
    }
}

/// Compute device requested for the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    #[default]
    Cpu,
    Cuda,
    Metal,
    /// Best available accelerator, falling back to CPU
    Auto,
}

impl FromStr for DeviceChoice {
    type Err = FairHnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "auto" => Ok(Self::Auto),
            other => Err(FairHnError::Config(format!("unknown device '{}'", other))),
        }
    }
}

// =============================================================================
// Data configuration
// =============================================================================

/// Where the pre-encoded numeric CSV files live and how to read them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Training CSV (header row required)
    pub train_path: Option<PathBuf>,

    /// Test CSV; when absent a holdout is carved out of each group
    pub test_path: Option<PathBuf>,

    /// Label column override
    pub label_column: Option<String>,

    /// Sensitive attribute column override
    pub sensitive_column: Option<String>,

    /// Records held out per group when there is no test file
    pub holdout_per_group: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_path: None,
            test_path: None,
            label_column: None,
            sensitive_column: None,
            holdout_per_group: 300,
        }
    }
}

// =============================================================================
// Run configuration
// =============================================================================

/// Full configuration of one personalization run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub dataset: DatasetName,
    pub model: ModelKind,

    /// Number of clients
    pub num_clients: usize,

    /// Outer (hypernetwork) steps
    pub steps: usize,

    /// Local steps per outer step
    pub inner_steps: usize,

    /// Hypernetwork learning rate
    pub lr: f64,

    /// Client learning rate
    pub inner_lr: f64,

    /// Hypernetwork weight decay
    pub wd: f64,

    /// Client weight decay
    pub inner_wd: f64,

    /// Hypernetwork MLP width
    pub hyper_hidden: usize,

    /// Hidden layers in the hypernetwork MLP after the input layer
    pub n_hidden: usize,

    /// Client embedding width; defaults to the feature count
    pub embed_dim: Option<usize>,

    /// Context vector width; defaults to the feature count
    pub context_dim: Option<usize>,

    /// Hidden width of the context encoder
    pub context_hidden: usize,

    /// Hidden width of the NN client; defaults to the feature count
    pub client_hidden: Option<usize>,

    /// Dropout rate of the NN client in training mode
    pub dropout: f32,

    pub conditioning: Conditioning,

    pub context_encoder: ContextKind,

    pub batch_size: usize,

    /// Evaluate every this many outer steps
    pub eval_every: usize,

    pub fairness: FairnessMode,

    /// Fairness weight for `dp` and `eo`
    pub alpha: f32,

    /// Demographic parity weight in `both` mode
    pub mixed_dp_alpha: f32,

    /// Equalized odds weight in `both` mode
    pub mixed_eo_alpha: f32,

    /// Gradient norm ceiling for inner and outer updates
    pub max_grad_norm: f32,

    pub seed: u64,

    pub device: DeviceChoice,

    pub data: DataConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetName::Compas,
            model: ModelKind::Nn,
            num_clients: 4,
            steps: 1000,
            inner_steps: 50,
            lr: 1e-3,
            inner_lr: 1e-3,
            wd: 1e-5,
            inner_wd: 1e-5,
            hyper_hidden: 100,
            n_hidden: 3,
            embed_dim: None,
            context_dim: None,
            context_hidden: 50,
            client_hidden: None,
            dropout: 0.5,
            conditioning: Conditioning::EmbeddingAndContext,
            context_encoder: ContextKind::Learned,
            batch_size: 256,
            eval_every: 50,
            fairness: FairnessMode::Both,
            alpha: 50.0,
            mixed_dp_alpha: 50.0,
            mixed_eo_alpha: 75.0,
            max_grad_norm: 50.0,
            seed: 0,
            device: DeviceChoice::Cpu,
            data: DataConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load a config from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(FairHnError::Io)?;
        Self::from_json(&json)
    }

    /// Parse a config from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| FairHnError::Config(format!("config parse failed: {}", e)))
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FairHnError::Serialization(e.to_string()))
    }

    /// Reject configurations that cannot run
    ///
    /// Called before the first training step so a bad flag never costs a
    /// partial run.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(FairHnError::Config(msg));

        if self.num_clients == 0 {
            return fail("num_clients must be at least 1".into());
        }
        if self.steps == 0 {
            return fail("steps must be at least 1".into());
        }
        if self.inner_steps == 0 {
            return fail("inner_steps must be at least 1".into());
        }
        if self.batch_size == 0 {
            return fail("batch_size must be at least 1".into());
        }
        if self.eval_every == 0 {
            return fail("eval_every must be at least 1".into());
        }
        if self.hyper_hidden == 0 || self.context_hidden == 0 {
            return fail("hidden widths must be at least 1".into());
        }
        if matches!(self.embed_dim, Some(0))
            || matches!(self.context_dim, Some(0))
            || matches!(self.client_hidden, Some(0))
        {
            return fail("embed_dim, context_dim and client_hidden must be at least 1".into());
        }
        if !(self.lr > 0.0 && self.inner_lr > 0.0) {
            return fail(format!(
                "learning rates must be positive (lr={}, inner_lr={})",
                self.lr, self.inner_lr
            ));
        }
        if self.wd < 0.0 || self.inner_wd < 0.0 {
            return fail("weight decay must be non-negative".into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return fail(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if self.alpha < 0.0 || self.mixed_dp_alpha < 0.0 || self.mixed_eo_alpha < 0.0 {
            return fail("fairness weights must be non-negative".into());
        }
        if !(self.max_grad_norm > 0.0) {
            return fail("max_grad_norm must be positive".into());
        }
        Ok(())
    }

    /// Outer step indices at which an evaluation snapshot is taken
    pub fn is_eval_step(&self, step: usize) -> bool {
        step == 0 || (step + 1) % self.eval_every == 0 || step + 1 == self.steps
    }

    /// Builder: set dataset
    pub fn with_dataset(mut self, dataset: DatasetName) -> Self {
        self.dataset = dataset;
        self
    }

    /// Builder: set model kind
    pub fn with_model(mut self, model: ModelKind) -> Self {
        self.model = model;
        self
    }

    /// Builder: set client count
    pub fn with_clients(mut self, num_clients: usize) -> Self {
        self.num_clients = num_clients;
        self
    }

    /// Builder: set outer steps
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    /// Builder: set inner steps
    pub fn with_inner_steps(mut self, inner_steps: usize) -> Self {
        self.inner_steps = inner_steps;
        self
    }

    /// Builder: set batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder: set evaluation cadence
    pub fn with_eval_every(mut self, eval_every: usize) -> Self {
        self.eval_every = eval_every;
        self
    }

    /// Builder: set fairness mode
    pub fn with_fairness(mut self, fairness: FairnessMode) -> Self {
        self.fairness = fairness;
        self
    }

    /// Builder: set fairness weight
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Builder: set seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Builder: set hypernetwork width and depth
    pub fn with_hypernet(mut self, hyper_hidden: usize, n_hidden: usize) -> Self {
        self.hyper_hidden = hyper_hidden;
        self.n_hidden = n_hidden;
        self
    }

    /// Builder: set device
    pub fn with_device(mut self, device: DeviceChoice) -> Self {
        self.device = device;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_run() {
        let config = RunConfig::default();
        assert_eq!(config.num_clients, 4);
        assert_eq!(config.steps, 1000);
        assert_eq!(config.inner_steps, 50);
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.fairness, FairnessMode::Both);
        assert_eq!(config.max_grad_norm, 50.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_clients() {
        let config = RunConfig::default().with_clients(0);
        assert!(matches!(config.validate(), Err(FairHnError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_batch_and_eval() {
        assert!(RunConfig::default().with_batch_size(0).validate().is_err());
        assert!(RunConfig::default().with_eval_every(0).validate().is_err());
        assert!(RunConfig::default().with_steps(0).validate().is_err());
    }

    #[test]
    fn test_unknown_names_are_config_errors() {
        assert!(matches!("mnist".parse::<DatasetName>(), Err(FairHnError::Config(_))));
        assert!(matches!("cnn".parse::<ModelKind>(), Err(FairHnError::Config(_))));
        assert!(matches!("both ".parse::<FairnessMode>(), Err(FairHnError::Config(_))));
        assert_eq!("LR".parse::<ModelKind>().unwrap(), ModelKind::Lr);
        assert_eq!("eo".parse::<FairnessMode>().unwrap(), FairnessMode::Eo);
    }

    #[test]
    fn test_eval_schedule() {
        let config = RunConfig::default().with_steps(120).with_eval_every(50);
        let evals: Vec<usize> = (0..120).filter(|s| config.is_eval_step(*s)).collect();
        assert_eq!(evals, vec![0, 49, 99, 119]);
    }

    #[test]
    fn test_json_partial_config() {
        let config = RunConfig::from_json(r#"{"model": "LR", "fairness": "dp", "seed": 3}"#).unwrap();
        assert_eq!(config.model, ModelKind::Lr);
        assert_eq!(config.fairness, FairnessMode::Dp);
        assert_eq!(config.seed, 3);
        assert_eq!(config.inner_steps, 50);

        let json = config.to_json().unwrap();
        let parsed = RunConfig::from_json(&json).unwrap();
        assert_eq!(parsed.model, ModelKind::Lr);
    }

    #[test]
    fn test_context_encoder_names() {
        assert_eq!("mean".parse::<ContextKind>().unwrap(), ContextKind::Mean);
        assert!("pca".parse::<ContextKind>().is_err());
        let config = RunConfig::from_json(r#"{"context_encoder": "mean"}"#).unwrap();
        assert_eq!(config.context_encoder, ContextKind::Mean);
    }
}
