//! # fair-hypernet
//!
//! Personalized federated learning with context-conditioned hypernetworks and
//! fairness-regularized local training on tabular data.
//!
//! ## Overview
//!
//! A central hypernetwork produces per-client model weights from a learned
//! context embedding of the client's local data. Each outer step a client model
//! is loaded with those weights, trained for a few local steps, and the weight
//! delta it produces is pushed back through the hypernetwork as the upstream
//! gradient of the generated weights.
//!
//! Core capabilities:
//!
//! - **Models**: context encoder, LR/NN client models, hypernetwork, all as
//!   candle `Var`s with seeded initialization
//! - **Fairness**: demographic parity and equalized odds regularizers, plus
//!   stratified fairness metrics (F1, accuracy, AOD, EOD, SPD)
//! - **Training**: the personalization loop with implicit-gradient reprojection
//! - **Evaluation**: frozen per-client evaluation with per-batch context
//! - **Data**: client data providers and a numeric CSV loader/partitioner
//! - **Storage**: safetensors persistence of the trained hypernetwork
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fair_hypernet::prelude::*;
//!
//! let config = RunConfig::default().with_steps(200).with_fairness(FairnessMode::Dp);
//! let provider = InMemoryProvider::new(partitions, config.batch_size, Device::Cpu)?;
//!
//! let mut sink = TracingSink::default();
//! let mut run = PersonalizationLoop::new(config, &provider)?;
//! let summary = run.run(&provider, &mut sink)?;
//! println!("final accuracy: {:.3}", summary.final_eval.avg_accuracy);
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod config;
pub mod data;
pub mod evaluation;
pub mod fairness;
pub mod models;
pub mod primitives;
pub mod sink;
pub mod storage;
pub mod training;

// Re-export candle types for convenience
pub use candle_core::{Device, DType, Tensor, Var};

/// Error types for hypernetwork training
#[derive(Debug, thiserror::Error)]
pub enum FairHnError {
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for hypernetwork training
pub type Result<T> = std::result::Result<T, FairHnError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{Device, DType, Tensor, Var};
    pub use crate::{FairHnError, Result};

    // Configuration
    pub use crate::config::{
        Conditioning, ContextKind, DataConfig, DatasetName, DeviceChoice, FairnessMode, ModelKind, RunConfig,
    };

    // Data
    pub use crate::data::{
        Batch, ClientDataProvider, ClientPartition, GroupRule, InMemoryProvider, Record,
    };

    // Models
    pub use crate::models::{
        build_models, ClientModel, HyperNetwork, ModelDims, ParamSpec, ParameterStore,
        WeightBundle,
    };

    // Fairness
    pub use crate::fairness::{
        select_regularizer, ConfusionCounts, DemographicParityLoss, EqualizedOddsLoss,
        FairnessLoss, FairnessReport,
    };

    // Training
    pub use crate::training::{
        clip_grad_norm, compute_grad_norm, check_gradients_health, reproject, weight_delta,
        AdamOptimizer, PersonalizationLoop, RunSummary,
    };

    // Evaluation
    pub use crate::evaluation::{ClientEval, EvalSnapshot, Evaluator};

    // Sinks and storage
    pub use crate::sink::{JsonlSink, MemorySink, MetricsSink, MultiSink, TracingSink};
    pub use crate::storage::{HypernetStore, RunMetadata};

    // Primitives
    pub use crate::primitives::{bce_with_logits, resolve_device, sigmoid};
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let config = RunConfig::default();
        let device = resolve_device(config.device).unwrap();
        assert!(matches!(device, Device::Cpu));
    }
}
