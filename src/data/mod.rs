//! Client Data
//!
//! Per-client train and test partitions and the batches the training loop
//! consumes.
//!
//! ## Overview
//!
//! - [`ClientDataProvider`]: the boundary the loop and the evaluator read from
//! - [`InMemoryProvider`]: partitions held in memory, seeded batch sampling
//! - [`csv`]: parser for already-encoded numeric CSV files
//! - [`partition`]: splits records into client groups by a feature rule
//!
//! Cleaning and encoding of the raw Adult/COMPAS files happens before this
//! crate sees them; every column here is already numeric.

pub mod csv;
pub mod partition;

pub use self::csv::{parse_table, Dataset, NumericTable};
pub use partition::{build_client_partitions, GroupPredicate, GroupRule};

use crate::config::RunConfig;
use crate::primitives::{seeded_rng, RngStream};
use crate::{FairHnError, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use tracing::info;

// =============================================================================
// Records and batches
// =============================================================================

/// One tabular example
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub features: Vec<f32>,
    /// Binary label (0 or 1)
    pub label: f32,
    /// Binary sensitive attribute (0 = female stratum, 1 = male stratum)
    pub sensitive: f32,
}

impl Record {
    pub fn new(features: Vec<f32>, label: f32, sensitive: f32) -> Self {
        Self {
            features,
            label,
            sensitive,
        }
    }
}

/// A batch ready for the models
///
/// `x` is `[N, D]`, `y` is `[N, 1]`, `s` is `[N]`. Labels and sensitive values
/// are also kept on the host for group statistics.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Tensor,
    pub y: Tensor,
    pub s: Tensor,
    pub labels: Vec<f32>,
    pub sensitive: Vec<f32>,
}

impl Batch {
    /// Stack records into tensors on `device`
    pub fn from_records(records: &[&Record], device: &Device) -> Result<Self> {
        let n = records.len();
        if n == 0 {
            return Err(FairHnError::Data("cannot build an empty batch".into()));
        }
        let dim = records[0].features.len();

        let mut features = Vec::with_capacity(n * dim);
        let mut labels = Vec::with_capacity(n);
        let mut sensitive = Vec::with_capacity(n);
        for record in records {
            if record.features.len() != dim {
                return Err(FairHnError::Data(format!(
                    "feature width mismatch in batch: {} vs {}",
                    record.features.len(),
                    dim
                )));
            }
            features.extend_from_slice(&record.features);
            labels.push(record.label);
            sensitive.push(record.sensitive);
        }

        let x = Tensor::from_vec(features, (n, dim), device)
            .map_err(|e| FairHnError::Tensor(format!("batch features failed: {}", e)))?;
        let y = Tensor::from_vec(labels.clone(), (n, 1), device)
            .map_err(|e| FairHnError::Tensor(format!("batch labels failed: {}", e)))?;
        let s = Tensor::from_vec(sensitive.clone(), n, device)
            .map_err(|e| FairHnError::Tensor(format!("batch sensitive failed: {}", e)))?;

        Ok(Self {
            x,
            y,
            s,
            labels,
            sensitive,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Disjoint train and test records of one client
#[derive(Debug, Clone, Default)]
pub struct ClientPartition {
    pub train: Vec<Record>,
    pub test: Vec<Record>,
}

impl ClientPartition {
    pub fn new(train: Vec<Record>, test: Vec<Record>) -> Self {
        Self { train, test }
    }
}

// =============================================================================
// Provider boundary
// =============================================================================

/// Source of per-client batches
pub trait ClientDataProvider {
    /// Number of clients; ids are `0..num_clients()`
    fn num_clients(&self) -> usize;

    /// Width of every feature vector
    fn feature_dim(&self) -> usize;

    /// Draw a fresh training batch for `client`
    ///
    /// Every call is an independent draw, so an arbitrary number of inner
    /// steps never exhausts the partition.
    fn train_batch(&self, client: usize, rng: &mut StdRng) -> Result<Batch>;

    /// The client's held-out data as ordered batches
    fn test_batches(&self, client: usize) -> Result<Vec<Batch>>;
}

/// Provider over in-memory client partitions
pub struct InMemoryProvider {
    partitions: Vec<ClientPartition>,
    feature_dim: usize,
    batch_size: usize,
    device: Device,
}

impl InMemoryProvider {
    /// Validate partitions and build the provider
    ///
    /// Every client needs at least one train and one test record and all
    /// records must share one feature width.
    pub fn new(partitions: Vec<ClientPartition>, batch_size: usize, device: Device) -> Result<Self> {
        if partitions.is_empty() {
            return Err(FairHnError::Config("no client partitions".into()));
        }
        if batch_size == 0 {
            return Err(FairHnError::Config("batch_size must be at least 1".into()));
        }

        let feature_dim = partitions[0]
            .train
            .first()
            .map(|r| r.features.len())
            .ok_or_else(|| FairHnError::Data("client 0 has an empty train partition".into()))?;

        for (client, partition) in partitions.iter().enumerate() {
            if partition.train.is_empty() {
                return Err(FairHnError::Data(format!(
                    "client {} has an empty train partition",
                    client
                )));
            }
            if partition.test.is_empty() {
                return Err(FairHnError::Data(format!(
                    "client {} has an empty test partition",
                    client
                )));
            }
            let bad_width = partition
                .train
                .iter()
                .chain(partition.test.iter())
                .find(|r| r.features.len() != feature_dim);
            if let Some(record) = bad_width {
                return Err(FairHnError::Data(format!(
                    "client {} has a record with {} features, expected {}",
                    client,
                    record.features.len(),
                    feature_dim
                )));
            }
        }

        Ok(Self {
            partitions,
            feature_dim,
            batch_size,
            device,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn partition(&self, client: usize) -> Result<&ClientPartition> {
        self.partitions.get(client).ok_or_else(|| {
            FairHnError::Data(format!(
                "client {} out of range (num_clients = {})",
                client,
                self.partitions.len()
            ))
        })
    }
}

impl ClientDataProvider for InMemoryProvider {
    fn num_clients(&self) -> usize {
        self.partitions.len()
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn train_batch(&self, client: usize, rng: &mut StdRng) -> Result<Batch> {
        let train = &self.partition(client)?.train;
        let take = self.batch_size.min(train.len());

        // First batch of a freshly shuffled pass over the partition
        let picked: Vec<&Record> = rand::seq::index::sample(rng, train.len(), take)
            .iter()
            .map(|i| &train[i])
            .collect();

        Batch::from_records(&picked, &self.device)
    }

    fn test_batches(&self, client: usize) -> Result<Vec<Batch>> {
        let test = &self.partition(client)?.test;
        test.chunks(self.batch_size)
            .map(|chunk| {
                let refs: Vec<&Record> = chunk.iter().collect();
                Batch::from_records(&refs, &self.device)
            })
            .collect()
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Load client partitions from the CSV files named in `config.data`
///
/// The train file is required. Without a test file, `holdout_per_group`
/// records of each group are held out for testing.
pub fn load_client_partitions(config: &RunConfig) -> Result<Vec<ClientPartition>> {
    let data = &config.data;
    let train_path = data
        .train_path
        .as_ref()
        .ok_or_else(|| FairHnError::Config("data.train_path is required".into()))?;

    let label = data
        .label_column
        .clone()
        .unwrap_or_else(|| config.dataset.label_column().to_string());
    let sensitive = data
        .sensitive_column
        .clone()
        .unwrap_or_else(|| config.dataset.sensitive_column().to_string());

    let train = csv::read_table(train_path)?.into_dataset(&label, &sensitive)?;
    let test = match &data.test_path {
        Some(path) => Some(csv::read_table(path)?.into_dataset(&label, &sensitive)?),
        None => None,
    };

    info!(
        "Loaded {} train records ({} features) for {}",
        train.records.len(),
        train.feature_names.len(),
        config.dataset
    );

    let mut rng = seeded_rng(config.seed, RngStream::Partition);
    build_client_partitions(
        &train,
        test.as_ref(),
        &config.dataset.group_rule(),
        config.num_clients,
        data.holdout_per_group,
        &mut rng,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn partition(n_train: usize, n_test: usize, offset: f32) -> ClientPartition {
        let record = |i: usize| {
            Record::new(vec![offset + i as f32, 1.0], (i % 2) as f32, ((i / 2) % 2) as f32)
        };
        ClientPartition::new(
            (0..n_train).map(record).collect(),
            (0..n_test).map(record).collect(),
        )
    }

    #[test]
    fn test_train_batch_caps_at_partition_size() {
        let provider = InMemoryProvider::new(vec![partition(5, 3, 0.0)], 256, Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        let batch = provider.train_batch(0, &mut rng).unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch.x.dims(), &[5, 2]);
        assert_eq!(batch.y.dims(), &[5, 1]);
        assert_eq!(batch.s.dims(), &[5]);
    }

    #[test]
    fn test_repeated_draws_never_starve() {
        let provider = InMemoryProvider::new(vec![partition(4, 2, 0.0)], 3, Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert_eq!(provider.train_batch(0, &mut rng).unwrap().len(), 3);
        }
    }

    #[test]
    fn test_sampling_is_seeded() {
        let provider = InMemoryProvider::new(vec![partition(20, 2, 0.0)], 4, Device::Cpu).unwrap();
        let a = provider.train_batch(0, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = provider.train_batch(0, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(
            a.x.to_vec2::<f32>().unwrap(),
            b.x.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_test_batches_are_ordered_chunks() {
        let provider = InMemoryProvider::new(vec![partition(2, 5, 0.0)], 2, Device::Cpu).unwrap();
        let batches = provider.test_batches(0).unwrap();
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(batches[2].x.to_vec2::<f32>().unwrap()[0][0], 4.0);
    }

    #[test]
    fn test_empty_partition_fails_fast() {
        let err = InMemoryProvider::new(
            vec![partition(3, 2, 0.0), partition(3, 0, 0.0)],
            2,
            Device::Cpu,
        )
        .err()
        .unwrap();
        assert!(matches!(err, FairHnError::Data(_)));
    }

    #[test]
    fn test_width_mismatch_fails_fast() {
        let mut bad = partition(3, 2, 0.0);
        bad.test[1].features.push(9.0);
        assert!(InMemoryProvider::new(vec![bad], 2, Device::Cpu).is_err());
    }

    #[test]
    fn test_out_of_range_client() {
        let provider = InMemoryProvider::new(vec![partition(3, 2, 0.0)], 2, Device::Cpu).unwrap();
        assert!(provider.test_batches(1).is_err());
    }

    #[test]
    fn test_missing_train_path_is_config_error() {
        let err = load_client_partitions(&RunConfig::default()).unwrap_err();
        assert!(matches!(err, FairHnError::Config(_)));
    }
}
