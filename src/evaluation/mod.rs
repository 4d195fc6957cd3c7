//! Evaluation
//!
//! Frozen per-client evaluation of the current hypernetwork. For every test
//! batch the context is recomputed from that batch, the hypernetwork
//! generates a fresh bundle, and the client model predicts without dropout.
//! Nothing here produces gradients or touches the hypernetwork's variables.
//!
//! Aggregate accuracy pools every client's test records; aggregate loss is
//! the mean of per-client losses. With fairness enabled, a client's loss
//! includes the penalty of the regularizer that client trains with, so in
//! `both` mode even and odd clients report different penalties.

use crate::config::RunConfig;
use crate::data::ClientDataProvider;
use crate::fairness::{select_regularizer, FairnessReport, StratifiedConfusion};
use crate::models::{ClientModel, HyperNetwork};
use crate::primitives::{bce_with_logits, scalar, sigmoid, to_host};
use crate::{FairHnError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Decision threshold on predicted probabilities
pub const THRESHOLD: f32 = 0.5;

/// Evaluation result of one client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEval {
    pub client: usize,
    /// Mean of per-batch losses, fairness penalty included when enabled
    pub loss: f32,
    pub correct: usize,
    pub total: usize,
    pub accuracy: f32,
    /// Hard predictions in test order
    pub predictions: Vec<f32>,
    pub labels: Vec<f32>,
    pub sensitive: Vec<f32>,
    pub fairness: FairnessReport,
}

/// Evaluation of every client at one outer step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalSnapshot {
    pub step: usize,
    pub avg_loss: f32,
    pub avg_accuracy: f32,
    pub clients: Vec<ClientEval>,
}

impl EvalSnapshot {
    fn from_clients(step: usize, clients: Vec<ClientEval>) -> Self {
        let n = clients.len().max(1) as f32;
        let avg_loss = clients.iter().map(|c| c.loss).sum::<f32>() / n;
        let correct: usize = clients.iter().map(|c| c.correct).sum();
        let total: usize = clients.iter().map(|c| c.total).sum();
        let avg_accuracy = if total == 0 { 0.0 } else { correct as f32 / total as f32 };
        Self {
            step,
            avg_loss,
            avg_accuracy,
            clients,
        }
    }

    /// Flat `(name, value)` view for metric sinks
    pub fn scalars(&self) -> Vec<(String, f32)> {
        let mut out = vec![
            ("avg_loss".to_string(), self.avg_loss),
            ("avg_accuracy".to_string(), self.avg_accuracy),
        ];
        for client in &self.clients {
            let prefix = format!("client{}", client.client);
            out.push((format!("{}/loss", prefix), client.loss));
            out.push((format!("{}/accuracy", prefix), client.accuracy));
            for (name, value) in client.fairness.scalars() {
                out.push((format!("{}/fairness/{}", prefix, name), value));
            }
        }
        out
    }
}

/// Evaluates a hypernetwork / client model pair on every client's test data
pub struct Evaluator<'a> {
    hnet: &'a dyn HyperNetwork,
    model: &'a dyn ClientModel,
    config: &'a RunConfig,
}

impl<'a> Evaluator<'a> {
    pub fn new(hnet: &'a dyn HyperNetwork, model: &'a dyn ClientModel, config: &'a RunConfig) -> Self {
        Self { hnet, model, config }
    }

    /// Evaluate one client over all of its test batches
    pub fn evaluate_client(&self, provider: &dyn ClientDataProvider, client: usize) -> Result<ClientEval> {
        let regularizer = select_regularizer(self.config, client);
        let batches = provider.test_batches(client)?;
        if batches.is_empty() {
            return Err(FairHnError::Data(format!("client {} has no test batches", client)));
        }

        let mut running_loss = 0.0f32;
        let mut predictions = Vec::new();
        let mut labels = Vec::new();
        let mut sensitive = Vec::new();

        for batch in &batches {
            let context = self.model.context(&batch.x)?.detach();
            let bundle = self.hnet.generate(&context, client)?.detached()?;
            self.model.load(&bundle)?;

            let logits = self.model.forward(&batch.x, &context, None)?.detach();
            let mut loss = scalar(&bce_with_logits(&logits, &batch.y)?)?;
            if let Some(reg) = &regularizer {
                loss += scalar(&reg.penalty(&batch.x, &logits, &batch.s, &batch.y)?)?;
            }
            running_loss += loss;

            let probs = to_host(&sigmoid(&logits)?)?;
            predictions.extend(probs.iter().map(|p| if *p > THRESHOLD { 1.0 } else { 0.0 }));
            labels.extend_from_slice(&batch.labels);
            sensitive.extend_from_slice(&batch.sensitive);
        }

        let total = labels.len();
        let correct = predictions
            .iter()
            .zip(&labels)
            .filter(|(p, y)| (**p > THRESHOLD) == (**y > THRESHOLD))
            .count();
        let accuracy = correct as f32 / total as f32;
        let fairness =
            FairnessReport::from_confusion(&StratifiedConfusion::from_predictions(&predictions, &labels, &sensitive));

        debug!(
            "client {}: loss {:.4}, accuracy {:.4} ({}/{})",
            client, running_loss / batches.len() as f32, accuracy, correct, total
        );

        Ok(ClientEval {
            client,
            loss: running_loss / batches.len() as f32,
            correct,
            total,
            accuracy,
            predictions,
            labels,
            sensitive,
            fairness,
        })
    }

    /// Evaluate every client, tagging the result with `step`
    pub fn evaluate(&self, provider: &dyn ClientDataProvider, step: usize) -> Result<EvalSnapshot> {
        let clients = (0..provider.num_clients())
            .map(|client| self.evaluate_client(provider, client))
            .collect::<Result<Vec<_>>>()?;
        Ok(EvalSnapshot::from_clients(step, clients))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FairnessMode, ModelKind};
    use crate::data::{ClientPartition, InMemoryProvider, Record};
    use crate::models::{build_models, ModelDims};
    use crate::primitives::{seeded_rng, RngStream};
    use candle_core::Device;

    fn provider() -> InMemoryProvider {
        let client = |offset: f32| {
            let records: Vec<Record> = (0..6)
                .map(|i| {
                    Record::new(
                        vec![offset + i as f32 * 0.1, 1.0 - i as f32 * 0.2],
                        (i % 2) as f32,
                        (i / 3) as f32,
                    )
                })
                .collect();
            ClientPartition::new(records[..4].to_vec(), records.clone())
        };
        InMemoryProvider::new(vec![client(0.0), client(1.0)], 4, Device::Cpu).unwrap()
    }

    fn config() -> RunConfig {
        RunConfig::default().with_clients(2).with_hypernet(8, 1)
    }

    #[test]
    fn test_evaluate_covers_every_client() {
        let provider = provider();
        let config = config();
        let dims = ModelDims::from_config(&config, 2);
        let mut rng = seeded_rng(0, RngStream::Init);
        let (hnet, model) = build_models(ModelKind::Nn, &dims, &mut rng, &Device::Cpu).unwrap();

        let snapshot = Evaluator::new(hnet.as_ref(), model.as_ref(), &config)
            .evaluate(&provider, 7)
            .unwrap();

        assert_eq!(snapshot.step, 7);
        assert_eq!(snapshot.clients.len(), 2);
        for client in &snapshot.clients {
            assert_eq!(client.total, 6);
            assert_eq!(client.predictions.len(), 6);
            assert!((0.0..=1.0).contains(&client.accuracy));
            assert!(client.loss.is_finite());
        }
        assert!((0.0..=1.0).contains(&snapshot.avg_accuracy));
    }

    #[test]
    fn test_evaluation_is_frozen_and_deterministic() {
        let provider = provider();
        let config = config().with_fairness(FairnessMode::Dp);
        let dims = ModelDims::from_config(&config, 2);
        let mut rng = seeded_rng(0, RngStream::Init);
        let (hnet, model) = build_models(ModelKind::Lr, &dims, &mut rng, &Device::Cpu).unwrap();
        let before = hnet.store().snapshot_all().unwrap();

        let evaluator = Evaluator::new(hnet.as_ref(), model.as_ref(), &config);
        let a = evaluator.evaluate(&provider, 0).unwrap();
        let b = evaluator.evaluate(&provider, 0).unwrap();

        assert_eq!(a.avg_loss, b.avg_loss);
        assert_eq!(a.clients[1].predictions, b.clients[1].predictions);

        let after = hnet.store().snapshot_all().unwrap();
        for (name, tensor) in before.iter() {
            let x = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let y = after.get(name).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(x, y, "hypernetwork parameter {} changed during evaluation", name);
        }
    }

    #[test]
    fn test_scalars_are_prefixed_per_client() {
        let provider = provider();
        let config = config();
        let dims = ModelDims::from_config(&config, 2);
        let mut rng = seeded_rng(0, RngStream::Init);
        let (hnet, model) = build_models(ModelKind::Nn, &dims, &mut rng, &Device::Cpu).unwrap();

        let snapshot = Evaluator::new(hnet.as_ref(), model.as_ref(), &config)
            .evaluate(&provider, 0)
            .unwrap();
        let names: Vec<String> = snapshot.scalars().into_iter().map(|(n, _)| n).collect();

        assert!(names.contains(&"avg_accuracy".to_string()));
        assert!(names.contains(&"client1/accuracy".to_string()));
        assert!(names.contains(&"client0/fairness/accuracy".to_string()));
    }

    #[test]
    fn test_avg_accuracy_pools_records_across_clients() {
        let record = |i: usize| {
            let label = if i % 3 == 0 { 1.0 } else { 0.0 };
            Record::new(vec![i as f32 * 0.3, 1.0 - i as f32 * 0.1], label, (i % 2) as f32)
        };
        let small = ClientPartition::new(vec![record(0), record(1)], vec![record(1)]);
        let large = ClientPartition::new(vec![record(2), record(3)], (0..9).map(record).collect());
        let provider = InMemoryProvider::new(vec![small, large], 4, Device::Cpu).unwrap();

        let config = config();
        let dims = ModelDims::from_config(&config, 2);
        let mut rng = seeded_rng(3, RngStream::Init);
        let (hnet, model) = build_models(ModelKind::Lr, &dims, &mut rng, &Device::Cpu).unwrap();

        let snapshot = Evaluator::new(hnet.as_ref(), model.as_ref(), &config)
            .evaluate(&provider, 0)
            .unwrap();

        assert_eq!(snapshot.clients[0].total, 1);
        assert_eq!(snapshot.clients[1].total, 9);
        let correct: usize = snapshot.clients.iter().map(|c| c.correct).sum();
        assert!((snapshot.avg_accuracy - correct as f32 / 10.0).abs() < 1e-6);

        let mean_loss = (snapshot.clients[0].loss + snapshot.clients[1].loss) / 2.0;
        assert!((snapshot.avg_loss - mean_loss).abs() < 1e-6);
    }

    #[test]
    fn test_avg_accuracy_of_no_clients_is_zero() {
        let snapshot = EvalSnapshot::from_clients(0, Vec::new());
        assert_eq!(snapshot.avg_accuracy, 0.0);
        assert_eq!(snapshot.avg_loss, 0.0);
    }
}
