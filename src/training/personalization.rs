//! Personalization loop
//!
//! One outer step:
//!
//! 1. pick a client uniformly at random
//! 2. encode the context of a fresh batch, generate that client's weights and
//!    load them into the client model
//! 3. train the client model locally for `inner_steps` steps with a fresh
//!    Adam, fairness penalty included
//! 4. `delta = generated - trained`, pulled back through the hypernetwork as
//!    the upstream gradient of the generated weights
//! 5. clip and take one outer Adam step on the hypernetwork
//!
//! Evaluation runs on `RunConfig::is_eval_step` steps and once more after the
//! last step.

use super::{
    check_gradients_health, clip_grad_norm, reproject, weight_delta, AdamOptimizer, LossTracker,
};
use crate::config::RunConfig;
use crate::data::ClientDataProvider;
use crate::evaluation::{EvalSnapshot, Evaluator};
use crate::fairness::select_regularizer;
use crate::models::{build_models, ClientModel, HyperNetwork, ModelDims, WeightBundle};
use crate::primitives::{bce_with_logits, resolve_device, scalar, seeded_rng, RngStream};
use crate::sink::MetricsSink;
use crate::{FairHnError, Result};
use candle_core::Device;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Statistics of one outer step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step: usize,
    pub client: usize,
    pub regularizer: Option<String>,
    /// Mean local loss over the inner steps
    pub inner_loss: f32,
    /// Local loss of the last inner step
    pub final_inner_loss: f32,
    /// L2 norm of the weight delta
    pub delta_norm: f32,
    /// Hypernetwork gradient norm before clipping
    pub outer_grad_norm: f32,
}

impl StepReport {
    pub fn scalars(&self) -> Vec<(String, f32)> {
        vec![
            ("client".to_string(), self.client as f32),
            ("inner_loss".to_string(), self.inner_loss),
            ("final_inner_loss".to_string(), self.final_inner_loss),
            ("delta_norm".to_string(), self.delta_norm),
            ("outer_grad_norm".to_string(), self.outer_grad_norm),
        ]
    }
}

/// Outcome of a full run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub steps: usize,
    /// Scheduled evaluations in step order
    pub snapshots: Vec<EvalSnapshot>,
    /// Evaluation after the last step
    pub final_eval: EvalSnapshot,
    pub best_inner_loss: Option<f32>,
}

/// Hypernetwork, client model and optimizer state of one training run
pub struct PersonalizationLoop {
    config: RunConfig,
    device: Device,
    dims: ModelDims,
    hnet: Box<dyn HyperNetwork>,
    model: Box<dyn ClientModel>,
    outer: AdamOptimizer,
    selection_rng: StdRng,
    batch_rng: StdRng,
    dropout_rng: StdRng,
    losses: LossTracker,
    step: usize,
}

impl PersonalizationLoop {
    /// Validate `config` against `provider` and build the models
    pub fn new(config: RunConfig, provider: &dyn ClientDataProvider) -> Result<Self> {
        config.validate()?;
        if provider.num_clients() != config.num_clients {
            return Err(FairHnError::Config(format!(
                "config expects {} clients, data provides {}",
                config.num_clients,
                provider.num_clients()
            )));
        }

        let device = resolve_device(config.device)?;
        let dims = ModelDims::from_config(&config, provider.feature_dim());
        let mut init_rng = seeded_rng(config.seed, RngStream::Init);
        let (hnet, model) = build_models(config.model, &dims, &mut init_rng, &device)?;
        let outer = AdamOptimizer::new(hnet.vars(), config.lr, config.wd)?;

        info!(
            "Personalization loop ready: {} clients, {} outer steps x {} inner steps, fairness {}",
            config.num_clients, config.steps, config.inner_steps, config.fairness
        );

        Ok(Self {
            selection_rng: seeded_rng(config.seed, RngStream::ClientSelection),
            batch_rng: seeded_rng(config.seed, RngStream::Batches),
            dropout_rng: seeded_rng(config.seed, RngStream::Dropout),
            config,
            device,
            dims,
            hnet,
            model,
            outer,
            losses: LossTracker::new(),
            step: 0,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dims(&self) -> &ModelDims {
        &self.dims
    }

    pub fn hypernet(&self) -> &dyn HyperNetwork {
        self.hnet.as_ref()
    }

    pub fn client_model(&self) -> &dyn ClientModel {
        self.model.as_ref()
    }

    /// Outer steps taken so far
    pub fn step(&self) -> usize {
        self.step
    }

    /// Run one outer step on a randomly selected client
    pub fn outer_step(&mut self, provider: &dyn ClientDataProvider) -> Result<StepReport> {
        let client = self.selection_rng.gen_range(0..self.config.num_clients);
        self.outer_step_for(provider, client)
    }

    /// Run one outer step on `client`
    pub fn outer_step_for(&mut self, provider: &dyn ClientDataProvider, client: usize) -> Result<StepReport> {
        let regularizer = select_regularizer(&self.config, client);
        let vars = self.model.vars();

        let mut batch = provider.train_batch(client, &mut self.batch_rng)?;
        let context = self.model.context(&batch.x)?.detach();
        let bundle = self.hnet.generate(&context, client)?;
        self.model.load(&bundle)?;
        let inner_state = self.model.store().snapshot(bundle.keys())?;
        let mut inner_opt = AdamOptimizer::new(vars.clone(), self.config.inner_lr, self.config.inner_wd)?;

        let mut loss_sum = 0.0f32;
        let mut last_loss = 0.0f32;
        for inner in 0..self.config.inner_steps {
            if inner > 0 {
                batch = provider.train_batch(client, &mut self.batch_rng)?;
            }

            let logits = self.model.predict(&batch.x, Some(&mut self.dropout_rng))?;
            let mut loss = bce_with_logits(&logits, &batch.y)?;
            if let Some(reg) = &regularizer {
                loss = (loss + reg.penalty(&batch.x, &logits, &batch.s, &batch.y)?)?;
            }

            let value = scalar(&loss)?;
            if !value.is_finite() {
                return Err(FairHnError::Training(format!(
                    "non-finite local loss {} at step {} (client {}, inner step {})",
                    value, self.step, client, inner
                )));
            }
            loss_sum += value;
            last_loss = value;

            let mut grads = loss
                .backward()
                .map_err(|e| FairHnError::Training(format!("local backward failed: {}", e)))?;
            clip_grad_norm(&mut grads, &vars, self.config.max_grad_norm)?;
            inner_opt.step(&grads)?;
        }

        let final_state = self.model.store().snapshot(bundle.keys())?;
        let delta = weight_delta(&inner_state, &final_state)?;
        let delta_norm = bundle_norm(&delta)?;

        let hnet_vars = self.hnet.vars();
        let mut grads = reproject(&bundle, &delta)?;
        if !check_gradients_health(&grads, &hnet_vars) {
            return Err(FairHnError::Training(format!(
                "non-finite hypernetwork gradient at step {} (client {})",
                self.step, client
            )));
        }
        let outer_grad_norm = clip_grad_norm(&mut grads, &hnet_vars, self.config.max_grad_norm)?;
        self.outer.step(&grads)?;

        let inner_loss = loss_sum / self.config.inner_steps as f32;
        self.losses.record(inner_loss);

        let report = StepReport {
            step: self.step,
            client,
            regularizer: regularizer.map(|r| r.name().to_string()),
            inner_loss,
            final_inner_loss: last_loss,
            delta_norm,
            outer_grad_norm,
        };
        debug!(
            "step {} client {}: inner loss {:.4}, |delta| {:.4}, |grad| {:.4}",
            report.step, client, inner_loss, delta_norm, outer_grad_norm
        );
        self.step += 1;
        Ok(report)
    }

    /// Evaluate every client with the current hypernetwork
    pub fn evaluate(&self, provider: &dyn ClientDataProvider) -> Result<EvalSnapshot> {
        self.evaluate_at(provider, self.step)
    }

    fn evaluate_at(&self, provider: &dyn ClientDataProvider, step: usize) -> Result<EvalSnapshot> {
        Evaluator::new(self.hnet.as_ref(), self.model.as_ref(), &self.config).evaluate(provider, step)
    }

    /// Run the remaining outer steps with scheduled evaluations
    pub fn run(&mut self, provider: &dyn ClientDataProvider, sink: &mut dyn MetricsSink) -> Result<RunSummary> {
        let mut snapshots = Vec::new();

        while self.step < self.config.steps {
            let step = self.step;
            let report = self.outer_step(provider)?;
            sink.record("train", step, &report.scalars())?;

            if self.config.is_eval_step(step) {
                let snapshot = self.evaluate_at(provider, step)?;
                sink.record("eval", step, &snapshot.scalars())?;
                info!(
                    "Step {}/{}: avg loss {:.4}, avg accuracy {:.4}",
                    step + 1,
                    self.config.steps,
                    snapshot.avg_loss,
                    snapshot.avg_accuracy
                );
                snapshots.push(snapshot);
            }
        }

        let final_eval = self.evaluate(provider)?;
        sink.record("final", self.step, &final_eval.scalars())?;
        sink.flush()?;
        info!(
            "✅ Finished {} steps: avg loss {:.4}, avg accuracy {:.4}",
            self.step, final_eval.avg_loss, final_eval.avg_accuracy
        );

        Ok(RunSummary {
            steps: self.step,
            snapshots,
            final_eval,
            best_inner_loss: self.losses.best_loss(),
        })
    }
}

/// Joint L2 norm of every tensor in a bundle
fn bundle_norm(bundle: &WeightBundle) -> Result<f32> {
    let mut total = 0.0f32;
    for (name, tensor) in bundle.iter() {
        let sq = tensor
            .sqr()
            .and_then(|t| t.sum_all())
            .and_then(|t| t.to_scalar::<f32>())
            .map_err(|e| FairHnError::Tensor(format!("norm of '{}' failed: {}", name, e)))?;
        total += sq;
    }
    Ok(total.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FairnessMode, ModelKind};
    use crate::data::{ClientPartition, InMemoryProvider, Record};
    use crate::sink::MemorySink;

    fn provider() -> InMemoryProvider {
        let client = |offset: f32| {
            let records: Vec<Record> = (0..4)
                .map(|i| {
                    Record::new(
                        vec![offset + i as f32 * 0.25, (i % 2) as f32],
                        (i % 2) as f32,
                        (i / 2) as f32,
                    )
                })
                .collect();
            ClientPartition::new(records.clone(), records)
        };
        InMemoryProvider::new(vec![client(0.0), client(0.5)], 4, Device::Cpu).unwrap()
    }

    fn config() -> RunConfig {
        RunConfig::default()
            .with_clients(2)
            .with_steps(5)
            .with_inner_steps(2)
            .with_batch_size(4)
            .with_hypernet(8, 1)
            .with_fairness(FairnessMode::None)
    }

    fn hnet_values(run: &PersonalizationLoop) -> Vec<Vec<f32>> {
        run.hypernet()
            .store()
            .iter()
            .map(|(_, var)| var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_end_to_end_run() {
        let provider = provider();
        let mut sink = MemorySink::new();
        let mut run = PersonalizationLoop::new(config(), &provider).unwrap();

        let summary = run.run(&provider, &mut sink).unwrap();

        assert_eq!(summary.steps, 5);
        // Evaluations at step 0 and at the last step
        assert_eq!(summary.snapshots.len(), 2);
        assert_eq!(summary.snapshots[1].step, 4);
        assert_eq!(summary.final_eval.clients.len(), 2);
        assert!((0.0..=1.0).contains(&summary.final_eval.avg_accuracy));
        assert!(summary.best_inner_loss.unwrap().is_finite());

        assert_eq!(sink.tagged("train").len(), 5);
        assert_eq!(sink.tagged("eval").len(), 2);
        assert_eq!(sink.tagged("final").len(), 1);
    }

    #[test]
    fn test_seeded_runs_are_identical() {
        let provider = provider();
        let run_once = || {
            let mut run = PersonalizationLoop::new(config().with_seed(11), &provider).unwrap();
            let mut sink = MemorySink::new();
            run.run(&provider, &mut sink).unwrap();
            hnet_values(&run)
        };
        assert_eq!(run_once(), run_once());
    }

    #[test]
    fn test_outer_step_moves_hypernetwork() {
        let provider = provider();
        let mut run = PersonalizationLoop::new(config().with_fairness(FairnessMode::Both), &provider).unwrap();
        let before = hnet_values(&run);

        let report = run.outer_step_for(&provider, 1).unwrap();
        assert_eq!(report.client, 1);
        assert_eq!(report.regularizer.as_deref(), Some("equalized_odds"));
        assert!(report.inner_loss.is_finite());
        assert!(report.outer_grad_norm.is_finite());
        assert_eq!(run.step(), 1);

        assert_ne!(before, hnet_values(&run));
    }

    #[test]
    fn test_tiny_clip_ceiling_still_updates() {
        let provider = provider();
        let mut cfg = config();
        cfg.max_grad_norm = 1e-3;
        let mut run = PersonalizationLoop::new(cfg, &provider).unwrap();
        let before = hnet_values(&run);

        let report = run.outer_step_for(&provider, 0).unwrap();
        assert!(report.delta_norm > 0.0);
        assert_ne!(before, hnet_values(&run));
    }

    #[test]
    fn test_lr_client_trains() {
        let provider = provider();
        let mut run =
            PersonalizationLoop::new(config().with_model(ModelKind::Lr).with_steps(2), &provider).unwrap();
        let mut sink = MemorySink::new();
        let summary = run.run(&provider, &mut sink).unwrap();
        assert_eq!(summary.steps, 2);
    }

    #[test]
    fn test_client_count_mismatch_is_config_error() {
        let provider = provider();
        let err = PersonalizationLoop::new(config().with_clients(4), &provider).err().unwrap();
        assert!(matches!(err, FairHnError::Config(_)));
    }
}
