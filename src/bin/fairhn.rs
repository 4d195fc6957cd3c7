//! fairhn: fairness-regularized personalized hypernetwork training
//!
//! Loads pre-encoded numeric CSV data, splits it into clients, trains the
//! hypernetwork and optionally writes metrics and the trained weights.
//!
//! # Usage
//!
//! ```bash
//! fairhn --data-name compas --train compas_train.csv --test compas_test.csv \
//!     --fair both --steps 1000 --output runs/compas
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use fair_hypernet::data::load_client_partitions;
use fair_hypernet::prelude::*;

/// Personalized federated learning with a fairness-regularized hypernetwork
#[derive(Parser, Debug)]
#[command(name = "fairhn")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run configuration (JSON); flags below override its fields
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Pre-encoded training CSV
    #[arg(long, value_name = "CSV")]
    train: Option<PathBuf>,

    /// Pre-encoded test CSV; without it records are held out per group
    #[arg(long, value_name = "CSV")]
    test: Option<PathBuf>,

    /// Dataset: adult or compas
    #[arg(long = "data-name")]
    data_name: Option<DatasetName>,

    /// Client model: NN or LR
    #[arg(long)]
    model: Option<ModelKind>,

    #[arg(long = "num-clients")]
    num_clients: Option<usize>,

    /// Outer steps
    #[arg(long)]
    steps: Option<usize>,

    /// Local steps per outer step
    #[arg(long = "inner-steps")]
    inner_steps: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long = "inner-lr")]
    inner_lr: Option<f64>,

    #[arg(long)]
    wd: Option<f64>,

    #[arg(long = "inner-wd")]
    inner_wd: Option<f64>,

    /// Hypernetwork hidden width
    #[arg(long = "hyper-hid")]
    hyper_hid: Option<usize>,

    /// Hypernetwork hidden layers
    #[arg(long = "n-hidden")]
    n_hidden: Option<usize>,

    #[arg(long = "batch-size")]
    batch_size: Option<usize>,

    #[arg(long = "eval-every")]
    eval_every: Option<usize>,

    /// Context encoder: learned or mean
    #[arg(long = "context-encoder")]
    context_encoder: Option<ContextKind>,

    /// Fairness mode: none, dp, eo or both
    #[arg(long)]
    fair: Option<FairnessMode>,

    /// Fairness weight for dp/eo
    #[arg(long)]
    alpha: Option<f32>,

    #[arg(long)]
    seed: Option<u64>,

    /// cpu, cuda, metal or auto
    #[arg(long)]
    device: Option<DeviceChoice>,

    /// Directory for metrics.jsonl and the trained hypernetwork
    #[arg(short = 'o', long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Config file (or defaults) with command-line overrides applied
    fn resolve_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config_file {
            Some(path) => RunConfig::from_json_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => RunConfig::default(),
        };

        if let Some(v) = &self.train {
            config.data.train_path = Some(v.clone());
        }
        if let Some(v) = &self.test {
            config.data.test_path = Some(v.clone());
        }
        if let Some(v) = self.data_name {
            config.dataset = v;
        }
        if let Some(v) = self.model {
            config.model = v;
        }
        if let Some(v) = self.num_clients {
            config.num_clients = v;
        }
        if let Some(v) = self.steps {
            config.steps = v;
        }
        if let Some(v) = self.inner_steps {
            config.inner_steps = v;
        }
        if let Some(v) = self.lr {
            config.lr = v;
        }
        if let Some(v) = self.inner_lr {
            config.inner_lr = v;
        }
        if let Some(v) = self.wd {
            config.wd = v;
        }
        if let Some(v) = self.inner_wd {
            config.inner_wd = v;
        }
        if let Some(v) = self.hyper_hid {
            config.hyper_hidden = v;
        }
        if let Some(v) = self.n_hidden {
            config.n_hidden = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.eval_every {
            config.eval_every = v;
        }
        if let Some(v) = self.context_encoder {
            config.context_encoder = v;
        }
        if let Some(v) = self.fair {
            config.fairness = v;
        }
        if let Some(v) = self.alpha {
            config.alpha = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.device {
            config.device = v;
        }

        config.validate().context("Invalid run configuration")?;
        Ok(config)
    }
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fairhn failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = args.resolve_config()?;
    info!(
        "Dataset {}, model {}, {} clients, fairness {}",
        config.dataset, config.model, config.num_clients, config.fairness
    );

    let device = resolve_device(config.device)?;
    let partitions = load_client_partitions(&config).context("Failed to load client data")?;
    let provider = InMemoryProvider::new(partitions, config.batch_size, device.clone())?;

    let mut sink = MultiSink::new().with(TracingSink);
    if let Some(dir) = &args.output {
        sink = sink.with(JsonlSink::create(dir.join("metrics.jsonl"))?);
    }

    let mut trainer = PersonalizationLoop::new(config.clone(), &provider)?;
    let summary = trainer.run(&provider, &mut sink)?;

    for client in &summary.final_eval.clients {
        info!(
            "client {}: accuracy {:.4}, loss {:.4}, {}",
            client.client, client.accuracy, client.loss, client.fairness
        );
    }

    if let Some(dir) = &args.output {
        let metadata =
            RunMetadata::new(&config, trainer.dims(), trainer.hypernet().targets())?.with_summary(&summary);
        HypernetStore::new(dir, device).save(trainer.hypernet(), &metadata)?;
    }

    Ok(())
}
