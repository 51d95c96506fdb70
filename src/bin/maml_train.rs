//! Meta-train a sequence classifier on synthetic few-shot tasks
//!
//! Usage: cargo run --release --bin maml-train -- --iterations 500 --num-updates 2

use anyhow::{Context, Result};
use clap::Parser;
use few_shot_maml::prelude::*;
use few_shot_maml::training::Phase;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(author, version, about = "MAML meta-training on synthetic few-shot tasks")]
struct Cli {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Outer-loop learning rate
    #[arg(long)]
    meta_lr: Option<f64>,

    /// Inner-loop learning rate
    #[arg(long)]
    update_lr: Option<f64>,

    /// Inner-loop steps per task
    #[arg(long)]
    num_updates: Option<usize>,

    /// Support examples per class
    #[arg(short, long)]
    k_shot: Option<usize>,

    /// Classes per task
    #[arg(short, long)]
    num_classes: Option<usize>,

    /// Tasks per meta-iteration
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Request GPU execution (ignored, CPU only)
    #[arg(long)]
    use_gpu: bool,

    /// Use the first-order approximation
    #[arg(long)]
    first_order: bool,

    /// Meta-iterations to run
    #[arg(short, long, default_value = "200")]
    iterations: u64,

    /// Validate every N iterations (0 disables)
    #[arg(long, default_value = "50")]
    eval_interval: u64,

    /// Batches per validation pass
    #[arg(long, default_value = "5")]
    eval_batches: usize,

    /// Vocabulary size of the synthetic tasks
    #[arg(long, default_value = "64")]
    vocab_size: usize,

    /// Padded sequence length of the synthetic tasks
    #[arg(long, default_value = "12")]
    max_len: usize,

    /// Embedding width
    #[arg(long, default_value = "16")]
    embed_dim: usize,

    /// Hidden layer width
    #[arg(long, default_value = "32")]
    hidden_dim: usize,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Write metrics as JSON lines
    #[arg(long)]
    metrics_out: Option<PathBuf>,

    /// Checkpoint file to write
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Resume from a checkpoint
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn meta_config(&self) -> Result<MetaConfig> {
        let mut config = match &self.config {
            Some(path) => MetaConfig::from_json_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => MetaConfig::default(),
        };

        if let Some(lr) = self.meta_lr {
            config.meta_lr = lr;
        }
        if let Some(lr) = self.update_lr {
            config.update_lr = lr;
        }
        if let Some(n) = self.num_updates {
            config.num_updates = n;
        }
        if let Some(k) = self.k_shot {
            config.k_shot = k;
        }
        if let Some(n) = self.num_classes {
            config.num_classes = n;
        }
        if let Some(b) = self.batch_size {
            config.batch_size = b;
        }
        config.use_gpu |= self.use_gpu;
        config.first_order |= self.first_order;

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.meta_config()?;
    info!(?config, "Meta-learning configuration");

    let model = SequenceClassifier::new(ClassifierConfig {
        vocab_size: cli.vocab_size,
        embed_dim: cli.embed_dim,
        hidden_dim: cli.hidden_dim,
        num_classes: config.num_classes,
    });

    let sink: Box<dyn MetricsSink> = match &cli.metrics_out {
        Some(path) => Box::new(
            JsonLinesSink::create(path)
                .with_context(|| format!("creating metrics file {}", path.display()))?,
        ),
        None => Box::new(TracingSink),
    };

    let mut learner = MetaLearner::with_sink(model, config.clone(), cli.seed, sink)?;

    let mut start_step = 0;
    if let Some(path) = &cli.resume {
        let checkpoint = Checkpoint::load(path)
            .with_context(|| format!("loading checkpoint {}", path.display()))?;
        learner.load_weights(&checkpoint.parameters)?;
        start_step = checkpoint.step + 1;
        info!(step = checkpoint.step, "Resumed from checkpoint");
    }

    let sampler_config = SamplerConfig::from_meta(&config)
        .with_vocab_size(cli.vocab_size)
        .with_max_len(cli.max_len);
    let train_tasks = SyntheticTaskSampler::new(sampler_config.clone(), cli.seed.wrapping_add(1))?;
    let validation_tasks = SyntheticTaskSampler::new(sampler_config, cli.seed.wrapping_add(2))?;

    let mut trainer = MetaTrainer::new(TrainerConfig {
        iterations: cli.iterations,
        eval_interval: cli.eval_interval,
        eval_batches: cli.eval_batches,
        checkpoint_path: cli.checkpoint.clone(),
    })?;

    println!("MAML meta-training");
    println!("==================");
    println!(
        "{}-way {}-shot, {} tasks/iteration, {} inner step(s), {}",
        config.num_classes,
        config.k_shot,
        config.batch_size,
        config.num_updates,
        if config.first_order { "first-order" } else { "second-order" }
    );
    println!("Parameters: {}", learner.parameters().num_elements());
    println!();

    trainer.train(&mut learner, train_tasks, validation_tasks, start_step)?;

    println!("Training summary");
    println!("----------------");
    println!(
        "Recent training accuracy (last 20): {:.2}%",
        trainer.recent_accuracy(20) * 100.0
    );
    for record in trainer.records(Phase::Validation) {
        println!(
            "step {:>6}  before {:.2}%  after {:.2}%  ({:+.2}%)",
            record.step,
            record.before_acc * 100.0,
            record.after_acc * 100.0,
            record.improvement() * 100.0
        );
    }
    if let Some(best) = trainer.best_validation() {
        println!(
            "Best validation accuracy: {:.2}% at step {}",
            best.after_acc * 100.0,
            best.step
        );
    }
    if let Some(path) = &cli.checkpoint {
        println!("Checkpoint: {}", path.display());
    }

    Ok(())
}
