use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mwp_common::{DataLoader, JsonlDataLoader, TrainingConfig, EOS_TOKEN};
use mwp_core::{BaselineConfig, BowSeq2Seq, PrefixEvaluator};
use mwp_train::{
    BestMetrics, EquationMode, EvalReport, Seq2SeqVariant, Trainer, TrainerVariant,
    TransformerVariant,
};

/// File next to the trained model that records the baseline's shapes.
const BASELINE_CONFIG: &str = "baseline.json";

#[derive(Parser, Debug)]
#[command(name = "mwp", about = "Train and test math-word-problem equation generators")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model, optionally resuming from the last checkpoint.
    Train(TrainArgs),
    /// Load the best saved model and score it on the test split.
    Test(TestArgs),
}

// ── Shared ─────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Directory holding meta.json and the train/valid/test JSONL splits.
    #[arg(long)]
    data_dir: PathBuf,
    #[arg(long, default_value = "seq2seq", value_parser = ["seq2seq", "multi", "transformer"])]
    variant: String,
    /// Place checkpoint, trained model and metrics.csv under this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[command(flatten)]
    run: RunArgs,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    resume: bool,
    #[arg(long, default_value = "64")]
    hidden_size: usize,
    /// Longest equation the baseline decoder emits.
    #[arg(long, default_value = "32")]
    max_equation_len: usize,
}

// ── Test ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TestArgs {
    #[command(flatten)]
    run: RunArgs,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Test(args) => cmd_test(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut config = load_config(&args.run)?;
    if let Some(epochs) = args.epochs {
        config.epoch_nums = epochs;
    }
    if let Some(lr) = args.lr {
        config.learning_rate = lr;
    }
    if let Some(batch_size) = args.batch_size {
        config.train_batch_size = batch_size;
    }
    config.resume |= args.resume;
    config.validate()?;

    let loader = JsonlDataLoader::open(&args.run.data_dir, config.train_batch_size, config.share_vocab)?;
    let meta = loader.meta();
    let baseline = BaselineConfig {
        in_vocab_size: meta.in_idx2word.len(),
        out_vocab_size: meta.out_idx2symbol.len(),
        hidden_size: args.hidden_size,
        max_equation_len: args.max_equation_len,
        in_pad: meta.in_pad_token(),
        out_eos: meta.out_index(EOS_TOKEN),
        seed: config.seed,
    };
    let baseline_path = baseline_config_path(&config);
    if let Some(parent) = baseline_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&baseline_path, serde_json::to_string_pretty(&baseline)?)
        .with_context(|| format!("write {}", baseline_path.display()))?;

    let best = match args.run.variant.as_str() {
        "transformer" => {
            let variant = transformer(&config, &loader, baseline)?;
            Trainer::new(config, variant, loader)?.fit()?
        }
        name => {
            let variant = seq2seq(&config, &loader, baseline, mode(name))?;
            Trainer::new(config, variant, loader)?.fit()?
        }
    };
    print_best(&best);
    Ok(())
}

fn cmd_test(args: TestArgs) -> Result<()> {
    let mut config = load_config(&args.run)?;
    config.resume = false;
    config.validate()?;

    let baseline_path = baseline_config_path(&config);
    let json = std::fs::read_to_string(&baseline_path)
        .with_context(|| format!("read {} (run `mwp train` first)", baseline_path.display()))?;
    let baseline: BaselineConfig = serde_json::from_str(&json).context("parse baseline config")?;

    let loader = JsonlDataLoader::open(&args.run.data_dir, config.train_batch_size, config.share_vocab)?;
    let report = match args.run.variant.as_str() {
        "transformer" => {
            let variant = transformer(&config, &loader, baseline)?;
            Trainer::new(config, variant, loader)?.test()?
        }
        name => {
            let variant = seq2seq(&config, &loader, baseline, mode(name))?;
            Trainer::new(config, variant, loader)?.test()?
        }
    };
    print_report(&report);
    Ok(())
}

// ── Helpers ────────────────────────────────────────────────────────────────────

/// Load the run config, writing a default one first if the file is missing.
fn load_config(args: &RunArgs) -> Result<TrainingConfig> {
    let mut config = if args.config.exists() {
        TrainingConfig::load(&args.config)?
    } else {
        let default = TrainingConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    if let Some(dir) = &args.output_dir {
        config.checkpoint_path = dir.join("checkpoint").join("checkpoint.safetensors");
        config.trained_model_path = dir.join("trained_model").join("model.safetensors");
        config.metrics_path = Some(dir.join("metrics.csv"));
    }
    Ok(config)
}

fn baseline_config_path(config: &TrainingConfig) -> PathBuf {
    config
        .trained_model_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(BASELINE_CONFIG)
}

fn mode(variant: &str) -> EquationMode {
    match variant {
        "multi" => EquationMode::Multi,
        _ => EquationMode::Single,
    }
}

fn seq2seq(
    config: &TrainingConfig,
    loader: &JsonlDataLoader,
    baseline: BaselineConfig,
    mode: EquationMode,
) -> Result<Seq2SeqVariant<BowSeq2Seq>> {
    let device = config.device()?;
    let meta = loader.meta();
    let model = BowSeq2Seq::new(baseline, &device)?;
    let variant = Seq2SeqVariant::new(
        model,
        meta,
        Box::new(PrefixEvaluator::new(meta)),
        mode,
        config.share_vocab,
        device,
    )?;
    tracing::info!(variant = variant.name(), "Built trainer variant");
    Ok(variant)
}

fn transformer(
    config: &TrainingConfig,
    loader: &JsonlDataLoader,
    baseline: BaselineConfig,
) -> Result<TransformerVariant<BowSeq2Seq>> {
    let device = config.device()?;
    let meta = loader.meta();
    let model = BowSeq2Seq::new(baseline, &device)?;
    let variant = TransformerVariant::new(
        model,
        meta,
        Box::new(PrefixEvaluator::new(meta)),
        config.share_vocab,
        device,
    )?;
    tracing::info!(variant = variant.name(), "Built trainer variant");
    Ok(variant)
}

fn print_best(best: &BestMetrics) {
    println!("best valid equ acc:   {:.4}", best.valid_equ_accuracy);
    println!("best valid value acc: {:.4}", best.valid_value_accuracy);
    println!("best test equ acc:    {:.4}", best.test_equ_accuracy);
    println!("best test value acc:  {:.4}", best.test_value_accuracy);
}

fn print_report(report: &EvalReport) {
    println!(
        "test equ acc: {:.4} | test value acc: {:.4} | examples: {} | time: {:.2?}",
        report.equation_accuracy, report.value_accuracy, report.total, report.elapsed
    );
}
