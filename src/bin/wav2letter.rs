use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use wav2letter_rs::{
    AlignmentLossModel, LabeledFeatures, RunningLoss, TrainingConfig, TrainingOrchestrator,
    Wav2LetterConfig,
};

#[path = "wav2letter/manifest.rs"]
mod manifest;

#[derive(Debug, Parser)]
#[command(name = "wav2letter")]
#[command(about = "Train and run a convolutional CTC speech recognizer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train on a manifest, checkpointing into --net-dir.
    Train(TrainArgs),
    /// Decode every manifest entry with a checkpointed network.
    Predict(ModelArgs),
    /// Mean loss of a checkpointed network over a manifest.
    Evaluate(ModelArgs),
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// JSON model configuration; defaults are used when absent.
    #[arg(long, env = "WAV2LETTER_CONFIG")]
    config: Option<PathBuf>,
    /// JSON-lines file of {"label", "features"} examples.
    #[arg(long, env = "WAV2LETTER_MANIFEST")]
    manifest: PathBuf,
    #[arg(long, env = "WAV2LETTER_NET_DIR", default_value = "nets")]
    net_dir: PathBuf,
    #[arg(long, env = "WAV2LETTER_BATCH_SIZE", default_value_t = 16)]
    batch_size: usize,
    #[arg(long, env = "WAV2LETTER_DEVICE")]
    device: Option<String>,
}

#[derive(Debug, Args)]
struct TrainArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Resume from the checkpoint of this epoch in --net-dir.
    #[arg(long, env = "WAV2LETTER_LOAD_EPOCH")]
    load_epoch: Option<u64>,
    /// Defaults to the manifest size.
    #[arg(long, env = "WAV2LETTER_SAMPLES_PER_EPOCH")]
    samples_per_epoch: Option<usize>,
    #[arg(long, env = "WAV2LETTER_HELD_OUT", default_value_t = 4)]
    held_out: usize,
    #[arg(long, env = "WAV2LETTER_REPORT_EVERY", default_value_t = 1)]
    report_every: u64,
    #[arg(long, env = "WAV2LETTER_SAVE_EVERY", default_value_t = 1)]
    save_every: u64,
    #[arg(long, env = "WAV2LETTER_MAX_EPOCHS")]
    max_epochs: Option<u64>,
    #[arg(long, env = "WAV2LETTER_SHUFFLE_SEED")]
    shuffle_seed: Option<u64>,
}

#[derive(Debug, Args)]
struct ModelArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, env = "WAV2LETTER_LOAD_EPOCH")]
    load_epoch: u64,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run() -> Result<(), String> {
    match Cli::parse().command {
        Command::Train(args) => train(args),
        Command::Predict(args) => predict(args),
        Command::Evaluate(args) => evaluate(args),
    }
}

fn train(args: TrainArgs) -> Result<(), String> {
    let examples = manifest::read_manifest(&args.common.manifest)?;
    let model = build_model(&args.common, args.load_epoch, &examples)?;

    let mut config = TrainingConfig::new(
        &args.common.net_dir,
        args.samples_per_epoch.unwrap_or(examples.len()),
    );
    config.report_every = args.report_every;
    config.save_every = args.save_every;
    config.max_epochs = args.max_epochs;

    let held_out = &examples[..args.held_out.min(examples.len())];
    let mut orchestrator = TrainingOrchestrator::new(model, config)
        .map_err(|err| err.to_string())?
        .with_held_out(held_out);
    let stream = manifest::shuffled_batches(
        examples.clone(),
        args.common.batch_size,
        args.shuffle_seed,
    );
    let summary = orchestrator.train(stream).map_err(|err| err.to_string())?;
    tracing::info!(
        first_epoch = summary.first_epoch,
        last_epoch = summary.last_completed_epoch,
        batches = summary.batches_trained,
        checkpoints = summary.checkpoints.len(),
        "training finished"
    );
    Ok(())
}

fn predict(args: ModelArgs) -> Result<(), String> {
    let examples = manifest::read_manifest(&args.common.manifest)?;
    let model = build_model(&args.common, Some(args.load_epoch), &examples)?;
    let batches = manifest::batches(&examples, args.common.batch_size);

    let progress = progress_bar(examples.len() as u64);
    for batch in &batches {
        let features: Vec<_> = batch.iter().map(|e| &e.features).collect();
        let predictions = model.predict(&features).map_err(|err| err.to_string())?;
        for (example, predicted) in batch.iter().zip(predictions) {
            progress.println(format!(
                "Expected:  \"{}\"\nPredicted: \"{predicted}\"\n",
                example.label
            ));
            progress.inc(1);
        }
    }
    progress.finish_with_message("prediction pass complete");
    Ok(())
}

fn evaluate(args: ModelArgs) -> Result<(), String> {
    let examples = manifest::read_manifest(&args.common.manifest)?;
    let model = build_model(&args.common, Some(args.load_epoch), &examples)?;
    let batches = manifest::batches(&examples, args.common.batch_size);

    let progress = progress_bar(batches.len() as u64);
    let mut running = RunningLoss::default();
    for examples in &batches {
        let batch = model
            .training_batch(examples)
            .map_err(|err| err.to_string())?;
        let loss = model.loss(&batch).map_err(|err| err.to_string())?;
        let average = running.push(loss);
        progress.set_message(format!("loss {loss:.4} (avg {average:.4})"));
        progress.inc(1);
    }
    progress.finish_with_message("evaluation pass complete");
    if let Some(mean) = running.mean() {
        println!("{mean}");
    }
    Ok(())
}

fn build_model(
    args: &CommonArgs,
    load_epoch: Option<u64>,
    examples: &[LabeledFeatures],
) -> Result<AlignmentLossModel, String> {
    let width = examples
        .first()
        .map(|e| e.features.width())
        .ok_or_else(|| "Manifest has no examples".to_string())?;
    let mut config = load_config(args.config.as_deref(), width)?;
    if config.input_size_per_time_step != width {
        return Err(format!(
            "Config expects {} features per step, manifest has {width}",
            config.input_size_per_time_step
        ));
    }
    if let Some(device) = &args.device {
        config.device = device.clone();
    }
    if let Some(epoch) = load_epoch {
        config.load_from_directory = Some(args.net_dir.clone());
        config.load_epoch = Some(epoch);
    }
    AlignmentLossModel::new(config).map_err(|err| err.to_string())
}

fn load_config(path: Option<&Path>, width: usize) -> Result<Wav2LetterConfig, String> {
    match path {
        Some(path) => Wav2LetterConfig::load(path).map_err(|err| err.to_string()),
        None => Ok(Wav2LetterConfig::new(width)),
    }
}

fn progress_bar(len: u64) -> ProgressBar {
    let progress = ProgressBar::new(len);
    progress.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    progress
}
