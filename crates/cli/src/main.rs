use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use squeeze_common::{
    directory_size, format_size, list_dir, load_tokenizer, shuffle_conversations, CalibrationSet,
    CalibrationSource, ChatTemplate, CompressConfig,
};
use squeeze_core::{layer_prefix, probe_devices, DeviceInfo, DeviceMap};
use squeeze_export::Checkpoint;
use squeeze_oneshot::{recover, swap_directories, Compressor, Recovery, SizeReport};

#[derive(Parser, Debug)]
#[command(name = "squeeze", about = "One-shot W4A16 GPTQ compression of a causal-LM checkpoint")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibrate, quantise, save and swap the compressed model into place.
    Compress(CompressArgs),
    /// List visible accelerators.
    Devices(DevicesArgs),
    /// Print the size of a directory (regular files, symlinks excluded).
    Size(SizeArgs),
    /// Promote the compressed directory over the model directory.
    Swap(RunArgs),
    /// Finish or abandon a swap interrupted by a crash.
    Recover(RunArgs),
    /// Preview rendered and tokenised calibration samples.
    Calibration(CalibrationArgs),
}

// ── Arguments ──────────────────────────────────────────────────────────────────

/// Options shared by every command that touches the directory triple.
#[derive(Args, Debug)]
struct RunArgs {
    /// JSON run configuration; written with defaults when missing.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory holding `model/`, `compressed_model/` and `model_original/`.
    #[arg(long)]
    base_dir: Option<PathBuf>,
}

/// Calibration data overrides.
#[derive(Args, Debug)]
struct DataArgs {
    /// Hub dataset id.
    #[arg(long)]
    dataset: Option<String>,
    /// Dataset split.
    #[arg(long)]
    split: Option<String>,
    /// Local JSONL calibration file used instead of the Hub.
    #[arg(long)]
    calibration_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct CompressArgs {
    #[command(flatten)]
    run: RunArgs,
    #[command(flatten)]
    data: DataArgs,
    /// Ignore accelerators.
    #[arg(long)]
    cpu: bool,
    /// Leave the compressed model in `compressed_model/`.
    #[arg(long)]
    no_swap: bool,
}

#[derive(Args, Debug)]
struct DevicesArgs {
    #[arg(long)]
    cpu: bool,
}

#[derive(Args, Debug)]
struct SizeArgs {
    dir: PathBuf,
}

#[derive(Args, Debug)]
struct CalibrationArgs {
    #[command(flatten)]
    run: RunArgs,
    #[command(flatten)]
    data: DataArgs,
    /// Number of samples to load (defaults to the single-device count).
    #[arg(long)]
    samples: Option<usize>,
    /// Rendered samples to print.
    #[arg(long, default_value_t = 2)]
    show: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Compress(args) => cmd_compress(args),
        Command::Devices(args) => cmd_devices(args),
        Command::Size(args) => cmd_size(args),
        Command::Swap(args) => cmd_swap(args),
        Command::Recover(args) => cmd_recover(args),
        Command::Calibration(args) => cmd_calibration(args),
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────────

fn load_config(run: &RunArgs) -> Result<CompressConfig> {
    let mut config = match &run.config {
        Some(path) if path.exists() => CompressConfig::load(path)?,
        Some(path) => {
            let default = CompressConfig::default();
            default.save(path)?;
            eprintln!("Created default config at {}", path.display());
            default
        }
        None => CompressConfig::default(),
    };
    if let Some(base) = &run.base_dir {
        config.paths.base_dir = base.clone();
    }
    Ok(config)
}

fn apply_data_args(config: &mut CompressConfig, data: &DataArgs) {
    if let Some(dataset) = &data.dataset {
        config.calibration.dataset_id = dataset.clone();
    }
    if let Some(split) = &data.split {
        config.calibration.split = split.clone();
    }
    if let Some(file) = &data.calibration_file {
        config.calibration.local_path = Some(file.clone());
    }
}

fn calibration_source(config: &CompressConfig) -> CalibrationSource {
    match &config.calibration.local_path {
        Some(path) => CalibrationSource::Jsonl(path.clone()),
        None => CalibrationSource::Hub {
            dataset_id: config.calibration.dataset_id.clone(),
            split: config.calibration.split.clone(),
        },
    }
}

/// Load, shuffle, render and tokenise `n` calibration conversations.
fn build_calibration(config: &CompressConfig, model_dir: &Path, n: usize) -> Result<CalibrationSet> {
    let mut conversations = calibration_source(config).load(n)?;
    shuffle_conversations(&mut conversations, config.calibration.seed);
    let tokenizer = load_tokenizer(model_dir)?;
    let template = ChatTemplate::from_tokenizer_dir(model_dir)?;
    let set = CalibrationSet::build(
        &conversations,
        &template,
        &tokenizer,
        config.calibration.max_seq_len,
    )?;
    tracing::info!(
        samples = set.num_samples(),
        tokens = set.num_tokens(),
        max_seq_len = config.calibration.max_seq_len,
        "Calibration set ready"
    );
    Ok(set)
}

fn print_devices(devices: &[DeviceInfo]) {
    println!("Number of GPUs available: {}", devices.len());
    for d in devices {
        println!("GPU {}: {}", d.ordinal, d.name);
        println!(
            "GPU {} memory: {:.2} GB",
            d.ordinal,
            d.total_memory as f64 / 1024f64.powi(3)
        );
    }
}

fn report_recovery(recovery: Recovery) {
    match recovery {
        Recovery::Clean => {}
        Recovery::Completed => eprintln!("Finished an interrupted directory swap."),
        Recovery::Abandoned => eprintln!("Dropped the journal of a swap that never started."),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_compress(args: CompressArgs) -> Result<()> {
    let mut config = load_config(&args.run)?;
    apply_data_args(&mut config, &args.data);
    config.devices.cpu_only |= args.cpu;
    config.validate()?;
    let paths = config.paths.clone();

    report_recovery(recover(&paths)?);

    let devices = probe_devices(config.devices.cpu_only);
    print_devices(&devices);

    let model_dir = paths.model_path();
    let compressed_dir = paths.compressed_path();
    if !model_dir.is_dir() {
        bail!("model directory {} does not exist", model_dir.display());
    }
    println!("Current working directory: {}", std::env::current_dir()?.display());
    println!("Model directory contents: {:?}", list_dir(&model_dir)?);

    let original_size = directory_size(&model_dir)?;
    println!("\nOriginal model size: {}", format_size(original_size));

    let checkpoint = Checkpoint::open(&model_dir)?;
    if let Some(index) = checkpoint.index_json() {
        println!("Model index data: {index}");
    }

    let model_config = checkpoint.config()?;
    let layer_bytes: Vec<u64> = (0..model_config.num_hidden_layers)
        .map(|i| checkpoint.prefix_bytes(&layer_prefix(i)))
        .collect();
    let device_map = DeviceMap::plan(
        &layer_bytes,
        devices.len(),
        config.devices.memory_ceiling_bytes(),
    );
    tracing::info!(
        layers = device_map.num_layers(),
        offloaded = device_map.offloaded(),
        "Planned layer placement"
    );

    let n = config.calibration.num_samples(devices.len());
    let calibration = build_calibration(&config, &model_dir, n)?;

    if compressed_dir.exists() {
        tracing::warn!(dir = %compressed_dir.display(), "Clearing previous compressed output");
        std::fs::remove_dir_all(&compressed_dir)
            .with_context(|| format!("remove {}", compressed_dir.display()))?;
    }
    std::fs::create_dir_all(&compressed_dir)
        .with_context(|| format!("create {}", compressed_dir.display()))?;

    {
        let compressor = Compressor::new(&config, &checkpoint, device_map)?;
        let outcome = compressor.run(&calibration)?;
        println!("Starting to save compressed model...");
        let saved = compressor.save(&outcome, &compressed_dir)?;
        eprintln!(
            "Saved {} quantized modules in {} shard(s)",
            outcome.quantized.len(),
            saved.shards.files.len()
        );
        println!("Stored dtype: {}", saved.dtype_note());
    }
    drop(checkpoint);

    let report = SizeReport {
        original: original_size,
        compressed: directory_size(&compressed_dir)?,
    };
    println!("\n{report}");

    if args.no_swap {
        println!("\nCompressed model left in {}", compressed_dir.display());
        return Ok(());
    }
    println!("\nRenaming directories...");
    swap_directories(&paths)?;
    println!("Compression and directory reorganization complete!");
    Ok(())
}

fn cmd_devices(args: DevicesArgs) -> Result<()> {
    print_devices(&probe_devices(args.cpu));
    Ok(())
}

fn cmd_size(args: SizeArgs) -> Result<()> {
    let bytes = directory_size(&args.dir)?;
    println!("{}: {} ({bytes} bytes)", args.dir.display(), format_size(bytes));
    Ok(())
}

fn cmd_swap(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    report_recovery(recover(&config.paths)?);
    let report = SizeReport::measure(&config.paths.model_path(), &config.paths.compressed_path())?;
    println!("{report}");
    println!("\nRenaming directories...");
    swap_directories(&config.paths)?;
    println!("Directory reorganization complete!");
    Ok(())
}

fn cmd_recover(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    match recover(&config.paths)? {
        Recovery::Clean => println!("No interrupted swap found."),
        other => report_recovery(other),
    }
    Ok(())
}

fn cmd_calibration(args: CalibrationArgs) -> Result<()> {
    let mut config = load_config(&args.run)?;
    apply_data_args(&mut config, &args.data);
    let model_dir = config.paths.model_path();
    let n = args.samples.unwrap_or_else(|| config.calibration.num_samples(1));

    let mut conversations = calibration_source(&config).load(n)?;
    shuffle_conversations(&mut conversations, config.calibration.seed);
    let template = ChatTemplate::from_tokenizer_dir(&model_dir)?;
    for (i, convo) in conversations.iter().take(args.show).enumerate() {
        println!("--- Sample {i} ---");
        println!("{}", template.render(convo, false)?);
    }

    let tokenizer = load_tokenizer(&model_dir)?;
    let set = CalibrationSet::build(
        &conversations,
        &template,
        &tokenizer,
        config.calibration.max_seq_len,
    )?;
    let lengths: Vec<usize> = set.samples().iter().map(Vec::len).collect();
    println!(
        "\n{} samples, {} tokens, lengths {:?}",
        set.num_samples(),
        set.num_tokens(),
        lengths
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_compress_flags() {
        let cli = Cli::try_parse_from([
            "squeeze",
            "compress",
            "--base-dir",
            "/tmp/x",
            "--calibration-file",
            "cal.jsonl",
            "--cpu",
            "--no-swap",
        ])
        .unwrap();
        let Command::Compress(args) = cli.command else {
            panic!("expected compress");
        };
        assert!(args.cpu && args.no_swap);
        let mut config = load_config(&args.run).unwrap();
        apply_data_args(&mut config, &args.data);
        assert_eq!(config.paths.model_path(), PathBuf::from("/tmp/x/model"));
        assert!(matches!(calibration_source(&config), CalibrationSource::Jsonl(_)));
    }

    #[test]
    fn default_source_is_hub_dataset() {
        let config = CompressConfig::default();
        match calibration_source(&config) {
            CalibrationSource::Hub { dataset_id, split } => {
                assert_eq!(dataset_id, "HuggingFaceH4/ultrachat_200k");
                assert_eq!(split, "train_sft");
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn size_takes_positional_dir() {
        let cli = Cli::try_parse_from(["squeeze", "size", "some/dir"]).unwrap();
        assert!(matches!(cli.command, Command::Size(SizeArgs { ref dir }) if dir == Path::new("some/dir")));
    }
}
