use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn, Level};

use shared_utils::logging::{init_logging, LogConfig};
use shared_utils::{
    get_balanced_thread_config, is_ffmpeg_available, is_ffprobe_available, report_error, GpuAccel,
    WorkloadType,
};
use vid_variant::{
    CancellationToken, Catalog, CooldownLedger, DeviceManager, EngineConfig, FfmpegStageProvider,
    FfprobeMetrics, RunJob, SystemProbe, VariantEngine,
};

#[derive(Parser)]
#[command(name = "vid-variant")]
#[command(version, about = "Constrained-random video variant generator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for rolling log files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Args, Clone, Default)]
struct EngineArgs {
    /// Engine configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Transformation catalog (JSON); built-in set when omitted
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Cooldown ledger file; in-memory when omitted
    #[arg(long)]
    ledger: Option<PathBuf>,
    /// Never use the accelerator
    #[arg(long)]
    force_cpu: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the active transformation catalog
    Catalog {
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// Report accelerator capability and device status
    Probe {
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Select transformations and parameters without executing
    Plan {
        #[arg(long)]
        seed: Option<u64>,
        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Render variants of INPUT
    Run {
        #[arg(value_name = "INPUT")]
        input: PathBuf,
        #[arg(short, long)]
        output_dir: PathBuf,
        /// Number of variants
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
        /// Base seed; variant i uses seed + i
        #[arg(long)]
        seed: Option<u64>,
        #[arg(short, long)]
        workers: Option<usize>,
        /// Keep per-attempt intermediate files
        #[arg(long)]
        keep_work: bool,
        #[command(flatten)]
        engine: EngineArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let mut log_config = LogConfig::new().with_level(level).with_json_file(cli.json_logs);
    if let Some(dir) = &cli.log_dir {
        log_config = log_config.with_log_dir(dir);
    }
    if let Err(e) = init_logging("vid_variant", log_config) {
        eprintln!("⚠️  Logging unavailable: {e:#}");
    }

    match cli.command {
        Commands::Catalog { catalog } => {
            let catalog = load_catalog(catalog.as_deref())?;
            println!("{}", catalog.to_json()?);
        }

        Commands::Probe { engine } => {
            let config = load_config(&engine)?;
            let devices = DeviceManager::new(&config.devices, SystemProbe);
            let gpu = GpuAccel::detect();
            let report = json!({
                "accelerator": gpu.description(),
                "hwaccel": gpu.hwaccel,
                "memory_free_mb": gpu.memory_free_mb,
                "status": devices.probe().to_string(),
                "slots": devices.slots(),
                "ffmpeg": is_ffmpeg_available(),
                "ffprobe": is_ffprobe_available(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Plan { seed, engine } => {
            let engine = build_engine(load_config(&engine)?)?;
            let plan = engine.plan(seed).context("Selection failed")?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }

        Commands::Run {
            input,
            output_dir,
            count,
            seed,
            workers,
            keep_work,
            engine,
        } => {
            if !is_ffmpeg_available() || !is_ffprobe_available() {
                bail!("ffmpeg and ffprobe must be on PATH");
            }
            if !input.is_file() {
                bail!("Input is not a file: {}", input.display());
            }
            if count == 0 {
                bail!("--count must be at least 1");
            }

            let mut config = load_config(&engine)?;
            if workers.is_some() {
                config.workers = workers;
            }
            config.keep_intermediates |= keep_work;
            let engine = build_engine(config)?;

            let cancel = CancellationToken::new();
            let handler_token = cancel.clone();
            if let Err(e) = ctrlc::set_handler(move || {
                eprintln!("⚠️  Interrupt received, stopping after the current stage");
                handler_token.cancel();
            }) {
                warn!(error = %e, "Could not install interrupt handler");
            }

            let jobs = variant_jobs(&input, &output_dir, count, seed)?;
            info!(input = %input.display(), variants = count, "🎬 Rendering variants");

            let results = engine.run_batch(&jobs, &cancel);
            let mut failed = 0;
            let summary: Vec<_> = jobs
                .iter()
                .zip(&results)
                .map(|(job, result)| match result {
                    Ok(report) => json!({
                        "output": job.output,
                        "status": "committed",
                        "report": report,
                    }),
                    Err(e) => {
                        failed += 1;
                        report_error(e);
                        json!({
                            "output": job.output,
                            "status": "failed",
                            "error": e.to_string(),
                            "manifest": e.manifest(),
                        })
                    }
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&summary)?);

            if failed > 0 {
                bail!("{failed} of {count} variants failed");
            }
        }
    }

    Ok(())
}

fn load_config(args: &EngineArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.apply_env_overrides();
    if args.catalog.is_some() {
        config.catalog_path = args.catalog.clone();
    }
    if args.ledger.is_some() {
        config.ledger_path = args.ledger.clone();
    }
    config.devices.force_cpu |= args.force_cpu;
    Ok(config)
}

fn load_catalog(path: Option<&Path>) -> Result<Catalog> {
    match path {
        Some(path) => Catalog::load(path)
            .with_context(|| format!("Failed to load catalog {}", path.display())),
        None => Ok(Catalog::builtin()),
    }
}

fn build_engine(config: EngineConfig) -> Result<VariantEngine> {
    let catalog = load_catalog(config.catalog_path.as_deref())?;
    let config = config.validate().context("Invalid configuration")?;

    let ledger = match &config.config().ledger_path {
        Some(path) => CooldownLedger::load(path, config.config().cooldown_unit)
            .with_context(|| format!("Failed to load ledger {}", path.display()))?,
        None => {
            warn!("No ledger path configured, cooldowns last for this process only");
            CooldownLedger::in_memory(config.config().cooldown_unit)
        }
    };

    let devices = DeviceManager::new(&config.config().devices, SystemProbe);
    let threads = get_balanced_thread_config(WorkloadType::Encode).child_threads;
    let provider = if devices.probe().is_available() {
        FfmpegStageProvider::from_gpu(GpuAccel::detect(), threads)
    } else {
        FfmpegStageProvider::cpu_only(threads)
    };

    Ok(VariantEngine::new(
        Arc::new(catalog),
        config,
        Arc::new(ledger),
        devices,
        Arc::new(provider),
        Arc::new(FfprobeMetrics),
    ))
}

/// `<stem>_vNN.mp4` outputs, each with its own work directory.
fn variant_jobs(input: &Path, output_dir: &Path, count: usize, seed: Option<u64>) -> Result<Vec<RunJob>> {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .context("Input file name is not valid UTF-8")?;
    let work_root = output_dir.join(".work");

    Ok((0..count)
        .map(|i| {
            let name = format!("{stem}_v{:02}", i + 1);
            RunJob {
                source: input.to_path_buf(),
                output: output_dir.join(format!("{name}.mp4")),
                work_dir: work_root.join(&name),
                seed: seed.map(|s| s.wrapping_add(i as u64)),
            }
        })
        .collect())
}
