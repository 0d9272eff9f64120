use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use stem_remix::domain::{Device, Gain, JobState, MixParameters, StemKind};
use stem_remix::logging::{DEFAULT_LOG_FILTER, init_logging};
use stem_remix::media::FfmpegTools;
use stem_remix::separation::{DemucsBackend, SeparationBackend};
use stem_remix::{AppConfig, JobController};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Separate a clip into stems and remix it", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "STEM_REMIX_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding job working directories
    #[arg(long, global = true)]
    jobs_dir: Option<PathBuf>,

    /// Also write daily log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Separate INPUT and write a remix
    Run {
        /// Audio or video file to process
        input: PathBuf,

        /// Compute device (cpu or gpu)
        #[arg(long, default_value = "cpu")]
        device: Device,

        /// Vocals gain
        #[arg(long, default_value_t = 1.0)]
        vocals: f32,

        /// Drums gain
        #[arg(long, default_value_t = 1.0)]
        drums: f32,

        /// Bass gain
        #[arg(long, default_value_t = 1.0)]
        bass: f32,

        /// Other (background) gain
        #[arg(long, default_value_t = 1.0)]
        other: f32,

        /// Interpret gains as decibels instead of linear factors
        #[arg(long)]
        db: bool,

        /// Noise suppression on every stem (0-100)
        #[arg(long, default_value_t = 0)]
        denoise: u8,

        /// Wind suppression on the background stem (0-100)
        #[arg(long)]
        wind: Option<u8>,

        /// Output file; defaults to `<input>-remix.<ext>` next to the input
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Report ffmpeg and GPU availability
    Probe,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> anyhow::Result<AppConfig> {
    let mut config =
        AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &args.jobs_dir {
        config.storage.jobs_dir = dir.clone();
    }
    if let Some(dir) = &args.log_dir {
        config.storage.log_dir = Some(dir.clone());
    }
    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    let filter = if args.verbose {
        "stem_remix=debug"
    } else if args.quiet {
        "stem_remix=warn"
    } else {
        DEFAULT_LOG_FILTER
    };
    let _logging = init_logging(config.storage.log_dir.as_deref(), filter)?;

    match args.command {
        Commands::Run {
            input,
            device,
            vocals,
            drums,
            bass,
            other,
            db,
            denoise,
            wind,
            output,
        } => {
            let gain = |value: f32| {
                if db {
                    Gain::Decibels(value)
                } else {
                    Gain::Linear(value)
                }
            };
            let mut params = MixParameters::unity()
                .with_gain(StemKind::Vocals, gain(vocals))
                .with_gain(StemKind::Drums, gain(drums))
                .with_gain(StemKind::Bass, gain(bass))
                .with_gain(StemKind::Other, gain(other))
                .with_global_suppression(denoise);
            if let Some(wind) = wind {
                params = params.with_suppression(StemKind::Other, wind);
            }
            params.validate()?;

            run_job(&config, &input, device, params, output).await
        }
        Commands::Probe => probe(&config).await,
    }
}

async fn run_job(
    config: &AppConfig,
    input: &Path,
    device: Device,
    params: MixParameters,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let file_name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let controller = JobController::new(config)?;
    let id = controller.create_job(&file_name, &bytes).await?;
    let mut progress = controller.subscribe(&id)?;
    controller.start_processing(&id, device).await?;

    while let Some(event) = progress.next().await {
        info!(
            phase = %event.phase,
            overall = event.overall_percent().round(),
            "{}",
            event.message
        );
    }

    let job = controller.get_job(&id)?;
    if job.state != JobState::Separated {
        controller.shutdown().await;
        anyhow::bail!(
            "Separation failed: {}",
            job.error.as_deref().unwrap_or("unknown error")
        );
    }

    let artifact = controller.download(&id, Some(params)).await?;
    let extension = artifact
        .path
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "wav".to_string());
    let output = output.unwrap_or_else(|| {
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        input.with_file_name(format!("{}-remix.{}", stem, extension))
    });

    tokio::fs::copy(&artifact.path, &output)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(job_id = %id, output = %output.display(), "Remix written");
    println!("{}", output.display());

    controller.shutdown().await;
    Ok(())
}

async fn probe(config: &AppConfig) -> anyhow::Result<()> {
    let tools = FfmpegTools::new(
        config.media.ffmpeg_path.clone(),
        config.media.ffprobe_path.clone(),
    );
    match tools.version().await {
        Ok(version) => println!("ffmpeg: {}", version),
        Err(e) => println!("ffmpeg: unavailable ({})", e),
    }

    let gpu = match config.separation.gpu_available {
        Some(available) => available,
        None => {
            DemucsBackend::new(
                config.separation.python_path.clone(),
                config.separation.model.clone(),
            )
            .gpu_available()
            .await
        }
    };
    println!("gpu: {}", if gpu { "available" } else { "unavailable" });
    Ok(())
}
