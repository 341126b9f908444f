//! dubsync command-line interface
//!
//! Decodes master and dub media with ffmpeg, runs the offset engine and
//! prints the consensus result as JSON.

mod ffmpeg;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dubsync_core::analysis::{analyze_pair, AnalysisConfig, Method, TrackRole};
use dubsync_core::config::{ConfigManager, Settings};
use dubsync_core::logging::{self, LogLevel};
use dubsync_core::scheduler::{BatchJob, JobRequest, SchedulerConfig, TrackLoader, WorkScheduler};

use ffmpeg::FfmpegLoader;

/// dubsync - master/dub audio offset detection
#[derive(Parser, Debug)]
#[command(name = "dubsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (created with defaults if missing)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Measure the offset of one dub against its master
    Analyze {
        master: PathBuf,
        dub: PathBuf,

        /// Comma-separated methods, e.g. raw,cepstral,onset
        #[arg(short, long, value_delimiter = ',')]
        methods: Vec<Method>,

        /// Threads for chunk analysis
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Analyze every pair listed in a JSON file
    Batch {
        /// JSON array of {pair_id, master_path, dub_path}
        pairs: PathBuf,

        /// Write the batch summary here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Write a settings file with defaults filled in
    InitConfig { path: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    if let Commands::InitConfig { path } = &cli.command {
        let mut manager = ConfigManager::new(path);
        manager
            .load_or_create()
            .with_context(|| format!("failed to initialize {}", path.display()))?;
        println!("{}", manager.path().display());
        return Ok(ExitCode::SUCCESS);
    }

    let settings = load_settings(cli.config.as_deref())?;
    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        settings.logging.level.parse().unwrap_or_default()
    };
    let _guard = init_logging(level, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Analyze {
            master,
            dub,
            methods,
            workers,
        } => analyze(&settings, &master, &dub, methods, workers),
        Commands::Batch { pairs, output } => batch(&settings, &pairs, output.as_deref()),
        Commands::InitConfig { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let Some(path) = path else {
        return Ok(Settings::default());
    };
    let mut manager = ConfigManager::new(path);
    manager
        .load_or_create()
        .with_context(|| format!("failed to load {}", path.display()))?;
    Ok(manager.settings().clone())
}

fn init_logging(level: LogLevel, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let Some(path) = log_file else {
        logging::init_tracing(level);
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path.file_name().context("--log-file needs a file name")?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter_str()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("failed to install logger")?;
    Ok(Some(guard))
}

fn analyze(
    settings: &Settings,
    master: &Path,
    dub: &Path,
    methods: Vec<Method>,
    workers: Option<usize>,
) -> Result<ExitCode> {
    let mut config = AnalysisConfig::from(&settings.analysis);
    if !methods.is_empty() {
        config = config.with_methods(methods);
    }
    if let Some(workers) = workers {
        config.parallel_workers = workers;
    }

    let loader = FfmpegLoader::new(settings.analysis.sample_rate);
    let master_track = loader
        .load(master, TrackRole::Master)
        .with_context(|| format!("failed to decode master {}", master.display()))?;
    let dub_track = loader
        .load(dub, TrackRole::Dub)
        .with_context(|| format!("failed to decode dub {}", dub.display()))?;

    let result = analyze_pair(&master_track, &dub_track, &config).context("analysis failed")?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    eprintln!("{}", result.statement);
    Ok(ExitCode::SUCCESS)
}

fn batch(settings: &Settings, pairs: &Path, output: Option<&Path>) -> Result<ExitCode> {
    let content = fs::read_to_string(pairs)
        .with_context(|| format!("failed to read {}", pairs.display()))?;
    let requests: Vec<JobRequest> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a list of pairs", pairs.display()))?;
    if requests.is_empty() {
        bail!("{} lists no pairs", pairs.display());
    }

    let scheduler = WorkScheduler::new(SchedulerConfig::from(settings))?;
    for request in requests {
        scheduler.submit(BatchJob::from(request))?;
    }

    let loader = FfmpegLoader::new(settings.analysis.sample_rate);
    let summary = scheduler.run(&loader, &AnalysisConfig::from(&settings.analysis));

    let json = serde_json::to_string_pretty(&summary)?;
    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?
        }
        None => println!("{}", json),
    }

    Ok(if summary.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
