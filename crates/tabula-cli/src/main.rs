mod bench_runner;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use tabula_core::{BackendKind, FrameMode, Registry, TabulaConfig};
use tabula_coord::{run_probe, FrameCoordinator, ProbeMode, ProbeOptions};
use tabula_gpu::{Backend, HeadlessBackend, WgpuBackend};

#[derive(Parser)]
#[command(
    name = "tabula",
    version,
    about = "Tabula: parallel GPU command encoding across worker threads",
    long_about = "Tabula shares device resources between an orchestrator and a pool of worker\nthreads through a handle registry. Workers encode, the orchestrator submits one\nbatch per frame."
)]
struct Cli {
    /// Path to a tabula.toml configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the frame loop
    Run {
        /// Number of worker threads
        #[arg(short, long)]
        workers: Option<usize>,

        /// Stop after this many frames (default: run until interrupted)
        #[arg(short, long)]
        frames: Option<u64>,

        #[arg(long)]
        width: Option<u32>,

        #[arg(long)]
        height: Option<u32>,

        /// Presentation tick in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Skip a frame when workers take longer than this
        #[arg(long)]
        barrier_timeout_ms: Option<u64>,

        /// What workers encode: render-bundle, command-buffer
        #[arg(short, long)]
        mode: Option<FrameMode>,

        /// Device backend: auto, wgpu, headless
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },

    /// Benchmark parallel encoding across worker counts
    Bench {
        /// Sweep worker counts 1..=N
        #[arg(short = 'n', long)]
        max_workers: Option<usize>,

        /// Total dispatches per trial, split across workers
        #[arg(short, long)]
        dispatch_count: Option<u32>,

        #[arg(short, long)]
        trials: Option<usize>,

        /// Skip warm-up trials
        #[arg(long)]
        no_warmup: bool,

        /// Extend each trial to device idle
        #[arg(long)]
        wait_for_device: bool,

        #[arg(short, long)]
        backend: Option<BackendKind>,

        /// Print the report as JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Baseline file for regression checks
        #[arg(long, default_value = "tests/snapshots/encode_benchmarks.json")]
        baseline: PathBuf,

        /// Save this run as the new baseline
        #[arg(long)]
        update: bool,
    },

    /// Try handing a device and buffer to a worker and read the buffer back
    Probe {
        #[arg(long, value_enum, default_value_t = ProbeArg::Direct)]
        mode: ProbeArg,

        /// Pin the device to the orchestrator so the transfer fails
        #[arg(long)]
        pin_device: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Also write it to this path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProbeArg {
    Direct,
    Registry,
}

impl From<ProbeArg> for ProbeMode {
    fn from(arg: ProbeArg) -> Self {
        match arg {
            ProbeArg::Direct => ProbeMode::Direct,
            ProbeArg::Registry => ProbeMode::Registry,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.filter)),
        )
        .init();

    match cli.command {
        Commands::Run {
            workers,
            frames,
            width,
            height,
            interval_ms,
            barrier_timeout_ms,
            mode,
            backend,
        } => {
            let coordinator = &mut config.coordinator;
            if let Some(workers) = workers {
                coordinator.workers = workers;
            }
            if let Some(width) = width {
                coordinator.width = width;
            }
            if let Some(height) = height {
                coordinator.height = height;
            }
            if let Some(interval) = interval_ms {
                coordinator.frame_interval_ms = interval;
            }
            if barrier_timeout_ms.is_some() {
                coordinator.barrier_timeout_ms = barrier_timeout_ms;
            }
            if let Some(mode) = mode {
                coordinator.mode = mode;
            }
            if let Some(kind) = backend {
                config.backend.kind = kind;
            }
            run_async(cmd_run(config, frames))
        }
        Commands::Bench {
            max_workers,
            dispatch_count,
            trials,
            no_warmup,
            wait_for_device,
            backend,
            json,
            baseline,
            update,
        } => {
            let bench = &mut config.bench;
            if let Some(max_workers) = max_workers {
                bench.max_workers = max_workers;
            }
            if let Some(dispatch_count) = dispatch_count {
                bench.dispatch_count = dispatch_count;
            }
            if let Some(trials) = trials {
                bench.trials = trials;
            }
            if no_warmup {
                bench.warmup = false;
            }
            if wait_for_device {
                bench.wait_for_device = true;
            }
            if let Some(kind) = backend {
                config.backend.kind = kind;
            }
            run_async(bench_runner::run_benchmark(config, json, baseline, update))
        }
        Commands::Probe { mode, pin_device } => run_async(cmd_probe(ProbeOptions {
            mode: mode.into(),
            pin_device,
        })),
        Commands::Config { output } => cmd_config(&config, output),
    }
}

fn load_config(path: Option<&Path>) -> Result<TabulaConfig> {
    match path {
        Some(path) => TabulaConfig::load_from_file(path)
            .with_context(|| format!("failed to load config: {}", path.display())),
        None => {
            let default_path = Path::new("tabula.toml");
            if default_path.exists() {
                TabulaConfig::load_from_file(default_path)
                    .with_context(|| format!("failed to load config: {}", default_path.display()))
            } else {
                Ok(TabulaConfig::default())
            }
        }
    }
}

fn run_async<F>(future: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to initialize async runtime")?;
    runtime.block_on(future)
}

/// A device backend chosen at startup.
pub(crate) enum SelectedBackend {
    Wgpu(WgpuBackend),
    Headless(HeadlessBackend),
}

pub(crate) fn select_backend(kind: BackendKind, width: u32, height: u32) -> Result<SelectedBackend> {
    match kind {
        BackendKind::Headless => Ok(SelectedBackend::Headless(
            HeadlessBackend::default().with_dimensions(width, height),
        )),
        BackendKind::Wgpu => WgpuBackend::new(width, height)
            .map(SelectedBackend::Wgpu)
            .context("failed to initialize wgpu backend"),
        BackendKind::Auto => match WgpuBackend::new(width, height) {
            Ok(backend) => Ok(SelectedBackend::Wgpu(backend)),
            Err(e) => {
                tracing::warn!("wgpu backend unavailable ({}), falling back to headless", e);
                Ok(SelectedBackend::Headless(
                    HeadlessBackend::default().with_dimensions(width, height),
                ))
            }
        },
    }
}

async fn cmd_run(config: TabulaConfig, frames: Option<u64>) -> Result<()> {
    let coordinator = &config.coordinator;
    match select_backend(config.backend.kind, coordinator.width, coordinator.height)? {
        SelectedBackend::Wgpu(backend) => run_frames(backend, &config, frames).await,
        SelectedBackend::Headless(backend) => run_frames(backend, &config, frames).await,
    }
}

async fn run_frames<B: Backend>(backend: B, config: &TabulaConfig, frames: Option<u64>) -> Result<()> {
    let name = backend.name();
    let mut coordinator =
        FrameCoordinator::start(backend, Registry::shared(), &config.coordinator, &config.ids)
            .await
            .context("failed to start frame coordinator")?;

    println!("▶ Tabula frame loop");
    println!("   Backend:  {}", name);
    println!("   Workers:  {}", coordinator.worker_count());
    println!("   Mode:     {}", coordinator.mode());
    println!(
        "   Target:   {}x{} every {} ms",
        config.coordinator.width, config.coordinator.height, config.coordinator.frame_interval_ms
    );

    tokio::select! {
        result = coordinator.run(frames) => {
            result.context("frame loop failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, stopping frame loop");
        }
    }

    let stats = coordinator.stats();
    println!();
    println!("   Submitted: {}", stats.submitted);
    println!("   Skipped:   {}", stats.skipped);
    Ok(())
}

async fn cmd_probe(options: ProbeOptions) -> Result<()> {
    let report = run_probe(options).await.context("transfer probe failed")?;
    println!("▶ Transfer probe ({:?})", report.mode);
    println!(
        "   Transfer: {}",
        if report.transferred { "succeeded" } else { "unavailable (sentinel sent)" }
    );
    println!("   Readback: {:?}", report.readback);
    if !report.registry_ids.is_empty() {
        println!("   Ids:      {:?}", report.registry_ids);
    }
    Ok(())
}

fn cmd_config(config: &TabulaConfig, output: Option<PathBuf>) -> Result<()> {
    let text = config.to_toml().context("failed to serialize config")?;
    print!("{}", text);
    if let Some(path) = output {
        config
            .save_to_file(&path)
            .with_context(|| format!("failed to write config: {}", path.display()))?;
        tracing::info!("wrote {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_flags_parse() {
        let cli = Cli::try_parse_from([
            "tabula", "run", "--workers", "4", "--frames", "10", "--backend", "headless",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                workers,
                frames,
                backend,
                ..
            } => {
                assert_eq!(workers, Some(4));
                assert_eq!(frames, Some(10));
                assert_eq!(backend, Some(BackendKind::Headless));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_mode_flag_parses() {
        let cli = Cli::try_parse_from(["tabula", "run", "--mode", "command-buffer"]).unwrap();
        match cli.command {
            Commands::Run { mode, .. } => assert_eq!(mode, Some(FrameMode::CommandBuffer)),
            _ => panic!("expected run"),
        }
        assert!(Cli::try_parse_from(["tabula", "run", "--mode", "bundles"]).is_err());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Cli::try_parse_from(["tabula", "run", "--backend", "metal"]).is_err());
    }

    #[test]
    fn test_headless_selection_never_touches_gpu() {
        let selected = select_backend(BackendKind::Headless, 32, 32).unwrap();
        assert!(matches!(selected, SelectedBackend::Headless(_)));
    }
}
