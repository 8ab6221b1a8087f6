use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use framevec_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use framevec_core::job::{JobStatus, ProgressEvent};
use framevec_core::logging::{
    self, FileSink, LogFilters, LoggingOptions, RunMode, DEFAULT_LOG_FILTER,
};
use framevec_core::retention;
use framevec_core::server::{app_router_with_static, app_state_with_config};

#[derive(Parser)]
#[command(
    name = "framevec",
    about = "Turn videos into per-frame SVG sequences",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert one video locally, without starting the server.
    Convert(ConvertArgs),
}

#[derive(Args)]
struct ConvertArgs {
    #[arg(help = "Path to the source video")]
    video: PathBuf,

    #[arg(
        long = "frame-skip",
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Keep one of every N decoded frames"
    )]
    frame_skip: u32,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RunMode::Convert
    } else {
        RunMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Convert(args)) => {
            run_convert(args.video, args.frame_skip, resolved_data_dir).await
        }
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

fn init_logging(mode: RunMode, data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook = logging::install_panic_hook(data_dir);
    if let Err(err) = &panic_hook {
        eprintln!("Warning: crash reports unavailable ({err}). Panics will not be persisted.");
    }

    let options = LoggingOptions {
        mode,
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        env_filter: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = LogFilters::compose(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter(&filters.console, "console"));

    match FileSink::open(data_dir, mode, options.retention_files) {
        Ok(sink) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(sink.appender)
                .with_filter(parse_env_filter(&filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {err}");
            }
        }
        Err(err) => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(set_err) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {set_err}");
                return;
            }
            warn!(error = %err, "File logging unavailable; continuing with console only");
        }
    }

    if let Err(err) = panic_hook {
        warn!(error = %err, "Crash reports unavailable");
    }
}

fn parse_env_filter(filter: &str, sink: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|err| {
        eprintln!(
            "Invalid {sink} log filter '{filter}': {err}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn mode_name(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Server => "server",
        RunMode::Convert => "convert",
    }
}

fn log_startup_metadata(mode: RunMode, data_dir: &Path) {
    info!(
        mode = mode_name(mode),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    if let Err(err) = initialize_data_dir(data_dir) {
        warn!(error = %err, "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// CLI flag, then `PORT`, then the config file.
fn resolve_port(cli: Option<u16>, env: Option<&str>, config: &AppConfig) -> u16 {
    cli.or_else(|| env.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(config.server.port)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);
    let port = resolve_port(
        port_override,
        std::env::var("PORT").ok().as_deref(),
        &config,
    );
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = app_state_with_config(config, data_dir)?;
    state.workspace().purge_scratch();

    let shutdown = CancellationToken::new();
    let sweeper_state = state.clone();
    let sweeper = retention::spawn_sweeper(
        state.workspace().clone(),
        &state.config().retention,
        Arc::new(move |id| sweeper_state.is_job_active(id)),
        shutdown.child_token(),
    );

    let public_dir = state.paths().public_dir.clone();
    let static_dir = if public_dir.is_dir() {
        Some(public_dir.as_path())
    } else {
        info!(public_dir = %public_dir.display(), "Public directory not found; serving API only");
        None
    };
    let app = app_router_with_static(state.clone(), static_dir);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Starting framevec server");

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }
    Ok(())
}

async fn run_convert(video: PathBuf, frame_skip: u32, data_dir: PathBuf) -> Result<()> {
    if !video.is_file() {
        bail!("Video file does not exist: {}", video.display());
    }

    let config = load_config(&data_dir);
    let state = app_state_with_config(config, data_dir)?;
    let (job_id, mut events, handle) = state
        .spawn_conversion(video.clone(), frame_skip, None)
        .context("failed to start conversion job")?;
    info!(job_id = %job_id, video = %video.display(), frame_skip, "Converting video");

    let start = Instant::now();
    let mut terminal: Option<ProgressEvent> = None;
    while let Some(event) = events.recv().await {
        eprint!(
            "\r{}",
            render_progress(event.progress(), start.elapsed().as_secs_f64())
        );
        if event.is_terminal() {
            terminal = Some(event);
            break;
        }
    }
    eprintln!();

    let outcome = handle.await.context("conversion task failed")?;
    let message = terminal
        .as_ref()
        .map(ProgressEvent::message)
        .unwrap_or("job ended without a result");
    if outcome.status != JobStatus::Completed {
        bail!("{message}");
    }

    if let Some(report) = &outcome.report {
        info!(
            frames = report.total,
            kept = report.kept,
            discarded = report.discarded,
            "{message}"
        );
    }
    println!("{job_id}\t{}", state.workspace().job_dir(job_id).display());
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(percent: f64, elapsed: f64) -> String {
    let fraction = (percent / 100.0).clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let eta = if fraction > 0.0 && fraction < 1.0 {
        format!(
            " | ETA: {}",
            format_duration(elapsed * (1.0 - fraction) / fraction)
        )
    } else {
        String::new()
    };

    format!(
        "[{bar}] {:5.1}% | Elapsed: {}{eta}    ",
        fraction * 100.0,
        format_duration(elapsed),
    )
}

#[cfg(test)]
mod duration_tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(6595.0), "01:49:55");
        assert_eq!(format_duration(45.0), "00:00:45");
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(-3.0), "00:00:00");
    }
}
