//! CLI entry point for md2pdf
//!
//! Parses command line arguments, installs logging and runs one of the three
//! modes: batch (default), `--watch`, or `--daemon`.

use clap::Parser;
use md2pdf_daemon::{wait_for_signal, Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// md2pdf - Markdown to PDF conversion with LaTeX fallbacks
#[derive(Parser, Debug)]
#[command(name = "md2pdf")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; missing file means defaults
    #[arg(short, long, default_value = "md2pdf.toml")]
    config: PathBuf,

    /// Input directory with Markdown files
    #[arg(long)]
    input: Option<PathBuf>,

    /// Output directory for PDFs, logs and the job cache
    #[arg(long)]
    output: Option<PathBuf>,

    /// LaTeX template passed to Pandoc
    #[arg(long, conflicts_with = "no_template")]
    template: Option<PathBuf>,

    /// Convert without a template even if one is configured
    #[arg(long)]
    no_template: bool,

    /// Keep polling the input directory
    #[arg(long, conflicts_with = "daemon")]
    watch: bool,

    /// Run as a daemon: watch mode plus control API and metrics servers
    #[arg(long)]
    daemon: bool,

    /// Seconds between watch passes
    #[arg(long)]
    sleep: Option<u64>,

    /// Ignore the job cache (first pass only in watch/daemon mode)
    #[arg(long)]
    force: bool,

    /// Convert even when the template fails validation
    #[arg(long)]
    allow_invalid_template: bool,

    /// Concurrent conversions (0 = derive from CPU count)
    #[arg(long)]
    workers: Option<u32>,

    /// Skip the Pandoc availability check. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    api_port: Option<u16>,

    #[arg(long)]
    metrics_port: Option<u16>,

    #[arg(long)]
    pidfile: Option<PathBuf>,
}

/// Command line flags override file and environment values.
fn apply_args(cfg: &mut Config, args: &Args) {
    if let Some(input) = &args.input {
        cfg.paths.input_dir = input.clone();
    }
    if let Some(output) = &args.output {
        cfg.paths.output_dir = output.clone();
    }
    if let Some(template) = &args.template {
        cfg.paths.template = Some(template.clone());
    }
    if args.no_template {
        cfg.paths.template = None;
    }
    if let Some(pidfile) = &args.pidfile {
        cfg.paths.pidfile = pidfile.clone();
    }
    if let Some(workers) = args.workers {
        cfg.workers.max_concurrent_jobs = workers;
    }
    if let Some(secs) = args.sleep {
        cfg.watch.interval_secs = secs.max(1);
    }
    if args.allow_invalid_template {
        cfg.conversion.bypass_validation = true;
    }
    if let Some(port) = args.api_port {
        cfg.server.api_port = port;
    }
    if let Some(port) = args.metrics_port {
        cfg.server.metrics_port = port;
    }
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    apply_args(&mut config, &args);

    if args.skip_checks {
        warn!("skipping toolchain checks (--skip-checks enabled)");
    }
    if config.conversion.bypass_validation {
        warn!("template validation failures will be bypassed");
    }

    let daemon = match Daemon::new(config, args.skip_checks) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "failed to initialize");
            return ExitCode::FAILURE;
        }
    };
    info!(
        input = %daemon.config().paths.input_dir.display(),
        output = %daemon.config().paths.output_dir.display(),
        template = ?daemon.config().paths.template,
        workers = daemon.plan().max_concurrent_jobs,
        "md2pdf starting"
    );

    if args.daemon {
        if let Err(e) = daemon.run_daemon(args.force).await {
            error!(error = %e, "daemon error");
            return ExitCode::FAILURE;
        }
        ExitCode::SUCCESS
    } else if args.watch {
        daemon.run_watch(args.force, wait_for_signal()).await;
        ExitCode::SUCCESS
    } else {
        let summary = daemon.run_batch(args.force).await;
        for line in summary.lines() {
            println!("{}", line);
        }
        ExitCode::from(summary.exit_code() as u8)
    }
}
