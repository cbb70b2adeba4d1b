//! Snipbox CLI
//!
//! Runs the HTTP execution service, or a single snippet from the command line.

use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snipbox::{
    Config, EXAMPLE_CONFIG, ExecutionEvent, ExecutionGateway, IsolateBackend, Outcome, SessionId,
    prepare_cgroup,
};
use snipbox_server::{AppState, serve, shutdown_signal};
use tokio::net::TcpListener;
use tracing::{Level, debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "snipbox")]
#[command(about = "Sandboxed execution service for short code snippets")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP service
    Serve {
        /// Listen address (overrides `server.bind`)
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Seconds in-flight executions get to finish on shutdown
        #[arg(long, default_value = "10")]
        grace: u64,
    },

    /// Run one snippet through the full pipeline and print its output
    Run {
        /// Source file to run
        #[arg(value_name = "FILE")]
        source: PathBuf,

        /// Language id or alias (e.g. python, js, c)
        #[arg(short, long)]
        language: String,

        /// File whose contents are fed to stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Write the example configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "snipbox.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// List configured languages
    Languages,

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Init { output, force } = &cli.command {
        return init_config(output, *force).await;
    }

    match &cli.config {
        Some(path) => info!(?path, "loading configuration"),
        None => debug!("using embedded configuration"),
    }
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Serve { bind, grace } => {
            setup_cgroup(&mut config);
            run_server(config, bind, Duration::from_secs(grace)).await
        }
        Commands::Run {
            source,
            language,
            input,
        } => {
            setup_cgroup(&mut config);
            run_snippet(config, &source, &language, input.as_deref()).await
        }
        Commands::Languages => list_languages(&config),
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
        Commands::Init { .. } => Ok(()),
    }
}

/// Set up the cgroup hierarchy when cgroup mode is enabled, falling back to
/// RLIMIT_AS memory limiting when that is not possible
fn setup_cgroup(config: &mut Config) {
    if !config.cgroup {
        return;
    }
    match prepare_cgroup(&config.cg_root) {
        Ok(true) => debug!("cgroup hierarchy ready"),
        Ok(false) => {
            warn!(
                "cgroup support unavailable (memory controller not found), falling back to RLIMIT_AS"
            );
            config.cgroup = false;
        }
        Err(e) => {
            warn!("cgroup setup failed: {e}, falling back to RLIMIT_AS memory limiting");
            config.cgroup = false;
        }
    }
}

fn build_gateway(config: &Config) -> Result<ExecutionGateway> {
    let backend = Arc::new(IsolateBackend::from_config(config));
    ExecutionGateway::new(config, backend).context("invalid language configuration")
}

async fn run_server(config: Config, bind: Option<SocketAddr>, grace: Duration) -> Result<()> {
    let gateway = build_gateway(&config)?;
    let dispatcher = gateway.start();

    let addr = bind.unwrap_or(config.server.bind);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    let state = AppState::new(
        gateway.clone(),
        Duration::from_secs(config.server.keep_alive_secs),
    );

    // Draining the gateway finishes every open event stream, which lets the
    // HTTP server's graceful shutdown complete
    let draining = gateway.clone();
    let (drained_tx, drained_rx) = tokio::sync::oneshot::channel();
    let shutdown = async move {
        shutdown_signal().await;
        tokio::spawn(async move {
            draining.shutdown(grace).await;
            let _ = drained_tx.send(());
        });
    };

    serve(listener, state, shutdown).await.context("server error")?;

    let _ = drained_rx.await;
    dispatcher.abort();
    info!("snipbox shut down");
    Ok(())
}

async fn run_snippet(
    config: Config,
    source: &Path,
    language: &str,
    input: Option<&Path>,
) -> Result<()> {
    let source = tokio::fs::read_to_string(source)
        .await
        .context("failed to read source file")?;
    let stdin = match input {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .context("failed to read input file")?,
        ),
        None => None,
    };

    let gateway = build_gateway(&config)?;
    let _dispatcher = gateway.start();

    let submission = gateway
        .submit(SessionId::new("cli"), language, source, stdin)
        .context("submission rejected")?;
    let mut events = gateway
        .subscribe(&submission.request_id, 0)
        .context("request vanished before it could be watched")?;

    let mut result = None;
    while let Some(event) = events.next().await {
        match event.event {
            ExecutionEvent::Stdout { data } => {
                let mut out = std::io::stdout().lock();
                out.write_all(data.as_bytes())?;
                out.flush()?;
            }
            ExecutionEvent::Stderr { data } => {
                let mut err = std::io::stderr().lock();
                err.write_all(data.as_bytes())?;
                err.flush()?;
            }
            ExecutionEvent::Queued { position } => debug!(position, "queued"),
            ExecutionEvent::Started => debug!("started"),
            ExecutionEvent::Finished(r) => result = Some(r),
        }
    }
    gateway.shutdown(Duration::from_secs(1)).await;

    let result = result.context("execution ended without a result")?;
    // Log via tracing (stderr), keeping stdout clean for piping
    info!(
        outcome = ?result.outcome,
        exit_code = result.exit_code,
        duration = format_args!("{:.3}s", result.duration.as_secs_f64()),
        truncated = result.truncated,
        "execution result"
    );

    if result.outcome == Outcome::Completed {
        Ok(())
    } else {
        std::process::exit(result.exit_code.filter(|&c| c != 0).unwrap_or(1));
    }
}

fn list_languages(config: &Config) -> Result<()> {
    let gateway = build_gateway(config)?;
    println!("Available languages:\n");

    for lang in gateway.languages() {
        let kind = if lang.compiled {
            "compiled"
        } else {
            "interpreted"
        };
        let aliases = if lang.aliases.is_empty() {
            String::new()
        } else {
            format!(" [{}]", lang.aliases.join(", "))
        };
        println!("  {:<12} {} ({}){}", lang.id, lang.name, kind, aliases);
    }
    Ok(())
}

fn show_config(config: &Config) {
    println!("Server:");
    println!("  Bind: {}", config.server.bind);
    println!("  SSE keep-alive: {}s", config.server.keep_alive_secs);
    println!();
    println!("Gateway:");
    println!("  Max source: {} bytes", config.gateway.max_source_bytes);
    println!("  Max stdin: {} bytes", config.gateway.max_stdin_bytes);
    println!("  Max output: {} bytes", config.gateway.max_output_bytes);
    println!(
        "  End-to-end timeout: {}s",
        config.gateway.end_to_end_timeout_secs
    );
    println!();
    println!("Pool:");
    println!("  Max workers: {}", config.pool.max_workers);
    println!("  Warm target per language: {}", config.pool.target_ready);
    println!("  Queue capacity: {}", config.pool.queue_capacity);
    println!();
    println!("Quota:");
    println!(
        "  Burst: {} (one token every {}ms)",
        config.quota.burst, config.quota.refill_interval_ms
    );
    println!(
        "  Concurrent per session: {}",
        config.quota.max_concurrent_per_session
    );
    println!(
        "  Concurrent per origin: {}",
        config.quota.max_concurrent_per_origin
    );
    println!();
    println!("Default resource limits:");
    println!("  Time limit: {:?}", config.default_limits.time_limit);
    println!(
        "  Wall time limit: {:?}",
        config.default_limits.wall_time_limit
    );
    println!(
        "  Memory limit: {:?} KB",
        config.default_limits.memory_limit
    );
    println!("  Max processes: {:?}", config.default_limits.max_processes);
    println!();
    println!("Isolate binary: {}", config.isolate_binary().display());
    println!("cgroup mode: {}", config.cgroup);
    println!();
    println!("Languages configured: {}", config.languages.len());
}

async fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
