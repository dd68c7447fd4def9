use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use volley::cli::config::Config;
use volley::cli::{parse_output, Cli, Commands, OutputTarget};
use volley::engine::control::{parse_control_command, ControlCommand};
use volley::engine::io_bridge::IoBridge;
use volley::engine::{Engine, EngineHandle};

/// Connections kept per host by the shared HTTP client.
const POOL_SIZE: usize = 512;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Ctrl-C (and SIGTERM on unix) cancel the run. A second Ctrl-C exits at once.
fn spawn_signal_listener(handle: EngineHandle) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "Signal listener unavailable");
                    return;
                }
            };
            rt.block_on(async move {
                loop {
                    wait_for_shutdown_signal().await;
                    if handle.is_cancelled() {
                        warn!("Second interrupt, exiting immediately");
                        std::process::exit(130);
                    }
                    handle.cancel();
                }
            });
        })
        .map(|_| ())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn spawn_command_reader(handle: EngineHandle) -> std::io::Result<()> {
    println!("Interactive mode enabled. Commands: status, stop");
    println!("   Type commands and press Enter.\n");
    std::thread::Builder::new()
        .name("control".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines().map_while(Result::ok) {
                if handle.is_finished() {
                    break;
                }
                match parse_control_command(&line) {
                    Some(cmd) => {
                        if let Some(status) = handle.apply(cmd) {
                            println!(
                                "[{:.1}s] stage {} target {} active {}{}",
                                status.elapsed_secs,
                                status.stage + 1,
                                status.target_vus,
                                status.active_vus,
                                if status.draining { " (draining)" } else { "" }
                            );
                        }
                        if cmd == ControlCommand::Stop {
                            break;
                        }
                    }
                    None if !line.trim().is_empty() => println!("Unknown command: {}", line.trim()),
                    None => {}
                }
            }
        })
        .map(|_| ())
}

struct RunArgs {
    config: PathBuf,
    json: bool,
    export_json: Option<PathBuf>,
    out: Option<String>,
    timeout: Option<String>,
    graceful_stop: Option<String>,
    interactive: bool,
}

fn run(args: RunArgs) -> Result<i32> {
    let output = args.out.as_deref().map(parse_output).transpose()?;
    let mut config = Config::load(&args.config)?;
    if args.timeout.is_some() {
        config.timeout = args.timeout;
    }
    if args.graceful_stop.is_some() {
        config.graceful_stop = args.graceful_stop;
    }
    let options = config.engine_options()?;
    let plan = Arc::new(config.plan()?.clone());

    let transport = Arc::new(
        IoBridge::launch(num_cpus::get().max(2), POOL_SIZE)
            .context("failed to start HTTP client")?,
    );
    let engine = Engine::new(options, plan, transport)?;
    let handle = engine.handle();
    spawn_signal_listener(handle.clone())?;
    if args.interactive {
        spawn_command_reader(handle)?;
    }

    let report = engine.run()?;

    if args.json {
        println!("{}", report.to_json());
    } else {
        report.print_summary();
    }
    if let Some(path) = args.export_json {
        std::fs::write(&path, report.to_json())
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Report exported");
    }
    if let Some(OutputTarget::Csv(path)) = output {
        match std::fs::write(&path, volley::stats::csv::generate_csv(&report)) {
            Ok(()) => info!(path = %path.display(), "CSV export successful"),
            Err(e) => error!(path = %path.display(), error = %e, "CSV export failed"),
        }
    }
    Ok(report.exit_code())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run {
            config,
            json,
            export_json,
            out,
            timeout,
            graceful_stop,
            interactive,
        } => {
            let code = run(RunArgs {
                config,
                json,
                export_json,
                out,
                timeout,
                graceful_stop,
                interactive,
            })?;
            std::process::exit(code);
        }
        Commands::Init { output } => volley::cli::init::run_init(output.as_deref()),
        Commands::Validate { config } => volley::cli::validate::run_validate(&config),
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(Config);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)?;
                println!("JSON Schema written to {:?}", out_path);
            } else {
                println!("{}", schema_json);
            }
            Ok(())
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "volley", &mut std::io::stdout());
            Ok(())
        }
    }
}
