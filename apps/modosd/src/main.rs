mod builtin;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use modos_http::{HttpConfig, HttpProtocolHandler};
use modos_kernel::{ServerBuilder, ServerConfig, StopOptions};
use modos_modules::{ModuleFactoryRegistry, ModuleScanner, ScanReport, resolve_order};
use modos_protocol::Module;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "modosd")]
#[command(about = "modos server core and module manager")]
struct Cli {
    /// YAML server config; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Module root to scan. Repeatable; replaces the configured roots.
    #[arg(long = "module-dir", global = true)]
    module_dirs: Vec<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server until Ctrl+C or SIGTERM.
    Serve {
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Inspect modules on disk.
    Modules {
        #[command(subcommand)]
        command: ModulesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ModulesCommand {
    List,
    Status { name: String },
    /// Scan, validate manifests, and resolve the start order.
    Setup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).await?;

    match cli.command {
        Command::Serve { listen } => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .json()
                .init();
            serve(config, listen).await
        }
        Command::Modules { command } => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .compact()
                .init();
            match command {
                ModulesCommand::List => list_modules(&config).await,
                ModulesCommand::Status { name } => module_status(&config, &name).await,
                ModulesCommand::Setup => setup_modules(&config).await,
            }
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

async fn load_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path).await?,
        None => ServerConfig::default(),
    };
    if !cli.module_dirs.is_empty() {
        config.module_dirs = cli.module_dirs.clone();
    }
    Ok(config)
}

async fn serve(mut config: ServerConfig, listen: Option<SocketAddr>) -> Result<()> {
    if let Some(listen) = listen {
        config.http.host = listen.ip().to_string();
        config.http.port = listen.port();
    }
    let http_config = HttpConfig {
        host: config.http.host.clone(),
        port: config.http.port,
        drain_timeout: Duration::from_millis(config.http.drain_timeout_ms),
    };

    let factories = ModuleFactoryRegistry::new();
    let server = ServerBuilder::from_config(config)
        .factories(factories.clone())
        .build();
    builtin::install(&server, &factories);
    server.add_protocol(Arc::new(HttpProtocolHandler::new(
        http_config,
        server.bus().clone(),
        Arc::clone(server.endpoints()),
        server.policy().clone(),
    )));

    server.start().await.context("server failed to start")?;
    let snapshot = server.snapshot();
    info!(
        modules = snapshot.modules,
        running = snapshot.running_modules,
        endpoints = snapshot.endpoints,
        port = ?server.bound_port(modos_http::HTTP_PROTOCOL),
        "modosd ready"
    );

    shutdown_signal().await;
    info!("shutdown requested");
    server.stop(StopOptions::default()).await?;
    Ok(())
}

async fn scan(config: &ServerConfig) -> Result<ScanReport> {
    ModuleScanner::new(config.module_dirs.iter().cloned())
        .scan()
        .await
}

/// Scanned modules followed by built-ins not shadowed on disk.
fn catalog(report: &ScanReport) -> Vec<Module> {
    let mut modules = report.discovered.clone();
    for module in builtin::builtin_modules() {
        if !modules.iter().any(|known| known.name == module.name) {
            modules.push(module);
        }
    }
    modules
}

async fn list_modules(config: &ServerConfig) -> Result<()> {
    let report = scan(config).await?;
    let modules = catalog(&report);
    println!("{:<24} {:<10} {:<10} PATH", "NAME", "VERSION", "TYPE");
    for module in &modules {
        println!(
            "{:<24} {:<10} {:<10} {}",
            module.name,
            module.version,
            module.module_type,
            module.path.display()
        );
    }
    for skipped in &report.skipped {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped");
    }
    Ok(())
}

async fn module_status(config: &ServerConfig, name: &str) -> Result<()> {
    let report = scan(config).await?;
    let Some(module) = catalog(&report)
        .into_iter()
        .find(|module| module.name.as_str() == name)
    else {
        bail!("module not found: {name}");
    };
    println!("{}", serde_json::to_string_pretty(&module)?);
    Ok(())
}

async fn setup_modules(config: &ServerConfig) -> Result<()> {
    let report = scan(config).await?;
    for skipped in &report.skipped {
        error!(path = %skipped.path.display(), reason = %skipped.reason, "invalid module");
    }
    let modules = catalog(&report);
    let order = resolve_order(&modules)?;
    for (position, module) in order.iter().enumerate() {
        println!("{:>3}. {module}", position + 1);
    }
    if !report.skipped.is_empty() {
        bail!("{} module(s) failed validation", report.skipped.len());
    }
    info!(modules = order.len(), "setup complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
