use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;

use nsrvm::config::ServicesConfig;
use nsrvm::error::Result;
use nsrvm::supervisor::Supervisor;
use nsrvm::watcher;

#[derive(Parser)]
#[command(name = "nsrvm", about = "nsrvm — node-service supervisor")]
struct Cli {
    /// Path to the services config file
    #[arg(short, long, default_value = "services/services-config.json")]
    config: PathBuf,

    /// Directory service modules are resolved from (default: the config
    /// file's directory)
    #[arg(short = 'd', long)]
    services_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start all configured services and supervise them
    Run,
    /// Validate the config file without starting anything
    Validate,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {e}", "[nsrvm error]".red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let services_dir = cli.services_dir.clone().unwrap_or_else(|| {
        cli.config
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf()
    });

    match cli.command {
        Commands::Validate => {
            let cfg = ServicesConfig::try_load(&cli.config)?;
            println!(
                "{} {} is valid ({} services)",
                "✓".green(),
                cli.config.display(),
                cfg.services.len()
            );
            for (name, svc) in &cfg.services {
                let caps = if svc.allowed_api.is_empty() {
                    String::new()
                } else {
                    format!(" (allowed: {})", svc.allowed_api.join(", "))
                };
                println!("  {} :{}{}", name.cyan(), svc.api_port, caps);
            }
        }

        Commands::Run => {
            let sup = Supervisor::new(cli.config.clone(), services_dir);
            sup.reload_config().await;

            let (tx, mut rx) = tokio::sync::mpsc::channel(8);
            let _watch_guard = watcher::spawn_watcher(cli.config.clone(), tx);
            {
                let sup = sup.clone();
                tokio::spawn(async move {
                    while rx.recv().await.is_some() {
                        tracing::info!("config changed, reconciling");
                        sup.reload_config().await;
                    }
                });
            }

            wait_for_shutdown().await;
            // Full shutdown path: stop everything, then exit 0. Relaunch
            // is up to the host process manager.
            sup.restart_server().await;
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("cannot install SIGTERM handler: {e}");
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    tokio::signal::ctrl_c().await.ok();
}
