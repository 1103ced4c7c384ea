use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::{Path, PathBuf};
use wirekit::{run, ComponentHost, Deadline, HealthStatus, RunOptions, ShutdownOptions};
use wirekit_bootstrap::{AppConfig, CliArgs};

mod components;

use components::Settings;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// wirekit demo - a small component graph driven through its lifecycle
#[derive(Parser)]
#[command(name = "wirekit-demo")]
#[command(about = "wirekit demo - a small component graph driven through its lifecycle")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every component and run until Ctrl+C / SIGTERM
    Run,
    /// Start, probe health, serve a few requests, stop
    Check,
    /// Print the resolved start order and waves, then exit
    Plan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (WIREKIT__*) -> 4) CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    if args.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    let logging_config = config.logging.clone().unwrap_or_default();
    wirekit_bootstrap::init_logging(&logging_config, Path::new(&config.home_dir));

    let host = ComponentHost::new(config.host_options());
    components::register_all(&host, Settings::default())
        .context("Failed to register demo components")?;
    tracing::info!(mode = ?config.runtime.start_mode, "wirekit demo starting");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_host(&host, &config).await,
        Commands::Check => check(&host, &config).await,
        Commands::Plan => print_plan(&host),
    }
}

async fn run_host(host: &ComponentHost, config: &AppConfig) -> Result<()> {
    let opts = RunOptions {
        shutdown: ShutdownOptions::Future(wirekit_bootstrap::shutdown_signal()),
        startup_timeout: config.runtime.startup_timeout,
        shutdown_timeout: config.runtime.shutdown_timeout,
    };
    run(host, opts).await?;
    tracing::info!("wirekit demo stopped");
    Ok(())
}

/// Start everything; on failure stop whatever came up and return the start error.
async fn start_all(host: &ComponentHost, config: &AppConfig) -> Result<()> {
    let startup = config
        .runtime
        .startup_timeout
        .map_or_else(Deadline::none, Deadline::after);
    if let Err(err) = host.start(&startup).await {
        tracing::error!(error = %err, "Startup failed; stopping started components");
        if let Err(stop_err) = host.stop(&shutdown_deadline(config)).await {
            tracing::warn!(error = %stop_err, "Stop after failed startup reported errors");
        }
        return Err(err).context("startup failed");
    }
    Ok(())
}

async fn check(host: &ComponentHost, config: &AppConfig) -> Result<()> {
    start_all(host, config).await?;

    let snapshot = host
        .health(&Deadline::after(config.runtime.health_timeout))
        .await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    for body in components::simulate_requests(host, &["/users/1", "/users/1", "/orders"])? {
        println!("{body}");
    }

    host.stop(&shutdown_deadline(config))
        .await
        .context("shutdown failed")?;

    for (name, state) in host.component_states() {
        println!("{name:<40} {:<9} error={:?}", state.phase.to_string(), state.error);
    }

    if snapshot.status == HealthStatus::Unhealthy {
        anyhow::bail!("health check failed: {}", snapshot.status);
    }
    Ok(())
}

fn shutdown_deadline(config: &AppConfig) -> Deadline {
    config
        .runtime
        .shutdown_timeout
        .map_or_else(Deadline::none, Deadline::after)
}

fn print_plan(host: &ComponentHost) -> Result<()> {
    let plan = host.plan().context("invalid component graph")?;
    println!("start order:");
    for (i, name) in plan.start_order().iter().enumerate() {
        let deps = plan.dependencies_of(name);
        if deps.is_empty() {
            println!("  {:>2}. {name}", i + 1);
        } else {
            println!("  {:>2}. {name} (after {})", i + 1, deps.join(", "));
        }
    }
    println!("waves:");
    for (i, wave) in plan.waves().iter().enumerate() {
        println!("  {i}: {}", wave.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirekit::{ComponentDescriptor, LifecyclePhase};

    #[tokio::test]
    async fn failed_start_stops_what_came_up() {
        let host = ComponentHost::default();
        host.register(
            ComponentDescriptor::builder::<Settings>()
                .named("settings")
                .instance(Settings::default())
                .build()
                .unwrap(),
        )
        .unwrap();
        host.register(
            ComponentDescriptor::builder::<u32>()
                .named("listener")
                .depends_on("settings")
                .factory(|_| Ok(8080))
                .on_start(|_, _| async { anyhow::bail!("port in use") })
                .build()
                .unwrap(),
        )
        .unwrap();

        let err = start_all(&host, &AppConfig::default()).await.unwrap_err();
        assert!(format!("{err:#}").contains("port in use"));
        assert_eq!(host.phase(), LifecyclePhase::Stopped);
        assert_eq!(
            host.component_state("settings").unwrap().phase,
            LifecyclePhase::Stopped
        );
    }
}
