//! routewarden - health-check supervisor for anycast routes
//!
//! Probes services and tells an ExaBGP-style BGP speaker to announce a
//! check's prefixes while it is healthy and withdraw them when it is not.

mod announcer;
mod bridge;
mod cli;
mod error;
mod logging;
mod manifest;
mod notify;
mod reconcile;
mod route;
mod sickbay;
mod warden;

use std::path::Path;

use cli::{Cli, Commands};
use error::{Error, Result};
use manifest::RoutewardenConfig;
use route::RouteStateMachine;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Completion { shell } => {
            Cli::generate_completion(shell);
            Ok(())
        }
        Commands::Check { json } => {
            let config = load(&cli.config, cli.verbose)?;
            print_checks(&config, json)
        }
        Commands::Probe { check, json } => {
            let config = load(&cli.config, cli.verbose)?;
            probe_once(&config, &check, json)
        }
        Commands::Run => {
            let config = load(&cli.config, cli.verbose)?;
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                let bridge = bridge::Bridge::start(&cli.config, config).await?;
                bridge.run().await
            })
        }
    }
}

/// Load the config, then set up logging from it
fn load(path: &Path, verbosity: u8) -> Result<RoutewardenConfig> {
    let config = manifest::load(path)?;
    logging::init(verbosity, &config.logging.level, config.logging.format);
    Ok(config)
}

fn print_checks(config: &RoutewardenConfig, json: bool) -> Result<()> {
    if json {
        let checks: Vec<serde_json::Value> = config
            .checks
            .iter()
            .map(|def| {
                let commands: Vec<String> = RouteStateMachine::new(def)
                    .on_healthy()
                    .iter()
                    .map(|d| d.to_command())
                    .collect();
                serde_json::json!({
                    "name": def.name,
                    "description": def.description,
                    "method": def.probe.name(),
                    "interval": def.interval,
                    "timeout": def.timeout,
                    "rise": def.rise,
                    "fall": def.fall,
                    "announce": commands,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&checks).map_err(|e| Error::Io(e.into()))?);
        return Ok(());
    }

    println!("Configuration OK: {} check(s)", config.checks.len());
    for def in &config.checks {
        println!();
        println!(
            "{} ({} every {}s, timeout {}s, rise {}, fall {})",
            def.name,
            def.probe.name(),
            def.interval,
            def.timeout,
            def.rise,
            def.fall
        );
        if let Some(description) = &def.description {
            println!("  {}", description);
        }
        for directive in RouteStateMachine::new(def).on_healthy() {
            println!("  {}", directive.to_command());
        }
    }
    Ok(())
}

fn probe_once(config: &RoutewardenConfig, name: &str, json: bool) -> Result<()> {
    let def = config
        .get_check(name)
        .ok_or_else(|| Error::CheckNotFound(name.to_string()))?;
    let probe = def
        .probe
        .build(def.timeout_duration())
        .map_err(|e| Error::ProbeSetup {
            check: def.name.clone(),
            message: e.to_string(),
        })?;

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(sickbay::runner::execute(def, &probe));

    if json {
        let body = serde_json::json!({
            "check": def.name,
            "status": outcome.status.to_string(),
            "detail": outcome.detail,
            "duration_ms": outcome.duration.as_millis() as u64,
        });
        println!("{}", serde_json::to_string_pretty(&body).map_err(|e| Error::Io(e.into()))?);
    } else {
        println!("{}: {}", def.name, outcome.summary());
    }

    if !outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
