// Author: Ayush Srivastava
//! Run a local consensus cluster and stop it when it stalls.
//!
//! Launches one node process per validator, polls every node's progress
//! counter on a fixed cadence and tears the cluster down when a validator
//! stagnates, the configured duration elapses, or the operator interrupts.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use consensus_sim_harness::utils::format_duration;
use consensus_sim_harness::{
    load_settings, render_toml, HarnessError, SimulationController, SimulationOutcome,
    SimulationReport,
};
use consensus_simulation::SimulationConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

fn build_cli() -> Command {
    Command::new("run_simulation")
        .version(consensus_sim_harness::VERSION)
        .about("Run a multi-process consensus simulation with liveness monitoring")
        .arg(Arg::new("base-layer-node-url")
            .long("base-layer-node-url")
            .value_name("URL")
            .help("Base layer endpoint handed to every node"))
        .arg(Arg::new("num-validators")
            .long("num-validators")
            .value_name("N")
            .help("Number of validators in the cluster (at least 2)")
            .value_parser(value_parser!(usize)))
        .arg(Arg::new("node-binary")
            .long("node-binary")
            .value_name("PATH")
            .help("Node binary launched once per validator")
            .value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("db-dir")
            .long("db-dir")
            .value_name("DIR")
            .help("Existing data root containing exactly data0..data{N-1}")
            .value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("log-dir")
            .long("log-dir")
            .value_name("DIR")
            .help("Directory receiving validator{id}.txt logs")
            .value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("stagnation-threshold")
            .long("stagnation-threshold")
            .value_name("SECS")
            .help("Seconds without progress before a validator counts as stagnated")
            .value_parser(value_parser!(u64)))
        .arg(Arg::new("duration")
            .long("duration")
            .value_name("SECS")
            .help("Total run duration; runs until stagnation or interrupt when absent")
            .value_parser(value_parser!(u64)))
        .arg(Arg::new("monitoring-period")
            .long("monitoring-period")
            .value_name("SECS")
            .help("Seconds between progress polls")
            .value_parser(value_parser!(u64)))
        .arg(Arg::new("metric-name")
            .long("metric-name")
            .value_name("NAME")
            .help("Progress counter scraped from the monitoring endpoint"))
        .arg(Arg::new("config")
            .short('c')
            .long("config")
            .value_name("FILE")
            .help("TOML settings file")
            .value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("report")
            .long("report")
            .value_name("FILE")
            .help("Write the run report as JSON")
            .value_parser(value_parser!(PathBuf)))
        .arg(Arg::new("dump-config")
            .long("dump-config")
            .help("Print the resolved settings as TOML and exit")
            .action(ArgAction::SetTrue))
}

/// Apply flags given on the command line over file and environment settings
fn apply_overrides(config: &mut SimulationConfig, matches: &ArgMatches) {
    if let Some(url) = matches.get_one::<String>("base-layer-node-url") {
        config.base_layer_node_url = url.clone();
    }
    if let Some(count) = matches.get_one::<usize>("num-validators") {
        config.num_validators = *count;
    }
    if let Some(binary) = matches.get_one::<PathBuf>("node-binary") {
        config.node_binary = binary.clone();
    }
    if let Some(dir) = matches.get_one::<PathBuf>("db-dir") {
        config.data_root = Some(dir.clone());
    }
    if let Some(dir) = matches.get_one::<PathBuf>("log-dir") {
        config.log_root = Some(dir.clone());
    }
    if let Some(secs) = matches.get_one::<u64>("stagnation-threshold") {
        config.stagnation_timeout_secs = *secs;
    }
    if let Some(secs) = matches.get_one::<u64>("duration") {
        config.duration_secs = Some(*secs);
    }
    if let Some(secs) = matches.get_one::<u64>("monitoring-period") {
        config.monitoring_period_ms = Duration::from_secs(*secs).as_millis() as u64;
    }
    if let Some(name) = matches.get_one::<String>("metric-name") {
        config.metric_name = name.clone();
    }
}

/// Cancel `token` on the first Ctrl-C or SIGTERM
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "Ctrl-C handler unavailable");
                    return;
                }
            }
            _ = terminate => {}
        }

        warn!("interrupt received, stopping simulation");
        token.cancel();
    });
}

fn print_report(report: &SimulationReport) {
    let outcome = match &report.outcome {
        SimulationOutcome::DurationElapsed => "duration elapsed".to_string(),
        SimulationOutcome::Stagnated { validators } => format!("stagnated (validators {:?})", validators),
        SimulationOutcome::Interrupted => "interrupted".to_string(),
    };

    println!("{}", report.harness_version);
    println!("Simulation finished: {}", outcome);
    println!("Elapsed: {}", format_duration(Duration::from_millis(report.elapsed_ms)));
    println!("Data root: {}", report.data_root.display());
    println!("Logs: {}", report.log_root.display());
    for (id, height) in &report.last_heights {
        match height {
            Some(height) => println!("  validator {}: height {}", id, height),
            None => println!("  validator {}: never reported", id),
        }
    }
}

async fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let settings_file = matches.get_one::<PathBuf>("config");
    let mut config = load_settings(settings_file.map(PathBuf::as_path))
        .context("failed to load settings")?;
    apply_overrides(&mut config, matches);

    if matches.get_flag("dump-config") {
        print!("{}", render_toml(&config)?);
        return Ok(());
    }

    let controller = SimulationController::for_processes(config)?;
    cancel_on_signal(controller.cancellation_token());

    let report = controller.run().await?;
    print_report(&report);

    if let Some(path) = matches.get_one::<PathBuf>("report") {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("failed to write report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    Ok(())
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<HarnessError>()
        .map(HarnessError::exit_code)
        .unwrap_or(1)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let matches = build_cli().get_matches();

    let code = match run(&matches).await {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "simulation aborted");
            eprintln!("Error: {:#}", err);
            exit_code(&err)
        }
    };

    std::process::exit(code);
}
