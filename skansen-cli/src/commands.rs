use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use skansen_config::SkansenConfig;
use skansen_core::IpFamily;
use skansen_engine::source::parse_document;
use skansen_engine::{run_enforcer, shutdown_on_ctrl_c};
use skansen_policy::PrefixTranslator;
use skansen_simulator::{load_chaos_config, ChaosConfig, Simulator};
use skansen_telemetry::logging::EventLogger;
use tracing::{info, warn};

use crate::error::CliError;

#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Enforce the policy on the configured kernel backend until interrupted
    Run(RunArgs),
    /// Run a deterministic chaos simulation against the in-memory kernel
    Simulate(SimulateArgs),
    /// Run simulations over consecutive seeds until one fails
    Fuzz(FuzzArgs),
    /// Print the block entries a policy file resolves to, per interface
    Translate(TranslateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Configuration file; defaults to config/skansen.yaml plus SKANSEN_* overrides.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Number of resync ticks
    #[arg(long, default_value_t = 100)]
    pub ticks: u64,
    /// Optional chaos configuration (YAML)
    #[arg(long)]
    pub chaos: Option<PathBuf>,
    /// Fail unless the final state hash equals this value
    #[arg(long)]
    pub validate_hash: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct FuzzArgs {
    /// Initial seed (incremented per iteration)
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
    /// Number of iterations (0 for unlimited)
    #[arg(long, default_value_t = 0)]
    pub iterations: u64,
    #[arg(long, default_value_t = 500)]
    pub ticks: u64,
}

#[derive(Args, Debug, Clone)]
pub struct TranslateArgs {
    /// Policy document (YAML)
    pub policy: PathBuf,
    /// Only show this interface
    #[arg(short, long)]
    pub interface: Option<String>,
}

pub async fn run_command(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Run(args) => run_production_mode(args).await,
        Commands::Simulate(args) => run_simulation_mode(args),
        Commands::Fuzz(args) => run_fuzz_mode(args),
        Commands::Translate(args) => run_translate(args).await,
    }
}

async fn run_production_mode(args: RunArgs) -> Result<(), CliError> {
    let config = match args.config {
        Some(path) => SkansenConfig::load_from_path(path)?,
        None => SkansenConfig::load()?,
    };
    EventLogger::init(&config.telemetry.log_level, config.telemetry.json_logs)?;
    info!(backend = ?config.kernel.backend, policy = %config.policy.path.display(), "Starting enforcer");
    run_enforcer(config, shutdown_on_ctrl_c()).await?;
    Ok(())
}

fn chaos_config(path: Option<PathBuf>) -> Result<ChaosConfig, CliError> {
    Ok(match path {
        Some(path) => load_chaos_config(path)?,
        None => ChaosConfig::default(),
    })
}

fn run_simulation_mode(args: SimulateArgs) -> Result<(), CliError> {
    EventLogger::init("warn", false)?;
    simulate(args)
}

fn simulate(args: SimulateArgs) -> Result<(), CliError> {
    let config = chaos_config(args.chaos)?;
    let report = Simulator::new(args.seed, config).run(args.ticks)?;
    print!("{}", serde_yaml::to_string(&report)?);

    if let Some(expected) = args.validate_hash {
        if expected != report.state_hash {
            return Err(CliError::HashMismatch {
                expected,
                actual: report.state_hash,
            });
        }
    }
    Ok(())
}

fn run_fuzz_mode(args: FuzzArgs) -> Result<(), CliError> {
    EventLogger::init("warn", false)?;
    let mut seed = args.seed;
    let mut count = 0;
    loop {
        if let Err(err) = Simulator::new(seed, ChaosConfig::default()).run(args.ticks) {
            warn!(seed, error = %err, "Simulation failed");
            return Err(CliError::Simulation(err));
        }
        count += 1;
        if args.iterations > 0 && count >= args.iterations {
            break;
        }
        seed = seed.wrapping_add(1);
    }
    println!("{count} seeds converged");
    Ok(())
}

#[derive(Serialize)]
struct TranslatedEntry {
    prefix: String,
    key: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum TranslatedInterface {
    Tables(BTreeMap<IpFamily, Vec<TranslatedEntry>>),
    Error { error: String },
}

async fn run_translate(args: TranslateArgs) -> Result<(), CliError> {
    EventLogger::init("warn", false)?;
    let text = tokio::fs::read_to_string(&args.policy)
        .await
        .map_err(|source| CliError::Read {
            path: args.policy.clone(),
            source,
        })?;
    let snapshot = parse_document(&text)?;
    let translator = PrefixTranslator::new();

    let mut out = BTreeMap::new();
    for interface in snapshot.interfaces() {
        if args.interface.as_ref().is_some_and(|only| *only != interface) {
            continue;
        }
        let translated = match translator.desired_state(&snapshot, &interface) {
            Ok(desired) => TranslatedInterface::Tables(
                desired
                    .families()
                    .map(|family| {
                        let entries = desired
                            .family(family)
                            .into_iter()
                            .map(|e| TranslatedEntry {
                                prefix: e.to_string(),
                                key: e.key_hex(),
                            })
                            .collect();
                        (family, entries)
                    })
                    .collect(),
            ),
            Err(err) => TranslatedInterface::Error {
                error: err.to_string(),
            },
        };
        out.insert(interface, translated);
    }
    print!("{}", serde_yaml::to_string(&out)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simulate_flags() {
        let cli = Cli::try_parse_from(["skansen", "simulate", "--seed", "9", "--ticks", "5"]).unwrap();
        match cli.command {
            Commands::Simulate(args) => {
                assert_eq!(args.seed, 9);
                assert_eq!(args.ticks, 5);
                assert!(args.validate_hash.is_none());
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn translate_requires_a_policy_file() {
        assert!(Cli::try_parse_from(["skansen", "translate"]).is_err());
        let cli = Cli::try_parse_from(["skansen", "translate", "p.yaml", "-i", "eth0"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Translate(TranslateArgs { interface: Some(ref i), .. }) if i == "eth0"
        ));
    }

    #[test]
    fn simulate_rejects_wrong_hash() {
        let args = SimulateArgs {
            seed: 3,
            ticks: 5,
            chaos: None,
            validate_hash: Some("00".into()),
        };
        assert!(matches!(
            simulate(args),
            Err(CliError::HashMismatch { .. })
        ));
    }
}
