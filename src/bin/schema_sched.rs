//! Schema Scheduler CLI
//!
//! Schedules module and feature changes against a scheduler repository and
//! inspects its state.
//!
//! Usage:
//!   schema-sched install modules/feature-deps.yang --feature feat1
//!   schema-sched enable feature-deps feat2
//!   schema-sched apply --strict
//!   schema-sched status

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use schema_scheduler::{ApplyOutcome, ConnectOptions, Datastore, FeatureGraph, SchedulerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-sched")]
#[command(about = "Schedule schema changes and apply them on the next exclusive connect")]
struct Cli {
    /// Configuration file (defaults to scheduler.toml lookup)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Repository directory, overrides the configured one
    #[arg(short, long, global = true)]
    repository: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule installation of a module
    Install {
        /// Schema file of the module
        path: PathBuf,
        /// Extra directories searched for imports
        #[arg(short = 's', long = "search-dir")]
        search_dirs: Vec<PathBuf>,
        /// Features to enable with the install
        #[arg(short, long = "feature")]
        features: Vec<String>,
    },

    /// Schedule removal of a module
    Remove { module: String },

    /// Schedule enabling a feature
    Enable { module: String, feature: String },

    /// Schedule disabling a feature
    Disable { module: String, feature: String },

    /// Show installed modules and pending changes
    Status,

    /// Print the number of open connections
    Count,

    /// Connect once so pending changes apply, if no one else is connected
    Apply {
        /// Fail when a pending change cannot be applied
        #[arg(long)]
        strict: bool,
    },

    /// Print the feature dependency graph of installed modules in DOT format
    Graph {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config =
        SchedulerConfig::load_from(cli.config.as_deref()).context("loading configuration")?;
    if let Some(repository) = cli.repository {
        config.repository.path = repository;
    }
    let datastore = Datastore::open(config).context("opening repository")?;
    let options = datastore.default_connect_options();

    match cli.command {
        Commands::Install {
            path,
            search_dirs,
            features,
        } => {
            let conn = datastore.connect(options)?;
            let features: Vec<&str> = features.iter().map(String::as_str).collect();
            let seq = conn.install_module(&path, &search_dirs, &features)?;
            conn.disconnect()?;
            println!("Scheduled #{} install {}", seq, path.display());
        }

        Commands::Remove { module } => {
            let conn = datastore.connect(options)?;
            let seq = conn.remove_module(&module)?;
            conn.disconnect()?;
            println!("Scheduled #{} remove {}", seq, module);
        }

        Commands::Enable { module, feature } => {
            let conn = datastore.connect(options)?;
            let seq = conn.enable_feature(&module, &feature)?;
            conn.disconnect()?;
            println!("Scheduled #{} enable {}:{}", seq, module, feature);
        }

        Commands::Disable { module, feature } => {
            let conn = datastore.connect(options)?;
            let seq = conn.disable_feature(&module, &feature)?;
            conn.disconnect()?;
            println!("Scheduled #{} disable {}:{}", seq, module, feature);
        }

        Commands::Status => {
            let modules = datastore.modules()?;
            println!("Repository: {}", datastore.root().display());
            println!("Connections: {}", datastore.connection_count()?);
            println!("Last applied change: #{}", modules.last_applied_seq);
            println!();

            println!("Installed modules ({}):", modules.len());
            for module in modules.iter() {
                let enabled: Vec<&str> =
                    module.enabled_features().map(|f| f.name.as_str()).collect();
                if enabled.is_empty() {
                    println!("  {}", module.display_name());
                } else {
                    println!("  {} [{}]", module.display_name(), enabled.join(", "));
                }
            }

            let pending = datastore.scheduled_changes()?;
            println!();
            println!("Pending changes ({}):", pending.len());
            for change in &pending {
                println!("  {}", change);
            }
        }

        Commands::Count => {
            println!("{}", datastore.connection_count()?);
        }

        Commands::Apply { strict } => {
            let options = ConnectOptions {
                err_on_scheduled_fail: strict || options.err_on_scheduled_fail,
            };
            let conn = datastore.connect(options)?;
            let outcome = conn.apply_outcome().cloned();
            conn.disconnect()?;

            match outcome {
                None => println!("Other connections are open, nothing applied"),
                Some(ApplyOutcome::Success { applied }) => {
                    println!("Applied {} change(s)", applied)
                }
                Some(ApplyOutcome::Failed { change, reason, applied }) => {
                    println!("Applied {} change(s)", applied);
                    bail!("change {} could not be applied: {}", change, reason);
                }
            }
        }

        Commands::Graph { output } => {
            let graph = FeatureGraph::from_modules(&datastore.modules()?);
            let dot = graph.to_dot();
            match output {
                Some(path) => {
                    std::fs::write(&path, &dot)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!(
                        "Exported {} features, {} edges to {}",
                        graph.feature_count(),
                        graph.edge_count(),
                        path.display()
                    );
                }
                None => print!("{}", dot),
            }
        }
    }

    Ok(())
}
