use anyhow::Result;
use clap::{Parser, Subcommand};
use nix::unistd::Uid;
use owo_colors::OwoColorize;

use hammer::logging::Logger;
use hammer::{Engine, EngineConfig, EngineError};

#[derive(Parser)]
#[command(
    name = "hammer",
    about = "Atomic, snapshot-based system management for HackerOS",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// First-time provisioning of the deployment layout
    Init,
    /// Upgrade all packages in a new deployment
    Update,
    /// Install a package in a new deployment
    Install { package: String },
    /// Remove a package in a new deployment
    Remove { package: String },
    /// Re-deploy the current content under a new identity
    Deploy,
    /// Make a deployment the next boot target (default: the previous one)
    Switch { name: Option<String> },
    /// Go back n deployments in creation order
    Rollback {
        #[arg(default_value_t = 1)]
        steps: usize,
    },
    /// Refresh package metadata without creating a deployment
    Refresh,
    /// Prune old deployments and sandbox containers
    Clean,
    /// Show the current deployment
    Status,
    /// List deployments, newest first
    History,
    /// Reconcile a pending transaction after boot
    CheckTransaction,
}

impl Commands {
    fn is_mutating(&self) -> bool {
        !matches!(self, Commands::Status | Commands::History)
    }
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    if cli.command.is_mutating() && !Uid::effective().is_root() {
        eprintln!("{} must be run as root", "Error:".red().bold());
        return 1;
    }

    let config = match EngineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return 1;
        }
    };
    if cli.command.is_mutating() {
        let _ = Logger::init(&config.log_dir);
    }

    let engine = Engine::new(config);
    let result = dispatch(&engine, &cli.command);

    match result {
        Ok(()) => 0,
        Err(err) => report(err),
    }
}

fn dispatch(engine: &Engine, command: &Commands) -> Result<()> {
    match command {
        Commands::Init => engine.init(),
        Commands::Update => engine.update(),
        Commands::Install { package } => engine.install(package),
        Commands::Remove { package } => engine.remove(package),
        Commands::Deploy => engine.deploy(),
        Commands::Switch { name } => engine.switch(name.as_deref()),
        Commands::Rollback { steps } => engine.rollback(*steps),
        Commands::Refresh => engine.refresh(),
        Commands::Clean => engine.clean(),
        Commands::Status => engine.status(),
        Commands::History => engine.history(),
        Commands::CheckTransaction => engine.check_transaction(),
    }
}

fn report(err: anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::Noop(msg)) => {
            println!("{msg}; nothing to do.");
            0
        }
        Some(EngineError::Busy) => {
            eprintln!("Error: another hammer operation is in progress");
            1
        }
        _ => {
            eprintln!("Error: {err:#}");
            Logger::error(&format!("{err:#}"));
            1
        }
    }
}
