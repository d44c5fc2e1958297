use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "promptwave-cli", version, about = "Promptwave CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan notification schedules from a study definition
    Plan {
        #[command(subcommand)]
        action: commands::plan::PlanAction,
    },
    /// Inspect and prune the trigger store
    Triggers {
        #[command(subcommand)]
        action: commands::triggers::TriggersAction,
    },
    /// Evaluate study rules against answers
    Rules {
        #[command(subcommand)]
        action: commands::rules::RulesAction,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Plan { action } => commands::plan::run(action),
        Commands::Triggers { action } => commands::triggers::run(action),
        Commands::Rules { action } => commands::rules::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
