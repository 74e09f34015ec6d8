pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "frontdesk",
    about = "Frontdesk operator CLI",
    long_about = "Inspect configuration, prepare the database, load the demo business and try the utterance analyzer.",
    after_help = "Examples:\n  frontdesk doctor --json\n  frontdesk seed\n  frontdesk analyze \"my basement is flooding\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo business fixture into the configured database")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, messaging readiness, and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Classify an utterance and print intent, entities, sentiment and urgency")]
    Analyze {
        #[arg(required = true, num_args = 1.., help = "Customer utterance to analyze")]
        utterance: Vec<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Analyze { utterance } => commands::analyze::run(&utterance.join(" ")),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
