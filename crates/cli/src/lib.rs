pub mod bootstrap;
pub mod commands;
pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

pub const DEFAULT_QUESTION: &str = "What is the Shared Parental Leave policy?";

#[derive(Debug, Parser)]
#[command(
    name = "askops",
    about = "AskOps policy assistant CLI",
    long_about = "Ask guarded policy questions, apply session-store migrations, inspect configuration, and run readiness checks.",
    after_help = "Examples:\n  askops ask \"How much annual leave do I get?\"\n  askops ask --session 7f3c --json\n  askops doctor --json\n  askops config"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to an askops.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Ask one question through the guarded conversation pipeline")]
    Ask {
        #[arg(help = "Question text; defaults to a sample policy question")]
        question: Option<String>,
        #[arg(long, help = "Existing session token; a fresh one is generated when omitted")]
        session: Option<String>,
        #[arg(long, help = "Emit the answer with session and timing metadata as JSON")]
        json: bool,
    },
    #[command(about = "Apply pending session-store migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, store connectivity, prompt template and sandbox support")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let config_path = cli.config;

    let result = match cli.command {
        Command::Ask { question, session, json } => commands::ask::run(commands::ask::AskArgs {
            question: question.unwrap_or_else(|| DEFAULT_QUESTION.to_string()),
            session,
            json,
            config_path,
        }),
        Command::Migrate => commands::migrate::run(config_path),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(config_path) }
        }
        Command::Doctor { json } => {
            let (exit_code, output) = commands::doctor::run(config_path, json);
            commands::CommandResult { exit_code, output }
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
