//! Admin command surface over the intake store.
//!
//! The service is the primary writer; this binary exists for inspecting a
//! database file and replaying submissions from the shell:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for execution against an existing [`SqliteIntakeStore`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use intake_core::{ClientId, Submission};
use intake_store_sqlite::SqliteIntakeStore;

#[derive(Debug, Parser)]
#[command(name = "intake")]
#[command(about = "Client intake store CLI")]
pub struct Cli {
    #[arg(long, default_value = "./intake.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Save one submission, exactly as the /api/save endpoint would.
    Submit(SubmitArgs),
    Clients {
        #[command(subcommand)]
        command: Box<ClientsCommand>,
    },
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// The form fields as one JSON object, e.g.
    /// '{"firstName":"Jane","lastName":"Doe","testDate":"2024-01-01"}'.
    #[arg(long)]
    fields: String,
}

#[derive(Debug, Subcommand)]
pub enum ClientsCommand {
    List,
    Show(ClientsShowArgs),
}

#[derive(Debug, Args)]
pub struct ClientsShowArgs {
    #[arg(long)]
    id: i64,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut store = SqliteIntakeStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when submission parsing, persistence, or retrieval fails.
pub fn run_command(command: Command, store: &mut SqliteIntakeStore) -> Result<()> {
    match command {
        Command::Submit(args) => {
            let value = serde_json::from_str(&args.fields)
                .context("--fields must be valid JSON")?;
            let submission = Submission::from_value(value)
                .map_err(|err| anyhow!("invalid submission: {err}"))?;

            let client_id = store.save_submission(&submission)?;
            let detail = store.get_client_with_answers(client_id)?;
            println!("{}", serde_json::to_string_pretty(&detail)?);
            Ok(())
        }
        Command::Clients { command } => match *command {
            ClientsCommand::List => {
                let clients = store.list_clients()?;
                println!("{}", serde_json::to_string_pretty(&clients)?);
                Ok(())
            }
            ClientsCommand::Show(args) => {
                let detail = store.get_client_with_answers(ClientId(args.id))?;
                println!("{}", serde_json::to_string_pretty(&detail)?);
                Ok(())
            }
        },
    }
}
