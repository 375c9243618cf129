//! Inspect Atlas run records and host knowledge.
//!
//! Runs are executed by embedding [`atlas::launcher::RunLauncher`] with a
//! concrete environment and policy; this binary reads and maintains what
//! those runs leave under the data directory.

use std::path::PathBuf;

use anyhow::{Result, bail};
use atlas::exit_codes;
use atlas::io::config::{AtlasConfig, load_config, write_config};
use atlas::io::knowledge_store::{FileKnowledgeStore, HostKnowledge, KnowledgeStore};
use atlas::io::paths::{AtlasPaths, DEFAULT_DATA_DIR};
use atlas::io::run_store::{RunStore, RunSummary};
use clap::{Parser, Subcommand};
use serde::Serialize;

#[derive(Parser)]
#[command(
    name = "atlas",
    version,
    about = "Inspect Atlas agent runs and learned host knowledge"
)]
struct Cli {
    /// Directory holding config, runs and knowledge.
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stored runs.
    #[command(subcommand)]
    Runs(RunsCommand),
    /// Learned per-host knowledge.
    #[command(subcommand)]
    Knowledge(KnowledgeCommand),
    /// Configuration file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum RunsCommand {
    /// List runs, newest first.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Print one run record as JSON.
    Show { id: String },
    /// Rename a run.
    Rename { id: String, name: String },
}

#[derive(Subcommand)]
enum KnowledgeCommand {
    /// List hosts with stored knowledge.
    Hosts,
    /// Print a host's transitions and rules as JSON.
    Show { host: String },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write the default config if missing.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    atlas::logging::init();
    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = AtlasPaths::new(&cli.data_dir);
    match cli.command {
        Command::Runs(command) => cmd_runs(&paths, command).await,
        Command::Knowledge(command) => cmd_knowledge(&paths, command).await,
        Command::Config(ConfigCommand::Init { force }) => cmd_config_init(&paths, force).await,
    }
}

async fn cmd_runs(paths: &AtlasPaths, command: RunsCommand) -> Result<i32> {
    let store = RunStore::new(&paths.runs_dir);
    match command {
        RunsCommand::List { json } => {
            let runs = store.list_runs().await?;
            if json {
                print_json(&runs)?;
            } else {
                for run in &runs {
                    println!("{}", summary_line(run));
                }
            }
            Ok(exit_codes::OK)
        }
        RunsCommand::Show { id } => match store.get_run(&id).await? {
            Some(run) => {
                print_json(&run)?;
                Ok(exit_codes::OK)
            }
            None => not_found(&format!("run {id}")),
        },
        RunsCommand::Rename { id, name } => {
            if name.trim().is_empty() {
                bail!("run name cannot be empty");
            }
            match store.rename_run(&id, &name).await? {
                Some(run) => {
                    println!("{}", summary_line(&RunSummary::from(&run)));
                    Ok(exit_codes::OK)
                }
                None => not_found(&format!("run {id}")),
            }
        }
    }
}

async fn cmd_knowledge(paths: &AtlasPaths, command: KnowledgeCommand) -> Result<i32> {
    let store = FileKnowledgeStore::new(&paths.knowledge_dir);
    match command {
        KnowledgeCommand::Hosts => {
            for host in store.list_hosts().await {
                println!("{host}");
            }
            Ok(exit_codes::OK)
        }
        KnowledgeCommand::Show { host } => {
            if !store.list_hosts().await.contains(&host) {
                return not_found(&format!("host {host}"));
            }
            let knowledge = HostKnowledge {
                transitions: store.load_transitions(&host).await,
                rules: store.get_semantic_rules(&host).await,
                host,
            };
            print_json(&knowledge)?;
            Ok(exit_codes::OK)
        }
    }
}

async fn cmd_config_init(paths: &AtlasPaths, force: bool) -> Result<i32> {
    if !force && paths.config_path.exists() {
        // Validate what is already there instead of clobbering it.
        load_config(&paths.config_path).await?;
        println!("{} already exists", paths.config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&paths.config_path, &AtlasConfig::default()).await?;
    println!("wrote {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn summary_line(run: &RunSummary) -> String {
    let ended = run.ended_reason.map_or("-", |reason| reason.as_str());
    format!(
        "{}\t{}\t{}\t{}\t{}",
        run.id,
        run.status.as_str(),
        ended,
        run.created_at.to_rfc3339(),
        run.name
    )
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn not_found(what: &str) -> Result<i32> {
    eprintln!("{what} not found");
    Ok(exit_codes::NOT_FOUND)
}
