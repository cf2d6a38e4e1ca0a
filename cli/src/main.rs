mod commands;
mod persist;

use crate::commands::{CliHelper, Sandboxes};
use crate::persist::CliPersistence;
use anyhow::anyhow;
use anyhow::Result;
use clap::Parser;
use commands::CommandResult;
use commands::{execute_command, Commands};
use log::{error, info, warn};
use payorch::{EventListener, OrchestratorBuilder, OrchestratorEvent, PaymentOrchestrator, Severity};
use rustyline::error::ReadlineError;
use rustyline::hint::HistoryHinter;
use rustyline::Editor;
use std::{fs, path::PathBuf};

#[derive(Parser)]
#[command(version, about = "Interactive shell for the payment orchestrator", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the data directory
    #[arg(short, long, default_value = "./.data")]
    data_dir: String,
}

fn expand_path(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(stripped) => Ok(dirs::home_dir()
            .ok_or_else(|| anyhow!("Could not find home directory"))?
            .join(stripped)),
        None => Ok(PathBuf::from(path)),
    }
}

/// Parse a command string into a Commands enum using clap
fn parse_command(input: &str) -> Result<Commands> {
    // Handle exit command specially since it's not exposed in non-interactive mode
    if input.trim() == "exit" || input.trim() == "quit" {
        return Ok(Commands::Exit {});
    }

    let mut args = vec!["payorch".to_string()];
    args.extend(shlex::split(input).ok_or_else(|| anyhow!("Failed to parse command"))?);

    let cmd = Commands::try_parse_from(&args)?;
    Ok(cmd)
}

struct CliEventListener {}

impl EventListener for CliEventListener {
    fn on_event(&self, event: &OrchestratorEvent) {
        match event.severity() {
            Severity::Critical => {
                error!("Alert: {:?}", event);
                println!("ALERT: {:?}", event);
            }
            Severity::Warning => warn!("Event received: {:?}", event),
            Severity::Info => info!("Event received: {:?}", event),
        }
    }
}

async fn run_interactive_mode(data_dir: PathBuf) -> Result<()> {
    fs::create_dir_all(&data_dir)?;

    let persistence = CliPersistence {
        data_dir: data_dir.clone(),
    };
    let config = persistence.get_or_create_config()?;

    PaymentOrchestrator::init_logging(&data_dir.to_string_lossy(), None)?;

    let sandboxes = Sandboxes::new();
    let orchestrator = OrchestratorBuilder::new(config)
        .providers(sandboxes.entries())
        .event_listener(Box::new(CliEventListener {}))
        .build()?;
    orchestrator.start();

    let helper = CliHelper {
        hinter: HistoryHinter {},
    };
    let mut rl = Editor::new()?;
    rl.set_helper(Some(helper));

    let history_file = persistence.history_file();
    if rl.load_history(&history_file).is_err() {
        error!("Failed to load history");
    }

    println!("Welcome to the payment orchestrator shell!");
    println!("Sandbox providers: {}", sandboxes.names().join(", "));
    println!("Type 'help' to see available commands or 'exit' to quit.");

    loop {
        let readline = rl.readline("payorch> ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match parse_command(line) {
                    Ok(cmd) => {
                        if let Commands::Exit {} = cmd {
                            break;
                        }

                        let res = execute_command(cmd, &orchestrator, &sandboxes).await;
                        show_results(res)?;
                    }
                    Err(e) => println!("Error parsing command: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Err(err) = rl.save_history(&history_file) {
        error!("Failed to save history: {}", err);
    }

    orchestrator.stop()?;

    Ok(())
}

fn show_results(result: Result<String>) -> Result<()> {
    let result_str = match result {
        Ok(r) => r,
        Err(err) => serde_json::to_string_pretty(&CommandResult {
            success: false,
            message: err.to_string(),
        })?,
    };

    println!("{result_str}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let data_dir = expand_path(&cli.data_dir)?;
    run_interactive_mode(data_dir).await
}
