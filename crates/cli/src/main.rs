use std::{
    path::{Path, PathBuf},
    process,
};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod config;
mod cursor;
mod run;

use config::Config;

#[derive(Clone, Debug)]
pub struct Context {
    pub config_path: PathBuf,
    pub config: Config,
}

#[derive(Parser, Debug)]
#[clap(author, version, about = "Roost - real-time delivery server for zephyr", long_about = None)]
struct Opts {
    /// Path to the roost.toml config file (default: ./roost.toml)
    #[arg(
        long = "config",
        short = 'c',
        global = true,
        default_value = "./roost.toml"
    )]
    config_path: PathBuf,

    /// HMAC key for message cursors (overrides the config file)
    #[arg(
        long = "cursor-secret",
        global = true,
        env = "ROOST_CURSOR_SECRET",
        hide_env_values = true
    )]
    cursor_secret: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
enum Command {
    /// Start the server
    Run(run::RunCommand),
    /// Cursor utilities
    Cursor {
        #[clap(subcommand)]
        command: CursorCommand,
    },
}

#[derive(Subcommand, PartialEq, Clone, Debug)]
pub enum CursorCommand {
    /// Print the cursor for a message id
    Seal(cursor::SealCommand),
    /// Print the message id behind a cursor
    Unseal(cursor::UnsealCommand),
}

#[tokio::main]
async fn main() {
    let opts: Opts = match Opts::try_parse() {
        Ok(opts) => opts,
        Err(e) => {
            let _ = e.print();
            process::exit(e.exit_code());
        }
    };

    // Get the directory containing the config file
    let config_dir = opts
        .config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    load_env_file(&config_dir);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = if opts.config_path.exists() {
        match Config::load(&opts.config_path) {
            Ok(config) => {
                eprintln!("✓ Loaded config from {}", opts.config_path.display());
                config
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(1);
            }
        }
    } else {
        eprintln!(
            "Warning: {} not found, using default configuration",
            opts.config_path.display()
        );
        Config::default()
    };
    // The .env file is loaded after argument parsing, so check it again.
    let cursor_secret = opts
        .cursor_secret
        .clone()
        .or_else(|| std::env::var("ROOST_CURSOR_SECRET").ok());
    if let Some(secret) = cursor_secret {
        config.server.cursor_secret = secret;
    }

    let ctx = Context {
        config_path: opts.config_path.clone(),
        config,
    };

    if let Err(e) = handle_command(opts.command, &ctx).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Load environment variables from .env file in the config directory
fn load_env_file(config_dir: &Path) {
    let env_file_path = config_dir.join(".env");

    match dotenvy::from_path(&env_file_path) {
        Ok(_) => {
            eprintln!("✓ Loaded environment from {}", env_file_path.display());
        }
        Err(e) if e.not_found() => {}
        Err(e) => {
            eprintln!(
                "Warning: Failed to load .env file at {}: {}",
                env_file_path.display(),
                e
            );
        }
    }
}

async fn handle_command(command: Command, ctx: &Context) -> Result<(), String> {
    match command {
        Command::Run(cmd) => cmd.execute(ctx).await,
        Command::Cursor { command } => match command {
            CursorCommand::Seal(cmd) => cmd.execute(ctx),
            CursorCommand::Unseal(cmd) => cmd.execute(ctx),
        },
    }
}
