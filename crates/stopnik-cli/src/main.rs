use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use stopnik_core::config::{Config, resolve_config};
use stopnik_core::crypto;
use stopnik_core::keys::KeyRegistry;

#[derive(Parser)]
#[command(name = "stopnik", about = "Simple OAuth 2.0 and OpenID Connect server", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server (default)
    Serve,
    /// Check config and key material
    Validate,
    /// Read a password and an optional salt from stdin and print the hash
    HashPassword,
}

fn init_tracing(config: Option<&Config>) {
    let level = config.map(|c| c.server.log_level.as_str()).unwrap_or("info");
    let fallback = format!("stopnik={level},tower_http={level}");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();
}

fn hash_password() -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    eprint!("password: ");
    let password = lines.next().transpose()?.unwrap_or_default();
    eprint!("salt (optional): ");
    let salt = lines.next().transpose()?.unwrap_or_default();
    if password.is_empty() {
        anyhow::bail!("no password given");
    }
    println!("{}", crypto::sha512_salted_hex(&password, &salt));
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = cli.command.unwrap_or(Command::Serve);

    // hash-password doesn't need a config
    if let Command::HashPassword = command {
        init_tracing(None);
        return hash_password();
    }

    let config = match resolve_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(None);
            return Err(e.into());
        }
    };
    init_tracing(Some(&config));
    tracing::info!(
        clients = config.clients.len(),
        users = config.users.len(),
        "config loaded"
    );

    let keys = KeyRegistry::load(&config)?;
    tracing::info!(keys = keys.keys().len(), "keys loaded");

    match command {
        Command::Serve => stopnik_api::serve(config, keys).await?,
        Command::Validate => println!("configuration is valid"),
        Command::HashPassword => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "stopnik failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
