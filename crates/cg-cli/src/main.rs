//! credguard: administrative entry points for credential encryption keys.

mod commands;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use cg_core::crypto::credentials::CredentialType;

#[derive(Parser)]
#[command(name = "credguard")]
#[command(author, version, about = "Credential encryption key management", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file (defaults to $CREDGUARD_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit diagnostic logs as JSON
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum KeyFormat {
    Hex,
    #[default]
    Base64,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new encryption key
    GenerateKey {
        /// Output encoding
        #[arg(short, long, value_enum, default_value_t = KeyFormat::Base64)]
        format: KeyFormat,
    },

    /// Load the active key from the environment and check it works
    VerifyKey,

    /// Encrypt a credential read from stdin
    Encrypt {
        /// Credential type (password, api_key, secret_key, access_token,
        /// refresh_token, oauth_token, ssh_key, generic)
        #[arg(short = 't', long = "type", default_value = "generic")]
        credential_type: CredentialType,
    },

    /// Re-encrypt stored credentials from the current key to a new one
    RotateEncryptionKey {
        /// MySQL connection URL
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,
        /// Tables to rotate (comma separated); all known models by default
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
        /// Inspect and count without writing anything
        #[arg(long)]
        dry_run: bool,
        /// Records fetched per batch
        #[arg(long)]
        batch_size: Option<usize>,
        /// Abort after this many errors
        #[arg(long)]
        max_errors: Option<usize>,
        /// Skip the JSON backup taken before rotating
        #[arg(long)]
        no_backup: bool,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
        /// Rotate models concurrently
        #[arg(long)]
        concurrent: bool,
    },

    /// Summarize an audit log
    Report {
        /// JSON Lines audit log to replay
        #[arg(long)]
        audit_log: PathBuf,
        /// Window start (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Window end (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if let Err(e) = run(cli).await {
        error!("credguard failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = cg_core::Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::GenerateKey { format } => {
            let encoding = match format {
                KeyFormat::Hex => cg_core::crypto::key_manager::KeyEncoding::Hex,
                KeyFormat::Base64 => cg_core::crypto::key_manager::KeyEncoding::Base64,
            };
            commands::generate_key(&settings, encoding)
        }
        Commands::VerifyKey => commands::verify_key(&settings),
        Commands::Encrypt { credential_type } => commands::encrypt(&settings, credential_type),
        Commands::RotateEncryptionKey {
            database_url,
            models,
            dry_run,
            batch_size,
            max_errors,
            no_backup,
            yes,
            concurrent,
        } => {
            let mut settings = settings;
            if dry_run {
                settings.rotation.dry_run = true;
            }
            if let Some(n) = batch_size {
                settings.rotation.batch_size = n;
            }
            if let Some(n) = max_errors {
                settings.rotation.max_errors = n;
            }
            if no_backup {
                settings.rotation.backup_before_rotate = false;
            }
            if concurrent {
                settings.rotation.concurrent = true;
            }
            settings.validate()?;

            commands::rotate_encryption_key(&settings, &database_url, &models, yes).await
        }
        Commands::Report {
            audit_log,
            since,
            until,
        } => commands::report(&settings, &audit_log, since, until),
    }
}
