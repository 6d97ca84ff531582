//! Stack Auth CLI
//!
//! `stack login` runs the browser-confirmed login handshake and stores the
//! resulting refresh token locally; `stack logout` forgets it; `stack update`
//! prints the installed version.

mod client;
mod credentials;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stack_auth::{Clock, Error, PollPolicy, SystemClock, exchange_for_token};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::client::AuthClient;
use crate::credentials::{CredentialFile, StoredCredential};

const DEFAULT_API_URL: &str = "https://api.stack-auth.com";

/// Stack Auth CLI
#[derive(Debug, Parser)]
#[command(name = "stack", version, about = "Stack Auth CLI")]
struct Cli {
    /// Stack Auth API base URL
    #[arg(long, env = "STACK_API_URL", default_value = DEFAULT_API_URL, global = true)]
    api_url: String,

    /// Credential file (default: ~/.stack/credentials.json)
    #[arg(long, env = "STACK_CLI_CREDENTIALS", global = true)]
    credentials: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in through the browser and store a refresh token
    Login,
    /// Remove the stored refresh token
    Logout,
    /// Print the installed version
    Update,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Login => {
            let file = credential_file(cli.credentials)?;
            login(&cli.api_url, &file).await
        }
        Command::Logout => {
            let file = credential_file(cli.credentials)?;
            logout(&file).await
        }
        Command::Update => {
            println!("{}", update_message());
            Ok(())
        }
    }
}

fn credential_file(path: Option<PathBuf>) -> Result<CredentialFile> {
    let path = match path {
        Some(path) => path,
        None => CredentialFile::default_path()?,
    };
    Ok(CredentialFile::new(path))
}

async fn login(api_url: &str, file: &CredentialFile) -> Result<()> {
    let client = AuthClient::new(api_url)?;
    let start = client
        .start_login()
        .await
        .context("could not start login")?;

    println!("Open this URL in your browser to sign in:\n\n  {}\n", start.confirmation_url);
    println!("Login code: {}", start.login_code);
    println!("Waiting for confirmation (press Ctrl-C to abort)...");

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let clock = SystemClock;
    let policy = poll_policy(start.expires_at, clock.now_millis());
    let outcome = exchange_for_token(&client, &start.polling_code, &policy, &cancel).await;
    ctrl_c.abort();

    let refresh_token = match outcome {
        Ok(token) => token,
        Err(Error::Cancelled) => {
            // Best effort; the request expires on its own anyway.
            if let Err(e) = client.cancel(&start.polling_code).await {
                debug!(error = %e, "cancel request failed");
            }
            anyhow::bail!("login cancelled");
        }
        Err(Error::PollTimeout(_)) => anyhow::bail!("{}", Error::LoginCodeExpired),
        Err(e) => return Err(e).context("login failed"),
    };

    file.save(&StoredCredential {
        refresh_token,
        api_url: api_url.trim_end_matches('/').to_owned(),
        saved_at: clock.now_millis(),
    })
    .await
    .context("could not save credentials")?;

    println!("Logged in. Credentials saved to {}", file.path().display());
    Ok(())
}

/// Default backoff with the deadline set to when the login code expires.
fn poll_policy(expires_at: u64, now: u64) -> PollPolicy {
    let remaining = Duration::from_millis(expires_at.saturating_sub(now));
    if remaining.is_zero() {
        warn!("login code already expired on arrival; check the system clock");
    }
    PollPolicy::default().with_timeout(remaining)
}

async fn logout(file: &CredentialFile) -> Result<()> {
    if file.clear().await? {
        println!("Logged out");
    } else {
        println!("Logged out (no stored credentials)");
    }
    Ok(())
}

fn update_message() -> String {
    format!(
        "stack {} (update through your package manager to get a newer release)",
        env!("CARGO_PKG_VERSION")
    )
}
