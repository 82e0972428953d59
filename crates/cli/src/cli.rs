//! CLI argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use eyre::eyre;
use reqwest::Url;
use verdict_client::{ClientCredentials, DEFAULT_TOKEN_ENDPOINT};
use verdict_core::{Options, Sha256};

fn positive_secs(s: &str) -> Result<Duration, String> {
    let secs: u64 = s.parse().map_err(|e| format!("{e}"))?;
    if secs == 0 {
        return Err("timeout must be at least one second".to_string());
    }
    Ok(Duration::from_secs(secs))
}

fn sha256_arg(s: &str) -> Result<Sha256, String> {
    s.parse().map_err(|e| format!("{e}"))
}

#[derive(Parser)]
#[command(name = "verdict", about = "Look up malware verdicts for hashes, URLs and files")]
pub struct Cli {
    /// WebSocket endpoint of the verdict service
    #[arg(long, env = "VERDICT_URL")]
    pub url: Option<String>,

    /// Bearer token (takes precedence over client credentials)
    #[arg(long, env = "VERDICT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// OAuth2 client id for the client-credentials grant
    #[arg(long, env = "CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, env = "CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    #[arg(long, env = "VERDICT_TOKEN_ENDPOINT", default_value = DEFAULT_TOKEN_ENDPOINT)]
    pub token_endpoint: String,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECS", value_parser = positive_secs)]
    pub timeout: Option<Duration>,

    /// Allow (true) or forbid (false) cached verdicts
    #[arg(long, value_name = "BOOL")]
    pub use_cache: Option<bool>,

    /// Allow (true) or forbid (false) hash-lookup verdicts
    #[arg(long, value_name = "BOOL")]
    pub use_hash_lookup: Option<bool>,

    /// Options file (default: ~/.config/verdict/config.toml)
    #[arg(long, env = "VERDICT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Options from the config file with command-line overrides applied.
    pub fn options(&self) -> eyre::Result<Options> {
        let mut options = Options::load(self.config.as_deref())?;
        if let Some(ref url) = self.url {
            options.url.clone_from(url);
        }
        if let Some(timeout) = self.timeout {
            options.request_timeout = timeout;
        }
        if self.use_cache.is_some() {
            options.use_cache = self.use_cache;
        }
        if self.use_hash_lookup.is_some() {
            options.use_hash_lookup = self.use_hash_lookup;
        }
        options.validate()?;
        Ok(options)
    }

    /// Resolve the bearer token from `--token`, then client credentials.
    pub async fn token(&self) -> eyre::Result<String> {
        // 1. Direct value
        if let Some(ref token) = self.token {
            let trimmed = token.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }

        // 2. Client-credentials grant
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => {
                let creds = ClientCredentials::new(&self.token_endpoint, id, secret);
                Ok(creds.token().await?)
            }
            _ => Err(eyre!(
                "no credentials: pass --token, or --client-id with --client-secret"
            )),
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Verdicts for SHA-256 digests
    Sha256 {
        #[arg(required = true, value_parser = sha256_arg)]
        hashes: Vec<Sha256>,
    },
    /// Verdicts for files the service downloads itself
    Url {
        #[arg(required = true)]
        urls: Vec<Url>,
    },
    /// Verdicts for local files, uploading unknown ones
    File {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}
