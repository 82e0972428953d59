//! Verdict CLI - malware verdicts from a remote verdict service.

mod cli;

use std::process::ExitCode;

use clap::Parser;
use futures_util::future::join_all;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use verdict_client::{RequestOptions, Session};
use verdict_core::{ScanVerdict, VerdictError};

type Outcome = (String, Result<ScanVerdict, VerdictError>);

fn init_tracing() {
    let filter = EnvFilter::try_from_env("VERDICT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    init_tracing();
    // Any panic exits with failure
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(1);
    }));

    let cli = cli::Cli::parse();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            warn!(%e, "failed to build tokio runtime");
            eprintln!("verdict: runtime error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(&cli)) {
        Ok(outcomes) => report(&outcomes),
        Err(e) => {
            warn!(%e, "verdict run failed");
            eprintln!("verdict: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &cli::Cli) -> eyre::Result<Vec<Outcome>> {
    let options = cli.options()?;
    debug!(url = %options.url, "options resolved");
    let token = cli.token().await?;

    let session = Session::new(options)?;
    session.connect(&token).await?;
    info!(session_id = ?session.session_id(), "connected");

    let opts = &RequestOptions::default();
    let session = &session;
    let outcomes = match &cli.command {
        cli::Command::Sha256 { hashes } => {
            join_all(hashes.iter().map(|h| async move {
                (h.to_string(), session.for_sha256(h, opts).await)
            }))
            .await
        }
        cli::Command::Url { urls } => {
            join_all(urls.iter().map(|u| async move {
                (u.to_string(), session.for_url(u, opts).await)
            }))
            .await
        }
        cli::Command::File { paths } => {
            join_all(paths.iter().map(|p| async move {
                (p.display().to_string(), session.for_file(p, opts).await)
            }))
            .await
        }
    };

    session.close().await;
    Ok(outcomes)
}

fn report(outcomes: &[Outcome]) -> ExitCode {
    let mut failed = false;
    let mut malicious = false;

    for (subject, outcome) in outcomes {
        match outcome {
            Ok(verdict) => {
                malicious |= verdict.verdict.is_malicious();
                println!("{subject} -> {verdict}");
            }
            Err(e) => {
                failed = true;
                warn!(subject, %e, "request failed");
                eprintln!("{subject} -> error: {e}");
            }
        }
    }

    ExitCode::from(exit_status(failed, malicious))
}

/// 1 if any request failed, else 2 if anything is malicious, else 0.
const fn exit_status(failed: bool, malicious: bool) -> u8 {
    if failed {
        1
    } else if malicious {
        2
    } else {
        0
    }
}
