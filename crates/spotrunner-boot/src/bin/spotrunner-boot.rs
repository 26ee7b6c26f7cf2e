use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;

use spotrunner_boot::agent::{ExitReason, run_to_completion, self_terminate};
use spotrunner_boot::payload::{BootPayload, default_shutdown_command};

/// Runs a single CI job on this machine and terminates the machine afterwards.
#[derive(Parser)]
#[command(author, version, about)]
struct BootOptions {
    /// Base64 encoded boot payload
    #[arg(long, conflicts_with = "payload_file", required_unless_present = "payload_file")]
    payload: Option<String>,

    /// Read the base64 encoded boot payload from a file
    #[arg(long)]
    payload_file: Option<PathBuf>,

    /// Enables more detailed log output
    #[arg(long, env = "SPOTRUNNER_DEBUG")]
    debug: bool,
}

fn read_payload(opts: &BootOptions) -> anyhow::Result<BootPayload> {
    let encoded = match (&opts.payload, &opts.payload_file) {
        (Some(payload), _) => payload.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => anyhow::bail!("No payload was provided"),
    };
    Ok(BootPayload::decode(&encoded)?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = BootOptions::parse();

    // Machine logs are collected from the console, timestamps are kept in every mode
    env_logger::Builder::default()
        .filter_level(if opts.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format_timestamp_millis()
        .parse_default_env()
        .init();

    let payload = match read_payload(&opts) {
        Ok(payload) => payload,
        Err(error) => {
            log::error!("Cannot read boot payload: {error:?}");
            self_terminate(&default_shutdown_command()).await?;
            std::process::exit(1);
        }
    };
    log::debug!("Boot payload: {payload:?}");

    let client = reqwest::Client::new();
    let reason = run_to_completion(&payload, &client).await;
    if !matches!(reason, ExitReason::RunnerExited(Some(0))) {
        std::process::exit(1);
    }
    Ok(())
}
