mod config;
mod credential;

use std::sync::Arc;

use tracing::{error, info};

use config::{CliConfig, Mode};
use peersync_transfer::{SessionSupervisor, TracingLogger};

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "peersync=info".into()),
        )
        .init();

    // Config
    let cli = CliConfig::from_env()?;
    let credential = cli.credential()?;
    let peer_digest = cli.peer_digest(credential.as_ref())?;
    let session = cli.session(peer_digest)?;

    match cli.mode {
        Mode::Send => info!("Sending to the first peer that pairs on {}:{}", cli.host, cli.port),
        Mode::Receive => info!("Receiving into {}", cli.output_dir.display()),
    }

    let supervisor = SessionSupervisor::new(session, credential, Arc::new(TracingLogger));
    let summary = supervisor.run(|outcome| {
        if let Err(e) = outcome {
            error!("Sync did not complete: {}", e);
        }
    })?;

    info!(
        files = summary.files_acknowledged,
        bytes = summary.bytes,
        attempts = summary.attempts,
        "Sync finished"
    );
    Ok(())
}
