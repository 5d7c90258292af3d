//! Guildsmith worker entry point.

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    guildsmith_telemetry::init_telemetry("guildsmith-worker")?;

    if let Err(err) = guildsmith_worker::run().await {
        tracing::error!(error = %err, "worker terminated abnormally");
        std::process::exit(1);
    }
    Ok(())
}
