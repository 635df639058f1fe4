use anyhow::Context;
use clap::Parser;

use volitas_api::cli::Cli;
use volitas_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Loads `.env` too, so it has to run before the subscriber reads LOG_LEVEL.
    let settings = Settings::from_env().context("invalid configuration")?;
    volitas_observability::init();
    tracing::debug!(
        database_url = %settings.database_url,
        log_level = %settings.log_level,
        queues = settings.routing.queues().count(),
        "configuration loaded"
    );

    volitas_api::commands::run(cli.command, settings).await
}
