//! Tide Analytics - A-share strategy analytics service.

use anyhow::Result;
use tide_analytics::AnalyticsService;
use tide_common::config::Config;
use tide_common::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = std::time::Instant::now();

    let config = Config::load_with_env()?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Tide Analytics v{}", env!("CARGO_PKG_VERSION"));

    let service = AnalyticsService::new(config);

    let startup_duration = startup_start.elapsed();
    tracing::info!(
        duration_ms = startup_duration.as_millis() as u64,
        "Service initialized in {:?}",
        startup_duration
    );

    service.start().await
}
