use anyhow::Context;
use chainview_watch::logging::init_logging;
use chainview_watch::{watch_stream, Args, OutputFormat, SseTransport, WatchConfig};
use clap::Parser;
use std::time::Duration;
use tracing::info;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = WatchConfig::from_args(&args).context("invalid configuration")?;
    let _log_guard = init_logging(&config);
    info!(
        max_retries = config.max_retries,
        "chainview_watch_start: {}", config.stream_url
    );

    let transport = SseTransport::new(CONNECT_TIMEOUT).context("failed to build http client")?;
    let report = watch_stream(&config, &transport)
        .await
        .context("failed to start session")?;

    let rendered = match config.output {
        OutputFormat::Text => report.render_text(),
        OutputFormat::Json => {
            serde_json::to_string_pretty(&report).context("failed to serialize report")?
        }
    };
    println!("{rendered}");

    if !report.outcome.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
