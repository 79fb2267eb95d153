use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use livetv_core::config::Settings;
use livetv_core::registry::Registry;
use livetv_core::tuner::TunerAdapter;
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let settings = Settings::load(&args.config)?;
    info!("configuration loaded from {}", args.config);

    let http_client = reqwest::Client::builder().build()?;
    let tuner_adapter = TunerAdapter::new(&settings.tuner, http_client);
    let channel_directory = Arc::new(settings.channel_directory());

    let registry = Registry::new(
        tuner_adapter,
        channel_directory,
        settings.encoding.encoder,
        Duration::from_secs(settings.encoding.max_alive_time_sec),
    );

    let app = livetv_core::create_app(registry);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
