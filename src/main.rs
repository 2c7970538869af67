use std::sync::Arc;

use anyhow::Context;
use provider_gateway::api::routes::build_app;
use provider_gateway::forwarder::Forwarder;
use provider_gateway::store::config_store::{ConfigStore, TimeoutSettings};
use provider_gateway::store::log_store::LogStore;
use provider_gateway::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("provider_gateway=debug,info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;

    let config_store = Arc::new(
        ConfigStore::open(
            &config.config_db_path,
            TimeoutSettings {
                stream_first_byte_timeout: config.stream_first_byte_timeout,
                stream_idle_timeout: config.stream_idle_timeout,
                non_stream_timeout: config.non_stream_timeout,
            },
            config.debug_log,
        )
        .await
        .context("opening config database")?,
    );
    let log_store = Arc::new(
        LogStore::open(&config.log_db_path)
            .await
            .context("opening log database")?,
    );

    let forwarder = Arc::new(Forwarder::new(config_store, log_store));
    let app = build_app(forwarder);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!(%addr, "provider-gateway listening");
    axum::serve(listener, app).await.context("serving")?;

    Ok(())
}
