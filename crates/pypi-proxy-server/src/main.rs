use std::sync::Arc;

use clap::Parser;
use proxy_config::Config;
use pypi_proxy_server::{router, state::AppState};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

fn main() -> anyhow::Result<()> {
    let num_cores = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(2)
        .max(2);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cores / 2)
        .max_blocking_threads(num_cores)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let config = Config::parse();

    let default_filter = if config.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()?;
    tracing_subscriber::fmt().with_env_filter(env_filter).finish().try_init()?;

    let listen = config.listen;
    let state = Arc::new(AppState::build(config).await?);
    let app = router(state).layer(TraceLayer::new_for_http());

    tracing::info!(%listen, "starting pypi-proxy-server");
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
