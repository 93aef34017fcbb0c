use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let config = args.into_config();

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let auth_dir = mproxy_common::writable_path()
        .map(|base| format!("{base}/{}", config.auth_dir))
        .unwrap_or_else(|| config.auth_dir.clone());
    let store = mproxy_providers::FileAuthStore::new(auth_dir);

    let bind = format!("{}:{}", config.host, config.port);
    let service = mproxy_core::Service::new(config, Some(store));
    service.install_priority_hook(None);
    let seeded = service.load_auths_from_store().await?;
    info!(auths = seeded, "auth records loaded");
    service.spawn_refresh_loop();

    let app = mproxy_core::api_router(service);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind = %bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
