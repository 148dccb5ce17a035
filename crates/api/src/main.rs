use wager_infra::config::ServiceConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wager_observability::init();

    let config = ServiceConfig::from_env();
    let bind_addr = config.bind_addr.clone();

    let (app, services) = wager_api::app::build_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    services.shutdown_workers();
    Ok(())
}
