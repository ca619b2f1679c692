use tracing::info;

use bank_server::{App, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    bank_observability::init_with(config.log_format);

    let app = App::start(&config).await?;
    info!(
        concurrency = config.worker_concurrency,
        queues = ?config.task_queues.queues(),
        "bank server running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    app.shutdown().await;
    Ok(())
}
