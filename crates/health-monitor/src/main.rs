use alicia_health_monitor::service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    alicia_bus::cli::main("health_monitor", service::build).await
}
