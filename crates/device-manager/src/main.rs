use alicia_device_manager::service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    alicia_bus::cli::main("device_manager", service::build).await
}
