use alicia_voice_router::service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    alicia_bus::cli::main("voice_router", service::build).await
}
