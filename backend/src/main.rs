use anyhow::Context;
use story_backend::config::load_settings;
use story_backend::{app, telemetry, AppState};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    let settings = load_settings()?;
    let state = AppState::from_settings(&settings).await?;
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(
        addr = %settings.bind_addr,
        store = ?settings.store,
        upload_dir = %settings.upload_dir.display(),
        "story server listening"
    );
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
