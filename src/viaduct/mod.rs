pub mod admin;
pub mod app;
pub mod config;
pub mod dialer;
pub mod logging;
pub mod net;
pub mod outbound;
pub mod proxy;
pub mod session;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
