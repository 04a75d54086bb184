use ollachat::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let config = AppConfig::from_env()?;
    ollachat::server::run(config).await
}
