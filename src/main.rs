use anyhow::{Context, Result};
use llm_relay::application::app::Collaborators;
use llm_relay::config::{LoggingSettings, Settings};
use llm_relay::Application;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(settings: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "llm_relay={level},tower_http={level}",
            level = settings.level
        ))
    });

    match settings.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new().context("loading settings")?;
    init_logging(&settings.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %settings.application.environment,
        "Starting LLM Relay"
    );

    let app = Application::build(settings, Collaborators::default())
        .context("building application")?;
    app.run().await.context("serving")?;

    Ok(())
}
