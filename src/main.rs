use clap::Parser;
use migration::MigratorTrait;
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{fmt, EnvFilter};

use tether::{jobs, settings, storage, web};

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    version,
    about = "Mobile device-binding and token-lifecycle gateway"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(server = ?settings.server, "Loaded configuration");

    if settings.api_key.required && settings.api_key.key.is_empty() {
        tracing::warn!(
            "api_key.required is set but api_key.key is empty; all requests will be rejected"
        );
    }

    // init storage (database) and bring the schema up to date
    let db = storage::init(&settings.database).await?;
    migration::Migrator::up(&db, None).await.into_diagnostic()?;

    // start background cleanup jobs
    let state = web::AppState::new(settings, db.clone());
    let _scheduler = jobs::init_scheduler(
        db,
        state.registry.clone(),
        state.tokens.clone(),
        state.settings.events.clone(),
    )
    .await?;

    // start web server
    web::serve(state).await?;
    Ok(())
}
