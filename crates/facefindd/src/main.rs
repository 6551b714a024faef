use anyhow::{Context, Result};
use facefind_core::{
    Config, FaceRepository, MatchSettings, MatchingEngine, OnnxExtractor, RegistrationPipeline,
};
use facefind_store::SqliteRepository;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod engine;
mod server;

/// Config file: `FACEFIND_CONFIG`, else `facefind.toml` when present.
fn config_path() -> Option<PathBuf> {
    std::env::var_os("FACEFIND_CONFIG")
        .map(PathBuf::from)
        .or_else(|| {
            let local = PathBuf::from("facefind.toml");
            local.is_file().then_some(local)
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facefindd starting");

    let path = config_path();
    let config = Config::load(path.as_deref()).context("loading configuration")?;
    tracing::info!(
        config = ?path,
        db = %config.storage.db_path.display(),
        threshold = config.matching.threshold,
        metric = %config.matching.distance_metric,
        "configuration loaded"
    );

    let repository: Arc<dyn FaceRepository> = Arc::new(
        SqliteRepository::open(&config.storage.db_path).context("opening face store")?,
    );

    // Load models before accepting requests so a missing file fails startup.
    let extractor = OnnxExtractor::from_config(&config.model).context("loading face models")?;
    tracing::info!(
        detector = %config.model.detector_path().display(),
        recognizer = %config.model.recognizer_path().display(),
        "face models loaded"
    );

    let matcher = MatchingEngine::new(repository.clone(), MatchSettings::from(&config.matching));
    let pipeline = RegistrationPipeline::new(
        repository.clone(),
        config.storage.image_extensions.clone(),
        config.matching.distance_metric,
    );
    let engine = engine::spawn_engine(extractor, matcher, pipeline)?;

    tracing::info!(faces = repository.count()?, "facefindd ready");

    server::run(server::AppState {
        config: Arc::new(config),
        engine,
        repository,
    })
    .await?;

    tracing::info!("facefindd shutting down");
    Ok(())
}
