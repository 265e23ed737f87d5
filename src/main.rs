use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use lesson_illustrator::{
    config::AppConfig,
    create_router,
    images::ImageGenerator,
    provider::Providers,
    refine::RefinementLoop,
    steps::StepGenerator,
    store::{LessonStore, MemoryStore},
    supabase::SupabaseStore,
    AppState, LessonPipeline, LessonService,
};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    if config.gemini.is_demo() {
        tracing::warn!("GEMINI_API_KEY not set, running in demo mode with placeholder steps and images");
    } else {
        let key_prefix: String = config.gemini.api_key.chars().take(10).collect();
        tracing::info!("Using API key: {}...", key_prefix);
    }

    let providers = Providers::from_config(&config).context("failed to build provider clients")?;
    let store: Arc<dyn LessonStore> = match &config.supabase {
        Some(supabase) => {
            tracing::info!(url = %supabase.url, bucket = %supabase.bucket, "Using Supabase lesson store");
            Arc::new(SupabaseStore::new(supabase, config.provider_timeout).context("failed to build Supabase client")?)
        }
        None => {
            tracing::warn!("SUPABASE_URL not set, lessons are kept in memory");
            Arc::new(MemoryStore::default().with_user("teacher@school.edu", "teacher", 1))
        }
    };

    let pipeline_config = config.pipeline.clone();
    let mut images = ImageGenerator::new(providers.images.clone(), &pipeline_config.generated_dir, &pipeline_config.image_size);
    if pipeline_config.refine_images {
        images = images.with_refinement(RefinementLoop::new(
            providers.critic.clone(),
            providers.images.clone(),
            &pipeline_config.image_size,
            pipeline_config.refine_max_iterations,
        ));
    }
    let pipeline = LessonPipeline::new(StepGenerator::new(providers.text.clone()), Arc::new(images), pipeline_config);
    let state = AppState {
        store: store.clone(),
        lessons: Arc::new(LessonService::new(pipeline, store)),
    };

    let app = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
