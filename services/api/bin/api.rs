//! Main Entrypoint for the Study Buddy API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the prompt templates.
//! 3. Initializing the model gateway and the transcriber.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use study_buddy_api::{
    config::Config,
    router::create_router,
    state::{AppState, SessionRegistry},
    transcription::OpenAITranscriber,
};
use study_buddy_core::LLMGateway;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

const REQUIRED_PROMPTS: [&str; 5] = [
    "extract_questions",
    "propose_question",
    "continue_conversation",
    "summarize",
    "answer_question",
];

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in fs::read_dir(prompts_path)
        .with_context(|| format!("Failed to read prompts from {}", prompts_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    for name in REQUIRED_PROMPTS {
        if !prompts.contains_key(name) {
            anyhow::bail!("{name}.md not found in prompts directory");
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 2. Load Prompts ---
    let prompts = load_prompts(&config.prompts_path)?;
    info!(count = prompts.len(), "Prompt templates loaded.");

    // --- 3. Initialize Shared Services ---
    let api_key = config
        .api_key()
        .context("No API key configured for the selected provider")?;
    let openai_config = OpenAIConfig::new()
        .with_api_key(api_key)
        .with_api_base(config.provider.api_base());
    info!(provider = ?config.provider, "Using OpenAI-compatible provider.");

    let gateway = Arc::new(LLMGateway::new(
        openai_config.clone(),
        config.chat_model.clone(),
        prompts,
    ));
    let transcriber = Arc::new(OpenAITranscriber::new(
        openai_config,
        config.transcribe_model.clone(),
    ));

    let app_state = Arc::new(AppState {
        gateway,
        transcriber,
        sessions: SessionRegistry::new(),
        config: Arc::new(config.clone()),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        transcribe_model = %config.transcribe_model,
        study_minutes = config.study_minutes,
        break_minutes = config.break_minutes,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
