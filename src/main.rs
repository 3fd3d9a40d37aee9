//! # Voice Relay - Main Application Entry Point
//!
//! One binary, two roles:
//! - `voice-relay serve` (the default) runs the relay: an Actix-web server that accepts
//!   WebSocket audio, uploads it to the generation API in fixed-size chunks, and streams
//!   the replies back in order.
//! - `voice-relay client --input <file>` plays the browser's part against a running relay,
//!   replaying a recorded file as microphone input.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: sessions, retries and playback are all tasks on one runtime
//! - **trait objects**: the server holds the upstream API as `Arc<dyn GenerationApi>`,
//!   so tests swap in fakes without touching the network
//! - **Result<T, E>**: typed errors inside modules, `anyhow` at this top level
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared state, session admission and relay counters
//! - **relay**: chunking, retry, the generation client and the per-connection session
//! - **websocket**: the WebSocket actor that owns one relay session
//! - **health** / **handlers**: monitoring and runtime configuration endpoints
//! - **client**: the headless client
//! - **error**: HTTP error responses

mod client;
mod config;
mod error;
mod handlers;
mod health;
mod relay;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crate::config::AppConfig;
use crate::relay::generation::GeminiClient;
use crate::state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Voice Relay - real-time voice conversations through a generative model
#[derive(Parser, Debug)]
#[command(name = "voice-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay server (default)
    Serve,

    /// Stream a recorded file through a relay and play back the replies
    Client {
        /// Recorded audio used as microphone input
        #[arg(short = 'i', long = "input", value_name = "FILE")]
        input: PathBuf,

        /// Directory reply clips are written to
        #[arg(short = 'o', long = "output-dir", value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Seconds to keep listening after the input runs out
        #[arg(long = "linger-secs", default_value_t = 10)]
        linger_secs: u64,

        /// Relay WebSocket URL (overrides `client.relay_url`)
        #[arg(long = "url")]
        url: Option<String>,
    },
}

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Dispatches** to the server or the headless client
///
/// `#[actix_web::main]` starts a single-threaded runtime; the client relies on that
/// for its cooperative scheduling, the server spawns its own worker threads.
#[actix_web::main]
async fn main() -> Result<()> {
    // Missing .env is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let cli = Cli::parse();

    let config = AppConfig::load()?;
    config.validate()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Client {
            input,
            output_dir,
            linger_secs,
            url,
        } => {
            let mut client_config = config.client.clone();
            if let Some(url) = url {
                client_config.relay_url = url;
            }
            if let Some(dir) = &output_dir {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }

            let summary = client::run(
                &client_config,
                client::ClientOptions {
                    input,
                    output_dir,
                    linger: Duration::from_secs(linger_secs),
                },
            )
            .await?;

            for reply in &summary.replies {
                println!("{}", reply);
            }
            info!(
                replies = summary.replies.len(),
                played = summary.playback.played,
                skipped = summary.playback.skipped,
                "Conversation finished"
            );
            Ok(())
        }
    }
}

/// Route table shared by the server and the integration tests.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws", web::get().to(websocket::relay_websocket))
        .route("/", web::get().to(websocket::relay_websocket))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/config", web::get().to(handlers::get_config))
                .route("/config", web::put().to(handlers::update_config)),
        )
        // Also provide health check at root level for convenience
        .route("/health", web::get().to(health::health_check));
}

async fn serve(config: AppConfig) -> Result<()> {
    if !config.has_api_key() {
        anyhow::bail!("GEMINI_API_KEY is not set; the relay cannot reach the generation API");
    }

    info!("Starting voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        model = %config.generation.model,
        chunk_size = config.relay.chunk_size_bytes,
        max_attempts = config.relay.max_attempts,
        retry_delay_ms = config.relay.retry_delay_ms,
        "Relay configured"
    );

    let generation = GeminiClient::new(&config.generation)?;
    let app_state = AppState::new(config.clone(), Arc::new(generation));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Server is listening on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(configure_routes)
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first: the server (usually an error) or a shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: what gets logged (e.g. "debug", "voice_relay=trace")
/// - If not set, defaults to "voice_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or, on Unix, SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
