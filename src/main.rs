mod booking;
mod completion;
mod config;
mod prompt;
mod relay;
mod tools;
mod twilio;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use completion::{CompletionBackend, OpenAiClient};
use config::Config;
use tools::ToolRegistry;
use twilio::client::TwilioClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub backend: Arc<dyn CompletionBackend>,
    pub tools: Arc<ToolRegistry>,
    pub twilio: Arc<TwilioClient>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("relay-desk {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("relay-desk {VERSION}");
    println!("AI receptionist for Twilio ConversationRelay");
    println!();
    println!("Usage: relay-desk [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the relay server.");
}

async fn server() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_desk=info,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        public_url = %config.server.external_url,
        relay_url = %config.server.relay_url(),
        "Starting relay-desk"
    );

    let twilio = Arc::new(TwilioClient::new(&config.twilio));

    let state = AppState {
        backend: Arc::new(OpenAiClient::new(&config.openai)),
        tools: Arc::new(ToolRegistry::new(Arc::clone(&twilio))),
        twilio,
        config: config.clone(),
    };

    // Build router. CORS is wide open, same as the workshop server this
    // replaces.
    let app = Router::new()
        // Twilio voice webhook
        .route("/voice", post(twilio::webhook::handle_voice))
        // ConversationRelay WebSocket
        .route("/relay", get(relay::handler::handle_relay_upgrade))
        // Health check
        .route("/health", get(health))
        // Informational page
        .route("/", get(index))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid server address");

    tracing::info!(%addr, "Listening");
    tracing::info!(
        "Configure your Twilio number's voice webhook: {}/voice",
        config.server.external_url
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, closing server");
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "publicUrl": state.config.server.external_url,
        "websocketUrl": state.config.server.relay_url(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn index(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Html<String> {
    let public_url = &state.config.server.external_url;
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head><title>relay-desk</title></head>
<body>
  <h1>relay-desk</h1>
  <p>AI receptionist for Twilio ConversationRelay.</p>
  <ul>
    <li><code>POST /voice</code> — webhook for incoming/outgoing calls</li>
    <li><code>GET /relay</code> — ConversationRelay WebSocket endpoint</li>
    <li><code>GET /health</code> — process status</li>
  </ul>
  <p>Set your Twilio phone number's voice webhook to:
     <code>{public_url}/voice</code></p>
</body>
</html>"#
    ))
}
