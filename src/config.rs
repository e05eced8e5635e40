use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub twilio: TwilioConfig,
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Publicly reachable base URL. When empty, derived from environment
    /// (PUBLIC_URL, then GitHub Codespaces port forwarding) or localhost.
    #[serde(default)]
    pub external_url: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

impl ServerConfig {
    /// WebSocket URL for the ConversationRelay endpoint.
    pub fn relay_url(&self) -> String {
        format!(
            "{}/relay",
            self.external_url
                .replace("https://", "wss://")
                .replace("http://", "ws://")
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    /// Default outbound number for confirmation SMS.
    pub phone_number: String,
    /// Conversational Intelligence service SID. When set, a transcript is
    /// submitted after each call ends.
    #[serde(default)]
    pub intelligence_service_sid: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    /// Cap on reply length. Voice replies must stay short for latency.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    150
}

fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    /// Maximum turns replayed per completion request (0 = unlimited).
    /// The oldest system turn is always kept.
    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            max_history_turns: default_max_history_turns(),
        }
    }
}

fn default_max_history_turns() -> usize {
    64
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env from the config directory before reading overrides
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            format!(
                "Failed to read config at {}: {}. Copy config.example.toml to {}",
                path.display(),
                e,
                path.display()
            )
        })?;

        let mut config: Config = toml::from_str(&contents)?;

        // Env var overrides for secrets
        if let Ok(v) = std::env::var("TWILIO_ACCOUNT_SID") {
            config.twilio.account_sid = v;
        }
        if let Ok(v) = std::env::var("TWILIO_AUTH_TOKEN") {
            config.twilio.auth_token = v;
        }
        if let Ok(v) = std::env::var("TWILIO_PHONE_NUMBER") {
            config.twilio.phone_number = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            config.openai.api_key = v;
        }
        if let Ok(v) = std::env::var("CI_SERVICE_SID") {
            config.twilio.intelligence_service_sid = Some(v);
        }

        if config.server.external_url.is_empty() {
            config.server.external_url = derive_external_url(config.server.port);
        }

        Ok(config)
    }
}

/// Resolve the public base URL from the environment.
///
/// Priority: PUBLIC_URL, then GitHub Codespaces port forwarding, then
/// localhost for local development.
fn derive_external_url(port: u16) -> String {
    if let Ok(url) = std::env::var("PUBLIC_URL") {
        if !url.is_empty() {
            return url;
        }
    }

    if let (Ok(name), Ok(domain)) = (
        std::env::var("CODESPACE_NAME"),
        std::env::var("GITHUB_CODESPACES_PORT_FORWARDING_DOMAIN"),
    ) {
        if !name.is_empty() && !domain.is_empty() {
            return format!("https://{name}-{port}.{domain}");
        }
    }

    format!("http://localhost:{port}")
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("RELAY_DESK_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".relay-desk")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("RELAY_DESK_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}
