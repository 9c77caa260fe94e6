use serde::Deserialize;
use std::path::Path;

use crate::oauth::ProviderType;

/// Top-level configuration parsed from TOML.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub kubernetes: KubernetesConfig,
    #[serde(rename = "provider")]
    pub providers: Vec<ProviderConfig>,
}

/// Server-level configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally visible URL of the broker. Callback URLs are derived from it.
    pub base_url: String,
    /// Base64 secret used to verify the HMAC-signed OAuth state.
    pub state_secret: String,
    /// Base64 secret for sealing stored tokens. Falls back to `state_secret`.
    #[serde(default)]
    pub storage_secret: Option<String>,
    /// Lifetime of a session and of the veiled states recorded in it (seconds).
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    /// Lifetime of states signed by this broker (seconds).
    #[serde(default = "default_state_ttl")]
    pub state_ttl: u64,
    /// Timeout for calls to providers and the Kubernetes API (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Origins allowed to make credentialed cross-origin requests.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_state_ttl() -> u64 {
    900
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct KubernetesConfig {
    pub api_server: String,
    /// PEM bundle to trust for the API server, e.g. the in-cluster CA.
    #[serde(default)]
    pub ca_cert_path: Option<String>,
}

/// Static OAuth configuration for one service provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Base URL of a self-hosted or enterprise installation.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub auth_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
}

impl ServerConfig {
    pub fn state_secret_bytes(&self) -> Result<Vec<u8>, String> {
        decode_secret("server.state_secret", &self.state_secret)
    }

    pub fn storage_secret_bytes(&self) -> Result<Vec<u8>, String> {
        match &self.storage_secret {
            Some(secret) => decode_secret("server.storage_secret", secret),
            None => self.state_secret_bytes(),
        }
    }

    /// Session cookies are only marked `Secure` when served over https.
    pub fn secure_cookies(&self) -> bool {
        self.base_url.starts_with("https://")
    }
}

/// Load and validate config from a TOML file, applying environment variable overrides.
pub fn load_config(path: &Path) -> Result<Config, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

    let mut config: Config =
        toml::from_str(&content).map_err(|e| format!("Failed to parse TOML config: {e}"))?;

    apply_env_overrides(&mut config);
    validate(&config)?;

    Ok(config)
}

/// Apply environment variable overrides.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("SPI_OAUTH_STATE_SECRET") {
        config.server.state_secret = val;
    }
    if let Ok(val) = std::env::var("SPI_OAUTH_STORAGE_SECRET") {
        config.server.storage_secret = Some(val);
    }
    if let Ok(val) = std::env::var("SPI_OAUTH_API_SERVER") {
        config.kubernetes.api_server = val;
    }

    // SPI_OAUTH_<PROVIDER>_CLIENT_SECRET overrides provider client_secret
    for provider in &mut config.providers {
        let env_name = format!(
            "SPI_OAUTH_{}_CLIENT_SECRET",
            provider.provider_type.path_segment().to_uppercase()
        );
        if let Ok(val) = std::env::var(&env_name) {
            provider.client_secret = val;
        }
    }
}

/// Validate the entire configuration. Returns an error string on failure.
fn validate(config: &Config) -> Result<(), String> {
    validate_server(&config.server)?;
    validate_kubernetes(&config.kubernetes)?;
    validate_providers(&config.providers)?;
    Ok(())
}

fn decode_secret(field: &str, secret: &str) -> Result<Vec<u8>, String> {
    if secret.is_empty() {
        return Err(format!("{field} is required"));
    }
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, secret)
        .map_err(|e| format!("{field} is not valid base64: {e}"))?;
    if bytes.len() < 32 {
        return Err(format!(
            "{field} must be at least 32 bytes when base64-decoded (got {} bytes). Generate with: openssl rand -base64 32",
            bytes.len()
        ));
    }
    Ok(bytes)
}

fn validate_http_url(field: &str, url: &str) -> Result<(), String> {
    if url.is_empty() {
        return Err(format!("{field} is required"));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(format!("{field} must be a valid HTTP(S) URL"));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), String> {
    validate_http_url("server.base_url", &server.base_url)?;

    if server.base_url.ends_with('/') {
        return Err("server.base_url must not have a trailing slash".to_string());
    }

    // Warn (but allow) http:// for local dev
    if server.base_url.starts_with("http://") {
        tracing::warn!(
            "server.base_url uses http://; HTTPS is required for production deployments"
        );
    }

    server.state_secret_bytes()?;
    server.storage_secret_bytes()?;

    if server.session_ttl == 0 {
        return Err("server.session_ttl must be greater than zero".to_string());
    }
    if server.request_timeout == 0 {
        return Err("server.request_timeout must be greater than zero".to_string());
    }

    Ok(())
}

fn validate_kubernetes(kubernetes: &KubernetesConfig) -> Result<(), String> {
    validate_http_url("kubernetes.api_server", &kubernetes.api_server)
}

fn validate_providers(providers: &[ProviderConfig]) -> Result<(), String> {
    if providers.is_empty() {
        return Err("At least one [[provider]] entry is required".to_string());
    }

    let client_id_regex = regex_lite::Regex::new(r"^[A-Za-z0-9._-]+$")
        .map_err(|e| format!("internal regex error: {e}"))?;
    let mut seen = std::collections::HashSet::new();

    for provider in providers {
        let name = provider.provider_type;

        if !seen.insert(name) {
            return Err(format!(
                "provider '{name}': duplicate entry; each provider type may be configured once"
            ));
        }

        if !client_id_regex.is_match(&provider.client_id) {
            return Err(format!(
                "provider '{name}': client_id is required and must match ^[A-Za-z0-9._-]+$"
            ));
        }

        if provider.client_secret.is_empty() {
            return Err(format!(
                "provider '{name}': client_secret is required (or set SPI_OAUTH_{}_CLIENT_SECRET)",
                name.path_segment().to_uppercase()
            ));
        }

        for (field, value) in [
            ("base_url", &provider.base_url),
            ("auth_url", &provider.auth_url),
            ("token_url", &provider.token_url),
        ] {
            if let Some(url) = value {
                validate_http_url(&format!("provider '{name}': {field}"), url)?;
            }
        }
    }

    Ok(())
}
