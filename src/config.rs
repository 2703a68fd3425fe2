use std::path::PathBuf;

/// Runtime configuration, environment variables only.
///
/// `from_lookup` takes the raw values so tests never mutate process-global
/// environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub saas_enabled: bool,
    pub saas_url: Option<String>,
    pub saas_tls: bool,
    pub device_id: Option<String>,
    pub api_key: Option<String>,
    pub provisioning_code: Option<String>,
    pub data_dir: PathBuf,
    pub context_backend: String,
    pub redis_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| get(key).filter(|v| !v.is_empty());

        let data_dir = non_empty("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".edgeflow")
        });

        Config {
            log_dir: non_empty("LOG_DIR").map(PathBuf::from),
            log_level: non_empty("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            saas_enabled: non_empty("SAAS_ENABLED")
                .map(|v| matches!(v.as_str(), "true" | "1"))
                .unwrap_or(false),
            saas_url: non_empty("SAAS_URL"),
            saas_tls: non_empty("SAAS_TLS")
                .map(|v| matches!(v.as_str(), "true" | "1"))
                .unwrap_or(true),
            device_id: non_empty("DEVICE_ID"),
            api_key: non_empty("API_KEY"),
            provisioning_code: non_empty("PROVISIONING_CODE"),
            data_dir,
            context_backend: non_empty("CONTEXT_BACKEND").unwrap_or_else(|| "file".to_string()),
            redis_url: non_empty("REDIS_URL"),
        }
    }

    fn saas_host(&self) -> Option<String> {
        let url = self.saas_url.as_deref()?;
        let host = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .or_else(|| url.strip_prefix("wss://"))
            .or_else(|| url.strip_prefix("ws://"))
            .unwrap_or(url);
        Some(host.trim_end_matches('/').to_string())
    }

    /// REST base for provisioning and shadow sync.
    pub fn saas_api_base(&self) -> Option<String> {
        let scheme = if self.saas_tls { "https" } else { "http" };
        Some(format!("{scheme}://{}/api", self.saas_host()?))
    }

    /// Tunnel endpoint.
    pub fn saas_ws_url(&self) -> Option<String> {
        let scheme = if self.saas_tls { "wss" } else { "ws" };
        Some(format!("{scheme}://{}/tunnel", self.saas_host()?))
    }
}
