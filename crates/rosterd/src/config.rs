use roster_cache::CacheMode;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind host (default: 127.0.0.1).
    pub host: String,
    /// HTTP bind port (default: 8000).
    pub port: u16,
    /// Reject non-loopback clients on the dashboard surface.
    pub local_only: bool,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity required for a positive match.
    pub similarity_threshold: f32,
    /// Gap between the two best identities below which a match is ambiguous.
    pub ambiguity_epsilon: f32,
    /// Catalog size up to which exact search is used.
    pub exact_search_limit: usize,
    /// Minimum time between two admitted events for one identity.
    pub cooldown: Duration,
    pub cache_mode: CacheMode,
    pub remote_cache_url: String,
    pub remote_cache_token: String,
    pub local_cache_url: String,
    /// Start a local cache instance when none is reachable.
    pub auto_start_local_cache: bool,
    /// Custom provisioning command, tried before the built-in ones.
    pub local_cache_start_cmd: String,
    pub prefer_container_cache: bool,
    pub local_cache_start_timeout: Duration,
    /// How often to re-probe the cache backends.
    pub cache_reprobe: Duration,
    /// Working directory for scripts and the container compose file.
    pub project_root: PathBuf,
    pub script_interpreter: String,
    /// Optional TOML script registry replacing the built-in one.
    pub scripts_file: Option<PathBuf>,
    /// Viewer connections silent for longer than this are closed.
    pub relay_silence: Duration,
}

impl Config {
    /// Load configuration from `ROSTER_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("roster");

        let db_path = std::env::var("ROSTER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("roster.db"));

        let project_root = std::env::var("ROSTER_PROJECT_ROOT")
            .map(PathBuf::from)
            .or_else(|_| std::env::current_dir())
            .unwrap_or_else(|_| PathBuf::from("."));

        Self {
            host: env_string("ROSTER_HOST", "127.0.0.1"),
            port: env_parse("ROSTER_PORT", 8000),
            local_only: env_bool("ROSTER_LOCAL_ONLY", true),
            db_path,
            similarity_threshold: env_parse("ROSTER_SIMILARITY_THRESHOLD", 0.5),
            ambiguity_epsilon: env_parse(
                "ROSTER_AMBIGUITY_EPSILON",
                roster_core::matcher::DEFAULT_AMBIGUITY_EPSILON,
            ),
            exact_search_limit: env_parse(
                "ROSTER_EXACT_SEARCH_LIMIT",
                roster_core::matcher::DEFAULT_EXACT_LIMIT,
            ),
            cooldown: Duration::from_secs(env_parse("ROSTER_COOLDOWN_SECS", 12 * 3600)),
            cache_mode: CacheMode::parse(&env_string("ROSTER_CACHE_BACKEND", "auto")),
            remote_cache_url: env_string("ROSTER_REMOTE_CACHE_URL", ""),
            remote_cache_token: env_string("ROSTER_REMOTE_CACHE_TOKEN", ""),
            local_cache_url: env_string("ROSTER_LOCAL_CACHE_URL", "redis://127.0.0.1:6379/0"),
            auto_start_local_cache: env_bool("ROSTER_AUTO_START_LOCAL_CACHE", true),
            local_cache_start_cmd: env_string("ROSTER_LOCAL_CACHE_START_CMD", ""),
            prefer_container_cache: env_bool("ROSTER_PREFER_CONTAINER_CACHE", true),
            local_cache_start_timeout: Duration::from_secs(env_parse(
                "ROSTER_LOCAL_CACHE_START_TIMEOUT_SECS",
                12,
            )),
            cache_reprobe: Duration::from_secs(env_parse("ROSTER_CACHE_REPROBE_SECS", 30).max(1)),
            project_root,
            script_interpreter: env_string("ROSTER_SCRIPT_INTERPRETER", "python3"),
            scripts_file: std::env::var("ROSTER_SCRIPTS_FILE")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            relay_silence: Duration::from_secs(env_parse("ROSTER_RELAY_SILENCE_SECS", 30).max(1)),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn remote_cache_configured(&self) -> bool {
        !self.remote_cache_url.is_empty() && !self.remote_cache_token.is_empty()
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
