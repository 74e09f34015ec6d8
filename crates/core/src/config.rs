use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub context_cache: ContextCacheConfig,
    pub workflow: WorkflowConfig,
    pub phone: PhoneConfig,
    pub messaging: MessagingConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextCacheConfig {
    pub ttl_secs: u64,
    pub activity_window_days: u32,
    pub max_entries: usize,
}

impl ContextCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for ContextCacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 300, activity_window_days: 30, max_entries: 1_000 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowConfig {
    pub max_concurrent_executions: usize,
    pub tick_interval_ms: u64,
    pub max_history: usize,
}

impl WorkflowConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { max_concurrent_executions: 10, tick_interval_ms: 1_000, max_history: 500 }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PhoneConfig {
    pub voice: String,
    pub language: String,
    pub min_transcript_confidence: f32,
    pub codec_max_retries: u32,
    /// Local offset used when evaluating routing rule time windows.
    pub utc_offset_minutes: i32,
    /// Ended calls and completed conversations kept in memory.
    pub max_history: usize,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            language: "en-US".to_string(),
            min_transcript_confidence: 0.3,
            codec_max_retries: 2,
            utc_offset_minutes: 0,
            max_history: 500,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MessagingConfig {
    pub relay_url: Option<String>,
    pub api_key: Option<SecretString>,
    pub webhook_signing_secret: Option<SecretString>,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub context_cache_ttl_secs: Option<u64>,
    pub max_concurrent_executions: Option<usize>,
    pub messaging_relay_url: Option<String>,
    pub messaging_api_key: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://frontdesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            context_cache: ContextCacheConfig::default(),
            workflow: WorkflowConfig::default(),
            phone: PhoneConfig::default(),
            messaging: MessagingConfig {
                relay_url: None,
                api_key: None,
                webhook_signing_secret: None,
                timeout_secs: 10,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("frontdesk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(cache) = patch.context_cache {
            if let Some(ttl_secs) = cache.ttl_secs {
                self.context_cache.ttl_secs = ttl_secs;
            }
            if let Some(activity_window_days) = cache.activity_window_days {
                self.context_cache.activity_window_days = activity_window_days;
            }
            if let Some(max_entries) = cache.max_entries {
                self.context_cache.max_entries = max_entries;
            }
        }

        if let Some(workflow) = patch.workflow {
            if let Some(max_concurrent_executions) = workflow.max_concurrent_executions {
                self.workflow.max_concurrent_executions = max_concurrent_executions;
            }
            if let Some(tick_interval_ms) = workflow.tick_interval_ms {
                self.workflow.tick_interval_ms = tick_interval_ms;
            }
            if let Some(max_history) = workflow.max_history {
                self.workflow.max_history = max_history;
            }
        }

        if let Some(phone) = patch.phone {
            if let Some(voice) = phone.voice {
                self.phone.voice = voice;
            }
            if let Some(language) = phone.language {
                self.phone.language = language;
            }
            if let Some(min_transcript_confidence) = phone.min_transcript_confidence {
                self.phone.min_transcript_confidence = min_transcript_confidence;
            }
            if let Some(codec_max_retries) = phone.codec_max_retries {
                self.phone.codec_max_retries = codec_max_retries;
            }
            if let Some(utc_offset_minutes) = phone.utc_offset_minutes {
                self.phone.utc_offset_minutes = utc_offset_minutes;
            }
            if let Some(max_history) = phone.max_history {
                self.phone.max_history = max_history;
            }
        }

        if let Some(messaging) = patch.messaging {
            if let Some(relay_url) = messaging.relay_url {
                self.messaging.relay_url = Some(relay_url);
            }
            if let Some(messaging_api_key_value) = messaging.api_key {
                self.messaging.api_key = Some(secret_value(messaging_api_key_value));
            }
            if let Some(signing_secret_value) = messaging.webhook_signing_secret {
                self.messaging.webhook_signing_secret = Some(secret_value(signing_secret_value));
            }
            if let Some(timeout_secs) = messaging.timeout_secs {
                self.messaging.timeout_secs = timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("FRONTDESK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("FRONTDESK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_number("FRONTDESK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_number("FRONTDESK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("FRONTDESK_SERVER_PORT") {
            self.server.port = parse_number("FRONTDESK_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_number("FRONTDESK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_CONTEXT_CACHE_TTL_SECS") {
            self.context_cache.ttl_secs = parse_number("FRONTDESK_CONTEXT_CACHE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_CONTEXT_CACHE_ACTIVITY_WINDOW_DAYS") {
            self.context_cache.activity_window_days =
                parse_number("FRONTDESK_CONTEXT_CACHE_ACTIVITY_WINDOW_DAYS", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_CONTEXT_CACHE_MAX_ENTRIES") {
            self.context_cache.max_entries =
                parse_number("FRONTDESK_CONTEXT_CACHE_MAX_ENTRIES", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_WORKFLOW_MAX_CONCURRENT_EXECUTIONS") {
            self.workflow.max_concurrent_executions =
                parse_number("FRONTDESK_WORKFLOW_MAX_CONCURRENT_EXECUTIONS", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_WORKFLOW_TICK_INTERVAL_MS") {
            self.workflow.tick_interval_ms =
                parse_number("FRONTDESK_WORKFLOW_TICK_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_WORKFLOW_MAX_HISTORY") {
            self.workflow.max_history = parse_number("FRONTDESK_WORKFLOW_MAX_HISTORY", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_PHONE_VOICE") {
            self.phone.voice = value;
        }
        if let Some(value) = read_env("FRONTDESK_PHONE_LANGUAGE") {
            self.phone.language = value;
        }
        if let Some(value) = read_env("FRONTDESK_PHONE_MIN_TRANSCRIPT_CONFIDENCE") {
            self.phone.min_transcript_confidence =
                parse_number("FRONTDESK_PHONE_MIN_TRANSCRIPT_CONFIDENCE", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_PHONE_CODEC_MAX_RETRIES") {
            self.phone.codec_max_retries =
                parse_number("FRONTDESK_PHONE_CODEC_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_PHONE_UTC_OFFSET_MINUTES") {
            self.phone.utc_offset_minutes =
                parse_number("FRONTDESK_PHONE_UTC_OFFSET_MINUTES", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_PHONE_MAX_HISTORY") {
            self.phone.max_history = parse_number("FRONTDESK_PHONE_MAX_HISTORY", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_MESSAGING_RELAY_URL") {
            self.messaging.relay_url = Some(value);
        }
        if let Some(value) = read_env("FRONTDESK_MESSAGING_API_KEY") {
            self.messaging.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("FRONTDESK_MESSAGING_WEBHOOK_SIGNING_SECRET") {
            self.messaging.webhook_signing_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("FRONTDESK_MESSAGING_TIMEOUT_SECS") {
            self.messaging.timeout_secs = parse_number("FRONTDESK_MESSAGING_TIMEOUT_SECS", &value)?;
        }

        let log_level =
            read_env("FRONTDESK_LOGGING_LEVEL").or_else(|| read_env("FRONTDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("FRONTDESK_LOGGING_FORMAT").or_else(|| read_env("FRONTDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(ttl_secs) = overrides.context_cache_ttl_secs {
            self.context_cache.ttl_secs = ttl_secs;
        }
        if let Some(max_concurrent_executions) = overrides.max_concurrent_executions {
            self.workflow.max_concurrent_executions = max_concurrent_executions;
        }
        if let Some(relay_url) = overrides.messaging_relay_url {
            self.messaging.relay_url = Some(relay_url);
        }
        if let Some(api_key) = overrides.messaging_api_key {
            self.messaging.api_key = Some(secret_value(api_key));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_context_cache(&self.context_cache)?;
        validate_workflow(&self.workflow)?;
        validate_phone(&self.phone)?;
        validate_messaging(&self.messaging)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("frontdesk.toml"), PathBuf::from("config/frontdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_context_cache(cache: &ContextCacheConfig) -> Result<(), ConfigError> {
    if cache.ttl_secs == 0 || cache.ttl_secs > 3_600 {
        return Err(ConfigError::Validation(
            "context_cache.ttl_secs must be in range 1..=3600".to_string(),
        ));
    }

    if cache.activity_window_days == 0 || cache.activity_window_days > 365 {
        return Err(ConfigError::Validation(
            "context_cache.activity_window_days must be in range 1..=365".to_string(),
        ));
    }

    if cache.max_entries == 0 {
        return Err(ConfigError::Validation(
            "context_cache.max_entries must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_workflow(workflow: &WorkflowConfig) -> Result<(), ConfigError> {
    if workflow.max_concurrent_executions == 0 {
        return Err(ConfigError::Validation(
            "workflow.max_concurrent_executions must be at least 1".to_string(),
        ));
    }

    if !(10..=60_000).contains(&workflow.tick_interval_ms) {
        return Err(ConfigError::Validation(
            "workflow.tick_interval_ms must be in range 10..=60000".to_string(),
        ));
    }

    Ok(())
}

fn validate_phone(phone: &PhoneConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&phone.min_transcript_confidence) {
        return Err(ConfigError::Validation(
            "phone.min_transcript_confidence must be in range 0.0..=1.0".to_string(),
        ));
    }

    if !(-720..=840).contains(&phone.utc_offset_minutes) {
        return Err(ConfigError::Validation(
            "phone.utc_offset_minutes must be in range -720..=840".to_string(),
        ));
    }

    if phone.voice.trim().is_empty() {
        return Err(ConfigError::Validation("phone.voice must not be empty".to_string()));
    }

    if phone.max_history == 0 {
        return Err(ConfigError::Validation("phone.max_history must be at least 1".to_string()));
    }

    Ok(())
}

fn validate_messaging(messaging: &MessagingConfig) -> Result<(), ConfigError> {
    if let Some(relay_url) = &messaging.relay_url {
        if !relay_url.starts_with("http://") && !relay_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "messaging.relay_url must start with http:// or https://".to_string(),
            ));
        }

        let missing_key = messaging
            .api_key
            .as_ref()
            .map(|value| value.expose_secret().trim().is_empty())
            .unwrap_or(true);
        if missing_key {
            return Err(ConfigError::Validation(
                "messaging.api_key is required when messaging.relay_url is set".to_string(),
            ));
        }
    }

    if messaging.timeout_secs == 0 || messaging.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "messaging.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    context_cache: Option<ContextCachePatch>,
    workflow: Option<WorkflowPatch>,
    phone: Option<PhonePatch>,
    messaging: Option<MessagingPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ContextCachePatch {
    ttl_secs: Option<u64>,
    activity_window_days: Option<u32>,
    max_entries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowPatch {
    max_concurrent_executions: Option<usize>,
    tick_interval_ms: Option<u64>,
    max_history: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct PhonePatch {
    voice: Option<String>,
    language: Option<String>,
    min_transcript_confidence: Option<f32>,
    codec_max_retries: Option<u32>,
    utc_offset_minutes: Option<i32>,
    max_history: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagingPatch {
    relay_url: Option<String>,
    api_key: Option<String>,
    webhook_signing_secret: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
