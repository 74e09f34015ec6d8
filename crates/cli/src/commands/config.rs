use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use frontdesk_core::config::{AppConfig, LoadOptions};
use secrecy::SecretString;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, value) in effective_values(&config) {
        let source = field_source(key_path, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(format!("- {key_path} = {value} (source: {source})"));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String)> {
    vec![
        ("database.url", config.database.url.clone()),
        ("database.max_connections", config.database.max_connections.to_string()),
        ("database.timeout_secs", config.database.timeout_secs.to_string()),
        ("server.bind_address", config.server.bind_address.clone()),
        ("server.port", config.server.port.to_string()),
        ("server.graceful_shutdown_secs", config.server.graceful_shutdown_secs.to_string()),
        ("context_cache.ttl_secs", config.context_cache.ttl_secs.to_string()),
        (
            "context_cache.activity_window_days",
            config.context_cache.activity_window_days.to_string(),
        ),
        ("context_cache.max_entries", config.context_cache.max_entries.to_string()),
        (
            "workflow.max_concurrent_executions",
            config.workflow.max_concurrent_executions.to_string(),
        ),
        ("workflow.tick_interval_ms", config.workflow.tick_interval_ms.to_string()),
        ("workflow.max_history", config.workflow.max_history.to_string()),
        ("phone.voice", config.phone.voice.clone()),
        ("phone.language", config.phone.language.clone()),
        (
            "phone.min_transcript_confidence",
            config.phone.min_transcript_confidence.to_string(),
        ),
        ("phone.codec_max_retries", config.phone.codec_max_retries.to_string()),
        ("phone.utc_offset_minutes", config.phone.utc_offset_minutes.to_string()),
        ("phone.max_history", config.phone.max_history.to_string()),
        (
            "messaging.relay_url",
            config.messaging.relay_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        ("messaging.api_key", redact(config.messaging.api_key.as_ref())),
        (
            "messaging.webhook_signing_secret",
            redact(config.messaging.webhook_signing_secret.as_ref()),
        ),
        ("messaging.timeout_secs", config.messaging.timeout_secs.to_string()),
        ("logging.level", config.logging.level.clone()),
        ("logging.format", format!("{:?}", config.logging.format)),
    ]
}

/// `database.url` is read from `FRONTDESK_DATABASE_URL`, and so on.
fn env_key(key_path: &str) -> String {
    format!("FRONTDESK_{}", key_path.replace('.', "_").to_ascii_uppercase())
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("frontdesk.toml"), PathBuf::from("config/frontdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    let env_key = env_key(key_path);
    if env::var_os(&env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn redact(secret: Option<&SecretString>) -> String {
    match secret {
        Some(_) => "<redacted>".to_string(),
        None => "<unset>".to_string(),
    }
}
