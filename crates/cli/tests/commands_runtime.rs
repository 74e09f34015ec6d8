use std::env;
use std::sync::{Mutex, OnceLock};

use frontdesk_cli::commands::{analyze, config, doctor, migrate, seed};
use serde_json::Value;

#[test]
fn migrate_returns_success_with_valid_env() {
    with_database(&[], |_| {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_for_relay_without_key() {
    with_database(&[("FRONTDESK_MESSAGING_RELAY_URL", "https://relay.example.com")], |_| {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn seed_loads_the_demo_business() {
    with_database(&[], |_| {
        let result = seed::run();
        assert_eq!(result.exit_code, 0, "expected seed success");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "seed");
        assert_eq!(payload["status"], "ok");
        let message = payload["message"].as_str().unwrap_or_default();
        assert!(message.contains("biz-reyes-plumbing"), "unexpected message: {message}");
        assert!(message.contains("3 services"));
    });
}

#[test]
fn seed_is_idempotent_across_runs() {
    with_database(&[], |_| {
        let first = parse_payload(&seed::run().output);
        let second = parse_payload(&seed::run().output);

        assert_eq!(first["status"], "ok");
        assert_eq!(second["status"], "ok");
        assert_eq!(first["message"], second["message"]);
    });
}

#[test]
fn doctor_reports_pending_migrations_then_ready() {
    with_database(&[], |_| {
        let before = doctor::run(true);
        let report = parse_payload(&before.output);
        assert_eq!(check_status(&report, "database_connectivity"), "pass");
        assert_eq!(check_status(&report, "schema_migrations"), "warn");
        assert_eq!(before.exit_code, 0);

        assert_eq!(migrate::run().exit_code, 0);

        let after = parse_payload(&doctor::run(true).output);
        assert_eq!(check_status(&after, "schema_migrations"), "pass");
        assert_eq!(check_status(&after, "messaging_readiness"), "warn");
        assert_eq!(after["overall_status"], "warn");
    });
}

#[test]
fn doctor_skips_dependent_checks_when_config_is_invalid() {
    with_database(&[("FRONTDESK_SERVER_PORT", "not-a-port")], |_| {
        let result = doctor::run(false);

        assert_eq!(result.exit_code, 1);
        assert!(result.output.contains("- [fail] config_validation"));
        assert!(result.output.contains("- [skip] database_connectivity"));
    });
}

#[test]
fn config_attributes_env_overrides() {
    with_database(&[("FRONTDESK_MESSAGING_API_KEY", "relay-secret-value")], |url| {
        let output = config::run();

        assert!(output.contains(&format!(
            "- database.url = {url} (source: env (FRONTDESK_DATABASE_URL))"
        )));
        assert!(output.contains("- phone.voice = alloy (source: default)"));
        assert!(!output.contains("relay-secret-value"));
    });
}

#[test]
fn analyze_prints_the_extracted_analysis() {
    let result = analyze::run("Can I book an appointment for tomorrow at 3pm? Call me at 555-123-4567");
    assert_eq!(result.exit_code, 0);

    let payload = parse_payload(&result.output);
    assert_eq!(payload["command"], "analyze");
    assert_eq!(payload["data"]["intent"], "appointment_booking");
    assert_eq!(payload["data"]["urgency"], "medium");
}

fn check_status(report: &Value, name: &str) -> String {
    report["checks"]
        .as_array()
        .and_then(|checks| checks.iter().find(|check| check["name"] == name))
        .and_then(|check| check["status"].as_str())
        .unwrap_or("missing")
        .to_string()
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

/// Runs `test_fn` against a fresh database file with a clean FRONTDESK_* env.
fn with_database(vars: &[(&str, &str)], test_fn: impl FnOnce(&str)) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("frontdesk.db").display());

    let keys = [
        "FRONTDESK_DATABASE_URL",
        "FRONTDESK_DATABASE_MAX_CONNECTIONS",
        "FRONTDESK_DATABASE_TIMEOUT_SECS",
        "FRONTDESK_SERVER_BIND_ADDRESS",
        "FRONTDESK_SERVER_PORT",
        "FRONTDESK_PHONE_VOICE",
        "FRONTDESK_MESSAGING_RELAY_URL",
        "FRONTDESK_MESSAGING_API_KEY",
        "FRONTDESK_MESSAGING_WEBHOOK_SIGNING_SECRET",
        "FRONTDESK_LOGGING_LEVEL",
        "FRONTDESK_LOGGING_FORMAT",
        "FRONTDESK_LOG_LEVEL",
        "FRONTDESK_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    env::set_var("FRONTDESK_DATABASE_URL", &url);
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn(&url);

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
