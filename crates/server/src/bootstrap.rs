use std::sync::Arc;

use frontdesk_agent::codec::TextPassthroughCodec;
use frontdesk_agent::runtime::AgentRuntime;
use frontdesk_core::audit::TracingAuditSink;
use frontdesk_core::config::{AppConfig, ConfigError, LoadOptions};
use frontdesk_core::domain::routing::{AgentProfile, Route};
use frontdesk_core::errors::ApplicationError;
use frontdesk_core::ports::MessagingError;
use frontdesk_db::{connect_with_config, migrations, DbPool, SqlBusinessDataProvider};
use thiserror::Error;
use tracing::info;

use crate::messaging::RelayMessagingProvider;

pub const FRONT_DESK_ROUTE_ID: &str = "front-desk";

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("messaging provider could not be created: {0}")]
    Messaging(#[source] MessagingError),
    #[error("agent runtime could not be created: {0}")]
    Runtime(#[source] ApplicationError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let messaging =
        RelayMessagingProvider::from_config(&config.messaging).map_err(BootstrapError::Messaging)?;
    info!(
        event_name = "system.bootstrap.messaging_ready",
        correlation_id = "bootstrap",
        mode = if messaging.is_log_only() { "log_only" } else { "relay" },
        "messaging provider initialized"
    );

    let runtime = AgentRuntime::new(
        &config,
        Arc::new(SqlBusinessDataProvider::new(db_pool.clone())),
        Arc::new(TextPassthroughCodec),
        Arc::new(messaging),
        Arc::new(TracingAuditSink),
    )
    .map_err(BootstrapError::Runtime)?;
    runtime
        .router()
        .register_route(front_desk_route(&config))
        .await
        .map_err(BootstrapError::Runtime)?;

    Ok(Application { config, db_pool, runtime: Arc::new(runtime) })
}

/// Catch-all default route so every call reaches an agent until operators
/// register their own routes.
fn front_desk_route(config: &AppConfig) -> Route {
    Route::new(
        FRONT_DESK_ROUTE_ID,
        "Front desk",
        "*",
        AgentProfile {
            agent_id: FRONT_DESK_ROUTE_ID.to_string(),
            display_name: "Front Desk".to_string(),
            greeting: None,
            voice: Some(config.phone.voice.clone()),
        },
    )
    .with_priority(i32::MIN)
    .as_default()
}

#[cfg(test)]
mod tests {
    use frontdesk_core::config::{ConfigOverrides, LoadOptions};
    use frontdesk_core::domain::call::IncomingCall;
    use frontdesk_core::domain::business::BusinessId;
    use frontdesk_db::{seed_demo_business, DEMO_BUSINESS_ID};

    use super::{bootstrap, FRONT_DESK_ROUTE_ID};

    fn options(overrides: ConfigOverrides) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides { database_url: Some("sqlite::memory:".to_string()), ..overrides },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_when_relay_has_no_api_key() {
        let result = bootstrap(options(ConfigOverrides {
            messaging_relay_url: Some("https://relay.example".to_string()),
            ..ConfigOverrides::default()
        }))
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("messaging.api_key"));
    }

    #[tokio::test]
    async fn bootstrapped_runtime_answers_calls_for_seeded_businesses() {
        let app = bootstrap(options(ConfigOverrides::default())).await.expect("bootstrap");
        seed_demo_business(&app.db_pool).await.expect("seed");

        let outcome = app
            .runtime
            .route_call(
                IncomingCall::new("+15551234567", "+15550000000")
                    .for_business(BusinessId(DEMO_BUSINESS_ID.to_string())),
            )
            .await
            .expect("routed");
        assert_eq!(outcome.decision.route.as_ref().map(|route| route.id.0.as_str()), Some(FRONT_DESK_ROUTE_ID));

        let call = outcome.call.expect("session");
        let answered = app.runtime.phone().answer(&call.id).await.expect("answered");
        assert!(answered.greeting.contains("Reyes Plumbing"));

        app.db_pool.close().await;
    }
}
