use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::info;

use crate::domain::business::BusinessContext;
use crate::domain::workflow::{ActionType, WorkflowAction};
use crate::ports::{EmailMessage, MessagingError, MessagingProvider, SmsMessage, WebhookRequest};
use crate::workflow::trigger::lookup;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("action `{action_id}` is missing parameter `{parameter}`")]
    MissingParameter { action_id: String, parameter: &'static str },
    #[error("action `{action_id}` has invalid parameter `{parameter}`: {reason}")]
    InvalidParameter { action_id: String, parameter: &'static str, reason: String },
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error("{0}")]
    Failed(String),
}

/// Everything an action may read while it runs.
pub struct ActionScope<'a> {
    pub execution_id: &'a str,
    pub business: &'a BusinessContext,
    /// Execution context with the business snapshot mounted under `business`.
    pub values: &'a Value,
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &WorkflowAction,
        scope: &ActionScope<'_>,
    ) -> Result<Value, ActionError>;
}

/// Runs the built-in action types against a messaging provider.
pub struct MessagingActionExecutor {
    messaging: Arc<dyn MessagingProvider>,
}

impl MessagingActionExecutor {
    pub fn new(messaging: Arc<dyn MessagingProvider>) -> Self {
        Self { messaging }
    }
}

#[async_trait]
impl ActionExecutor for MessagingActionExecutor {
    async fn execute(
        &self,
        action: &WorkflowAction,
        scope: &ActionScope<'_>,
    ) -> Result<Value, ActionError> {
        let parameters = render_value(&action.parameters, scope.values);

        match action.action_type {
            ActionType::SendEmail => {
                let message = EmailMessage {
                    to: required_str(action, &parameters, "to")?,
                    subject: optional_str(&parameters, "subject").unwrap_or_default(),
                    body: required_str(action, &parameters, "body")?,
                };
                let receipt = self.messaging.send_email(&message).await?;
                Ok(json!({ "channel": receipt.channel, "message_id": receipt.message_id }))
            }
            ActionType::SendSms => {
                let message = SmsMessage {
                    to: required_str(action, &parameters, "to")?,
                    body: required_str(action, &parameters, "body")?,
                };
                let receipt = self.messaging.send_sms(&message).await?;
                Ok(json!({ "channel": receipt.channel, "message_id": receipt.message_id }))
            }
            ActionType::Webhook => {
                let request = WebhookRequest {
                    url: required_str(action, &parameters, "url")?,
                    payload: parameters.get("payload").cloned().unwrap_or(Value::Null),
                };
                let receipt = self.messaging.send_webhook(&request).await?;
                Ok(json!({ "channel": receipt.channel, "message_id": receipt.message_id }))
            }
            ActionType::Delay => {
                let seconds = delay_seconds(action, &parameters)?;
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                Ok(json!({ "delayed_secs": seconds }))
            }
            ActionType::NotifyStaff => {
                let to = scope.business.profile.email.clone().ok_or_else(|| {
                    MessagingError::NotConfigured(format!(
                        "business {} has no staff contact email",
                        scope.business.business_id
                    ))
                })?;
                let message = EmailMessage {
                    to,
                    subject: optional_str(&parameters, "subject")
                        .unwrap_or_else(|| "Front desk notification".to_string()),
                    body: required_str(action, &parameters, "message")?,
                };
                let receipt = self.messaging.send_email(&message).await?;
                Ok(json!({ "channel": receipt.channel, "message_id": receipt.message_id }))
            }
            ActionType::Log => {
                let message = optional_str(&parameters, "message").unwrap_or_default();
                info!(
                    event_name = "workflow.action.log",
                    execution_id = scope.execution_id,
                    business_id = %scope.business.business_id,
                    action_id = %action.id,
                    message = %message,
                    "workflow log action"
                );
                Ok(json!({ "logged": message }))
            }
        }
    }
}

/// Parameter checks that can run at registration time.
pub fn validate_parameters(action: &WorkflowAction) -> Result<(), ActionError> {
    let parameters = &action.parameters;
    match action.action_type {
        ActionType::SendEmail => {
            required_str(action, parameters, "to")?;
            required_str(action, parameters, "body")?;
        }
        ActionType::SendSms => {
            required_str(action, parameters, "to")?;
            required_str(action, parameters, "body")?;
        }
        ActionType::Webhook => {
            let url = required_str(action, parameters, "url")?;
            if !url.starts_with("http://") && !url.starts_with("https://") && !url.contains("{{") {
                return Err(ActionError::InvalidParameter {
                    action_id: action.id.clone(),
                    parameter: "url",
                    reason: "must be an http(s) URL".to_string(),
                });
            }
        }
        ActionType::Delay => {
            delay_seconds(action, parameters)?;
        }
        ActionType::NotifyStaff => {
            required_str(action, parameters, "message")?;
        }
        ActionType::Log => {}
    }
    Ok(())
}

fn required_str(
    action: &WorkflowAction,
    parameters: &Value,
    parameter: &'static str,
) -> Result<String, ActionError> {
    optional_str(parameters, parameter)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ActionError::MissingParameter { action_id: action.id.clone(), parameter })
}

fn optional_str(parameters: &Value, key: &str) -> Option<String> {
    parameters.get(key).and_then(Value::as_str).map(ToString::to_string)
}

fn delay_seconds(action: &WorkflowAction, parameters: &Value) -> Result<u64, ActionError> {
    let raw = parameters
        .get("seconds")
        .ok_or_else(|| ActionError::MissingParameter { action_id: action.id.clone(), parameter: "seconds" })?;
    raw.as_u64()
        .or_else(|| raw.as_str().and_then(|text| text.trim().parse().ok()))
        .ok_or_else(|| ActionError::InvalidParameter {
            action_id: action.id.clone(),
            parameter: "seconds",
            reason: "expected a non-negative integer".to_string(),
        })
}

/// Substitutes `{{path}}` placeholders in every string of `value`.
pub fn render_value(value: &Value, scope: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(render_template(text, scope)),
        Value::Array(items) => Value::Array(items.iter().map(|item| render_value(item, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), render_value(item, scope)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// Unknown placeholders are left in place so they show up in delivered text.
pub fn render_template(template: &str, scope: &Value) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            output.push_str(&rest[start..]);
            return output;
        };

        let path = after_open[..end].trim();
        match lookup(scope, path) {
            Some(Value::String(text)) => output.push_str(text),
            Some(Value::Null) | None => output.push_str(&rest[start..start + 2 + end + 2]),
            Some(other) => output.push_str(&other.to_string()),
        }
        rest = &after_open[end + 2..];
    }

    output.push_str(rest);
    output
}
