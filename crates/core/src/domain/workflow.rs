use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::business::BusinessId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn generate() -> Self {
        Self(format!("exec-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    NotContains,
    Exists,
    NotExists,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerCondition {
    /// Dotted path into the execution context; `business.` paths resolve
    /// against the fetched business snapshot.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowTrigger {
    Manual,
    TimeBased {
        schedule: String,
        #[serde(default)]
        frequency: Option<String>,
    },
    EventBased {
        event_type: String,
        #[serde(default)]
        conditions: Vec<TriggerCondition>,
    },
    ConditionBased {
        conditions: Vec<TriggerCondition>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SendEmail,
    SendSms,
    Webhook,
    Delay,
    NotifyStaff,
    Log,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
            Self::SendSms => "send_sms",
            Self::Webhook => "webhook",
            Self::Delay => "delay",
            Self::NotifyStaff => "notify_staff",
            Self::Log => "log",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Delay before attempt `retry_count` (1-based):
    /// `retry_delay * backoff_multiplier^(retry_count - 1)`.
    pub fn delay_for(&self, retry_count: u32) -> std::time::Duration {
        let exponent = retry_count.saturating_sub(1).min(32) as i32;
        let multiplier = self.backoff_multiplier.max(0.0).powi(exponent);
        let millis = (self.retry_delay_ms as f64 * multiplier).round();
        let millis = if millis.is_finite() { millis.min(u64::MAX as f64) } else { u64::MAX as f64 };
        std::time::Duration::from_millis(millis as u64)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAction {
    pub id: String,
    pub action_type: ActionType,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub business_id: BusinessId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger: WorkflowTrigger,
    pub actions: Vec<WorkflowAction>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::{Cancelled, Completed, Failed, Pending, Running};
        matches!((self, to), (Pending, Running) | (Running, Completed | Failed | Cancelled))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_id: String,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set while a retry is scheduled.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl ActionResult {
    pub fn pending(action_id: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            status: ActionStatus::Pending,
            retry_count: 0,
            started_at: None,
            completed_at: None,
            next_attempt_at: None,
            output: None,
            error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub business_id: BusinessId,
    pub status: ExecutionStatus,
    pub triggered_by: String,
    pub context: Value,
    pub action_results: Vec<ActionResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub workflow_id: WorkflowId,
    pub business_id: BusinessId,
    pub triggered_by: String,
    #[serde(default)]
    pub context: Value,
}
