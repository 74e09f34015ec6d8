use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::business::BusinessId;
use crate::domain::conversation::ConversationId;
use crate::domain::routing::RouteId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn generate() -> Self {
        Self(format!("call-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Incoming,
    Connected,
    OnHold,
    Transferred,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Connected => "connected",
            Self::OnHold => "on_hold",
            Self::Transferred => "transferred",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Forward-only lifecycle; nothing returns to `incoming`.
    pub fn can_transition_to(&self, to: CallStatus) -> bool {
        use CallStatus::{Completed, Connected, Failed, Incoming, OnHold, Transferred};
        matches!(
            (self, to),
            (Incoming, Connected | Completed | Failed)
                | (Connected, OnHold | Transferred | Completed | Failed)
                | (OnHold, Connected | Transferred | Completed | Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transferred | Self::Completed | Self::Failed)
    }
}

/// Metadata for an inbound call as received from the telephony edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCall {
    pub call_id: Option<CallId>,
    pub business_id: Option<BusinessId>,
    pub from_number: String,
    pub to_number: String,
    pub caller_name: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl IncomingCall {
    pub fn new(from_number: impl Into<String>, to_number: impl Into<String>) -> Self {
        Self {
            call_id: None,
            business_id: None,
            from_number: from_number.into(),
            to_number: to_number.into(),
            caller_name: None,
            received_at: Utc::now(),
        }
    }

    pub fn for_business(mut self, business_id: BusinessId) -> Self {
        self.business_id = Some(business_id);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub business_id: BusinessId,
    pub route_id: Option<RouteId>,
    pub conversation_id: Option<ConversationId>,
    pub from_number: String,
    pub to_number: String,
    pub caller_name: Option<String>,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub transfer_reason: Option<String>,
    pub end_reason: Option<String>,
    pub summary: Option<String>,
}

impl Call {
    pub fn transition(&mut self, to: CallStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidCallTransition { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    pub fn was_answered(&self) -> bool {
        self.answered_at.is_some()
    }

    pub fn was_escalated(&self) -> bool {
        self.transfer_reason.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallMetrics {
    pub total_calls: u64,
    pub answered_calls: u64,
    pub escalated_calls: u64,
    pub answer_rate: f64,
    pub escalation_rate: f64,
    pub average_duration_secs: f64,
}
