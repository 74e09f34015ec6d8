use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::business::BusinessId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn generate() -> Self {
        Self(format!("conv-{}", Uuid::new_v4()))
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Phone,
    Chat,
    Video,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    OnHold,
    Transferred,
    Completed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::OnHold => "on_hold",
            Self::Transferred => "transferred",
            Self::Completed => "completed",
        }
    }

    pub fn can_transition_to(&self, to: ConversationStatus) -> bool {
        use ConversationStatus::{Active, Completed, OnHold, Transferred};
        matches!(
            (self, to),
            (Active, OnHold | Transferred | Completed)
                | (OnHold, Active | Transferred | Completed)
                | (Transferred, Completed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    AppointmentBooking,
    ServiceInquiry,
    PricingInquiry,
    Emergency,
    HumanRequest,
    Complaint,
    Goodbye,
    InformationRequest,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::AppointmentBooking => "appointment_booking",
            Self::ServiceInquiry => "service_inquiry",
            Self::PricingInquiry => "pricing_inquiry",
            Self::Emergency => "emergency",
            Self::HumanRequest => "human_request",
            Self::Complaint => "complaint",
            Self::Goodbye => "goodbye",
            Self::InformationRequest => "information_request",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    #[default]
    Neutral,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

pub type Entities = BTreeMap<String, String>;

/// Side effects a reply asks the runtime to perform after the turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationAction {
    BookAppointment { date: Option<String>, time: Option<String> },
    EscalateToHuman { reason: String },
    DispatchEmergency,
    CaptureLead { name: Option<String>, phone: Option<String>, email: Option<String> },
    EndConversation,
}

impl ConversationAction {
    /// Workflow event emitted when this action is dispatched.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::BookAppointment { .. } => "appointment.requested",
            Self::EscalateToHuman { .. } => "conversation.escalated",
            Self::DispatchEmergency => "emergency.reported",
            Self::CaptureLead { .. } => "lead.captured",
            Self::EndConversation => "conversation.ended",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Agent,
    System,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub confidence: Option<f32>,
    pub intent: Option<Intent>,
    pub entities: Entities,
    pub actions: Vec<ConversationAction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<MessageMetadata>,
}

impl Message {
    pub fn new(message_type: MessageType, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub business_id: BusinessId,
    pub customer_id: Option<CustomerId>,
    pub channel: Channel,
    pub messages: Vec<Message>,
    pub intent: Option<Intent>,
    pub entities: Entities,
    pub sentiment: Sentiment,
    pub urgency: Urgency,
    pub status: ConversationStatus,
    pub transfer_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn new(
        id: ConversationId,
        business_id: BusinessId,
        customer_id: Option<CustomerId>,
        channel: Channel,
    ) -> Self {
        Self {
            id,
            business_id,
            customer_id,
            channel,
            messages: Vec::new(),
            intent: None,
            entities: Entities::new(),
            sentiment: Sentiment::Neutral,
            urgency: Urgency::Low,
            status: ConversationStatus::Active,
            transfer_reason: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Appends in insertion order. Completed conversations reject everything.
    pub fn append(&mut self, message: Message) -> Result<(), DomainError> {
        if self.status.is_terminal() {
            return Err(DomainError::ConversationClosed(self.id.0.clone()));
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn transition(&mut self, to: ConversationStatus) -> Result<(), DomainError> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidConversationTransition { from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    /// Moves to `completed` and writes the single terminal system entry.
    pub fn complete(&mut self, reason: &str) -> Result<(), DomainError> {
        self.transition(ConversationStatus::Completed)?;
        self.ended_at = Some(Utc::now());
        self.messages.push(Message::new(
            MessageType::System,
            format!("conversation ended: {reason}"),
        ));
        Ok(())
    }

    /// Additive merge; keys are overwritten, never removed.
    pub fn merge_entities(&mut self, entities: &Entities) {
        for (key, value) in entities {
            self.entities.insert(key.clone(), value.clone());
        }
    }

    pub fn user_turns(&self) -> usize {
        self.messages.iter().filter(|message| message.message_type == MessageType::User).count()
    }

    pub fn seen_intents(&self) -> BTreeSet<Intent> {
        self.messages
            .iter()
            .filter_map(|message| message.metadata.as_ref().and_then(|metadata| metadata.intent))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Conversation {
        Conversation::new(
            ConversationId("conv-1".to_string()),
            BusinessId("biz-1".to_string()),
            None,
            Channel::Phone,
        )
    }

    #[test]
    fn completed_conversation_rejects_messages_after_terminal_entry() {
        let mut conversation = conversation();
        conversation.append(Message::new(MessageType::User, "hello")).unwrap();
        conversation.complete("goodbye").unwrap();

        assert_eq!(conversation.status, ConversationStatus::Completed);
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].message_type, MessageType::System);

        let rejected = conversation.append(Message::new(MessageType::User, "wait"));
        assert!(matches!(rejected, Err(DomainError::ConversationClosed(_))));
        assert_eq!(conversation.messages.len(), 2);
    }

    #[test]
    fn on_hold_can_resume_but_completed_is_terminal() {
        let mut conversation = conversation();
        conversation.transition(ConversationStatus::OnHold).unwrap();
        conversation.transition(ConversationStatus::Active).unwrap();
        conversation.transition(ConversationStatus::Completed).unwrap();

        let result = conversation.transition(ConversationStatus::Active);
        assert_eq!(
            result,
            Err(DomainError::InvalidConversationTransition {
                from: ConversationStatus::Completed,
                to: ConversationStatus::Active,
            })
        );
    }

    #[test]
    fn entity_merge_overwrites_by_key_and_keeps_the_rest() {
        let mut conversation = conversation();
        let mut first = Entities::new();
        first.insert("date".to_string(), "tomorrow".to_string());
        first.insert("name".to_string(), "Dana".to_string());
        conversation.merge_entities(&first);

        let mut second = Entities::new();
        second.insert("date".to_string(), "friday".to_string());
        conversation.merge_entities(&second);

        assert_eq!(conversation.entities.get("date").map(String::as_str), Some("friday"));
        assert_eq!(conversation.entities.get("name").map(String::as_str), Some("Dana"));
    }
}
