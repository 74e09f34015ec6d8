use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use frontdesk_core::context::ContextCache;
use frontdesk_core::domain::business::BusinessId;
use frontdesk_core::domain::conversation::{
    Channel, Conversation, ConversationAction, ConversationId, ConversationStatus, CustomerId,
    Entities, Intent, Message, MessageMetadata, MessageType,
};
use frontdesk_core::domain::routing::AgentProfile;
use frontdesk_core::errors::{ApplicationError, DomainError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::extraction::{Analysis, Extractor};
use crate::replies::{ReplyContext, ReplyKind, ReplyRenderer, TECHNICAL_ERROR_REPLY};

pub const TECHNICAL_ERROR_REASON: &str = "technical_error";

/// Reply produced for one caller turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub text: String,
    pub intent: Option<Intent>,
    pub confidence: f32,
    pub actions: Vec<ConversationAction>,
    pub escalation_required: bool,
    pub transfer_reason: Option<String>,
}

impl Response {
    fn technical_error() -> Self {
        Self {
            text: TECHNICAL_ERROR_REPLY.to_string(),
            intent: None,
            confidence: 0.0,
            actions: vec![ConversationAction::EscalateToHuman {
                reason: TECHNICAL_ERROR_REASON.to_string(),
            }],
            escalation_required: true,
            transfer_reason: Some(TECHNICAL_ERROR_REASON.to_string()),
        }
    }
}

/// Caller-supplied facts about a turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    /// Set when the text came from speech transcription.
    pub transcript_confidence: Option<f32>,
    pub correlation_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConversationSettings {
    pub min_transcript_confidence: f32,
    /// Completed conversations kept for lookup; the oldest are dropped first.
    pub max_completed: usize,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self { min_transcript_confidence: 0.3, max_completed: 500 }
    }
}

/// Receives the side effects attached to an agent reply.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        conversation: &Conversation,
        action: &ConversationAction,
    ) -> Result<(), ApplicationError>;
}

/// Dispatcher that only records actions in the log stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl ActionDispatcher for LoggingDispatcher {
    async fn dispatch(
        &self,
        conversation: &Conversation,
        action: &ConversationAction,
    ) -> Result<(), ApplicationError> {
        info!(
            event_name = "conversation.action.logged",
            conversation_id = %conversation.id,
            business_id = %conversation.business_id,
            action = action.event_type(),
            "conversation action not dispatched"
        );
        Ok(())
    }
}

struct Turn {
    response: Response,
    /// Status to move to once the agent reply is appended.
    settle: Option<Settle>,
}

enum Settle {
    Transfer(String),
    Complete(&'static str),
}

/// Drives every conversation through its lifecycle. Each conversation has its
/// own lock so turns are applied in arrival order without blocking others.
pub struct ConversationManager {
    contexts: Arc<ContextCache>,
    extractor: Extractor,
    replies: ReplyRenderer,
    dispatcher: Arc<dyn ActionDispatcher>,
    settings: ConversationSettings,
    conversations: Mutex<HashMap<ConversationId, Arc<Mutex<Conversation>>>>,
    completed: Mutex<VecDeque<ConversationId>>,
}

impl ConversationManager {
    pub fn new(
        contexts: Arc<ContextCache>,
        dispatcher: Arc<dyn ActionDispatcher>,
        settings: ConversationSettings,
    ) -> Result<Self, ApplicationError> {
        let replies =
            ReplyRenderer::new().map_err(|error| ApplicationError::Configuration(error.to_string()))?;
        Ok(Self::with_parts(contexts, Extractor::default(), replies, dispatcher, settings))
    }

    pub fn with_parts(
        contexts: Arc<ContextCache>,
        extractor: Extractor,
        replies: ReplyRenderer,
        dispatcher: Arc<dyn ActionDispatcher>,
        settings: ConversationSettings,
    ) -> Self {
        Self {
            contexts,
            extractor,
            replies,
            dispatcher,
            settings,
            conversations: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
        }
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub async fn start_conversation(
        &self,
        business_id: BusinessId,
        customer_id: Option<CustomerId>,
        channel: Channel,
    ) -> Conversation {
        let conversation =
            Conversation::new(ConversationId::generate(), business_id, customer_id, channel);
        let snapshot = conversation.clone();
        self.conversations
            .lock()
            .await
            .insert(conversation.id.clone(), Arc::new(Mutex::new(conversation)));

        info!(
            event_name = "conversation.started",
            conversation_id = %snapshot.id,
            business_id = %snapshot.business_id,
            channel = ?snapshot.channel,
            "conversation started"
        );
        snapshot
    }

    /// Renders the opening line for `agent` and records it as the first agent message.
    pub async fn welcome(
        &self,
        conversation_id: &ConversationId,
        agent: Option<&AgentProfile>,
    ) -> Result<String, ApplicationError> {
        let handle = self.handle(conversation_id).await?;
        let mut conversation = handle.lock().await;

        let business = self.contexts.get(&conversation.business_id).await?;
        let mut context = ReplyContext::from_business(&business, &conversation.entities);
        if let Some(agent) = agent {
            context.agent_name = Some(agent.display_name.clone());
            context.greeting = agent.greeting.clone();
        }
        let text = self
            .replies
            .render(ReplyKind::Welcome, &context)
            .map_err(|error| ApplicationError::Configuration(error.to_string()))?;

        conversation.append(Message::new(MessageType::Agent, text.clone()))?;
        Ok(text)
    }

    /// Appends exactly one user and one agent message, whatever happens in between.
    pub async fn process_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        metadata: TurnMetadata,
    ) -> Result<Response, ApplicationError> {
        let handle = self.handle(conversation_id).await?;
        let mut conversation = handle.lock().await;
        let correlation_id = metadata.correlation_id.clone().unwrap_or_else(|| conversation.id.0.clone());

        conversation.append(Message::new(MessageType::User, text))?;

        let turn = if self.needs_clarification(text, &metadata) {
            self.clarify()
        } else {
            match self.respond(&mut conversation, text).await {
                Ok(turn) => turn,
                Err(error) => {
                    warn!(
                        event_name = "conversation.turn.failed",
                        correlation_id = %correlation_id,
                        conversation_id = %conversation.id,
                        business_id = %conversation.business_id,
                        error = %error,
                        "turn processing failed; escalating"
                    );
                    Turn {
                        response: Response::technical_error(),
                        settle: Some(Settle::Transfer(TECHNICAL_ERROR_REASON.to_string())),
                    }
                }
            }
        };

        let Turn { response, settle } = turn;
        let reply_metadata = MessageMetadata {
            confidence: Some(response.confidence),
            intent: response.intent,
            entities: conversation.entities.clone(),
            actions: response.actions.clone(),
        };
        conversation
            .append(Message::new(MessageType::Agent, response.text.clone()).with_metadata(reply_metadata))?;

        match settle {
            Some(Settle::Transfer(reason)) => escalate(&mut conversation, &reason)?,
            Some(Settle::Complete(reason)) => conversation.complete(reason)?,
            None => {}
        }

        for action in &response.actions {
            if let Err(error) = self.dispatcher.dispatch(&conversation, action).await {
                warn!(
                    event_name = "conversation.action.failed",
                    correlation_id = %correlation_id,
                    conversation_id = %conversation.id,
                    action = action.event_type(),
                    error = %error,
                    "conversation action dispatch failed"
                );
            }
        }

        info!(
            event_name = "conversation.turn.processed",
            correlation_id = %correlation_id,
            conversation_id = %conversation.id,
            business_id = %conversation.business_id,
            intent = response.intent.map(|intent| intent.as_str()).unwrap_or("none"),
            escalation_required = response.escalation_required,
            status = conversation.status.as_str(),
            "conversation turn processed"
        );
        let completed = conversation.status == ConversationStatus::Completed;
        drop(conversation);
        if completed {
            self.retire(conversation_id).await;
        }
        Ok(response)
    }

    /// Records a turn that was escalated before reply generation ran. Emergency
    /// turns also dispatch the emergency action.
    pub async fn record_escalation(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        intent: Intent,
        reason: &str,
        reply: &str,
    ) -> Result<Response, ApplicationError> {
        let handle = self.handle(conversation_id).await?;
        let mut conversation = handle.lock().await;

        let mut actions = Vec::new();
        if intent == Intent::Emergency {
            actions.push(ConversationAction::DispatchEmergency);
        }
        actions.push(ConversationAction::EscalateToHuman { reason: reason.to_string() });

        let entities = self.extractor.analyze(text).entities;
        conversation.append(Message::new(MessageType::User, text).with_metadata(MessageMetadata {
            confidence: Some(1.0),
            intent: Some(intent),
            entities: entities.clone(),
            actions: Vec::new(),
        }))?;
        conversation.intent = Some(intent);
        conversation.merge_entities(&entities);
        let reply_metadata = MessageMetadata {
            confidence: Some(1.0),
            intent: Some(intent),
            entities: conversation.entities.clone(),
            actions: actions.clone(),
        };
        conversation.append(Message::new(MessageType::Agent, reply).with_metadata(reply_metadata))?;
        escalate(&mut conversation, reason)?;

        for action in &actions {
            if let Err(error) = self.dispatcher.dispatch(&conversation, action).await {
                warn!(
                    event_name = "conversation.action.failed",
                    conversation_id = %conversation.id,
                    action = action.event_type(),
                    error = %error,
                    "conversation action dispatch failed"
                );
            }
        }

        Ok(Response {
            text: reply.to_string(),
            intent: Some(intent),
            confidence: 1.0,
            actions,
            escalation_required: true,
            transfer_reason: Some(reason.to_string()),
        })
    }

    pub async fn hold(&self, conversation_id: &ConversationId) -> Result<Conversation, ApplicationError> {
        self.update(conversation_id, |conversation| conversation.transition(ConversationStatus::OnHold))
            .await
    }

    pub async fn resume(&self, conversation_id: &ConversationId) -> Result<Conversation, ApplicationError> {
        self.update(conversation_id, |conversation| conversation.transition(ConversationStatus::Active))
            .await
    }

    pub async fn transfer(
        &self,
        conversation_id: &ConversationId,
        reason: &str,
    ) -> Result<Conversation, ApplicationError> {
        self.update(conversation_id, |conversation| {
            conversation.transition(ConversationStatus::Transferred)?;
            conversation.transfer_reason = Some(reason.to_string());
            Ok(())
        })
        .await
    }

    pub async fn end(
        &self,
        conversation_id: &ConversationId,
        reason: &str,
    ) -> Result<Conversation, ApplicationError> {
        let conversation = self.update(conversation_id, |conversation| conversation.complete(reason)).await?;
        self.retire(conversation_id).await;
        info!(
            event_name = "conversation.ended",
            conversation_id = %conversation.id,
            business_id = %conversation.business_id,
            reason = reason,
            "conversation ended"
        );
        Ok(conversation)
    }

    pub async fn get(&self, conversation_id: &ConversationId) -> Result<Conversation, ApplicationError> {
        let handle = self.handle(conversation_id).await?;
        let conversation = handle.lock().await;
        Ok(conversation.clone())
    }

    pub async fn history(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, ApplicationError> {
        let handle = self.handle(conversation_id).await?;
        let conversation = handle.lock().await;
        Ok(conversation.messages.clone())
    }

    /// Conversations for `business_id` that are still active or on hold.
    pub async fn active_conversations(&self, business_id: &BusinessId) -> Vec<Conversation> {
        let handles: Vec<_> = self.conversations.lock().await.values().cloned().collect();
        let mut active = Vec::new();
        for handle in handles {
            let conversation = handle.lock().await;
            if &conversation.business_id == business_id
                && matches!(conversation.status, ConversationStatus::Active | ConversationStatus::OnHold)
            {
                active.push(conversation.clone());
            }
        }
        active.sort_by(|left, right| left.started_at.cmp(&right.started_at));
        active
    }

    /// Queues a completed conversation for eviction once `max_completed` newer ones exist.
    async fn retire(&self, conversation_id: &ConversationId) {
        let evicted: Vec<ConversationId> = {
            let mut completed = self.completed.lock().await;
            completed.push_back(conversation_id.clone());
            let excess = completed.len().saturating_sub(self.settings.max_completed);
            completed.drain(..excess).collect()
        };
        if evicted.is_empty() {
            return;
        }

        let mut conversations = self.conversations.lock().await;
        for id in &evicted {
            conversations.remove(id);
        }
        debug!(
            event_name = "conversation.evicted",
            evicted = evicted.len(),
            retained = conversations.len(),
            "completed conversations evicted"
        );
    }

    async fn handle(&self, conversation_id: &ConversationId) -> Result<Arc<Mutex<Conversation>>, ApplicationError> {
        self.conversations
            .lock()
            .await
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| ApplicationError::not_found("conversation", conversation_id.0.clone()))
    }

    async fn update<F>(&self, conversation_id: &ConversationId, apply: F) -> Result<Conversation, ApplicationError>
    where
        F: FnOnce(&mut Conversation) -> Result<(), DomainError>,
    {
        let handle = self.handle(conversation_id).await?;
        let mut conversation = handle.lock().await;
        apply(&mut conversation)?;
        Ok(conversation.clone())
    }

    fn needs_clarification(&self, text: &str, metadata: &TurnMetadata) -> bool {
        text.trim().is_empty()
            || metadata
                .transcript_confidence
                .is_some_and(|confidence| confidence < self.settings.min_transcript_confidence)
    }

    fn clarify(&self) -> Turn {
        let text = self
            .replies
            .render(ReplyKind::Clarification, &ReplyContext::default())
            .unwrap_or_else(|_| "Could you please repeat that?".to_string());
        Turn {
            response: Response {
                text,
                intent: None,
                confidence: 0.0,
                actions: Vec::new(),
                escalation_required: false,
                transfer_reason: None,
            },
            settle: None,
        }
    }

    async fn respond(&self, conversation: &mut Conversation, text: &str) -> Result<Turn, ApplicationError> {
        let analysis = self.extractor.analyze(text);
        let new_contact = captures_contact(&conversation.entities, &analysis.entities);
        apply_analysis(conversation, &analysis);

        let business = self.contexts.get(&conversation.business_id).await?;
        let context = ReplyContext::from_business(&business, &conversation.entities);
        let reply = self
            .replies
            .render(ReplyKind::for_intent(analysis.intent), &context)
            .map_err(|error| ApplicationError::Configuration(error.to_string()))?;

        let mut actions = Vec::new();
        let mut settle = None;
        let mut transfer_reason = None;

        match analysis.intent {
            Intent::Emergency => {
                actions.push(ConversationAction::DispatchEmergency);
                actions.push(ConversationAction::EscalateToHuman { reason: "emergency".to_string() });
                transfer_reason = Some("emergency".to_string());
            }
            Intent::HumanRequest => {
                actions.push(ConversationAction::EscalateToHuman { reason: "customer_request".to_string() });
                transfer_reason = Some("customer_request".to_string());
            }
            Intent::AppointmentBooking => {
                let date = conversation.entities.get("date").cloned();
                let time = conversation.entities.get("time").cloned();
                if date.is_some() && time.is_some() {
                    actions.push(ConversationAction::BookAppointment { date, time });
                }
            }
            Intent::Goodbye => {
                actions.push(ConversationAction::EndConversation);
                settle = Some(Settle::Complete("goodbye"));
            }
            _ => {}
        }

        if new_contact {
            actions.push(ConversationAction::CaptureLead {
                name: conversation.entities.get("name").cloned(),
                phone: conversation.entities.get("phone").cloned(),
                email: conversation.entities.get("email").cloned(),
            });
        }
        if let Some(reason) = &transfer_reason {
            settle = Some(Settle::Transfer(reason.clone()));
        }

        Ok(Turn {
            response: Response {
                text: reply,
                intent: Some(analysis.intent),
                confidence: analysis.confidence,
                actions,
                escalation_required: transfer_reason.is_some(),
                transfer_reason,
            },
            settle,
        })
    }
}

fn apply_analysis(conversation: &mut Conversation, analysis: &Analysis) {
    conversation.intent = Some(analysis.intent);
    conversation.merge_entities(&analysis.entities);
    conversation.sentiment = analysis.sentiment;
    conversation.urgency = analysis.urgency;

    if let Some(user) = conversation.messages.iter_mut().rev().find(|message| message.message_type == MessageType::User) {
        user.metadata = Some(MessageMetadata {
            confidence: Some(analysis.confidence),
            intent: Some(analysis.intent),
            entities: analysis.entities.clone(),
            actions: Vec::new(),
        });
    }
}

/// True when this turn supplies a phone or email the conversation did not have.
fn captures_contact(known: &Entities, fresh: &Entities) -> bool {
    ["phone", "email"]
        .iter()
        .any(|key| fresh.get(*key).is_some_and(|value| known.get(*key) != Some(value)))
}

/// Transferred is terminal for escalation, so a repeat escalation keeps the first reason.
fn escalate(conversation: &mut Conversation, reason: &str) -> Result<(), DomainError> {
    if matches!(conversation.status, ConversationStatus::Active | ConversationStatus::OnHold) {
        conversation.transition(ConversationStatus::Transferred)?;
    }
    if conversation.transfer_reason.is_none() {
        conversation.transfer_reason = Some(reason.to_string());
    }
    Ok(())
}
