use std::sync::Arc;

use async_trait::async_trait;
use frontdesk_core::audit::AuditSink;
use frontdesk_core::config::AppConfig;
use frontdesk_core::context::ContextCache;
use frontdesk_core::domain::call::{Call, IncomingCall};
use frontdesk_core::domain::conversation::{Conversation, ConversationAction};
use frontdesk_core::errors::ApplicationError;
use frontdesk_core::ports::{AudioCodec, BusinessDataProvider, MessagingProvider};
use frontdesk_core::workflow::{MessagingActionExecutor, WorkflowEngine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::conversation::{ActionDispatcher, ConversationManager, ConversationSettings};
use crate::escalation::EscalationPolicy;
use crate::phone::PhoneAgent;
use crate::routing::{CallRouter, RouteDecision};

/// Routing decision plus the call session it opened, if any.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingOutcome {
    pub decision: RouteDecision,
    pub call: Option<Call>,
}

/// Turns reply actions into workflow events for the conversation's business.
pub struct WorkflowActionDispatcher {
    engine: Arc<WorkflowEngine>,
}

impl WorkflowActionDispatcher {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl ActionDispatcher for WorkflowActionDispatcher {
    async fn dispatch(
        &self,
        conversation: &Conversation,
        action: &ConversationAction,
    ) -> Result<(), ApplicationError> {
        let context = action_context(conversation, action)?;
        let executions = self.engine.emit_event(&conversation.business_id, action.event_type(), context).await?;
        debug!(
            event_name = "conversation.action.dispatched",
            conversation_id = %conversation.id,
            business_id = %conversation.business_id,
            action = action.event_type(),
            executions = executions.len(),
            "conversation action dispatched"
        );
        Ok(())
    }
}

/// Execution context handed to workflows started by a conversation action.
fn action_context(conversation: &Conversation, action: &ConversationAction) -> Result<Value, ApplicationError> {
    let action = serde_json::to_value(action)
        .map_err(|error| ApplicationError::InvalidInput(format!("action could not be encoded: {error}")))?;
    Ok(json!({
        "conversation_id": conversation.id.0,
        "business_id": conversation.business_id.0,
        "channel": conversation.channel,
        "customer_id": conversation.customer_id.as_ref().map(|id| id.0.clone()),
        "customer_name": conversation.entities.get("name"),
        "intent": conversation.intent.map(|intent| intent.as_str()),
        "urgency": conversation.urgency,
        "transfer_reason": conversation.transfer_reason,
        "entities": conversation.entities,
        "action": action,
    }))
}

/// Owns the shared services of the orchestration pipeline and wires them
/// together once at startup.
pub struct AgentRuntime {
    contexts: Arc<ContextCache>,
    router: Arc<CallRouter>,
    conversations: Arc<ConversationManager>,
    phone: Arc<PhoneAgent>,
    workflows: Arc<WorkflowEngine>,
}

impl AgentRuntime {
    pub fn new(
        config: &AppConfig,
        provider: Arc<dyn BusinessDataProvider>,
        codec: Arc<dyn AudioCodec>,
        messaging: Arc<dyn MessagingProvider>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ApplicationError> {
        let contexts = Arc::new(ContextCache::new(provider, config.context_cache.clone()));
        let workflows = Arc::new(WorkflowEngine::new(
            config.workflow.clone(),
            contexts.clone(),
            Arc::new(MessagingActionExecutor::new(messaging)),
            audit,
        ));
        let conversations = Arc::new(ConversationManager::new(
            contexts.clone(),
            Arc::new(WorkflowActionDispatcher::new(workflows.clone())),
            ConversationSettings {
                min_transcript_confidence: config.phone.min_transcript_confidence,
                max_completed: config.phone.max_history,
            },
        )?);
        let phone = Arc::new(PhoneAgent::new(
            codec,
            conversations.clone(),
            EscalationPolicy::default(),
            config.phone.clone(),
        ));
        let router = Arc::new(CallRouter::new(config.phone.utc_offset_minutes)?);

        Ok(Self { contexts, router, conversations, phone, workflows })
    }

    /// Routes the call and, when the decision hands it to an agent, opens the
    /// call session. Rule outcomes such as voicemail open nothing.
    pub async fn route_call(&self, incoming: IncomingCall) -> Result<RoutingOutcome, ApplicationError> {
        let decision = self.router.route_call(&incoming).await?;
        let call = match (&decision.route, decision.opens_session()) {
            (Some(route), true) => Some(self.phone.handle_incoming_call(incoming, route).await?),
            _ => None,
        };
        Ok(RoutingOutcome { decision, call })
    }

    pub fn contexts(&self) -> &Arc<ContextCache> {
        &self.contexts
    }

    pub fn router(&self) -> &Arc<CallRouter> {
        &self.router
    }

    pub fn conversations(&self) -> &Arc<ConversationManager> {
        &self.conversations
    }

    pub fn phone(&self) -> &Arc<PhoneAgent> {
        &self.phone
    }

    pub fn workflows(&self) -> &Arc<WorkflowEngine> {
        &self.workflows
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use frontdesk_core::audit::InMemoryAuditSink;
    use frontdesk_core::config::AppConfig;
    use frontdesk_core::domain::call::IncomingCall;
    use frontdesk_core::domain::routing::{AgentProfile, Route, RoutingRule, RuleAction, RuleConditions, RuleId};
    use frontdesk_core::domain::workflow::{
        ActionType, ConditionOperator, ExecutionStatus, TriggerCondition, WorkflowAction, WorkflowDefinition,
        WorkflowId, WorkflowTrigger,
    };
    use serde_json::json;

    use super::AgentRuntime;
    use crate::codec::TextPassthroughCodec;
    use crate::testing::{demo_provider, reyes_plumbing, RecordingMessenger};

    fn runtime(messenger: Arc<RecordingMessenger>) -> AgentRuntime {
        AgentRuntime::new(
            &AppConfig::default(),
            demo_provider(),
            Arc::new(TextPassthroughCodec),
            messenger,
            Arc::new(InMemoryAuditSink::default()),
        )
        .expect("runtime")
    }

    fn main_route() -> Route {
        Route::new(
            "main",
            "Main line",
            "*",
            AgentProfile {
                agent_id: "front".to_string(),
                display_name: "Riley".to_string(),
                greeting: None,
                voice: None,
            },
        )
        .scoped_to(reyes_plumbing())
        .as_default()
    }

    #[tokio::test]
    async fn booked_appointment_starts_the_confirmation_workflow() {
        let messenger = Arc::new(RecordingMessenger::default());
        let runtime = runtime(messenger.clone());
        runtime.router().register_route(main_route()).await.expect("route");
        runtime
            .workflows()
            .register_workflow(WorkflowDefinition {
                id: WorkflowId("confirm-booking".to_string()),
                business_id: reyes_plumbing(),
                name: "Confirm booking".to_string(),
                description: String::new(),
                trigger: WorkflowTrigger::EventBased {
                    event_type: "appointment.requested".to_string(),
                    conditions: vec![TriggerCondition {
                        field: "entities.time".to_string(),
                        operator: ConditionOperator::Exists,
                        value: serde_json::Value::Null,
                    }],
                },
                actions: vec![WorkflowAction {
                    id: "text-customer".to_string(),
                    action_type: ActionType::SendSms,
                    parameters: json!({
                        "to": "+15551234567",
                        "body": "{{business.profile.name}}: you're booked {{entities.date}} at {{entities.time}}",
                    }),
                    retry_policy: None,
                }],
                active: true,
                version: 0,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            })
            .await
            .expect("workflow");

        let outcome = runtime
            .route_call(IncomingCall::new("+15551234567", "+15550000000"))
            .await
            .expect("routed");
        let call = outcome.call.expect("session opened");
        runtime.phone().answer(&call.id).await.expect("answered");

        let turn = runtime
            .phone()
            .process_audio_input(&call.id, b"Can you book me tomorrow at 2pm?", "text/plain")
            .await
            .expect("turn");
        assert!(!turn.should_transfer);

        let executions = runtime.workflows().executions(&reyes_plumbing()).await;
        assert_eq!(executions.len(), 1);
        runtime.workflows().tick().await;
        runtime.workflows().wait_for_idle().await;

        let finished = runtime.workflows().get_execution_status(&executions[0].id).await.expect("execution");
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert_eq!(
            messenger.sms_bodies().await,
            vec!["Reyes Plumbing: you're booked tomorrow at 2pm".to_string()]
        );
    }

    #[tokio::test]
    async fn voicemail_rule_opens_no_session() {
        let runtime = runtime(Arc::new(RecordingMessenger::default()));
        runtime.router().register_route(main_route()).await.expect("route");
        runtime
            .router()
            .add_rule(RoutingRule {
                id: RuleId("spam".to_string()),
                name: "Known spam".to_string(),
                priority: 100,
                conditions: RuleConditions {
                    caller_pattern: Some(r"^\+1900".to_string()),
                    ..RuleConditions::default()
                },
                action: RuleAction::TakeVoicemail { mailbox: "screening".to_string() },
                active: true,
            })
            .await
            .expect("rule");

        let outcome = runtime
            .route_call(IncomingCall::new("+19005550000", "+15550000000"))
            .await
            .expect("routed");
        assert!(outcome.call.is_none());
        assert!(runtime.phone().active_calls().await.is_empty());
    }
}
