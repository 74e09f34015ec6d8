//! Agent runtime - the conversational front desk.
//!
//! This crate turns customer input into replies and follow-up work:
//! - `extraction` classifies intent, pulls entities and scores sentiment
//! - `conversation` keeps one state machine per conversation and renders replies
//! - `routing` picks the route that should answer an incoming call
//! - `phone` runs call sessions over an `AudioCodec`
//! - `runtime` wires everything to the context cache and workflow engine
//!
//! # Key Types
//!
//! - `AgentRuntime` - owns the shared services (see `runtime` module)
//! - `ConversationManager` - per-conversation turn handling
//! - `CallRouter` - route and rule registry
//! - `PhoneAgent` - call lifecycle and metrics
//!
//! Business facts in replies always come from the `BusinessContext` snapshot;
//! the agent never invents prices, hours or availability.

pub mod codec;
pub mod conversation;
pub mod escalation;
pub mod extraction;
pub mod phone;
pub mod replies;
pub mod routing;
pub mod runtime;

pub use codec::TextPassthroughCodec;
pub use conversation::{
    ActionDispatcher, ConversationManager, ConversationSettings, LoggingDispatcher, Response,
    TurnMetadata,
};
pub use escalation::{EscalationDecision, EscalationPolicy};
pub use extraction::{Analysis, Extractor, IntentClassifier, PatternIntentClassifier};
pub use phone::{AnsweredCall, AudioTurn, PhoneAgent};
pub use replies::{ReplyContext, ReplyKind, ReplyRenderer};
pub use routing::{CallRouter, RouteDecision};
pub use runtime::{AgentRuntime, RoutingOutcome, WorkflowActionDispatcher};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use frontdesk_core::config::ContextCacheConfig;
    use frontdesk_core::context::ContextCache;
    use frontdesk_core::domain::business::BusinessId;
    use frontdesk_core::ports::{
        BusinessDataProvider, DeliveryReceipt, EmailMessage, MessagingError, MessagingProvider,
        SmsMessage, WebhookRequest,
    };
    use frontdesk_db::{demo_business, InMemoryBusinessDataProvider, DEMO_BUSINESS_ID};
    use tokio::sync::Mutex;

    pub fn reyes_plumbing() -> BusinessId {
        BusinessId(DEMO_BUSINESS_ID.to_string())
    }

    pub fn demo_provider() -> Arc<dyn BusinessDataProvider> {
        Arc::new(InMemoryBusinessDataProvider::seeded([demo_business()]))
    }

    pub fn context_cache() -> Arc<ContextCache> {
        Arc::new(ContextCache::new(demo_provider(), ContextCacheConfig::default()))
    }

    pub fn failing_context_cache() -> Arc<ContextCache> {
        let provider = Arc::new(InMemoryBusinessDataProvider::unavailable("crm offline"));
        Arc::new(ContextCache::new(provider, ContextCacheConfig::default()))
    }

    #[derive(Default)]
    pub struct RecordingMessenger {
        sms: Mutex<Vec<SmsMessage>>,
    }

    impl RecordingMessenger {
        pub async fn sms_bodies(&self) -> Vec<String> {
            self.sms.lock().await.iter().map(|message| message.body.clone()).collect()
        }
    }

    fn receipt(channel: &str) -> DeliveryReceipt {
        DeliveryReceipt {
            channel: channel.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            accepted_at: Utc::now(),
        }
    }

    #[async_trait]
    impl MessagingProvider for RecordingMessenger {
        async fn send_email(&self, _message: &EmailMessage) -> Result<DeliveryReceipt, MessagingError> {
            Ok(receipt("email"))
        }

        async fn send_sms(&self, message: &SmsMessage) -> Result<DeliveryReceipt, MessagingError> {
            self.sms.lock().await.push(message.clone());
            Ok(receipt("sms"))
        }

        async fn send_webhook(
            &self,
            _request: &WebhookRequest,
        ) -> Result<DeliveryReceipt, MessagingError> {
            Ok(receipt("webhook"))
        }
    }
}
