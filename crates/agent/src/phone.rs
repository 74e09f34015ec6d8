use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use frontdesk_core::config::PhoneConfig;
use frontdesk_core::domain::call::{Call, CallId, CallMetrics, CallStatus, IncomingCall};
use frontdesk_core::domain::conversation::{Channel, ConversationStatus, Intent, MessageType};
use frontdesk_core::domain::routing::{AgentProfile, Route};
use frontdesk_core::errors::ApplicationError;
use frontdesk_core::ports::{AudioCodec, CodecError, Transcription, VoiceOptions};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::conversation::{ConversationManager, TurnMetadata};
use crate::escalation::{EscalationDecision, EscalationPolicy};

pub const UNHEARD_REPLY: &str = "I'm sorry, I didn't catch that. Could you please repeat?";
pub const EMERGENCY_REPLY: &str =
    "I understand this is an emergency. I'm connecting you with our on-call team right now. Please stay on the line.";
pub const TRANSFER_REPLY: &str = "Of course. Let me transfer you to someone who can help. One moment please.";
pub const GOODBYE_END_REASON: &str = "caller_goodbye";
const FALLBACK_WELCOME: &str = "Thank you for calling. How can I help you today?";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnsweredCall {
    pub call: Call,
    pub greeting: String,
    pub audio: Vec<u8>,
}

/// Result of one caller utterance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioTurn {
    pub transcript: String,
    pub reply: String,
    pub audio_reply: Vec<u8>,
    pub intent: Option<Intent>,
    pub should_transfer: bool,
    pub transfer_reason: Option<String>,
    /// The caller said goodbye and the call has been ended.
    pub call_ended: bool,
}

struct CallSession {
    call: Call,
    agent: AgentProfile,
}

/// Metrics cover every call ever recorded; history keeps the newest `max_history`.
struct CallLedger {
    history: VecDeque<Call>,
    max_history: usize,
    metrics: CallMetrics,
}

impl CallLedger {
    fn new(max_history: usize) -> Self {
        Self { history: VecDeque::new(), max_history, metrics: CallMetrics::default() }
    }

    /// Folds one finished call into the aggregates.
    fn record(&mut self, call: Call) {
        let previous_total = self.metrics.total_calls as f64;
        let duration = call.duration_secs.unwrap_or(0) as f64;

        self.metrics.total_calls += 1;
        if call.was_answered() {
            self.metrics.answered_calls += 1;
        }
        if call.was_escalated() {
            self.metrics.escalated_calls += 1;
        }
        let total = self.metrics.total_calls as f64;
        self.metrics.answer_rate = self.metrics.answered_calls as f64 / total;
        self.metrics.escalation_rate = self.metrics.escalated_calls as f64 / total;
        self.metrics.average_duration_secs =
            (self.metrics.average_duration_secs * previous_total + duration) / total;
        self.history.push_back(call);
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }
}

/// Owns every phone call from ring to hang-up and bridges audio to the
/// conversation layer through the codec.
pub struct PhoneAgent {
    codec: Arc<dyn AudioCodec>,
    conversations: Arc<ConversationManager>,
    escalation: EscalationPolicy,
    config: PhoneConfig,
    sessions: Mutex<HashMap<CallId, Arc<Mutex<CallSession>>>>,
    ledger: Mutex<CallLedger>,
}

impl PhoneAgent {
    pub fn new(
        codec: Arc<dyn AudioCodec>,
        conversations: Arc<ConversationManager>,
        escalation: EscalationPolicy,
        config: PhoneConfig,
    ) -> Self {
        let ledger = CallLedger::new(config.max_history);
        Self {
            codec,
            conversations,
            escalation,
            config,
            sessions: Mutex::new(HashMap::new()),
            ledger: Mutex::new(ledger),
        }
    }

    pub async fn handle_incoming_call(
        &self,
        incoming: IncomingCall,
        route: &Route,
    ) -> Result<Call, ApplicationError> {
        let business_id = incoming
            .business_id
            .clone()
            .or_else(|| route.business_id.clone())
            .ok_or_else(|| {
                ApplicationError::InvalidInput(format!(
                    "call to {} has no business and route {} is not scoped to one",
                    incoming.to_number, route.id
                ))
            })?;

        let call = Call {
            id: incoming.call_id.clone().unwrap_or_else(CallId::generate),
            business_id,
            route_id: Some(route.id.clone()),
            conversation_id: None,
            from_number: incoming.from_number,
            to_number: incoming.to_number,
            caller_name: incoming.caller_name,
            status: CallStatus::Incoming,
            started_at: incoming.received_at,
            answered_at: None,
            ended_at: None,
            duration_secs: None,
            transfer_reason: None,
            end_reason: None,
            summary: None,
        };

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&call.id) {
            return Err(ApplicationError::InvalidInput(format!("call {} is already in progress", call.id)));
        }
        sessions.insert(
            call.id.clone(),
            Arc::new(Mutex::new(CallSession { call: call.clone(), agent: route.agent.clone() })),
        );

        info!(
            event_name = "phone.call.incoming",
            correlation_id = %call.id,
            call_id = %call.id,
            business_id = %call.business_id,
            route_id = %route.id,
            from_number = %call.from_number,
            "incoming call registered"
        );
        Ok(call)
    }

    pub async fn answer(&self, call_id: &CallId) -> Result<AnsweredCall, ApplicationError> {
        let handle = self.session(call_id).await?;
        let mut session = handle.lock().await;
        session.call.transition(CallStatus::Connected)?;
        session.call.answered_at = Some(Utc::now());

        let conversation = self
            .conversations
            .start_conversation(session.call.business_id.clone(), None, Channel::Phone)
            .await;
        session.call.conversation_id = Some(conversation.id.clone());

        let greeting = match self.conversations.welcome(&conversation.id, Some(&session.agent)).await {
            Ok(greeting) => greeting,
            Err(error) => {
                warn!(
                    event_name = "phone.call.welcome_failed",
                    correlation_id = %call_id,
                    call_id = %call_id,
                    error = %error,
                    "welcome rendering failed; using generic greeting"
                );
                FALLBACK_WELCOME.to_string()
            }
        };
        let audio = self.speak(call_id, &greeting, session.agent.voice.as_deref()).await;

        info!(
            event_name = "phone.call.answered",
            correlation_id = %call_id,
            call_id = %call_id,
            business_id = %session.call.business_id,
            conversation_id = %conversation.id,
            "call answered"
        );
        Ok(AnsweredCall { call: session.call.clone(), greeting, audio })
    }

    /// Emergency keywords are checked before transfer keywords, and both before
    /// the conversation sees the turn.
    pub async fn process_audio_input(
        &self,
        call_id: &CallId,
        audio: &[u8],
        mime_type: &str,
    ) -> Result<AudioTurn, ApplicationError> {
        let handle = self.session(call_id).await?;
        let mut session = handle.lock().await;
        if session.call.status != CallStatus::Connected {
            return Err(ApplicationError::InvalidInput(format!(
                "call {call_id} is {} and cannot take audio",
                session.call.status.as_str()
            )));
        }
        let conversation_id = session.call.conversation_id.clone().ok_or_else(|| {
            ApplicationError::InvalidInput(format!("call {call_id} has no conversation"))
        })?;
        let voice = session.agent.voice.clone();

        let Some(transcription) = self.transcribe(call_id, audio, mime_type).await else {
            let audio_reply = self.speak(call_id, UNHEARD_REPLY, voice.as_deref()).await;
            return Ok(AudioTurn {
                transcript: String::new(),
                reply: UNHEARD_REPLY.to_string(),
                audio_reply,
                intent: None,
                should_transfer: false,
                transfer_reason: None,
                call_ended: false,
            });
        };
        let transcript = transcription.text;

        let decision = self.escalation.evaluate(&transcript);
        let response = match &decision {
            EscalationDecision::Emergency { keyword } | EscalationDecision::Transfer { keyword } => {
                let (intent, reply) = if matches!(decision, EscalationDecision::Emergency { .. }) {
                    (Intent::Emergency, EMERGENCY_REPLY)
                } else {
                    (Intent::HumanRequest, TRANSFER_REPLY)
                };
                let reason = decision.transfer_reason().unwrap_or("customer_request");
                info!(
                    event_name = "phone.call.escalation_detected",
                    correlation_id = %call_id,
                    call_id = %call_id,
                    keyword = %keyword,
                    reason = reason,
                    "escalation keyword detected"
                );
                self.conversations.record_escalation(&conversation_id, &transcript, intent, reason, reply).await?
            }
            EscalationDecision::Continue => {
                let metadata = TurnMetadata {
                    transcript_confidence: Some(transcription.confidence),
                    correlation_id: Some(call_id.0.clone()),
                };
                self.conversations.process_message(&conversation_id, &transcript, metadata).await?
            }
        };

        if response.escalation_required {
            session.call.transition(CallStatus::Transferred)?;
            session.call.transfer_reason = response.transfer_reason.clone();
            info!(
                event_name = "phone.call.transferred",
                correlation_id = %call_id,
                call_id = %call_id,
                business_id = %session.call.business_id,
                reason = session.call.transfer_reason.as_deref().unwrap_or("unknown"),
                "call transferred"
            );
        }

        let audio_reply = self.speak(call_id, &response.text, voice.as_deref()).await;

        // A goodbye completes the conversation; the call goes with it.
        let call_ended = !response.escalation_required
            && self
                .conversations
                .get(&conversation_id)
                .await
                .is_ok_and(|conversation| conversation.status == ConversationStatus::Completed);
        if call_ended {
            self.sessions.lock().await.remove(call_id);
            self.finish(&mut session.call, GOODBYE_END_REASON).await?;
        }

        Ok(AudioTurn {
            transcript,
            reply: response.text,
            audio_reply,
            intent: response.intent,
            should_transfer: response.escalation_required,
            transfer_reason: response.transfer_reason,
            call_ended,
        })
    }

    /// Transferred and failed calls keep their status; anything else completes.
    pub async fn end_call(&self, call_id: &CallId, reason: &str) -> Result<Call, ApplicationError> {
        let handle = self
            .sessions
            .lock()
            .await
            .remove(call_id)
            .ok_or_else(|| ApplicationError::not_found("call", call_id.0.clone()))?;
        let mut session = handle.lock().await;
        self.finish(&mut session.call, reason).await
    }

    /// Stamps the end of `call`, closes its conversation and records it once.
    async fn finish(&self, call: &mut Call, reason: &str) -> Result<Call, ApplicationError> {
        if call.ended_at.is_some() {
            return Ok(call.clone());
        }
        let call_id = call.id.clone();

        if !call.status.is_terminal() {
            call.transition(CallStatus::Completed)?;
        }
        let ended_at = Utc::now();
        call.ended_at = Some(ended_at);
        call.duration_secs = Some((ended_at - call.started_at).num_seconds().max(0));
        call.end_reason = Some(reason.to_string());
        call.summary = Some(self.summarize(call).await);

        if let Some(conversation_id) = &call.conversation_id {
            match self.conversations.get(conversation_id).await {
                Ok(conversation) if conversation.status != ConversationStatus::Completed => {
                    if let Err(error) = self.conversations.end(conversation_id, reason).await {
                        warn!(
                            event_name = "phone.call.conversation_end_failed",
                            correlation_id = %call_id,
                            call_id = %call_id,
                            error = %error,
                            "conversation could not be closed"
                        );
                    }
                }
                _ => {}
            }
        }

        let finished = call.clone();
        self.ledger.lock().await.record(finished.clone());

        info!(
            event_name = "phone.call.ended",
            correlation_id = %call_id,
            call_id = %call_id,
            business_id = %finished.business_id,
            status = finished.status.as_str(),
            duration_secs = finished.duration_secs.unwrap_or(0),
            reason = reason,
            "call ended"
        );
        Ok(finished)
    }

    pub async fn hold_call(&self, call_id: &CallId) -> Result<Call, ApplicationError> {
        let handle = self.session(call_id).await?;
        let mut session = handle.lock().await;
        session.call.transition(CallStatus::OnHold)?;
        if let Some(conversation_id) = &session.call.conversation_id {
            self.conversations.hold(conversation_id).await?;
        }
        Ok(session.call.clone())
    }

    pub async fn resume_call(&self, call_id: &CallId) -> Result<Call, ApplicationError> {
        let handle = self.session(call_id).await?;
        let mut session = handle.lock().await;
        session.call.transition(CallStatus::Connected)?;
        if let Some(conversation_id) = &session.call.conversation_id {
            self.conversations.resume(conversation_id).await?;
        }
        Ok(session.call.clone())
    }

    pub async fn active_calls(&self) -> Vec<Call> {
        let handles: Vec<_> = self.sessions.lock().await.values().cloned().collect();
        let mut calls = Vec::with_capacity(handles.len());
        for handle in handles {
            calls.push(handle.lock().await.call.clone());
        }
        calls.sort_by(|left, right| left.started_at.cmp(&right.started_at));
        calls
    }

    pub async fn call_history(&self) -> Vec<Call> {
        self.ledger.lock().await.history.iter().cloned().collect()
    }

    /// Looks in active sessions first, then in history.
    pub async fn call(&self, call_id: &CallId) -> Result<Call, ApplicationError> {
        if let Ok(handle) = self.session(call_id).await {
            return Ok(handle.lock().await.call.clone());
        }
        self.ledger
            .lock()
            .await
            .history
            .iter()
            .find(|call| &call.id == call_id)
            .cloned()
            .ok_or_else(|| ApplicationError::not_found("call", call_id.0.clone()))
    }

    pub async fn metrics(&self) -> CallMetrics {
        self.ledger.lock().await.metrics.clone()
    }

    async fn session(&self, call_id: &CallId) -> Result<Arc<Mutex<CallSession>>, ApplicationError> {
        self.sessions
            .lock()
            .await
            .get(call_id)
            .cloned()
            .ok_or_else(|| ApplicationError::not_found("call", call_id.0.clone()))
    }

    async fn summarize(&self, call: &Call) -> String {
        let mut summary = format!(
            "Call from {} lasted {}s.",
            call.from_number,
            call.duration_secs.unwrap_or(0)
        );
        if !call.was_answered() {
            summary.push_str(" Missed before it was answered.");
        }

        if let Some(conversation_id) = &call.conversation_id {
            if let Ok(conversation) = self.conversations.get(conversation_id).await {
                let turns = conversation
                    .messages
                    .iter()
                    .filter(|message| message.message_type == MessageType::User)
                    .count();
                let intents: Vec<&str> = conversation.seen_intents().iter().map(Intent::as_str).collect();
                summary.push_str(&format!(" Caller turns: {turns}."));
                if !intents.is_empty() {
                    summary.push_str(&format!(" Intents: {}.", intents.join(", ")));
                }
            }
        }
        if let Some(reason) = &call.transfer_reason {
            summary.push_str(&format!(" Transferred: {reason}."));
        }
        summary
    }

    async fn transcribe(&self, call_id: &CallId, audio: &[u8], mime_type: &str) -> Option<Transcription> {
        let attempts = self.config.codec_max_retries + 1;
        for attempt in 1..=attempts {
            match self.codec.transcribe(audio, mime_type).await {
                Ok(transcription) => return Some(transcription),
                Err(error) => self.log_codec_failure(call_id, "transcribe", attempt, attempts, &error),
            }
        }
        None
    }

    /// Empty audio when synthesis keeps failing; the text reply still goes out.
    async fn speak(&self, call_id: &CallId, text: &str, voice: Option<&str>) -> Vec<u8> {
        let options = VoiceOptions {
            voice: voice.unwrap_or(self.config.voice.as_str()).to_string(),
            language: self.config.language.clone(),
            ..VoiceOptions::default()
        };
        let attempts = self.config.codec_max_retries + 1;
        for attempt in 1..=attempts {
            match self.codec.synthesize(text, &options).await {
                Ok(audio) => return audio,
                Err(error) => self.log_codec_failure(call_id, "synthesize", attempt, attempts, &error),
            }
        }
        Vec::new()
    }

    fn log_codec_failure(&self, call_id: &CallId, operation: &str, attempt: u32, attempts: u32, error: &CodecError) {
        warn!(
            event_name = "phone.codec.failed",
            correlation_id = %call_id,
            call_id = %call_id,
            operation = operation,
            attempt = attempt,
            attempts = attempts,
            error = %error,
            "audio codec call failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use frontdesk_core::config::PhoneConfig;
    use frontdesk_core::domain::call::{CallStatus, IncomingCall};
    use frontdesk_core::domain::conversation::ConversationStatus;
    use frontdesk_core::domain::routing::{AgentProfile, Route};
    use frontdesk_core::errors::ApplicationError;
    use frontdesk_core::ports::{AudioCodec, CodecError, Transcription, VoiceOptions};

    use super::{PhoneAgent, GOODBYE_END_REASON, UNHEARD_REPLY};
    use crate::codec::TextPassthroughCodec;
    use crate::conversation::{ConversationManager, ConversationSettings, LoggingDispatcher};
    use crate::escalation::EscalationPolicy;
    use crate::testing::{context_cache, reyes_plumbing};

    fn route() -> Route {
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
    }

    fn phone(codec: Arc<dyn AudioCodec>) -> (PhoneAgent, Arc<ConversationManager>) {
        phone_with(codec, PhoneConfig::default())
    }

    fn phone_with(codec: Arc<dyn AudioCodec>, config: PhoneConfig) -> (PhoneAgent, Arc<ConversationManager>) {
        let conversations = Arc::new(
            ConversationManager::new(context_cache(), Arc::new(LoggingDispatcher), ConversationSettings::default())
                .expect("manager"),
        );
        let agent = PhoneAgent::new(codec, conversations.clone(), EscalationPolicy::default(), config);
        (agent, conversations)
    }

    /// Fails transcription a fixed number of times, then passes text through.
    struct FlakyCodec {
        transcribe_failures: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl AudioCodec for FlakyCodec {
        async fn transcribe(&self, audio: &[u8], mime_type: &str) -> Result<Transcription, CodecError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.transcribe_failures {
                return Err(CodecError::Transcription("line noise".to_string()));
            }
            TextPassthroughCodec.transcribe(audio, mime_type).await
        }

        async fn synthesize(&self, _text: &str, _voice: &VoiceOptions) -> Result<Vec<u8>, CodecError> {
            Err(CodecError::Synthesis("tts offline".to_string()))
        }
    }

    #[tokio::test]
    async fn emergency_utterance_transfers_without_a_normal_reply() {
        let (phone, conversations) = phone(Arc::new(TextPassthroughCodec));
        let call = phone
            .handle_incoming_call(IncomingCall::new("+15551234567", "+15550000000"), &route())
            .await
            .expect("incoming");
        let answered = phone.answer(&call.id).await.expect("answered");
        assert!(answered.greeting.contains("Reyes Plumbing"));
        assert_eq!(answered.audio, answered.greeting.as_bytes());

        let turn = phone
            .process_audio_input(&call.id, b"this is an emergency, my pipe broke", "text/plain")
            .await
            .expect("turn");

        assert!(turn.should_transfer);
        assert_eq!(turn.transfer_reason.as_deref(), Some("emergency"));
        assert_eq!(turn.reply, super::EMERGENCY_REPLY);

        let live = phone.call(&call.id).await.expect("call");
        assert_eq!(live.status, CallStatus::Transferred);
        let conversation_id = live.conversation_id.expect("conversation");
        let conversation = conversations.get(&conversation_id).await.expect("conversation");
        assert_eq!(conversation.status, ConversationStatus::Transferred);
        assert_eq!(conversation.transfer_reason.as_deref(), Some("emergency"));
    }

    #[tokio::test]
    async fn normal_turn_then_hang_up_updates_metrics() {
        let (phone, conversations) = phone(Arc::new(TextPassthroughCodec));
        let call = phone
            .handle_incoming_call(IncomingCall::new("+15551234567", "+15550000000"), &route())
            .await
            .expect("incoming");
        phone.answer(&call.id).await.expect("answered");

        let turn = phone
            .process_audio_input(&call.id, b"how much does a drain cleaning cost?", "text/plain")
            .await
            .expect("turn");
        assert!(!turn.should_transfer);
        assert!(turn.reply.contains("Drain cleaning from $"));

        let ended = phone.end_call(&call.id, "caller hung up").await.expect("ended");
        assert_eq!(ended.status, CallStatus::Completed);
        let summary = ended.summary.expect("summary");
        assert!(summary.contains("Caller turns: 1."), "{summary}");
        assert!(summary.contains("pricing_inquiry"), "{summary}");

        let conversation_id = ended.conversation_id.expect("conversation");
        assert_eq!(
            conversations.get(&conversation_id).await.expect("conversation").status,
            ConversationStatus::Completed
        );
        assert!(phone.active_calls().await.is_empty());
        assert_eq!(phone.call_history().await.len(), 1);

        let metrics = phone.metrics().await;
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.answer_rate, 1.0);
        assert_eq!(metrics.escalation_rate, 0.0);
    }

    #[tokio::test]
    async fn goodbye_turn_ends_the_call() {
        let (phone, conversations) = phone(Arc::new(TextPassthroughCodec));
        let call = phone
            .handle_incoming_call(IncomingCall::new("+15551234567", "+15550000000"), &route())
            .await
            .expect("incoming");
        phone.answer(&call.id).await.expect("answered");

        let turn = phone.process_audio_input(&call.id, b"thanks, goodbye", "text/plain").await.expect("turn");
        assert!(turn.call_ended);
        assert!(!turn.should_transfer);
        assert!(!turn.reply.is_empty());

        assert!(phone.active_calls().await.is_empty());
        let ended = phone.call(&call.id).await.expect("call in history");
        assert_eq!(ended.status, CallStatus::Completed);
        assert_eq!(ended.end_reason.as_deref(), Some(GOODBYE_END_REASON));
        let conversation_id = ended.conversation_id.expect("conversation");
        assert_eq!(
            conversations.get(&conversation_id).await.expect("conversation").status,
            ConversationStatus::Completed
        );
        assert_eq!(phone.metrics().await.total_calls, 1);

        assert!(matches!(
            phone.process_audio_input(&call.id, b"one more thing", "text/plain").await,
            Err(ApplicationError::NotFound { .. })
        ));
        assert!(matches!(
            phone.end_call(&call.id, "caller hung up").await,
            Err(ApplicationError::NotFound { .. })
        ));
        assert_eq!(phone.call_history().await.len(), 1);
    }

    #[tokio::test]
    async fn call_history_keeps_only_the_newest_calls() {
        let config = PhoneConfig { max_history: 2, ..PhoneConfig::default() };
        let (phone, _) = phone_with(Arc::new(TextPassthroughCodec), config);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let call = phone
                .handle_incoming_call(IncomingCall::new("+15551234567", "+15550000000"), &route())
                .await
                .expect("incoming");
            phone.end_call(&call.id, "caller abandoned").await.expect("ended");
            ids.push(call.id);
        }

        let history: Vec<_> = phone.call_history().await.into_iter().map(|call| call.id).collect();
        assert_eq!(history, ids[1..].to_vec());
        assert!(matches!(phone.call(&ids[0]).await, Err(ApplicationError::NotFound { .. })));
        assert_eq!(phone.metrics().await.total_calls, 3);
    }

    #[tokio::test]
    async fn missed_call_counts_against_answer_rate() {
        let (phone, _) = phone(Arc::new(TextPassthroughCodec));
        for _ in 0..2 {
            let call = phone
                .handle_incoming_call(IncomingCall::new("+15551234567", "+15550000000"), &route())
                .await
                .expect("incoming");
            phone.answer(&call.id).await.expect("answered");
            phone.end_call(&call.id, "done").await.expect("ended");
        }
        let missed = phone
            .handle_incoming_call(IncomingCall::new("+15557654321", "+15550000000"), &route())
            .await
            .expect("incoming");
        let ended = phone.end_call(&missed.id, "caller abandoned").await.expect("ended");
        assert_eq!(ended.status, CallStatus::Completed);
        assert!(ended.summary.as_deref().is_some_and(|summary| summary.contains("Missed")));

        let metrics = phone.metrics().await;
        assert_eq!(metrics.total_calls, 3);
        assert_eq!(metrics.answered_calls, 2);
        assert!((metrics.answer_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn codec_failures_degrade_to_fallback_phrase() {
        let codec = Arc::new(FlakyCodec { transcribe_failures: 3, attempts: AtomicU32::new(0) });
        let (phone, _) = phone(codec.clone());
        let call = phone
            .handle_incoming_call(IncomingCall::new("+15551234567", "+15550000000"), &route())
            .await
            .expect("incoming");
        let answered = phone.answer(&call.id).await.expect("answered");
        assert!(answered.audio.is_empty());

        let turn = phone.process_audio_input(&call.id, b"hello", "text/plain").await.expect("turn");
        assert_eq!(turn.reply, UNHEARD_REPLY);
        assert!(turn.audio_reply.is_empty());
        assert_eq!(codec.attempts.load(Ordering::SeqCst), 3);

        let retried = phone.process_audio_input(&call.id, b"hello", "text/plain").await.expect("turn");
        assert_eq!(retried.transcript, "hello");
        assert_ne!(retried.reply, UNHEARD_REPLY);
    }

    #[tokio::test]
    async fn hold_blocks_audio_until_resumed() {
        let (phone, _) = phone(Arc::new(TextPassthroughCodec));
        let call = phone
            .handle_incoming_call(IncomingCall::new("+15551234567", "+15550000000"), &route())
            .await
            .expect("incoming");
        assert!(matches!(
            phone.process_audio_input(&call.id, b"hello", "text/plain").await,
            Err(ApplicationError::InvalidInput(_))
        ));
        phone.answer(&call.id).await.expect("answered");

        assert_eq!(phone.hold_call(&call.id).await.expect("held").status, CallStatus::OnHold);
        assert!(phone.process_audio_input(&call.id, b"hello", "text/plain").await.is_err());
        assert_eq!(phone.resume_call(&call.id).await.expect("resumed").status, CallStatus::Connected);
        assert!(phone.process_audio_input(&call.id, b"hello", "text/plain").await.is_ok());
    }
}
