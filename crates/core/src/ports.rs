//! Collaborators the orchestration core consumes but does not own: the
//! business data source, the speech codec, and outbound messaging.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::business::{
    BusinessId, BusinessProfile, FinancialSnapshot, IndustryProfile, OperationalMetrics,
    RecentActivity,
};
use crate::errors::ApplicationError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("business not found: {0}")]
    UnknownBusiness(String),
    #[error("business data unavailable: {0}")]
    Unavailable(String),
    #[error("business data could not be decoded: {0}")]
    Decode(String),
}

impl From<ProviderError> for ApplicationError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::UnknownBusiness(id) => ApplicationError::not_found("business", id),
            ProviderError::Unavailable(message) => ApplicationError::Integration(message),
            ProviderError::Decode(message) => ApplicationError::Persistence(message),
        }
    }
}

#[async_trait]
pub trait BusinessDataProvider: Send + Sync {
    async fn profile(&self, business_id: &BusinessId) -> Result<BusinessProfile, ProviderError>;

    async fn recent_activity(
        &self,
        business_id: &BusinessId,
        window_days: u32,
    ) -> Result<RecentActivity, ProviderError>;

    async fn financial_snapshot(
        &self,
        business_id: &BusinessId,
    ) -> Result<FinancialSnapshot, ProviderError>;

    async fn operational_metrics(
        &self,
        business_id: &BusinessId,
    ) -> Result<OperationalMetrics, ProviderError>;

    async fn industry_profile(
        &self,
        business_id: &BusinessId,
    ) -> Result<IndustryProfile, ProviderError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("transcription failed: {0}")]
    Transcription(String),
    #[error("synthesis failed: {0}")]
    Synthesis(String),
    #[error("unsupported audio format `{0}`")]
    UnsupportedFormat(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscribedWord {
    pub word: String,
    pub start_ms: u32,
    pub end_ms: u32,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
    pub words: Vec<TranscribedWord>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoiceOptions {
    pub voice: String,
    pub language: String,
    pub speaking_rate: f32,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self { voice: "alloy".to_string(), language: "en-US".to_string(), speaking_rate: 1.0 }
    }
}

/// Speech-to-text and text-to-speech, treated as a black box.
#[async_trait]
pub trait AudioCodec: Send + Sync {
    async fn transcribe(&self, audio: &[u8], mime_type: &str)
        -> Result<Transcription, CodecError>;

    async fn synthesize(&self, text: &str, voice: &VoiceOptions) -> Result<Vec<u8>, CodecError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MessagingError {
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("messaging transport failed: {0}")]
    Transport(String),
    #[error("messaging channel not configured: {0}")]
    NotConfigured(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsMessage {
    pub to: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub url: String,
    pub payload: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub channel: String,
    pub message_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessagingProvider: Send + Sync {
    async fn send_email(&self, message: &EmailMessage) -> Result<DeliveryReceipt, MessagingError>;

    async fn send_sms(&self, message: &SmsMessage) -> Result<DeliveryReceipt, MessagingError>;

    async fn send_webhook(&self, request: &WebhookRequest)
        -> Result<DeliveryReceipt, MessagingError>;
}
