use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use frontdesk_core::domain::business::{
    BusinessId, BusinessProfile, FinancialSnapshot, IndustryProfile, OperationalMetrics,
    RecentActivity,
};
use frontdesk_core::ports::{BusinessDataProvider, ProviderError};

use super::BusinessRecord;

/// Business data held in process. Used by tests and the development server;
/// `set_outage` makes every read fail as `Unavailable`.
#[derive(Default)]
pub struct InMemoryBusinessDataProvider {
    records: RwLock<HashMap<BusinessId, BusinessRecord>>,
    outage: RwLock<Option<String>>,
}

impl InMemoryBusinessDataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(records: impl IntoIterator<Item = BusinessRecord>) -> Self {
        let records =
            records.into_iter().map(|record| (record.business_id.clone(), record)).collect();
        Self { records: RwLock::new(records), outage: RwLock::new(None) }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self { records: RwLock::default(), outage: RwLock::new(Some(message.into())) }
    }

    pub async fn upsert(&self, record: BusinessRecord) {
        self.records.write().await.insert(record.business_id.clone(), record);
    }

    pub async fn set_outage(&self, message: Option<String>) {
        *self.outage.write().await = message;
    }

    async fn record(&self, business_id: &BusinessId) -> Result<BusinessRecord, ProviderError> {
        if let Some(message) = self.outage.read().await.as_ref() {
            return Err(ProviderError::Unavailable(message.clone()));
        }
        self.records
            .read()
            .await
            .get(business_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownBusiness(business_id.0.clone()))
    }
}

#[async_trait]
impl BusinessDataProvider for InMemoryBusinessDataProvider {
    async fn profile(&self, business_id: &BusinessId) -> Result<BusinessProfile, ProviderError> {
        Ok(self.record(business_id).await?.profile)
    }

    async fn recent_activity(
        &self,
        business_id: &BusinessId,
        window_days: u32,
    ) -> Result<RecentActivity, ProviderError> {
        Ok(self.record(business_id).await?.activity_within(window_days, Utc::now()))
    }

    async fn financial_snapshot(
        &self,
        business_id: &BusinessId,
    ) -> Result<FinancialSnapshot, ProviderError> {
        Ok(self.record(business_id).await?.financials)
    }

    async fn operational_metrics(
        &self,
        business_id: &BusinessId,
    ) -> Result<OperationalMetrics, ProviderError> {
        Ok(self.record(business_id).await?.operations)
    }

    async fn industry_profile(
        &self,
        business_id: &BusinessId,
    ) -> Result<IndustryProfile, ProviderError> {
        Ok(self.record(business_id).await?.industry)
    }
}
