use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use frontdesk_core::domain::business::{
    BusinessId, BusinessProfile, FinancialSnapshot, IndustryProfile, OperationalMetrics,
    RecentActivity,
};
use frontdesk_core::ports::ProviderError;

pub mod business;
pub mod memory;

pub use business::SqlBusinessDataProvider;
pub use memory::InMemoryBusinessDataProvider;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for ProviderError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => ProviderError::Unavailable(error.to_string()),
            RepositoryError::Decode(message) => ProviderError::Decode(message),
        }
    }
}

/// Everything the providers know about one business. The activity log is
/// stored unfiltered; window filtering happens on read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusinessRecord {
    pub business_id: BusinessId,
    pub profile: BusinessProfile,
    pub recent_activity: RecentActivity,
    pub financials: FinancialSnapshot,
    pub operations: OperationalMetrics,
    pub industry: IndustryProfile,
}

impl BusinessRecord {
    /// Activity that happened within `window_days` before `now`. Jobs are kept
    /// while their scheduled date falls inside the window or lies ahead.
    pub fn activity_within(&self, window_days: u32, now: DateTime<Utc>) -> RecentActivity {
        let cutoff = now - Duration::days(i64::from(window_days));
        let activity = &self.recent_activity;
        RecentActivity {
            window_days,
            jobs: activity
                .jobs
                .iter()
                .filter(|job| job.scheduled_for.map_or(true, |at| at >= cutoff))
                .cloned()
                .collect(),
            customers: activity
                .customers
                .iter()
                .filter(|customer| customer.created_at >= cutoff)
                .cloned()
                .collect(),
            communications: activity
                .communications
                .iter()
                .filter(|entry| entry.occurred_at >= cutoff)
                .cloned()
                .collect(),
            financial_events: activity
                .financial_events
                .iter()
                .filter(|event| event.occurred_at >= cutoff)
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::fixtures::demo_business;

    #[test]
    fn activity_window_drops_older_entries() {
        let record = demo_business();
        let now = Utc::now();

        let month = record.activity_within(30, now);
        let week = record.activity_within(7, now);

        assert_eq!(month.window_days, 30);
        assert!(week.communications.len() < month.communications.len());
        assert!(week.financial_events.len() < month.financial_events.len());
        assert!(week
            .communications
            .iter()
            .all(|entry| entry.occurred_at >= now - Duration::days(7)));
    }
}
