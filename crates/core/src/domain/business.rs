use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessId(pub String);

impl std::fmt::Display for BusinessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time aggregate of a business's state, assembled by the context
/// cache. Snapshots are never mutated; a refresh produces a new one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusinessContext {
    pub business_id: BusinessId,
    pub profile: BusinessProfile,
    pub recent_activity: RecentActivity,
    pub financials: FinancialSnapshot,
    pub operations: OperationalMetrics,
    pub industry: IndustryProfile,
    pub fetched_at: DateTime<Utc>,
    pub version: u64,
}

impl BusinessContext {
    pub fn service_names(&self) -> Vec<String> {
        self.profile.services.iter().map(|service| service.name.clone()).collect()
    }

    pub fn next_slots(&self, limit: usize) -> Vec<String> {
        self.profile.available_slots.iter().take(limit).map(|slot| slot.label.clone()).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub name: String,
    pub industry: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub hours: String,
    pub services: Vec<ServiceOffering>,
    pub available_slots: Vec<AvailableSlot>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub name: String,
    pub description: String,
    pub base_price: Option<Decimal>,
    pub duration_minutes: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableSlot {
    pub starts_at: DateTime<Utc>,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecentActivity {
    pub window_days: u32,
    pub jobs: Vec<JobSummary>,
    pub customers: Vec<CustomerSummary>,
    pub communications: Vec<CommunicationSummary>,
    pub financial_events: Vec<FinancialEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub customer_id: Option<String>,
    pub title: String,
    pub status: String,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerSummary {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationSummary {
    pub id: String,
    pub channel: String,
    pub direction: String,
    pub summary: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialEvent {
    pub id: String,
    pub kind: String,
    pub amount: Decimal,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FinancialSnapshot {
    pub revenue_30d: Decimal,
    pub outstanding_invoices: Decimal,
    pub overdue_invoice_count: u32,
    pub average_job_value: Decimal,
}

#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationalMetrics {
    pub open_jobs: u32,
    pub completed_jobs_30d: u32,
    pub active_customers: u32,
    pub average_response_minutes: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndustryProfile {
    pub industry: String,
    pub emergency_services: bool,
    pub typical_services: Vec<String>,
    pub peak_hours: Vec<String>,
}
