use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};
use rust_decimal::Decimal;
use serde::Serialize;

use frontdesk_core::domain::business::{
    AvailableSlot, BusinessId, BusinessProfile, CommunicationSummary, CustomerSummary,
    FinancialEvent, FinancialSnapshot, IndustryProfile, JobSummary, OperationalMetrics,
    RecentActivity, ServiceOffering,
};

use crate::repositories::{BusinessRecord, RepositoryError, SqlBusinessDataProvider};
use crate::DbPool;

/// Business id of the bundled demo tenant.
pub const DEMO_BUSINESS_ID: &str = "biz-reyes-plumbing";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SeedResult {
    pub business_id: String,
    pub services: usize,
    pub available_slots: usize,
    pub activity_rows: usize,
}

/// A small plumbing company with a month of activity, relative to now.
pub fn demo_business() -> BusinessRecord {
    let now = Utc::now();
    let now = now.with_nanosecond(0).unwrap_or(now);
    let days_ago = |days: i64| now - Duration::days(days);

    let profile = BusinessProfile {
        name: "Reyes Plumbing".to_string(),
        industry: "plumbing".to_string(),
        phone: Some("+15550000000".to_string()),
        email: Some("office@reyesplumbing.example".to_string()),
        hours: "Mon-Fri 8am-6pm".to_string(),
        services: vec![
            service("Drain cleaning", "Clear clogged sinks, tubs and main lines", 149, Some(60)),
            service("Water heater install", "Tank and tankless replacement", 1250, Some(240)),
            ServiceOffering {
                name: "Leak repair".to_string(),
                description: "Pipe and fixture leaks, quoted on site".to_string(),
                base_price: None,
                duration_minutes: Some(90),
            },
        ],
        available_slots: upcoming_slots(now, 3),
    };

    let customers = vec![
        customer("cust-001", "Marta Lopez", Some("+15551110001"), days_ago(2)),
        customer("cust-002", "Ken Okafor", Some("+15551110002"), days_ago(18)),
        customer("cust-003", "Priya Nair", None, days_ago(90)),
    ];
    let jobs = vec![
        JobSummary {
            id: "job-101".to_string(),
            customer_id: Some("cust-001".to_string()),
            title: "Kitchen drain clog".to_string(),
            status: "completed".to_string(),
            scheduled_for: Some(days_ago(2)),
        },
        JobSummary {
            id: "job-102".to_string(),
            customer_id: Some("cust-002".to_string()),
            title: "Water heater replacement".to_string(),
            status: "scheduled".to_string(),
            scheduled_for: Some(now + Duration::days(3)),
        },
        JobSummary {
            id: "job-090".to_string(),
            customer_id: Some("cust-003".to_string()),
            title: "Outdoor spigot repair".to_string(),
            status: "completed".to_string(),
            scheduled_for: Some(days_ago(60)),
        },
    ];
    let communications = vec![
        communication("comm-1", "phone", "inbound", "Asked about drain cleaning price", days_ago(1)),
        communication("comm-2", "sms", "outbound", "Appointment reminder sent", days_ago(3)),
        communication("comm-3", "email", "inbound", "Invoice question", days_ago(12)),
        communication("comm-4", "phone", "inbound", "After-hours leak report", days_ago(25)),
    ];
    let financial_events = vec![
        financial_event("fin-1", "payment", Decimal::new(14900, 2), days_ago(2)),
        financial_event("fin-2", "invoice", Decimal::new(125000, 2), days_ago(14)),
        financial_event("fin-3", "payment", Decimal::new(32000, 2), days_ago(26)),
    ];

    BusinessRecord {
        business_id: BusinessId(DEMO_BUSINESS_ID.to_string()),
        profile,
        recent_activity: RecentActivity {
            window_days: 30,
            jobs,
            customers,
            communications,
            financial_events,
        },
        financials: FinancialSnapshot {
            revenue_30d: Decimal::new(46900, 2),
            outstanding_invoices: Decimal::new(125000, 2),
            overdue_invoice_count: 1,
            average_job_value: Decimal::new(35500, 2),
        },
        operations: OperationalMetrics {
            open_jobs: 1,
            completed_jobs_30d: 12,
            active_customers: 48,
            average_response_minutes: Some(14.5),
        },
        industry: IndustryProfile {
            industry: "plumbing".to_string(),
            emergency_services: true,
            typical_services: vec![
                "drain cleaning".to_string(),
                "leak repair".to_string(),
                "water heater install".to_string(),
            ],
            peak_hours: vec!["07:00-09:00".to_string(), "17:00-19:00".to_string()],
        },
    }
}

/// Writes the demo business through the SQL provider. Safe to run twice.
pub async fn seed_demo_business(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
    let record = demo_business();
    SqlBusinessDataProvider::new(pool.clone()).upsert(&record).await?;

    let activity = &record.recent_activity;
    Ok(SeedResult {
        business_id: record.business_id.0.clone(),
        services: record.profile.services.len(),
        available_slots: record.profile.available_slots.len(),
        activity_rows: activity.jobs.len()
            + activity.customers.len()
            + activity.communications.len()
            + activity.financial_events.len(),
    })
}

fn service(name: &str, description: &str, price: i64, minutes: Option<u32>) -> ServiceOffering {
    ServiceOffering {
        name: name.to_string(),
        description: description.to_string(),
        base_price: Some(Decimal::from(price)),
        duration_minutes: minutes,
    }
}

fn customer(id: &str, name: &str, phone: Option<&str>, created_at: DateTime<Utc>) -> CustomerSummary {
    CustomerSummary {
        id: id.to_string(),
        name: name.to_string(),
        phone: phone.map(str::to_string),
        email: None,
        created_at,
    }
}

fn communication(
    id: &str,
    channel: &str,
    direction: &str,
    summary: &str,
    occurred_at: DateTime<Utc>,
) -> CommunicationSummary {
    CommunicationSummary {
        id: id.to_string(),
        channel: channel.to_string(),
        direction: direction.to_string(),
        summary: summary.to_string(),
        occurred_at,
    }
}

fn financial_event(id: &str, kind: &str, amount: Decimal, occurred_at: DateTime<Utc>) -> FinancialEvent {
    FinancialEvent { id: id.to_string(), kind: kind.to_string(), amount, occurred_at }
}

// Morning and afternoon openings on the next weekdays.
fn upcoming_slots(now: DateTime<Utc>, days: usize) -> Vec<AvailableSlot> {
    (1..=14)
        .map(|offset| now.date_naive() + Duration::days(offset))
        .filter(|date| !matches!(date.weekday(), Weekday::Sat | Weekday::Sun))
        .take(days)
        .flat_map(|date| [9, 13].into_iter().filter_map(move |hour| date.and_hms_opt(hour, 0, 0)))
        .map(|starts_at| {
            let starts_at = starts_at.and_utc();
            AvailableSlot { label: starts_at.format("%a %b %-d, %-I:%M %p").to_string(), starts_at }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Datelike, Weekday};

    use super::{demo_business, seed_demo_business, DEMO_BUSINESS_ID};
    use crate::{connect_with_settings, migrations::run_pending};

    #[test]
    fn demo_slots_fall_on_weekdays() {
        let record = demo_business();
        let slots = &record.profile.available_slots;

        assert_eq!(slots.len(), 6);
        assert!(slots
            .iter()
            .all(|slot| !matches!(slot.starts_at.weekday(), Weekday::Sat | Weekday::Sun)));
        assert!(slots.windows(2).all(|pair| pair[0].starts_at < pair[1].starts_at));
    }

    #[tokio::test]
    async fn seeding_is_repeatable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let first = seed_demo_business(&pool).await.expect("first seed");
        let second = seed_demo_business(&pool).await.expect("second seed");

        assert_eq!(first.business_id, DEMO_BUSINESS_ID);
        assert_eq!(first.services, 3);
        assert_eq!(first.activity_rows, 13);
        assert_eq!(first, second);
    }
}
