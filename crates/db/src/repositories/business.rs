use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use frontdesk_core::domain::business::{
    AvailableSlot, BusinessId, BusinessProfile, CommunicationSummary, CustomerSummary,
    FinancialEvent, FinancialSnapshot, IndustryProfile, JobSummary, OperationalMetrics,
    RecentActivity, ServiceOffering,
};
use frontdesk_core::ports::{BusinessDataProvider, ProviderError};

use super::{BusinessRecord, RepositoryError};
use crate::DbPool;

/// Business data read from the SQLite schema in `migrations/`.
pub struct SqlBusinessDataProvider {
    pool: DbPool,
}

impl SqlBusinessDataProvider {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Writes the whole record in one transaction. Services and slots are
    /// replaced; activity rows are inserted or overwritten by id.
    pub async fn upsert(&self, record: &BusinessRecord) -> Result<(), RepositoryError> {
        let id = record.business_id.0.as_str();
        let profile = &record.profile;
        let now = encode_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO business (id, name, industry, phone, email, hours, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                industry = excluded.industry,
                phone = excluded.phone,
                email = excluded.email,
                hours = excluded.hours,
                updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(&profile.name)
        .bind(&profile.industry)
        .bind(&profile.phone)
        .bind(&profile.email)
        .bind(&profile.hours)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM business_service WHERE business_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for (position, service) in profile.services.iter().enumerate() {
            sqlx::query(
                "INSERT INTO business_service
                    (business_id, position, name, description, base_price, duration_minutes)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(position as i64)
            .bind(&service.name)
            .bind(&service.description)
            .bind(service.base_price.map(|price| price.to_string()))
            .bind(service.duration_minutes.map(i64::from))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM business_slot WHERE business_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        for slot in &profile.available_slots {
            sqlx::query("INSERT INTO business_slot (business_id, starts_at, label) VALUES (?, ?, ?)")
                .bind(id)
                .bind(encode_timestamp(slot.starts_at))
                .bind(&slot.label)
                .execute(&mut *tx)
                .await?;
        }

        let financials = &record.financials;
        sqlx::query(
            "INSERT OR REPLACE INTO business_financials
                (business_id, revenue_30d, outstanding_invoices, overdue_invoice_count, average_job_value)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(financials.revenue_30d.to_string())
        .bind(financials.outstanding_invoices.to_string())
        .bind(i64::from(financials.overdue_invoice_count))
        .bind(financials.average_job_value.to_string())
        .execute(&mut *tx)
        .await?;

        let operations = &record.operations;
        sqlx::query(
            "INSERT OR REPLACE INTO business_operations
                (business_id, open_jobs, completed_jobs_30d, active_customers, average_response_minutes)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(i64::from(operations.open_jobs))
        .bind(i64::from(operations.completed_jobs_30d))
        .bind(i64::from(operations.active_customers))
        .bind(operations.average_response_minutes)
        .execute(&mut *tx)
        .await?;

        let industry = &record.industry;
        sqlx::query(
            "INSERT OR REPLACE INTO industry_profile
                (business_id, industry, emergency_services, typical_services_json, peak_hours_json)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(&industry.industry)
        .bind(industry.emergency_services)
        .bind(encode_list(&industry.typical_services)?)
        .bind(encode_list(&industry.peak_hours)?)
        .execute(&mut *tx)
        .await?;

        let activity = &record.recent_activity;
        for customer in &activity.customers {
            sqlx::query(
                "INSERT OR REPLACE INTO customer (id, business_id, name, phone, email, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&customer.id)
            .bind(id)
            .bind(&customer.name)
            .bind(&customer.phone)
            .bind(&customer.email)
            .bind(encode_timestamp(customer.created_at))
            .execute(&mut *tx)
            .await?;
        }
        for job in &activity.jobs {
            sqlx::query(
                "INSERT OR REPLACE INTO job (id, business_id, customer_id, title, status, scheduled_for)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&job.id)
            .bind(id)
            .bind(&job.customer_id)
            .bind(&job.title)
            .bind(&job.status)
            .bind(job.scheduled_for.map(encode_timestamp))
            .execute(&mut *tx)
            .await?;
        }
        for entry in &activity.communications {
            sqlx::query(
                "INSERT OR REPLACE INTO communication
                    (id, business_id, channel, direction, summary, occurred_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.id)
            .bind(id)
            .bind(&entry.channel)
            .bind(&entry.direction)
            .bind(&entry.summary)
            .bind(encode_timestamp(entry.occurred_at))
            .execute(&mut *tx)
            .await?;
        }
        for event in &activity.financial_events {
            sqlx::query(
                "INSERT OR REPLACE INTO financial_event (id, business_id, kind, amount, occurred_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&event.id)
            .bind(id)
            .bind(&event.kind)
            .bind(event.amount.to_string())
            .bind(encode_timestamp(event.occurred_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn business_ids(&self) -> Result<Vec<BusinessId>, RepositoryError> {
        let rows = sqlx::query("SELECT id FROM business ORDER BY id").fetch_all(&self.pool).await?;
        rows.iter().map(|row| Ok(BusinessId(row.try_get::<String, _>("id")?))).collect()
    }

    async fn exists(&self, business_id: &BusinessId) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 AS present FROM business WHERE id = ?")
            .bind(&business_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn load_profile(
        &self,
        business_id: &BusinessId,
    ) -> Result<Option<BusinessProfile>, RepositoryError> {
        let Some(row) = sqlx::query(
            "SELECT name, industry, phone, email, hours FROM business WHERE id = ?",
        )
        .bind(&business_id.0)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let services = sqlx::query(
            "SELECT name, description, base_price, duration_minutes
             FROM business_service WHERE business_id = ? ORDER BY position",
        )
        .bind(&business_id.0)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(decode_service)
        .collect::<Result<Vec<_>, _>>()?;

        let available_slots = sqlx::query(
            "SELECT starts_at, label FROM business_slot WHERE business_id = ? ORDER BY starts_at",
        )
        .bind(&business_id.0)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<_, RepositoryError> {
            Ok(AvailableSlot {
                starts_at: decode_timestamp(&row.try_get::<String, _>("starts_at")?)?,
                label: row.try_get("label")?,
            })
        })
        .collect::<Result<Vec<_>, RepositoryError>>()?;

        Ok(Some(BusinessProfile {
            name: row.try_get("name")?,
            industry: row.try_get("industry")?,
            phone: row.try_get("phone")?,
            email: row.try_get("email")?,
            hours: row.try_get("hours")?,
            services,
            available_slots,
        }))
    }

    async fn load_activity(
        &self,
        business_id: &BusinessId,
        window_days: u32,
    ) -> Result<RecentActivity, RepositoryError> {
        let cutoff = encode_timestamp(Utc::now() - Duration::days(i64::from(window_days)));
        let id = business_id.0.as_str();

        let jobs = sqlx::query(
            "SELECT id, customer_id, title, status, scheduled_for FROM job
             WHERE business_id = ? AND (scheduled_for IS NULL OR scheduled_for >= ?)
             ORDER BY scheduled_for, id",
        )
        .bind(id)
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<_, RepositoryError> {
            Ok(JobSummary {
                id: row.try_get("id")?,
                customer_id: row.try_get("customer_id")?,
                title: row.try_get("title")?,
                status: row.try_get("status")?,
                scheduled_for: row
                    .try_get::<Option<String>, _>("scheduled_for")?
                    .as_deref()
                    .map(decode_timestamp)
                    .transpose()?,
            })
        })
        .collect::<Result<Vec<_>, RepositoryError>>()?;

        let customers = sqlx::query(
            "SELECT id, name, phone, email, created_at FROM customer
             WHERE business_id = ? AND created_at >= ? ORDER BY created_at, id",
        )
        .bind(id)
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<_, RepositoryError> {
            Ok(CustomerSummary {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                phone: row.try_get("phone")?,
                email: row.try_get("email")?,
                created_at: decode_timestamp(&row.try_get::<String, _>("created_at")?)?,
            })
        })
        .collect::<Result<Vec<_>, RepositoryError>>()?;

        let communications = sqlx::query(
            "SELECT id, channel, direction, summary, occurred_at FROM communication
             WHERE business_id = ? AND occurred_at >= ? ORDER BY occurred_at, id",
        )
        .bind(id)
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<_, RepositoryError> {
            Ok(CommunicationSummary {
                id: row.try_get("id")?,
                channel: row.try_get("channel")?,
                direction: row.try_get("direction")?,
                summary: row.try_get("summary")?,
                occurred_at: decode_timestamp(&row.try_get::<String, _>("occurred_at")?)?,
            })
        })
        .collect::<Result<Vec<_>, RepositoryError>>()?;

        let financial_events = sqlx::query(
            "SELECT id, kind, amount, occurred_at FROM financial_event
             WHERE business_id = ? AND occurred_at >= ? ORDER BY occurred_at, id",
        )
        .bind(id)
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| -> Result<_, RepositoryError> {
            Ok(FinancialEvent {
                id: row.try_get("id")?,
                kind: row.try_get("kind")?,
                amount: decode_decimal(&row.try_get::<String, _>("amount")?)?,
                occurred_at: decode_timestamp(&row.try_get::<String, _>("occurred_at")?)?,
            })
        })
        .collect::<Result<Vec<_>, RepositoryError>>()?;

        Ok(RecentActivity { window_days, jobs, customers, communications, financial_events })
    }

    async fn load_financials(
        &self,
        business_id: &BusinessId,
    ) -> Result<Option<FinancialSnapshot>, RepositoryError> {
        let row = sqlx::query(
            "SELECT revenue_30d, outstanding_invoices, overdue_invoice_count, average_job_value
             FROM business_financials WHERE business_id = ?",
        )
        .bind(&business_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<_, RepositoryError> {
            Ok(FinancialSnapshot {
                revenue_30d: decode_decimal(&row.try_get::<String, _>("revenue_30d")?)?,
                outstanding_invoices: decode_decimal(
                    &row.try_get::<String, _>("outstanding_invoices")?,
                )?,
                overdue_invoice_count: decode_count(&row, "overdue_invoice_count")?,
                average_job_value: decode_decimal(&row.try_get::<String, _>("average_job_value")?)?,
            })
        })
        .transpose()
    }

    async fn load_operations(
        &self,
        business_id: &BusinessId,
    ) -> Result<Option<OperationalMetrics>, RepositoryError> {
        let row = sqlx::query(
            "SELECT open_jobs, completed_jobs_30d, active_customers, average_response_minutes
             FROM business_operations WHERE business_id = ?",
        )
        .bind(&business_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<_, RepositoryError> {
            Ok(OperationalMetrics {
                open_jobs: decode_count(&row, "open_jobs")?,
                completed_jobs_30d: decode_count(&row, "completed_jobs_30d")?,
                active_customers: decode_count(&row, "active_customers")?,
                average_response_minutes: row.try_get("average_response_minutes")?,
            })
        })
        .transpose()
    }

    async fn load_industry(
        &self,
        business_id: &BusinessId,
    ) -> Result<Option<IndustryProfile>, RepositoryError> {
        let row = sqlx::query(
            "SELECT industry, emergency_services, typical_services_json, peak_hours_json
             FROM industry_profile WHERE business_id = ?",
        )
        .bind(&business_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<_, RepositoryError> {
            Ok(IndustryProfile {
                industry: row.try_get("industry")?,
                emergency_services: row.try_get("emergency_services")?,
                typical_services: decode_list(&row.try_get::<String, _>("typical_services_json")?)?,
                peak_hours: decode_list(&row.try_get::<String, _>("peak_hours_json")?)?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl BusinessDataProvider for SqlBusinessDataProvider {
    async fn profile(&self, business_id: &BusinessId) -> Result<BusinessProfile, ProviderError> {
        self.load_profile(business_id).await?.ok_or_else(|| unknown(business_id))
    }

    async fn recent_activity(
        &self,
        business_id: &BusinessId,
        window_days: u32,
    ) -> Result<RecentActivity, ProviderError> {
        if !self.exists(business_id).await? {
            return Err(unknown(business_id));
        }
        Ok(self.load_activity(business_id, window_days).await?)
    }

    async fn financial_snapshot(
        &self,
        business_id: &BusinessId,
    ) -> Result<FinancialSnapshot, ProviderError> {
        self.load_financials(business_id).await?.ok_or_else(|| unknown(business_id))
    }

    async fn operational_metrics(
        &self,
        business_id: &BusinessId,
    ) -> Result<OperationalMetrics, ProviderError> {
        self.load_operations(business_id).await?.ok_or_else(|| unknown(business_id))
    }

    async fn industry_profile(
        &self,
        business_id: &BusinessId,
    ) -> Result<IndustryProfile, ProviderError> {
        self.load_industry(business_id).await?.ok_or_else(|| unknown(business_id))
    }
}

fn unknown(business_id: &BusinessId) -> ProviderError {
    ProviderError::UnknownBusiness(business_id.0.clone())
}

fn decode_service(row: &SqliteRow) -> Result<ServiceOffering, RepositoryError> {
    Ok(ServiceOffering {
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        base_price: row
            .try_get::<Option<String>, _>("base_price")?
            .as_deref()
            .map(decode_decimal)
            .transpose()?,
        duration_minutes: row
            .try_get::<Option<i64>, _>("duration_minutes")?
            .map(|minutes| {
                u32::try_from(minutes).map_err(|_| {
                    RepositoryError::Decode(format!("invalid service duration `{minutes}`"))
                })
            })
            .transpose()?,
    })
}

// Fixed-width UTC text so that string comparison in SQL orders by time.
fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid timestamp `{value}`: {error}")))
}

fn decode_decimal(value: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid decimal `{value}`: {error}")))
}

fn decode_count(row: &SqliteRow, column: &str) -> Result<u32, RepositoryError> {
    let value = row.try_get::<i64, _>(column)?;
    u32::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("invalid count `{value}` in `{column}`")))
}

fn encode_list(values: &[String]) -> Result<String, RepositoryError> {
    serde_json::to_string(values).map_err(|error| RepositoryError::Decode(error.to_string()))
}

fn decode_list(value: &str) -> Result<Vec<String>, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid string list `{value}`: {error}")))
}

#[cfg(test)]
mod tests {
    use frontdesk_core::domain::business::BusinessId;
    use frontdesk_core::ports::{BusinessDataProvider, ProviderError};

    use super::SqlBusinessDataProvider;
    use crate::fixtures::{demo_business, DEMO_BUSINESS_ID};
    use crate::{connect_with_settings, migrations::run_pending};

    async fn provider() -> SqlBusinessDataProvider {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");
        SqlBusinessDataProvider::new(pool)
    }

    #[tokio::test]
    async fn upsert_round_trips_the_demo_business() {
        let provider = provider().await;
        let record = demo_business();
        provider.upsert(&record).await.expect("upsert");
        let id = BusinessId(DEMO_BUSINESS_ID.to_string());

        assert_eq!(provider.profile(&id).await.expect("profile"), record.profile);
        assert_eq!(provider.financial_snapshot(&id).await.expect("financials"), record.financials);
        assert_eq!(provider.operational_metrics(&id).await.expect("operations"), record.operations);
        assert_eq!(provider.industry_profile(&id).await.expect("industry"), record.industry);
        assert_eq!(provider.business_ids().await.expect("ids"), vec![id]);
    }

    #[tokio::test]
    async fn recent_activity_respects_the_window() {
        let provider = provider().await;
        provider.upsert(&demo_business()).await.expect("upsert");
        let id = BusinessId(DEMO_BUSINESS_ID.to_string());

        let month = provider.recent_activity(&id, 30).await.expect("month");
        let week = provider.recent_activity(&id, 7).await.expect("week");

        assert_eq!(month.window_days, 30);
        assert!(!week.communications.is_empty());
        assert!(week.communications.len() < month.communications.len());
    }

    #[tokio::test]
    async fn second_upsert_replaces_services() {
        let provider = provider().await;
        let mut record = demo_business();
        provider.upsert(&record).await.expect("first upsert");

        record.profile.services.truncate(1);
        record.profile.hours = "Mon-Sat 7am-7pm".to_string();
        provider.upsert(&record).await.expect("second upsert");

        let profile = provider.profile(&record.business_id).await.expect("profile");
        assert_eq!(profile.services.len(), 1);
        assert_eq!(profile.hours, "Mon-Sat 7am-7pm");
    }

    #[tokio::test]
    async fn unknown_business_is_reported_per_call() {
        let provider = provider().await;
        let id = BusinessId("biz-missing".to_string());

        assert_eq!(
            provider.recent_activity(&id, 30).await,
            Err(ProviderError::UnknownBusiness("biz-missing".to_string()))
        );
        assert!(matches!(provider.profile(&id).await, Err(ProviderError::UnknownBusiness(_))));
    }
}
