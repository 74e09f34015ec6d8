//! Per-business snapshot cache.
//!
//! A snapshot is assembled from five provider reads issued concurrently and
//! served unchanged until it is older than the configured TTL. A failed
//! refresh is surfaced to the caller; a stale snapshot is never handed out in
//! its place. Concurrent misses for one business share a single refresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ContextCacheConfig;
use crate::domain::business::{BusinessContext, BusinessId};
use crate::errors::ApplicationError;
use crate::ports::BusinessDataProvider;

struct CacheEntry {
    snapshot: Arc<BusinessContext>,
    fetched_at: Instant,
}

pub struct ContextCache {
    provider: Arc<dyn BusinessDataProvider>,
    config: ContextCacheConfig,
    entries: Mutex<HashMap<BusinessId, CacheEntry>>,
    refreshing: Mutex<HashMap<BusinessId, Arc<Mutex<()>>>>,
    versions: AtomicU64,
}

impl ContextCache {
    pub fn new(provider: Arc<dyn BusinessDataProvider>, config: ContextCacheConfig) -> Self {
        Self {
            provider,
            config,
            entries: Mutex::new(HashMap::new()),
            refreshing: Mutex::new(HashMap::new()),
            versions: AtomicU64::new(0),
        }
    }

    /// Returns the cached snapshot while it is younger than the TTL, otherwise
    /// refetches and replaces it.
    pub async fn get(&self, business_id: &BusinessId) -> Result<Arc<BusinessContext>, ApplicationError> {
        if let Some(snapshot) = self.fresh(business_id).await {
            return Ok(snapshot);
        }

        let slot = {
            let mut refreshing = self.refreshing.lock().await;
            Arc::clone(refreshing.entry(business_id.clone()).or_default())
        };
        let result = {
            let _refresh = slot.lock().await;
            // Another caller may have finished the refresh while we waited.
            match self.fresh(business_id).await {
                Some(snapshot) => Ok(snapshot),
                None => self.refresh(business_id).await,
            }
        };

        let mut refreshing = self.refreshing.lock().await;
        if Arc::strong_count(&slot) == 2 {
            refreshing.remove(business_id);
        }
        result
    }

    async fn fresh(&self, business_id: &BusinessId) -> Option<Arc<BusinessContext>> {
        let entries = self.entries.lock().await;
        entries
            .get(business_id)
            .filter(|entry| entry.fetched_at.elapsed() < self.config.ttl())
            .map(|entry| Arc::clone(&entry.snapshot))
    }

    async fn refresh(&self, business_id: &BusinessId) -> Result<Arc<BusinessContext>, ApplicationError> {
        let snapshot = match self.fetch(business_id).await {
            Ok(snapshot) => Arc::new(snapshot),
            Err(error) => {
                warn!(
                    event_name = "context.refresh.failed",
                    business_id = %business_id,
                    error = %error,
                    "business context refresh failed"
                );
                return Err(error);
            }
        };

        let mut entries = self.entries.lock().await;
        entries.insert(
            business_id.clone(),
            CacheEntry { snapshot: Arc::clone(&snapshot), fetched_at: Instant::now() },
        );
        self.evict_over_capacity(&mut entries);

        debug!(
            event_name = "context.refresh.completed",
            business_id = %business_id,
            version = snapshot.version,
            cached_entries = entries.len(),
            "business context refreshed"
        );

        Ok(snapshot)
    }

    /// Cached snapshot regardless of age, without touching the provider.
    pub async fn peek(&self, business_id: &BusinessId) -> Option<Arc<BusinessContext>> {
        self.entries.lock().await.get(business_id).map(|entry| Arc::clone(&entry.snapshot))
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    async fn fetch(&self, business_id: &BusinessId) -> Result<BusinessContext, ApplicationError> {
        let provider = self.provider.as_ref();
        let (profile, recent_activity, financials, operations, industry) = tokio::try_join!(
            provider.profile(business_id),
            provider.recent_activity(business_id, self.config.activity_window_days),
            provider.financial_snapshot(business_id),
            provider.operational_metrics(business_id),
            provider.industry_profile(business_id),
        )?;

        Ok(BusinessContext {
            business_id: business_id.clone(),
            profile,
            recent_activity,
            financials,
            operations,
            industry,
            fetched_at: Utc::now(),
            version: self.versions.fetch_add(1, Ordering::Relaxed) + 1,
        })
    }

    fn evict_over_capacity(&self, entries: &mut HashMap<BusinessId, CacheEntry>) {
        while entries.len() > self.config.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.fetched_at)
                .map(|(business_id, _)| business_id.clone());
            let Some(oldest) = oldest else { break };
            entries.remove(&oldest);
            debug!(
                event_name = "context.cache.evicted",
                business_id = %oldest,
                "evicted oldest business context"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::ContextCache;
    use crate::config::ContextCacheConfig;
    use crate::domain::business::{
        BusinessId, BusinessProfile, FinancialSnapshot, IndustryProfile, OperationalMetrics,
        RecentActivity,
    };
    use crate::errors::ApplicationError;
    use crate::ports::{BusinessDataProvider, ProviderError};

    #[derive(Default)]
    struct CountingProvider {
        profile_reads: AtomicUsize,
        last_window: AtomicUsize,
        fail_financials: AtomicBool,
        profile_delay: Option<Duration>,
    }

    #[async_trait]
    impl BusinessDataProvider for CountingProvider {
        async fn profile(&self, business_id: &BusinessId) -> Result<BusinessProfile, ProviderError> {
            self.profile_reads.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.profile_delay {
                tokio::time::sleep(delay).await;
            }
            if business_id.0 == "missing" {
                return Err(ProviderError::UnknownBusiness(business_id.0.clone()));
            }
            Ok(BusinessProfile {
                name: format!("{} Plumbing", business_id.0),
                industry: "plumbing".to_string(),
                phone: None,
                email: None,
                hours: "Mon-Fri 8am-6pm".to_string(),
                services: Vec::new(),
                available_slots: Vec::new(),
            })
        }

        async fn recent_activity(
            &self,
            _business_id: &BusinessId,
            window_days: u32,
        ) -> Result<RecentActivity, ProviderError> {
            self.last_window.store(window_days as usize, Ordering::SeqCst);
            Ok(RecentActivity { window_days, ..RecentActivity::default() })
        }

        async fn financial_snapshot(
            &self,
            _business_id: &BusinessId,
        ) -> Result<FinancialSnapshot, ProviderError> {
            if self.fail_financials.load(Ordering::SeqCst) {
                return Err(ProviderError::Unavailable("ledger offline".to_string()));
            }
            Ok(FinancialSnapshot::default())
        }

        async fn operational_metrics(
            &self,
            _business_id: &BusinessId,
        ) -> Result<OperationalMetrics, ProviderError> {
            Ok(OperationalMetrics::default())
        }

        async fn industry_profile(
            &self,
            _business_id: &BusinessId,
        ) -> Result<IndustryProfile, ProviderError> {
            Ok(IndustryProfile::default())
        }
    }

    fn business(id: &str) -> BusinessId {
        BusinessId(id.to_string())
    }

    fn cache(provider: Arc<CountingProvider>, max_entries: usize) -> ContextCache {
        ContextCache::new(
            provider,
            ContextCacheConfig { ttl_secs: 300, activity_window_days: 30, max_entries },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn returns_same_snapshot_within_ttl_and_refetches_after() {
        let provider = Arc::new(CountingProvider::default());
        let cache = cache(provider.clone(), 10);
        let id = business("biz-1");

        let first = cache.get(&id).await.expect("first fetch");
        tokio::time::advance(Duration::from_secs(299)).await;
        let second = cache.get(&id).await.expect("cached");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.profile_reads.load(Ordering::SeqCst), 1);
        assert_eq!(provider.last_window.load(Ordering::SeqCst), 30);

        tokio::time::advance(Duration::from_secs(1)).await;
        let third = cache.get(&id).await.expect("refetch");
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(third.version > first.version);
        assert_eq!(provider.profile_reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_refresh() {
        let provider = Arc::new(CountingProvider {
            profile_delay: Some(Duration::from_millis(50)),
            ..CountingProvider::default()
        });
        let cache = cache(provider.clone(), 10);
        let id = business("biz-1");

        let (first, second) = tokio::join!(cache.get(&id), cache.get(&id));
        let first = first.expect("first caller");
        let second = second.expect("second caller");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.profile_reads.load(Ordering::SeqCst), 1);
        assert!(cache.refreshing.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_does_not_serve_stale_snapshot() {
        let provider = Arc::new(CountingProvider::default());
        let cache = cache(provider.clone(), 10);
        let id = business("biz-1");

        let stale = cache.get(&id).await.expect("first fetch");
        provider.fail_financials.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(301)).await;

        let result = cache.get(&id).await;
        assert_eq!(result, Err(ApplicationError::Integration("ledger offline".to_string())));

        let peeked = cache.peek(&id).await.expect("entry kept for inspection");
        assert!(Arc::ptr_eq(&stale, &peeked));
    }

    #[tokio::test]
    async fn unknown_business_surfaces_not_found() {
        let provider = Arc::new(CountingProvider::default());
        let cache = cache(provider, 10);

        let result = cache.get(&business("missing")).await;
        assert!(matches!(result, Err(ApplicationError::NotFound { kind: "business", .. })));
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_oldest_fetch() {
        let provider = Arc::new(CountingProvider::default());
        let cache = cache(provider, 2);

        cache.get(&business("a")).await.expect("a");
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.get(&business("b")).await.expect("b");
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.get(&business("c")).await.expect("c");

        assert_eq!(cache.len().await, 2);
        assert!(cache.peek(&business("a")).await.is_none());
        assert!(cache.peek(&business("c")).await.is_some());
    }
}
