use std::collections::HashMap;

use school_fees_core::{
    ChangeEvent, ChangeScope, DashboardStatus, Fee, FeeDetail, FeeId, FeeStatusFilter, Payment,
    PaymentFilter, PaymentId, QueryKey, StudentId, VerificationRequest, RESYNC_EVENT,
};

use crate::api::{ApiClient, ClientError, PaymentForm};

/// Value stored for a [`QueryKey`].
#[derive(Debug, Clone, PartialEq)]
pub enum CachedQuery {
    Fees(Vec<Fee>),
    Fee(FeeDetail),
    Payments(Vec<Payment>),
    Payment(Payment),
    DashboardStatus(DashboardStatus),
}

/// Explicit read cache keyed by typed query identities.
///
/// Entries are never patched in place: a change drops every key it touches
/// and the next read refetches.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: HashMap<QueryKey, CachedQuery>,
    last_version: u64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &QueryKey) -> Option<&CachedQuery> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: QueryKey, value: CachedQuery) {
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest change version applied so far; resume the feed from here.
    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    /// Drops every entry made stale by a change to `scope`; returns how many were dropped.
    pub fn invalidate(&mut self, scope: &ChangeScope) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.is_invalidated_by(scope));
        before - self.entries.len()
    }

    /// Applies a broadcast change.
    ///
    /// The feed does not guarantee version order across concurrent writers, so
    /// every event invalidates; the version only advances the resume point.
    pub fn apply(&mut self, event: &ChangeEvent) -> usize {
        self.last_version = self.last_version.max(event.version);
        self.invalidate(&event.scope)
    }

    /// Drops every entry; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}

/// A message read from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(ChangeEvent),
    /// The server could not replay every missed change.
    Resync,
}

impl FeedMessage {
    /// Decodes an SSE frame from its `event` name and `data` payload.
    pub fn decode(event: &str, data: &str) -> Result<Self, serde_json::Error> {
        if event == RESYNC_EVENT {
            return Ok(Self::Resync);
        }
        serde_json::from_str(data).map(Self::Change)
    }
}

/// An [`ApiClient`] paired with a [`QueryCache`].
///
/// Reads are served from the cache when present. Mutations made through the
/// session invalidate the keys their result touches, so the submitting user
/// sees fresh data without waiting for the change feed.
pub struct LedgerSession {
    api: ApiClient,
    cache: QueryCache,
}

impl LedgerSession {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            cache: QueryCache::new(),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Feeds a change received from the event stream into the cache.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> usize {
        self.cache.apply(event)
    }

    /// Handles any feed message; a resync empties the cache so every view refetches.
    pub fn apply_feed(&mut self, message: &FeedMessage) -> usize {
        match message {
            FeedMessage::Change(event) => self.apply_change(event),
            FeedMessage::Resync => {
                let dropped = self.cache.clear();
                tracing::debug!(stage = "events", dropped, "feed resync, cache cleared");
                dropped
            }
        }
    }

    pub async fn fees(
        &mut self,
        student_id: Option<StudentId>,
        status: FeeStatusFilter,
    ) -> Result<Vec<Fee>, ClientError> {
        let key = QueryKey::Fees { student_id, status };
        if let Some(CachedQuery::Fees(fees)) = self.cache.get(&key) {
            return Ok(fees.clone());
        }
        let fees = self.api.list_fees(student_id, status).await?;
        self.cache.insert(key, CachedQuery::Fees(fees.clone()));
        Ok(fees)
    }

    pub async fn fee(&mut self, fee_id: FeeId) -> Result<FeeDetail, ClientError> {
        let key = QueryKey::Fee(fee_id);
        if let Some(CachedQuery::Fee(detail)) = self.cache.get(&key) {
            return Ok(detail.clone());
        }
        let detail = self.api.get_fee(fee_id).await?;
        self.cache.insert(key, CachedQuery::Fee(detail.clone()));
        Ok(detail)
    }

    pub async fn payments(&mut self, filter: PaymentFilter) -> Result<Vec<Payment>, ClientError> {
        let key = QueryKey::Payments(filter);
        if let Some(CachedQuery::Payments(payments)) = self.cache.get(&key) {
            return Ok(payments.clone());
        }
        let payments = self.api.list_payments(&filter).await?;
        self.cache
            .insert(key, CachedQuery::Payments(payments.clone()));
        Ok(payments)
    }

    pub async fn payment(&mut self, payment_id: PaymentId) -> Result<Payment, ClientError> {
        let key = QueryKey::Payment(payment_id);
        if let Some(CachedQuery::Payment(payment)) = self.cache.get(&key) {
            return Ok(payment.clone());
        }
        let payment = self.api.get_payment(payment_id).await?;
        self.cache.insert(key, CachedQuery::Payment(payment.clone()));
        Ok(payment)
    }

    pub async fn dashboard_status(&mut self) -> Result<DashboardStatus, ClientError> {
        let key = QueryKey::DashboardStatus;
        if let Some(CachedQuery::DashboardStatus(status)) = self.cache.get(&key) {
            return Ok(status.clone());
        }
        let status = self.api.dashboard_status().await?;
        self.cache
            .insert(key, CachedQuery::DashboardStatus(status.clone()));
        Ok(status)
    }

    pub async fn submit_payment(&mut self, form: &PaymentForm) -> Result<Payment, ClientError> {
        let payment = self.api.submit_payment(form).await?;
        self.cache.invalidate(&ChangeScope::of(&payment));
        Ok(payment)
    }

    pub async fn verify_payment(
        &mut self,
        payment_id: PaymentId,
        request: &VerificationRequest,
    ) -> Result<Payment, ClientError> {
        let payment = self.api.verify_payment(payment_id, request).await?;
        self.cache.invalidate(&ChangeScope::of(&payment));
        Ok(payment)
    }
}
