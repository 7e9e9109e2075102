//! Request/response correlation cache.
//!
//! Every issued `AuthnRequest` is stored under its ID until the matching
//! response arrives or the expiration window passes. The store is a plain
//! async key/value contract so deployments can plug in shared backends;
//! consume-once semantics live in the provider, not here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// A pending authentication request awaiting its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRecord {
    /// The request's `ID`, also the store key.
    pub request_id: String,
    /// Complete request XML as sent, kept for validation and audit.
    pub request_xml: String,
    /// Identity provider the request was addressed to.
    pub idp_entity_id: String,
    pub issue_instant: DateTime<Utc>,
}

/// Backend failure in a correlation store. Always fatal for the operation
/// in progress.
#[derive(Debug, Error)]
#[error("correlation store error: {0}")]
pub struct StoreError(pub String);

/// Async key/value contract for correlating requests with responses.
#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Looks up a pending request. Expired entries read as absent.
    async fn get(&self, request_id: &str) -> Result<Option<CorrelationRecord>, StoreError>;

    /// Stores a pending request, replacing any entry under the same ID.
    async fn set(&self, record: CorrelationRecord) -> Result<(), StoreError>;

    async fn delete(&self, request_id: &str) -> Result<(), StoreError>;

    /// Asks the backend to expire the entry after `ttl`. Returns `false`
    /// when the backend has no native expiry, in which case the provider
    /// schedules the cleanup itself.
    async fn expire(&self, _request_id: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Ok(false)
    }
}

struct Entry {
    record: CorrelationRecord,
    expires_at: Option<DateTime<Utc>>,
}

/// Single-process store backed by a `HashMap`. Suitable for tests and
/// single-instance deployments; anything load-balanced needs a shared
/// backend instead.
#[derive(Default)]
pub struct InMemoryCorrelationStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl CorrelationStore for InMemoryCorrelationStore {
    async fn get(&self, request_id: &str) -> Result<Option<CorrelationRecord>, StoreError> {
        let entries = self.entries.read().await;
        let entry = match entries.get(request_id) {
            Some(entry) => entry,
            None => return Ok(None),
        };
        if let Some(expires_at) = entry.expires_at {
            if expires_at <= Utc::now() {
                debug!(request_id, "correlation record expired");
                return Ok(None);
            }
        }
        Ok(Some(entry.record.clone()))
    }

    async fn set(&self, record: CorrelationRecord) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        debug!(request_id = %record.request_id, "correlation record stored");
        entries.insert(
            record.request_id.clone(),
            Entry {
                record,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, request_id: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if entries.remove(request_id).is_some() {
            debug!(request_id, "correlation record deleted");
        }
        Ok(())
    }

    async fn expire(&self, request_id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError(format!("ttl out of range: {e}")))?;
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(request_id) {
            entry.expires_at = Some(Utc::now() + ttl);
        }
        Ok(true)
    }
}
