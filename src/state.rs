use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use crate::balance::HealthRegistry;
use crate::config::ConfigStore;
use crate::upstream::ClientPool;

const HISTORY_CAPACITY: usize = 256;

/// Summary of one completed request. Bodies are never recorded.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub time: DateTime<Utc>,
    pub dialect: &'static str,
    pub model: String,
    pub provider: String,
    pub rule: String,
    pub status: u16,
    pub duration_ms: i64,
    pub streamed: bool,
}

/// Bounded in-memory ring of recent request summaries.
#[derive(Default)]
pub struct RequestLog {
    records: Mutex<VecDeque<RequestRecord>>,
}

impl RequestLog {
    pub fn record(&self, record: RequestRecord) {
        let mut guard = self.records.lock().expect("history lock poisoned");
        if guard.len() == HISTORY_CAPACITY {
            guard.pop_front();
        }
        guard.push_back(record);
    }

    /// Most recent records first.
    pub fn recent(&self, limit: usize) -> Vec<RequestRecord> {
        let guard = self.records.lock().expect("history lock poisoned");
        guard.iter().rev().take(limit).cloned().collect()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub pool: Arc<ClientPool>,
    pub health: Arc<HealthRegistry>,
    pub history: Arc<RequestLog>,
    pub started_at: DateTime<Utc>,
    pub shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        let pool = Arc::new(ClientPool::default());

        // Rotated or removed providers must not keep serving from cached
        // clients.
        let pool_for_eviction = pool.clone();
        store.subscribe(move |snapshot| pool_for_eviction.evict_stale(&snapshot));

        Self {
            store,
            pool,
            health: Arc::new(HealthRegistry::default()),
            history: Arc::new(RequestLog::default()),
            started_at: Utc::now(),
            shutdown: Arc::new(Notify::new()),
        }
    }
}
