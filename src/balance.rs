use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::debug;

use crate::config::Service;
use crate::error::AppError;

/// How long a provider stays skipped after a transport failure.
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(30);

/// Transient per-provider failure state. A marked provider is skipped by
/// the balancer until its cooldown deadline passes.
#[derive(Default)]
pub struct HealthRegistry {
    failed_until: RwLock<HashMap<String, AtomicI64>>,
}

impl HealthRegistry {
    pub fn mark_failed(&self, provider_id: &str) {
        let deadline = Utc::now().timestamp_millis() + FAILURE_COOLDOWN.as_millis() as i64;
        let guard = self.failed_until.read().expect("health lock poisoned");
        if let Some(entry) = guard.get(provider_id) {
            entry.fetch_max(deadline, Ordering::Relaxed);
            return;
        }
        drop(guard);
        self.failed_until
            .write()
            .expect("health lock poisoned")
            .entry(provider_id.to_string())
            .or_insert_with(|| AtomicI64::new(deadline))
            .fetch_max(deadline, Ordering::Relaxed);
    }

    pub fn is_failed(&self, provider_id: &str) -> bool {
        let guard = self.failed_until.read().expect("health lock poisoned");
        guard
            .get(provider_id)
            .is_some_and(|deadline| Utc::now().timestamp_millis() < deadline.load(Ordering::Relaxed))
    }
}

/// Weighted random draw among the active services. A draw landing on a
/// failed provider retries with that service excluded, up to the candidate
/// count, before giving up.
pub fn choose<'a>(
    services: &'a [Service],
    health: &HealthRegistry,
) -> Result<&'a Service, AppError> {
    let mut candidates: Vec<&Service> = services.iter().filter(|s| s.active).collect();
    if candidates.is_empty() {
        return Err(AppError::NoUpstreamAvailable);
    }

    let attempts = candidates.len();
    let mut rng = rand::thread_rng();
    for _ in 0..attempts {
        let total: u64 = candidates.iter().map(|s| u64::from(s.weight.max(1))).sum();
        let roll = rng.gen_range(0..total);
        let index = pick_weighted(&candidates, roll);
        let service = candidates[index];
        if !health.is_failed(&service.provider) {
            return Ok(service);
        }
        debug!("skipping unhealthy provider {}", service.provider);
        candidates.remove(index);
        if candidates.is_empty() {
            break;
        }
    }

    Err(AppError::NoUpstreamAvailable)
}

/// Cumulative-weight selection: `roll` must be uniform in [0, total).
/// Zero weights count as one so a misconfigured service stays reachable.
pub fn pick_weighted(candidates: &[&Service], roll: u64) -> usize {
    let mut cumulative = 0u64;
    for (index, service) in candidates.iter().enumerate() {
        cumulative += u64::from(service.weight.max(1));
        if roll < cumulative {
            return index;
        }
    }
    candidates.len().saturating_sub(1)
}
