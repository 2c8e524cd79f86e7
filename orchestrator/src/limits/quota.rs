//! Fixed-window daily quota keyed by (organization, metric, UTC day).
//!
//! Counters are incremented before they are compared, so a rejected call
//! still counts: the stored total may end up above the limit.

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::AdmissionError;

/// Counters outlive their day so late reads near midnight still see them.
const COUNTER_TTL_HOURS: i64 = 36;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QuotaKey {
    org_id: String,
    metric: String,
    day: NaiveDate,
}

#[derive(Debug, Clone, Copy)]
struct QuotaCounter {
    value: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct QuotaEnforcer {
    counters: Arc<DashMap<QuotaKey, QuotaCounter>>,
}

impl QuotaEnforcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to today's counter and return the new total.
    pub fn add(
        &self,
        org_id: &str,
        metric: &str,
        delta: u64,
        limit: u64,
    ) -> Result<u64, AdmissionError> {
        self.add_at(org_id, metric, delta, limit, Utc::now())
    }

    pub fn add_at(
        &self,
        org_id: &str,
        metric: &str,
        delta: u64,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, AdmissionError> {
        let expires_at = now + TimeDelta::hours(COUNTER_TTL_HOURS);
        let total = {
            let mut counter = self
                .counters
                .entry(key(org_id, metric, now))
                .or_insert(QuotaCounter {
                    value: 0,
                    expires_at,
                });
            if counter.expires_at <= now {
                counter.value = 0;
                counter.expires_at = expires_at;
            }
            counter.value = counter.value.saturating_add(delta);
            counter.value
        };

        if total > limit {
            tracing::info!(
                org_id = %org_id,
                metric = %metric,
                total,
                limit,
                "Quota exceeded"
            );
            return Err(AdmissionError::QuotaExceeded {
                org_id: org_id.to_string(),
                metric: metric.to_string(),
                total,
                limit,
            });
        }
        Ok(total)
    }

    /// Today's counter value; zero when absent or expired.
    pub fn get(&self, org_id: &str, metric: &str) -> u64 {
        self.get_at(org_id, metric, Utc::now())
    }

    pub fn get_at(&self, org_id: &str, metric: &str, now: DateTime<Utc>) -> u64 {
        self.counters
            .get(&key(org_id, metric, now))
            .filter(|counter| counter.expires_at > now)
            .map(|counter| counter.value)
            .unwrap_or(0)
    }

    /// Drop expired counters. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| counter.expires_at > now);
        before.saturating_sub(self.counters.len())
    }
}

fn key(org_id: &str, metric: &str, now: DateTime<Utc>) -> QuotaKey {
    QuotaKey {
        org_id: org_id.to_string(),
        metric: metric.to_string(),
        day: now.date_naive(),
    }
}
