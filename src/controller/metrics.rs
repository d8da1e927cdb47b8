//! Pipeline Metrics
//!
//! Cache-line aligned counters for the mutation pipeline, updated without
//! locks and read as a point-in-time snapshot.

use crate::error::ErrorKind;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of the mutation pipeline
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    /// Mutation requests received
    pub requests: AtomicU64,
    /// Volume definitions committed
    pub volume_definitions_created: AtomicU64,
    /// Requests rejected before commit, by class
    pub rejected_validation: AtomicU64,
    pub rejected_exhausted: AtomicU64,
    pub rejected_access: AtomicU64,
    pub rejected_crypto: AtomicU64,
    pub internal_faults: AtomicU64,
    /// Durable commits, including administrative operations
    pub commits: AtomicU64,
    /// Satellite updates
    pub satellite_updates_ok: AtomicU64,
    pub satellite_updates_failed: AtomicU64,
    /// Summed wait for locks, microseconds
    pub lock_wait_us: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn touch(&self) {
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    #[inline]
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_created(&self, count: u64) {
        self.volume_definitions_created
            .fetch_add(count, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_rejected(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::Validation => &self.rejected_validation,
            ErrorKind::ResourceExhausted => &self.rejected_exhausted,
            ErrorKind::AccessDenied => &self.rejected_access,
            ErrorKind::CryptoUnavailable => &self.rejected_crypto,
            ErrorKind::InternalFault => &self.internal_faults,
            ErrorKind::Propagation => &self.satellite_updates_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    #[inline]
    pub fn record_satellite_update(&self, ok: bool) {
        if ok {
            self.satellite_updates_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.satellite_updates_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    #[inline]
    pub fn record_lock_wait(&self, micros: u64) {
        self.lock_wait_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            volume_definitions_created: self.volume_definitions_created.load(Ordering::Relaxed),
            rejected_validation: self.rejected_validation.load(Ordering::Relaxed),
            rejected_exhausted: self.rejected_exhausted.load(Ordering::Relaxed),
            rejected_access: self.rejected_access.load(Ordering::Relaxed),
            rejected_crypto: self.rejected_crypto.load(Ordering::Relaxed),
            internal_faults: self.internal_faults.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            satellite_updates_ok: self.satellite_updates_ok.load(Ordering::Relaxed),
            satellite_updates_failed: self.satellite_updates_failed.load(Ordering::Relaxed),
            lock_wait_us: self.lock_wait_us.load(Ordering::Relaxed),
            last_update_ms: self.last_update_ms.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetricsSnapshot {
    pub requests: u64,
    pub volume_definitions_created: u64,
    pub rejected_validation: u64,
    pub rejected_exhausted: u64,
    pub rejected_access: u64,
    pub rejected_crypto: u64,
    pub internal_faults: u64,
    pub commits: u64,
    pub satellite_updates_ok: u64,
    pub satellite_updates_failed: u64,
    pub lock_wait_us: u64,
    pub last_update_ms: u64,
}

impl PipelineMetricsSnapshot {
    pub fn rejected_total(&self) -> u64 {
        self.rejected_validation
            + self.rejected_exhausted
            + self.rejected_access
            + self.rejected_crypto
            + self.internal_faults
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_request();
        metrics.record_created(3);
        metrics.record_rejected(ErrorKind::CryptoUnavailable);
        metrics.record_rejected(ErrorKind::Validation);
        metrics.record_satellite_update(true);
        metrics.record_satellite_update(false);
        metrics.record_commit();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.volume_definitions_created, 3);
        assert_eq!(snap.rejected_total(), 2);
        assert_eq!(snap.satellite_updates_ok, 1);
        assert_eq!(snap.satellite_updates_failed, 1);
        assert_eq!(snap.commits, 1);
        assert!(snap.last_update_ms > 0);
    }

    #[test]
    fn test_alignment() {
        assert_eq!(std::mem::align_of::<PipelineMetrics>(), 64);
    }
}
