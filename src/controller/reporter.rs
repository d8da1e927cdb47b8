//! Error Reporter
//!
//! Files diagnostic reports for internal faults. Each report gets an id of
//! the form `<boot stamp>-<counter>` that is handed back to the caller in
//! the response entry, so an operator can look the report up later.

use crate::error::Error;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::error::Error as _;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

/// Reports kept in memory before the oldest are dropped
pub const DEFAULT_REPORT_RETENTION: usize = 1000;

/// One filed report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// What the controller was doing
    pub context: String,
    pub message: String,
    /// Messages of the error and its sources, outermost first
    pub chain: Vec<String>,
}

/// Diagnostic report sink
#[derive(Debug)]
pub struct ErrorReporter {
    instance: String,
    counter: AtomicU64,
    retention: usize,
    reports: Mutex<VecDeque<ErrorReport>>,
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_RETENTION)
    }
}

impl ErrorReporter {
    pub fn new(retention: usize) -> Self {
        let stamp = (Utc::now().timestamp() as u64) & 0xFFFF_FFFF;
        Self {
            instance: format!("{:08X}", stamp),
            counter: AtomicU64::new(0),
            retention: retention.max(1),
            reports: Mutex::new(VecDeque::new()),
        }
    }

    /// Boot stamp shared by all ids of this process
    pub fn instance_id(&self) -> &str {
        &self.instance
    }

    /// File a report and return its id
    pub fn report(&self, context: &str, err: &Error) -> String {
        let nr = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{}-{:06}", self.instance, nr);

        let mut chain = vec![err.to_string()];
        let mut source = err.source();
        while let Some(inner) = source {
            chain.push(inner.to_string());
            source = inner.source();
        }

        error!(report_id = %id, context, error = %err, "Internal fault reported");

        let report = ErrorReport {
            id: id.clone(),
            timestamp: Utc::now(),
            context: context.to_string(),
            message: err.to_string(),
            chain,
        };
        let mut reports = self.reports.lock();
        if reports.len() >= self.retention {
            reports.pop_front();
        }
        reports.push_back(report);
        id
    }

    pub fn get(&self, id: &str) -> Option<ErrorReport> {
        self.reports.lock().iter().find(|r| r.id == id).cloned()
    }

    /// Most recent reports, newest last
    pub fn recent(&self, limit: usize) -> Vec<ErrorReport> {
        let reports = self.reports.lock();
        let skip = reports.len().saturating_sub(limit);
        reports.iter().skip(skip).cloned().collect()
    }

    pub fn report_count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_retrievable() {
        let reporter = ErrorReporter::default();
        let a = reporter.report("create", &Error::Internal("boom".into()));
        let b = reporter.report("create", &Error::Internal("bang".into()));
        assert_ne!(a, b);
        assert!(a.starts_with(reporter.instance_id()));
        assert!(a.ends_with("-000001"));

        let report = reporter.get(&b).unwrap();
        assert_eq!(report.message, "Internal error: bang");
        assert_eq!(reporter.report_count(), 2);
    }

    #[test]
    fn test_chain_includes_sources() {
        let reporter = ErrorReporter::default();
        let err = Error::Internal("inner".into()).in_volume_definition("rsc1", Some(0));
        let id = reporter.report("create", &err);
        let report = reporter.get(&id).unwrap();
        assert_eq!(report.chain.len(), 2);
        assert_eq!(report.chain[1], "Internal error: inner");
    }

    #[test]
    fn test_retention() {
        let reporter = ErrorReporter::new(2);
        let first = reporter.report("x", &Error::Internal("1".into()));
        reporter.report("x", &Error::Internal("2".into()));
        reporter.report("x", &Error::Internal("3".into()));
        assert!(reporter.get(&first).is_none());
        assert_eq!(reporter.recent(10).len(), 2);
    }
}
