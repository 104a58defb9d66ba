use serde::Serialize;
use std::collections::VecDeque;

use super::{DiagnosticResult, StepStatus};
use crate::config::DIAGNOSTICS_JOURNAL_SIZE;

/// A completed run as recorded by the server.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub id: String,
    pub target: Option<String>,
    pub overall: StepStatus,
    pub result: DiagnosticResult,
}

/// Bounded in-memory record of recent runs. Oldest entries fall off first.
pub struct DiagnosticsJournal {
    reports: VecDeque<DiagnosticReport>,
    capacity: usize,
}

impl DiagnosticsJournal {
    pub fn new() -> Self {
        Self::with_capacity(DIAGNOSTICS_JOURNAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            reports: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, target: Option<String>, result: DiagnosticResult) -> DiagnosticReport {
        if self.reports.len() >= self.capacity {
            self.reports.pop_front();
        }
        let report = DiagnosticReport {
            id: uuid::Uuid::new_v4().to_string(),
            target,
            overall: result.overall_status(),
            result,
        };
        self.reports.push_back(report.clone());
        report
    }

    /// Newest first.
    pub fn recent(&self, limit: usize, status: Option<StepStatus>) -> Vec<DiagnosticReport> {
        let iter = self.reports.iter().rev();
        match status {
            Some(status) => iter
                .filter(|r| r.overall == status)
                .take(limit)
                .cloned()
                .collect(),
            None => iter.take(limit).cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn clear(&mut self) {
        self.reports.clear();
    }
}

impl Default for DiagnosticsJournal {
    fn default() -> Self {
        Self::new()
    }
}
