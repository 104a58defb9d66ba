//! Ordered network/VPN health checks.
//!
//! A run walks six fixed steps and yields each one as soon as it reaches a
//! terminal status. Failure of one step never short-circuits the others.

pub mod journal;
pub mod pipeline;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use journal::{DiagnosticReport, DiagnosticsJournal};
pub use pipeline::{DiagnosticPipeline, PipelineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepName {
    NetworkConnectivity,
    DnsResolution,
    ApiReachability,
    VpnTcpHandshake,
    TlsHandshake,
    FullTunnel,
}

impl StepName {
    /// Execution order of a pipeline run.
    pub const ALL: [StepName; 6] = [
        StepName::NetworkConnectivity,
        StepName::DnsResolution,
        StepName::ApiReachability,
        StepName::VpnTcpHandshake,
        StepName::TlsHandshake,
        StepName::FullTunnel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::NetworkConnectivity => "network-connectivity",
            StepName::DnsResolution => "dns-resolution",
            StepName::ApiReachability => "api-reachability",
            StepName::VpnTcpHandshake => "vpn-tcp-handshake",
            StepName::TlsHandshake => "tls-handshake",
            StepName::FullTunnel => "full-tunnel",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepName::NetworkConnectivity => "Network connectivity",
            StepName::DnsResolution => "DNS resolution",
            StepName::ApiReachability => "API reachability",
            StepName::VpnTcpHandshake => "VPN TCP handshake",
            StepName::TlsHandshake => "TLS handshake",
            StepName::FullTunnel => "Full tunnel",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Warning,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failed | StepStatus::Warning
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Warning => "warning",
        }
    }
}

/// Terminal classification of a probe, produced by each step runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub message: String,
    pub suggestion: Option<String>,
}

impl StepOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Success,
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn failed(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn warning(message: impl Into<String>, suggestion: Option<String>) -> Self {
        Self {
            status: StepStatus::Warning,
            message: message.into(),
            suggestion,
        }
    }
}

/// One probe's outcome. Transitions are consuming, so a terminal step can
/// only be replaced, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticStep {
    name: StepName,
    status: StepStatus,
    duration_ms: Option<u64>,
    message: Option<String>,
    suggestion: Option<String>,
}

impl DiagnosticStep {
    pub fn pending(name: StepName) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            duration_ms: None,
            message: None,
            suggestion: None,
        }
    }

    pub fn start(self) -> Self {
        debug_assert_eq!(self.status, StepStatus::Pending, "step {} restarted", self.name);
        Self {
            status: StepStatus::Running,
            ..self
        }
    }

    pub fn finish(self, outcome: StepOutcome, elapsed: Duration) -> Self {
        debug_assert_eq!(self.status, StepStatus::Running, "step {} not running", self.name);
        debug_assert!(outcome.status.is_terminal());
        Self {
            name: self.name,
            status: outcome.status,
            duration_ms: Some(elapsed.as_millis() as u64),
            message: Some(outcome.message),
            suggestion: outcome.suggestion,
        }
    }

    pub fn name(&self) -> StepName {
        self.name
    }

    pub fn status(&self) -> StepStatus {
        self.status
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn suggestion(&self) -> Option<&str> {
        self.suggestion.as_deref()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }
}

/// Aggregate of a pipeline run: exactly six terminal steps in fixed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticResult {
    pub steps: Vec<DiagnosticStep>,
    pub ran_at: DateTime<Utc>,
    pub total_duration_ms: u64,
}

impl DiagnosticResult {
    /// Aggregate the steps of a run that started at `ran_at` and took `elapsed`.
    pub fn new(steps: Vec<DiagnosticStep>, ran_at: DateTime<Utc>, elapsed: Duration) -> Self {
        Self {
            steps,
            ran_at,
            total_duration_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_millis(self.total_duration_ms)
    }

    pub fn step(&self, name: StepName) -> Option<&DiagnosticStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Worst terminal status across the run: failed, then warning, then success.
    pub fn overall_status(&self) -> StepStatus {
        if self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            StepStatus::Failed
        } else if self.steps.iter().any(|s| s.status == StepStatus::Warning) {
            StepStatus::Warning
        } else {
            StepStatus::Success
        }
    }

    pub fn failed_steps(&self) -> Vec<&DiagnosticStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .collect()
    }

    pub fn summary(&self) -> String {
        let count = |status| self.steps.iter().filter(|s| s.status == status).count();
        format!(
            "{} passed, {} warnings, {} failed in {}ms",
            count(StepStatus::Success),
            count(StepStatus::Warning),
            count(StepStatus::Failed),
            self.total_duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(name: StepName, status: StepStatus) -> DiagnosticStep {
        let outcome = StepOutcome {
            status,
            message: "m".to_string(),
            suggestion: None,
        };
        DiagnosticStep::pending(name)
            .start()
            .finish(outcome, Duration::from_millis(5))
    }

    #[test]
    fn test_step_lifecycle() {
        let step = DiagnosticStep::pending(StepName::DnsResolution);
        assert_eq!(step.status, StepStatus::Pending);
        assert!(!step.is_terminal());

        let step = step.start();
        assert_eq!(step.status, StepStatus::Running);

        let step = step.finish(
            StepOutcome::failed("no dns", "check dns"),
            Duration::from_millis(42),
        );
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.duration_ms, Some(42));
        assert_eq!(step.suggestion.as_deref(), Some("check dns"));
        assert!(step.is_terminal());
    }

    #[test]
    fn test_step_names_serialize_kebab_case() {
        let names: Vec<String> = StepName::ALL
            .iter()
            .map(|n| serde_json::to_value(n).unwrap().as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "network-connectivity",
                "dns-resolution",
                "api-reachability",
                "vpn-tcp-handshake",
                "tls-handshake",
                "full-tunnel",
            ]
        );
        for name in StepName::ALL {
            assert_eq!(serde_json::to_value(name).unwrap(), name.as_str());
        }
    }

    #[test]
    fn test_overall_status() {
        let mut result = DiagnosticResult::new(
            StepName::ALL
                .iter()
                .map(|n| finished(*n, StepStatus::Success))
                .collect(),
            Utc::now(),
            Duration::from_millis(30),
        );
        assert_eq!(result.overall_status(), StepStatus::Success);

        result.steps[3] = finished(StepName::VpnTcpHandshake, StepStatus::Warning);
        assert_eq!(result.overall_status(), StepStatus::Warning);

        result.steps[1] = finished(StepName::DnsResolution, StepStatus::Failed);
        assert_eq!(result.overall_status(), StepStatus::Failed);
        assert_eq!(result.failed_steps().len(), 1);
        assert_eq!(result.summary(), "4 passed, 1 warnings, 1 failed in 30ms");
    }

    #[test]
    fn test_result_new_records_elapsed() {
        let steps = vec![finished(StepName::NetworkConnectivity, StepStatus::Success)];
        let result = DiagnosticResult::new(steps, Utc::now(), Duration::from_micros(1_500_900));
        assert_eq!(result.total_duration_ms, 1500);
        assert_eq!(result.total_duration(), Duration::from_millis(1500));
        assert_eq!(result.steps[0].name(), StepName::NetworkConnectivity);
        assert_eq!(result.steps[0].message(), Some("m"));
        assert_eq!(result.steps[0].duration_ms(), Some(5));
    }

    #[test]
    fn test_step_equality_is_structural() {
        let a = finished(StepName::FullTunnel, StepStatus::Warning);
        let b = finished(StepName::FullTunnel, StepStatus::Warning);
        assert_eq!(a, b);

        let c = finished(StepName::FullTunnel, StepStatus::Failed);
        assert_ne!(a, c);
    }
}
