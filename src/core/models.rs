// src/core/models.rs

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// --- Findings ---

/// One scanner's verdict for one domain.
///
/// A finding is created by a scanner once a terminal verdict has been reached and is
/// owned by the aggregator after submission. `evidence_url` is only set for listed
/// domains; use the constructors to keep that invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFinding {
    pub domain: String,
    pub scanner_name: String,
    pub is_listed: bool,
    pub evidence_url: Option<String>,
}

impl ScanFinding {
    /// A finding for a domain the provider reported on at least one blacklist.
    pub fn listed(domain: &str, scanner_name: &str, evidence_url: Option<String>) -> Self {
        Self {
            domain: domain.to_string(),
            scanner_name: scanner_name.to_string(),
            is_listed: true,
            evidence_url,
        }
    }

    /// A finding for a domain the provider analysed and considered clean.
    pub fn clean(domain: &str, scanner_name: &str) -> Self {
        Self {
            domain: domain.to_string(),
            scanner_name: scanner_name.to_string(),
            is_listed: false,
            evidence_url: None,
        }
    }
}

// --- Provider Analysis ---

/// Correlation id returned by a provider's submit call and required to poll it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnalysisHandle(pub String);

impl AnalysisHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AnalysisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a provider-side analysis as reported by the poll endpoint.
///
/// Unknown values deserialize to `Pending` so a provider adding new intermediate
/// states keeps being polled instead of failing the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum AnalysisStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    /// Any status not listed above; parsing falls back to it.
    Pending,
}

impl AnalysisStatus {
    pub fn parse(raw: &str) -> Self {
        raw.trim()
            .to_ascii_lowercase()
            .parse()
            .unwrap_or(AnalysisStatus::Pending)
    }
}

/// Engine counts reported by a completed analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisStats {
    #[serde(default)]
    pub malicious: u32,
    #[serde(default)]
    pub suspicious: u32,
    #[serde(default)]
    pub undetected: u32,
    #[serde(default)]
    pub harmless: u32,
    #[serde(default)]
    pub timeout: u32,
}

impl AnalysisStats {
    /// A domain counts as listed as soon as one engine flags it malicious or suspicious.
    pub fn is_listed(&self) -> bool {
        self.malicious > 0 || self.suspicious > 0
    }
}

/// One poll response, reduced to what the scanner state machine needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisReport {
    pub status: AnalysisStatus,
    pub stats: AnalysisStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_handles_known_and_unknown_values() {
        assert_eq!(AnalysisStatus::parse("completed"), AnalysisStatus::Completed);
        assert_eq!(AnalysisStatus::parse("Failed"), AnalysisStatus::Failed);
        assert_eq!(AnalysisStatus::parse("queued"), AnalysisStatus::Queued);
        assert_eq!(AnalysisStatus::parse("in-progress"), AnalysisStatus::InProgress);
        assert_eq!(AnalysisStatus::parse("warming-up"), AnalysisStatus::Pending);
    }

    #[test]
    fn every_status_formats_for_logging() {
        assert_eq!(AnalysisStatus::parse("warming-up").to_string(), "pending");
        assert_eq!(AnalysisStatus::InProgress.to_string(), "in-progress");
        assert_eq!(AnalysisStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn stats_listing_threshold() {
        assert!(!AnalysisStats::default().is_listed());
        assert!(AnalysisStats { suspicious: 1, ..Default::default() }.is_listed());
        assert!(AnalysisStats { malicious: 3, ..Default::default() }.is_listed());
    }

    #[test]
    fn clean_findings_carry_no_evidence() {
        let finding = ScanFinding::clean("ok.example", "VirusTotal");
        assert!(!finding.is_listed);
        assert!(finding.evidence_url.is_none());
    }
}
