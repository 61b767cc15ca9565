// src/core/aggregator.rs

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::debug;

use crate::core::models::ScanFinding;
use crate::core::report::{group_listed, ReportError, ReportRenderer};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("finding has an empty domain")]
    EmptyDomain,
    #[error("finding for {domain} has an empty scanner name")]
    EmptyScannerName { domain: String },
}

#[derive(Debug, Default)]
struct AggregationState {
    findings: Vec<ScanFinding>,
    domains_seen: HashSet<String>,
}

/// Shared store of findings for the current run.
///
/// Scanners write concurrently through `&self`; the orchestrator reads the report once
/// every scanner has returned and then clears the state for the next run.
#[derive(Debug, Default)]
pub struct ScanResultAggregator {
    state: Mutex<AggregationState>,
    renderer: ReportRenderer,
}

impl ScanResultAggregator {
    /// An aggregator producing the plain-text report.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_renderer(renderer: ReportRenderer) -> Self {
        Self {
            state: Mutex::default(),
            renderer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregationState> {
        // A panicking writer cannot leave a half-pushed finding behind, so the data
        // is still usable after poisoning.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_finding(&self, finding: ScanFinding) -> Result<(), AggregatorError> {
        if finding.domain.trim().is_empty() {
            return Err(AggregatorError::EmptyDomain);
        }
        if finding.scanner_name.trim().is_empty() {
            return Err(AggregatorError::EmptyScannerName {
                domain: finding.domain,
            });
        }

        debug!(
            domain = %finding.domain,
            scanner = %finding.scanner_name,
            listed = finding.is_listed,
            "Recording finding."
        );
        let mut state = self.lock();
        state.domains_seen.insert(finding.domain.clone());
        state.findings.push(finding);
        Ok(())
    }

    /// Renders the listed findings, or `None` when nothing is listed.
    pub fn build_report(&self) -> Result<Option<String>, ReportError> {
        let grouped = {
            let state = self.lock();
            group_listed(&state.findings)
        };
        self.renderer.render(&grouped)
    }

    /// Builds the report and clears the state in one step.
    ///
    /// The state is cleared even when rendering fails.
    pub fn take_report(&self) -> Result<Option<String>, ReportError> {
        let state = std::mem::take(&mut *self.lock());
        self.renderer.render(&group_listed(&state.findings))
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.findings.clear();
        state.domains_seen.clear();
    }

    pub fn finding_count(&self) -> usize {
        self.lock().findings.len()
    }

    pub fn domains_seen(&self) -> usize {
        self.lock().domains_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finding_count() == 0
    }
}
