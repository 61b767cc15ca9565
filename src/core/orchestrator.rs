// src/core/orchestrator.rs

use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::eyre;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::aggregator::ScanResultAggregator;
use crate::core::notifier::{NotificationDispatcher, NotifyError, REPORT_SUBJECT};
use crate::core::report::ReportError;
use crate::core::scanner::{BlacklistScanner, ScanError, ScanSummary};
use crate::core::scheduler::ScheduledTask;

/// Result returned when no configured domain is listed anywhere.
pub const NO_FINDINGS: &str = "No blacklisted domains found.";

/// Name of the scheduled scan in the `timed_tasks` configuration.
pub const SCAN_TASK_NAME: &str = "scan_blacklist_providers";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("scan run cancelled")]
    Cancelled,
    #[error("failed to render report: {0}")]
    Report(#[from] ReportError),
    #[error("failed to deliver report: {0}")]
    Notify(#[from] NotifyError),
    #[error("notification requested but no notifier is configured")]
    NotifierMissing,
}

/// Runs every registered scanner over a domain list and turns the shared findings
/// into one report.
pub struct ScanOrchestrator {
    scanners: Vec<Arc<dyn BlacklistScanner>>,
    aggregator: Arc<ScanResultAggregator>,
    notifier: Option<Arc<NotificationDispatcher>>,
    // Runs share the aggregator, so they must not overlap.
    run_guard: Mutex<()>,
}

impl ScanOrchestrator {
    pub fn new(aggregator: Arc<ScanResultAggregator>) -> Self {
        Self {
            scanners: Vec::new(),
            aggregator,
            notifier: None,
            run_guard: Mutex::new(()),
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn BlacklistScanner>) -> Self {
        self.scanners.push(scanner);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<NotificationDispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Performs one scan run.
    ///
    /// # Arguments
    /// * `domains` - Domains handed to every scanner.
    /// * `notify_on_completion` - Deliver a non-empty report through the notifier.
    /// * `cancel` - Run-scoped token, propagated into every scanner.
    ///
    /// # Returns
    /// The rendered report, or [`NO_FINDINGS`] when nothing is listed. The aggregator
    /// is empty again once this returns, whatever the outcome.
    pub async fn run(
        &self,
        domains: &[String],
        notify_on_completion: bool,
        cancel: &CancellationToken,
    ) -> Result<String, OrchestratorError> {
        let _guard = self.run_guard.lock().await;
        info!(
            domains = domains.len(),
            scanners = self.scanners.len(),
            notify = notify_on_completion,
            "Starting scan run."
        );

        self.run_scanners(domains, cancel).await;

        if cancel.is_cancelled() {
            self.aggregator.reset();
            warn!("Scan run cancelled; findings discarded.");
            return Err(OrchestratorError::Cancelled);
        }

        let Some(report) = self.aggregator.take_report()? else {
            info!("Scan run finished; no domain is listed.");
            return Ok(NO_FINDINGS.to_string());
        };

        info!(report_bytes = report.len(), "Scan run finished with listed domains.");
        if notify_on_completion {
            let notifier = self.notifier.as_ref().ok_or(OrchestratorError::NotifierMissing)?;
            notifier.notify(REPORT_SUBJECT, &report, cancel).await?;
        }
        Ok(report)
    }

    /// Runs all scanners concurrently and waits for every one of them.
    ///
    /// A scanner that errors or panics is logged and does not affect the others.
    async fn run_scanners(&self, domains: &[String], cancel: &CancellationToken) {
        let domains: Arc<[String]> = Arc::from(domains);
        let mut tasks = JoinSet::new();

        for scanner in &self.scanners {
            let scanner = Arc::clone(scanner);
            let aggregator = Arc::clone(&self.aggregator);
            let domains = Arc::clone(&domains);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let name = scanner.name().to_string();
                let result = scanner.scan(&domains, &aggregator, &cancel).await;
                (name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((scanner, Ok(summary))) => log_summary(&scanner, &summary),
                Ok((scanner, Err(ScanError::Cancelled))) => {
                    warn!(%scanner, "Scanner stopped by cancellation.");
                }
                Ok((scanner, Err(err))) => error!(%scanner, error = %err, "Scanner failed."),
                Err(join_err) => error!(error = %join_err, "Scanner task panicked."),
            }
        }
    }
}

fn log_summary(scanner: &str, summary: &ScanSummary) {
    info!(
        %scanner,
        listed = summary.listed,
        clean = summary.clean,
        failed = summary.failed,
        inconclusive = summary.inconclusive,
        errored = summary.errored,
        "Scanner finished."
    );
}

/// The recurring scan: scans the configured domains and mails the report.
pub struct ScheduledScan {
    orchestrator: Arc<ScanOrchestrator>,
    domains: Vec<String>,
}

impl ScheduledScan {
    pub fn new(orchestrator: Arc<ScanOrchestrator>, domains: Vec<String>) -> Self {
        Self { orchestrator, domains }
    }
}

#[async_trait]
impl ScheduledTask for ScheduledScan {
    async fn run(&self, cancel: CancellationToken) -> eyre::Result<()> {
        let result = self.orchestrator.run(&self.domains, true, &cancel).await?;
        info!(result_bytes = result.len(), "Scheduled scan completed.");
        Ok(())
    }
}
