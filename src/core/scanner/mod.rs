// src/core/scanner/mod.rs

// Public interface for the `scanner` module: the scanner trait, its error and
// summary types, and the provider-backed implementations.
pub mod virustotal;

use async_trait::async_trait;
use strum::Display;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::aggregator::ScanResultAggregator;

pub use self::virustotal::{
    AnalysisApi, PollingProviderScanner, PollingSettings, ProviderError, VirusTotalClient,
};

/// Step of the per-domain protocol an error or outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ScanPhase {
    Submit,
    Settle,
    Poll,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan cancelled")]
    Cancelled,
    #[error("{scanner} failed during {phase} for {domain}: {source}")]
    Provider {
        scanner: String,
        domain: String,
        phase: ScanPhase,
        #[source]
        source: ProviderError,
    },
}

/// Per-scanner tally for one run, used for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub listed: usize,
    pub clean: usize,
    pub failed: usize,
    pub inconclusive: usize,
    pub errored: usize,
}

/// A blacklist provider that can classify domains.
///
/// Implementations write one finding per domain that reached a verdict into the
/// aggregator. Failures for individual domains are handled inside `scan`; only
/// cancellation ends a scan early.
#[async_trait]
pub trait BlacklistScanner: Send + Sync {
    fn name(&self) -> &str;

    async fn scan(
        &self,
        domains: &[String],
        aggregator: &ScanResultAggregator,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, ScanError>;
}
