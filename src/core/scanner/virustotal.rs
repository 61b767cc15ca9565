// src/core/scanner/virustotal.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{BlacklistScanner, ScanError, ScanPhase, ScanSummary};
use crate::core::aggregator::ScanResultAggregator;
use crate::core::models::{AnalysisHandle, AnalysisReport, AnalysisStats, AnalysisStatus, ScanFinding};
use crate::core::retry::{retry, sleep_with_cancellation, RetryError, RetryOutcome, RetryPolicy};

pub const VIRUSTOTAL_NAME: &str = "VirusTotal";
pub const VIRUSTOTAL_API_URL: &str = "https://www.virustotal.com/api/v3/";
const VIRUSTOTAL_GUI_URL: &str = "https://www.virustotal.com/gui/domain/";
const USER_AGENT: &str = concat!("dns-blm/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed provider response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("provider response has no analysis id")]
    MissingAnalysisId,
    #[error("invalid provider URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("provider base URL cannot carry a path")]
    InvalidBaseUrl,
    #[error("API key contains characters not allowed in a header")]
    InvalidApiKey,
}

// --- Provider API ---

/// The two calls of an analyse-then-poll provider.
#[async_trait]
pub trait AnalysisApi: Send + Sync {
    /// Requests a fresh analysis of `domain`.
    async fn submit(&self, domain: &str) -> Result<AnalysisHandle, ProviderError>;

    /// Fetches the current state of a submitted analysis.
    async fn poll(&self, handle: &AnalysisHandle) -> Result<AnalysisReport, ProviderError>;

    /// Human-viewable page backing a listed verdict.
    fn evidence_url(&self, domain: &str) -> Option<String>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct SubmitData {
    id: String,
}

#[derive(Deserialize)]
struct AnalysisData {
    attributes: AnalysisAttributes,
}

#[derive(Deserialize)]
struct AnalysisAttributes {
    status: String,
    #[serde(default)]
    stats: AnalysisStats,
}

/// Extracts the analysis id from a `POST /domains/{domain}/analyse` body.
pub fn parse_submit_response(body: &str) -> Result<AnalysisHandle, ProviderError> {
    let envelope: Envelope<SubmitData> = serde_json::from_str(body)?;
    let id = envelope.data.id.trim();
    if id.is_empty() {
        return Err(ProviderError::MissingAnalysisId);
    }
    Ok(AnalysisHandle(id.to_string()))
}

/// Extracts status and engine counts from a `GET /analyses/{id}` body.
pub fn parse_analysis_response(body: &str) -> Result<AnalysisReport, ProviderError> {
    let envelope: Envelope<AnalysisData> = serde_json::from_str(body)?;
    let attributes = envelope.data.attributes;
    Ok(AnalysisReport {
        status: AnalysisStatus::parse(&attributes.status),
        stats: attributes.stats,
    })
}

/// reqwest-backed client for the VirusTotal v3 API.
#[derive(Debug, Clone)]
pub struct VirusTotalClient {
    http: reqwest::Client,
    base_url: Url,
}

impl VirusTotalClient {
    pub fn new(api_key: &str) -> Result<Self, ProviderError> {
        Self::with_base_url(api_key, VIRUSTOTAL_API_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, ProviderError> {
        let mut key = HeaderValue::from_str(api_key).map_err(|_| ProviderError::InvalidApiKey)?;
        key.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert("x-apikey", key);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::InvalidBaseUrl);
        }
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::InvalidBaseUrl)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Reads the body of a response, turning non-2xx answers into `Status` errors.
    async fn read_body(response: reqwest::Response) -> Result<String, ProviderError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let body = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(ProviderError::Status { status, body });
        }
        Ok(body)
    }
}

#[async_trait]
impl AnalysisApi for VirusTotalClient {
    async fn submit(&self, domain: &str) -> Result<AnalysisHandle, ProviderError> {
        let url = self.endpoint(&["domains", domain, "analyse"])?;
        debug!(%url, "Submitting domain for analysis.");
        let response = self.http.post(url).send().await?;
        parse_submit_response(&Self::read_body(response).await?)
    }

    async fn poll(&self, handle: &AnalysisHandle) -> Result<AnalysisReport, ProviderError> {
        let url = self.endpoint(&["analyses", handle.as_str()])?;
        debug!(%url, "Polling analysis.");
        let response = self.http.get(url).send().await?;
        parse_analysis_response(&Self::read_body(response).await?)
    }

    fn evidence_url(&self, domain: &str) -> Option<String> {
        Some(format!("{VIRUSTOTAL_GUI_URL}{domain}"))
    }
}

// --- Polling Scanner ---

/// Attempt budgets and pacing for [`PollingProviderScanner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingSettings {
    /// Extra submit attempts after the first.
    pub submit_retries: usize,
    /// Extra poll attempts after the first.
    pub poll_retries: usize,
    /// Wait between a successful submit and the first poll.
    pub settle_delay: Duration,
    /// Domains analysed at the same time by one scanner.
    pub concurrency: usize,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            submit_retries: 3,
            poll_retries: 5,
            settle_delay: Duration::from_secs(15),
            concurrency: 2,
        }
    }
}

/// Where one domain's analysis currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AnalysisState {
    Submitting,
    Submitted(AnalysisHandle),
    Polling(AnalysisHandle),
    Finished(Verdict),
}

/// Terminal states. Only `Completed` produces a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Completed(AnalysisStats),
    Failed,
    Exhausted(ScanPhase),
}

/// Terminal poll statuses, carried as a successful retry outcome so that `failed`
/// stops the retry loop just like `completed` does.
enum PollVerdict {
    Completed(AnalysisStats),
    Failed,
}

enum DomainOutcome {
    Listed,
    Clean,
    Failed,
    Inconclusive,
    Errored,
    Cancelled,
}

/// Classifies domains through an asynchronous submit-then-poll provider.
pub struct PollingProviderScanner<A> {
    name: String,
    api: Arc<A>,
    settings: PollingSettings,
}

impl PollingProviderScanner<VirusTotalClient> {
    pub fn virustotal(api_key: &str, settings: PollingSettings) -> Result<Self, ProviderError> {
        Ok(Self::new(VIRUSTOTAL_NAME, VirusTotalClient::new(api_key)?, settings))
    }
}

impl<A: AnalysisApi> PollingProviderScanner<A> {
    pub fn new(name: &str, api: A, settings: PollingSettings) -> Self {
        Self {
            name: name.to_string(),
            api: Arc::new(api),
            settings,
        }
    }

    /// Drives one domain from submission to a terminal state.
    async fn analyse(
        &self,
        domain: &str,
        cancel: &CancellationToken,
    ) -> Result<Verdict, ScanError> {
        let mut state = AnalysisState::Submitting;
        loop {
            state = match state {
                AnalysisState::Submitting => {
                    let policy = RetryPolicy::new("submit", self.settings.submit_retries)
                        .with_cancellation(cancel)
                        .with_context(&self.name, domain);
                    let submitted = retry(policy, |attempt| async move {
                        debug!(domain, scanner = %self.name, attempt, "Submitting analysis.");
                        let handle = self.api.submit(domain).await?;
                        Ok::<_, ProviderError>(Some(RetryOutcome::Success(handle)))
                    })
                    .await
                    .map_err(|err| self.phase_error(domain, ScanPhase::Submit, err))?;
                    match submitted {
                        Some(handle) => AnalysisState::Submitted(handle),
                        None => AnalysisState::Finished(Verdict::Exhausted(ScanPhase::Submit)),
                    }
                }
                AnalysisState::Submitted(handle) => {
                    debug!(
                        domain,
                        scanner = %self.name,
                        analysis = %handle,
                        settle_ms = self.settings.settle_delay.as_millis() as u64,
                        "Analysis submitted; waiting before first poll."
                    );
                    sleep_with_cancellation::<ProviderError>(self.settings.settle_delay, Some(cancel))
                        .await
                        .map_err(|err| self.phase_error(domain, ScanPhase::Settle, err))?;
                    AnalysisState::Polling(handle)
                }
                AnalysisState::Polling(handle) => {
                    let policy = RetryPolicy::new("poll", self.settings.poll_retries)
                        .with_cancellation(cancel)
                        .with_context(&self.name, domain);
                    let handle_ref = &handle;
                    let verdict = retry(policy, |attempt| async move {
                        let report = self.api.poll(handle_ref).await?;
                        debug!(
                            domain,
                            scanner = %self.name,
                            attempt,
                            status = %report.status,
                            "Polled analysis."
                        );
                        let outcome = match report.status {
                            AnalysisStatus::Completed => {
                                Some(RetryOutcome::Success(PollVerdict::Completed(report.stats)))
                            }
                            AnalysisStatus::Failed => Some(RetryOutcome::Success(PollVerdict::Failed)),
                            _ => None,
                        };
                        Ok::<_, ProviderError>(outcome)
                    })
                    .await
                    .map_err(|err| self.phase_error(domain, ScanPhase::Poll, err))?;
                    match verdict {
                        Some(PollVerdict::Completed(stats)) => {
                            AnalysisState::Finished(Verdict::Completed(stats))
                        }
                        Some(PollVerdict::Failed) => AnalysisState::Finished(Verdict::Failed),
                        None => AnalysisState::Finished(Verdict::Exhausted(ScanPhase::Poll)),
                    }
                }
                AnalysisState::Finished(verdict) => return Ok(verdict),
            };
        }
    }

    fn phase_error(&self, domain: &str, phase: ScanPhase, err: RetryError<ProviderError>) -> ScanError {
        match err {
            RetryError::Cancelled => ScanError::Cancelled,
            RetryError::Operation(source) => ScanError::Provider {
                scanner: self.name.clone(),
                domain: domain.to_string(),
                phase,
                source,
            },
        }
    }

    /// Analyses one domain and records its finding when a verdict was reached.
    /// Never fails: every problem is logged and reduced to an outcome.
    async fn scan_domain(
        &self,
        domain: &str,
        aggregator: &ScanResultAggregator,
        cancel: &CancellationToken,
    ) -> DomainOutcome {
        let verdict = match self.analyse(domain, cancel).await {
            Ok(verdict) => verdict,
            Err(ScanError::Cancelled) => {
                debug!(domain, scanner = %self.name, "Analysis cancelled.");
                return DomainOutcome::Cancelled;
            }
            Err(err @ ScanError::Provider { phase, .. }) => {
                error!(domain, scanner = %self.name, %phase, error = %err, "Domain analysis aborted.");
                return DomainOutcome::Errored;
            }
        };

        let (finding, outcome) = match verdict {
            Verdict::Completed(stats) if stats.is_listed() => {
                warn!(
                    domain,
                    scanner = %self.name,
                    malicious = stats.malicious,
                    suspicious = stats.suspicious,
                    "Domain is listed."
                );
                let evidence = self.api.evidence_url(domain);
                (ScanFinding::listed(domain, &self.name, evidence), DomainOutcome::Listed)
            }
            Verdict::Completed(_) => {
                info!(domain, scanner = %self.name, "Domain is clean.");
                (ScanFinding::clean(domain, &self.name), DomainOutcome::Clean)
            }
            Verdict::Failed => {
                warn!(domain, scanner = %self.name, phase = %ScanPhase::Poll, "Provider reported the analysis as failed.");
                return DomainOutcome::Failed;
            }
            Verdict::Exhausted(phase) => {
                warn!(domain, scanner = %self.name, %phase, "Attempts exhausted; domain is inconclusive.");
                return DomainOutcome::Inconclusive;
            }
        };

        if let Err(err) = aggregator.add_finding(finding) {
            error!(domain, scanner = %self.name, error = %err, "Finding rejected by aggregator.");
            return DomainOutcome::Errored;
        }
        outcome
    }
}

#[async_trait]
impl<A: AnalysisApi + 'static> BlacklistScanner for PollingProviderScanner<A> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(
        &self,
        domains: &[String],
        aggregator: &ScanResultAggregator,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, ScanError> {
        info!(scanner = %self.name, domains = domains.len(), "Starting blacklist scan.");

        let pending: Vec<BoxFuture<'_, DomainOutcome>> = domains
            .iter()
            .map(|domain| self.scan_domain(domain, aggregator, cancel).boxed())
            .collect();
        let outcomes: Vec<DomainOutcome> = futures::stream::iter(pending)
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut summary = ScanSummary::default();
        for outcome in outcomes {
            match outcome {
                DomainOutcome::Listed => summary.listed += 1,
                DomainOutcome::Clean => summary.clean += 1,
                DomainOutcome::Failed => summary.failed += 1,
                DomainOutcome::Inconclusive => summary.inconclusive += 1,
                DomainOutcome::Errored => summary.errored += 1,
                DomainOutcome::Cancelled => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        info!(
            scanner = %self.name,
            listed = summary.listed,
            clean = summary.clean,
            failed = summary.failed,
            inconclusive = summary.inconclusive,
            errored = summary.errored,
            "Blacklist scan finished."
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted provider: every domain gets a fixed handle and a queue of poll answers.
    #[derive(Default)]
    struct ScriptedApi {
        submit_failures: Mutex<HashMap<String, usize>>,
        polls: Mutex<HashMap<String, VecDeque<Result<AnalysisReport, ProviderError>>>>,
        poll_calls: AtomicUsize,
    }

    impl ScriptedApi {
        fn with_polls(self, domain: &str, statuses: Vec<(AnalysisStatus, u32)>) -> Self {
            let queue = statuses
                .into_iter()
                .map(|(status, malicious)| {
                    Ok(AnalysisReport {
                        status,
                        stats: AnalysisStats { malicious, ..Default::default() },
                    })
                })
                .collect();
            self.polls.lock().unwrap().insert(domain.to_string(), queue);
            self
        }

        fn with_submit_failures(self, domain: &str, failures: usize) -> Self {
            self.submit_failures.lock().unwrap().insert(domain.to_string(), failures);
            self
        }
    }

    #[async_trait]
    impl AnalysisApi for ScriptedApi {
        async fn submit(&self, domain: &str) -> Result<AnalysisHandle, ProviderError> {
            let mut failures = self.submit_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(domain).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(ProviderError::MissingAnalysisId);
            }
            Ok(AnalysisHandle(domain.to_string()))
        }

        async fn poll(&self, handle: &AnalysisHandle) -> Result<AnalysisReport, ProviderError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            self.polls
                .lock()
                .unwrap()
                .get_mut(handle.as_str())
                .and_then(|queue| queue.pop_front())
                .unwrap_or(Ok(AnalysisReport {
                    status: AnalysisStatus::Queued,
                    stats: AnalysisStats::default(),
                }))
        }

        fn evidence_url(&self, domain: &str) -> Option<String> {
            Some(format!("https://provider.test/{domain}"))
        }
    }

    fn scanner(api: ScriptedApi) -> PollingProviderScanner<ScriptedApi> {
        PollingProviderScanner::new("Scripted", api, PollingSettings::default())
    }

    fn domains(names: &[&str]) -> Vec<String> {
        names.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn parses_submit_and_analysis_bodies() {
        let handle = parse_submit_response(r#"{"data":{"type":"analysis","id":"u-abc-123"}}"#).unwrap();
        assert_eq!(handle.as_str(), "u-abc-123");

        let report = parse_analysis_response(
            r#"{"data":{"attributes":{"status":"completed","date":1700000000,
                "stats":{"malicious":2,"suspicious":0,"undetected":60,"harmless":10,"timeout":0}}}}"#,
        )
        .unwrap();
        assert_eq!(report.status, AnalysisStatus::Completed);
        assert_eq!(report.stats.malicious, 2);
        assert_eq!(report.stats.harmless, 10);

        let queued = parse_analysis_response(r#"{"data":{"attributes":{"status":"queued"}}}"#).unwrap();
        assert_eq!(queued.status, AnalysisStatus::Queued);
        assert_eq!(queued.stats, AnalysisStats::default());
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert!(matches!(parse_submit_response("not json"), Err(ProviderError::Decode(_))));
        assert!(matches!(parse_submit_response(r#"{"data":{}}"#), Err(ProviderError::Decode(_))));
        assert!(matches!(
            parse_submit_response(r#"{"data":{"id":" "}}"#),
            Err(ProviderError::MissingAnalysisId)
        ));
        assert!(matches!(
            parse_analysis_response(r#"{"data":{"attributes":{}}}"#),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn client_builds_escaped_endpoints() {
        let client = VirusTotalClient::with_base_url("key", "https://vt.test/api/v3/").unwrap();
        assert_eq!(
            client.endpoint(&["domains", "example.com", "analyse"]).unwrap().as_str(),
            "https://vt.test/api/v3/domains/example.com/analyse"
        );
        assert_eq!(
            client.endpoint(&["analyses", "a/b"]).unwrap().as_str(),
            "https://vt.test/api/v3/analyses/a%2Fb"
        );
        assert_eq!(
            client.evidence_url("example.com").as_deref(),
            Some("https://www.virustotal.com/gui/domain/example.com")
        );
    }

    #[test]
    fn client_rejects_unusable_api_key() {
        assert!(matches!(
            VirusTotalClient::new("bad\nkey"),
            Err(ProviderError::InvalidApiKey)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_then_completed_yields_listed_finding() {
        let api = ScriptedApi::default().with_polls(
            "bad.example",
            vec![
                (AnalysisStatus::Queued, 0),
                (AnalysisStatus::Queued, 0),
                (AnalysisStatus::Completed, 1),
            ],
        );
        let scanner = scanner(api);
        let aggregator = ScanResultAggregator::new();

        let summary = scanner
            .scan(&domains(&["bad.example"]), &aggregator, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.listed, 1);
        assert_eq!(aggregator.finding_count(), 1);
        assert_eq!(scanner.api.poll_calls.load(Ordering::SeqCst), 3);
        let report = aggregator.build_report().unwrap().unwrap();
        assert!(report.contains("| Scripted: Listed"));
        assert!(report.contains("| URL: https://provider.test/bad.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_status_records_nothing_and_stops_polling() {
        let api = ScriptedApi::default().with_polls(
            "flaky.example",
            vec![(AnalysisStatus::Queued, 0), (AnalysisStatus::Failed, 0)],
        );
        let scanner = scanner(api);
        let aggregator = ScanResultAggregator::new();

        let summary = scanner
            .scan(&domains(&["flaky.example"]), &aggregator, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert!(aggregator.is_empty());
        assert_eq!(scanner.api.poll_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_completing_domain_is_inconclusive() {
        let scanner = scanner(ScriptedApi::default());
        let aggregator = ScanResultAggregator::new();

        let summary = scanner
            .scan(&domains(&["slow.example"]), &aggregator, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.inconclusive, 1);
        assert!(aggregator.is_empty());
        assert_eq!(
            scanner.api.poll_calls.load(Ordering::SeqCst),
            PollingSettings::default().poll_retries + 1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clean_completion_records_unlisted_finding() {
        let api = ScriptedApi::default()
            .with_polls("ok.example", vec![(AnalysisStatus::Completed, 0)]);
        let scanner = scanner(api);
        let aggregator = ScanResultAggregator::new();

        let summary = scanner
            .scan(&domains(&["ok.example"]), &aggregator, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.clean, 1);
        assert_eq!(aggregator.finding_count(), 1);
        assert_eq!(aggregator.build_report().unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn submit_failures_are_retried_then_isolated() {
        let api = ScriptedApi::default()
            .with_submit_failures("retry.example", 2)
            .with_polls("retry.example", vec![(AnalysisStatus::Completed, 1)])
            .with_submit_failures("broken.example", 10)
            .with_polls("fine.example", vec![(AnalysisStatus::Completed, 0)]);
        let scanner = scanner(api);
        let aggregator = ScanResultAggregator::new();

        let summary = scanner
            .scan(
                &domains(&["retry.example", "broken.example", "fine.example"]),
                &aggregator,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.listed, 1);
        assert_eq!(summary.clean, 1);
        assert_eq!(summary.errored, 1);
        let report = aggregator.build_report().unwrap().unwrap();
        assert!(report.contains("retry.example"));
        assert!(!report.contains("broken.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_scan() {
        let scanner = scanner(ScriptedApi::default());
        let aggregator = ScanResultAggregator::new();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = scanner
            .scan(&domains(&["a.example", "b.example", "c.example"]), &aggregator, &token)
            .await;

        assert!(matches!(result, Err(ScanError::Cancelled)));
        assert!(aggregator.is_empty());
    }
    #[tokio::test(start_paused = true)]
    async fn unknown_status_is_logged_and_polled_again() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);
        let api = ScriptedApi::default().with_polls(
            "odd.example",
            vec![(AnalysisStatus::parse("warming-up"), 0), (AnalysisStatus::Completed, 1)],
        );
        let scanner = scanner(api);
        let aggregator = ScanResultAggregator::new();

        let summary = scanner
            .scan(&domains(&["odd.example"]), &aggregator, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.listed, 1);
        assert_eq!(scanner.api.poll_calls.load(Ordering::SeqCst), 2);
    }

    /// Accepts every submission; polls never answer.
    struct HangingApi;

    #[async_trait]
    impl AnalysisApi for HangingApi {
        async fn submit(&self, domain: &str) -> Result<AnalysisHandle, ProviderError> {
            Ok(AnalysisHandle(domain.to_string()))
        }

        async fn poll(&self, _handle: &AnalysisHandle) -> Result<AnalysisReport, ProviderError> {
            std::future::pending().await
        }

        fn evidence_url(&self, _domain: &str) -> Option<String> {
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_request_in_flight() {
        let scanner = PollingProviderScanner::new("Hanging", HangingApi, PollingSettings::default());
        let aggregator = ScanResultAggregator::new();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            canceller.cancel();
        });
        let started = tokio::time::Instant::now();

        let result = scanner
            .scan(&domains(&["slow.example", "slower.example"]), &aggregator, &token)
            .await;

        assert!(matches!(result, Err(ScanError::Cancelled)));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert!(aggregator.is_empty());
    }

    /// Records how many submit and poll calls overlap.
    #[derive(Default)]
    struct TrackingApi {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TrackingApi {
        async fn occupy(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AnalysisApi for TrackingApi {
        async fn submit(&self, domain: &str) -> Result<AnalysisHandle, ProviderError> {
            self.occupy().await;
            Ok(AnalysisHandle(domain.to_string()))
        }

        async fn poll(&self, _handle: &AnalysisHandle) -> Result<AnalysisReport, ProviderError> {
            self.occupy().await;
            Ok(AnalysisReport {
                status: AnalysisStatus::Completed,
                stats: AnalysisStats::default(),
            })
        }

        fn evidence_url(&self, _domain: &str) -> Option<String> {
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn domains_in_flight_never_exceed_concurrency() {
        let settings = PollingSettings {
            concurrency: 2,
            ..PollingSettings::default()
        };
        let scanner = PollingProviderScanner::new("Tracking", TrackingApi::default(), settings);
        let aggregator = ScanResultAggregator::new();
        let names = ["a.example", "b.example", "c.example", "d.example", "e.example", "f.example"];

        let summary = scanner
            .scan(&domains(&names), &aggregator, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.clean, names.len());
        assert_eq!(scanner.api.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(scanner.api.peak.load(Ordering::SeqCst), settings.concurrency);
    }
}
