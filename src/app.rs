// src/app.rs

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{AppConfig, ConfigError};
use crate::core::aggregator::ScanResultAggregator;
use crate::core::notifier::{NotificationDispatcher, NotifyError, SmtpChannel};
use crate::core::orchestrator::{OrchestratorError, ScanOrchestrator, ScheduledScan, SCAN_TASK_NAME};
use crate::core::scanner::{PollingProviderScanner, ProviderError};
use crate::core::scheduler::{Clock, RecurringTaskScheduler, ScheduleError, ScheduledTask, SystemClock};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to set up scanner: {0}")]
    Provider(#[from] ProviderError),
    #[error("failed to set up notifications: {0}")]
    Notify(#[from] NotifyError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("no task named {0:?} is known")]
    UnknownTask(String),
    #[error("scheduler for {task:?} stopped unexpectedly: {source}")]
    SchedulerJoin {
        task: String,
        #[source]
        source: tokio::task::JoinError,
    },
}

/// The wired-up service: configuration plus every collaborator built from it.
pub struct App {
    config: AppConfig,
    domains: Vec<String>,
    orchestrator: Arc<ScanOrchestrator>,
    clock: Arc<dyn Clock>,
}

impl App {
    /// Builds the VirusTotal scanner, the SMTP notifier and the orchestrator.
    pub fn from_config(config: AppConfig) -> Result<Self, AppError> {
        let renderer = config.report_renderer().map_err(ConfigError::from)?;
        let aggregator = Arc::new(ScanResultAggregator::with_renderer(renderer));

        let scanner = PollingProviderScanner::virustotal(
            &config.api_credentials.virus_total,
            config.virustotal.polling_settings(),
        )?;
        let channel = SmtpChannel::new(&config.mail_settings())?;
        let notifier = NotificationDispatcher::new(Arc::new(channel));

        let orchestrator = ScanOrchestrator::new(aggregator)
            .with_scanner(Arc::new(scanner))
            .with_notifier(Arc::new(notifier));

        Ok(Self::new(config, orchestrator, Arc::new(SystemClock)))
    }

    pub fn new(config: AppConfig, orchestrator: ScanOrchestrator, clock: Arc<dyn Clock>) -> Self {
        let domains = config.normalized_domains();
        Self {
            config,
            domains,
            orchestrator: Arc::new(orchestrator),
            clock,
        }
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// On-demand scan. The result is returned, never mailed.
    pub async fn scan_now(&self, cancel: &CancellationToken) -> Result<String, OrchestratorError> {
        info!(domains = self.domains.len(), "Running on-demand scan.");
        self.orchestrator.run(&self.domains, false, cancel).await
    }

    /// Maps a `timed_tasks` key to the task it runs.
    pub fn task(&self, name: &str) -> Option<Arc<dyn ScheduledTask>> {
        match name {
            SCAN_TASK_NAME => Some(Arc::new(ScheduledScan::new(
                Arc::clone(&self.orchestrator),
                self.domains.clone(),
            ))),
            _ => None,
        }
    }

    /// Starts one scheduler per configured timed task and waits until all of them stop.
    ///
    /// Every schedule is resolved before the first one starts, so a bad entry fails
    /// startup instead of leaving some tasks running.
    pub async fn run_scheduled(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let mut planned = Vec::with_capacity(self.config.timed_tasks.len());
        for name in self.config.timed_tasks.keys() {
            let task = self.task(name).ok_or_else(|| AppError::UnknownTask(name.clone()))?;
            let scheduler =
                RecurringTaskScheduler::from_schedules(name, &self.config.timed_tasks, Arc::clone(&self.clock))?;
            planned.push((scheduler, task));
        }
        if planned.is_empty() {
            return Err(ScheduleError::Missing {
                task: SCAN_TASK_NAME.to_string(),
            }
            .into());
        }

        let handles = planned.into_iter().map(|(scheduler, task)| {
            let name = scheduler.name().to_string();
            (name, scheduler.spawn(task, cancel.clone()))
        });
        let (names, handles): (Vec<_>, Vec<_>) = handles.unzip();

        let mut first_error = None;
        for (task, joined) in names.into_iter().zip(join_all(handles).await) {
            let outcome = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => AppError::Schedule(err),
                Err(source) => AppError::SchedulerJoin { task, source },
            };
            error!(error = %outcome, "Timed task scheduler ended with an error.");
            first_error.get_or_insert(outcome);
        }
        first_error.map_or(Ok(()), Err)
    }
}
