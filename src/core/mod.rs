// src/core/mod.rs

// The `core` module holds the scan engine. Leaves first: models and retry have no
// dependencies inside the crate, the orchestrator ties everything together.

/// Findings, analysis handles and provider verdict types.
pub mod models;

/// Bounded retry with capped backoff, used by every provider call.
pub mod retry;

/// Text and HTML rendering of listed findings.
pub mod report;

/// Thread-safe store of findings for one run.
pub mod aggregator;

/// The scanner trait and the provider-backed implementations.
pub mod scanner;

/// Report delivery with its own retry budget.
pub mod notifier;

pub mod scheduler;

pub mod orchestrator;
