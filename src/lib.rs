// src/lib.rs

//! DNS-BLM: checks a list of domains against blacklist providers on a cron schedule
//! and mails a report when any of them is listed.

pub mod app;
pub mod config;
pub mod core;
pub mod logging;
