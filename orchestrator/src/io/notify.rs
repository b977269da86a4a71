//! Operator notifications.
//!
//! Events are plain text. Delivery is best effort: a failing sink is logged
//! and never affects the run.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TaskBlocked {
        task: String,
        reasons: Vec<String>,
    },
    RegressionDetected {
        task: String,
        tests: Vec<String>,
    },
    WorkRequestComplete {
        id: String,
        done: usize,
        blocked: usize,
        cancelled: bool,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::TaskBlocked { task, reasons } => {
                write!(f, "task {task} blocked")?;
                if !reasons.is_empty() {
                    write!(f, ": {}", reasons.join("; "))?;
                }
                Ok(())
            }
            Event::RegressionDetected { task, tests } => {
                write!(f, "task {task} broke previously passing tests: {}", tests.join(", "))
            }
            Event::WorkRequestComplete {
                id,
                done,
                blocked,
                cancelled,
            } => {
                if *cancelled {
                    write!(f, "work request {id} cancelled ({done} done, {blocked} blocked)")
                } else {
                    write!(f, "work request {id} complete ({done} done, {blocked} blocked)")
                }
            }
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Event) -> Result<()>;
}

/// Emits events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &Event) -> Result<()> {
        match event {
            Event::TaskBlocked { .. } | Event::RegressionDetected { .. } => {
                warn!(target: "orchestrator::events", "{event}");
            }
            _ => info!(target: "orchestrator::events", "{event}"),
        }
        Ok(())
    }
}

/// Appends timestamped events to a file (`.orchestrator/events.log`).
#[derive(Debug)]
pub struct FileNotifier {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl Notifier for FileNotifier {
    fn notify(&self, event: &Event) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        writeln!(file, "{} {event}", Utc::now().to_rfc3339())
            .with_context(|| format!("append event log {}", self.path.display()))?;
        Ok(())
    }
}

/// Fan-out to several sinks; failures are logged and swallowed.
#[derive(Default)]
pub struct Notifications {
    sinks: Vec<Box<dyn Notifier>>,
}

impl Notifications {
    pub fn new(sinks: Vec<Box<dyn Notifier>>) -> Self {
        Self { sinks }
    }

    pub fn send(&self, event: &Event) {
        for sink in &self.sinks {
            if let Err(e) = sink.notify(event) {
                warn!(err = %format!("{e:#}"), "notification delivery failed");
            }
        }
    }
}
