//! Cooperative cancellation shared between the scheduler and its workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

/// Cloneable flag; every clone observes the same cancellation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Cancel `token` once `stop_file` appears. The watcher exits when the token
/// is cancelled by anyone.
pub fn watch_stop_file(token: CancelToken, stop_file: PathBuf, poll: Duration) {
    thread::spawn(move || {
        while !token.is_cancelled() {
            if stop_requested(&stop_file) {
                info!(path = %stop_file.display(), "stop file found, cancelling");
                token.cancel();
                break;
            }
            thread::sleep(poll);
        }
    });
}

fn stop_requested(path: &Path) -> bool {
    path.exists()
}

/// Turn SIGINT and SIGTERM into cancellation of `token`.
///
/// The signals are blocked in the calling thread and in every thread it
/// spawns afterwards, then taken synchronously by a watcher thread. Call this
/// before any other thread exists, or that thread may still receive a signal
/// with its default action and kill the process, orphaning agents that run in
/// their own process groups. Child processes start with an empty signal mask.
#[cfg(unix)]
pub fn cancel_on_signals(token: CancelToken) -> Result<()> {
    use anyhow::Context;
    use nix::sys::signal::{SigSet, Signal};
    use tracing::{error, warn};

    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals
        .thread_block()
        .context("block termination signals")?;

    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            loop {
                match signals.wait() {
                    Ok(signal) if token.is_cancelled() => {
                        warn!(signal = signal.as_str(), "already stopping; waiting for workers");
                    }
                    Ok(signal) => {
                        warn!(signal = signal.as_str(), "signal received, cancelling");
                        token.cancel();
                    }
                    Err(errno) => {
                        error!(err = %errno, "waiting for signals failed");
                        return;
                    }
                }
            }
        })
        .context("spawn signal watcher")?;
    Ok(())
}

#[cfg(not(unix))]
pub fn cancel_on_signals(_token: CancelToken) -> Result<()> {
    Ok(())
}
