//! External interrupt handling.
//!
//! SIGINT/SIGTERM are blocked on the installing thread (and therefore on every
//! thread spawned afterwards) and received synchronously by a dedicated
//! listener thread, which only flips a shared flag. Every blocking loop in the
//! harness polls that flag and unwinds through its drop guards, so sandboxes
//! are released by ordinary scope exit rather than from signal context.

use anyhow::{Context, Result};
use nix::sys::signal::{SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
#[error("interrupted by external signal")]
pub struct InterruptedError;

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), InterruptedError> {
        if self.is_triggered() {
            Err(InterruptedError)
        } else {
            Ok(())
        }
    }
}

/// Must run before any other thread is spawned so the mask is inherited.
pub fn install_signal_listener(interrupt: &Interrupt) -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block()
        .context("failed to block SIGINT/SIGTERM for the signal listener")?;

    let interrupt = interrupt.clone();
    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || loop {
            match set.wait() {
                Ok(signal) => {
                    warn!(?signal, "interrupt received, tearing down");
                    interrupt.trigger();
                }
                Err(err) => {
                    error!(%err, "signal listener stopped");
                    break;
                }
            }
        })
        .context("failed to spawn signal listener thread")?;
    Ok(())
}

/// Returns true when an error chain was caused by an observed interrupt.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<InterruptedError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let interrupt = Interrupt::new();
        let observer = interrupt.clone();
        assert!(observer.check().is_ok());
        interrupt.trigger();
        assert!(observer.is_triggered());
        assert!(observer.check().is_err());
    }

    #[test]
    fn interrupted_errors_are_detected_through_context() {
        let err = anyhow::Error::new(InterruptedError).context("while running case c1");
        assert!(is_interrupted(&err));
        assert!(!is_interrupted(&anyhow::anyhow!("plain failure")));
    }
}
