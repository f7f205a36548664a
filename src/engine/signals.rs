//! Cooperative shutdown.
//!
//! SIGINT and SIGTERM only raise a flag; the daemon loop notices it the next
//! time a bounded pipe wait returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared shutdown flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Cancel `token` on SIGINT, SIGTERM or SIGHUP. Callable once per process.
pub fn install_termination_handler(token: &CancellationToken) -> Result<(), ctrlc::Error> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        log::info!("Termination requested; stopping after the current wait");
        token.cancel();
    })
}
