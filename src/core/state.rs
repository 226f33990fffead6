//! Process-wide shutdown state.
//!
//! The only global state in the daemon: Ctrl+C sets a flag and notifies the
//! serve loop through a channel registered at startup. A second Ctrl+C while
//! projects are still stopping exits immediately.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

static SHUTDOWN_TX: OnceLock<crossbeam::channel::Sender<()>> = OnceLock::new();

/// Install the Ctrl+C handler. Before `register_shutdown()` nothing is
/// running yet, so the process just exits.
pub fn setup_shutdown_handler() -> anyhow::Result<()> {
    ctrlc::set_handler(|| {
        if SHUTDOWN.swap(true, Ordering::SeqCst) {
            crate::log!("serve"; "forced exit");
            std::process::exit(130);
        }

        match SHUTDOWN_TX.get() {
            Some(tx) => {
                crate::log!("serve"; "shutting down, press Ctrl+C again to force");
                let _ = tx.try_send(());
            }
            None => std::process::exit(0),
        }
    })
    .map_err(|e| anyhow::anyhow!("cannot install Ctrl+C handler: {e}"))
}

pub fn register_shutdown(shutdown_tx: crossbeam::channel::Sender<()>) {
    let _ = SHUTDOWN_TX.set(shutdown_tx);
}

/// Whether Ctrl+C has been received.
pub fn is_shutdown() -> bool {
    SHUTDOWN.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_shutdown_by_default() {
        assert!(!is_shutdown());
    }
}
