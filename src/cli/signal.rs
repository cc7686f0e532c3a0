//! Signal handling for graceful shutdown
//!
//! Two-phase Ctrl+C: the first sets the interrupted flag so the current
//! operation can drain the pool; the second force-exits with code 130.

use std::sync::atomic::{AtomicBool, Ordering};

/// Exit code for user interruption, matching shell convention.
const EXIT_INTERRUPTED: i32 = 130;

/// Global flag indicating the user requested interruption.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Install the Ctrl+C handler.
pub fn setup_signal_handler() {
    if let Err(e) = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::AcqRel) {
            std::process::exit(EXIT_INTERRUPTED);
        }
        eprintln!("\nInterrupted. Draining workers...");
    }) {
        tracing::warn!(error = %e, "Failed to set Ctrl+C handler");
    }
}

/// Check whether the user requested interruption.
pub fn check_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupted_flag_roundtrip() {
        assert!(!check_interrupted());
        INTERRUPTED.store(true, Ordering::Release);
        assert!(check_interrupted());
        INTERRUPTED.store(false, Ordering::Release);
    }
}
