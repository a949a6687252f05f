//! Real-time priority for the engine thread
//!
//! Elevates the calling thread's scheduling class so the dispatcher meets
//! its block deadline under load. On Linux this tries SCHED_FIFO, then
//! SCHED_RR; failure is non-fatal — the engine runs at default priority
//! and only logs the downgrade.

use std::sync::atomic::{AtomicBool, Ordering};

/// Track if priority has been set (avoid repeated syscalls)
static PRIORITY_SET: AtomicBool = AtomicBool::new(false);

/// Result of a priority elevation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityResult {
    Success,
    AlreadySet,
    Failed,
    Unsupported,
}

/// Set real-time priority for the current thread.
///
/// Safe to call repeatedly; elevation is attempted once per process.
pub fn set_realtime_priority() -> PriorityResult {
    if PRIORITY_SET.swap(true, Ordering::SeqCst) {
        return PriorityResult::AlreadySet;
    }

    let result = platform_set_priority();
    match result {
        PriorityResult::Success => {
            log::info!("engine thread elevated to real-time priority");
        }
        PriorityResult::Failed => {
            log::warn!("failed to set real-time thread priority (non-fatal)");
            PRIORITY_SET.store(false, Ordering::SeqCst); // allow retry
        }
        PriorityResult::Unsupported => {
            log::debug!("real-time priority not supported on this platform");
        }
        PriorityResult::AlreadySet => {}
    }
    result
}

/// Reset priority tracking (for testing)
#[doc(hidden)]
pub fn reset_priority_state() {
    PRIORITY_SET.store(false, Ordering::SeqCst);
}

#[cfg(target_os = "linux")]
fn platform_set_priority() -> PriorityResult {
    use libc::{sched_param, sched_setscheduler, SCHED_FIFO, SCHED_RR};

    // SCHED_FIFO needs CAP_SYS_NICE; priority 80 leaves room above us for
    // kernel threads.
    let mut param = sched_param { sched_priority: 80 };
    if unsafe { sched_setscheduler(0, SCHED_FIFO, &param) } == 0 {
        return PriorityResult::Success;
    }

    log::debug!("SCHED_FIFO failed (need CAP_SYS_NICE), trying SCHED_RR");
    param.sched_priority = 70;
    if unsafe { sched_setscheduler(0, SCHED_RR, &param) } == 0 {
        return PriorityResult::Success;
    }

    PriorityResult::Failed
}

#[cfg(not(target_os = "linux"))]
fn platform_set_priority() -> PriorityResult {
    PriorityResult::Unsupported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_priority_idempotent() {
        reset_priority_state();

        let first = set_realtime_priority();
        let second = set_realtime_priority();

        if first == PriorityResult::Success {
            assert_eq!(second, PriorityResult::AlreadySet);
        }

        reset_priority_state();
    }
}
