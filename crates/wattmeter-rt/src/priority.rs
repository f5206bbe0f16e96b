//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Best-effort SCHED_FIFO elevation for the publisher process."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PriorityError {
    #[error("real-time priority {0} outside 0..=99")]
    OutOfRange(i32),
    #[error("real-time scheduling is not supported on this platform")]
    Unsupported,
    #[error("failed to query SCHED_FIFO priority range: {0}")]
    Query(#[source] std::io::Error),
    #[error(
        "failed to apply SCHED_FIFO priority {priority}: {source}. \
         Running as root or with CAP_SYS_NICE is required"
    )]
    Apply {
        priority: i32,
        #[source]
        source: std::io::Error,
    },
}

/// Moves the calling thread to `SCHED_FIFO`. Threads spawned afterwards
/// inherit the policy, so call this before building the async runtime.
///
/// `0` selects the highest priority the policy allows. Returns the priority
/// that was applied.
pub fn request_realtime_priority(priority: i32) -> Result<i32, PriorityError> {
    if !(0..=99).contains(&priority) {
        return Err(PriorityError::OutOfRange(priority));
    }
    apply_fifo(priority)
}

#[cfg(target_os = "linux")]
fn apply_fifo(priority: i32) -> Result<i32, PriorityError> {
    // SAFETY: plain syscalls on the current thread with a stack-owned param.
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if max < 0 {
            return Err(PriorityError::Query(std::io::Error::last_os_error()));
        }
        let effective = if priority == 0 { max } else { priority.min(max) };
        let param = libc::sched_param {
            sched_priority: effective,
        };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(PriorityError::Apply {
                priority: effective,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(effective)
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_fifo(_priority: i32) -> Result<i32, PriorityError> {
    Err(PriorityError::Unsupported)
}
