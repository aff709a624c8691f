//! SIGINT handling and process-group signalling.
//!
//! Local jobs run in their own process groups, so the terminal's SIGINT never
//! reaches them. Their group ids are tracked in a fixed table of atomics that
//! the signal handler can walk without locking; a forced exit terminates
//! every tracked group first. Cluster jobs are not tracked and stay queued.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Set by the SIGINT handler; polled by the scheduler and job monitors.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Upper bound on concurrently tracked process groups.
const MAX_TRACKED: usize = 256;

/// Process group ids of running local jobs; 0 marks a free slot.
static TRACKED: [AtomicI32; MAX_TRACKED] = [const { AtomicI32::new(0) }; MAX_TRACKED];

extern "C" fn on_sigint(_signal: libc::c_int) {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        terminate_tracked();
        // SAFETY: _exit is async-signal-safe.
        unsafe { libc::_exit(130) }
    }
}

/// Install the SIGINT handler. The first Ctrl-C requests a graceful stop; a
/// second one terminates running local jobs and exits with status 130.
pub fn install_interrupt_handler() -> io::Result<()> {
    // SAFETY: the handler only touches atomics and calls kill and _exit.
    let previous = unsafe { libc::signal(libc::SIGINT, on_sigint as *const () as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The flag set when the user interrupts the run.
pub fn interrupt_flag() -> &'static AtomicBool {
    &INTERRUPTED
}

/// Remember a running process group. Returns `false` when the table is full;
/// the job then runs untracked.
pub fn track_process_group(pgid: u32) -> bool {
    track_in(&TRACKED, pgid)
}

/// Forget a process group once its leader has been reaped.
pub fn untrack_process_group(pgid: u32) {
    untrack_in(&TRACKED, pgid);
}

fn terminate_tracked() {
    terminate_in(&TRACKED);
}

#[cfg(test)]
pub(crate) fn is_tracked(pgid: u32) -> bool {
    TRACKED
        .iter()
        .any(|slot| slot.load(Ordering::SeqCst) == pgid as i32)
}

fn track_in(table: &[AtomicI32], pgid: u32) -> bool {
    let Ok(pgid) = i32::try_from(pgid) else {
        return false;
    };
    if pgid <= 0 {
        return false;
    }
    table.iter().any(|slot| {
        slot.compare_exchange(0, pgid, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    })
}

fn untrack_in(table: &[AtomicI32], pgid: u32) {
    let Ok(pgid) = i32::try_from(pgid) else {
        return;
    };
    for slot in table {
        if slot
            .compare_exchange(pgid, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
    }
}

/// SIGTERM every process group in `table`. Async-signal-safe.
fn terminate_in(table: &[AtomicI32]) {
    for slot in table {
        let pgid = slot.load(Ordering::SeqCst);
        if pgid > 0 {
            // SAFETY: kill(2) is async-signal-safe; a negative pid targets the group.
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
        }
    }
}

/// Send `signal` to every process in the group led by `pgid`.
pub fn signal_process_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "process id out of range"))?;
    // SAFETY: kill(2) with a negative pid only signals the process group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // The group already exited.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    use super::*;

    fn table() -> [AtomicI32; 2] {
        [AtomicI32::new(0), AtomicI32::new(0)]
    }

    #[test]
    fn forced_exit_terminates_tracked_groups() {
        let tracked = table();
        let mut child = Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pgid = child.id();
        assert!(track_in(&tracked, pgid));
        assert_eq!(tracked[0].load(Ordering::SeqCst), pgid as i32);

        terminate_in(&tracked);
        let status = child.wait().unwrap();
        assert!(!status.success());

        untrack_in(&tracked, pgid);
        assert_eq!(tracked[0].load(Ordering::SeqCst), 0);
    }

    #[test]
    fn full_table_and_invalid_ids_are_not_tracked() {
        let tracked = table();
        assert!(!track_in(&tracked, 0));
        assert!(!track_in(&tracked, u32::MAX));
        assert!(track_in(&tracked, 101));
        assert!(track_in(&tracked, 102));
        assert!(!track_in(&tracked, 103));
        untrack_in(&tracked, 101);
        assert!(track_in(&tracked, 103));
    }
}
