//! SIGINT/SIGTERM handling.
//!
//! Both signals are blocked in the calling thread before any other thread
//! exists, so every later thread inherits the mask. A dedicated watcher
//! thread receives them with `sigwait` and drives the guard's termination
//! path outside of async-signal context.

use std::io;
use std::mem::MaybeUninit;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use super::LifecycleGuard;

const HANDLED: [libc::c_int; 2] = [libc::SIGINT, libc::SIGTERM];

/// Block the handled signals and start the watcher thread.
///
/// Must be called before any other thread is spawned.
pub fn install(guard: LifecycleGuard, grace: Duration) -> io::Result<()> {
    let set = signal_set(&HANDLED)?;
    // SAFETY: `set` is an initialized sigset_t.
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }

    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || watch(set, guard, grace))?;
    Ok(())
}

fn watch(set: libc::sigset_t, guard: LifecycleGuard, grace: Duration) {
    let mut signal: libc::c_int = 0;
    loop {
        // SAFETY: both pointers refer to live, initialized values.
        let rc = unsafe { libc::sigwait(&set, &mut signal) };
        if rc == 0 {
            break;
        }
    }

    warn!(signal, "termination signal received; cleaning up");
    guard.record_signal(signal);
    if !guard.wait_for_children(grace) {
        warn!(
            in_flight = guard.in_flight(),
            "builds still running after {}s; sending SIGTERM",
            grace.as_secs()
        );
        guard.terminate_children();
    }
    let removed = guard.terminate();
    info!(removed, "temporary directories removed");
    reraise(signal);
}

/// Finish a run that a signal cancelled: clean up, then die by that signal.
///
/// Returns normally when no signal was received.
pub fn exit_if_signalled(guard: &LifecycleGuard) {
    if let Some(signal) = guard.received_signal() {
        guard.terminate();
        reraise(signal);
    }
}

/// Restore the default disposition and re-raise so the exit status reports
/// the signal.
fn reraise(signal: libc::c_int) -> ! {
    // SAFETY: resetting a disposition and raising a signal have no
    // memory-safety preconditions.
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        if let Ok(set) = signal_set(&[signal]) {
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
        }
        libc::raise(signal);
    }
    std::process::exit(128 + signal)
}

fn signal_set(signals: &[libc::c_int]) -> io::Result<libc::sigset_t> {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    // SAFETY: sigemptyset initializes the set before sigaddset reads it.
    unsafe {
        if libc::sigemptyset(set.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        for &signal in signals {
            if libc::sigaddset(set.as_mut_ptr(), signal) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(set.assume_init())
    }
}
