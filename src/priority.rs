//! Worker thread spawning at real-time scheduling priority

use std::{
    io,
    thread::{self, JoinHandle},
};

use tracing::{debug, warn};

/// Spawn a named thread that switches itself to `SCHED_FIFO` before running
/// `f`. Without the privilege to do so the thread runs at normal priority.
pub fn spawn_realtime<F, T>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let name = name.to_owned();
    thread::Builder::new().name(name.clone()).spawn(move || {
        match set_realtime() {
            Ok(priority) => debug!(thread = %name, priority, "running at real-time priority"),
            Err(e) => warn!(thread = %name, "failed to set real-time priority: {}", e),
        }
        f()
    })
}

/// Mid-range `SCHED_FIFO` priority for the calling thread
#[cfg(target_os = "linux")]
fn set_realtime() -> io::Result<i32> {
    // SAFETY: plain syscalls on the calling thread with a zeroed, then filled, sched_param
    unsafe {
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if min < 0 || max < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = min + (max - min) / 2;
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(param.sched_priority)
    }
}

#[cfg(not(target_os = "linux"))]
fn set_realtime() -> io::Result<i32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "real-time scheduling is only implemented on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_thread_runs_with_its_name() {
        let handle = spawn_realtime("lime-test", || {
            thread::current().name().map(str::to_owned)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("lime-test"));
    }
}
