use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

pub fn start<F>(name: &str, f: F) -> JoinHandle<()>
    where F: FnOnce() + Send + 'static
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .expect("spawning thread in chirp_util::thread::start")
}

/// Ask the OS for SCHED_FIFO on the calling thread. The worklet host
/// wants this so ring draining keeps pace with the render clock; in
/// unprivileged environments the call fails and is warned about once.
pub fn set_realtime_priority() {
    static WARNED: AtomicBool = AtomicBool::new(false);

    let param = libc::sched_param { sched_priority: 99 };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };

    if rc == 0 || WARNED.swap(true, Ordering::Relaxed) {
        return;
    }

    let err = std::io::Error::last_os_error();
    log::warn!("failed to set realtime priority for the worklet thread: {err}");

    if err.kind() == std::io::ErrorKind::PermissionDenied {
        log::warn!("grant cap_sys_nice to the host process to enable this");
    }
}
