use log::{debug, warn};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// Pin the calling thread to `core`.
pub fn pin_current_thread(core: usize) -> nix::Result<()> {
    let mut set = CpuSet::new();
    set.set(core)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

/// Pin the calling thread if a core is given, a failure is only reported.
pub fn pin_or_warn(core: Option<usize>, what: &str) {
    if let Some(core) = core {
        match pin_current_thread(core) {
            Ok(()) => debug!("{} pinned to CPU core {}", what, core),
            Err(e) => warn!("Couldn't pin {} to CPU core {}: {}", what, core, e),
        }
    }
}
