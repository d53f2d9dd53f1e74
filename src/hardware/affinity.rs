//! Kernel CPU affinity plumbing.
//!
//! Affinity failures indicate a broken host and are surfaced as OS-level
//! errors, which the runtime treats as fatal.

#[cfg(target_os = "linux")]
mod imp {
    use crate::error::{Error, Result};
    use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
    use nix::unistd::{gettid, Pid};

    /// Per-system-CPU-id membership in the process affinity mask.
    pub fn process_mask() -> Result<Vec<bool>> {
        let set = sched_getaffinity(Pid::from_raw(0))
            .map_err(|e| Error::os("querying process CPU affinity").with_source(e))?;
        Ok((0..CpuSet::count())
            .map(|i| set.is_set(i).unwrap_or(false))
            .collect())
    }

    /// Pins the thread with kernel `tid` to a single system CPU.
    pub fn bind_thread(tid: i32, system_cpu_id: usize) -> Result<()> {
        let mut set = CpuSet::new();
        set.set(system_cpu_id)
            .map_err(|e| Error::os(format!("cpu {system_cpu_id} out of CpuSet range")).with_source(e))?;
        sched_setaffinity(Pid::from_raw(tid), &set).map_err(|e| {
            Error::os(format!("binding tid {tid} to cpu {system_cpu_id}")).with_source(e)
        })
    }

    /// Kernel thread id of the calling thread.
    #[must_use]
    pub fn current_tid() -> i32 {
        gettid().as_raw()
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use crate::error::Result;

    /// All CPUs allowed; non-Linux hosts have no queryable mask.
    pub fn process_mask() -> Result<Vec<bool>> {
        let count = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Ok(vec![true; count])
    }

    /// Pinning is unsupported off Linux; workers run unbound.
    pub fn bind_thread(_tid: i32, _system_cpu_id: usize) -> Result<()> {
        Ok(())
    }

    /// No kernel tid available; 0 is never bound.
    #[must_use]
    pub fn current_tid() -> i32 {
        0
    }
}

pub use imp::{bind_thread, current_tid, process_mask};
