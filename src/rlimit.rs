//! Turns [`Quotas`] into process resource limits.

use tracing::{debug, warn};

use crate::error::{Error, LaunchError, Result};
use crate::quota::Quotas;
use crate::sys::{Resource, Rlimit, Sys};

/// The clock rate, in MHz, at which a CPU quota in seconds is taken at face value.
const REFERENCE_MHZ: f64 = 3100.;

/// The `RLIMIT_CPU` soft limit for `secs` seconds of work on a `mhz` processor.
pub fn cpu_limit_for(secs: i64, mhz: u32) -> u64 {
    (REFERENCE_MHZ / f64::from(mhz) * secs as f64).ceil() as u64
}

/// Apply `quotas` and, if `nice` is set, the idle scheduling settings.
pub fn apply(sys: &mut impl Sys, quotas: &Quotas, nice: bool) -> std::result::Result<(), LaunchError> {
    if nice {
        sys.make_idle().map_err(LaunchError::Nice)?;
        debug!("lowered scheduling priority");
    }
    set_cpu_limit(sys, quotas.cpu_seconds).map_err(LaunchError::CpuLimit)?;
    set_file_size_limit(sys, quotas.file_size_bytes).map_err(LaunchError::FileSizeLimit)?;
    set_exact_limit(sys, Resource::AddressSpace, quotas.memory_bytes)
        .map_err(LaunchError::MemoryLimit)?;
    set_exact_limit(sys, Resource::Processes, quotas.max_processes)
        .map_err(LaunchError::ProcessLimit)?;
    Ok(())
}

/// Quotas that are unset or not positive inherit the ambient limit.
fn positive(quota: Option<i64>) -> Option<u64> {
    quota.filter(|&n| n > 0).map(|n| n as u64)
}

fn set_cpu_limit(sys: &mut impl Sys, secs: Option<i64>) -> Result<()> {
    let Some(secs) = secs.filter(|&n| n > 0) else {
        return Ok(());
    };
    let Some(mhz) = sys.base_cpu_mhz() else {
        warn!(secs, "base cpu frequency unknown, not limiting cpu time");
        return Ok(());
    };
    let lim = cpu_limit_for(secs, mhz);
    // SIGXCPU at the soft limit, SIGKILL one second later.
    let want = Rlimit {
        cur: lim,
        max: lim.saturating_add(1),
    };
    set_within_hard_limit(sys, Resource::Cpu, want)
}

fn set_file_size_limit(sys: &mut impl Sys, bytes: Option<i64>) -> Result<()> {
    let Some(n) = positive(bytes) else {
        return Ok(());
    };
    let want = Rlimit {
        cur: n,
        max: n.saturating_mul(2),
    };
    set_within_hard_limit(sys, Resource::FileSize, want)
}

fn set_exact_limit(sys: &mut impl Sys, resource: Resource, quota: Option<i64>) -> Result<()> {
    let Some(n) = positive(quota) else {
        return Ok(());
    };
    sys.setrlimit(resource, Rlimit { cur: n, max: n })?;
    debug!(?resource, limit = n, "set resource limit");
    Ok(())
}

/// Request `want`. If the kernel refuses it as too large, retry with the soft limit intersected
/// with the existing hard limit. Any other failure is returned as-is.
fn set_within_hard_limit(sys: &mut impl Sys, resource: Resource, want: Rlimit) -> Result<()> {
    let err = match sys.setrlimit(resource, want) {
        Ok(()) => {
            debug!(?resource, cur = want.cur, max = want.max, "set resource limit");
            return Ok(());
        }
        Err(err) => err,
    };
    if err.errno != libc::EPERM && err.errno != libc::EINVAL {
        return Err(err);
    }

    let hard = sys
        .getrlimit(resource)
        .map_err(|e| e.context("reading existing limit"))?
        .max;
    let reduced = Rlimit {
        cur: want.cur.min(hard),
        max: hard,
    };
    debug!(?resource, cur = reduced.cur, max = reduced.max, "retrying within hard limit");
    sys.setrlimit(resource, reduced)
        .map_err(|e: Error| e.context("retrying within hard limit"))
}
