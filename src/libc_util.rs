use alloc_counter::no_alloc;
use std::ffi::{c_char, CString, OsStr};
use std::mem;
use std::os::unix::ffi::OsStrExt;

use crate::error::{bail, bail_errno, Error, Result};

/// `IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT`, with priority data 0.
const IOPRIO_IDLE: libc::c_int = 3 << 13;
const IOPRIO_WHO_PROCESS: libc::c_int = 1;

#[cfg_attr(debug_assertions, no_alloc)]
pub fn stat(path: *const c_char) -> Result<libc::stat> {
    let mut stat_buf = mem::MaybeUninit::<libc::stat>::uninit();
    let 0.. = (unsafe { libc::stat(path, stat_buf.as_mut_ptr()) }) else {
        bail_errno!("failed to stat file");
    };
    Ok(unsafe { stat_buf.assume_init() })
}

/// Put the calling process in the idle I/O scheduling class.
pub fn ioprio_set_idle() -> Result<()> {
    let 0 = (unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, IOPRIO_IDLE) })
    else {
        bail_errno!("ioprio_set failed");
    };
    Ok(())
}

/// Read the processor base frequency from CPUID leaf 0x16.
#[cfg(target_arch = "x86_64")]
pub fn base_cpu_mhz() -> Option<u32> {
    use std::arch::x86_64::__cpuid;

    let max_leaf = __cpuid(0).eax;
    if max_leaf < 0x16 {
        return None;
    }
    match __cpuid(0x16).eax & 0x7fff {
        0 => None,
        mhz => Some(mhz),
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn base_cpu_mhz() -> Option<u32> {
    None
}

/// Total usable main memory in bytes, per `sysinfo(2)`.
pub fn total_memory() -> Option<u64> {
    let mut si = mem::MaybeUninit::<libc::sysinfo>::uninit();
    let 0 = (unsafe { libc::sysinfo(si.as_mut_ptr()) }) else {
        return None;
    };
    let si = unsafe { si.assume_init() };
    Some((si.totalram as u64).saturating_mul(si.mem_unit as u64))
}

/// Number of online logical processors, at least one.
pub fn cpu_count() -> u32 {
    match unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) } {
        n @ 1.. => n as u32,
        _ => 1,
    }
}

/// Null-terminate an OS string.
pub fn cstring(s: impl AsRef<OsStr>) -> Result<CString> {
    let Ok(s) = CString::new(s.as_ref().as_bytes()) else {
        bail!("string contains an interior NUL");
    };
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_count_is_positive() {
        assert!(cpu_count() >= 1);
    }

    #[test]
    fn base_frequency_is_plausible_when_reported() {
        if let Some(mhz) = base_cpu_mhz() {
            assert!((1..0x8000).contains(&mhz));
        }
    }

    #[test]
    fn total_memory_is_known_on_linux() {
        assert!(total_memory().unwrap() > 0);
    }

    #[test]
    fn cstring_rejects_interior_nul() {
        let err = cstring("a\0b").unwrap_err();
        assert_eq!(err.errno, 0);
        assert_eq!(cstring("/bin/sh").unwrap().as_bytes(), b"/bin/sh");
    }

    #[test]
    fn stat_root_is_directory() {
        let st = stat(c_str_macro::c_str!("/").as_ptr()).unwrap();
        assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFDIR);
    }
}
