//! The operating-system call boundary.
//!
//! Every process-wide transition the launcher makes goes through [`Sys`], so the pipeline can be
//! driven against the real kernel ([`Host`]) or against a recording fake in tests.

use alloc_counter::no_alloc;
use std::ffi::{c_char, c_int, CStr};
use std::mem;

use crate::error::{bail_errno, Error, Result};
use crate::libc_util;
use crate::seccomp;

/// A process resource limit axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Cpu,
    FileSize,
    AddressSpace,
    Processes,
    Files,
}

impl Resource {
    fn as_raw(self) -> libc::__rlimit_resource_t {
        match self {
            Resource::Cpu => libc::RLIMIT_CPU,
            Resource::FileSize => libc::RLIMIT_FSIZE,
            Resource::AddressSpace => libc::RLIMIT_AS,
            Resource::Processes => libc::RLIMIT_NPROC,
            Resource::Files => libc::RLIMIT_NOFILE,
        }
    }
}

/// A soft/hard limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub cur: u64,
    pub max: u64,
}

/// The four ids `getuid`/`geteuid`/`getgid`/`getegid` report on entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ids {
    pub real_uid: u32,
    pub effective_uid: u32,
    pub real_gid: u32,
    pub effective_gid: u32,
}

/// Real, effective and saved ids for one axis, as `getresuid`/`getresgid` report them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResIds {
    pub real: u32,
    pub effective: u32,
    pub saved: u32,
}

impl ResIds {
    pub fn all_equal(&self, id: u32) -> bool {
        self.real == id && self.effective == id && self.saved == id
    }
}

/// Operating-system calls used by the launch pipeline. Each call either succeeds or returns the
/// errno the kernel reported.
pub trait Sys {
    fn ids(&self) -> Ids;
    fn getresuid(&self) -> Result<ResIds>;
    fn getresgid(&self) -> Result<ResIds>;
    fn setresuid(&mut self, uid: u32) -> Result<()>;
    fn setresgid(&mut self, gid: u32) -> Result<()>;
    fn setgroups(&mut self, groups: &[u32]) -> Result<()>;

    /// Set the filesystem uid, returning the previous one. Passing `u32::MAX` only reads it.
    fn setfsuid(&mut self, uid: u32) -> u32;

    /// Set the filesystem gid, returning the previous one. Passing `u32::MAX` only reads it.
    fn setfsgid(&mut self, gid: u32) -> u32;

    fn access(&self, path: &CStr, mode: c_int) -> Result<()>;

    /// The `st_mode` of `path`, following symlinks.
    fn file_mode(&self, path: &CStr) -> Result<u32>;

    fn chdir(&mut self, path: &CStr) -> Result<()>;
    fn chroot(&mut self, path: &CStr) -> Result<()>;

    fn getrlimit(&self, resource: Resource) -> Result<Rlimit>;
    fn setrlimit(&mut self, resource: Resource, limit: Rlimit) -> Result<()>;

    /// Lower nice value, I/O priority class and scheduler class to their idle settings.
    fn make_idle(&mut self) -> Result<()>;

    /// Base clock frequency in MHz, if the hardware reports one.
    fn base_cpu_mhz(&self) -> Option<u32>;
    fn total_memory(&self) -> Option<u64>;
    fn cpu_count(&self) -> u32;

    /// Poll `fds` with a zero timeout, filling in `revents`.
    fn poll(&mut self, fds: &mut [libc::pollfd]) -> Result<()>;
    fn open_null(&mut self) -> Result<c_int>;
    fn close(&mut self, fd: c_int) -> Result<()>;

    /// Restrict the process to the named promises.
    fn pledge(&mut self, promises: &str) -> Result<()>;

    /// Replace the process image. Only returns on failure.
    fn execve(&mut self, path: &CStr, argv: &[*const c_char], envp: &[*const c_char]) -> Error;
}

/// The real kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Host;

impl Sys for Host {
    fn ids(&self) -> Ids {
        unsafe {
            Ids {
                real_uid: libc::getuid(),
                effective_uid: libc::geteuid(),
                real_gid: libc::getgid(),
                effective_gid: libc::getegid(),
            }
        }
    }

    fn getresuid(&self) -> Result<ResIds> {
        let (mut real, mut effective, mut saved) = (0, 0, 0);
        let 0 = (unsafe { libc::getresuid(&mut real, &mut effective, &mut saved) }) else {
            bail_errno!("getresuid failed");
        };
        Ok(ResIds {
            real,
            effective,
            saved,
        })
    }

    fn getresgid(&self) -> Result<ResIds> {
        let (mut real, mut effective, mut saved) = (0, 0, 0);
        let 0 = (unsafe { libc::getresgid(&mut real, &mut effective, &mut saved) }) else {
            bail_errno!("getresgid failed");
        };
        Ok(ResIds {
            real,
            effective,
            saved,
        })
    }

    fn setresuid(&mut self, uid: u32) -> Result<()> {
        let 0 = (unsafe { libc::setresuid(uid, uid, uid) }) else {
            bail_errno!("setresuid failed");
        };
        Ok(())
    }

    fn setresgid(&mut self, gid: u32) -> Result<()> {
        let 0 = (unsafe { libc::setresgid(gid, gid, gid) }) else {
            bail_errno!("setresgid failed");
        };
        Ok(())
    }

    fn setgroups(&mut self, groups: &[u32]) -> Result<()> {
        let 0 = (unsafe { libc::setgroups(groups.len(), groups.as_ptr()) }) else {
            bail_errno!("setgroups failed");
        };
        Ok(())
    }

    fn setfsuid(&mut self, uid: u32) -> u32 {
        (unsafe { libc::setfsuid(uid) }) as u32
    }

    fn setfsgid(&mut self, gid: u32) -> u32 {
        (unsafe { libc::setfsgid(gid) }) as u32
    }

    fn access(&self, path: &CStr, mode: c_int) -> Result<()> {
        let 0 = (unsafe { libc::access(path.as_ptr(), mode) }) else {
            bail_errno!("access failed");
        };
        Ok(())
    }

    fn file_mode(&self, path: &CStr) -> Result<u32> {
        Ok(libc_util::stat(path.as_ptr())?.st_mode)
    }

    fn chdir(&mut self, path: &CStr) -> Result<()> {
        let 0 = (unsafe { libc::chdir(path.as_ptr()) }) else {
            bail_errno!("chdir failed");
        };
        Ok(())
    }

    fn chroot(&mut self, path: &CStr) -> Result<()> {
        let 0 = (unsafe { libc::chroot(path.as_ptr()) }) else {
            bail_errno!("chroot failed");
        };
        Ok(())
    }

    fn getrlimit(&self, resource: Resource) -> Result<Rlimit> {
        let mut rlim = mem::MaybeUninit::<libc::rlimit>::uninit();
        let 0 = (unsafe { libc::getrlimit(resource.as_raw(), rlim.as_mut_ptr()) }) else {
            bail_errno!("getrlimit failed");
        };
        let rlim = unsafe { rlim.assume_init() };
        Ok(Rlimit {
            cur: rlim.rlim_cur,
            max: rlim.rlim_max,
        })
    }

    fn setrlimit(&mut self, resource: Resource, limit: Rlimit) -> Result<()> {
        let rlim = libc::rlimit {
            rlim_cur: limit.cur,
            rlim_max: limit.max,
        };
        let 0 = (unsafe { libc::setrlimit(resource.as_raw(), &rlim) }) else {
            bail_errno!("setrlimit failed");
        };
        Ok(())
    }

    fn make_idle(&mut self) -> Result<()> {
        let 0 = (unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 19) }) else {
            bail_errno!("setpriority(PRIO_PROCESS, 0, 19) failed");
        };
        libc_util::ioprio_set_idle()?;
        let param = libc::sched_param {
            sched_priority: unsafe { libc::sched_get_priority_min(libc::SCHED_IDLE) },
        };
        let 0 = (unsafe { libc::sched_setscheduler(0, libc::SCHED_IDLE, &param) }) else {
            bail_errno!("sched_setscheduler(SCHED_IDLE) failed");
        };
        Ok(())
    }

    fn base_cpu_mhz(&self) -> Option<u32> {
        libc_util::base_cpu_mhz()
    }

    fn total_memory(&self) -> Option<u64> {
        libc_util::total_memory()
    }

    fn cpu_count(&self) -> u32 {
        libc_util::cpu_count()
    }

    fn poll(&mut self, fds: &mut [libc::pollfd]) -> Result<()> {
        let 0.. = (unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) }) else {
            bail_errno!("poll failed");
        };
        Ok(())
    }

    fn open_null(&mut self) -> Result<c_int> {
        let fd @ 0.. = (unsafe { libc::open(c_str_macro::c_str!("/dev/null").as_ptr(), libc::O_RDWR) })
        else {
            bail_errno!("failed to open null device");
        };
        Ok(fd)
    }

    fn close(&mut self, fd: c_int) -> Result<()> {
        let 0 = (unsafe { libc::close(fd) }) else {
            bail_errno!("close failed");
        };
        Ok(())
    }

    fn pledge(&mut self, promises: &str) -> Result<()> {
        seccomp::pledge(promises)
    }

    #[cfg_attr(debug_assertions, no_alloc)]
    fn execve(&mut self, path: &CStr, argv: &[*const c_char], envp: &[*const c_char]) -> Error {
        // The Rust runtime ignores SIGPIPE, and ignored dispositions survive execve.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_DFL) };
        unsafe { libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr()) };
        Error::last_os_error().cause("execve failed")
    }
}
