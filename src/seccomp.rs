//! Compiles a promise string into a seccomp-bpf filter and installs it.
//!
//! System calls outside the granted promises fail with `EPERM`. Filtering is mostly per system
//! call; a few calls (`openat`, `ioctl`, `socket`, `prctl`) are additionally narrowed by argument.

use std::collections::BTreeMap;

use seccompiler::{
    BpfProgram, BpfProgramRef, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
    SeccompFilter, SeccompRule, TargetArch,
};
use tracing::debug;

use crate::error::{bail_errno, Error, Result};
use crate::promise::Promise;

/// How a system call is allowed.
enum Allow {
    Always,
    When(Vec<SeccompRule>),
}

/// The union of system calls granted by a set of promises.
#[derive(Default)]
struct Ruleset {
    calls: BTreeMap<i64, Allow>,
}

fn invalid(cause: &'static str) -> Error {
    Error::from_errno(libc::EINVAL).cause(cause)
}

fn condition(arg: u8, op: SeccompCmpOp, value: u64) -> Result<SeccompCondition> {
    SeccompCondition::new(arg, SeccompCmpArgLen::Dword, op, value)
        .map_err(|_| invalid("invalid seccomp condition"))
}

fn pointer_is_null(arg: u8) -> Result<SeccompCondition> {
    SeccompCondition::new(arg, SeccompCmpArgLen::Qword, SeccompCmpOp::Eq, 0)
        .map_err(|_| invalid("invalid seccomp condition"))
}

impl Ruleset {
    fn allow(&mut self, calls: &[i64]) {
        for &nr in calls {
            self.calls.insert(nr, Allow::Always);
        }
    }

    /// Allow `nr` when all of `conditions` hold. An unconditional grant for `nr` always wins.
    fn allow_when(&mut self, nr: i64, conditions: Vec<SeccompCondition>) -> Result<()> {
        let rule = SeccompRule::new(conditions).map_err(|_| invalid("invalid seccomp rule"))?;
        match self.calls.entry(nr).or_insert_with(|| Allow::When(Vec::new())) {
            Allow::Always => {}
            Allow::When(rules) => rules.push(rule),
        }
        Ok(())
    }

    /// Allow `nr` when argument `arg` equals any of `values`.
    fn allow_arg_in(&mut self, nr: i64, arg: u8, values: &[u64]) -> Result<()> {
        for &value in values {
            self.allow_when(nr, vec![condition(arg, SeccompCmpOp::Eq, value)?])?;
        }
        Ok(())
    }

    /// Allow the open family when `(flags & mask) == 0`.
    fn allow_open_without(&mut self, mask: u64) -> Result<()> {
        self.allow_when(
            libc::SYS_openat,
            vec![condition(2, SeccompCmpOp::MaskedEq(mask), 0)?],
        )?;
        #[cfg(target_arch = "x86_64")]
        self.allow_when(
            libc::SYS_open,
            vec![condition(1, SeccompCmpOp::MaskedEq(mask), 0)?],
        )?;
        Ok(())
    }

    fn grant(&mut self, promise: Promise) -> Result<()> {
        match promise {
            Promise::Stdio => {
                self.allow(STDIO);
                #[cfg(target_arch = "x86_64")]
                self.allow(STDIO_X86_64);
                self.allow_arg_in(
                    libc::SYS_ioctl,
                    1,
                    &[
                        libc::FIONREAD as u64,
                        libc::FIONBIO as u64,
                        libc::FIOCLEX as u64,
                        libc::FIONCLEX as u64,
                    ],
                )?;
                self.allow_arg_in(
                    libc::SYS_prctl,
                    0,
                    &[
                        libc::PR_SET_NAME as u64,
                        libc::PR_GET_NAME as u64,
                        libc::PR_GET_SECCOMP as u64,
                        libc::PR_SET_NO_NEW_PRIVS as u64,
                    ],
                )?;
                // Reading limits only: a null new_limit.
                self.allow_when(libc::SYS_prlimit64, vec![pointer_is_null(2)?])?;
            }
            Promise::Rpath => {
                self.allow(RPATH);
                #[cfg(target_arch = "x86_64")]
                self.allow(RPATH_X86_64);
                let write_bits = (libc::O_ACCMODE | libc::O_CREAT | libc::O_TRUNC) as u64;
                self.allow_open_without(write_bits)?;
            }
            Promise::Wpath => {
                self.allow(WPATH);
                self.allow_open_without(libc::O_CREAT as u64)?;
            }
            Promise::Cpath => {
                self.allow(CPATH);
                #[cfg(target_arch = "x86_64")]
                self.allow(CPATH_X86_64);
            }
            Promise::Dpath => {
                self.allow(&[libc::SYS_mknodat]);
                #[cfg(target_arch = "x86_64")]
                self.allow(&[libc::SYS_mknod]);
            }
            Promise::Flock => self.allow(&[libc::SYS_flock, libc::SYS_fcntl]),
            Promise::Tty => self.allow(&[libc::SYS_ioctl]),
            Promise::Recvfd => self.allow(&[libc::SYS_recvmsg]),
            Promise::Fattr => {
                self.allow(FATTR);
                #[cfg(target_arch = "x86_64")]
                self.allow(FATTR_X86_64);
            }
            Promise::Inet | Promise::Dns => {
                self.allow(SOCKET);
                self.allow_arg_in(
                    libc::SYS_socket,
                    0,
                    &[libc::AF_INET as u64, libc::AF_INET6 as u64],
                )?;
            }
            Promise::Unix => {
                self.allow(SOCKET);
                self.allow(&[libc::SYS_socketpair]);
                self.allow_arg_in(libc::SYS_socket, 0, &[libc::AF_UNIX as u64])?;
            }
            Promise::Proc => {
                self.allow(PROC);
                #[cfg(target_arch = "x86_64")]
                self.allow(&[libc::SYS_fork, libc::SYS_vfork]);
            }
            Promise::Thread => self.allow(&[libc::SYS_clone, libc::SYS_clone3]),
            Promise::Id => self.allow(ID),
            Promise::Exec | Promise::ExecNative => {
                self.allow(&[libc::SYS_execve, libc::SYS_execveat])
            }
        }
        Ok(())
    }

    fn into_rules(self) -> BTreeMap<i64, Vec<SeccompRule>> {
        self.calls
            .into_iter()
            .map(|(nr, allow)| match allow {
                // An empty chain matches unconditionally.
                Allow::Always => (nr, Vec::new()),
                Allow::When(rules) => (nr, rules),
            })
            .collect()
    }
}

/// Compile a space-delimited promise string into a BPF program for the host architecture.
pub fn compile(promises: &str) -> Result<BpfProgram> {
    let mut ruleset = Ruleset::default();
    for name in promises.split_whitespace() {
        let Some(promise) = Promise::from_name(name) else {
            return Err(invalid("unknown promise"));
        };
        ruleset.grant(promise)?;
    }

    let target_arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|_| invalid("seccomp does not support this architecture"))?;

    let filter = SeccompFilter::new(
        ruleset.into_rules(),
        SeccompAction::Errno(libc::EPERM as u32),
        SeccompAction::Allow,
        target_arch,
    )
    .map_err(|_| invalid("failed to build seccomp filter"))?;

    filter
        .try_into()
        .map_err(|_| invalid("failed to compile seccomp filter"))
}

/// Restrict the calling process to `promises`. Irreversible.
pub fn pledge(promises: &str) -> Result<()> {
    let bpf = compile(promises)?;
    debug!(promises, instructions = bpf.len(), "installing seccomp filter");

    let 0 = (unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) }) else {
        bail_errno!("prctl(PR_SET_NO_NEW_PRIVS) failed");
    };
    install(&bpf)
}

fn install(bpf: BpfProgramRef) -> Result<()> {
    seccompiler::apply_filter(bpf).map_err(|err| {
        let errno = match &err {
            seccompiler::Error::Prctl(io) | seccompiler::Error::Seccomp(io) => {
                io.raw_os_error().unwrap_or(libc::EINVAL)
            }
            _ => libc::EINVAL,
        };
        Error::from_errno(errno).cause("failed to install seccomp filter")
    })
}

const STDIO: &[i64] = &[
    libc::SYS_read,
    libc::SYS_write,
    libc::SYS_readv,
    libc::SYS_writev,
    libc::SYS_pread64,
    libc::SYS_pwrite64,
    libc::SYS_preadv,
    libc::SYS_pwritev,
    libc::SYS_close,
    libc::SYS_lseek,
    libc::SYS_fstat,
    libc::SYS_newfstatat,
    libc::SYS_statx,
    libc::SYS_dup,
    libc::SYS_dup3,
    libc::SYS_fcntl,
    libc::SYS_ftruncate,
    libc::SYS_fsync,
    libc::SYS_fdatasync,
    libc::SYS_sendfile,
    libc::SYS_pipe2,
    libc::SYS_ppoll,
    libc::SYS_pselect6,
    libc::SYS_epoll_create1,
    libc::SYS_epoll_ctl,
    libc::SYS_epoll_pwait,
    libc::SYS_eventfd2,
    libc::SYS_recvfrom,
    libc::SYS_sendto,
    libc::SYS_recvmsg,
    libc::SYS_sendmsg,
    libc::SYS_shutdown,
    libc::SYS_getsockopt,
    libc::SYS_getsockname,
    libc::SYS_getpeername,
    libc::SYS_brk,
    libc::SYS_mmap,
    libc::SYS_munmap,
    libc::SYS_mremap,
    libc::SYS_mprotect,
    libc::SYS_madvise,
    libc::SYS_msync,
    libc::SYS_getpid,
    libc::SYS_getppid,
    libc::SYS_gettid,
    libc::SYS_getuid,
    libc::SYS_geteuid,
    libc::SYS_getgid,
    libc::SYS_getegid,
    libc::SYS_getresuid,
    libc::SYS_getresgid,
    libc::SYS_getgroups,
    libc::SYS_getpgid,
    libc::SYS_getrusage,
    libc::SYS_getrlimit,
    libc::SYS_getcwd,
    libc::SYS_sysinfo,
    libc::SYS_uname,
    libc::SYS_umask,
    libc::SYS_gettimeofday,
    libc::SYS_clock_gettime,
    libc::SYS_clock_getres,
    libc::SYS_clock_nanosleep,
    libc::SYS_nanosleep,
    libc::SYS_getitimer,
    libc::SYS_setitimer,
    libc::SYS_sched_yield,
    libc::SYS_sched_getaffinity,
    libc::SYS_getrandom,
    libc::SYS_futex,
    libc::SYS_set_robust_list,
    libc::SYS_get_robust_list,
    libc::SYS_set_tid_address,
    libc::SYS_rseq,
    libc::SYS_rt_sigaction,
    libc::SYS_rt_sigprocmask,
    libc::SYS_rt_sigreturn,
    libc::SYS_rt_sigsuspend,
    libc::SYS_rt_sigpending,
    libc::SYS_rt_sigtimedwait,
    libc::SYS_sigaltstack,
    libc::SYS_tgkill,
    libc::SYS_restart_syscall,
    libc::SYS_exit,
    libc::SYS_exit_group,
];

#[cfg(target_arch = "x86_64")]
const STDIO_X86_64: &[i64] = &[
    libc::SYS_arch_prctl,
    libc::SYS_pipe,
    libc::SYS_poll,
    libc::SYS_select,
    libc::SYS_dup2,
    libc::SYS_getpgrp,
    libc::SYS_time,
    libc::SYS_alarm,
    libc::SYS_epoll_wait,
];

const RPATH: &[i64] = &[
    libc::SYS_faccessat,
    libc::SYS_readlinkat,
    libc::SYS_getdents64,
    libc::SYS_chdir,
    libc::SYS_fchdir,
    libc::SYS_statfs,
    libc::SYS_fstatfs,
];

#[cfg(target_arch = "x86_64")]
const RPATH_X86_64: &[i64] = &[
    libc::SYS_stat,
    libc::SYS_lstat,
    libc::SYS_access,
    libc::SYS_readlink,
    libc::SYS_getdents,
];

const WPATH: &[i64] = &[libc::SYS_truncate, libc::SYS_faccessat];

const CPATH: &[i64] = &[
    libc::SYS_openat,
    libc::SYS_mkdirat,
    libc::SYS_unlinkat,
    libc::SYS_renameat,
    libc::SYS_renameat2,
    libc::SYS_linkat,
    libc::SYS_symlinkat,
];

#[cfg(target_arch = "x86_64")]
const CPATH_X86_64: &[i64] = &[
    libc::SYS_open,
    libc::SYS_creat,
    libc::SYS_mkdir,
    libc::SYS_rmdir,
    libc::SYS_unlink,
    libc::SYS_rename,
    libc::SYS_link,
    libc::SYS_symlink,
];

const FATTR: &[i64] = &[
    libc::SYS_fchmod,
    libc::SYS_fchmodat,
    libc::SYS_fchown,
    libc::SYS_fchownat,
    libc::SYS_utimensat,
];

#[cfg(target_arch = "x86_64")]
const FATTR_X86_64: &[i64] = &[
    libc::SYS_chmod,
    libc::SYS_chown,
    libc::SYS_lchown,
    libc::SYS_utime,
    libc::SYS_utimes,
];

const SOCKET: &[i64] = &[
    libc::SYS_connect,
    libc::SYS_bind,
    libc::SYS_listen,
    libc::SYS_accept,
    libc::SYS_accept4,
    libc::SYS_setsockopt,
    libc::SYS_getsockopt,
    libc::SYS_sendto,
    libc::SYS_recvfrom,
    libc::SYS_sendmsg,
    libc::SYS_recvmsg,
];

const PROC: &[i64] = &[
    libc::SYS_clone,
    libc::SYS_clone3,
    libc::SYS_kill,
    libc::SYS_wait4,
    libc::SYS_waitid,
    libc::SYS_setpgid,
    libc::SYS_setsid,
    libc::SYS_getpriority,
    libc::SYS_setpriority,
    libc::SYS_sched_setaffinity,
    libc::SYS_setrlimit,
    libc::SYS_prlimit64,
];

const ID: &[i64] = &[
    libc::SYS_setuid,
    libc::SYS_setgid,
    libc::SYS_setreuid,
    libc::SYS_setregid,
    libc::SYS_setresuid,
    libc::SYS_setresgid,
    libc::SYS_setgroups,
    libc::SYS_setfsuid,
    libc::SYS_setfsgid,
    libc::SYS_setrlimit,
    libc::SYS_prlimit64,
    libc::SYS_setpriority,
];
