//! A recording, in-memory [`Sys`] for exercising the pipeline without touching the test runner's
//! own identity, limits or descriptors.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::{c_char, c_int, CStr};

use crate::error::{Error, Result};
use crate::sys::{Ids, ResIds, Resource, Rlimit, Sys};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Setresuid(u32),
    Setresgid(u32),
    Setgroups(Vec<u32>),
    Setfsuid(u32),
    Setfsgid(u32),
    Access { path: String, fsuid: u32, fsgid: u32 },
    FileMode { path: String, fsuid: u32 },
    Chdir(String),
    Chroot(String),
    Setrlimit(Resource, Rlimit),
    MakeIdle,
    Poll(usize),
    OpenNull,
    Close(c_int),
    Pledge(String),
    Execve(String),
}

pub struct FakeSys {
    pub calls: RefCell<Vec<Call>>,
    pub ids: Ids,
    pub uids: ResIds,
    pub gids: ResIds,
    pub fsuid: u32,
    pub fsgid: u32,
    /// Whether the caller may raise hard limits and change ids at will.
    pub privileged: bool,
    pub limits: HashMap<Resource, Rlimit>,
    pub open_fds: BTreeSet<c_int>,
    /// Occupied descriptors that `poll` reports as invalid.
    pub hidden_fds: BTreeSet<c_int>,
    /// Paths `access` succeeds on.
    pub accessible: HashSet<String>,
    /// `st_mode` of known paths.
    pub files: HashMap<String, u32>,
    /// Operations that fail with the given errno.
    pub fail: HashMap<&'static str, c_int>,
    /// `setres*id` report success without changing anything.
    pub broken_setid: bool,
    /// `setfs*id` silently ignore their argument.
    pub broken_setfsid: bool,
    pub cpu_mhz: Option<u32>,
    pub memory: Option<u64>,
    pub cpus: u32,
}

const UNLIMITED: Rlimit = Rlimit {
    cur: libc::RLIM_INFINITY,
    max: libc::RLIM_INFINITY,
};

impl FakeSys {
    /// An unelevated process running as uid/gid 1000 with descriptors 0-2 open.
    pub fn new() -> FakeSys {
        FakeSys::with_ids(1000, 1000, 1000, 1000)
    }

    pub fn with_ids(real_uid: u32, effective_uid: u32, real_gid: u32, effective_gid: u32) -> FakeSys {
        let limits = [
            (Resource::Cpu, UNLIMITED),
            (Resource::FileSize, UNLIMITED),
            (Resource::AddressSpace, UNLIMITED),
            (Resource::Processes, Rlimit { cur: 4096, max: 4096 }),
            (Resource::Files, Rlimit { cur: 1024, max: 4096 }),
        ];
        FakeSys {
            calls: RefCell::new(Vec::new()),
            ids: Ids {
                real_uid,
                effective_uid,
                real_gid,
                effective_gid,
            },
            uids: ResIds {
                real: real_uid,
                effective: effective_uid,
                saved: effective_uid,
            },
            gids: ResIds {
                real: real_gid,
                effective: effective_gid,
                saved: effective_gid,
            },
            fsuid: effective_uid,
            fsgid: effective_gid,
            privileged: effective_uid == 0,
            limits: limits.into_iter().collect(),
            open_fds: [0, 1, 2].into_iter().collect(),
            hidden_fds: BTreeSet::new(),
            accessible: HashSet::new(),
            files: HashMap::new(),
            fail: HashMap::new(),
            broken_setid: false,
            broken_setfsid: false,
            cpu_mhz: Some(3100),
            memory: Some(8 << 30),
            cpus: 4,
        }
    }

    /// Register an executable regular file.
    pub fn add_program(&mut self, path: &str) {
        self.files.insert(path.to_owned(), libc::S_IFREG | 0o755);
        self.accessible.insert(path.to_owned());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }

    fn check(&self, op: &'static str) -> Result<()> {
        match self.fail.get(op) {
            Some(&errno) => Err(Error::from_errno(errno).cause(op)),
            None => Ok(()),
        }
    }

    fn may_set(&self, current: &ResIds, id: u32) -> bool {
        self.privileged || id == current.real || id == current.effective || id == current.saved
    }
}

fn lossy(path: &CStr) -> String {
    path.to_string_lossy().into_owned()
}

impl Sys for FakeSys {
    fn ids(&self) -> Ids {
        self.ids
    }

    fn getresuid(&self) -> Result<ResIds> {
        self.check("getresuid")?;
        Ok(self.uids)
    }

    fn getresgid(&self) -> Result<ResIds> {
        self.check("getresgid")?;
        Ok(self.gids)
    }

    fn setresuid(&mut self, uid: u32) -> Result<()> {
        self.record(Call::Setresuid(uid));
        self.check("setresuid")?;
        if !self.may_set(&self.uids, uid) {
            return Err(Error::from_errno(libc::EPERM));
        }
        if !self.broken_setid {
            self.uids = ResIds {
                real: uid,
                effective: uid,
                saved: uid,
            };
            self.fsuid = uid;
            self.privileged = uid == 0;
        }
        Ok(())
    }

    fn setresgid(&mut self, gid: u32) -> Result<()> {
        self.record(Call::Setresgid(gid));
        self.check("setresgid")?;
        if !self.may_set(&self.gids, gid) {
            return Err(Error::from_errno(libc::EPERM));
        }
        if !self.broken_setid {
            self.gids = ResIds {
                real: gid,
                effective: gid,
                saved: gid,
            };
            self.fsgid = gid;
        }
        Ok(())
    }

    fn setgroups(&mut self, groups: &[u32]) -> Result<()> {
        self.record(Call::Setgroups(groups.to_vec()));
        self.check("setgroups")
    }

    fn setfsuid(&mut self, uid: u32) -> u32 {
        let old = self.fsuid;
        if uid != u32::MAX {
            self.record(Call::Setfsuid(uid));
            if !self.broken_setfsid {
                self.fsuid = uid;
            }
        }
        old
    }

    fn setfsgid(&mut self, gid: u32) -> u32 {
        let old = self.fsgid;
        if gid != u32::MAX {
            self.record(Call::Setfsgid(gid));
            if !self.broken_setfsid {
                self.fsgid = gid;
            }
        }
        old
    }

    fn access(&self, path: &CStr, _mode: c_int) -> Result<()> {
        let path = lossy(path);
        self.record(Call::Access {
            path: path.clone(),
            fsuid: self.fsuid,
            fsgid: self.fsgid,
        });
        if self.accessible.contains(&path) {
            Ok(())
        } else {
            Err(Error::from_errno(libc::EACCES).cause("access failed"))
        }
    }

    fn file_mode(&self, path: &CStr) -> Result<u32> {
        let path = lossy(path);
        self.record(Call::FileMode {
            path: path.clone(),
            fsuid: self.fsuid,
        });
        match self.files.get(&path) {
            Some(&mode) => Ok(mode),
            None => Err(Error::from_errno(libc::ENOENT).cause("failed to stat file")),
        }
    }

    fn chdir(&mut self, path: &CStr) -> Result<()> {
        self.record(Call::Chdir(lossy(path)));
        self.check("chdir")
    }

    fn chroot(&mut self, path: &CStr) -> Result<()> {
        self.record(Call::Chroot(lossy(path)));
        self.check("chroot")
    }

    fn getrlimit(&self, resource: Resource) -> Result<Rlimit> {
        self.check("getrlimit")?;
        Ok(self.limits[&resource])
    }

    fn setrlimit(&mut self, resource: Resource, limit: Rlimit) -> Result<()> {
        self.record(Call::Setrlimit(resource, limit));
        self.check("setrlimit")?;
        if limit.cur > limit.max {
            return Err(Error::from_errno(libc::EINVAL));
        }
        if !self.privileged && limit.max > self.limits[&resource].max {
            return Err(Error::from_errno(libc::EPERM));
        }
        self.limits.insert(resource, limit);
        Ok(())
    }

    fn make_idle(&mut self) -> Result<()> {
        self.record(Call::MakeIdle);
        self.check("make_idle")
    }

    fn base_cpu_mhz(&self) -> Option<u32> {
        self.cpu_mhz
    }

    fn total_memory(&self) -> Option<u64> {
        self.memory
    }

    fn cpu_count(&self) -> u32 {
        self.cpus
    }

    fn poll(&mut self, fds: &mut [libc::pollfd]) -> Result<()> {
        self.record(Call::Poll(fds.len()));
        self.check("poll")?;
        for pfd in fds.iter_mut() {
            pfd.revents = if self.open_fds.contains(&pfd.fd) {
                0
            } else {
                libc::POLLNVAL
            };
        }
        Ok(())
    }

    fn open_null(&mut self) -> Result<c_int> {
        self.record(Call::OpenNull);
        self.check("open_null")?;
        let fd = (0..)
            .find(|fd| !self.open_fds.contains(fd) && !self.hidden_fds.contains(fd))
            .unwrap_or(0);
        self.open_fds.insert(fd);
        Ok(fd)
    }

    fn close(&mut self, fd: c_int) -> Result<()> {
        self.record(Call::Close(fd));
        self.check("close")?;
        if !self.open_fds.remove(&fd) {
            return Err(Error::from_errno(libc::EBADF));
        }
        Ok(())
    }

    fn pledge(&mut self, promises: &str) -> Result<()> {
        self.record(Call::Pledge(promises.to_owned()));
        self.check("pledge")
    }

    fn execve(&mut self, path: &CStr, argv: &[*const c_char], envp: &[*const c_char]) -> Error {
        assert_eq!(argv.last(), Some(&std::ptr::null()));
        assert_eq!(envp.last(), Some(&std::ptr::null()));
        self.record(Call::Execve(lossy(path)));
        Error::from_errno(self.fail.get("execve").copied().unwrap_or(libc::ENOEXEC))
            .cause("execve failed")
    }
}
