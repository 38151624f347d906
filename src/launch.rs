use std::ffi::{c_char, CString, OsStr, OsString};
use std::os::unix::ffi::OsStringExt;
use std::ptr;

use tracing::{debug, span, Level};

use crate::error::{LaunchError, Result};
use crate::identity::{self, Identity};
use crate::quota::Quotas;
use crate::sys::Sys;
use crate::{fds, libc_util, privdrop, promise, resolve, rlimit, root};

/// A step of the launch pipeline. The process only ever moves forward through these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Start,
    PolicyResolved,
    ResourcesLimited,
    DescriptorsNormalized,
    IdentityAnalyzed,
    AccessChecked,
    RootChanged,
    ProgramResolved,
    GroupDropped,
    UserDropped,
    SandboxApplied,
    Launched,
}

impl Stage {
    /// The transition function. `to` must be the step directly after `self`; the two chroot
    /// steps are taken exactly when there is a chroot target.
    pub fn transition(self, to: Stage, has_chroot: bool) -> std::result::Result<Stage, LaunchError> {
        use Stage::*;
        let allowed = match (self, to) {
            (Start, PolicyResolved)
            | (PolicyResolved, ResourcesLimited)
            | (ResourcesLimited, DescriptorsNormalized)
            | (DescriptorsNormalized, IdentityAnalyzed)
            | (ProgramResolved, GroupDropped)
            | (GroupDropped, UserDropped)
            | (UserDropped, SandboxApplied)
            | (SandboxApplied, Launched) => true,
            (IdentityAnalyzed, AccessChecked) | (AccessChecked, RootChanged) | (RootChanged, ProgramResolved) => {
                has_chroot
            }
            (IdentityAnalyzed, ProgramResolved) => !has_chroot,
            _ => false,
        };
        if allowed {
            Ok(to)
        } else {
            Err(LaunchError::OutOfOrder { from: self, to })
        }
    }
}

/// Everything the pipeline needs to know, plus what it learns on the way.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    // What to run.
    program: OsString,
    args: Vec<OsString>,
    search_path: Option<OsString>,

    // What the caller asked for.
    requested_promises: Vec<String>,
    quotas: Quotas,
    requested_uid: Option<u32>,
    requested_gid: Option<u32>,
    chroot_target: Option<OsString>,
    nice: bool,
    normalize_descriptors: bool,

    /// The canonical promise string, once resolved.
    pub policy: Option<String>,
    /// The entry identity, once analyzed.
    pub identity: Option<Identity>,
    pub resolved_program: Option<CString>,
    pub did_normalize_descriptors: bool,
}

impl LaunchPlan {
    /// Plan to run `program`, looked up on the search path unless it contains a slash.
    pub fn new(program: impl Into<OsString>) -> LaunchPlan {
        let program = program.into();
        LaunchPlan {
            args: vec![program.clone()],
            program,
            search_path: None,
            requested_promises: Vec::new(),
            quotas: Quotas::default(),
            requested_uid: None,
            requested_gid: None,
            chroot_target: None,
            nice: false,
            normalize_descriptors: true,
            policy: None,
            identity: None,
            resolved_program: None,
            did_normalize_descriptors: false,
        }
    }

    /// Append an argument.
    pub fn arg(&mut self, arg: impl Into<OsString>) -> &mut LaunchPlan {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args(&mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> &mut LaunchPlan {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Search these colon-separated directories instead of the default path.
    pub fn search_path(&mut self, path: impl Into<OsString>) -> &mut LaunchPlan {
        self.search_path = Some(path.into());
        self
    }

    /// Append a space-separated group of promise names.
    pub fn promises(&mut self, group: impl Into<String>) -> &mut LaunchPlan {
        self.requested_promises.push(group.into());
        self
    }

    pub fn quotas(&mut self, quotas: Quotas) -> &mut LaunchPlan {
        self.quotas = quotas;
        self
    }

    /// Run as this user id. Refused if the process is elevated.
    pub fn uid(&mut self, uid: u32) -> &mut LaunchPlan {
        self.requested_uid = Some(uid);
        self
    }

    /// Run as this group id. Refused if the process is elevated.
    pub fn gid(&mut self, gid: u32) -> &mut LaunchPlan {
        self.requested_gid = Some(gid);
        self
    }

    /// Confine the program to `path`.
    pub fn chroot(&mut self, path: impl Into<OsString>) -> &mut LaunchPlan {
        self.chroot_target = Some(path.into());
        self
    }

    /// Run the program at idle priority.
    pub fn nice(&mut self, enabled: bool) -> &mut LaunchPlan {
        self.nice = enabled;
        self
    }

    /// Whether to fix up descriptors 0-2 and close the rest. On by default.
    pub fn normalize_descriptors(&mut self, enabled: bool) -> &mut LaunchPlan {
        self.normalize_descriptors = enabled;
        self
    }

    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> impl Iterator<Item = &OsStr> {
        self.args.iter().map(|a| a.as_os_str())
    }

    pub fn get_quotas(&self) -> &Quotas {
        &self.quotas
    }

    /// Whether the process started elevated. False until the identity has been analyzed.
    pub fn has_elevation(&self) -> bool {
        self.identity.is_some_and(|id| id.has_elevation())
    }
}

/// The argument and environment vectors for `execve`, built while allocation is still harmless.
struct Handoff {
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv: Vec<*const c_char>,
    envp: Vec<*const c_char>,
}

impl Handoff {
    fn prepare(args: &[OsString]) -> Result<Handoff> {
        let argv_buf = args
            .iter()
            .map(libc_util::cstring)
            .collect::<Result<Vec<_>>>()?;
        let envp_buf = std::env::vars_os()
            .map(|(k, v)| {
                let mut kv = k.into_vec();
                kv.push(b'=');
                kv.extend(v.into_vec());
                libc_util::cstring(OsString::from_vec(kv))
            })
            .collect::<Result<Vec<_>>>()?;

        // The CStrings own their heap buffers, so these pointers stay valid while they live.
        let mut argv: Vec<*const c_char> = argv_buf.iter().map(|a| a.as_ptr()).collect();
        argv.push(ptr::null());
        let mut envp: Vec<*const c_char> = envp_buf.iter().map(|e| e.as_ptr()).collect();
        envp.push(ptr::null());

        Ok(Handoff {
            _argv: argv_buf,
            _envp: envp_buf,
            argv,
            envp,
        })
    }
}

/// Drives a [`LaunchPlan`] through each [`Stage`] in order against `S`.
pub struct Launcher<S: Sys> {
    sys: S,
    plan: LaunchPlan,
    stage: Stage,
    chroot_target: Option<CString>,
    handoff: Handoff,
}

impl<S: Sys> Launcher<S> {
    pub fn new(sys: S, plan: LaunchPlan) -> std::result::Result<Launcher<S>, LaunchError> {
        let chroot_target = match &plan.chroot_target {
            Some(path) => Some(libc_util::cstring(path).map_err(|err| {
                LaunchError::AccessCheck {
                    path: path.to_string_lossy().into_owned(),
                    err,
                }
            })?),
            None => None,
        };
        let handoff = Handoff::prepare(&plan.args).map_err(|err| LaunchError::Exec {
            path: plan.program.to_string_lossy().into_owned(),
            err,
        })?;
        Ok(Launcher {
            sys,
            plan,
            stage: Stage::Start,
            chroot_target,
            handoff,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    pub fn sys(&self) -> &S {
        &self.sys
    }

    /// Move to `to`, or refuse if it is not the next step. A refused or failed step is never
    /// retried, since the stage has already moved on.
    fn enter(&mut self, to: Stage) -> std::result::Result<(), LaunchError> {
        self.stage = self
            .stage
            .transition(to, self.chroot_target.is_some())?;
        debug!(stage = ?to, "entering stage");
        Ok(())
    }

    fn identity(&self) -> std::result::Result<Identity, LaunchError> {
        self.plan.identity.ok_or(LaunchError::OutOfOrder {
            from: self.stage,
            to: Stage::IdentityAnalyzed,
        })
    }

    pub fn resolve_policy(&mut self) -> std::result::Result<(), LaunchError> {
        self.enter(Stage::PolicyResolved)?;
        let policy = promise::resolve(self.plan.requested_promises.iter().map(String::as_str));
        debug!(%policy, "resolved policy");
        self.plan.policy = Some(policy);
        Ok(())
    }

    pub fn limit_resources(&mut self) -> std::result::Result<(), LaunchError> {
        self.enter(Stage::ResourcesLimited)?;
        rlimit::apply(&mut self.sys, &self.plan.quotas, self.plan.nice)
    }

    pub fn normalize_descriptors(&mut self) -> std::result::Result<(), LaunchError> {
        self.enter(Stage::DescriptorsNormalized)?;
        if self.plan.normalize_descriptors {
            fds::normalize(&mut self.sys)?;
            self.plan.did_normalize_descriptors = true;
        }
        Ok(())
    }

    pub fn analyze_identity(&mut self) -> std::result::Result<(), LaunchError> {
        self.enter(Stage::IdentityAnalyzed)?;
        let identity = identity::analyze(
            &self.sys,
            self.plan.requested_uid,
            self.plan.requested_gid,
        )?;
        self.plan.identity = Some(identity);
        Ok(())
    }

    pub fn check_access(&mut self) -> std::result::Result<(), LaunchError> {
        self.enter(Stage::AccessChecked)?;
        let identity = self.identity()?;
        if let Some(target) = &self.chroot_target {
            root::check_access(&mut self.sys, &identity, target)?;
        }
        Ok(())
    }

    pub fn change_root(&mut self) -> std::result::Result<(), LaunchError> {
        self.enter(Stage::RootChanged)?;
        if let Some(target) = &self.chroot_target {
            root::change_root(&mut self.sys, target)?;
        }
        Ok(())
    }

    pub fn resolve_program(&mut self) -> std::result::Result<(), LaunchError> {
        self.enter(Stage::ProgramResolved)?;
        let identity = self.identity()?;
        let path = resolve::resolve_program(
            &mut self.sys,
            &identity,
            &self.plan.program,
            self.plan.search_path.as_deref(),
        )?;
        self.plan.resolved_program = Some(path);
        Ok(())
    }

    pub fn drop_group(&mut self) -> std::result::Result<(), LaunchError> {
        self.enter(Stage::GroupDropped)?;
        let identity = self.identity()?;
        privdrop::drop_group(&mut self.sys, &identity)
    }

    pub fn drop_user(&mut self) -> std::result::Result<(), LaunchError> {
        self.enter(Stage::UserDropped)?;
        let identity = self.identity()?;
        privdrop::drop_user(&mut self.sys, &identity)
    }

    /// Apply the promise set. Nothing but [`Launcher::launch`] may follow.
    pub fn apply_sandbox(&mut self) -> std::result::Result<(), LaunchError> {
        self.enter(Stage::SandboxApplied)?;
        let Some(policy) = self.plan.policy.as_deref() else {
            return Err(LaunchError::OutOfOrder {
                from: self.stage,
                to: Stage::PolicyResolved,
            });
        };
        debug!(%policy, "applying promises");
        self.sys
            .pledge(policy)
            .map_err(|err| LaunchError::Pledge {
                promises: policy.to_owned(),
                err,
            })
    }

    /// Replace the process image with the resolved program. Only returns on failure.
    pub fn launch(&mut self) -> LaunchError {
        if let Err(err) = self.enter(Stage::Launched) {
            return err;
        }
        let Some(path) = &self.plan.resolved_program else {
            return LaunchError::OutOfOrder {
                from: self.stage,
                to: Stage::ProgramResolved,
            };
        };
        let err = self
            .sys
            .execve(path, &self.handoff.argv, &self.handoff.envp);
        LaunchError::Exec {
            path: path.to_string_lossy().into_owned(),
            err,
        }
    }

    fn prepare(&mut self) -> std::result::Result<(), LaunchError> {
        self.resolve_policy()?;
        self.limit_resources()?;
        self.normalize_descriptors()?;
        self.analyze_identity()?;
        if self.chroot_target.is_some() {
            self.check_access()?;
            self.change_root()?;
        }
        self.resolve_program()?;
        self.drop_group()?;
        self.drop_user()?;
        self.apply_sandbox()
    }

    /// Run every step and hand off to the program. Only returns on failure.
    pub fn run(&mut self) -> LaunchError {
        let span = span!(Level::DEBUG, "launch", program = ?self.plan.program);
        let _enter = span.enter();
        match self.prepare() {
            Ok(()) => self.launch(),
            Err(err) => err,
        }
    }
}
