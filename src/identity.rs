use tracing::debug;

use crate::error::LaunchError;
use crate::sys::{Ids, Sys};

/// The process identity on entry, plus any ids the caller asked to switch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub real_uid: u32,
    pub effective_uid: u32,
    pub real_gid: u32,
    pub effective_gid: u32,
    pub requested_uid: Option<u32>,
    pub requested_gid: Option<u32>,
}

impl Identity {
    pub fn new(ids: Ids, requested_uid: Option<u32>, requested_gid: Option<u32>) -> Identity {
        Identity {
            real_uid: ids.real_uid,
            effective_uid: ids.effective_uid,
            real_gid: ids.real_gid,
            effective_gid: ids.effective_gid,
            requested_uid,
            requested_gid,
        }
    }

    /// Whether the real and effective user ids differ (a setuid bit).
    pub fn has_user_elevation(&self) -> bool {
        self.real_uid != self.effective_uid
    }

    /// Whether the real and effective group ids differ (a setgid bit).
    pub fn has_group_elevation(&self) -> bool {
        self.real_gid != self.effective_gid
    }

    /// Whether the process started with ambient elevation on either axis.
    pub fn has_elevation(&self) -> bool {
        self.has_user_elevation() || self.has_group_elevation()
    }
}

/// Read the entry identity and reject explicit id overrides on an elevated process, so that
/// elevation can never be redirected to an id chosen on the command line.
pub fn analyze(
    sys: &impl Sys,
    requested_uid: Option<u32>,
    requested_gid: Option<u32>,
) -> Result<Identity, LaunchError> {
    let identity = Identity::new(sys.ids(), requested_uid, requested_gid);
    debug!(
        uid = identity.real_uid,
        euid = identity.effective_uid,
        gid = identity.real_gid,
        egid = identity.effective_gid,
        elevated = identity.has_elevation(),
        "analyzed identity"
    );
    if identity.has_elevation() && (requested_uid.is_some() || requested_gid.is_some()) {
        return Err(LaunchError::IdentityOverride);
    }
    Ok(identity)
}
