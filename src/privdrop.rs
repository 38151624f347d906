//! Irreversible identity drops: group first, then user.
//!
//! Each drop sets real, effective and saved ids together and then reads all three back. Anything
//! other than the intended id on every slot is treated as a subverted system call.

use tracing::debug;

use crate::error::{Axis, LaunchError, Result};
use crate::identity::Identity;
use crate::sys::{ResIds, Sys};

fn set_ids(sys: &mut impl Sys, axis: Axis, id: u32) -> Result<()> {
    match axis {
        Axis::Group => sys.setresgid(id),
        Axis::User => sys.setresuid(id),
    }
}

fn get_ids(sys: &impl Sys, axis: Axis) -> Result<ResIds> {
    match axis {
        Axis::Group => sys.getresgid(),
        Axis::User => sys.getresuid(),
    }
}

/// What a drop is doing: returning to the real id, or adopting one from the command line.
#[derive(Clone, Copy)]
enum Target {
    Real(u32),
    Requested(u32),
}

impl Target {
    fn id(self) -> u32 {
        match self {
            Target::Real(id) | Target::Requested(id) => id,
        }
    }

    fn failed(self, axis: Axis, err: crate::error::Error) -> LaunchError {
        match self {
            Target::Real(id) => LaunchError::DropToReal { axis, id, err },
            Target::Requested(id) => LaunchError::AdoptRequested { axis, id, err },
        }
    }

    fn broken(self, axis: Axis, ids: ResIds) -> LaunchError {
        let ResIds {
            real,
            effective,
            saved,
        } = ids;
        match self {
            Target::Real(want) => LaunchError::RealDropBroken {
                axis,
                want,
                real,
                effective,
                saved,
            },
            Target::Requested(want) => LaunchError::RequestedDropBroken {
                axis,
                want,
                real,
                effective,
                saved,
            },
        }
    }
}

fn target(real: u32, effective: u32, requested: Option<u32>) -> Option<Target> {
    if real != effective {
        Some(Target::Real(real))
    } else {
        requested.map(Target::Requested)
    }
}

fn switch(sys: &mut impl Sys, axis: Axis, target: Target) -> std::result::Result<(), LaunchError> {
    let id = target.id();
    set_ids(sys, axis, id).map_err(|err| target.failed(axis, err))?;

    // A failed read-back leaves the drop unconfirmed, which is as bad as a failed drop.
    let now = get_ids(sys, axis).map_err(|err| target.failed(axis, err))?;
    if !now.all_equal(id) {
        return Err(target.broken(axis, now));
    }
    debug!(%axis, real = now.real, effective = now.effective, saved = now.saved, "dropped identity");
    Ok(())
}

/// Drop setgid elevation to the real gid, or else adopt the requested gid, if any.
pub fn drop_group(sys: &mut impl Sys, identity: &Identity) -> std::result::Result<(), LaunchError> {
    let Some(target) = target(
        identity.real_gid,
        identity.effective_gid,
        identity.requested_gid,
    ) else {
        return Ok(());
    };
    if let Target::Requested(gid) = target {
        // Root would otherwise keep its supplementary groups.
        if identity.effective_uid == 0 {
            sys.setgroups(&[gid])
                .map_err(|err| target.failed(Axis::Group, err))?;
        }
    }
    switch(sys, Axis::Group, target)
}

/// Drop setuid elevation to the real uid, or else adopt the requested uid, if any. Must run after
/// [`drop_group`].
pub fn drop_user(sys: &mut impl Sys, identity: &Identity) -> std::result::Result<(), LaunchError> {
    let Some(target) = target(
        identity.real_uid,
        identity.effective_uid,
        identity.requested_uid,
    ) else {
        return Ok(());
    };
    switch(sys, Axis::User, target)
}
