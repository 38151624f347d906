use std::ffi::CStr;

use c_str_macro::c_str;
use tracing::debug;

use crate::error::LaunchError;
use crate::fsid::FsIdentity;
use crate::identity::Identity;
use crate::sys::Sys;

fn display(path: &CStr) -> String {
    path.to_string_lossy().into_owned()
}

/// Confirm the invoking user can read `target`, checking with the filesystem identity narrowed
/// to the real ids when the process is elevated.
pub fn check_access(
    sys: &mut impl Sys,
    identity: &Identity,
    target: &CStr,
) -> Result<(), LaunchError> {
    let fail = |err| LaunchError::AccessCheck {
        path: display(target),
        err,
    };
    let mut scope = FsIdentity::narrow(
        sys,
        identity.has_elevation(),
        identity.real_uid,
        identity.real_gid,
    )
    .map_err(fail)?;
    scope.sys().access(target, libc::R_OK).map_err(fail)?;
    debug!(path = ?target, "chroot target is readable");
    Ok(())
}

/// Enter `target` and make it the root directory.
///
/// The working directory moves first and the root follows it with `chroot(".")`, so the process
/// never has a root that its working directory lies outside of.
pub fn change_root(sys: &mut impl Sys, target: &CStr) -> Result<(), LaunchError> {
    sys.chdir(target).map_err(|err| LaunchError::Chdir {
        path: display(target),
        err,
    })?;
    sys.chroot(c_str!(".")).map_err(|err| LaunchError::Chroot {
        path: display(target),
        err,
    })?;
    debug!(path = ?target, "changed root");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use crate::testing::{Call, FakeSys};

    #[test]
    fn elevated_check_runs_as_real_user() {
        let mut sys = FakeSys::with_ids(1000, 0, 100, 0);
        sys.accessible.insert("/srv/jail".into());
        let id = identity::analyze(&sys, None, None).unwrap();

        check_access(&mut sys, &id, c_str!("/srv/jail")).unwrap();

        assert!(sys.calls().contains(&Call::Access {
            path: "/srv/jail".into(),
            fsuid: 1000,
            fsgid: 100,
        }));
        assert_eq!((sys.fsuid, sys.fsgid), (0, 0));
    }

    #[test]
    fn unelevated_check_does_not_touch_fs_identity() {
        let mut sys = FakeSys::new();
        sys.accessible.insert("/srv/jail".into());
        let id = identity::analyze(&sys, None, None).unwrap();

        check_access(&mut sys, &id, c_str!("/srv/jail")).unwrap();
        assert_eq!(
            sys.calls(),
            vec![Call::Access {
                path: "/srv/jail".into(),
                fsuid: 1000,
                fsgid: 1000,
            }]
        );
    }

    #[test]
    fn unreadable_target_fails_and_restores() {
        let mut sys = FakeSys::with_ids(1000, 0, 1000, 0);
        let id = identity::analyze(&sys, None, None).unwrap();

        let err = check_access(&mut sys, &id, c_str!("/root/secret")).unwrap_err();
        assert_eq!(err.exit_code(), 7);
        assert_eq!((sys.fsuid, sys.fsgid), (0, 0));
        assert!(!sys
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Chdir(_) | Call::Chroot(_))));
    }

    #[test]
    fn chdir_precedes_chroot() {
        let mut sys = FakeSys::new();
        change_root(&mut sys, c_str!("jail")).unwrap();
        assert_eq!(
            sys.calls(),
            vec![Call::Chdir("jail".into()), Call::Chroot(".".into())]
        );
    }

    #[test]
    fn failed_chdir_skips_chroot() {
        let mut sys = FakeSys::new();
        sys.fail.insert("chdir", libc::ENOTDIR);
        let err = change_root(&mut sys, c_str!("/etc/passwd")).unwrap_err();
        assert_eq!(err.exit_code(), 8);
        assert_eq!(sys.calls(), vec![Call::Chdir("/etc/passwd".into())]);

        let mut sys = FakeSys::new();
        sys.fail.insert("chroot", libc::EPERM);
        assert_eq!(change_root(&mut sys, c_str!("/srv")).unwrap_err().exit_code(), 9);
    }
}
