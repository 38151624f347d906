//! Scoped narrowing of the filesystem identity.
//!
//! Linux checks file permissions against the filesystem uid/gid, which normally track the
//! effective ids. [`FsIdentity`] temporarily points them at the real ids so a path lookup runs
//! with only the invoking user's rights, and puts them back when dropped, on every exit path.

use tracing::debug;

use crate::error::{Error, Result};
use crate::sys::Sys;

/// Passed to `setfsuid`/`setfsgid` to read the current value without changing it.
const QUERY: u32 = u32::MAX;

/// A narrowed filesystem identity. Restores the previous one on drop.
pub struct FsIdentity<'a, S: Sys> {
    sys: &'a mut S,
    saved: Option<(u32, u32)>,
}

impl<'a, S: Sys> FsIdentity<'a, S> {
    /// Switch the filesystem ids to `uid`/`gid` if `narrow` is set; otherwise leave them alone.
    ///
    /// Fails if the kernel does not report the new ids afterwards. The previous ids are restored
    /// before the error is returned.
    pub fn narrow(sys: &'a mut S, narrow: bool, uid: u32, gid: u32) -> Result<FsIdentity<'a, S>> {
        if !narrow {
            return Ok(FsIdentity { sys, saved: None });
        }

        let old_gid = sys.setfsgid(gid);
        let old_uid = sys.setfsuid(uid);
        let guard = FsIdentity {
            sys,
            saved: Some((old_uid, old_gid)),
        };

        let now_gid = guard.sys.setfsgid(QUERY);
        let now_uid = guard.sys.setfsuid(QUERY);
        if now_uid != uid || now_gid != gid {
            return Err(Error::from_errno(libc::EPERM).cause("filesystem identity did not change"));
        }
        debug!(fsuid = uid, fsgid = gid, "narrowed filesystem identity");
        Ok(guard)
    }

    pub fn sys(&mut self) -> &mut S {
        self.sys
    }
}

impl<S: Sys> Drop for FsIdentity<'_, S> {
    fn drop(&mut self) {
        if let Some((uid, gid)) = self.saved.take() {
            self.sys.setfsuid(uid);
            self.sys.setfsgid(gid);
            debug!(fsuid = uid, fsgid = gid, "restored filesystem identity");
        }
    }
}
