use std::ffi::c_int;

use tracing::debug;

use crate::error::LaunchError;
use crate::sys::{Resource, Sys};

/// Upper bound on the number of descriptors inspected.
pub const MAX_POLL_FDS: usize = 256;

/// Window used when `RLIMIT_NOFILE` cannot be read.
const FALLBACK_POLL_FDS: usize = 64;

/// How many descriptors to inspect: the open-file soft limit, clamped to `[3, MAX_POLL_FDS]`.
pub fn poll_window(sys: &impl Sys) -> usize {
    match sys.getrlimit(Resource::Files) {
        Ok(lim) => usize::try_from(lim.cur)
            .unwrap_or(MAX_POLL_FDS)
            .clamp(3, MAX_POLL_FDS),
        Err(_) => FALLBACK_POLL_FDS,
    }
}

/// Make sure descriptors 0, 1 and 2 are open, pointing missing ones at `/dev/null`, and close
/// every other descriptor in the poll window.
pub fn normalize(sys: &mut impl Sys) -> Result<(), LaunchError> {
    let n = poll_window(sys);
    let mut pfds = [libc::pollfd {
        fd: -1,
        events: 0,
        revents: 0,
    }; MAX_POLL_FDS];
    for (fd, pfd) in pfds[..n].iter_mut().enumerate() {
        pfd.fd = fd as c_int;
        pfd.events = libc::POLLIN;
    }

    // One batched validity check, zero timeout.
    sys.poll(&mut pfds[..n]).map_err(LaunchError::Poll)?;

    for pfd in &pfds[..3] {
        if pfd.revents & libc::POLLNVAL == 0 {
            continue;
        }
        let fd = sys.open_null().map_err(LaunchError::OpenNull)?;
        if fd != pfd.fd {
            return Err(LaunchError::DescriptorMismatch {
                got: fd,
                want: pfd.fd,
            });
        }
        debug!(fd, "opened /dev/null for missing standard descriptor");
    }

    for pfd in &pfds[3..n] {
        if pfd.revents & libc::POLLNVAL != 0 {
            continue;
        }
        sys.close(pfd.fd).map_err(|err| LaunchError::Close { fd: pfd.fd, err })?;
        debug!(fd = pfd.fd, "closed inherited descriptor");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::Rlimit;
    use crate::testing::{Call, FakeSys};

    #[test]
    fn window_follows_nofile_limit() {
        let mut sys = FakeSys::new();
        assert_eq!(poll_window(&sys), MAX_POLL_FDS);

        sys.limits.insert(Resource::Files, Rlimit { cur: 20, max: 20 });
        assert_eq!(poll_window(&sys), 20);

        sys.limits.insert(Resource::Files, Rlimit { cur: 1, max: 1 });
        assert_eq!(poll_window(&sys), 3);

        sys.fail.insert("getrlimit", libc::EINVAL);
        assert_eq!(poll_window(&sys), 64);
    }

    #[test]
    fn fills_standard_descriptors_and_closes_the_rest() {
        let mut sys = FakeSys::new();
        sys.open_fds = [1, 5].into_iter().collect();

        normalize(&mut sys).unwrap();

        assert_eq!(sys.open_fds, [0, 1, 2].into_iter().collect());
        assert_eq!(
            sys.calls(),
            vec![
                Call::Poll(MAX_POLL_FDS),
                Call::OpenNull,
                Call::OpenNull,
                Call::Close(5),
            ]
        );
    }

    #[test]
    fn already_normal_table_is_untouched() {
        let mut sys = FakeSys::new();
        normalize(&mut sys).unwrap();
        assert_eq!(sys.calls(), vec![Call::Poll(MAX_POLL_FDS)]);
    }

    #[test]
    fn null_device_on_wrong_descriptor_is_fatal() {
        let mut sys = FakeSys::new();
        sys.open_fds = [1, 2].into_iter().collect();
        sys.hidden_fds = [0].into_iter().collect();

        let err = normalize(&mut sys).unwrap_err();
        assert!(matches!(err, LaunchError::DescriptorMismatch { got: 3, want: 0 }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn failures_map_to_their_own_codes() {
        let mut sys = FakeSys::new();
        sys.fail.insert("poll", libc::ENOMEM);
        assert_eq!(normalize(&mut sys).unwrap_err().exit_code(), 1);

        let mut sys = FakeSys::new();
        sys.open_fds = [1, 2].into_iter().collect();
        sys.fail.insert("open_null", libc::ENOENT);
        assert_eq!(normalize(&mut sys).unwrap_err().exit_code(), 2);

        let mut sys = FakeSys::new();
        sys.open_fds.insert(7);
        sys.fail.insert("close", libc::EIO);
        let err = normalize(&mut sys).unwrap_err();
        assert!(matches!(err, LaunchError::Close { fd: 7, .. }));
        assert_eq!(err.exit_code(), 4);
    }
}
