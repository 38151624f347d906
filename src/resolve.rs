use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;

use tracing::debug;

use crate::error::{Error, LaunchError, Result};
use crate::fsid::FsIdentity;
use crate::identity::Identity;
use crate::libc_util;
use crate::sys::Sys;

/// Search path used when `PATH` is unset.
pub const DEFAULT_PATH: &str = "/bin:/usr/local/bin:/usr/bin";

/// Locate `program` the way a shell would, with the filesystem identity narrowed to the real ids
/// when the process is elevated.
pub fn resolve_program(
    sys: &mut impl Sys,
    identity: &Identity,
    program: &OsStr,
    search_path: Option<&OsStr>,
) -> std::result::Result<CString, LaunchError> {
    let fail = |err| LaunchError::NotFound {
        program: program.to_string_lossy().into_owned(),
        err,
    };
    let mut scope = FsIdentity::narrow(
        sys,
        identity.has_elevation(),
        identity.real_uid,
        identity.real_gid,
    )
    .map_err(fail)?;
    let search_path = search_path.unwrap_or(OsStr::new(DEFAULT_PATH));
    let found = find(scope.sys(), program, search_path).map_err(fail)?;
    debug!(program = ?found, "resolved program");
    Ok(found)
}

/// Whether `path` is a regular file the filesystem identity may execute.
fn check_executable(sys: &impl Sys, path: &CStr) -> Result<()> {
    let mode = sys.file_mode(path)?;
    if mode & libc::S_IFMT != libc::S_IFREG {
        return Err(Error::from_errno(libc::EACCES).cause("not a regular file"));
    }
    sys.access(path, libc::X_OK)
}

fn find(sys: &impl Sys, program: &OsStr, search_path: &OsStr) -> Result<CString> {
    let name = program.as_bytes();
    if name.is_empty() {
        return Err(Error::from_errno(libc::ENOENT).cause("empty program name"));
    }

    // Names with a slash are used as-is.
    if name.contains(&b'/') {
        let path = libc_util::cstring(program)?;
        check_executable(sys, &path)?;
        return Ok(path);
    }

    // Like execvp(3), remember a permission failure over a plain miss.
    let mut last = Error::from_errno(libc::ENOENT).cause("command not found");
    for dir in search_path.as_bytes().split(|&b| b == b':') {
        let dir: &[u8] = if dir.is_empty() { b"." } else { dir };
        let mut candidate = Vec::with_capacity(dir.len() + 1 + name.len());
        candidate.extend_from_slice(dir);
        candidate.push(b'/');
        candidate.extend_from_slice(name);
        if candidate.len() >= libc::PATH_MAX as usize {
            continue;
        }
        let candidate = libc_util::cstring(OsStr::from_bytes(&candidate))?;
        match check_executable(sys, &candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.errno == libc::EACCES => last = err,
            Err(_) => {}
        }
    }
    Err(last)
}
