//! Promise names and the canonical policy string.

/// Promises used when the caller names none.
pub const DEFAULT_PROMISES: &str = "stdio rpath";

/// The promise the launcher needs for its own final `execve`. Always present in a resolved
/// policy.
pub const EXEC_NATIVE: &str = "execnative";

/// A named grant of a narrow category of system calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Promise {
    /// Standard I/O and benign system calls.
    Stdio,
    /// Read-only path operations.
    Rpath,
    /// Write path operations.
    Wpath,
    /// Create and remove paths.
    Cpath,
    /// Create special files.
    Dpath,
    Flock,
    /// Terminal ioctls.
    Tty,
    /// Receive descriptors over local sockets.
    Recvfd,
    /// Change file attributes.
    Fattr,
    /// IPv4 and IPv6 sockets.
    Inet,
    /// Local sockets.
    Unix,
    /// Name resolution.
    Dns,
    /// fork, clone and friends.
    Proc,
    Thread,
    /// setuid and friends.
    Id,
    Exec,
    ExecNative,
}

impl Promise {
    pub const ALL: [Promise; 17] = [
        Promise::Stdio,
        Promise::Rpath,
        Promise::Wpath,
        Promise::Cpath,
        Promise::Dpath,
        Promise::Flock,
        Promise::Tty,
        Promise::Recvfd,
        Promise::Fattr,
        Promise::Inet,
        Promise::Unix,
        Promise::Dns,
        Promise::Proc,
        Promise::Thread,
        Promise::Id,
        Promise::Exec,
        Promise::ExecNative,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Promise::Stdio => "stdio",
            Promise::Rpath => "rpath",
            Promise::Wpath => "wpath",
            Promise::Cpath => "cpath",
            Promise::Dpath => "dpath",
            Promise::Flock => "flock",
            Promise::Tty => "tty",
            Promise::Recvfd => "recvfd",
            Promise::Fattr => "fattr",
            Promise::Inet => "inet",
            Promise::Unix => "unix",
            Promise::Dns => "dns",
            Promise::Proc => "proc",
            Promise::Thread => "thread",
            Promise::Id => "id",
            Promise::Exec => "exec",
            Promise::ExecNative => EXEC_NATIVE,
        }
    }

    pub fn from_name(name: &str) -> Option<Promise> {
        Promise::ALL.into_iter().find(|p| p.name() == name)
    }
}

impl std::fmt::Display for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Collapse space-delimited promise groups into one deduplicated, order-preserving policy string
/// ending in [`EXEC_NATIVE`].
///
/// Names are not validated here; the sandbox primitive rejects unknown ones.
pub fn resolve<'a>(groups: impl IntoIterator<Item = &'a str>) -> String {
    let mut names: Vec<&str> = Vec::new();
    for name in groups.into_iter().flat_map(str::split_whitespace) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    if names.is_empty() {
        names.extend(DEFAULT_PROMISES.split_whitespace());
    }
    if !names.contains(&EXEC_NATIVE) {
        names.push(EXEC_NATIVE);
    }
    names.join(" ")
}
