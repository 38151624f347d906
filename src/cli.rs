use std::ffi::OsString;

use clap::Parser;

use pledge::{parse_size, LaunchPlan, Quotas};

/// Run a program with reduced privileges, resource quotas and a restricted system call surface.
#[derive(Parser, Debug)]
#[command(name = "pledge", disable_version_flag = true)]
pub struct Args {
    /// Promises to allow, space separated. May be given more than once [default: "stdio rpath"]
    #[arg(short = 'p', value_name = "PROMISES")]
    pub promises: Vec<String>,

    /// Run as this user id
    #[arg(short = 'u', value_name = "UID")]
    pub uid: Option<u32>,

    /// Run as this group id
    #[arg(short = 'g', value_name = "GID")]
    pub gid: Option<u32>,

    /// Confine the program to this directory
    #[arg(short = 'c', value_name = "PATH")]
    pub chroot: Option<OsString>,

    /// Run at the lowest scheduling and I/O priority
    #[arg(short = 'n')]
    pub nice: bool,

    /// Leave inherited file descriptors alone
    #[arg(short = 'N')]
    pub keep_descriptors: bool,

    /// CPU time limit in seconds, scaled to the host clock
    #[arg(short = 'C', value_name = "SECS", allow_negative_numbers = true)]
    pub cpu_seconds: Option<i64>,

    /// Address space limit in bytes (k, m, g, t are powers of 1024)
    #[arg(short = 'M', value_name = "BYTES", value_parser = memory_size)]
    pub memory: Option<i64>,

    /// Process count limit
    #[arg(short = 'P', value_name = "COUNT", allow_negative_numbers = true)]
    pub processes: Option<i64>,

    /// File size limit in bytes (k, m, g, t are powers of 1000)
    #[arg(short = 'F', value_name = "BYTES", value_parser = file_size)]
    pub file_size: Option<i64>,

    /// Log each launch step to stderr
    #[arg(short = 'v')]
    pub verbose: bool,

    /// The program to run, followed by its arguments
    #[arg(
        value_name = "PROG",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<OsString>,
}

fn memory_size(s: &str) -> Result<i64, String> {
    parse_size(s, 1024).ok_or_else(|| format!("invalid size: {s}"))
}

fn file_size(s: &str) -> Result<i64, String> {
    parse_size(s, 1000).ok_or_else(|| format!("invalid size: {s}"))
}

impl Args {
    /// Apply the flags on top of `defaults`.
    pub fn quotas(&self, defaults: Quotas) -> Quotas {
        Quotas {
            cpu_seconds: self.cpu_seconds.or(defaults.cpu_seconds),
            memory_bytes: self.memory.or(defaults.memory_bytes),
            file_size_bytes: self.file_size.or(defaults.file_size_bytes),
            max_processes: self.processes.or(defaults.max_processes),
        }
    }

    /// Build the launch plan. `None` if no program was named.
    pub fn plan(&self, defaults: Quotas, search_path: Option<OsString>) -> Option<LaunchPlan> {
        let (program, args) = self.command.split_first()?;
        let mut plan = LaunchPlan::new(program.clone());
        plan.args(args.iter().cloned())
            .quotas(self.quotas(defaults))
            .nice(self.nice)
            .normalize_descriptors(!self.keep_descriptors);
        for group in &self.promises {
            plan.promises(group.as_str());
        }
        if let Some(uid) = self.uid {
            plan.uid(uid);
        }
        if let Some(gid) = self.gid {
            plan.gid(gid);
        }
        if let Some(path) = &self.chroot {
            plan.chroot(path.clone());
        }
        if let Some(path) = search_path {
            plan.search_path(path);
        }
        Some(plan)
    }
}
