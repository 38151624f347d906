#[cfg(target_os = "linux")]
use clap::error::ErrorKind;
#[cfg(target_os = "linux")]
use clap::Parser;

#[cfg(target_os = "linux")]
use pledge::{Host, LaunchError, Launcher, Quotas};

#[cfg(target_os = "linux")]
mod cli;

/// Exit status for command line usage errors.
#[cfg(target_os = "linux")]
const EX_USAGE: i32 = 64;

/// Exit status when built for anything but Linux.
#[cfg(not(target_os = "linux"))]
const EX_PLATFORM: i32 = 5;

#[cfg(target_os = "linux")]
fn configure_logging(verbose: bool) {
    let default_verbosity = if verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::WARN
    };
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_verbosity.into())
        .with_env_var("PLEDGE_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::Uptime::default())
        .with_target(false)
        .init();
}

#[cfg(target_os = "linux")]
fn fail(err: LaunchError) -> ! {
    eprintln!("error: {err}");
    std::process::exit(err.exit_code())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("error: this program is only intended for linux");
    std::process::exit(EX_PLATFORM)
}

#[cfg(target_os = "linux")]
fn main() {
    let args = match cli::Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EX_USAGE,
            };
            std::process::exit(code);
        }
    };

    configure_logging(args.verbose);

    let sys = Host;
    let defaults = Quotas::host_defaults(&sys);
    let Some(plan) = args.plan(defaults, std::env::var_os("PATH")) else {
        std::process::exit(EX_USAGE);
    };

    let err = match Launcher::new(sys, plan) {
        Ok(mut launcher) => launcher.run(),
        Err(err) => err,
    };
    fail(err)
}
