#![cfg(target_os = "linux")]

use std::process::{Command, Output};

fn pledge(args: &[&str]) -> eyre::Result<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_pledge"))
        .args(args)
        .env_remove("PLEDGE_LOG")
        .output()?)
}

#[test]
fn missing_program_is_a_usage_error() -> eyre::Result<()> {
    let out = pledge(&[])?;
    assert_eq!(out.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Usage"));

    let out = pledge(&["-M", "plenty", "true"])?;
    assert_eq!(out.status.code(), Some(64));
    Ok(())
}

#[test]
fn help_exits_cleanly() -> eyre::Result<()> {
    let out = pledge(&["-h"])?;
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("-p <PROMISES>"));
    Ok(())
}

#[test]
fn hands_off_to_the_program() -> eyre::Result<()> {
    let out = pledge(&["-p", "stdio rpath", "-M", "1g", "true"])?;
    assert_eq!(
        out.status.code(),
        Some(0),
        "{}",
        String::from_utf8_lossy(&out.stderr)
    );

    // The program's own status comes back unchanged.
    let out = pledge(&["-p", "stdio rpath", "-M", "1g", "false"])?;
    assert_eq!(out.status.code(), Some(1));
    assert!(out.stderr.is_empty());
    Ok(())
}

#[test]
fn tiny_memory_quota_reaches_the_program() -> eyre::Result<()> {
    // With a 1 MB address space the program may not even load, but the launcher itself must
    // get as far as the handoff.
    let out = pledge(&["-p", "stdio rpath", "-M", "1000000", "true"])?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(!stderr.contains("error: "), "{stderr}");
    let code = out.status.code();
    assert!(
        !matches!(code, Some(1..=24 | 64 | 70)),
        "launcher failed with {code:?}: {stderr}"
    );
    Ok(())
}

#[test]
fn unknown_promise_is_refused() -> eyre::Result<()> {
    let out = pledge(&["-p", "stdio frobnicate", "true"])?;
    assert_eq!(out.status.code(), Some(19));
    assert!(String::from_utf8_lossy(&out.stderr).starts_with("error: pledge("));
    Ok(())
}

#[test]
fn unresolvable_program_is_refused() -> eyre::Result<()> {
    let out = pledge(&["no-such-program-anywhere"])?;
    assert_eq!(out.status.code(), Some(10));

    let out = pledge(&["/nonexistent/bin/true"])?;
    assert_eq!(out.status.code(), Some(10));
    Ok(())
}

#[test]
fn missing_chroot_target_is_refused() -> eyre::Result<()> {
    let out = pledge(&["-c", "/nonexistent/jail", "true"])?;
    assert_eq!(out.status.code(), Some(7));
    Ok(())
}
