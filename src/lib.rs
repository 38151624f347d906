#![cfg(target_os = "linux")]

mod libc_util;

pub mod error;
pub mod sys;

pub mod promise;
pub mod quota;
mod seccomp;

pub mod fds;
pub mod fsid;
pub mod identity;
pub mod privdrop;
pub mod resolve;
pub mod rlimit;
pub mod root;

pub mod launch;

#[cfg(test)]
mod testing;

pub use error::{Error, LaunchError};
pub use launch::{LaunchPlan, Launcher, Stage};
pub use quota::{parse_size, Quotas};
pub use sys::{Host, Sys};

/// In test builds, use alloc_counter to verify at runtime that the handoff to the launched
/// program does not allocate.
#[cfg(debug_assertions)]
#[global_allocator]
static ALLOC: alloc_counter::AllocCounterSystem = alloc_counter::AllocCounterSystem;
