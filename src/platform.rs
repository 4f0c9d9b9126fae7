//! Process spawning and liveness probing (§4.5.4, §4.5.5, §9).
//!
//! `libc` covers low-level primitives elsewhere in the crate; here a `nix` dependency is
//! added as the idiomatic safe wrapper over the same syscalls (`kill`, `setsid`) instead of
//! hand-rolling raw `libc::kill` calls, with a single-process fallback for non-unix targets.

use std::process::{Command, Stdio};

use crate::errors::FossilError;

/// Probe whether the process identified by `pid` is still alive. Per §4.5.5, a false positive
/// on a recently reused PID is acceptable: the lease length bounds how long it can delay
/// progress.
pub trait Liveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Real OS-backed liveness probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLiveness;

#[cfg(unix)]
impl Liveness for ProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }
}

#[cfg(not(unix))]
impl Liveness for ProcessLiveness {
    fn is_alive(&self, _pid: u32) -> bool {
        // No portable liveness probe without unix signals; callers on this platform are
        // expected to run the scheduler in-process with no-delay forced on (§4.5.4).
        false
    }
}

/// Spawn `argv` as a detached child whose stdio is redirected to the null device, returning
/// its process id. On unix the child calls `setsid` so it survives the parent exiting.
#[cfg(unix)]
pub fn spawn_detached(argv: &[String]) -> Result<u32, FossilError> {
    use std::os::unix::process::CommandExt;

    let (program, args) = argv
        .split_first()
        .ok_or_else(|| FossilError::Usage("spawn_detached: empty argv".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }
    let child = cmd.spawn().map_err(FossilError::Io)?;
    Ok(child.id())
}

/// No portable detach primitive without unix process groups; callers on this platform should
/// prefer `run_foreground` with no-delay forced on (§4.5.4).
#[cfg(not(unix))]
pub fn spawn_detached(_argv: &[String]) -> Result<u32, FossilError> {
    Err(FossilError::Usage(
        "spawn_detached is unsupported on this platform".into(),
    ))
}

/// Run `argv` to completion in the foreground, inheriting stdio, returning its exit status.
pub fn run_foreground(argv: &[String], env: &[(String, String)]) -> Result<i32, FossilError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| FossilError::Usage("run_foreground: empty argv".into()))?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    for (k, v) in env {
        cmd.env(k, v);
    }
    let status = cmd.status().map_err(FossilError::Io)?;
    Ok(status.code().unwrap_or(-1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        let probe = ProcessLiveness;
        assert!(probe.is_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_never_alive() {
        let probe = ProcessLiveness;
        assert!(!probe.is_alive(0));
    }

    #[test]
    fn run_foreground_reports_exit_code() {
        let status = run_foreground(&["true".to_string()], &[]).unwrap();
        assert_eq!(status, 0);
    }
}
