//! Lethal-signal delivery
//!
//! The single place the crate touches raw `kill(2)`. Everything else
//! forbids unsafe code; this module only wraps the one syscall the
//! enforcement engine needs to terminate a violating process.

#![allow(unsafe_code)]

use std::io;

use crate::Pid;

/// Deliver SIGKILL to `pid`.
pub fn kill_process(pid: Pid) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
