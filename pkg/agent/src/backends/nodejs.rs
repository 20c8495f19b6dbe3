// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Node.js backend: SIGUSR1 makes the runtime start its built-in debug
//! listener. Legacy runtimes bind the V8 debug protocol on 5858; node 8+
//! binds the inspector protocol on 9229.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::{BackendError, DebugServer};

pub const LEGACY_PORT: u16 = 5858;
pub const INSPECTOR_PORT: u16 = 9229;

pub(super) fn attach(pid: i32, port: u16) -> Result<DebugServer, BackendError> {
    signal::kill(Pid::from_raw(pid), Signal::SIGUSR1)
        .map_err(|source| BackendError::Signal { pid, source })?;
    Ok(DebugServer::in_target(port))
}
