// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! gdbserver backend: attach to the pid on an ephemeral port.

use std::process::Stdio;

use tokio::process::Command;

use super::{BackendError, DebugServer};
use crate::procfs::ProcFs;

pub(super) async fn attach(pid: i32, procfs: &ProcFs) -> Result<DebugServer, BackendError> {
    let child = Command::new("gdbserver")
        .args(["--attach", ":0"])
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| BackendError::Spawn {
            debugger: "gdbserver",
            source,
        })?;

    super::server_from_child("gdbserver", child, procfs).await
}
