// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Delve backend: spawn `dlv attach` headless on an ephemeral port.

use std::process::Stdio;

use tokio::process::Command;

use super::{BackendError, DebugServer};
use crate::procfs::ProcFs;

pub(super) async fn attach(pid: i32, procfs: &ProcFs) -> Result<DebugServer, BackendError> {
    let child = Command::new("dlv")
        .arg("attach")
        .arg(pid.to_string())
        .args([
            "--headless",
            "--listen=127.0.0.1:0",
            "--api-version=2",
            "--accept-multiclient",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| BackendError::Spawn {
            debugger: "dlv",
            source,
        })?;

    super::server_from_child("dlv", child, procfs).await
}
