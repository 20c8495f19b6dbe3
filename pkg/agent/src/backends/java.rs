// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! JDWP backend: nothing is spawned. The JVM must already carry a jdwp
//! agent; its listen port is parsed out of the command line or the standard
//! option environment variables.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::{BackendError, DebugServer};
use crate::locator::ContainerTarget;
use crate::procfs::ProcFs;

// Matches both -agentlib:jdwp=...address=[host:]PORT and the older
// -Xrunjdwp:...address=[host:]PORT spellings.
static JDWP_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:agentlib:jdwp=|Xrunjdwp:)\S*?address=(?:[^\s,:]*:)?(\d+)")
        .expect("jdwp address pattern")
});

pub(super) fn attach(
    target: &ContainerTarget,
    procfs: &ProcFs,
) -> Result<DebugServer, BackendError> {
    let cmdline = procfs.cmdline(target.pid).unwrap_or_default();
    let port = jdwp_port(&cmdline, &target.env)
        .ok_or(BackendError::JdwpNotConfigured { pid: target.pid })?;
    Ok(DebugServer::in_target(port))
}

/// The jdwp listen port, checking the command line first and then the
/// option environment variables the JVM honors.
pub fn jdwp_port(cmdline: &str, env: &HashMap<String, String>) -> Option<u16> {
    let from = |text: &str| {
        JDWP_ADDRESS
            .captures(text)
            .and_then(|captures| captures.get(1)?.as_str().parse().ok())
    };
    from(cmdline)
        .or_else(|| env.get("JAVA_TOOL_OPTIONS").and_then(|opts| from(opts)))
        .or_else(|| env.get("_JAVA_OPTIONS").and_then(|opts| from(opts)))
}
