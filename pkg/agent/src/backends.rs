// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Per-language debugger attach logic behind one `attach` entry point.
//!
//! Two shapes exist. `Client` backends (dlv, gdb) spawn a local debug server
//! against the target pid, wait for it to bind, and hand back a child that
//! must be proxied and reaped. `Target` backends (java, nodejs, python) make
//! the target process itself serve the debug protocol, so the session dials
//! it directly and there is nothing to reap.

pub mod dlv;
pub mod gdb;
pub mod java;
pub mod nodejs;
pub mod python;

use std::path::PathBuf;
use std::process::ExitStatus;

use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::Child;
use tokio::time::{Duration, Instant, sleep, timeout};

use squash_api::DebuggerType;

use crate::locator::ContainerTarget;
use crate::ports::{self, PortsError};
use crate::procfs::ProcFs;

/// Total budget for a spawned debug server to bind its port.
const BIND_BUDGET: Duration = Duration::from_secs(10);
const BIND_POLL_INITIAL: Duration = Duration::from_millis(100);
const BIND_POLL_MAX: Duration = Duration::from_secs(1);

const DETACH_TERM_TIMEOUT: Duration = Duration::from_secs(5);
const DETACH_KILL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to spawn {debugger}: {source}")]
    Spawn {
        debugger: &'static str,
        source: std::io::Error,
    },
    #[error("{debugger} (pid {pid}) did not bind a port within {budget:?}")]
    PortNotBound {
        debugger: &'static str,
        pid: i32,
        budget: Duration,
    },
    #[error(transparent)]
    Ports(#[from] PortsError),
    #[error("signaling pid {pid}: {source}")]
    Signal { pid: i32, source: nix::Error },
    #[error("pid {pid} has no jdwp agent configured")]
    JdwpNotConfigured { pid: i32 },
    #[error("no ptvsd.enable_attach call found under {dir}")]
    PtvsdNotFound { dir: PathBuf },
}

/// Whether the debug endpoint is a helper we spawned or the target itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostType {
    Client,
    Target,
}

/// Live debug endpoint handle, owned by the agent for the session.
pub struct DebugServer {
    port: u16,
    host_type: HostType,
    child: Option<Child>,
}

impl DebugServer {
    pub(crate) fn spawned(port: u16, child: Child) -> Self {
        DebugServer {
            port,
            host_type: HostType::Client,
            child: Some(child),
        }
    }

    pub(crate) fn in_target(port: u16) -> Self {
        DebugServer {
            port,
            host_type: HostType::Target,
            child: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host_type(&self) -> HostType {
        self.host_type
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    /// Tear down a spawned debug server: SIGTERM, then SIGKILL stragglers,
    /// always reaping. A no-op for `Target` servers. Never fails; teardown
    /// problems are logged.
    pub async fn detach(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let Some(pid) = child.id() else {
            // Already exited; collect the status.
            let _ = child.wait().await;
            return;
        };

        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("failed to SIGTERM debug server pid {pid}: {e}");
        }
        if timeout(DETACH_TERM_TIMEOUT, child.wait()).await.is_ok() {
            info!("debug server pid {pid} exited");
            return;
        }

        warn!("debug server pid {pid} ignored SIGTERM, sending SIGKILL");
        let _ = child.start_kill();
        if timeout(DETACH_KILL_TIMEOUT, child.wait()).await.is_err() {
            warn!("debug server pid {pid} still running after SIGKILL, giving up");
        }
    }
}

/// Attach the requested debugger to the located target.
pub async fn attach(
    debugger: DebuggerType,
    target: &ContainerTarget,
    procfs: &ProcFs,
) -> Result<DebugServer, BackendError> {
    match debugger {
        DebuggerType::Dlv => dlv::attach(target.pid, procfs).await,
        DebuggerType::Gdb => gdb::attach(target.pid, procfs).await,
        DebuggerType::Java => java::attach(target, procfs),
        DebuggerType::Nodejs => nodejs::attach(target.pid, nodejs::LEGACY_PORT),
        DebuggerType::Nodejs8 => nodejs::attach(target.pid, nodejs::INSPECTOR_PORT),
        DebuggerType::Python => python::attach(target, procfs),
    }
}

/// Waits for a freshly spawned debug server to bind exactly one listening
/// port, polling with backoff. On any failure the child is killed and reaped
/// so no zombie survives the attempt.
async fn server_from_child(
    debugger: &'static str,
    mut child: Child,
    procfs: &ProcFs,
) -> Result<DebugServer, BackendError> {
    let result = match child.id() {
        Some(pid) => wait_for_listen(debugger, pid as i32, procfs).await,
        None => Err(BackendError::PortNotBound {
            debugger,
            pid: 0,
            budget: BIND_BUDGET,
        }),
    };
    match result {
        Ok(port) => {
            info!("{debugger} listening on port {port}");
            Ok(DebugServer::spawned(port, child))
        }
        Err(e) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(e)
        }
    }
}

async fn wait_for_listen(
    debugger: &'static str,
    pid: i32,
    procfs: &ProcFs,
) -> Result<u16, BackendError> {
    let deadline = Instant::now() + BIND_BUDGET;
    let mut delay = BIND_POLL_INITIAL;
    loop {
        match ports::listening_port(procfs, pid) {
            Ok(port) => return Ok(port),
            // Not bound yet; keep polling until the budget runs out.
            Err(PortsError::NoListeningPort { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        if Instant::now() + delay > deadline {
            return Err(BackendError::PortNotBound {
                debugger,
                pid,
                budget: BIND_BUDGET,
            });
        }
        debug!("{debugger} pid {pid} not bound yet, retrying in {delay:?}");
        sleep(delay).await;
        delay = (delay * 2).min(BIND_POLL_MAX);
    }
}

/// Await the spawned child's exit; pends forever for `Target` servers.
pub async fn wait_child(server: &mut DebugServer) -> Option<std::io::Result<ExitStatus>> {
    match server.child_mut() {
        Some(child) => Some(child.wait().await),
        None => std::future::pending().await,
    }
}
