// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Launching and reaping the per-session agent processes.
//!
//! The trait is the seam between the reconciler and whatever runs agents:
//! in production a local process per attachment (squashd runs on the node),
//! in tests a mock. Each agent gets its attachment coordinates through the
//! environment and its output captured to a per-attachment log file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use log::{info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};

use squash_api::DebugAttachment;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const SIGKILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("launching agent for {namespace}/{name}: {source}")]
    Spawn {
        namespace: String,
        name: String,
        source: std::io::Error,
    },
    #[error("preparing agent log for {namespace}/{name}: {source}")]
    LogFile {
        namespace: String,
        name: String,
        source: std::io::Error,
    },
}

/// Creates and destroys the agent serving one attachment.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn create(&self, attachment: &DebugAttachment) -> Result<(), LauncherError>;

    /// Best-effort teardown; must be safe to call for never-launched keys.
    async fn delete(&self, namespace: &str, name: &str);

    /// Captured output of the agent, for post-mortem on failures.
    async fn logs(&self, namespace: &str, name: &str) -> Option<String>;
}

/// Runs `squash-agent` as a child process per attachment.
pub struct ProcessLauncher {
    agent_binary: PathBuf,
    store_socket: PathBuf,
    log_dir: PathBuf,
    children: Mutex<HashMap<(String, String), Child>>,
}

impl ProcessLauncher {
    pub fn new(agent_binary: PathBuf, store_socket: PathBuf, log_dir: PathBuf) -> Self {
        ProcessLauncher {
            agent_binary,
            store_socket,
            log_dir,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn log_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.log_dir.join(format!("{namespace}-{name}.log"))
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn create(&self, attachment: &DebugAttachment) -> Result<(), LauncherError> {
        let (namespace, name) = attachment.key();
        let open_log = || -> std::io::Result<std::fs::File> {
            std::fs::create_dir_all(&self.log_dir)?;
            std::fs::File::create(self.log_path(&namespace, &name))
        };
        let log_file = open_log().map_err(|source| LauncherError::LogFile {
            namespace: namespace.clone(),
            name: name.clone(),
            source,
        })?;
        let stderr_file = log_file
            .try_clone()
            .map_err(|source| LauncherError::LogFile {
                namespace: namespace.clone(),
                name: name.clone(),
                source,
            })?;

        let mut cmd = Command::new(&self.agent_binary);
        cmd.env("SQUASH_NAMESPACE", &attachment.metadata.namespace)
            .env("SQUASH_POD", &attachment.spec.pod)
            .env("SQUASH_CONTAINER", &attachment.spec.container)
            .env("SQUASH_DEBUGGER", attachment.spec.debugger.to_string())
            .env("SQUASH_ATTACHMENT_NAME", &attachment.metadata.name)
            .env("SQUASH_SERVER_SOCKET", &self.store_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file));
        if let Some(pattern) = &attachment.spec.process_match {
            cmd.env("SQUASH_PROCESS_MATCH", pattern);
        }

        let child = cmd.spawn().map_err(|source| LauncherError::Spawn {
            namespace: namespace.clone(),
            name: name.clone(),
            source,
        })?;
        info!(
            "launched agent for {}/{} (pid={})",
            namespace,
            name,
            child.id().unwrap_or(0)
        );
        self.children.lock().await.insert((namespace, name), child);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) {
        let child = self
            .children
            .lock()
            .await
            .remove(&(namespace.to_string(), name.to_string()));
        let Some(mut child) = child else {
            return;
        };
        let Some(pid) = child.id() else {
            let _ = child.wait().await;
            return;
        };

        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("failed to SIGTERM agent {namespace}/{name}: {e}");
        }
        if timeout(STOP_TIMEOUT, child.wait()).await.is_ok() {
            info!("agent for {namespace}/{name} exited");
            return;
        }

        warn!("agent for {namespace}/{name} ignored SIGTERM, sending SIGKILL");
        let _ = child.start_kill();
        if timeout(SIGKILL_TIMEOUT, child.wait()).await.is_err() {
            warn!("agent for {namespace}/{name} still running after SIGKILL, giving up");
        }
    }

    async fn logs(&self, namespace: &str, name: &str) -> Option<String> {
        tokio::fs::read_to_string(self.log_path(namespace, name))
            .await
            .ok()
    }
}
