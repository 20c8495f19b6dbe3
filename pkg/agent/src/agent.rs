// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Top-level session flow: locate the target, attach the requested
//! debugger, publish the reachable address, then hold the session open
//! until the client disconnects, the attachment is deleted, or the agent
//! is told to stop. Whatever ends the session, the attachment is routed to
//! the delete path afterwards; nothing is retried.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::StreamExt;

use squash_api::{AttachmentStore, DebuggerType, RemoteStore, State, StoreError, WriteOpts};

use crate::backends::{self, HostType};
use crate::cri;
use crate::locator::{ContainerTarget, Locator};
use crate::procfs::ProcFs;
use crate::proxy::{self, ProxyError};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub debugger: DebuggerType,
    pub attachment_name: String,
    pub process_match: Option<String>,
    pub cri_socket: PathBuf,
    pub store_socket: PathBuf,
    /// Address this node is reachable at from the developer's machine.
    pub host_addr: String,
}

impl AgentConfig {
    /// The agent is configured entirely through its environment; the
    /// launcher (squashd, or a node-pinned pod template) sets these.
    pub fn from_env() -> Result<Self> {
        Ok(AgentConfig {
            namespace: required("SQUASH_NAMESPACE")?,
            pod: required("SQUASH_POD")?,
            container: required("SQUASH_CONTAINER")?,
            debugger: required("SQUASH_DEBUGGER")?.parse()?,
            attachment_name: required("SQUASH_ATTACHMENT_NAME")?,
            process_match: env::var("SQUASH_PROCESS_MATCH")
                .ok()
                .filter(|pattern| !pattern.is_empty()),
            cri_socket: path_or("SQUASH_CRI_SOCKET", cri::DEFAULT_CRI_SOCKET),
            store_socket: path_or("SQUASH_SERVER_SOCKET", squash_api::DEFAULT_STORE_SOCKET),
            host_addr: env::var("SQUASH_HOST_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string()),
        })
    }
}

fn required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} must be set"))
}

fn path_or(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

enum EndReason {
    SessionOver(Result<(), ProxyError>),
    AttachmentGone,
    Terminated,
}

pub async fn run(config: AgentConfig) -> Result<()> {
    let store = RemoteStore::connect(&config.store_socket)
        .await
        .with_context(|| {
            format!("connecting to store at {}", config.store_socket.display())
        })?;

    let outcome = session(&config, &store).await;
    if let Err(e) = &outcome {
        error!(
            "attachment {}/{} failed: {e:#}",
            config.namespace, config.attachment_name
        );
    }
    // Post-session cleanup and failure handling look the same: hand the
    // attachment to the reconciler's delete path.
    request_delete(&store, &config).await;
    outcome
}

async fn session(config: &AgentConfig, store: &RemoteStore) -> Result<()> {
    let mut locator = Locator::connect(&config.cri_socket, ProcFs::host()).await?;
    let target = locator
        .locate(
            &config.namespace,
            &config.pod,
            &config.container,
            config.process_match.as_deref(),
        )
        .await?;

    let mut server = backends::attach(config.debugger, &target, locator.procfs()).await?;

    // Proxied sessions bind the out port before the address is published so
    // the developer never dials a dead endpoint.
    let listener = match server.host_type() {
        HostType::Client => Some(
            TcpListener::bind(("0.0.0.0", proxy::OUT_PORT))
                .await
                .with_context(|| format!("binding session port {}", proxy::OUT_PORT))?,
        ),
        HostType::Target => None,
    };
    let address = match server.host_type() {
        HostType::Client => format!("{}:{}", config.host_addr, proxy::OUT_PORT),
        HostType::Target => format!("{}:{}", config.host_addr, server.port()),
    };

    if let Err(e) = publish_attached(store, config, &target, &address).await {
        server.detach().await;
        return Err(e);
    }
    info!(
        "attached {} to {}/{}/{} at {address}",
        config.debugger, config.namespace, config.pod, config.container
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let removal = watch_for_removal(store, &config.namespace, &config.attachment_name);
    tokio::pin!(removal);

    let end = match listener {
        Some(listener) => {
            tokio::select! {
                outcome = proxy::serve(listener, &mut server) => EndReason::SessionOver(outcome),
                _ = &mut removal => EndReason::AttachmentGone,
                _ = sigterm.recv() => EndReason::Terminated,
                _ = sigint.recv() => EndReason::Terminated,
            }
        }
        None => {
            tokio::select! {
                _ = &mut removal => EndReason::AttachmentGone,
                _ = sigterm.recv() => EndReason::Terminated,
                _ = sigint.recv() => EndReason::Terminated,
            }
        }
    };

    match end {
        EndReason::SessionOver(outcome) => outcome?,
        EndReason::AttachmentGone => {
            info!("attachment deleted, ending session");
            server.detach().await;
        }
        EndReason::Terminated => {
            info!("stop signal received, ending session");
            server.detach().await;
        }
    }
    Ok(())
}

/// Read-modify-write the attachment to Attached with the session address.
async fn publish_attached(
    store: &RemoteStore,
    config: &AgentConfig,
    target: &ContainerTarget,
    address: &str,
) -> Result<()> {
    let mut current = store
        .read(&config.namespace, &config.attachment_name)
        .await?;
    if !current.status.state.can_transition_to(State::Attached) {
        bail!(
            "attachment {}/{} is {}, refusing to mark it attached",
            config.namespace,
            config.attachment_name,
            current.status.state
        );
    }
    current.status.state = State::Attached;
    current.status.debug_server_address = address.to_string();
    if current.spec.image.is_empty() {
        current.spec.image = target.image.clone();
    }
    store
        .write(current, WriteOpts {
            overwrite_existing: true,
        })
        .await?;
    Ok(())
}

/// Resolves when the attachment disappears or enters the delete path. If
/// the watch cannot be established the session simply loses this end
/// condition; disconnect and signals still apply.
async fn watch_for_removal(store: &RemoteStore, namespace: &str, name: &str) {
    let mut snapshots = match store.watch(namespace).await {
        Ok(snapshots) => snapshots,
        Err(e) => {
            warn!("could not watch own attachment: {e}");
            return std::future::pending().await;
        }
    };
    while let Some(snapshot) = snapshots.next().await {
        let live = snapshot
            .iter()
            .any(|att| att.metadata.name == name && !att.status.state.is_delete_path());
        if !live {
            return;
        }
    }
    // Watch stream ended: squashd is gone, so is the session's reason to be.
}

/// Best-effort hand-off to the delete path; conflicts and transport errors
/// are logged, never retried.
async fn request_delete(store: &RemoteStore, config: &AgentConfig) {
    match store
        .read(&config.namespace, &config.attachment_name)
        .await
    {
        Ok(mut current) => {
            if current.status.state.is_delete_path()
                || !current.status.state.can_transition_to(State::RequestingDelete)
            {
                return;
            }
            current.status.state = State::RequestingDelete;
            current.status.debug_server_address.clear();
            if let Err(e) = store
                .write(current, WriteOpts {
                    overwrite_existing: true,
                })
                .await
            {
                warn!(
                    "could not request deletion of {}/{}: {e}",
                    config.namespace, config.attachment_name
                );
            }
        }
        Err(StoreError::NotFound { .. }) => {}
        Err(e) => warn!(
            "could not read {}/{} for deletion: {e}",
            config.namespace, config.attachment_name
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        // SAFETY: single-threaded with respect to these variables; no other
        // test reads them.
        unsafe {
            env::set_var("SQUASH_NAMESPACE", "default");
            env::set_var("SQUASH_POD", "app-1");
            env::set_var("SQUASH_CONTAINER", "main");
            env::set_var("SQUASH_DEBUGGER", "dlv");
            env::set_var("SQUASH_ATTACHMENT_NAME", "app-1-dbg");
            env::set_var("SQUASH_PROCESS_MATCH", "");
            env::remove_var("SQUASH_CRI_SOCKET");
            env::remove_var("SQUASH_SERVER_SOCKET");
            env::remove_var("SQUASH_HOST_ADDR");
        }

        let config = AgentConfig::from_env().unwrap();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.debugger, DebuggerType::Dlv);
        assert_eq!(config.process_match, None);
        assert_eq!(config.cri_socket, PathBuf::from(cri::DEFAULT_CRI_SOCKET));
        assert_eq!(
            config.store_socket,
            PathBuf::from(squash_api::DEFAULT_STORE_SOCKET)
        );
        assert_eq!(config.host_addr, "127.0.0.1");
    }
}
