// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Minimal CRI runtime client over the node's unix socket.
//!
//! Two API generations exist in the wild; the current `runtime.v1` service
//! is attempted first and `runtime.v1alpha2` is used when the Version probe
//! fails. All calls are short blocking RPCs bounded by a one second timeout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use log::{debug, info};
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::proto::{v1, v1alpha2};

/// Default CRI socket path on the node.
pub const DEFAULT_CRI_SOCKET: &str = "/var/run/cri.sock";

const CALL_TIMEOUT: Duration = Duration::from_secs(1);
const EXEC_TIMEOUT_SECS: i64 = 1;

// Label keys the kubelet stamps on sandboxes and containers.
pub const LABEL_POD_NAME: &str = "io.kubernetes.pod.name";
pub const LABEL_POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
pub const LABEL_CONTAINER_NAME: &str = "io.kubernetes.container.name";

#[derive(Error, Debug)]
pub enum CriError {
    #[error("container runtime unreachable at {socket}: {context}")]
    Unreachable { socket: PathBuf, context: String },
    #[error("runtime call {call} failed: {status}")]
    Call {
        call: &'static str,
        status: Box<tonic::Status>,
    },
    #[error("runtime call {call} timed out")]
    Timeout { call: &'static str },
    #[error("exec in container {container} exited {exit_code}: {stderr}")]
    ExecFailed {
        container: String,
        exit_code: i32,
        stderr: String,
    },
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
}

enum Generation {
    V1(v1::runtime_service_client::RuntimeServiceClient<Channel>),
    V1Alpha2(v1alpha2::runtime_service_client::RuntimeServiceClient<Channel>),
}

pub struct RuntimeClient {
    inner: Generation,
}

async fn dial(socket_path: &Path) -> Result<Channel, CriError> {
    let path = socket_path.to_path_buf();
    let endpoint = Endpoint::try_from("http://cri").map_err(|e| CriError::Unreachable {
        socket: path.clone(),
        context: e.to_string(),
    })?;
    let dial_path = path.clone();
    endpoint
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = dial_path.clone();
            async move {
                let stream = UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .map_err(|e| CriError::Unreachable {
            socket: path,
            context: e.to_string(),
        })
}

async fn bounded<T, F>(call: &'static str, fut: F) -> Result<T, CriError>
where
    F: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
{
    match tokio::time::timeout(CALL_TIMEOUT, fut).await {
        Ok(Ok(resp)) => Ok(resp.into_inner()),
        Ok(Err(status)) => Err(CriError::Call {
            call,
            status: Box::new(status),
        }),
        Err(_) => Err(CriError::Timeout { call }),
    }
}

/// Runs `$body` with `$pb` aliased to the generation's proto module and
/// `$client` bound to its client, so each RPC is written once.
macro_rules! per_generation {
    ($self:ident, $pb:ident, $client:ident, $body:expr) => {
        match &mut $self.inner {
            Generation::V1($client) => {
                use crate::proto::v1 as $pb;
                $body
            }
            Generation::V1Alpha2($client) => {
                use crate::proto::v1alpha2 as $pb;
                $body
            }
        }
    };
}

impl RuntimeClient {
    /// Connect and probe: v1 first, v1alpha2 on probe failure.
    pub async fn connect(socket_path: &Path) -> Result<Self, CriError> {
        let channel = dial(socket_path).await?;

        let mut v1_client = v1::runtime_service_client::RuntimeServiceClient::new(channel.clone());
        match bounded(
            "Version",
            v1_client.version(v1::VersionRequest::default()),
        )
        .await
        {
            Ok(version) => {
                info!(
                    "connected to {} {} (CRI v1)",
                    version.runtime_name, version.runtime_version
                );
                return Ok(RuntimeClient {
                    inner: Generation::V1(v1_client),
                });
            }
            Err(e) => debug!("CRI v1 probe failed ({e}), trying v1alpha2"),
        }

        let mut alpha_client =
            v1alpha2::runtime_service_client::RuntimeServiceClient::new(channel);
        let version = bounded(
            "Version",
            alpha_client.version(v1alpha2::VersionRequest::default()),
        )
        .await?;
        info!(
            "connected to {} {} (CRI v1alpha2)",
            version.runtime_name, version.runtime_version
        );
        Ok(RuntimeClient {
            inner: Generation::V1Alpha2(alpha_client),
        })
    }

    /// Ready sandboxes matching the given label selector.
    pub async fn list_ready_sandboxes(
        &mut self,
        label_selector: HashMap<String, String>,
    ) -> Result<Vec<Sandbox>, CriError> {
        per_generation!(self, pb, client, {
            let request = pb::ListPodSandboxRequest {
                filter: Some(pb::PodSandboxFilter {
                    id: String::new(),
                    state: Some(pb::PodSandboxStateValue {
                        state: pb::PodSandboxState::SandboxReady as i32,
                    }),
                    label_selector,
                }),
            };
            let resp = bounded("ListPodSandbox", client.list_pod_sandbox(request)).await?;
            Ok(resp
                .items
                .into_iter()
                .map(|sandbox| Sandbox { id: sandbox.id })
                .collect())
        })
    }

    /// Running containers of a sandbox matching the label selector.
    pub async fn list_running_containers(
        &mut self,
        sandbox_id: &str,
        label_selector: HashMap<String, String>,
    ) -> Result<Vec<ContainerSummary>, CriError> {
        per_generation!(self, pb, client, {
            let request = pb::ListContainersRequest {
                filter: Some(pb::ContainerFilter {
                    id: String::new(),
                    state: Some(pb::ContainerStateValue {
                        state: pb::ContainerState::ContainerRunning as i32,
                    }),
                    pod_sandbox_id: sandbox_id.to_string(),
                    label_selector,
                }),
            };
            let resp = bounded("ListContainers", client.list_containers(request)).await?;
            Ok(resp
                .containers
                .into_iter()
                .map(|container| ContainerSummary {
                    id: container.id,
                    name: container
                        .metadata
                        .map(|meta| meta.name)
                        .unwrap_or_default(),
                    image: container.image_ref,
                })
                .collect())
        })
    }

    /// Run a command inside a container; returns stdout. Bounded by the CRI
    /// side timeout plus a slightly larger local one.
    pub async fn exec_sync(
        &mut self,
        container_id: &str,
        cmd: &[&str],
    ) -> Result<String, CriError> {
        per_generation!(self, pb, client, {
            let request = pb::ExecSyncRequest {
                container_id: container_id.to_string(),
                cmd: cmd.iter().map(|s| s.to_string()).collect(),
                timeout: EXEC_TIMEOUT_SECS,
            };
            let fut = client.exec_sync(request);
            let resp = match tokio::time::timeout(CALL_TIMEOUT * 2, fut).await {
                Ok(Ok(resp)) => resp.into_inner(),
                Ok(Err(status)) => {
                    return Err(CriError::Call {
                        call: "ExecSync",
                        status: Box::new(status),
                    });
                }
                Err(_) => return Err(CriError::Timeout { call: "ExecSync" }),
            };
            if resp.exit_code != 0 {
                return Err(CriError::ExecFailed {
                    container: container_id.to_string(),
                    exit_code: resp.exit_code,
                    stderr: String::from_utf8_lossy(&resp.stderr).into_owned(),
                });
            }
            Ok(String::from_utf8_lossy(&resp.stdout).into_owned())
        })
    }
}
