// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use log::warn;
use tokio::net::UnixStream;
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::{Code, Status};
use tower::service_fn;

use crate::attachment::DebugAttachment;
use crate::proto::v1 as pb;
use crate::proto::v1::attachment_store_client::AttachmentStoreClient;
use crate::store::{AttachmentSnapshots, AttachmentStore, DeleteOpts, StoreError, WriteOpts};

/// Store client talking to squashd over its unix socket.
#[derive(Clone)]
pub struct RemoteStore {
    client: AttachmentStoreClient<Channel>,
}

impl RemoteStore {
    pub async fn connect(socket_path: &Path) -> Result<Self, StoreError> {
        let path: PathBuf = socket_path.to_path_buf();
        // The URI is required by the endpoint builder but never resolved;
        // the connector below dials the unix socket instead.
        let endpoint = Endpoint::try_from("http://squashd")
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let channel = endpoint
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(stream))
                }
            }))
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(RemoteStore {
            client: AttachmentStoreClient::new(channel),
        })
    }

    fn map_status(status: Status, namespace: &str, name: &str) -> StoreError {
        match status.code() {
            Code::AlreadyExists => StoreError::AlreadyExists {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            Code::NotFound => StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            Code::InvalidArgument => StoreError::Malformed {
                context: status.message().to_string(),
            },
            _ => StoreError::Transport(status.to_string()),
        }
    }
}

#[async_trait]
impl AttachmentStore for RemoteStore {
    async fn write(
        &self,
        attachment: DebugAttachment,
        opts: WriteOpts,
    ) -> Result<DebugAttachment, StoreError> {
        let (namespace, name) = attachment.key();
        let mut client = self.client.clone();
        let resp = client
            .write(pb::WriteRequest {
                attachment: Some(attachment.into()),
                overwrite_existing: opts.overwrite_existing,
            })
            .await
            .map_err(|s| Self::map_status(s, &namespace, &name))?;
        DebugAttachment::try_from(resp.into_inner())
    }

    async fn read(&self, namespace: &str, name: &str) -> Result<DebugAttachment, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .read(pb::ReadRequest {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .await
            .map_err(|s| Self::map_status(s, namespace, name))?;
        DebugAttachment::try_from(resp.into_inner())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<DebugAttachment>, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .list(pb::ListRequest {
                namespace: namespace.to_string(),
            })
            .await
            .map_err(|s| Self::map_status(s, namespace, ""))?;
        resp.into_inner()
            .attachments
            .into_iter()
            .map(DebugAttachment::try_from)
            .collect()
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        opts: DeleteOpts,
    ) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client
            .delete(pb::DeleteRequest {
                namespace: namespace.to_string(),
                name: name.to_string(),
                ignore_not_exist: opts.ignore_not_exist,
            })
            .await
            .map_err(|s| Self::map_status(s, namespace, name))?;
        Ok(())
    }

    async fn watch(&self, namespace: &str) -> Result<AttachmentSnapshots, StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .watch(pb::WatchRequest {
                namespace: namespace.to_string(),
            })
            .await
            .map_err(|s| Self::map_status(s, namespace, ""))?;

        // The stream ends on the first transport error; the watcher decides
        // whether to reconnect.
        let stream = resp
            .into_inner()
            .take_while(|item| item.is_ok())
            .filter_map(|item| item.ok())
            .map(|list| {
                list.attachments
                    .into_iter()
                    .filter_map(|msg| match DebugAttachment::try_from(msg) {
                        Ok(att) => Some(att),
                        Err(e) => {
                            warn!("dropping malformed attachment from watch: {e}");
                            None
                        }
                    })
                    .collect()
            });
        Ok(Box::pin(stream))
    }
}
