// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! gRPC surface of the attachment store, served on a unix socket.
//!
//! No network port is consumed and filesystem permissions gate access;
//! squashctl and the agents dial the socket directly.

use std::pin::Pin;
use std::sync::Arc;

use log::info;
use tokio::net::UnixListener;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use squash_api::proto::v1 as pb;
use squash_api::proto::v1::attachment_store_server::{
    AttachmentStore as AttachmentStoreRpc, AttachmentStoreServer,
};
use squash_api::{AttachmentStore, DebugAttachment, DeleteOpts, StoreError, WriteOpts};

pub struct StoreService {
    store: Arc<dyn AttachmentStore>,
}

impl StoreService {
    pub fn new(store: Arc<dyn AttachmentStore>) -> Self {
        StoreService { store }
    }
}

fn to_status(err: StoreError) -> Status {
    match &err {
        StoreError::AlreadyExists { .. } => Status::already_exists(err.to_string()),
        StoreError::NotFound { .. } => Status::not_found(err.to_string()),
        StoreError::Malformed { .. } => Status::invalid_argument(err.to_string()),
        StoreError::Transport(_) => Status::unavailable(err.to_string()),
    }
}

#[tonic::async_trait]
impl AttachmentStoreRpc for StoreService {
    async fn write(
        &self,
        request: Request<pb::WriteRequest>,
    ) -> Result<Response<pb::DebugAttachment>, Status> {
        let msg = request.into_inner();
        let attachment = msg
            .attachment
            .ok_or_else(|| Status::invalid_argument("missing attachment"))?;
        let attachment = DebugAttachment::try_from(attachment).map_err(to_status)?;
        let written = self
            .store
            .write(attachment, WriteOpts {
                overwrite_existing: msg.overwrite_existing,
            })
            .await
            .map_err(to_status)?;
        Ok(Response::new(written.into()))
    }

    async fn read(
        &self,
        request: Request<pb::ReadRequest>,
    ) -> Result<Response<pb::DebugAttachment>, Status> {
        let msg = request.into_inner();
        let attachment = self
            .store
            .read(&msg.namespace, &msg.name)
            .await
            .map_err(to_status)?;
        Ok(Response::new(attachment.into()))
    }

    async fn list(
        &self,
        request: Request<pb::ListRequest>,
    ) -> Result<Response<pb::ListResponse>, Status> {
        let msg = request.into_inner();
        let attachments = self.store.list(&msg.namespace).await.map_err(to_status)?;
        Ok(Response::new(pb::ListResponse {
            attachments: attachments.into_iter().map(Into::into).collect(),
        }))
    }

    async fn delete(
        &self,
        request: Request<pb::DeleteRequest>,
    ) -> Result<Response<pb::DeleteResponse>, Status> {
        let msg = request.into_inner();
        self.store
            .delete(&msg.namespace, &msg.name, DeleteOpts {
                ignore_not_exist: msg.ignore_not_exist,
            })
            .await
            .map_err(to_status)?;
        Ok(Response::new(pb::DeleteResponse {}))
    }

    type WatchStream = Pin<Box<dyn Stream<Item = Result<pb::ListResponse, Status>> + Send>>;

    async fn watch(
        &self,
        request: Request<pb::WatchRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let msg = request.into_inner();
        let snapshots = self.store.watch(&msg.namespace).await.map_err(to_status)?;
        let stream = snapshots.map(|attachments| {
            Ok(pb::ListResponse {
                attachments: attachments.into_iter().map(Into::into).collect(),
            })
        });
        Ok(Response::new(Box::pin(stream)))
    }
}

/// Serve the store until `shutdown` resolves, then remove the socket file.
pub async fn serve_on_unix_socket(
    socket_path: &std::path::Path,
    store: Arc<dyn AttachmentStore>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;
    }
    info!("store listening on {}", socket_path.display());

    Server::builder()
        .add_service(AttachmentStoreServer::new(StoreService::new(store)))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
        .await?;

    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    Ok(())
}
