// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio_stream::Stream;

use crate::attachment::DebugAttachment;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("attachment {namespace}/{name} already exists")]
    AlreadyExists { namespace: String, name: String },
    #[error("attachment {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("malformed attachment on the wire: {context}")]
    Malformed { context: String },
    #[error("store transport: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOpts {
    pub overwrite_existing: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOpts {
    pub ignore_not_exist: bool,
}

/// Stream of coalesced namespace snapshots. Every item is the full set of
/// attachments visible in the watched namespace at some point in time;
/// intermediate states may be skipped.
pub type AttachmentSnapshots = Pin<Box<dyn Stream<Item = Vec<DebugAttachment>> + Send>>;

/// CRUD + watch over debug attachments, keyed by (namespace, name).
///
/// This is the only interface the reconciler, the agent and the CLI use to
/// communicate; no other cross-process state exists.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Create or update. Without `overwrite_existing` an existing resource
    /// is a conflict ([`StoreError::AlreadyExists`]); callers log conflicts,
    /// they never retry them.
    async fn write(
        &self,
        attachment: DebugAttachment,
        opts: WriteOpts,
    ) -> Result<DebugAttachment, StoreError>;

    async fn read(&self, namespace: &str, name: &str) -> Result<DebugAttachment, StoreError>;

    /// List attachments in a namespace; empty namespace lists everything.
    async fn list(&self, namespace: &str) -> Result<Vec<DebugAttachment>, StoreError>;

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        opts: DeleteOpts,
    ) -> Result<(), StoreError>;

    /// Watch a namespace (empty = all). The stream starts with the current
    /// snapshot and then delivers a coalesced snapshot after mutations.
    async fn watch(&self, namespace: &str) -> Result<AttachmentSnapshots, StoreError>;
}
