// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::attachment::DebugAttachment;
use crate::store::{AttachmentSnapshots, AttachmentStore, DeleteOpts, StoreError, WriteOpts};

/// In-process store backing squashd.
///
/// Mutations publish the full snapshot through a `tokio::sync::watch`
/// channel, which coalesces naturally: slow watchers observe the latest
/// state, not every intermediate one.
pub struct MemoryStore {
    items: Mutex<BTreeMap<(String, String), DebugAttachment>>,
    snapshot_tx: watch::Sender<Vec<DebugAttachment>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        MemoryStore {
            items: Mutex::new(BTreeMap::new()),
            snapshot_tx,
        }
    }

    fn publish(&self, items: &BTreeMap<(String, String), DebugAttachment>) {
        self.snapshot_tx
            .send_replace(items.values().cloned().collect());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn in_namespace(att: &DebugAttachment, namespace: &str) -> bool {
    namespace.is_empty() || att.metadata.namespace == namespace
}

#[async_trait]
impl AttachmentStore for MemoryStore {
    async fn write(
        &self,
        attachment: DebugAttachment,
        opts: WriteOpts,
    ) -> Result<DebugAttachment, StoreError> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let key = attachment.key();
        if !opts.overwrite_existing && items.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                namespace: key.0,
                name: key.1,
            });
        }
        items.insert(key, attachment.clone());
        self.publish(&items);
        Ok(attachment)
    }

    async fn read(&self, namespace: &str, name: &str) -> Result<DebugAttachment, StoreError> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        items
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list(&self, namespace: &str) -> Result<Vec<DebugAttachment>, StoreError> {
        let items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        Ok(items
            .values()
            .filter(|att| in_namespace(att, namespace))
            .cloned()
            .collect())
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        opts: DeleteOpts,
    ) -> Result<(), StoreError> {
        let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
        let removed = items
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some();
        if !removed && !opts.ignore_not_exist {
            return Err(StoreError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        if removed {
            self.publish(&items);
        }
        Ok(())
    }

    async fn watch(&self, namespace: &str) -> Result<AttachmentSnapshots, StoreError> {
        let namespace = namespace.to_string();
        let stream = WatchStream::new(self.snapshot_tx.subscribe()).map(move |snapshot| {
            snapshot
                .into_iter()
                .filter(|att| in_namespace(att, &namespace))
                .collect()
        });
        Ok(Box::pin(stream))
    }
}
