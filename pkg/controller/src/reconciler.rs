// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Drives attachments through their lifecycle.
//!
//! The reconciler consumes coalesced watch snapshots, so the same state may
//! be observed many times and intermediate states may be missed entirely.
//! Every transition therefore re-reads the current resource before writing,
//! and an in-flight set keyed by (namespace, name) guarantees at most one
//! agent is ever scheduled per attachment. Write conflicts and cleanup
//! failures are logged, never retried; a human resubmits.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio_stream::StreamExt;

use squash_api::{AttachmentStore, DebugAttachment, DeleteOpts, State, StoreError, WriteOpts};

use crate::launcher::AgentLauncher;

pub struct Reconciler {
    store: Arc<dyn AttachmentStore>,
    launcher: Arc<dyn AgentLauncher>,
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn AttachmentStore>, launcher: Arc<dyn AgentLauncher>) -> Self {
        Reconciler {
            store,
            launcher,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Watch loop over every namespace; runs until the store goes away.
    pub async fn run(&self) -> Result<(), StoreError> {
        let mut snapshots = self.store.watch("").await?;
        while let Some(snapshot) = snapshots.next().await {
            for attachment in snapshot {
                self.reconcile(attachment).await;
            }
        }
        Ok(())
    }

    pub async fn reconcile(&self, attachment: DebugAttachment) {
        match attachment.status.state {
            State::RequestingAttachment => self.claim_and_dispatch(attachment).await,
            State::RequestingDelete => self.cleanup(attachment).await,
            // Quiescent states: the agent owns the next transition.
            State::PendingAttachment | State::Attached | State::PendingDelete => {}
        }
    }

    async fn claim_and_dispatch(&self, attachment: DebugAttachment) {
        let key = attachment.key();
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(key.clone()) {
                debug!("{}/{} already in flight", key.0, key.1);
                return;
            }
        }

        let claimed = self.claim(&key).await;
        let Some(claimed) = claimed else {
            self.clear_in_flight(&key);
            return;
        };
        info!("claimed {} for attachment", claimed.metadata);

        // The agent workflow advances the attachment from here; dispatch it
        // without blocking the watch loop.
        let launcher = self.launcher.clone();
        let store = self.store.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            if let Err(e) = launcher.create(&claimed).await {
                error!("agent launch for {} failed: {e}", claimed.metadata);
                if let Some(logs) = launcher
                    .logs(&claimed.metadata.namespace, &claimed.metadata.name)
                    .await
                {
                    debug!("agent output for {}:\n{logs}", claimed.metadata);
                }
                route_to_delete(store.as_ref(), &claimed).await;
                in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&claimed.key());
            }
        });
    }

    /// Read-modify-write RequestingAttachment -> PendingAttachment. Returns
    /// the claimed resource, or None if someone else already moved it.
    async fn claim(&self, key: &(String, String)) -> Option<DebugAttachment> {
        let mut current = match self.store.read(&key.0, &key.1).await {
            Ok(current) => current,
            Err(StoreError::NotFound { .. }) => return None,
            Err(e) => {
                warn!("could not read {}/{}: {e}", key.0, key.1);
                return None;
            }
        };
        if current.status.state != State::RequestingAttachment {
            return None;
        }
        current.status.state = State::PendingAttachment;
        match self
            .store
            .write(current, WriteOpts {
                overwrite_existing: true,
            })
            .await
        {
            Ok(claimed) => Some(claimed),
            Err(e) => {
                warn!("claim of {}/{} conflicted: {e}", key.0, key.1);
                None
            }
        }
    }

    /// RequestingDelete -> PendingDelete, then at-most-once removal of the
    /// agent and the resource itself.
    async fn cleanup(&self, attachment: DebugAttachment) {
        let key = attachment.key();
        match self.store.read(&key.0, &key.1).await {
            Ok(mut current) => {
                if current.status.state != State::RequestingDelete {
                    return;
                }
                current.status.state = State::PendingDelete;
                current.status.debug_server_address.clear();
                if let Err(e) = self
                    .store
                    .write(current, WriteOpts {
                        overwrite_existing: true,
                    })
                    .await
                {
                    warn!("could not move {}/{} to pending delete: {e}", key.0, key.1);
                    return;
                }
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => {
                warn!("could not read {}/{} for cleanup: {e}", key.0, key.1);
                return;
            }
        }

        self.launcher.delete(&key.0, &key.1).await;
        if let Err(e) = self
            .store
            .delete(&key.0, &key.1, DeleteOpts {
                ignore_not_exist: true,
            })
            .await
        {
            warn!("could not delete {}/{}: {e}", key.0, key.1);
        }
        self.clear_in_flight(&key);
        info!("cleaned up {}/{}", key.0, key.1);
    }

    fn clear_in_flight(&self, key: &(String, String)) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Best-effort hand-off of a failed attachment to the delete path.
pub async fn route_to_delete(store: &dyn AttachmentStore, attachment: &DebugAttachment) {
    let (namespace, name) = attachment.key();
    let mut current = match store.read(&namespace, &name).await {
        Ok(current) => current,
        Err(StoreError::NotFound { .. }) => return,
        Err(e) => {
            warn!("could not read {namespace}/{name}: {e}");
            return;
        }
    };
    if !current
        .status
        .state
        .can_transition_to(State::RequestingDelete)
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
        warn!("could not route {namespace}/{name} to deletion: {e}");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::launcher::LauncherError;
    use async_trait::async_trait;
    use squash_api::{DebuggerType, MemoryStore, Spec};
    use tokio::time::{Duration, sleep, timeout};

    pub(crate) struct MockLauncher {
        pub launches: Mutex<Vec<(String, String)>>,
        pub deletes: Mutex<Vec<(String, String)>>,
        pub fail: bool,
    }

    impl MockLauncher {
        pub fn new(fail: bool) -> Arc<Self> {
            Arc::new(MockLauncher {
                launches: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
                fail,
            })
        }

        pub fn launch_count(&self) -> usize {
            self.launches.lock().unwrap_or_else(|e| e.into_inner()).len()
        }
    }

    #[async_trait]
    impl AgentLauncher for MockLauncher {
        async fn create(&self, attachment: &DebugAttachment) -> Result<(), LauncherError> {
            self.launches
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(attachment.key());
            if self.fail {
                return Err(LauncherError::Spawn {
                    namespace: attachment.metadata.namespace.clone(),
                    name: attachment.metadata.name.clone(),
                    source: std::io::Error::other("mock failure"),
                });
            }
            Ok(())
        }

        async fn delete(&self, namespace: &str, name: &str) {
            self.deletes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((namespace.to_string(), name.to_string()));
        }

        async fn logs(&self, _namespace: &str, _name: &str) -> Option<String> {
            None
        }
    }

    pub(crate) fn make_attachment(name: &str) -> DebugAttachment {
        DebugAttachment::new(
            "default",
            name,
            Spec {
                pod: "app-1".into(),
                container: "main".into(),
                debugger: DebuggerType::Dlv,
                process_match: None,
                image: String::new(),
            },
        )
    }

    async fn wait_for_state(store: &MemoryStore, name: &str, want: State) {
        timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(att) = store.read("default", name).await
                    && att.status.state == want
                {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("attachment never reached {want}"));
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_schedules_one_agent() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockLauncher::new(false);
        let reconciler =
            Reconciler::new(store.clone(), launcher.clone() as Arc<dyn AgentLauncher>);

        let att = make_attachment("a");
        store.write(att.clone(), WriteOpts::default()).await.unwrap();

        // Same snapshot delivered twice, e.g. after a watch reconnect.
        reconciler.reconcile(att.clone()).await;
        reconciler.reconcile(att.clone()).await;

        wait_for_state(&store, "a", State::PendingAttachment).await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_snapshot_after_claim_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockLauncher::new(false);
        let reconciler =
            Reconciler::new(store.clone(), launcher.clone() as Arc<dyn AgentLauncher>);

        let att = make_attachment("a");
        store.write(att.clone(), WriteOpts::default()).await.unwrap();
        reconciler.reconcile(att.clone()).await;
        wait_for_state(&store, "a", State::PendingAttachment).await;

        // A stale RequestingAttachment snapshot arrives after the claim and
        // after the in-flight entry was (hypothetically) cleared.
        reconciler.clear_in_flight(&att.key());
        reconciler.reconcile(att.clone()).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(launcher.launch_count(), 1);
        let current = store.read("default", "a").await.unwrap();
        assert_eq!(current.status.state, State::PendingAttachment);
    }

    #[tokio::test]
    async fn test_failed_launch_routes_to_delete() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockLauncher::new(true);
        let reconciler =
            Reconciler::new(store.clone(), launcher.clone() as Arc<dyn AgentLauncher>);

        let att = make_attachment("a");
        store.write(att.clone(), WriteOpts::default()).await.unwrap();
        reconciler.reconcile(att).await;

        wait_for_state(&store, "a", State::RequestingDelete).await;
    }

    #[tokio::test]
    async fn test_cleanup_removes_agent_and_resource() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockLauncher::new(false);
        let reconciler =
            Reconciler::new(store.clone(), launcher.clone() as Arc<dyn AgentLauncher>);

        let mut att = make_attachment("a");
        att.status.state = State::RequestingDelete;
        store.write(att.clone(), WriteOpts::default()).await.unwrap();

        reconciler.reconcile(att).await;

        assert!(matches!(
            store.read("default", "a").await,
            Err(StoreError::NotFound { .. })
        ));
        let deletes = launcher.deletes.lock().unwrap();
        assert_eq!(deletes.as_slice(), [("default".to_string(), "a".to_string())]);
    }

    #[tokio::test]
    async fn test_quiescent_states_untouched() {
        let store = Arc::new(MemoryStore::new());
        let launcher = MockLauncher::new(false);
        let reconciler =
            Reconciler::new(store.clone(), launcher.clone() as Arc<dyn AgentLauncher>);

        for (name, state) in [("p", State::PendingAttachment), ("t", State::Attached)] {
            let mut att = make_attachment(name);
            att.status.state = state;
            store.write(att.clone(), WriteOpts::default()).await.unwrap();
            reconciler.reconcile(att).await;
            let current = store.read("default", name).await.unwrap();
            assert_eq!(current.status.state, state);
        }
        assert_eq!(launcher.launch_count(), 0);
    }
}
