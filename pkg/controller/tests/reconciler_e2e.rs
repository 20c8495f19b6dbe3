// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! End-to-end lifecycle over the real gRPC surface: a client creates an
//! attachment through the unix socket, the reconciler claims it, a fake
//! agent attaches, and deletion tears everything down.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::{Duration, sleep, timeout};

use squash_api::{
    AttachmentStore, DebugAttachment, DebuggerType, MemoryStore, RemoteStore, Spec, State,
    StoreError, WriteOpts,
};
use squash_controller::grpc;
use squash_controller::launcher::{AgentLauncher, LauncherError};
use squash_controller::reconciler::Reconciler;

/// Stands in for a spawned squash-agent: performs the agent's side of the
/// protocol (PendingAttachment -> Attached with an address) directly
/// against the store.
struct FakeAgent {
    store: Arc<dyn AttachmentStore>,
    deletes: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl AgentLauncher for FakeAgent {
    async fn create(&self, attachment: &DebugAttachment) -> Result<(), LauncherError> {
        let store = self.store.clone();
        let (namespace, name) = attachment.key();
        tokio::spawn(async move {
            let mut current = store.read(&namespace, &name).await.unwrap();
            assert_eq!(current.status.state, State::PendingAttachment);
            current.status.state = State::Attached;
            current.status.debug_server_address = "10.0.0.4:1236".to_string();
            store
                .write(current, WriteOpts {
                    overwrite_existing: true,
                })
                .await
                .unwrap();
        });
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) {
        self.deletes
            .lock()
            .unwrap()
            .push((namespace.to_string(), name.to_string()));
    }

    async fn logs(&self, _namespace: &str, _name: &str) -> Option<String> {
        None
    }
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        loop {
            if check().await {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_attachment_lifecycle_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("squashd.sock");

    let store: Arc<dyn AttachmentStore> = Arc::new(MemoryStore::new());
    let agent = Arc::new(FakeAgent {
        store: store.clone(),
        deletes: Mutex::new(Vec::new()),
    });

    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        agent.clone() as Arc<dyn AgentLauncher>,
    ));
    let watcher = reconciler.clone();
    tokio::spawn(async move {
        let _ = watcher.run().await;
    });

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serve_path = socket_path.clone();
    let serve_store = store.clone();
    let server = tokio::spawn(async move {
        grpc::serve_on_unix_socket(&serve_path, serve_store, async {
            let _ = stop_rx.await;
        })
        .await
        .unwrap();
    });

    wait_until("socket to appear", || {
        let path = socket_path.clone();
        async move { path.exists() }
    })
    .await;

    let client = RemoteStore::connect(&socket_path).await.unwrap();

    // Developer submits a debug request.
    let att = DebugAttachment::new(
        "default",
        "app-1-dbg",
        Spec {
            pod: "app-1".into(),
            container: "main".into(),
            debugger: DebuggerType::Dlv,
            process_match: None,
            image: String::new(),
        },
    );
    client.write(att, WriteOpts::default()).await.unwrap();

    // Reconciler claims it, the fake agent attaches and publishes.
    wait_until("attachment to reach Attached", || {
        let client = client.clone();
        async move {
            match client.read("default", "app-1-dbg").await {
                Ok(att) => {
                    att.status.state == State::Attached
                        && att.status.debug_server_address == "10.0.0.4:1236"
                }
                Err(_) => false,
            }
        }
    })
    .await;

    // Developer requests deletion.
    let mut current = client.read("default", "app-1-dbg").await.unwrap();
    current.status.state = State::RequestingDelete;
    current.status.debug_server_address.clear();
    client
        .write(current, WriteOpts {
            overwrite_existing: true,
        })
        .await
        .unwrap();

    wait_until("attachment to be removed", || {
        let client = client.clone();
        async move {
            matches!(
                client.read("default", "app-1-dbg").await,
                Err(StoreError::NotFound { .. })
            )
        }
    })
    .await;

    // The scheduled agent was torn down exactly once.
    wait_until("agent teardown", || {
        let agent = agent.clone();
        async move {
            let deletes = agent.deletes.lock().unwrap();
            deletes.as_slice() == [("default".to_string(), "app-1-dbg".to_string())]
        }
    })
    .await;

    let _ = stop_tx.send(());
    timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}
