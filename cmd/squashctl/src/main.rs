// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Developer-facing CLI: submits debug attachments to squashd and waits for
//! the session address.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::debug;
use tokio_stream::StreamExt;
use uuid::Uuid;

use squash_api::{
    AttachmentStore, DebugAttachment, DebuggerType, RemoteStore, Spec, State, WriteOpts,
};

#[derive(Parser, Debug)]
#[command(
    name = "squashctl",
    about = "Attach debuggers to processes running in Kubernetes pods"
)]
struct Cli {
    /// squashd unix socket
    #[arg(long, global = true, default_value = squash_api::DEFAULT_STORE_SOCKET)]
    socket: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach a debugger to a running container and print the session address
    Attach {
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long)]
        pod: String,
        #[arg(long)]
        container: String,
        /// One of: dlv, gdb, java, nodejs, nodejs8, python
        #[arg(long)]
        debugger: DebuggerType,
        /// Case-insensitive regex selecting the target process by cmdline
        #[arg(long)]
        process_match: Option<String>,
        /// Container image, informational only
        #[arg(long)]
        image: Option<String>,
        /// Attachment name; generated from the pod name when omitted
        #[arg(long)]
        name: Option<String>,
        /// Seconds to wait for the session to come up
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// List debug attachments
    List {
        /// Namespace to list; all namespaces when omitted
        #[arg(long, default_value = "")]
        namespace: String,
    },
    /// Delete a debug attachment, ending its session
    Delete {
        #[arg(long, default_value = "default")]
        namespace: String,
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::Level::Debug
    } else {
        log::Level::Warn
    };
    simple_logger::init_with_level(level)?;

    let store = RemoteStore::connect(&cli.socket)
        .await
        .with_context(|| format!("connecting to squashd at {}", cli.socket.display()))?;

    match cli.command {
        Command::Attach {
            namespace,
            pod,
            container,
            debugger,
            process_match,
            image,
            name,
            timeout,
        } => {
            let request = AttachRequest {
                namespace,
                pod,
                container,
                debugger,
                process_match,
                image,
                name,
                timeout,
            };
            attach(&store, request).await
        }
        Command::List { namespace } => list(&store, &namespace).await,
        Command::Delete { namespace, name } => delete(&store, &namespace, &name).await,
    }
}

struct AttachRequest {
    namespace: String,
    pod: String,
    container: String,
    debugger: DebuggerType,
    process_match: Option<String>,
    image: Option<String>,
    name: Option<String>,
    timeout: u64,
}

async fn attach(store: &RemoteStore, request: AttachRequest) -> Result<()> {
    let namespace = &request.namespace;
    let name = request.name.unwrap_or_else(|| {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", request.pod, &suffix[..8])
    });

    let attachment = DebugAttachment::new(namespace, &name, Spec {
        pod: request.pod,
        container: request.container,
        debugger: request.debugger,
        process_match: request.process_match,
        image: request.image.unwrap_or_default(),
    });
    store.write(attachment, WriteOpts::default()).await?;
    debug!("created attachment {namespace}/{name}");

    let deadline = tokio::time::Duration::from_secs(request.timeout);
    match tokio::time::timeout(deadline, wait_attached(store, namespace, &name)).await {
        Ok(Ok(address)) => {
            println!("{namespace}/{name} attached");
            println!("debugger listening at {address}");
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => {
            // Leave nothing behind on timeout.
            request_delete(store, namespace, &name).await;
            bail!(
                "timed out after {}s waiting for {namespace}/{name} to attach",
                request.timeout
            )
        }
    }
}

async fn wait_attached(store: &RemoteStore, namespace: &str, name: &str) -> Result<String> {
    let mut snapshots = store.watch(namespace).await?;
    while let Some(snapshot) = snapshots.next().await {
        let Some(att) = snapshot.iter().find(|att| att.metadata.name == name) else {
            continue;
        };
        if att.status.state == State::Attached && !att.status.debug_server_address.is_empty() {
            return Ok(att.status.debug_server_address.clone());
        }
        if att.status.state.is_delete_path() {
            bail!(
                "attach of {namespace}/{name} failed; check squashd and agent logs for details"
            );
        }
    }
    bail!("lost connection to squashd while waiting for {namespace}/{name}")
}

async fn list(store: &RemoteStore, namespace: &str) -> Result<()> {
    let attachments = store.list(namespace).await?;
    if attachments.is_empty() {
        println!("no debug attachments");
        return Ok(());
    }
    println!(
        "{:<32} {:<24} {:<10} {:<22} {}",
        "NAME", "POD/CONTAINER", "DEBUGGER", "STATE", "ADDRESS"
    );
    for att in attachments {
        println!(
            "{:<32} {:<24} {:<10} {:<22} {}",
            att.metadata,
            format!("{}/{}", att.spec.pod, att.spec.container),
            att.spec.debugger,
            att.status.state,
            att.status.debug_server_address
        );
    }
    Ok(())
}

async fn delete(store: &RemoteStore, namespace: &str, name: &str) -> Result<()> {
    let current = store.read(namespace, name).await?;
    if current.status.state.is_delete_path() {
        println!("{namespace}/{name} is already being deleted");
        return Ok(());
    }
    request_delete(store, namespace, name).await;
    println!("requested deletion of {namespace}/{name}");
    Ok(())
}

/// Read-modify-write the attachment onto the delete path; best-effort.
async fn request_delete(store: &RemoteStore, namespace: &str, name: &str) {
    let Ok(mut current) = store.read(namespace, name).await else {
        return;
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
        debug!("could not request deletion of {namespace}/{name}: {e}");
    }
}
