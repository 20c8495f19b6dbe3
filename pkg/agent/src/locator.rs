// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Resolves a (namespace, pod, container) coordinate to a host pid.
//!
//! The container runtime only knows container ids; the host pid is found by
//! reading the container's mount namespace inode (via an exec inside it) and
//! scanning host /proc for processes in that namespace. When several
//! processes share the namespace an optional command-line regex narrows the
//! set, and the oldest executable wins among the remainder.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::SystemTime;

use log::{debug, info};
use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::cri::{
    CriError, RuntimeClient, LABEL_CONTAINER_NAME, LABEL_POD_NAME, LABEL_POD_NAMESPACE,
};
use crate::procfs::{NsIno, ProcFs};

static MNT_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"mnt:\[(\d+)\]").expect("mnt link pattern"));

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error(transparent)]
    Cri(#[from] CriError),
    #[error("no ready pod {namespace}/{pod}")]
    PodNotFound { namespace: String, pod: String },
    #[error("pod name {namespace}/{pod} matches {count} sandboxes")]
    AmbiguousPod {
        namespace: String,
        pod: String,
        count: usize,
    },
    #[error("no running container {container} in pod {pod}")]
    ContainerNotFound { pod: String, container: String },
    #[error("container name {container} matches {count} containers in pod {pod}")]
    AmbiguousContainer {
        pod: String,
        container: String,
        count: usize,
    },
    #[error("could not read mount namespace of container {container}")]
    MountNsUnreadable { container: String },
    #[error("no host process found in mount namespace {mount_ns}")]
    NoVisibleProcess { mount_ns: NsIno },
    #[error("no process in container matches {pattern:?}")]
    NoMatchingProcess { pattern: String },
    #[error("invalid process match pattern {pattern:?}: {source}")]
    BadProcessMatch {
        pattern: String,
        source: regex::Error,
    },
    #[error("reading proc: {0}")]
    Io(#[from] std::io::Error),
}

/// A located debuggee: runtime identity plus the host-side view of it.
#[derive(Debug, Clone)]
pub struct ContainerTarget {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub mount_ns: NsIno,
    pub pid: i32,
    pub env: HashMap<String, String>,
}

pub struct Locator {
    runtime: RuntimeClient,
    procfs: ProcFs,
}

impl Locator {
    pub async fn connect(cri_socket: &Path, procfs: ProcFs) -> Result<Self, LocatorError> {
        let runtime = RuntimeClient::connect(cri_socket).await?;
        Ok(Locator { runtime, procfs })
    }

    /// Full resolution pipeline; see the module docs.
    pub async fn locate(
        &mut self,
        namespace: &str,
        pod: &str,
        container: &str,
        process_match: Option<&str>,
    ) -> Result<ContainerTarget, LocatorError> {
        let matcher = process_match
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|source| LocatorError::BadProcessMatch {
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .transpose()?;

        let sandboxes = self
            .runtime
            .list_ready_sandboxes(HashMap::from([
                (LABEL_POD_NAME.to_string(), pod.to_string()),
                (LABEL_POD_NAMESPACE.to_string(), namespace.to_string()),
            ]))
            .await?;
        let sandbox = match sandboxes.as_slice() {
            [sandbox] => sandbox.clone(),
            [] => {
                return Err(LocatorError::PodNotFound {
                    namespace: namespace.to_string(),
                    pod: pod.to_string(),
                });
            }
            many => {
                return Err(LocatorError::AmbiguousPod {
                    namespace: namespace.to_string(),
                    pod: pod.to_string(),
                    count: many.len(),
                });
            }
        };

        let containers = self
            .runtime
            .list_running_containers(
                &sandbox.id,
                HashMap::from([(LABEL_CONTAINER_NAME.to_string(), container.to_string())]),
            )
            .await?;
        let summary = match containers.as_slice() {
            [summary] => summary.clone(),
            [] => {
                return Err(LocatorError::ContainerNotFound {
                    pod: pod.to_string(),
                    container: container.to_string(),
                });
            }
            many => {
                return Err(LocatorError::AmbiguousContainer {
                    pod: pod.to_string(),
                    container: container.to_string(),
                    count: many.len(),
                });
            }
        };

        let listing = self
            .runtime
            .exec_sync(&summary.id, &["ls", "-l", "/proc/self/ns/"])
            .await?;
        let mount_ns =
            parse_mnt_inode(&listing).ok_or_else(|| LocatorError::MountNsUnreadable {
                container: summary.id.clone(),
            })?;
        debug!("container {} is in mount namespace {mount_ns}", summary.id);

        let candidates = pids_in_mount_ns(&self.procfs, mount_ns)?;
        if candidates.is_empty() {
            return Err(LocatorError::NoVisibleProcess { mount_ns });
        }
        let pid = select_pid(&self.procfs, &candidates, matcher.as_ref())?;
        info!(
            "located {namespace}/{pod}/{container} -> container {} pid {pid}",
            summary.id
        );

        let env = self.procfs.environ(pid).unwrap_or_default();
        Ok(ContainerTarget {
            container_id: summary.id,
            container_name: summary.name,
            image: summary.image,
            mount_ns,
            pid,
            env,
        })
    }

    pub fn procfs(&self) -> &ProcFs {
        &self.procfs
    }
}

/// Mount namespace inode from an `ls -l /proc/self/ns/` listing.
pub fn parse_mnt_inode(listing: &str) -> Option<NsIno> {
    let captures = MNT_LINK.captures(listing)?;
    captures.get(1)?.as_str().parse().ok()
}

/// Host pids whose mount namespace matches, ascending. Processes that
/// disappear or deny access mid-scan are skipped.
pub fn pids_in_mount_ns(procfs: &ProcFs, mount_ns: NsIno) -> std::io::Result<Vec<i32>> {
    let mut matching = Vec::new();
    for pid in procfs.pids()? {
        match procfs.mount_ns_inode(pid) {
            Ok(Some(ino)) if ino == mount_ns => matching.push(pid),
            Ok(_) => {}
            Err(e) => debug!("skipping pid {pid}: {e}"),
        }
    }
    Ok(matching)
}

/// Picks the debuggee among candidate pids. The regex filters on the full
/// command line; among survivors the earliest executable mtime wins, on the
/// theory that the container's main binary predates any exec'd tooling.
pub fn select_pid(
    procfs: &ProcFs,
    candidates: &[i32],
    matcher: Option<&Regex>,
) -> Result<i32, LocatorError> {
    let mut survivors: Vec<i32> = Vec::new();
    for &pid in candidates {
        let cmdline = procfs.cmdline(pid).unwrap_or_default();
        if let Some(matcher) = matcher {
            if !matcher.is_match(&cmdline) {
                continue;
            }
        }
        survivors.push(pid);
    }

    match survivors.as_slice() {
        [] => Err(LocatorError::NoMatchingProcess {
            pattern: matcher.map(|m| m.as_str().to_string()).unwrap_or_default(),
        }),
        [pid] => Ok(*pid),
        many => {
            // Candidates are already pid-ascending, so ties keep the lowest.
            let oldest = many
                .iter()
                .copied()
                .min_by_key(|&pid| {
                    procfs
                        .exe_metadata(pid)
                        .and_then(|meta| meta.modified())
                        .unwrap_or(SystemTime::now())
                })
                .unwrap_or(many[0]);
            debug!(
                "{} candidate processes, picked pid {oldest} by executable age",
                many.len()
            );
            Ok(oldest)
        }
    }
}
