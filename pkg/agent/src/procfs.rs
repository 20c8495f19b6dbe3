// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Helpers for the /proc surfaces the agent reads: pid enumeration, mount
//! namespace keys, cmdline/environ, executable metadata and socket fds.
//!
//! Everything is rooted at a configurable path so tests can run against a
//! synthetic tree.

use std::collections::HashMap;
use std::env;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

/// Inode of a kernel namespace instance.
pub type NsIno = u64;

#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    /// Host procfs. `HOST_PROC` overrides the mount point when the agent
    /// itself runs containerized with the host /proc bind-mounted elsewhere.
    pub fn host() -> Self {
        let root = env::var("HOST_PROC")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/proc"));
        ProcFs { root }
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        ProcFs { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_path(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Numeric entries of the proc root, ascending.
    pub fn pids(&self) -> std::io::Result<Vec<i32>> {
        let mut pids: Vec<i32> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    /// Mount namespace inode of a process, from the `ns/mnt` symlink target
    /// (`mnt:[4026532443]`). The symlink target is used rather than a stat
    /// so the key is directly comparable with exec output from inside the
    /// container.
    pub fn mount_ns_inode(&self, pid: i32) -> std::io::Result<Option<NsIno>> {
        let link = fs::read_link(self.pid_path(pid).join("ns/mnt"))?;
        Ok(link.to_str().and_then(parse_ns_link))
    }

    /// Command line with NUL separators replaced by spaces, trailing NULs
    /// trimmed. Empty for kernel threads.
    pub fn cmdline(&self, pid: i32) -> std::io::Result<String> {
        let raw = fs::read_to_string(self.pid_path(pid).join("cmdline"))?;
        let trimmed = raw.trim_end_matches('\0');
        Ok(trimmed.replace('\0', " "))
    }

    /// Environment of a process as a map. Entries without `=` are skipped.
    pub fn environ(&self, pid: i32) -> std::io::Result<HashMap<String, String>> {
        let raw = fs::read_to_string(self.pid_path(pid).join("environ"))?;
        Ok(raw
            .split_terminator('\0')
            .filter_map(|entry| {
                let (key, value) = entry.split_once('=')?;
                Some((key.to_string(), value.to_string()))
            })
            .collect())
    }

    pub fn exe_metadata(&self, pid: i32) -> std::io::Result<Metadata> {
        fs::metadata(self.pid_path(pid).join("exe"))
    }

    pub fn cwd(&self, pid: i32) -> PathBuf {
        self.pid_path(pid).join("cwd")
    }

    /// Inodes of every socket fd the process holds, from the
    /// `socket:[inode]` symlink targets under `fd/`.
    pub fn socket_inodes(&self, pid: i32) -> std::io::Result<Vec<u64>> {
        let fd_dir = self.pid_path(pid).join("fd");
        let mut inodes = Vec::new();
        for entry in fs::read_dir(fd_dir)? {
            let Ok(entry) = entry else { continue };
            let Ok(link) = fs::read_link(entry.path()) else {
                continue;
            };
            if let Some(inode) = link.to_str().and_then(parse_socket_link) {
                inodes.push(inode);
            }
        }
        Ok(inodes)
    }

    pub fn net_tcp_path(&self) -> PathBuf {
        self.root.join("net/tcp")
    }
}

fn parse_ns_link(target: &str) -> Option<NsIno> {
    target
        .strip_prefix("mnt:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
