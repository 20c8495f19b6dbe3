// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Discovers which TCP port a process is listening on.
//!
//! The kernel's listening-socket table is read system-wide (netlink
//! sock_diag, or /proc/net/tcp when netlink is unavailable) and intersected
//! with the socket inodes the process holds open. Callers expect exactly one
//! debugger port; anything else is an error.

pub mod proctable;
pub mod sockdiag;

use std::collections::{BTreeSet, HashSet};

use log::debug;
use thiserror::Error;

use crate::procfs::ProcFs;

/// A listening socket: kernel inode plus bound local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketRecord {
    pub inode: u64,
    pub port: u16,
}

#[derive(Error, Debug)]
pub enum PortsError {
    #[error("reading proc: {0}")]
    Io(#[from] std::io::Error),
    #[error("netlink sock_diag: {context}")]
    Netlink { context: String },
    #[error("could not parse socket table: {context}")]
    Parse { context: String },
    #[error("pid {pid} has no listening TCP port")]
    NoListeningPort { pid: i32 },
    #[error("pid {pid} is listening on multiple ports: {ports:?}")]
    AmbiguousPorts { pid: i32, ports: Vec<u16> },
}

/// Source of the system-wide listening-socket table.
pub trait ListeningSockets {
    fn listening_sockets(&self) -> Result<Vec<SocketRecord>, PortsError>;
}

/// Keep only table entries whose inode belongs to the process, ordered.
pub fn attribute_ports(fd_inodes: &HashSet<u64>, table: &[SocketRecord]) -> Vec<u16> {
    let ports: BTreeSet<u16> = table
        .iter()
        .filter(|record| fd_inodes.contains(&record.inode))
        .map(|record| record.port)
        .collect();
    ports.into_iter().collect()
}

/// The single listening TCP port of `pid`, per the module contract.
pub fn listening_port(procfs: &ProcFs, pid: i32) -> Result<u16, PortsError> {
    let fd_inodes: HashSet<u64> = procfs.socket_inodes(pid)?.into_iter().collect();

    let table = match sockdiag::SockDiag.listening_sockets() {
        Ok(table) => table,
        Err(e) => {
            debug!("sock_diag unavailable ({e}), falling back to {}", procfs.net_tcp_path().display());
            proctable::ProcNetTcp::new(procfs.net_tcp_path()).listening_sockets()?
        }
    };

    let ports = attribute_ports(&fd_inodes, &table);
    match ports.as_slice() {
        [port] => Ok(*port),
        [] => Err(PortsError::NoListeningPort { pid }),
        _ => Err(PortsError::AmbiguousPorts { pid, ports }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procfs::tests::FakeProc;

    #[test]
    fn test_attribution_intersects_inodes() {
        let fd_inodes: HashSet<u64> = [5, 6, 7].into_iter().collect();
        let table = [
            SocketRecord { inode: 6, port: 9229 },
            SocketRecord { inode: 9, port: 80 },
        ];
        assert_eq!(attribute_ports(&fd_inodes, &table), vec![9229]);
    }

    #[test]
    fn test_attribution_empty_when_disjoint() {
        let fd_inodes: HashSet<u64> = [1, 2].into_iter().collect();
        let table = [SocketRecord { inode: 9, port: 80 }];
        assert!(attribute_ports(&fd_inodes, &table).is_empty());
    }

    #[test]
    fn test_attribution_deduplicates_ports() {
        // Same port reachable through two inodes (e.g. v4 and v6 sockets).
        let fd_inodes: HashSet<u64> = [5, 6].into_iter().collect();
        let table = [
            SocketRecord { inode: 5, port: 2345 },
            SocketRecord { inode: 6, port: 2345 },
        ];
        assert_eq!(attribute_ports(&fd_inodes, &table), vec![2345]);
    }

    #[test]
    fn test_listening_port_requires_exactly_one() {
        // Synthetic proc tree with a net/tcp table; netlink is expected to
        // fail inside the test sandbox, exercising the fallback path. If it
        // does work, the real table won't contain our synthetic inodes and
        // the result is NoListeningPort, which is also acceptable here.
        let proc = FakeProc::new();
        proc.add_process(50, 1, &["dlv"]);
        proc.add_socket_fd(50, 3, 4001);
        std::fs::create_dir_all(proc.dir.path().join("net")).unwrap();
        std::fs::write(
            proc.dir.path().join("net/tcp"),
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   0: 0100007F:9B56 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 4001 1 0000000000000000 100 0 0 10 0\n",
        )
        .unwrap();

        match listening_port(&proc.procfs(), 50) {
            Ok(port) => assert_eq!(port, 0x9B56),
            Err(PortsError::NoListeningPort { pid }) => assert_eq!(pid, 50),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
