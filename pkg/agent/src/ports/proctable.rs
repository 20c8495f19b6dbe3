// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! /proc/net/tcp fallback for hosts where netlink sock_diag is unavailable
//! or denied. Rows carry the local address as hex IP:PORT, the state as a
//! hex byte, and the socket inode.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use super::{ListeningSockets, PortsError, SocketRecord};

const TCP_LISTEN: u8 = 0x0A;

pub struct ProcNetTcp {
    path: PathBuf,
}

impl ProcNetTcp {
    pub fn new(path: PathBuf) -> Self {
        ProcNetTcp { path }
    }
}

impl ListeningSockets for ProcNetTcp {
    fn listening_sockets(&self) -> Result<Vec<SocketRecord>, PortsError> {
        let file = fs::File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        // Header line.
        let mut line = String::with_capacity(256);
        reader.read_line(&mut line)?;

        let mut records = Vec::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            // Malformed rows are skipped, not fatal: the kernel may append
            // fields across versions and a partial table still serves.
            if let Some(record) = parse_line(&line) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// One row of /proc/net/tcp, keeping LISTEN entries only.
/// Fields: 1 = local_address ("0100007F:1F90"), 3 = state, 9 = inode.
fn parse_line(line: &str) -> Option<SocketRecord> {
    let mut fields = line.split_whitespace();
    let local_address = fields.nth(1)?;
    let state = fields.nth(1)?;
    let inode = fields.nth(5)?;

    let state = u8::from_str_radix(state, 16).ok()?;
    if state != TCP_LISTEN {
        return None;
    }

    let port_hex = local_address.rsplit(':').next()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let inode = inode.parse().ok()?;

    Some(SocketRecord { inode, port })
}
