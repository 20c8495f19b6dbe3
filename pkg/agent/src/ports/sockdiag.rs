// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.

//! Hand-rolled netlink sock_diag client.
//!
//! A single SOCK_DIAG_BY_FAMILY dump request (AF_INET/TCP, state LISTEN)
//! returns every listening socket with its inode. The wire (de)serialization
//! is kept in pure functions over byte slices so it can be tested against
//! golden fixtures without touching a live kernel.

use super::{ListeningSockets, PortsError, SocketRecord};

const SOCK_DIAG_BY_FAMILY: u16 = 20;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

const NLMSG_HDRLEN: usize = 16;
const INET_DIAG_REQ_V2_LEN: usize = 56;
const INET_DIAG_MSG_LEN: usize = 72;
const REQUEST_LEN: usize = NLMSG_HDRLEN + INET_DIAG_REQ_V2_LEN;

// TCP_LISTEN is state 10 in the kernel's TCP state machine.
const TCP_LISTEN_STATE_BIT: u32 = 1 << 10;

/// Encode the dump request: nlmsghdr followed by inet_diag_req_v2.
pub fn encode_request(seq: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(REQUEST_LEN);

    // nlmsghdr
    buf.extend_from_slice(&(REQUEST_LEN as u32).to_le_bytes());
    buf.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_le_bytes());
    let flags = (libc::NLM_F_REQUEST | libc::NLM_F_DUMP) as u16;
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // pid: kernel fills ours in

    // inet_diag_req_v2
    buf.push(libc::AF_INET as u8);
    buf.push(libc::IPPROTO_TCP as u8);
    buf.push(0); // ext
    buf.push(0); // pad
    buf.extend_from_slice(&TCP_LISTEN_STATE_BIT.to_le_bytes());
    buf.extend_from_slice(&[0u8; 48]); // inet_diag_sockid: wildcard

    buf
}

fn u16_le_at(buf: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_le_bytes(buf.get(off..off + 2)?.try_into().ok()?))
}

fn u16_be_at(buf: &[u8], off: usize) -> Option<u16> {
    Some(u16::from_be_bytes(buf.get(off..off + 2)?.try_into().ok()?))
}

fn u32_le_at(buf: &[u8], off: usize) -> Option<u32> {
    Some(u32::from_le_bytes(buf.get(off..off + 4)?.try_into().ok()?))
}

/// Decode one datagram's worth of netlink messages. Returns the records
/// found and whether NLMSG_DONE terminated the dump.
pub fn parse_messages(buf: &[u8]) -> Result<(Vec<SocketRecord>, bool), PortsError> {
    let mut records = Vec::new();
    let mut off = 0;

    while buf.len().saturating_sub(off) >= NLMSG_HDRLEN {
        let msg_len = u32_le_at(buf, off).unwrap_or(0) as usize;
        let msg_type = u16_le_at(buf, off + 4).unwrap_or(0);
        if msg_len < NLMSG_HDRLEN || msg_len > buf.len() - off {
            return Err(PortsError::Parse {
                context: format!("netlink message length {msg_len} out of bounds"),
            });
        }

        match msg_type {
            NLMSG_DONE => return Ok((records, true)),
            NLMSG_ERROR => {
                let errno = u32_le_at(buf, off + NLMSG_HDRLEN)
                    .map(|raw| (raw as i32).unsigned_abs())
                    .unwrap_or(0);
                return Err(PortsError::Netlink {
                    context: format!("kernel returned errno {errno}"),
                });
            }
            SOCK_DIAG_BY_FAMILY => {
                let payload = off + NLMSG_HDRLEN;
                if msg_len - NLMSG_HDRLEN < INET_DIAG_MSG_LEN {
                    return Err(PortsError::Parse {
                        context: format!("short inet_diag_msg: {} bytes", msg_len - NLMSG_HDRLEN),
                    });
                }
                // inet_diag_msg: id.sport at +4 (big-endian), inode at +68.
                let port = u16_be_at(buf, payload + 4);
                let inode = u32_le_at(buf, payload + 68);
                if let (Some(port), Some(inode)) = (port, inode) {
                    records.push(SocketRecord {
                        inode: inode as u64,
                        port,
                    });
                }
            }
            other => {
                return Err(PortsError::Parse {
                    context: format!("unexpected netlink message type {other}"),
                });
            }
        }

        // Messages are 4-byte aligned.
        off += (msg_len + 3) & !3;
    }

    Ok((records, false))
}

struct NetlinkSocket {
    fd: libc::c_int,
}

impl NetlinkSocket {
    fn open() -> Result<Self, PortsError> {
        // SAFETY: plain socket(2), no pointers involved.
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_SOCK_DIAG,
            )
        };
        if fd < 0 {
            return Err(PortsError::Netlink {
                context: format!("socket: {}", std::io::Error::last_os_error()),
            });
        }
        Ok(NetlinkSocket { fd })
    }

    fn send(&self, buf: &[u8]) -> Result<(), PortsError> {
        // SAFETY: buf is valid for buf.len() bytes for the whole call.
        let n = unsafe { libc::send(self.fd, buf.as_ptr().cast(), buf.len(), 0) };
        if n < 0 || n as usize != buf.len() {
            return Err(PortsError::Netlink {
                context: format!("send: {}", std::io::Error::last_os_error()),
            });
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, PortsError> {
        // SAFETY: buf is writable for buf.len() bytes for the whole call.
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n < 0 {
            return Err(PortsError::Netlink {
                context: format!("recv: {}", std::io::Error::last_os_error()),
            });
        }
        Ok(n as usize)
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this struct and not closed elsewhere.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Kernel socket-diag source. Stateless; each query opens its own socket.
pub struct SockDiag;

impl ListeningSockets for SockDiag {
    fn listening_sockets(&self) -> Result<Vec<SocketRecord>, PortsError> {
        let sock = NetlinkSocket::open()?;
        sock.send(&encode_request(1))?;

        let mut records = Vec::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = sock.recv(&mut buf)?;
            if n == 0 {
                break;
            }
            let (mut batch, done) = parse_messages(buf.get(..n).unwrap_or_default())?;
            records.append(&mut batch);
            if done {
                break;
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_golden() {
        #[rustfmt::skip]
        let mut expected = vec![
            72, 0, 0, 0,        // nlmsg_len
            20, 0,              // nlmsg_type = SOCK_DIAG_BY_FAMILY
            0x01, 0x03,         // nlmsg_flags = NLM_F_REQUEST | NLM_F_DUMP
            1, 0, 0, 0,         // nlmsg_seq
            0, 0, 0, 0,         // nlmsg_pid
            2,                  // family = AF_INET
            6,                  // protocol = IPPROTO_TCP
            0, 0,               // ext, pad
            0x00, 0x04, 0, 0,   // states = 1 << TCP_LISTEN
        ];
        expected.extend_from_slice(&[0u8; 48]);

        assert_eq!(encode_request(1), expected);
    }

    fn push_diag_msg(buf: &mut Vec<u8>, port: u16, inode: u32) {
        let msg_len = (NLMSG_HDRLEN + INET_DIAG_MSG_LEN) as u32;
        buf.extend_from_slice(&msg_len.to_le_bytes());
        buf.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // flags
        buf.extend_from_slice(&1u32.to_le_bytes()); // seq
        buf.extend_from_slice(&0u32.to_le_bytes()); // pid

        // inet_diag_msg
        buf.push(2); // family
        buf.push(10); // state = LISTEN
        buf.push(0); // timer
        buf.push(0); // retrans
        buf.extend_from_slice(&port.to_be_bytes()); // id.sport
        buf.extend_from_slice(&[0u8; 46]); // rest of inet_diag_sockid
        buf.extend_from_slice(&[0u8; 16]); // expires, rqueue, wqueue, uid
        buf.extend_from_slice(&inode.to_le_bytes());
    }

    fn push_done(buf: &mut Vec<u8>) {
        buf.extend_from_slice(&20u32.to_le_bytes());
        buf.extend_from_slice(&NLMSG_DONE.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // dump status
    }

    #[test]
    fn test_parse_two_records_then_done() {
        let mut buf = Vec::new();
        push_diag_msg(&mut buf, 9229, 6);
        push_diag_msg(&mut buf, 80, 9);
        push_done(&mut buf);

        let (records, done) = parse_messages(&buf).unwrap();
        assert!(done);
        assert_eq!(
            records,
            vec![
                SocketRecord { inode: 6, port: 9229 },
                SocketRecord { inode: 9, port: 80 },
            ]
        );
    }

    #[test]
    fn test_parse_partial_dump_not_done() {
        let mut buf = Vec::new();
        push_diag_msg(&mut buf, 2345, 41);

        let (records, done) = parse_messages(&buf).unwrap();
        assert!(!done);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].port, 2345);
    }

    #[test]
    fn test_parse_error_message() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&20u32.to_le_bytes());
        buf.extend_from_slice(&NLMSG_ERROR.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&(-13i32).to_le_bytes()); // -EACCES

        let err = parse_messages(&buf).unwrap_err();
        assert!(matches!(err, PortsError::Netlink { .. }));
        assert!(err.to_string().contains("13"));
    }

    #[test]
    fn test_parse_rejects_truncated_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&9999u32.to_le_bytes()); // length beyond buffer
        buf.extend_from_slice(&SOCK_DIAG_BY_FAMILY.to_le_bytes());
        buf.extend_from_slice(&[0u8; 10]);

        assert!(matches!(
            parse_messages(&buf),
            Err(PortsError::Parse { .. })
        ));
    }
}
