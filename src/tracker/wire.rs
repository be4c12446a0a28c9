//! BEP-15 UDP tracker wire format: big-endian binary encode/decode for the
//! connect/announce/scrape request and response datagrams.
//!
//! Mirrors the `BytesMut::put_*` / `Buf::get_*` style the pack's UDP
//! tracker client uses, generalized into typed requests/responses instead
//! of one inline function per RPC.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::{PeerId, Sha1Hash};

/// The magic constant that must be sent as the protocol id in a `Connect`
/// request before a connection id has been established.
pub const PROTOCOL_ID: u64 = 0x0000_0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_SCRAPE: u32 = 2;
const ACTION_ERROR: u32 = 3;

/// The announce `event` field (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Completed,
    Started,
    Stopped,
}

impl AnnounceEvent {
    fn to_wire(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }
}

/// Parameters for an `Announce` request, independent of the transaction
/// bookkeeping the manager adds.
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    /// 0 lets the tracker use the request's source address.
    pub ip: u32,
    pub key: u32,
    /// -1 lets the tracker decide how many peers to return.
    pub num_want: i32,
    pub port: u16,
}

/// A request ready to be serialized and sent to a tracker.
#[derive(Debug, Clone)]
pub enum Request {
    Connect,
    Announce {
        connection_id: u64,
        params: AnnounceParams,
    },
    Scrape {
        connection_id: u64,
        info_hashes: Vec<Sha1Hash>,
    },
}

impl Request {
    /// Serializes this request, given the well-known `connection_id`
    /// (`0x41727101980` for `Connect`) and the already-allocated
    /// `transaction_id`.
    pub fn encode(&self, transaction_id: u32) -> BytesMut {
        match self {
            Self::Connect => {
                let mut buf = BytesMut::with_capacity(16);
                buf.put_u64(PROTOCOL_ID);
                buf.put_u32(ACTION_CONNECT);
                buf.put_u32(transaction_id);
                buf
            }
            Self::Announce {
                connection_id,
                params,
            } => {
                let mut buf = BytesMut::with_capacity(98);
                buf.put_u64(*connection_id);
                buf.put_u32(ACTION_ANNOUNCE);
                buf.put_u32(transaction_id);
                buf.put_slice(&params.info_hash);
                buf.put_slice(&params.peer_id);
                buf.put_u64(params.downloaded);
                buf.put_u64(params.left);
                buf.put_u64(params.uploaded);
                buf.put_u32(params.event.to_wire());
                buf.put_u32(params.ip);
                buf.put_u32(params.key);
                buf.put_i32(params.num_want);
                buf.put_u16(params.port);
                buf
            }
            Self::Scrape {
                connection_id,
                info_hashes,
            } => {
                let mut buf =
                    BytesMut::with_capacity(16 + 20 * info_hashes.len());
                buf.put_u64(*connection_id);
                buf.put_u32(ACTION_SCRAPE);
                buf.put_u32(transaction_id);
                for hash in info_hashes {
                    buf.put_slice(hash);
                }
                buf
            }
        }
    }
}

/// A peer address as returned in an announce response (BEP-15 is IPv4-only).
pub type Peer = SocketAddrV4;

/// A successfully decoded response, alongside the transaction id it carries
/// (the manager uses this to find the right pending slot).
#[derive(Debug, Clone)]
pub enum Response {
    Connect {
        connection_id: u64,
    },
    Announce {
        interval_secs: u32,
        leecher_count: u32,
        seeder_count: u32,
        peers: Vec<Peer>,
    },
    Scrape {
        stats: Vec<ScrapeStat>,
    },
    Error {
        message: String,
    },
}

/// One torrent's scrape statistics, in request order.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeStat {
    pub seeder_count: u32,
    pub completed_count: u32,
    pub leecher_count: u32,
}

/// Decodes a response datagram, returning the transaction id and the
/// parsed response. Returns `Err(Error::ProtocolError(_))` for anything
/// that doesn't parse as a well-formed BEP-15 response; the listener
/// silently drops such datagrams per spec.md §4.C/§7.
pub fn decode(mut buf: &[u8]) -> Result<(u32, Response)> {
    if buf.len() < 8 {
        return Err(Error::ProtocolError(
            "udp tracker datagram shorter than action+transaction_id".into(),
        ));
    }
    let action = buf.get_u32();
    let transaction_id = buf.get_u32();

    let response = match action {
        ACTION_CONNECT => {
            if buf.remaining() < 8 {
                return Err(Error::ProtocolError(
                    "truncated connect response".into(),
                ));
            }
            Response::Connect {
                connection_id: buf.get_u64(),
            }
        }
        ACTION_ANNOUNCE => {
            if buf.remaining() < 12 {
                return Err(Error::ProtocolError(
                    "truncated announce response".into(),
                ));
            }
            let interval_secs = buf.get_u32();
            let leecher_count = buf.get_u32();
            let seeder_count = buf.get_u32();
            if buf.remaining() % 6 != 0 {
                return Err(Error::ProtocolError(
                    "announce peer list not a multiple of 6 bytes".into(),
                ));
            }
            let mut peers = Vec::with_capacity(buf.remaining() / 6);
            while buf.has_remaining() {
                let ip = Ipv4Addr::from(buf.get_u32());
                let port = buf.get_u16();
                peers.push(SocketAddrV4::new(ip, port));
            }
            Response::Announce {
                interval_secs,
                leecher_count,
                seeder_count,
                peers,
            }
        }
        ACTION_SCRAPE => {
            if buf.remaining() % 12 != 0 {
                return Err(Error::ProtocolError(
                    "scrape response not a multiple of 12 bytes".into(),
                ));
            }
            let mut stats = Vec::with_capacity(buf.remaining() / 12);
            while buf.has_remaining() {
                stats.push(ScrapeStat {
                    seeder_count: buf.get_u32(),
                    completed_count: buf.get_u32(),
                    leecher_count: buf.get_u32(),
                });
            }
            Response::Scrape { stats }
        }
        ACTION_ERROR => {
            let message = String::from_utf8_lossy(buf.bytes()).into_owned();
            Response::Error { message }
        }
        _ => {
            return Err(Error::ProtocolError(format!(
                "unrecognized tracker action {}",
                action
            )))
        }
    };

    Ok((transaction_id, response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_connect_request_per_bep15() {
        let req = Request::Connect;
        let buf = req.encode(0xdead_beef);
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[0..8], &PROTOCOL_ID.to_be_bytes());
        assert_eq!(&buf[8..12], &ACTION_CONNECT.to_be_bytes());
        assert_eq!(&buf[12..16], &0xdead_beefu32.to_be_bytes());
    }

    #[test]
    fn round_trips_connect_response() {
        let mut buf = BytesMut::new();
        buf.put_u32(ACTION_CONNECT);
        buf.put_u32(42);
        buf.put_u64(0x1122_3344_5566_7788);
        let (tid, resp) = decode(&buf).unwrap();
        assert_eq!(tid, 42);
        match resp {
            Response::Connect { connection_id } => {
                assert_eq!(connection_id, 0x1122_3344_5566_7788)
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn round_trips_announce_response_with_peers() {
        let mut buf = BytesMut::new();
        buf.put_u32(ACTION_ANNOUNCE);
        buf.put_u32(7);
        buf.put_u32(1800);
        buf.put_u32(2);
        buf.put_u32(3);
        buf.put_slice(&[1, 2, 3, 4]);
        buf.put_u16(6881);
        let (tid, resp) = decode(&buf).unwrap();
        assert_eq!(tid, 7);
        match resp {
            Response::Announce {
                interval_secs,
                leecher_count,
                seeder_count,
                peers,
            } => {
                assert_eq!(interval_secs, 1800);
                assert_eq!(leecher_count, 2);
                assert_eq!(seeder_count, 3);
                assert_eq!(
                    peers,
                    vec![SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 6881)]
                );
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_malformed_announce_peer_list() {
        let mut buf = BytesMut::new();
        buf.put_u32(ACTION_ANNOUNCE);
        buf.put_u32(1);
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_u32(0);
        // 5 bytes: not a multiple of 6
        buf.put_slice(&[0u8; 5]);
        assert!(decode(&buf).is_err());
    }

    #[test]
    fn decodes_error_response_message() {
        let mut buf = BytesMut::new();
        buf.put_u32(ACTION_ERROR);
        buf.put_u32(9);
        buf.put_slice(b"bad info_hash");
        let (tid, resp) = decode(&buf).unwrap();
        assert_eq!(tid, 9);
        match resp {
            Response::Error { message } => assert_eq!(message, "bad info_hash"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_datagram_too_short_to_contain_header() {
        assert!(decode(&[0, 1, 2]).is_err());
    }
}
