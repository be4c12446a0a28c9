//! The UDP Tracker Manager (spec.md §4.C): a single multiplexed socket
//! that services `announce`/`scrape` RPCs for every tracker a torrent
//! talks to, with connection-id caching and BEP-15 exponential
//! retransmission.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::udp::{RecvHalf, SendHalf};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::conf::TrackerConf;
use crate::error::{Error, Result};
use crate::tracker::wire::{self, AnnounceParams, Request, Response};
use crate::Sha1Hash;

/// How long a cached `connection_id` remains valid before a fresh
/// `Connect` exchange is required (BEP-15).
const CONNECTION_TTL: Duration = Duration::from_secs(60);

/// The result of a successful `announce` call.
#[derive(Debug, Clone)]
pub struct AnnounceInfo {
    pub interval: Duration,
    pub leecher_count: u32,
    pub seeder_count: u32,
    pub peers: Vec<SocketAddr>,
}

/// One torrent's scrape record, paired with the infohash it was requested
/// for (since `scrape` takes a batch, response order mirrors request
/// order per BEP-15, but callers shouldn't have to rely on that).
#[derive(Debug, Clone)]
pub struct ScrapeInfo {
    pub info_hash: Sha1Hash,
    pub seeder_count: u32,
    pub completed_count: u32,
    pub leecher_count: u32,
}

struct CachedConnection {
    id: u64,
    established_at: Instant,
}

/// A single-shot handoff slot from the listener task to whichever caller
/// is awaiting a transaction's response.
type ResponseSlot = oneshot::Sender<Response>;

/// `address -> (transaction_id -> response slot)`.
type PendingTable = HashMap<SocketAddr, HashMap<u32, ResponseSlot>>;

/// Multiplexes tracker RPCs for every tracker address over one UDP socket.
pub struct Manager {
    /// `UdpSocket::send_to` takes `&mut self` in tokio 0.2 (there is no
    /// `&self` variant until a later release), so the send half is split
    /// off at bind time and shared behind a mutex; the listener owns the
    /// recv half outright since only it ever reads.
    send: Arc<Mutex<SendHalf>>,
    local_addr: SocketAddr,
    conf: TrackerConf,
    clock: Arc<dyn Clock>,
    connections: Arc<Mutex<HashMap<SocketAddr, CachedConnection>>>,
    pending: Arc<Mutex<PendingTable>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: std::sync::atomic::AtomicBool,
    bad_packet_count: Arc<std::sync::atomic::AtomicU64>,
}

/// A snapshot of the manager's diagnostic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of datagrams received that failed to decode as a tracker
    /// response, or whose transaction id didn't match an awaiting caller.
    /// These are dropped silently at the listener (matching BEP-15's
    /// "ignore and wait for retransmission" guidance) but counted here so
    /// a caller can notice a misbehaving or hostile tracker.
    pub bad_packet_count: u64,
}

impl Manager {
    /// Binds a UDP socket on an OS-assigned port and starts the background
    /// listener task.
    pub async fn new(conf: TrackerConf) -> Result<Self> {
        Self::with_clock(conf, Arc::new(SystemClock)).await
    }

    pub(crate) async fn with_clock(
        conf: TrackerConf,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let local_addr = socket.local_addr()?;
        let (recv_half, send_half) = socket.split();
        let send = Arc::new(Mutex::new(send_half));
        let pending: Arc<Mutex<PendingTable>> = Arc::new(Mutex::new(HashMap::new()));

        let bad_packet_count = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let listener = tokio::spawn(Self::listen(
            recv_half,
            Arc::clone(&pending),
            conf.max_packet_size,
            Arc::clone(&bad_packet_count),
        ));

        Ok(Self {
            send,
            local_addr,
            conf,
            clock,
            connections: Arc::new(Mutex::new(HashMap::new())),
            pending,
            listener: Mutex::new(Some(listener)),
            closed: std::sync::atomic::AtomicBool::new(false),
            bad_packet_count,
        })
    }

    /// Returns a snapshot of the manager's diagnostic counters.
    pub fn stats(&self) -> Stats {
        Stats {
            bad_packet_count: self
                .bad_packet_count
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    /// The background receive loop: decodes each datagram and dispatches
    /// it to the awaiting caller's slot, if any. Unparseable packets and
    /// late/unrecognized transaction ids are silently dropped.
    async fn listen(
        mut socket: RecvHalf,
        pending: Arc<Mutex<PendingTable>>,
        max_packet_size: usize,
        bad_packet_count: Arc<std::sync::atomic::AtomicU64>,
    ) {
        let mut buf = vec![0u8; max_packet_size];
        loop {
            let (len, addr) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("Tracker socket recv error: {}", e);
                    continue;
                }
            };

            let (transaction_id, response) = match wire::decode(&buf[..len]) {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("Dropping unparseable tracker packet from {}: {}", addr, e);
                    bad_packet_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    continue;
                }
            };

            let mut pending = pending.lock().await;
            if let Some(slots) = pending.get_mut(&addr) {
                if let Some(slot) = slots.remove(&transaction_id) {
                    // a waiting caller may have already dropped the
                    // receiver (cancellation); sending into a dropped
                    // receiver is a harmless no-op
                    let _ = slot.send(response);
                } else {
                    log::debug!(
                        "Dropping response for unknown/expired transaction {} from {}",
                        transaction_id,
                        addr
                    );
                    bad_packet_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    }

    /// Resolves a `udp://host:port` tracker URI to a socket address.
    async fn resolve(uri: &str) -> Result<SocketAddr> {
        let url = url::Url::parse(uri)
            .map_err(|_| Error::UnrecognizedScheme)?;
        if url.scheme() != "udp" {
            return Err(Error::UnrecognizedScheme);
        }
        let host = url.host_str().ok_or(Error::HostUnknown)?;
        let port = url.port().ok_or(Error::HostUnknown)?;
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| Error::HostLookupFailed)?;
        addrs.next().ok_or(Error::HostLookupFailed)
    }

    /// Returns a usable `connection_id` for `addr`, performing a fresh
    /// `Connect` exchange if there is no cached one or the cached one has
    /// expired.
    async fn connection_id(&self, addr: SocketAddr) -> Result<u64> {
        {
            let connections = self.connections.lock().await;
            if let Some(conn) = connections.get(&addr) {
                if self.clock.now().duration_since(conn.established_at) < CONNECTION_TTL {
                    return Ok(conn.id);
                }
            }
        }

        let response = self.send_and_await(addr, Request::Connect).await?;
        let id = match response {
            Response::Connect { connection_id } => connection_id,
            other => {
                return Err(Error::UnexpectedResponse {
                    expected: "connect",
                    actual: response_kind(&other),
                })
            }
        };

        let mut connections = self.connections.lock().await;
        connections.insert(
            addr,
            CachedConnection {
                id,
                established_at: self.clock.now(),
            },
        );
        Ok(id)
    }

    /// Allocates a transaction id not currently in use for `addr`,
    /// registers a response slot for it, and returns both along with the
    /// receiver half.
    async fn register_transaction(
        &self,
        addr: SocketAddr,
    ) -> (u32, oneshot::Receiver<Response>) {
        let mut pending = self.pending.lock().await;
        let slots = pending.entry(addr).or_insert_with(HashMap::new);

        let start: u32 = rand::random();
        let transaction_id = first_unused_id(slots, start)
            .expect("transaction id space exhausted");

        let (tx, rx) = oneshot::channel();
        slots.insert(transaction_id, tx);
        (transaction_id, rx)
    }

    /// Removes a transaction's slot without waiting for a response
    /// (cancellation path).
    async fn unregister_transaction(&self, addr: SocketAddr, transaction_id: u32) {
        let mut pending = self.pending.lock().await;
        if let Some(slots) = pending.get_mut(&addr) {
            slots.remove(&transaction_id);
            if slots.is_empty() {
                pending.remove(&addr);
            }
        }
    }

    /// Sends `request` to `addr` and awaits its response, retransmitting
    /// with exponentially growing timeouts per BEP-15 until
    /// `conf.max_timeout` would be exceeded.
    async fn send_and_await(&self, addr: SocketAddr, request: Request) -> Result<Response> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::ManagerClosed);
        }

        let (transaction_id, mut rx) = self.register_transaction(addr).await;
        let bytes = request.encode(transaction_id);

        let mut current_timeout = self.conf.min_timeout;
        let result = loop {
            if let Err(e) = self.send.lock().await.send_to(&bytes, addr).await {
                self.unregister_transaction(addr, transaction_id).await;
                return Err(e.into());
            }

            match time::timeout(current_timeout, &mut rx).await {
                Ok(Ok(response)) => break Ok(response),
                Ok(Err(_)) => {
                    // sender dropped: manager was closed mid-wait
                    break Err(Error::ManagerClosed);
                }
                Err(_elapsed) => {
                    let next_timeout = current_timeout * self.conf.multiplier;
                    if next_timeout > self.conf.max_timeout {
                        break Err(Error::TimeoutExpired(next_timeout.as_secs()));
                    }
                    current_timeout = next_timeout;
                    continue;
                }
            }
        };

        if result.is_err() {
            self.unregister_transaction(addr, transaction_id).await;
        }
        result
    }

    /// Sends an `Announce` request and returns the tracker's reply.
    pub async fn announce(&self, uri: &str, params: AnnounceParams) -> Result<AnnounceInfo> {
        let addr = Self::resolve(uri).await?;
        let connection_id = self.connection_id(addr).await?;
        let response = self
            .send_and_await(
                addr,
                Request::Announce {
                    connection_id,
                    params,
                },
            )
            .await?;

        match response {
            Response::Announce {
                interval_secs,
                leecher_count,
                seeder_count,
                peers,
            } => Ok(AnnounceInfo {
                interval: Duration::from_secs(interval_secs as u64),
                leecher_count,
                seeder_count,
                peers: peers.into_iter().map(SocketAddr::V4).collect(),
            }),
            Response::Error { message } => Err(Error::QueryFailed(message)),
            other => Err(Error::UnexpectedResponse {
                expected: "announce",
                actual: response_kind(&other),
            }),
        }
    }

    /// Sends a `Scrape` request for a batch of infohashes.
    pub async fn scrape(&self, uri: &str, info_hashes: &[Sha1Hash]) -> Result<Vec<ScrapeInfo>> {
        let addr = Self::resolve(uri).await?;
        let connection_id = self.connection_id(addr).await?;
        let response = self
            .send_and_await(
                addr,
                Request::Scrape {
                    connection_id,
                    info_hashes: info_hashes.to_vec(),
                },
            )
            .await?;

        match response {
            Response::Scrape { stats } => Ok(stats
                .into_iter()
                .zip(info_hashes.iter())
                .map(|(stat, hash)| ScrapeInfo {
                    info_hash: *hash,
                    seeder_count: stat.seeder_count,
                    completed_count: stat.completed_count,
                    leecher_count: stat.leecher_count,
                })
                .collect()),
            Response::Error { message } => Err(Error::QueryFailed(message)),
            other => Err(Error::UnexpectedResponse {
                expected: "scrape",
                actual: response_kind(&other),
            }),
        }
    }

    /// Shuts the manager down: stops the listener and fails every
    /// outstanding caller with [`Error::ManagerClosed`]. No further RPC may
    /// be issued afterwards.
    pub async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        let mut pending = self.pending.lock().await;
        for (_, slots) in pending.drain() {
            for (_, slot) in slots {
                // dropping the sender makes the awaiting `rx` resolve to
                // `Err`, which `send_and_await` maps to `ManagerClosed`
                drop(slot);
            }
        }
    }
}

fn response_kind(response: &Response) -> &'static str {
    match response {
        Response::Connect { .. } => "connect",
        Response::Announce { .. } => "announce",
        Response::Scrape { .. } => "scrape",
        Response::Error { .. } => "error",
    }
}

/// Finds a transaction id not already a key in `used`, starting the search
/// at `start`: `start` itself if free, else the nearest free id scanning
/// upward through consecutive occupied ids, else scanning downward.
/// Returns `None` only if the id space is fully saturated (practically
/// impossible with a healthy RNG).
fn first_unused_id<V>(used: &HashMap<u32, V>, start: u32) -> Option<u32> {
    if !used.contains_key(&start) {
        return Some(start);
    }

    let mut id = start;
    for _ in 0..used.len() {
        id = id.wrapping_add(1);
        if !used.contains_key(&id) {
            return Some(id);
        }
    }

    let mut id = start;
    for _ in 0..used.len() {
        id = id.wrapping_sub(1);
        if !used.contains_key(&id) {
            return Some(id);
        }
    }

    None
}
