//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub tracker: TrackerConf,
    pub peer: PeerConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CRATETORRENT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
            tracker: TrackerConf::default(),
            peer: PeerConf::default(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
        }
    }
}

/// Configuration for the UDP tracker manager.
///
/// The defaults follow BEP-15: an initial 15 second timeout, doubling on
/// each retry, up to 15 * 2^8 seconds before giving up.
#[derive(Clone, Copy, Debug)]
pub struct TrackerConf {
    /// The largest UDP datagram the manager will attempt to send or parse.
    pub max_packet_size: usize,
    /// The initial retransmission timeout.
    pub min_timeout: Duration,
    /// Retransmission stops once the next timeout would exceed this value.
    pub max_timeout: Duration,
    /// The factor by which the timeout grows after each unanswered send.
    pub multiplier: u32,
}

impl Default for TrackerConf {
    fn default() -> Self {
        Self {
            max_packet_size: 1208,
            min_timeout: Duration::from_secs(15),
            max_timeout: Duration::from_secs(15 * (1 << 8)),
            multiplier: 2,
        }
    }
}

/// Configuration for peer sessions.
#[derive(Clone, Copy, Debug)]
pub struct PeerConf {
    /// Whether the Fast extension (BEP-6) is advertised and honored.
    ///
    /// If disabled, any Fast-only message (`HaveAll`, `HaveNone`,
    /// `SuggestPiece`, `RejectRequest`, `AllowedFast`) received from a peer
    /// is a protocol error that terminates the session.
    pub fast_extension_enabled: bool,
    /// If set, receiving a `Piece` message for a block that was never
    /// requested is a protocol error rather than a silently dropped message.
    pub strict_unrequested_blocks: bool,
}

impl Default for PeerConf {
    fn default() -> Self {
        Self {
            fast_extension_enabled: true,
            strict_unrequested_blocks: false,
        }
    }
}
