//! Storage map, UDP tracker RPC, and peer exchange engine for a BitTorrent
//! V1 client: the pieces that move bytes between disk, trackers and peers
//! while preserving protocol invariants.
//!
//! Surrounding functionality — DHT, the bencoded HTTP tracker client,
//! CLI/GUI, and the multi-torrent scheduler that composes sessions — is
//! out of scope; this crate only owns the three core subsystems (see each
//! module's docs) plus the small set of collaborators they need.

// needed by `select!`-style branching in the tracker manager's
// retransmission loop reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate serde_derive;

pub mod bitfield;
mod clock;
pub mod conf;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod storage_info;
pub mod swarm;
pub mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use storage_info::FileInfo;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types
/// in Rust.
pub type PieceIndex = usize;

/// The type of a file's index.
pub type FileIndex = usize;

/// Each torrent gets a randomly assigned ID that is unique within the
/// application.
pub type TorrentId = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer, or the set of
/// pieces we've verified complete (spec.md §3).
///
/// It is a compact bool vector of most significant bits to least
/// significant bits, that is, where the first highest bit represents the
/// first piece, the second highest element the second piece, and so on
/// (e.g. `0b1100_0001` would mean that we have pieces 0, 1, and 7). A
/// truthy boolean value of a piece's position in this vector means that the
/// peer has the piece, while a falsy value means it doesn't have the
/// piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// This is the only block length we're dealing with (except for possibly
/// the last block). It is the widely used and accepted 16 KiB.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloading torrents happen at this block level
/// granularity (spec.md §3). Public because it's part of the Piece Store
/// and Peer Exchange public contracts (§4.B, §4.D).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes. Always 16 KiB (0x4000 bytes), except
    /// possibly for the last block of the last piece.
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece, assuming the
    /// default block length of 16 KiB.
    pub fn index_in_piece(&self) -> PieceIndex {
        // we need to use "lower than or equal" as this may be the last
        // block in which case it may be shorter than the default block
        // length
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as PieceIndex
    }
}

/// Returns the length of the block at the index in piece.
///
/// If the piece is not a multiple of the default block length, the
/// returned value is smaller.
///
/// # Panics
///
/// Panics if the index multiplied by the default block length would exceed
/// the piece length.
pub(crate) fn block_len(piece_len: u32, index: usize) -> u32 {
    let index = index as u32;
    let block_offset = index * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
pub(crate) fn block_count(piece_len: u32) -> usize {
    // all but the last piece are a multiple of the block length, but the
    // last piece may be shorter so we need to account for this by rounding
    // up before dividing to get the number of blocks in piece
    (piece_len as usize + (BLOCK_LEN as usize - 1)) / BLOCK_LEN as usize
}
