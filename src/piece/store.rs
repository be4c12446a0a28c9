//! The piece store: turns a stream of downloaded blocks into verified,
//! disk-resident pieces, and tells peer sessions which blocks are still
//! worth requesting.
//!
//! This sits directly atop the [`storage::Map`](crate::storage::Map): where
//! the map only knows about bytes at offsets, the piece store knows about
//! pieces, their expected hashes, and the Missing/Partial/Complete
//! lifecycle the rest of the engine cares about.

use std::collections::BTreeMap;
use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{
    bitfield, block_count, block_len,
    error::{Error, Result},
    storage::{Map, OpenMode},
    storage_info::{FsStructure, StorageInfo},
    Bitfield, BlockInfo, PieceIndex, Sha1Hash, BLOCK_LEN,
};

/// The write buffer for a piece that hasn't yet been verified complete.
///
/// Blocks are keyed by their offset within the piece so hashing can walk
/// them in order regardless of the order they arrived over the wire.
#[derive(Default)]
struct PartialPiece {
    blocks: BTreeMap<u32, Vec<u8>>,
}

impl PartialPiece {
    fn is_complete(&self, piece_len: u32) -> bool {
        self.blocks.len() == block_count(piece_len)
    }

    fn matches_hash(&self, expected: &Sha1Hash) -> bool {
        let mut hasher = Sha1::new();
        for block in self.blocks.values() {
            hasher.input(block);
        }
        let digest = hasher.result();
        digest.as_slice() == expected
    }

    fn assemble(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.blocks.values().map(Vec::len).sum());
        for block in self.blocks.values() {
            buf.extend_from_slice(block);
        }
        buf
    }
}

/// Owns the on-disk storage for a torrent and tracks which pieces have been
/// downloaded and verified.
///
/// A piece transitions `Missing -> Partial -> Complete` and is never
/// demoted: a piece that fails its hash check on completion simply has its
/// write buffer reset back to `Missing`, rather than being marked invalid.
pub struct PieceStore {
    storage: Map,
    info: StorageInfo,
    piece_hashes: Vec<u8>,
    in_progress: BTreeMap<PieceIndex, PartialPiece>,
    completed: Bitfield,
}

impl PieceStore {
    /// Opens the storage map for `info` and starts tracking piece
    /// completion from scratch (i.e. assumes nothing has been downloaded
    /// yet). `mode` is forwarded to [`Map::open`].
    pub fn new(info: StorageInfo, piece_hashes: Vec<u8>, mode: OpenMode) -> Result<Self> {
        let layout = Self::layout(&info);
        let storage = Map::open(&layout, mode)?;
        let completed = bitfield::new(info.piece_count);
        Ok(Self {
            storage,
            info,
            piece_hashes,
            in_progress: BTreeMap::new(),
            completed,
        })
    }

    /// Flattens the torrent's file structure into the `(path, size)` pairs
    /// [`Map::open`] expects, rooted at the download directory.
    fn layout(info: &StorageInfo) -> Vec<(PathBuf, u64)> {
        match &info.structure {
            FsStructure::File(file) => vec![(info.download_dir.join(&file.path), file.len)],
            FsStructure::Archive { files } => files
                .iter()
                .map(|f| (info.download_dir.join(&f.path), f.len))
                .collect(),
        }
    }

    /// Returns the expected hash of the piece at `index`, if the index is
    /// valid.
    fn expected_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        let start = index.checked_mul(20)?;
        let end = start.checked_add(20)?;
        let slice = self.piece_hashes.get(start..end)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    /// Reads `length` bytes at `offset` within the piece at `index` from
    /// disk, regardless of whether that piece has been verified complete.
    pub fn get_block(&self, index: PieceIndex, offset: u32, length: u32) -> Result<Vec<u8>> {
        let torrent_offset = index as u64 * self.info.piece_len as u64 + offset as u64;
        self.storage.read(torrent_offset, length as u64)
    }

    /// Buffers `block`'s bytes for its piece. Returns `true` iff this block
    /// completed the piece and the assembled piece's SHA-1 matches the
    /// expected hash, in which case the piece is written to disk and its
    /// bit is set in the client bitfield.
    ///
    /// If the block completes the piece but the hash doesn't match, the
    /// piece's write buffer is discarded (back to `Missing`) and `false` is
    /// returned.
    pub fn put_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<bool> {
        let index = info.piece_index;
        if bitfield::contains(&self.completed, index) {
            // already verified; duplicate or late retransmission, drop it
            log::debug!("Dropping block for already completed piece {}", index);
            return Ok(false);
        }

        let piece_len = self.info.piece_len(index)?;
        let expected_hash = self.expected_hash(index).ok_or(Error::InvalidPieceIndex)?;

        let piece = self.in_progress.entry(index).or_default();
        piece.blocks.entry(info.offset).or_insert(data);

        if !piece.is_complete(piece_len) {
            return Ok(false);
        }

        if piece.matches_hash(&expected_hash) {
            let assembled = piece.assemble();
            let torrent_offset = index as u64 * self.info.piece_len as u64;
            self.storage.write(torrent_offset, &assembled);
            self.in_progress.remove(&index);
            self.completed.set(index, true);
            log::info!("Piece {} verified and written to disk", index);
            Ok(true)
        } else {
            log::warn!(
                "Piece {} failed hash check (expected {}), discarding buffer",
                index,
                hex::encode(&expected_hash),
            );
            self.in_progress.remove(&index);
            Ok(false)
        }
    }

    /// Returns the block requests still needed to complete `piece_index`,
    /// in sequential offset order, skipping blocks already buffered.
    pub fn select_block(&self, piece_index: PieceIndex) -> Result<Vec<BlockInfo>> {
        if bitfield::contains(&self.completed, piece_index) {
            return Ok(Vec::new());
        }

        let piece_len = self.info.piece_len(piece_index)?;
        let partial = self.in_progress.get(&piece_index);

        let mut blocks = Vec::with_capacity(block_count(piece_len));
        for block_ix in 0..block_count(piece_len) {
            let offset = block_ix as u32 * BLOCK_LEN;
            let have = partial.map(|p| p.blocks.contains_key(&offset)).unwrap_or(false);
            if have {
                continue;
            }
            blocks.push(BlockInfo {
                piece_index,
                offset,
                len: block_len(piece_len, block_ix),
            });
        }
        Ok(blocks)
    }

    /// A snapshot of the set of pieces that have been downloaded and
    /// verified so far.
    pub fn client_bitfield(&self) -> Bitfield {
        self.completed.clone()
    }

    /// The total number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.info.piece_count
    }

    /// The length of the piece at `index`.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        self.info.piece_len(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Metainfo;
    use std::io::Write;

    fn single_file_fixture(
        dir: &std::path::Path,
        piece_len: u32,
        content: &[u8],
    ) -> (StorageInfo, Vec<u8>) {
        let path = dir.join("file.bin");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(&vec![0u8; content.len()]).unwrap();
        }

        let piece_count = (content.len() as u32 + piece_len - 1) / piece_len;
        let mut piece_hashes = Vec::new();
        for chunk in content.chunks(piece_len as usize) {
            let digest = Sha1::digest(chunk);
            piece_hashes.extend_from_slice(&digest);
        }
        assert_eq!(piece_hashes.len(), piece_count as usize * 20);

        let structure = FsStructure::File(crate::storage_info::FileInfo {
            path: PathBuf::from("file.bin"),
            len: content.len() as u64,
            torrent_offset: 0,
        });
        let last_piece_len = {
            let rem = content.len() as u32 % piece_len;
            if rem == 0 {
                piece_len
            } else {
                rem
            }
        };
        let info = StorageInfo {
            piece_count: piece_count as usize,
            piece_len,
            last_piece_len,
            download_len: content.len() as u64,
            download_dir: dir.to_path_buf(),
            structure,
        };
        (info, piece_hashes)
    }

    #[test]
    fn put_block_completes_and_verifies_single_block_piece() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let content = vec![7u8; piece_len as usize * 2];
        let (info, hashes) = single_file_fixture(dir.path(), piece_len, &content);

        let mut store = PieceStore::new(info, hashes, OpenMode::ReadWrite).unwrap();

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: piece_len,
        };
        let completed = store
            .put_block(block, content[0..piece_len as usize].to_vec())
            .unwrap();
        assert!(completed);
        assert!(bitfield::contains(&store.client_bitfield(), 0));
        assert!(!bitfield::contains(&store.client_bitfield(), 1));

        let read_back = store.get_block(0, 0, piece_len).unwrap();
        assert_eq!(read_back, content[0..piece_len as usize]);
    }

    #[test]
    fn put_block_with_bad_hash_resets_piece() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let content = vec![7u8; piece_len as usize];
        let (info, hashes) = single_file_fixture(dir.path(), piece_len, &content);

        let mut store = PieceStore::new(info, hashes, OpenMode::ReadWrite).unwrap();

        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: piece_len,
        };
        // corrupt the data relative to the recorded hash
        let corrupted = vec![9u8; piece_len as usize];
        let completed = store.put_block(block, corrupted).unwrap();
        assert!(!completed);
        assert!(!bitfield::contains(&store.client_bitfield(), 0));
        // the buffer was discarded, so selecting blocks again offers the
        // whole piece back
        let remaining = store.select_block(0).unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn select_block_skips_already_buffered_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN * 2;
        let content = vec![3u8; piece_len as usize];
        let (info, hashes) = single_file_fixture(dir.path(), piece_len, &content);

        let mut store = PieceStore::new(info, hashes, OpenMode::ReadWrite).unwrap();
        let first_block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: BLOCK_LEN,
        };
        store
            .put_block(first_block, content[0..BLOCK_LEN as usize].to_vec())
            .unwrap();

        let remaining = store.select_block(0).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].offset, BLOCK_LEN);
    }

    #[test]
    fn rejects_out_of_range_piece_index() {
        let dir = tempfile::tempdir().unwrap();
        let piece_len = BLOCK_LEN;
        let content = vec![1u8; piece_len as usize];
        let (info, hashes) = single_file_fixture(dir.path(), piece_len, &content);
        let store = PieceStore::new(info, hashes, OpenMode::ReadWrite).unwrap();
        assert!(store.select_block(5).is_err());
    }

    // sanity check that `Metainfo`'s piece hashing lines up with what the
    // piece store expects, end to end
    #[test]
    fn metainfo_piece_hash_matches_store_expectation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d4:infod6:lengthi10e4:name8:file.bin12:piece lengthi4e6:pieces40:",
        );
        buf.extend_from_slice(&[0u8; 40]);
        buf.extend_from_slice(b"ee");
        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.piece_hash(0), Some([0u8; 20]));
        assert_eq!(metainfo.piece_hash(2), None);
    }
}
