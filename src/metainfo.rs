//! Parsing of bencoded `.torrent` metainfo files into the types the rest of
//! the engine needs: the info hash, the piece table, and the file layout.
//!
//! This module deliberately stays small (per spec.md §1, the metainfo parser
//! is a collaborator, not a core component): it owns just enough bencode
//! deserialization to hand the Storage Map and Piece Store what they need.

use std::path::PathBuf;

use serde::de::Error as DeError;
use serde_bencode::Error as BencodeError;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::storage_info::{FileInfo, FsStructure};
use crate::{PieceIndex, Sha1Hash};

/// The length of a single SHA-1 piece hash, in bytes.
const HASH_LEN: usize = 20;

/// The parsed and validated contents of a `.torrent` file, as needed by the
/// storage and piece-selection layers.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 of the bencoded `info` dictionary; identifies the torrent.
    pub info_hash: Sha1Hash,
    /// The suggested name of the torrent (file or archive directory name).
    pub name: String,
    /// The nominal length of a piece, in bytes. The final piece may be
    /// shorter; see [`Metainfo::piece_count`]/[`crate::storage_info::StorageInfo`].
    pub piece_len: u32,
    /// The concatenation of all piece SHA-1 hashes, 20 bytes each.
    pub piece_hashes: Vec<u8>,
    /// The file layout, as a single file or a flattened archive list.
    pub structure: FsStructure,
}

impl Metainfo {
    /// Parses and validates a raw bencoded `.torrent` file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, BencodeError> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        let info_hash = raw.create_info_hash()?;

        let piece_len = raw.info.piece_length as u32;
        let piece_hashes = raw.info.pieces.into_vec();
        if piece_hashes.len() % HASH_LEN != 0 {
            return Err(BencodeError::custom(
                "pieces string length is not a multiple of 20",
            ));
        }

        let structure = match raw.info.files {
            None => {
                let len = raw
                    .info
                    .length
                    .ok_or_else(|| BencodeError::custom("single-file torrent is missing length"))?;
                FsStructure::File(FileInfo {
                    path: PathBuf::from(&raw.info.name),
                    len,
                    torrent_offset: 0,
                })
            }
            Some(files) => {
                let mut torrent_offset = 0u64;
                let mut flattened = Vec::with_capacity(files.len());
                for file in files {
                    let len = file.length as u64;
                    let path: PathBuf = file.path.iter().collect();
                    flattened.push(FileInfo {
                        path,
                        len,
                        torrent_offset,
                    });
                    torrent_offset += len;
                }
                FsStructure::Archive { files: flattened }
            }
        };

        Ok(Self {
            info_hash,
            name: raw.info.name,
            piece_len,
            piece_hashes,
            structure,
        })
    }

    /// Returns the total download length in bytes.
    pub fn download_len(&self) -> u64 {
        self.structure.download_len()
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len() / HASH_LEN
    }

    /// Returns the expected SHA-1 hash of the piece at `index`, if valid.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        let start = index.checked_mul(HASH_LEN)?;
        let end = start.checked_add(HASH_LEN)?;
        let slice = self.piece_hashes.get(start..end)?;
        let mut hash = [0; HASH_LEN];
        hash.copy_from_slice(slice);
        Some(hash)
    }
}

/// The raw bencoded structure of a `.torrent` file, as sent over the wire /
/// stored on disk. Kept separate from [`Metainfo`] since the `info`
/// dictionary must be re-serialized byte-exact to compute the info hash.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: Info,
}

impl RawMetainfo {
    fn create_info_hash(&self) -> Result<Sha1Hash, BencodeError> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; HASH_LEN];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Info {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: ByteBuf,
    #[serde(rename = "piece length")]
    piece_length: i64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}
