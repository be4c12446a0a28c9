//! The Storage Map: a memory-mapped, position-indexed view over a torrent's
//! files, presenting them as a single contiguous logical address space.
//!
//! This is the runtime counterpart to [`crate::storage_info::StorageInfo`]:
//! that module describes the *planned* file/piece geometry derived from
//! metainfo, while [`Map`] is the actually-mapped region set the Piece Store
//! reads and writes through.

use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::error::{Error, Result};

/// How a [`Map`] is opened, mirroring the access pattern the caller intends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Files are opened read-only; [`Map::write`] on such a map panics.
    ReadOnly,
    /// Files must already exist and are mapped read-write.
    ReadWrite,
    /// Like `ReadWrite`, but files are created (and truncated to the
    /// expected size) if they don't already exist.
    ReadWriteEx,
}

/// One physical file's position in the logical address space.
struct FileEntry {
    /// The logical byte offset at which this file begins.
    base_offset: u64,
    /// The file's length, in bytes.
    len: u64,
    /// The path this entry was opened from, kept for diagnostics.
    path: PathBuf,
    region: Region,
}

enum Region {
    ReadOnly(Mmap),
    // `UnsafeCell` gives the map interior mutability for writes: callers are
    // responsible (per spec.md §5) for not concurrently writing overlapping
    // byte ranges from different threads; piece-granularity locking is the
    // Piece Store's job, not this layer's.
    ReadWrite(UnsafeCell<MmapMut>),
}

impl Region {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::ReadOnly(m) => &m[..],
            // SAFETY: `MmapMut` derefs to `[u8]`; reading through a shared
            // reference while another thread may be writing a *disjoint*
            // range is the caller-enforced invariant mentioned above.
            Self::ReadWrite(cell) => unsafe { &*cell.get() }.as_ref(),
        }
    }

    fn as_mut_slice(&self) -> Option<&mut [u8]> {
        match self {
            Self::ReadOnly(_) => None,
            Self::ReadWrite(cell) => {
                // SAFETY: see `as_slice`.
                Some(unsafe { &mut *cell.get() }.as_mut())
            }
        }
    }
}

// `Region` holds a raw mapping; it is `Send`/`Sync` under the same
// discipline `memmap2::MmapMut` itself is: concurrent access to disjoint
// byte ranges is sound, overlapping concurrent writes are a caller bug, not
// a memory safety issue (the kernel serializes individual page writes).
unsafe impl Sync for Region {}

/// A memory-mapped, contiguous view over an ordered list of files.
pub struct Map {
    entries: Vec<FileEntry>,
    size: u64,
    mode: OpenMode,
}

impl Map {
    /// Opens every file in `layout` and maps it into the logical address
    /// space, in order.
    ///
    /// `layout` is an ordered list of `(path, expected_size)` pairs; all
    /// sizes must be greater than zero. If any file's actual size doesn't
    /// match its expected size, every region mapped so far is released
    /// before returning [`Error::FileSizeMismatch`].
    pub fn open(layout: &[(PathBuf, u64)], mode: OpenMode) -> Result<Self> {
        let mut entries = Vec::with_capacity(layout.len());
        let mut base_offset = 0u64;

        for (path, expected_size) in layout {
            debug_assert!(*expected_size > 0);
            match Self::open_one(path, *expected_size, mode) {
                Ok(region) => {
                    entries.push(FileEntry {
                        base_offset,
                        len: *expected_size,
                        path: path.clone(),
                        region,
                    });
                    base_offset += expected_size;
                }
                Err(e) => {
                    // roll back: dropping `entries` unmaps everything we
                    // successfully mapped so far
                    log::warn!(
                        "Failed to map {:?} ({} bytes expected): {}",
                        path,
                        expected_size,
                        e
                    );
                    return Err(e);
                }
            }
        }

        Ok(Self {
            entries,
            size: base_offset,
            mode,
        })
    }

    fn open_one(path: &Path, expected_size: u64, mode: OpenMode) -> Result<Region> {
        let region = match mode {
            OpenMode::ReadOnly => {
                let file = OpenOptions::new().read(true).open(path)?;
                let actual_size = file.metadata()?.len();
                if actual_size != expected_size {
                    return Err(Error::FileSizeMismatch);
                }
                let mmap = unsafe { MmapOptions::new().map(&file)? };
                Region::ReadOnly(mmap)
            }
            OpenMode::ReadWrite | OpenMode::ReadWriteEx => {
                let mut open_opts = OpenOptions::new();
                open_opts.read(true).write(true);
                if mode == OpenMode::ReadWriteEx {
                    open_opts.create(true);
                }
                let file = open_opts.open(path)?;
                let actual_size = file.metadata()?.len();
                if actual_size != expected_size {
                    if mode == OpenMode::ReadWriteEx && actual_size == 0 {
                        file.set_len(expected_size)?;
                    } else {
                        return Err(Error::FileSizeMismatch);
                    }
                }
                let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
                Region::ReadWrite(UnsafeCell::new(mmap))
            }
        };
        Ok(region)
    }

    /// Releases every mapping. Idempotent: calling this (or dropping the
    /// map, or calling it again) after the entries are already empty is a
    /// no-op.
    pub fn close(&mut self) {
        self.entries.clear();
        self.size = 0;
    }

    /// The total logical size of the map, in bytes. `0` once closed or if
    /// opened with an empty layout.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The mode this map was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Binary searches `entries` for the file containing logical offset
    /// `x`, per spec.md §4.A's offset resolution algorithm.
    ///
    /// Returns `(entry_index, intra_file_offset)`, or `None` if `x` is past
    /// the end of the map.
    fn resolve(&self, x: u64) -> Option<(usize, u64)> {
        if x >= self.size {
            return None;
        }
        let mut lo = 0usize;
        let mut hi = self.entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let entry = &self.entries[mid];
            if x < entry.base_offset {
                hi = mid;
            } else if x >= entry.base_offset + entry.len {
                lo = mid + 1;
            } else {
                return Some((mid, x - entry.base_offset));
            }
        }
        None
    }

    /// Reads exactly `length` bytes starting at `offset`, copying them into
    /// a freshly allocated, caller-owned buffer.
    ///
    /// Fails with [`Error::OutOfRange`] if `offset + length` exceeds
    /// [`Map::size`].
    pub fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if length == 0 {
            if offset > self.size {
                return Err(Error::OutOfRange);
            }
            return Ok(Vec::new());
        }
        let end = offset.checked_add(length).ok_or(Error::OutOfRange)?;
        if end > self.size {
            return Err(Error::OutOfRange);
        }

        let mut out = Vec::with_capacity(length as usize);
        let (mut entry_ix, mut intra_offset) =
            self.resolve(offset).ok_or(Error::OutOfRange)?;
        let mut remaining = length;

        while remaining > 0 {
            let entry = &self.entries[entry_ix];
            let slice = entry.region.as_slice();
            let available = slice.len() as u64 - intra_offset;
            let take = available.min(remaining);
            out.extend_from_slice(
                &slice[intra_offset as usize..(intra_offset + take) as usize],
            );
            remaining -= take;
            entry_ix += 1;
            intra_offset = 0;
        }

        Ok(out)
    }

    /// Writes as many of `bytes` as fit before the end of the map, starting
    /// at `offset`. If `offset + bytes.len()` exceeds [`Map::size`], the
    /// write is silently truncated to `size - offset` bytes: this is
    /// load-bearing behavior callers that pad final blocks rely on, not a
    /// bug (spec.md §4.A, §9).
    ///
    /// Returns the number of bytes actually written.
    ///
    /// # Panics
    ///
    /// Panics if the map was opened with [`OpenMode::ReadOnly`].
    pub fn write(&self, offset: u64, bytes: &[u8]) -> usize {
        assert_ne!(
            self.mode,
            OpenMode::ReadOnly,
            "cannot write to a read-only storage map"
        );

        if offset >= self.size || bytes.is_empty() {
            return 0;
        }
        let max_len = (self.size - offset).min(bytes.len() as u64);
        let to_write = max_len as usize;

        let (mut entry_ix, mut intra_offset) = match self.resolve(offset) {
            Some(pos) => pos,
            None => return 0,
        };
        let mut written = 0usize;

        while written < to_write {
            let entry = &self.entries[entry_ix];
            let slice = entry
                .region
                .as_mut_slice()
                .expect("checked not read-only above");
            let available = slice.len() - intra_offset as usize;
            let take = available.min(to_write - written);
            slice[intra_offset as usize..intra_offset as usize + take]
                .copy_from_slice(&bytes[written..written + take]);
            written += take;
            entry_ix += 1;
            intra_offset = 0;
        }

        written
    }

    /// Returns a zero-copy view of `length` bytes starting at `offset`,
    /// aliasing the mapping directly.
    ///
    /// # Safety
    ///
    /// The returned slice aliases this map's memory and must not be
    /// retained past a call to [`Map::close`] (or this `Map`'s `Drop`). It
    /// must also not overlap a concurrent [`Map::write`] to the same bytes
    /// from another thread, per the piece-granularity locking policy in
    /// spec.md §5.
    pub unsafe fn unsafe_view(&self, offset: u64, length: u64) -> Result<&[u8]> {
        let end = offset.checked_add(length).ok_or(Error::OutOfRange)?;
        if end > self.size {
            return Err(Error::OutOfRange);
        }
        // the common case (and the only one we can return a single
        // contiguous slice for) is a view that fits within one file
        let (entry_ix, intra_offset) = self.resolve(offset).ok_or(Error::OutOfRange)?;
        let entry = &self.entries[entry_ix];
        let slice = entry.region.as_slice();
        if intra_offset + length > slice.len() as u64 {
            // crosses a file boundary: no single contiguous slice exists
            return Err(Error::OutOfRange);
        }
        Ok(&slice[intra_offset as usize..(intra_offset + length) as usize])
    }

    /// The paths this map was opened from, in logical order (for
    /// diagnostics/tests).
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|e| e.path.as_path())
    }
}
