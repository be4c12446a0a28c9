//! Helpers over [`crate::Bitfield`], the packed piece-availability set used
//! by both the Piece Store and the Peer Exchange state machine.
//!
//! `Bitfield` is just `BitVec<Msb0, u8>` (see `lib.rs`); these free
//! functions give it the set-like operations spec.md §3 asks for
//! (union, difference, membership, min-index, emptiness, "all", "none")
//! without growing the type itself, the way `bitvec` idioms favor.

use bitvec::prelude::*;

use crate::{Bitfield, PieceIndex};

/// Returns a new, all-zero bitfield with room for `len` pieces.
pub fn new(len: usize) -> Bitfield {
    bitvec![Msb0, u8; 0; len]
}

/// Returns a new bitfield of length `len`, resized/truncated from `bf`,
/// with bits past the original length cleared. Used when a wire bitfield
/// (whose byte-aligned length may exceed the logical piece count) needs to
/// be trimmed to the torrent's real piece count.
pub fn resize(bf: &mut Bitfield, len: usize) {
    bf.resize(len, false);
}

/// `a | b`, piece-wise. Panics if the two bitfields have different lengths.
pub fn union(a: &Bitfield, b: &Bitfield) -> Bitfield {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| *x || *y).collect()
}

/// `a \ b`: pieces in `a` that are not in `b`. Panics if the two bitfields
/// have different lengths.
pub fn difference(a: &Bitfield, b: &Bitfield) -> Bitfield {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| *x && !*y).collect()
}

/// Whether piece `index` is set.
pub fn contains(bf: &Bitfield, index: PieceIndex) -> bool {
    bf.get(index).map(|b| *b).unwrap_or(false)
}

/// The lowest set piece index, if any.
pub fn min_index(bf: &Bitfield) -> Option<PieceIndex> {
    bf.iter().position(|b| *b)
}

/// Whether no piece is set.
pub fn is_empty(bf: &Bitfield) -> bool {
    !bf.any()
}

/// Whether every piece is set.
pub fn is_full(bf: &Bitfield) -> bool {
    bf.all()
}

/// Collects the set indices into a `Vec`, in ascending order.
pub fn indices(bf: &Bitfield) -> Vec<PieceIndex> {
    bf.iter()
        .enumerate()
        .filter_map(|(i, b)| if *b { Some(i) } else { None })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;
    use pretty_assertions::assert_eq;

    fn bf(bits: &[bool]) -> Bitfield {
        bits.iter().collect()
    }

    #[test]
    fn union_is_piece_wise_or() {
        let a = bf(&[true, false, false, true]);
        let b = bf(&[false, true, false, true]);
        assert_eq!(union(&a, &b), bf(&[true, true, false, true]));
    }

    #[test]
    fn difference_is_in_a_not_b() {
        let a = bf(&[true, true, false, true]);
        let b = bf(&[false, true, false, true]);
        assert_eq!(difference(&a, &b), bf(&[true, false, false, false]));
    }

    #[test]
    fn min_index_and_empty_and_full() {
        let empty: Bitfield = bitvec![Msb0, u8; 0, 0, 0, 0];
        assert!(is_empty(&empty));
        assert!(!is_full(&empty));
        assert_eq!(min_index(&empty), None);

        let full: Bitfield = bitvec![Msb0, u8; 1, 1, 1, 1];
        assert!(is_full(&full));
        assert!(!is_empty(&full));
        assert_eq!(min_index(&full), Some(0));

        let mixed: Bitfield = bitvec![Msb0, u8; 0, 1, 0, 1];
        assert_eq!(min_index(&mixed), Some(1));
        assert_eq!(indices(&mixed), vec![1, 3]);
    }

    #[test]
    fn only_indices_below_len_are_representable() {
        let mut wire_bits: Bitfield = bitvec![Msb0, u8; 1, 1, 1, 0, 0, 0, 0, 0];
        resize(&mut wire_bits, 3);
        assert_eq!(wire_bits.len(), 3);
        assert!(is_full(&wire_bits));
    }
}
