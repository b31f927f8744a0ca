use bitvec::{order::Msb0, prelude as bv};

// bitfields sent on the peer messages codec are big endian byte order (i.e Most significant bit
// first)
pub type Bitfield = bv::BitVec<u8, Msb0>;
pub type Bitslice = bv::BitSlice<u8, Msb0>;

/// build a bitfield for `n_pieces` pieces from the raw bytes sent by a peer.
/// trailing spare bits are dropped, a short payload is padded with zeroes.
pub fn bitfield_from_wire(bytes: &[u8], n_pieces: usize) -> Bitfield {
    let mut bitfield = Bitfield::from_slice(bytes);
    bitfield.resize(n_pieces, false);
    bitfield
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[0b1010_0000], 3, &[true, false, true])]
    #[case(&[0xFF, 0xFF], 10, &[true; 10])]
    #[case(&[0b1000_0000], 12, &[true, false, false, false, false, false, false, false, false, false, false, false])]
    fn test_bitfield_from_wire(#[case] bytes: &[u8], #[case] n: usize, #[case] expected: &[bool]) {
        let bitfield = bitfield_from_wire(bytes, n);
        assert_eq!(bitfield.len(), n);
        assert!(bitfield.iter().by_vals().eq(expected.iter().copied()));
    }
}
