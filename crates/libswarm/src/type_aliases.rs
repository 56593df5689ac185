use std::net::SocketAddr;

pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

pub type PeerHandle = SocketAddr;

pub fn bitfield_with_len(len: usize) -> BF {
    BF::repeat(false, len)
}
