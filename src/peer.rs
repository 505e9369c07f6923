pub mod connection;
pub mod downloader;
pub mod handshake;
pub mod message;
pub mod queue;
pub mod server;
pub mod storage;

use rand::Rng;

pub type PeerId = [u8; 20];

const PEER_ID_PREFIX: &[u8; 8] = b"-BB0100-";

/// A fresh peer id: a fixed client prefix followed by random alphanumerics.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::rng();
    for byte in &mut id[8..] {
        *byte = rng.sample(rand::distr::Alphanumeric);
    }
    id
}

/// Which pieces a peer holds. Piece `i` lives in bit `7 - i % 8` of byte
/// `i / 8`; bits past `num` are padding and never reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    masks: Vec<u8>,
    pub num: usize,
}

impl Bitfield {
    pub fn new(num: usize) -> Self {
        Bitfield { masks: vec![0; num.div_ceil(8)], num }
    }

    pub fn full(num: usize) -> Self {
        let mut bf = Bitfield { masks: vec![0xFF; num.div_ceil(8)], num };
        let extra = num % 8;
        if extra != 0 {
            if let Some(last) = bf.masks.last_mut() {
                *last = 0xFF << (8 - extra);
            }
        }
        bf
    }

    /// Wraps bytes received from a peer. A short vector is zero-extended so
    /// later HAVE messages can still be recorded.
    pub fn from_bytes(mut v: Vec<u8>, num: usize) -> Self {
        let needed = num.div_ceil(8);
        if v.len() < needed {
            v.resize(needed, 0);
        }
        Bitfield { masks: v, num }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.masks
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.num {
            return false;
        }
        match self.masks.get(index / 8) {
            Some(element) => element & (1 << (7 - index % 8)) != 0,
            None => false,
        }
    }

    pub fn set_piece(&mut self, index: usize) {
        if index >= self.num {
            return;
        }
        if let Some(element) = self.masks.get_mut(index / 8) {
            *element |= 1 << (7 - index % 8);
        }
    }

    pub fn num_set(&self) -> usize {
        (0..self.num).filter(|&i| self.has_piece(i)).count()
    }

    pub fn num_unset(&self) -> usize {
        self.num - self.num_set()
    }

    pub fn all(&self) -> bool {
        self.num_set() == self.num
    }

    pub fn none(&self) -> bool {
        self.num_set() == 0
    }
}
