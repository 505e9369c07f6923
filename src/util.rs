use sha1::{Digest, Sha1};

pub fn to_string(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn sha1_hash(bytes: &[u8]) -> [u8; 20] {
    Sha1::digest(bytes).into()
}
