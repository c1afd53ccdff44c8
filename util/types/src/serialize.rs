use ckb_fixed_hash::H256;
use sha2::{Digest, Sha256};

/// Minimal little-endian encoding used to derive object ids.
///
/// This is not the wire codec; the connection layer owns framing and
/// deserialization. It only needs to be deterministic and injective so that
/// `hash(encode(x))` is a stable identifier.
pub trait Encode {
    fn encode_to(&self, out: &mut Vec<u8>);

    fn encoded(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_size_hint());
        self.encode_to(&mut out);
        out
    }

    fn encoded_size(&self) -> usize {
        self.encoded().len()
    }

    fn encoded_size_hint(&self) -> usize {
        64
    }
}

pub(crate) fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn write_var_int(out: &mut Vec<u8>, v: u64) {
    if v < 0xfd {
        out.push(v as u8);
    } else if v <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(v as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

pub(crate) fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_var_int(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

pub(crate) fn write_hash(out: &mut Vec<u8>, hash: &H256) {
    out.extend_from_slice(hash.as_bytes());
}

/// Double SHA-256, the id function for every hashed object in the protocol.
pub fn double_sha256(data: &[u8]) -> H256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(&first);
    let mut raw = [0u8; 32];
    raw.copy_from_slice(&second);
    H256::from(raw)
}
