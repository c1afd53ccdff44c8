use crate::core::Transaction;

/// Hard cap on the filter bit-array, bytes.
pub const MAX_BLOOM_FILTER_SIZE: usize = 36_000;
/// Hard cap on the number of hash functions.
pub const MAX_HASH_FUNCS: u32 = 50;
/// Largest data element a `filteradd` may carry (max script push).
pub const MAX_FILTER_DATA_SIZE: usize = 520;

const LN2_SQUARED: f64 = 0.480_453_013_918_201_4;
const LN2: f64 = 0.693_147_180_559_945_3;

/// Update behavior requested by the filter owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomFlags {
    None,
    All,
    PubkeyOnly,
}

/// The per-connection filter an SPV peer uploads with `filterload`.
///
/// Match state is deliberately one-sided: false positives are expected,
/// false negatives are not allowed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: BloomFlags,
    is_full: bool,
    is_empty: bool,
}

impl BloomFilter {
    /// Build a filter sized for `elements` entries at false-positive rate
    /// `fp_rate`, clamped to the protocol limits.
    pub fn new(elements: usize, fp_rate: f64, tweak: u32, flags: BloomFlags) -> Self {
        let size = (-1.0 / LN2_SQUARED * elements as f64 * fp_rate.ln() / 8.0) as usize;
        let size = size.clamp(1, MAX_BLOOM_FILTER_SIZE);
        let hash_funcs = (size as f64 * 8.0 / elements as f64 * LN2) as u32;
        let hash_funcs = hash_funcs.clamp(1, MAX_HASH_FUNCS);
        BloomFilter {
            data: vec![0; size],
            hash_funcs,
            tweak,
            flags,
            is_full: false,
            is_empty: true,
        }
    }

    /// Reconstruct from parsed `filterload` fields. Size constraints are the
    /// caller's problem; see [`BloomFilter::is_within_size_constraints`].
    pub fn from_parts(data: Vec<u8>, hash_funcs: u32, tweak: u32, flags: BloomFlags) -> Self {
        let mut filter = BloomFilter {
            data,
            hash_funcs,
            tweak,
            flags,
            is_full: false,
            is_empty: true,
        };
        filter.update_empty_full();
        filter
    }

    /// An empty filter matching nothing, the `filterclear` state.
    pub fn empty() -> Self {
        BloomFilter::from_parts(Vec::new(), 0, 0, BloomFlags::All)
    }

    pub fn is_within_size_constraints(&self) -> bool {
        self.data.len() <= MAX_BLOOM_FILTER_SIZE && self.hash_funcs <= MAX_HASH_FUNCS
    }

    fn hash(&self, n: u32, data: &[u8]) -> usize {
        let seed = n
            .wrapping_mul(0xfba4_c795)
            .wrapping_add(self.tweak);
        murmur3_32(data, seed) as usize % (self.data.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        if self.is_full || self.data.is_empty() {
            return;
        }
        for n in 0..self.hash_funcs {
            let bit = self.hash(n, data);
            self.data[bit >> 3] |= 1 << (7 & bit);
        }
        self.is_empty = false;
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        if self.is_full {
            return true;
        }
        if self.is_empty || self.data.is_empty() {
            return false;
        }
        (0..self.hash_funcs).all(|n| {
            let bit = self.hash(n, data);
            self.data[bit >> 3] & (1 << (7 & bit)) != 0
        })
    }

    /// Recompute the all-ones/all-zeroes shortcuts after a bulk load.
    pub fn update_empty_full(&mut self) {
        self.is_full = !self.data.is_empty() && self.data.iter().all(|b| *b == 0xff);
        self.is_empty = self.data.iter().all(|b| *b == 0);
    }

    /// Whether the transaction is relevant to the filter owner: its hash, any
    /// of its outpoints, or any of its spent outpoints match.
    pub fn is_relevant(&self, tx: &Transaction) -> bool {
        if self.is_full {
            return true;
        }
        if self.is_empty {
            return false;
        }
        let hash = tx.hash();
        if self.contains(hash.as_bytes()) {
            return true;
        }
        for (index, _) in tx.outputs.iter().enumerate() {
            let mut key = hash.as_bytes().to_vec();
            key.extend_from_slice(&(index as u32).to_le_bytes());
            if self.contains(&key) {
                return true;
            }
        }
        tx.inputs.iter().any(|input| {
            let mut key = input.previous_output.txid.as_bytes().to_vec();
            key.extend_from_slice(&input.previous_output.index.to_le_bytes());
            self.contains(&key) || self.contains(&input.signature_script)
        })
    }
}

// Public-domain MurmurHash3 32-bit round, the hash family BIP37 fixes.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 = (h1 ^ k1)
            .rotate_left(13)
            .wrapping_mul(5)
            .wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, b) in tail.iter().enumerate() {
            k1 |= (*b as u32) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^ (h1 >> 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutPoint, TxInput, TxOutput};
    use ckb_fixed_hash::{h256, H256};

    #[test]
    fn murmur3_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"abc", 0), 0xb3dd_93fa);
    }

    #[test]
    fn insert_then_contains() {
        let mut filter = BloomFilter::new(8, 0.001, 0, BloomFlags::All);
        filter.insert(b"alpha");
        filter.insert(b"beta");
        assert!(filter.contains(b"alpha"));
        assert!(filter.contains(b"beta"));
        assert!(!filter.contains(b"gamma"));
    }

    #[test]
    fn tweak_changes_mapping() {
        let mut a = BloomFilter::new(8, 0.001, 0, BloomFlags::All);
        let mut b = BloomFilter::new(8, 0.001, 12345, BloomFlags::All);
        a.insert(b"alpha");
        b.insert(b"alpha");
        assert_ne!(a, b);
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = BloomFilter::empty();
        assert!(!filter.contains(b"anything"));
        assert!(filter.is_within_size_constraints());
    }

    #[test]
    fn relevant_by_spent_outpoint() {
        let mut filter = BloomFilter::new(2, 0.001, 7, BloomFlags::All);
        let mut key = h256!("0xaa").as_bytes().to_vec();
        key.extend_from_slice(&3u32.to_le_bytes());
        filter.insert(&key);

        let tx = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(h256!("0xaa"), 3),
                signature_script: vec![],
                sequence: 0,
            }],
            outputs: vec![TxOutput {
                value: 1,
                script_pubkey: vec![],
            }],
            lock_time: 0,
        };
        assert!(filter.is_relevant(&tx));
    }
}
