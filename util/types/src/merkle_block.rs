use crate::bloom::BloomFilter;
use crate::core::{Block, Header};
use ckb_fixed_hash::H256;

/// Reply to a `getdata` for a filtered block: the header, the block's
/// transaction ids, and a bitmap marking the ones that matched the peer's
/// bloom filter.
///
/// The matched transactions themselves are pushed as individual `tx`
/// messages right after this one, so the bitmap is all an SPV peer needs to
/// place them in the block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleBlock {
    pub header: Header,
    pub tx_hashes: Vec<H256>,
    pub match_flags: Vec<u8>,
}

impl MerkleBlock {
    /// Run the block's transactions through `filter`, recording matches.
    pub fn from_block(block: &Block, filter: &BloomFilter) -> Self {
        let tx_hashes: Vec<H256> = block.transactions.iter().map(|tx| tx.hash()).collect();
        let mut match_flags = vec![0u8; (block.transactions.len() + 7) / 8];
        for (index, tx) in block.transactions.iter().enumerate() {
            if filter.is_relevant(tx) {
                match_flags[index >> 3] |= 1 << (index & 7);
            }
        }
        MerkleBlock {
            header: block.header.clone(),
            tx_hashes,
            match_flags,
        }
    }

    /// Indices of transactions the filter matched, in block order.
    pub fn matched_indices(&self) -> Vec<usize> {
        (0..self.tx_hashes.len())
            .filter(|index| self.match_flags[index >> 3] & (1 << (index & 7)) != 0)
            .collect()
    }
}
