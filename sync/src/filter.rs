use bloom_filters::{BloomFilter, DefaultBuildHashKernels, StableBloomFilter};
use ember_constant::sync::{RECENT_REJECTS_FILTER_RATE, RECENT_REJECTS_FILTER_SIZE};
use ember_types::H256;
use std::collections::hash_map::RandomState;
use std::hash::Hash;

pub(crate) const DEFAULT_KNOWN_BUCKETS: usize = 5_000;
pub(crate) const INV_KNOWN_BUCKETS: usize = 50_000;

/// Per-peer rolling set of things the peer is known to have seen.
///
/// Stable bloom semantics: old entries decay as new ones arrive, false
/// positives only ever suppress a redundant announcement.
pub struct KnownFilter {
    filters: StableBloomFilter<DefaultBuildHashKernels<RandomState>>,
}

impl KnownFilter {
    pub fn new(buckets_num: usize) -> KnownFilter {
        KnownFilter {
            filters: StableBloomFilter::new(
                buckets_num,
                3,
                0.03,
                DefaultBuildHashKernels::new(rand::random(), RandomState::default()),
            ),
        }
    }

    pub fn insert<T: Hash>(&mut self, key: &T) {
        self.filters.insert(key)
    }

    pub fn contains<T: Hash>(&self, key: &T) -> bool {
        self.filters.contains(key)
    }
}

impl Default for KnownFilter {
    fn default() -> KnownFilter {
        KnownFilter::new(DEFAULT_KNOWN_BUCKETS)
    }
}

/// Process-wide filter of transaction hashes rejected since the last tip
/// change. A tip change may turn rejects valid (lock-times, double spends),
/// so the filter restarts whenever the tip it was built against moves.
pub struct RecentRejects {
    filter: StableBloomFilter<DefaultBuildHashKernels<RandomState>>,
    chain_tip: H256,
}

impl RecentRejects {
    pub fn new() -> RecentRejects {
        RecentRejects {
            filter: Self::build(),
            chain_tip: H256::default(),
        }
    }

    fn build() -> StableBloomFilter<DefaultBuildHashKernels<RandomState>> {
        StableBloomFilter::new(
            RECENT_REJECTS_FILTER_SIZE,
            3,
            RECENT_REJECTS_FILTER_RATE,
            DefaultBuildHashKernels::new(rand::random(), RandomState::default()),
        )
    }

    /// Restart the filter if the tip moved since it was built.
    pub fn reset_if_tip_changed(&mut self, tip_hash: &H256) {
        if &self.chain_tip != tip_hash {
            self.chain_tip = tip_hash.clone();
            self.filter = Self::build();
        }
    }

    pub fn insert(&mut self, hash: &H256) {
        self.filter.insert(hash)
    }

    pub fn contains(&self, hash: &H256) -> bool {
        self.filter.contains(hash)
    }
}

impl Default for RecentRejects {
    fn default() -> RecentRejects {
        RecentRejects::new()
    }
}
