use ember_constant::sync::RELAY_CACHE_EXPIRY;
use ember_types::{Transaction, H256};
use std::collections::{HashMap, VecDeque};

/// Recently relayed transactions, kept so a late `getdata` can be served
/// without consulting the mempool again. Entries age out in insertion order.
#[derive(Default)]
pub struct RelayCache {
    relay: HashMap<H256, Transaction>,
    expiration: VecDeque<(u64, H256)>,
}

impl RelayCache {
    pub fn new() -> RelayCache {
        RelayCache::default()
    }

    pub fn insert(&mut self, tx: Transaction, now: u64) {
        while let Some((expires_at, _)) = self.expiration.front() {
            if *expires_at >= now {
                break;
            }
            let (_, hash) = self.expiration.pop_front().expect("front checked");
            self.relay.remove(&hash);
        }

        let hash = tx.hash();
        if self.relay.insert(hash.clone(), tx).is_none() {
            self.expiration.push_back((now + RELAY_CACHE_EXPIRY, hash));
        }
    }

    pub fn get(&self, hash: &H256) -> Option<&Transaction> {
        self.relay.get(hash)
    }

    pub fn len(&self) -> usize {
        self.relay.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relay.is_empty()
    }
}
