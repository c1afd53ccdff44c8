use ember_constant::sync::MAX_ORPHAN_TRANSACTION_SIZE;
use ember_network::PeerIndex;
use ember_types::{Encode, Transaction, H256};
use log::{debug, trace};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};

/// A transaction we cannot validate yet because one or more parents are
/// unknown, remembered together with the peer that sent it.
#[derive(Debug, Clone)]
pub struct OrphanEntry {
    pub tx: Transaction,
    pub from_peer: PeerIndex,
}

/// In-memory orphan transactions plus an index from missing parent hash to
/// the orphans waiting on it.
pub struct OrphanTxPool {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<H256, OrphanEntry>,
    by_prev: HashMap<H256, HashSet<H256>>,
}

impl Inner {
    fn insert(&mut self, tx: Transaction, from_peer: PeerIndex) -> bool {
        let hash = tx.hash();
        if self.entries.contains_key(&hash) {
            return false;
        }
        for parent in tx.parent_hashes() {
            self.by_prev.entry(parent).or_default().insert(hash.clone());
        }
        self.entries.insert(hash, OrphanEntry { tx, from_peer });
        true
    }

    fn remove(&mut self, hash: &H256) -> Option<OrphanEntry> {
        let entry = self.entries.remove(hash)?;
        for parent in entry.tx.parent_hashes() {
            if let Some(dependents) = self.by_prev.get_mut(&parent) {
                dependents.remove(hash);
                if dependents.is_empty() {
                    self.by_prev.remove(&parent);
                }
            }
        }
        Some(entry)
    }

    fn limit_size(&mut self, max_orphans: usize) -> usize {
        let mut evicted = 0;
        let mut rng = rand::thread_rng();
        while self.entries.len() > max_orphans {
            // Evict at a random point of the key space; lower-bound from a
            // random hash, wrapping to the first entry.
            let random_hash = H256::from(rng.gen::<[u8; 32]>());
            let victim = self
                .entries
                .range(random_hash..)
                .map(|(hash, _)| hash.clone())
                .next()
                .or_else(|| self.entries.keys().next().cloned())
                .expect("len checked above");
            self.remove(&victim);
            evicted += 1;
        }
        evicted
    }
}

impl OrphanTxPool {
    pub fn new() -> OrphanTxPool {
        OrphanTxPool {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Store an orphan. Oversized transactions are refused outright: a peer
    /// with a legitimate large transaction will rebroadcast once the parents
    /// confirm.
    pub fn add_orphan_tx(&self, tx: Transaction, from_peer: PeerIndex) -> bool {
        if tx.encoded_size() > MAX_ORPHAN_TRANSACTION_SIZE {
            debug!(
                target: "mempool",
                "ignoring large orphan tx (size: {}, hash: {:#x})",
                tx.encoded_size(),
                tx.hash()
            );
            return false;
        }
        let mut guard = self.inner.write();
        let stored = guard.insert(tx, from_peer);
        if stored {
            trace!(
                target: "mempool",
                "stored orphan tx (mapsz {} prevsz {})",
                guard.entries.len(),
                guard.by_prev.len()
            );
        }
        stored
    }

    /// Enforce the size cap, evicting random entries. Returns the count
    /// evicted.
    pub fn limit_size(&self, max_orphans: usize) -> usize {
        let evicted = self.inner.write().limit_size(max_orphans);
        if evicted > 0 {
            debug!(target: "mempool", "orphan pool overflow, removed {} tx", evicted);
        }
        evicted
    }

    pub fn get(&self, hash: &H256) -> Option<OrphanEntry> {
        self.inner.read().entries.get(hash).cloned()
    }

    pub fn contains(&self, hash: &H256) -> bool {
        self.inner.read().entries.contains_key(hash)
    }

    /// Orphans waiting on `parent_hash`.
    pub fn dependents_of(&self, parent_hash: &H256) -> Vec<H256> {
        self.inner
            .read()
            .by_prev
            .get(parent_hash)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remove_orphan_tx(&self, hash: &H256) -> Option<OrphanEntry> {
        self.inner.write().remove(hash)
    }

    /// Drop every orphan that came from `peer`.
    pub fn erase_for_peer(&self, peer: PeerIndex) -> usize {
        let mut guard = self.inner.write();
        let doomed: Vec<H256> = guard
            .entries
            .iter()
            .filter(|(_, entry)| entry.from_peer == peer)
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in &doomed {
            guard.remove(hash);
        }
        if !doomed.is_empty() {
            debug!(target: "mempool", "erased {} orphan tx from peer {}", doomed.len(), peer);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Invariant probe for tests and the detach-time consistency check:
    /// every parent index entry points at a live orphan and vice versa.
    pub fn index_is_consistent(&self) -> bool {
        let guard = self.inner.read();
        let forward = guard.entries.iter().all(|(hash, entry)| {
            entry.tx.parent_hashes().iter().all(|parent| {
                guard
                    .by_prev
                    .get(parent)
                    .map(|dependents| dependents.contains(hash))
                    .unwrap_or(false)
            })
        });
        let backward = guard.by_prev.iter().all(|(_, dependents)| {
            !dependents.is_empty()
                && dependents
                    .iter()
                    .all(|hash| guard.entries.contains_key(hash))
        });
        forward && backward
    }
}

impl Default for OrphanTxPool {
    fn default() -> Self {
        OrphanTxPool::new()
    }
}
