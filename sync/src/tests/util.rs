use crate::block_status::BlockStatus;
use crate::config::SyncConfig;
use crate::dispatcher::MessageHandler;
use crate::provider::{ChainProvider, Rejection, TxAcceptance, TxPoolProvider};
use crate::types::{HeaderView, SyncShared};
use ember_network::{NetworkContext, PeerIndex, PeerInfo, SendError};
use ember_types::{
    Block, Header, NetAddress, NetworkMessage, ServiceFlags, ServiceTransaction, Transaction,
    TxInput, TxOutput, H256, U256,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn header(parent: &H256, height: u64, nonce: u64) -> Header {
    Header {
        version: 1,
        parent_hash: parent.clone(),
        merkle_root: H256::default(),
        timestamp: 1_600_000_000 + height,
        bits: 0x1d00_ffff,
        nonce,
    }
}

pub(crate) fn transaction(parent: &H256, index: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: ember_types::OutPoint::new(parent.clone(), index),
            signature_script: vec![0x51],
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOutput {
            value: 50_000,
            script_pubkey: vec![0x76],
        }],
        lock_time: 0,
    }
}

#[derive(Default)]
struct ChainInner {
    headers: HashMap<H256, HeaderView>,
    main_chain: Vec<H256>,
    statuses: HashMap<H256, BlockStatus>,
    blocks: HashMap<H256, Block>,
    best_header: Option<H256>,
    mempool: HashMap<H256, Transaction>,
    stx_pool: HashMap<H256, ServiceTransaction>,
    confirmed: HashMap<H256, Transaction>,
    utxos: HashSet<H256>,
    tx_verdicts: HashMap<H256, TxAcceptance>,
    header_verdicts: HashMap<H256, Rejection>,
    stx_verdicts: HashMap<H256, Rejection>,
    processed_blocks: Vec<(H256, PeerIndex, bool)>,
    ibd: bool,
    tip_time_override: Option<u64>,
}

/// In-memory stand-in for the validation engine and both pools, scriptable
/// per hash.
pub(crate) struct MockChain {
    inner: Mutex<ChainInner>,
    genesis: H256,
    target_spacing: u64,
}

impl MockChain {
    pub fn new() -> MockChain {
        let genesis_header = header(&H256::default(), 0, u64::MAX);
        let genesis_hash = genesis_header.hash();
        let mut inner = ChainInner::default();
        let view = HeaderView::new(genesis_header, 0, U256::zero());
        inner.headers.insert(genesis_hash.clone(), view);
        inner.main_chain.push(genesis_hash.clone());
        inner
            .statuses
            .insert(genesis_hash.clone(), BlockStatus::BLOCK_VALID);
        MockChain {
            inner: Mutex::new(inner),
            genesis: genesis_hash,
            target_spacing: 150,
        }
    }

    pub fn genesis(&self) -> H256 {
        self.genesis.clone()
    }

    /// Extend the active chain by `count` stored, fully valid blocks.
    pub fn grow_main_chain(&self, count: u64) -> Vec<H256> {
        let mut added = Vec::new();
        for _ in 0..count {
            let mut inner = self.inner.lock();
            let parent_hash = inner.main_chain.last().expect("genesis present").clone();
            let parent = inner.headers[&parent_hash].clone();
            let height = parent.height() + 1;
            let head = header(&parent_hash, height, height);
            let hash = head.hash();
            let work = parent.total_work() + &U256::one();
            inner
                .headers
                .insert(hash.clone(), HeaderView::new(head.clone(), height, work));
            inner.main_chain.push(hash.clone());
            inner.statuses.insert(hash.clone(), BlockStatus::BLOCK_VALID);
            inner.blocks.insert(
                hash.clone(),
                Block {
                    header: head,
                    transactions: vec![transaction(&hash, 0)],
                },
            );
            added.push(hash);
        }
        added
    }

    /// Index a side-chain of headers on top of `base` without block data,
    /// as `accept_block_header` would. Returns the header views, lowest
    /// first.
    pub fn index_headers(&self, base: &H256, count: u64) -> Vec<HeaderView> {
        let mut inner = self.inner.lock();
        let mut parent = inner.headers[base].clone();
        let mut views = Vec::new();
        for offset in 0..count {
            let height = parent.height() + 1;
            let head = header(parent.hash(), height, 1_000_000 + height * 7 + offset);
            let work = parent.total_work() + &U256::one();
            let view = HeaderView::new(head, height, work);
            inner
                .headers
                .insert(view.hash().clone(), view.clone());
            inner
                .statuses
                .insert(view.hash().clone(), BlockStatus::HEADER_VALID);
            parent = view.clone();
            views.push(view);
        }
        views
    }

    /// Mark an indexed block as rejected by validation.
    pub fn invalidate_block(&self, hash: &H256) {
        self.inner
            .lock()
            .statuses
            .insert(hash.clone(), BlockStatus::BLOCK_INVALID);
    }

    /// Mark an indexed header's block as present on disk.
    pub fn store_block(&self, hash: &H256) {
        let mut inner = self.inner.lock();
        let head = inner.headers[hash].inner().clone();
        inner
            .statuses
            .insert(hash.clone(), BlockStatus::BLOCK_STORED);
        inner.blocks.insert(
            hash.clone(),
            Block {
                header: head,
                transactions: Vec::new(),
            },
        );
    }

    pub fn set_ibd(&self, ibd: bool) {
        self.inner.lock().ibd = ibd;
    }

    pub fn set_tip_time(&self, time: u64) {
        self.inner.lock().tip_time_override = Some(time);
    }

    pub fn set_best_header(&self, hash: &H256) {
        self.inner.lock().best_header = Some(hash.clone());
    }

    pub fn script_tx_verdict(&self, hash: &H256, verdict: TxAcceptance) {
        self.inner.lock().tx_verdicts.insert(hash.clone(), verdict);
    }

    pub fn script_stx_verdict(&self, hash: &H256, rejection: Rejection) {
        self.inner.lock().stx_verdicts.insert(hash.clone(), rejection);
    }

    pub fn add_confirmed_tx(&self, tx: Transaction) {
        self.inner.lock().confirmed.insert(tx.hash(), tx);
    }

    pub fn processed_blocks(&self) -> Vec<(H256, PeerIndex, bool)> {
        self.inner.lock().processed_blocks.clone()
    }

    pub fn mempool_len(&self) -> usize {
        self.inner.lock().mempool.len()
    }
}

impl ChainProvider for MockChain {
    fn tip_header(&self) -> HeaderView {
        let inner = self.inner.lock();
        let hash = inner.main_chain.last().expect("genesis present");
        let view = inner.headers[hash].clone();
        match inner.tip_time_override {
            Some(time) => {
                let mut head = view.inner().clone();
                head.timestamp = time;
                // Preserve identity fields; only the clock matters here.
                HeaderView::new(head, view.height(), view.total_work().clone())
            }
            None => view,
        }
    }

    fn best_header(&self) -> HeaderView {
        let best = self.inner.lock().best_header.clone();
        match best {
            Some(hash) => self.inner.lock().headers[&hash].clone(),
            None => self.tip_header(),
        }
    }

    fn get_block_hash(&self, height: u64) -> Option<H256> {
        self.inner.lock().main_chain.get(height as usize).cloned()
    }

    fn get_header_view(&self, hash: &H256) -> Option<HeaderView> {
        self.inner.lock().headers.get(hash).cloned()
    }

    fn get_block(&self, hash: &H256) -> Option<Block> {
        self.inner.lock().blocks.get(hash).cloned()
    }

    fn get_block_status(&self, hash: &H256) -> BlockStatus {
        self.inner
            .lock()
            .statuses
            .get(hash)
            .copied()
            .unwrap_or(BlockStatus::UNKNOWN)
    }

    fn is_main_chain(&self, hash: &H256) -> bool {
        let inner = self.inner.lock();
        inner
            .headers
            .get(hash)
            .map(|view| inner.main_chain.get(view.height() as usize) == Some(hash))
            .unwrap_or(false)
    }

    fn is_initial_block_download(&self) -> bool {
        self.inner.lock().ibd
    }

    fn median_time_past(&self) -> u64 {
        self.tip_header().timestamp()
    }

    fn target_spacing(&self) -> u64 {
        self.target_spacing
    }

    fn genesis_hash(&self) -> H256 {
        self.genesis.clone()
    }

    fn utxo_exists(&self, txid: &H256) -> bool {
        self.inner.lock().utxos.contains(txid)
    }

    fn get_transaction(&self, txid: &H256) -> Option<Transaction> {
        self.inner.lock().confirmed.get(txid).cloned()
    }

    fn accept_block_header(&self, header: &Header) -> Result<HeaderView, Rejection> {
        let mut inner = self.inner.lock();
        let hash = header.hash();
        if let Some(rejection) = inner.header_verdicts.get(&hash) {
            return Err(rejection.clone());
        }
        if let Some(existing) = inner.headers.get(&hash) {
            return Ok(existing.clone());
        }
        let parent = inner
            .headers
            .get(&header.parent_hash)
            .cloned()
            .ok_or_else(|| Rejection::new(10, ember_types::RejectCode::Invalid, "prev-blk-not-found"))?;
        let view = HeaderView::new(
            header.clone(),
            parent.height() + 1,
            parent.total_work() + &U256::one(),
        );
        inner.headers.insert(hash.clone(), view.clone());
        inner.statuses.insert(hash, BlockStatus::HEADER_VALID);
        Ok(view)
    }

    fn process_new_block(
        &self,
        block: Block,
        peer: PeerIndex,
        force: bool,
    ) -> Result<(), Rejection> {
        let mut inner = self.inner.lock();
        let hash = block.hash();
        inner.processed_blocks.push((hash.clone(), peer, force));
        inner.blocks.insert(hash.clone(), block);
        let status = inner
            .statuses
            .get(&hash)
            .copied()
            .unwrap_or(BlockStatus::UNKNOWN);
        inner
            .statuses
            .insert(hash, status | BlockStatus::BLOCK_RECEIVED);
        Ok(())
    }
}

impl TxPoolProvider for MockChain {
    fn accept_to_mempool(&self, tx: Transaction) -> TxAcceptance {
        let mut inner = self.inner.lock();
        let hash = tx.hash();
        match inner.tx_verdicts.get(&hash).cloned() {
            Some(TxAcceptance::Accepted) | None => {
                inner.mempool.insert(hash, tx);
                TxAcceptance::Accepted
            }
            Some(other) => other,
        }
    }

    fn mempool_contains(&self, hash: &H256) -> bool {
        self.inner.lock().mempool.contains_key(hash)
    }

    fn mempool_hashes(&self) -> Vec<H256> {
        self.inner.lock().mempool.keys().cloned().collect()
    }

    fn mempool_get(&self, hash: &H256) -> Option<Transaction> {
        self.inner.lock().mempool.get(hash).cloned()
    }

    fn check_service_tx(
        &self,
        stx: &ServiceTransaction,
        _payment: &Transaction,
    ) -> Result<(), Rejection> {
        match self.inner.lock().stx_verdicts.get(&stx.hash()) {
            Some(rejection) => Err(rejection.clone()),
            None => Ok(()),
        }
    }

    fn process_service_tx(&self, _stx: &ServiceTransaction, _payment: &Transaction) {}

    fn stx_pool_contains(&self, hash: &H256) -> bool {
        self.inner.lock().stx_pool.contains_key(hash)
    }

    fn stx_pool_get(&self, hash: &H256) -> Option<ServiceTransaction> {
        self.inner.lock().stx_pool.get(hash).cloned()
    }

    fn stx_pool_add(&self, stx: ServiceTransaction) {
        self.inner.lock().stx_pool.insert(stx.hash(), stx);
    }

    fn rebroadcast_wallet_transactions(&self) {}
}

#[derive(Default)]
pub(crate) struct MockNetwork {
    pub sent: Mutex<Vec<(PeerIndex, NetworkMessage)>>,
    pub disconnected: Mutex<Vec<(PeerIndex, String)>>,
    pub banned: Mutex<Vec<PeerIndex>>,
    pub peers: Mutex<HashMap<PeerIndex, PeerInfo>>,
    pub address_book: Mutex<Vec<NetAddress>>,
    pub local_nonces: Mutex<HashSet<u64>>,
    pub outbound_target_hit: Mutex<bool>,
}

impl MockNetwork {
    pub fn new() -> MockNetwork {
        MockNetwork::default()
    }

    pub fn add_peer(&self, peer: PeerIndex, is_inbound: bool, is_whitelist: bool) {
        let address = NetAddress::new(
            format!("8.8.{}.{}:31469", peer.value() / 256, peer.value() % 256)
                .parse()
                .unwrap(),
            ServiceFlags::NETWORK,
            0,
        );
        self.peers.lock().insert(
            peer,
            PeerInfo {
                name: address.addr.to_string(),
                address,
                is_inbound,
                is_whitelist,
                is_oneshot: false,
                is_feeler: false,
                is_addnode: false,
                is_local: false,
                expected_services: ServiceFlags::NONE,
            },
        );
    }

    pub fn take_sent(&self) -> Vec<(PeerIndex, NetworkMessage)> {
        std::mem::take(&mut self.sent.lock())
    }

    pub fn sent_commands(&self) -> Vec<&'static str> {
        self.sent
            .lock()
            .iter()
            .map(|(_, message)| message.command())
            .collect()
    }

    pub fn was_disconnected(&self, peer: PeerIndex) -> bool {
        self.disconnected.lock().iter().any(|(p, _)| *p == peer)
    }
}

impl NetworkContext for MockNetwork {
    fn send_message(&self, peer: PeerIndex, message: NetworkMessage) -> Result<(), SendError> {
        self.sent.lock().push((peer, message));
        Ok(())
    }

    fn disconnect(&self, peer: PeerIndex, reason: &str) {
        self.disconnected.lock().push((peer, reason.to_string()));
    }

    fn ban_peer(&self, peer: PeerIndex, _duration: Duration, reason: &str) {
        self.banned.lock().push(peer);
        self.disconnected.lock().push((peer, reason.to_string()));
    }

    fn connected_peers(&self) -> Vec<PeerIndex> {
        self.peers.lock().keys().copied().collect()
    }

    fn peer_info(&self, peer: PeerIndex) -> Option<PeerInfo> {
        self.peers.lock().get(&peer).cloned()
    }

    fn check_incoming_nonce(&self, nonce: u64) -> bool {
        self.local_nonces.lock().contains(&nonce)
    }

    fn local_nonce(&self, peer: PeerIndex) -> u64 {
        0x1000 + peer.value() as u64
    }

    fn local_services(&self) -> ServiceFlags {
        ServiceFlags::NETWORK | ServiceFlags::BLOOM
    }

    fn local_start_height(&self) -> i64 {
        0
    }

    fn local_address(&self, _peer: PeerIndex) -> Option<NetAddress> {
        Some(NetAddress::new(
            "203.0.113.7:31469".parse().unwrap(),
            self.local_services(),
            0,
        ))
    }

    fn set_best_height(&self, _height: u64) {}

    fn address_count(&self) -> usize {
        self.address_book.lock().len()
    }

    fn add_addresses(&self, addresses: Vec<NetAddress>, _source: &NetAddress) {
        self.address_book.lock().extend(addresses);
    }

    fn mark_address_good(&self, _address: &NetAddress) {}

    fn addresses_snapshot(&self) -> Vec<NetAddress> {
        self.address_book.lock().clone()
    }

    fn is_reachable(&self, _address: &NetAddress) -> bool {
        true
    }

    fn outbound_target_reached(&self, _historical: bool) -> bool {
        *self.outbound_target_hit.lock()
    }

    fn send_paused(&self, _peer: PeerIndex) -> bool {
        false
    }
}

/// Handler over a mock chain plus a network with `peer_count` attached
/// outbound peers that completed the handshake.
pub(crate) fn setup(
    peer_count: usize,
) -> (MessageHandler<MockChain>, Arc<MockChain>, MockNetwork) {
    let chain = Arc::new(MockChain::new());
    let shared = Arc::new(SyncShared::new(Arc::clone(&chain), SyncConfig::default()));
    let handler = MessageHandler::new(shared);
    let nc = MockNetwork::new();
    for index in 0..peer_count {
        let peer = PeerIndex::from(index);
        nc.add_peer(peer, false, false);
        handler.initialize_node(&nc, peer);
        complete_handshake(&handler, &nc, peer);
    }
    nc.take_sent();
    (handler, chain, nc)
}

/// Drive the version/verack exchange as the remote side.
pub(crate) fn complete_handshake(
    handler: &MessageHandler<MockChain>,
    nc: &MockNetwork,
    peer: PeerIndex,
) {
    let remote = NetAddress::new(
        "198.51.100.1:31469".parse().unwrap(),
        ServiceFlags::NETWORK,
        0,
    );
    let payload = ember_types::VersionPayload {
        version: ember_constant::sync::PROTOCOL_VERSION,
        services: ServiceFlags::NETWORK | ServiceFlags::BLOOM,
        timestamp: 1_600_000_000,
        receiver: remote.clone(),
        sender: remote,
        nonce: 0xdead_beef,
        user_agent: "/ember:0.4.0/".to_string(),
        start_height: 0,
        relay: true,
    };
    handler.process_messages(nc, peer, NetworkMessage::Version(payload));
    handler.process_messages(nc, peer, NetworkMessage::Verack);
}
