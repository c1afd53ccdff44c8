use crate::block_status::BlockStatus;
use crate::types::HeaderView;
use ember_network::PeerIndex;
use ember_types::{Block, Header, RejectCode, ServiceTransaction, Transaction, H256};

/// Validation verdict attached to a rejected object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    /// Misbehavior to charge the originating peer; 0 means "don't punish".
    pub dos: u32,
    pub code: RejectCode,
    pub reason: String,
    /// The object may have been damaged in transit rather than crafted;
    /// when set, its hash must not enter the recent-reject filter.
    pub corruption_possible: bool,
}

impl Rejection {
    pub fn new(dos: u32, code: RejectCode, reason: &str) -> Self {
        Rejection {
            dos,
            code,
            reason: reason.to_string(),
            corruption_possible: false,
        }
    }
}

/// Result of offering a transaction to the mempool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxAcceptance {
    Accepted,
    /// One or more spent outputs are unknown; the transaction may be an
    /// orphan worth keeping.
    MissingInputs,
    Rejected(Rejection),
}

/// Read-only view of the chain plus header/block admission, implemented by
/// the validation engine. Calls may read the store but never re-enter the
/// message handler.
pub trait ChainProvider: Send + Sync + 'static {
    /// Tip of the active (fully validated) chain.
    fn tip_header(&self) -> HeaderView;

    /// Tip of the best known header chain; equals `tip_header` outside sync.
    fn best_header(&self) -> HeaderView;

    fn get_block_hash(&self, height: u64) -> Option<H256>;

    fn get_header_view(&self, hash: &H256) -> Option<HeaderView>;

    /// Read a block we claim to have. Disk-backed; must not be called under
    /// locks the caller cannot afford to hold.
    fn get_block(&self, hash: &H256) -> Option<Block>;

    fn get_block_status(&self, hash: &H256) -> BlockStatus;

    fn is_main_chain(&self, hash: &H256) -> bool;

    fn is_initial_block_download(&self) -> bool;

    fn median_time_past(&self) -> u64;

    /// Target block interval, seconds.
    fn target_spacing(&self) -> u64;

    fn genesis_hash(&self) -> H256;

    /// Best-effort probe whether any output of `txid` is unspent.
    fn utxo_exists(&self, txid: &H256) -> bool;

    /// Look up a confirmed transaction.
    fn get_transaction(&self, txid: &H256) -> Option<Transaction>;

    /// Validate and index a header. On success the header is queryable
    /// through `get_header_view`.
    fn accept_block_header(&self, header: &Header) -> Result<HeaderView, Rejection>;

    /// Hand a full block to validation. `force` bypasses the
    /// not-requested/IBD gating inside the engine; rejection surfaces both
    /// here and through the `block_checked` listener.
    fn process_new_block(
        &self,
        block: Block,
        peer: PeerIndex,
        force: bool,
    ) -> Result<(), Rejection>;
}

/// Mempool and service-transaction pool, implemented by the tx-pool service.
pub trait TxPoolProvider: Send + Sync + 'static {
    fn accept_to_mempool(&self, tx: Transaction) -> TxAcceptance;

    fn mempool_contains(&self, hash: &H256) -> bool;

    fn mempool_hashes(&self) -> Vec<H256>;

    fn mempool_get(&self, hash: &H256) -> Option<Transaction>;

    /// Validate a service transaction against its confirmed payment.
    fn check_service_tx(
        &self,
        stx: &ServiceTransaction,
        payment: &Transaction,
    ) -> Result<(), Rejection>;

    /// Apply a validated service transaction.
    fn process_service_tx(&self, stx: &ServiceTransaction, payment: &Transaction);

    fn stx_pool_contains(&self, hash: &H256) -> bool;

    fn stx_pool_get(&self, hash: &H256) -> Option<ServiceTransaction>;

    fn stx_pool_add(&self, stx: ServiceTransaction);

    /// Wallet rebroadcast hook, run from the send scheduler outside IBD.
    fn rebroadcast_wallet_transactions(&self);
}
