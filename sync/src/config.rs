use ember_constant::sync::{DEFAULT_BANSCORE_THRESHOLD, DEFAULT_MAX_ORPHAN_TRANSACTIONS};
use serde::Deserialize;

/// Sync section of the node configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Misbehavior score at which a peer is scheduled for disconnect.
    #[serde(default = "default_banscore")]
    pub banscore: u32,
    /// Orphan transactions kept before random eviction.
    #[serde(default = "default_max_orphan_tx")]
    pub max_orphan_tx: usize,
    /// Whitelisted peers may relay transactions even in blocks-only mode.
    #[serde(default = "default_true")]
    pub whitelist_relay: bool,
    /// Relay transactions from whitelisted peers even when already known or
    /// policy-rejected.
    #[serde(default)]
    pub whitelist_force_relay: bool,
    /// Disconnect old-version peers that send bloom messages without the
    /// bloom service instead of tolerating them.
    #[serde(default)]
    pub enforce_node_bloom: bool,
    /// Drop one in N inbound messages. Testing only; 0 disables.
    #[serde(default)]
    pub drop_messages_test: u32,
    /// Extra diagnostics, e.g. logging inbound reject messages.
    #[serde(default)]
    pub debug: bool,
}

fn default_banscore() -> u32 {
    DEFAULT_BANSCORE_THRESHOLD
}

fn default_max_orphan_tx() -> usize {
    DEFAULT_MAX_ORPHAN_TRANSACTIONS
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            banscore: default_banscore(),
            max_orphan_tx: default_max_orphan_tx(),
            whitelist_relay: true,
            whitelist_force_relay: false,
            enforce_node_bloom: false,
            drop_messages_test: 0,
            debug: false,
        }
    }
}
