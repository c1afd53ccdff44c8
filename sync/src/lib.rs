//! The Ember node's peer message-handling core.
//!
//! The connection layer feeds parsed messages into a [`MessageHandler`] and
//! periodically runs its send pass per peer; the validation engine calls
//! back into the handler's listener hooks. This crate owns everything in
//! between: the peer scoreboard, header-first sync, parallel block download
//! with stall detection, orphan resolution, inventory relay, and the
//! misbehavior accounting that backs bans.

mod block_fetcher;
mod block_status;
mod config;
mod dispatcher;
mod filter;
mod net_time_checker;
mod orphan_tx_pool;
mod pending_stx_pool;
mod provider;
mod relay_cache;
mod send_scheduler;
mod status;
mod types;
mod validation_listener;

#[cfg(test)]
mod tests;

pub use crate::block_status::BlockStatus;
pub use crate::config::SyncConfig;
pub use crate::dispatcher::MessageHandler;
pub use crate::provider::{ChainProvider, Rejection, TxAcceptance, TxPoolProvider};
pub use crate::status::{Status, StatusCode};
pub use crate::types::{HeaderView, SyncShared, SyncState};
