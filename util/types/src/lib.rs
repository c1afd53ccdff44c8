//! Data model shared across the Ember node.
//!
//! Everything here is the in-memory form of objects that cross the peer
//! protocol: the connection layer hands the message handler fully parsed
//! [`NetworkMessage`] values, and the handler replies in kind. Wire framing
//! (magic, command, checksum) lives in the connection layer.

mod bloom;
mod core;
mod merkle_block;
mod message;
mod serialize;

pub use crate::bloom::{
    BloomFilter, BloomFlags, MAX_BLOOM_FILTER_SIZE, MAX_FILTER_DATA_SIZE, MAX_HASH_FUNCS,
};
pub use crate::core::{
    Block, Header, OutPoint, ServiceTransaction, Transaction, TxInput, TxOutput,
};
pub use crate::merkle_block::MerkleBlock;
pub use crate::message::{
    Inv, InvKind, NetAddress, NetworkMessage, Reject, RejectCode, ServiceFlags, VersionPayload,
};
pub use crate::serialize::{double_sha256, Encode};

pub use ckb_fixed_hash::{h256, H256};
pub use numext_fixed_uint::{u256, U256};
