use crate::serialize::{
    double_sha256, write_bytes, write_hash, write_u32, write_u64, write_var_int, Encode,
};
use ckb_fixed_hash::H256;

/// Reference to an output of a previous transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: H256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: H256, index: u32) -> Self {
        OutPoint { txid, index }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn hash(&self) -> H256 {
        double_sha256(&self.encoded())
    }

    /// Hashes of the transactions this one spends, deduplicated in order.
    pub fn parent_hashes(&self) -> Vec<H256> {
        let mut parents: Vec<H256> = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            if !parents.contains(&input.previous_output.txid) {
                parents.push(input.previous_output.txid.clone());
            }
        }
        parents
    }
}

impl Encode for Transaction {
    fn encode_to(&self, out: &mut Vec<u8>) {
        write_u32(out, self.version);
        write_var_int(out, self.inputs.len() as u64);
        for input in &self.inputs {
            write_hash(out, &input.previous_output.txid);
            write_u32(out, input.previous_output.index);
            write_bytes(out, &input.signature_script);
            write_u32(out, input.sequence);
        }
        write_var_int(out, self.outputs.len() as u64);
        for output in &self.outputs {
            write_u64(out, output.value);
            write_bytes(out, &output.script_pubkey);
        }
        write_u32(out, self.lock_time);
    }
}

/// Secondary object referencing a confirmed payment transaction, validated
/// and pooled separately from ordinary transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceTransaction {
    pub version: u32,
    pub payment_reference: H256,
    pub op_code: u16,
    pub payload: Vec<u8>,
}

impl ServiceTransaction {
    pub fn hash(&self) -> H256 {
        double_sha256(&self.encoded())
    }
}

impl Encode for ServiceTransaction {
    fn encode_to(&self, out: &mut Vec<u8>) {
        write_u32(out, self.version);
        write_hash(out, &self.payment_reference);
        out.extend_from_slice(&self.op_code.to_le_bytes());
        write_bytes(out, &self.payload);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub parent_hash: H256,
    pub merkle_root: H256,
    pub timestamp: u64,
    pub bits: u32,
    pub nonce: u64,
}

impl Header {
    pub fn hash(&self) -> H256 {
        double_sha256(&self.encoded())
    }
}

impl Encode for Header {
    fn encode_to(&self, out: &mut Vec<u8>) {
        write_u32(out, self.version);
        write_hash(out, &self.parent_hash);
        write_hash(out, &self.merkle_root);
        write_u64(out, self.timestamp);
        write_u32(out, self.bits);
        write_u64(out, self.nonce);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }
}

impl Encode for Block {
    fn encode_to(&self, out: &mut Vec<u8>) {
        self.header.encode_to(out);
        write_var_int(out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_to(out);
        }
    }

    fn encoded_size_hint(&self) -> usize {
        80 + self.transactions.len() * 256
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckb_fixed_hash::h256;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::new(h256!("0xa1"), 0),
                signature_script: vec![0x51],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOutput {
                value: 50_000,
                script_pubkey: vec![0x76, 0xa9],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn tx_hash_tracks_content() {
        let tx = sample_tx();
        let mut other = sample_tx();
        assert_eq!(tx.hash(), sample_tx().hash());
        other.lock_time = 1;
        assert_ne!(tx.hash(), other.hash());
    }

    #[test]
    fn parent_hashes_deduplicate() {
        let mut tx = sample_tx();
        tx.inputs.push(TxInput {
            previous_output: OutPoint::new(h256!("0xa1"), 1),
            signature_script: vec![],
            sequence: 0,
        });
        tx.inputs.push(TxInput {
            previous_output: OutPoint::new(h256!("0xb2"), 0),
            signature_script: vec![],
            sequence: 0,
        });
        assert_eq!(tx.parent_hashes(), vec![h256!("0xa1"), h256!("0xb2")]);
    }
}
