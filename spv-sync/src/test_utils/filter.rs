//! Block and compact filter fixtures.

use bitcoin::absolute::LockTime;
use bitcoin::bip158::{BlockFilterWriter, FilterHash, FilterHeader};
use bitcoin::block::{Block, Version};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::p2p::message_filter::CFHeaders;
use bitcoin::pow::CompactTarget;
use bitcoin::transaction::{self, Transaction, TxIn, TxOut};
use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Sequence, TxMerkleNode, Witness};

use super::chain::{fixture_time, mine, EASY_BITS};
use crate::network::FILTER_TYPE_BASIC;

/// Indexed output scripts per fixture block.
const SCRIPTS_PER_BLOCK: u8 = 3;

/// A mined block at `height` whose coinbase pays three distinct scripts and
/// carries one `OP_RETURN` marker.
pub fn test_block(prev: BlockHash, height: u32) -> Block {
    block_with_salt(prev, height, 0)
}

fn block_with_salt(prev: BlockHash, height: u32, salt: u32) -> Block {
    let mut output: Vec<TxOut> = (0..SCRIPTS_PER_BLOCK)
        .map(|index| {
            let mut data = [0u8; 20];
            data[..4].copy_from_slice(&height.to_le_bytes());
            data[4] = index;
            data[5..9].copy_from_slice(&salt.to_le_bytes());
            TxOut {
                value: Amount::from_sat(50),
                script_pubkey: ScriptBuf::builder().push_slice(data).into_script(),
            }
        })
        .collect();
    output.push(TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::builder().push_opcode(OP_RETURN).push_slice([0xaa; 4]).into_script(),
    });

    let coinbase = Transaction {
        version: transaction::Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::builder().push_int(height as i64).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output,
    };

    let mut block = Block {
        header: bitcoin::block::Header {
            version: Version::ONE,
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time: fixture_time(height) + salt,
            bits: CompactTarget::from_consensus(EASY_BITS),
            nonce: 0,
        },
        txdata: vec![coinbase],
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.merkle_root = root;
    }
    block.header = mine(block.header);
    block
}

/// `count` linked blocks extending `prev`, the first at `first_height`.
pub fn build_block_chain(prev: BlockHash, first_height: u32, count: usize) -> Vec<Block> {
    build_block_branch(prev, first_height, count, 0)
}

/// Like [`build_block_chain`], with timestamps and scripts shifted by `salt`.
pub fn build_block_branch(prev: BlockHash, first_height: u32, count: usize, salt: u32) -> Vec<Block> {
    let mut prev = prev;
    (0..count as u32)
        .map(|i| {
            let block = block_with_salt(prev, first_height + i, salt);
            prev = block.block_hash();
            block
        })
        .collect()
}

/// The honest BIP 158 basic filter of `block`.
pub fn basic_filter(block: &Block) -> Vec<u8> {
    let mut content = Vec::new();
    {
        let mut writer = BlockFilterWriter::new(&mut content, block);
        writer.add_output_scripts();
        writer.finish().expect("in-memory filter write");
    }
    content
}

/// A filter for `block` that leaves out its first indexed output script.
pub fn lying_filter(block: &Block) -> Vec<u8> {
    let scripts: Vec<&ScriptBuf> = block
        .txdata
        .iter()
        .flat_map(|tx| tx.output.iter())
        .map(|txout| &txout.script_pubkey)
        .filter(|script| !script.is_empty() && !script.is_op_return())
        .collect();

    let mut content = Vec::new();
    {
        let mut writer = BlockFilterWriter::new(&mut content, block);
        for script in scripts.iter().skip(1) {
            writer.add_element(script.as_bytes());
        }
        writer.finish().expect("in-memory filter write");
    }
    content
}

pub fn filter_hash(filter: &[u8]) -> FilterHash {
    FilterHash::hash(filter)
}

/// Honest cfheaders for heights `first_height..=last_height` of `blocks`, where
/// `blocks[0]` sits at height 1.
pub fn cfheaders_for(
    blocks: &[Block],
    first_height: u32,
    last_height: u32,
    previous_filter_header: FilterHeader,
) -> CFHeaders {
    let range = &blocks[first_height as usize - 1..last_height as usize];
    CFHeaders {
        filter_type: FILTER_TYPE_BASIC,
        stop_hash: range.last().map(Block::block_hash).unwrap_or_else(BlockHash::all_zeros),
        previous_filter_header,
        filter_hashes: range.iter().map(|block| filter_hash(&basic_filter(block))).collect(),
    }
}

/// Honest filter header at every height of `blocks`, starting from `genesis`.
/// Index 0 is `genesis`, index `h` is the header of `blocks[h - 1]`.
pub fn honest_filter_headers(genesis: FilterHeader, blocks: &[Block]) -> Vec<FilterHeader> {
    let mut headers = Vec::with_capacity(blocks.len() + 1);
    headers.push(genesis);
    for block in blocks {
        let prev = headers[headers.len() - 1];
        headers.push(filter_hash(&basic_filter(block)).filter_header(&prev));
    }
    headers
}
