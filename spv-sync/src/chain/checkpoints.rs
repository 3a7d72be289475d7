//! Block-header checkpoints: trusted (height, hash) anchors that bound reorg depth.

use bitcoin::BlockHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: BlockHash,
}

impl Checkpoint {
    pub fn new(height: u32, hash: BlockHash) -> Self {
        Self {
            height,
            hash,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    // checkpoints sorted by height, lowest first
    checkpoints: Vec<Checkpoint>,
    genesis: Checkpoint,
}

impl CheckpointManager {
    pub fn new(mut checkpoints: Vec<Checkpoint>, genesis_hash: BlockHash) -> Self {
        checkpoints.sort_by_key(|cp| cp.height);
        checkpoints.dedup_by_key(|cp| cp.height);

        Self {
            checkpoints,
            genesis: Checkpoint::new(0, genesis_hash),
        }
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn last(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    pub fn get(&self, height: u32) -> Option<&Checkpoint> {
        self.checkpoints
            .binary_search_by_key(&height, |cp| cp.height)
            .ok()
            .map(|index| &self.checkpoints[index])
    }

    /// First checkpoint strictly above `height`, if any.
    pub fn next_after(&self, height: u32) -> Option<&Checkpoint> {
        let index = self.checkpoints.partition_point(|cp| cp.height <= height);
        self.checkpoints.get(index)
    }

    /// Last checkpoint strictly below `height`, or the genesis block when there is none.
    pub fn previous_before(&self, height: u32) -> &Checkpoint {
        let index = self.checkpoints.partition_point(|cp| cp.height < height);
        match index {
            0 => &self.genesis,
            i => &self.checkpoints[i - 1],
        }
    }

    /// Whether `height` is past every configured checkpoint.
    pub fn is_past_all(&self, height: u32) -> bool {
        self.last().map_or(true, |cp| height > cp.height)
    }
}
