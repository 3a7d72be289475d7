//! Bounded in-memory window of the most recently processed headers.
//!
//! Nodes live in a fixed-capacity ring. Each pushed node gets a [`NodeHandle`]
//! made of its slot and a monotonically increasing sequence number; once the
//! node is evicted the handle no longer resolves and callers fall back to the
//! durable store by height.

use std::collections::VecDeque;

use crate::types::HeaderNode;

/// Default number of headers retained in memory.
pub const DEFAULT_HEADER_CHAIN_CAPACITY: usize = 10_000;

/// Generation-tagged reference to a node pushed into a [`HeaderChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHandle {
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct HeaderChain {
    nodes: VecDeque<HeaderNode>,
    /// Sequence number of `nodes[0]`.
    first_seq: u64,
    capacity: usize,
}

impl Default for HeaderChain {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_CHAIN_CAPACITY)
    }
}

impl HeaderChain {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            nodes: VecDeque::with_capacity(capacity.min(DEFAULT_HEADER_CHAIN_CAPACITY)),
            first_seq: 0,
            capacity,
        }
    }

    /// Discard every node and seed the chain with `node`.
    pub fn reset(&mut self, node: HeaderNode) -> NodeHandle {
        // Handles issued before the reset must stop resolving.
        self.first_seq += self.nodes.len() as u64;
        self.nodes.clear();
        self.push_back(node)
    }

    /// Drop every node.
    pub fn clear(&mut self) {
        self.first_seq += self.nodes.len() as u64;
        self.nodes.clear();
    }

    /// Append `node`, evicting the oldest one when full.
    pub fn push_back(&mut self, node: HeaderNode) -> NodeHandle {
        if self.nodes.len() == self.capacity {
            self.nodes.pop_front();
            self.first_seq += 1;
        }
        self.nodes.push_back(node);
        NodeHandle {
            seq: self.first_seq + self.nodes.len() as u64 - 1,
        }
    }

    pub fn back(&self) -> Option<&HeaderNode> {
        self.nodes.back()
    }

    pub fn back_handle(&self) -> Option<NodeHandle> {
        (!self.nodes.is_empty()).then(|| NodeHandle {
            seq: self.first_seq + self.nodes.len() as u64 - 1,
        })
    }

    pub fn front(&self) -> Option<&HeaderNode> {
        self.nodes.front()
    }

    /// Resolve a handle, or `None` once its node has been evicted or reset away.
    pub fn get(&self, handle: NodeHandle) -> Option<&HeaderNode> {
        let index = handle.seq.checked_sub(self.first_seq)?;
        self.nodes.get(usize::try_from(index).ok()?)
    }

    /// The predecessor of `handle` within the window.
    pub fn prev(&self, handle: NodeHandle) -> Option<NodeHandle> {
        let seq = handle.seq.checked_sub(1)?;
        let prev = NodeHandle {
            seq,
        };
        self.get(prev).map(|_| prev)
    }

    /// Node at `height`, if it is still inside the window.
    pub fn get_by_height(&self, height: u32) -> Option<&HeaderNode> {
        let front = self.nodes.front()?;
        let offset = height.checked_sub(front.height)? as usize;
        self.nodes.get(offset).filter(|node| node.height == height)
    }

    /// Iterate from the most recent node backwards.
    pub fn iter_back(&self) -> impl Iterator<Item = &HeaderNode> {
        self.nodes.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
