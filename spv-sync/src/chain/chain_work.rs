//! Cumulative proof-of-work, the basis for choosing between competing branches.

use std::fmt;
use std::ops::Add;

use bitcoin::block::Header as BlockHeader;
use bitcoin::pow::{Target, Work};

/// Accumulated work over a run of headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChainWork(Work);

impl ChainWork {
    pub fn zero() -> Self {
        Self(Work::from_be_bytes([0u8; 32]))
    }

    /// Work contributed by a single header, derived from its declared bits.
    pub fn from_header(header: &BlockHeader) -> Self {
        Self::from_target(header.target())
    }

    pub fn from_target(target: Target) -> Self {
        Self(target.to_work())
    }

    /// Sum the work of every header in `headers`.
    pub fn sum<'a>(headers: impl IntoIterator<Item = &'a BlockHeader>) -> Self {
        headers.into_iter().fold(Self::zero(), |acc, header| acc.add_header(header))
    }

    pub fn add_header(self, header: &BlockHeader) -> Self {
        self + Self::from_header(header)
    }

    pub fn to_be_bytes(self) -> [u8; 32] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(Work::from_be_bytes(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.to_be_bytes().iter().all(|&b| b == 0)
    }

    /// log2 of the work, for display only.
    pub fn log2(self) -> f64 {
        self.0.log2()
    }
}

impl Default for ChainWork {
    fn default() -> Self {
        Self::zero()
    }
}

impl Add for ChainWork {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0 + other.0)
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_be_bytes()))
    }
}
