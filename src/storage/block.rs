use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a block by the file it lives in and its position within that
/// file. The block number is zero-based; the block's byte offset is
/// `number * block_size`. A `BlockId` is never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    filename: String,
    number: u64,
}

impl BlockId {
    pub fn new(filename: impl Into<String>, number: u64) -> Self {
        Self {
            filename: filename.into(),
            number,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn number(&self) -> u64 {
        self.number
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[file {}, block {}]", self.filename, self.number)
    }
}
