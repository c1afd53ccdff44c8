use bitflags::bitflags;

bitflags! {
    /// How far a block has progressed through validation. Flags accumulate:
    /// a stored block implies its header connected, a script-valid block
    /// implies it is stored.
    pub struct BlockStatus: u32 {
        const UNKNOWN        = 0;

        /// Header connects to the index with valid proof-of-work.
        const HEADER_VALID   = 0b0000_0001;
        /// Full block arrived and awaits or is under validation.
        const BLOCK_RECEIVED = Self::HEADER_VALID.bits | 0b0000_0010;
        /// Block data is on disk.
        const BLOCK_STORED   = Self::BLOCK_RECEIVED.bits | 0b0000_1000;
        /// Scripts validated; the block can be served without fingerprinting
        /// concerns.
        const BLOCK_VALID    = Self::BLOCK_STORED.bits | 0b0001_0000;

        const BLOCK_INVALID  = 0b0010_0000_0000_0000;
    }
}

#[cfg(test)]
mod tests {
    use super::BlockStatus;

    #[test]
    fn statuses_accumulate() {
        assert!(BlockStatus::BLOCK_VALID.contains(BlockStatus::BLOCK_STORED));
        assert!(BlockStatus::BLOCK_STORED.contains(BlockStatus::BLOCK_RECEIVED));
        assert!(BlockStatus::BLOCK_RECEIVED.contains(BlockStatus::HEADER_VALID));
        assert!(!BlockStatus::HEADER_VALID.contains(BlockStatus::BLOCK_STORED));
    }

    #[test]
    fn invalid_is_disjoint() {
        assert!(!BlockStatus::BLOCK_INVALID.contains(BlockStatus::HEADER_VALID));
        assert!(!BlockStatus::BLOCK_VALID.contains(BlockStatus::BLOCK_INVALID));
        assert!(BlockStatus::UNKNOWN.is_empty());
    }
}
