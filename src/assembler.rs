//! Reassemble blocks from out-of-order chunks.

use bytes::{Bytes, BytesMut};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use thiserror::Error;

/// Chunk-level inconsistencies. Any of these means the source sent data a
/// correct replica never would; the engine demotes it.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BadData {
    #[error("chunk {chunk} outside 1..={total}")]
    ChunkOutOfRange { chunk: u16, total: u16 },
    #[error("duplicate chunk {chunk} of block {block}")]
    DuplicateChunk { block: u64, chunk: u16 },
    #[error("total chunks changed from {known} to {claimed}")]
    TotalMismatch { known: u16, claimed: u16 },
}

struct BlockChunks {
    total: u16,
    received: BTreeMap<u16, Bytes>,
    bytes: usize,
}

/// Holds chunks received from the current source until whole blocks can
/// be verified, ordered by (block descending, chunk ascending) to match
/// the downward hash-chain walk.
///
/// Byte accounting (`pending_bytes`) backs the per-source cap: the engine
/// rejects a source that streams faster than blocks are committed.
pub struct Assembler {
    blocks: BTreeMap<Reverse<u64>, BlockChunks>,
    pending_bytes: usize,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            pending_bytes: 0,
        }
    }

    /// Total bytes held across all pending chunks.
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Insert one chunk of `block`.
    pub fn insert(
        &mut self,
        block: u64,
        total: u16,
        chunk: u16,
        data: Bytes,
    ) -> Result<(), BadData> {
        if chunk == 0 || total == 0 || chunk > total {
            return Err(BadData::ChunkOutOfRange { chunk, total });
        }
        let entry = self.blocks.entry(Reverse(block)).or_insert(BlockChunks {
            total,
            received: BTreeMap::new(),
            bytes: 0,
        });
        if entry.total != total {
            return Err(BadData::TotalMismatch {
                known: entry.total,
                claimed: total,
            });
        }
        if entry.received.contains_key(&chunk) {
            return Err(BadData::DuplicateChunk { block, chunk });
        }
        entry.bytes += data.len();
        self.pending_bytes += data.len();
        entry.received.insert(chunk, data);
        Ok(())
    }

    /// Highest chunk number such that chunks `1..=n` of `block` are all
    /// present (0 if none). Lets a retransmitted fetch resume mid-block.
    pub fn last_contiguous_chunk(&self, block: u64) -> u16 {
        let Some(entry) = self.blocks.get(&Reverse(block)) else {
            return 0;
        };
        let mut last = 0;
        for chunk in entry.received.keys() {
            if *chunk != last + 1 {
                break;
            }
            last = *chunk;
        }
        last
    }

    /// If every chunk of `block` is present, remove and return the
    /// assembled bytes.
    pub fn next_full_block(&mut self, block: u64) -> Option<Bytes> {
        let entry = self.blocks.get(&Reverse(block))?;
        if entry.received.len() != entry.total as usize {
            return None;
        }
        let entry = self.blocks.remove(&Reverse(block)).unwrap();
        self.pending_bytes -= entry.bytes;
        let mut assembled = BytesMut::with_capacity(entry.bytes);
        for (_, data) in entry.received {
            assembled.extend_from_slice(&data);
        }
        Some(assembled.freeze())
    }

    /// Prepare for a retransmitted fetch of `block` downward: keep only
    /// the contiguous chunk prefix of `block` (which the new request
    /// advertises) and drop everything else, so an honest source never
    /// resends a chunk we still hold. Returns the advertised prefix.
    pub fn reset_for_retry(&mut self, block: u64) -> u16 {
        let last = self.last_contiguous_chunk(block);
        let keep: Option<BlockChunks> = self.blocks.remove(&Reverse(block)).map(|entry| {
            let mut kept = BlockChunks {
                total: entry.total,
                received: BTreeMap::new(),
                bytes: 0,
            };
            for (chunk, data) in entry.received {
                if chunk > last {
                    continue;
                }
                kept.bytes += data.len();
                kept.received.insert(chunk, data);
            }
            kept
        });
        self.clear();
        if let Some(kept) = keep {
            self.pending_bytes = kept.bytes;
            self.blocks.insert(Reverse(block), kept);
        }
        last
    }

    /// Drop pending chunks for `block` and every block below it (bad-data
    /// recovery: those blocks are no longer trusted).
    pub fn clear_up_to(&mut self, block: u64) {
        let dropped: Vec<_> = self
            .blocks
            .range(Reverse(block)..)
            .map(|(key, entry)| (*key, entry.bytes))
            .collect();
        for (key, bytes) in dropped {
            self.blocks.remove(&key);
            self.pending_bytes -= bytes;
        }
    }

    /// Drop everything (session end or source switch).
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.pending_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn test_assembles_out_of_order() {
        let mut assembler = Assembler::new();
        assembler.insert(10, 3, 2, chunk(2, 4)).unwrap();
        assert_eq!(assembler.next_full_block(10), None);
        assembler.insert(10, 3, 3, chunk(3, 2)).unwrap();
        assembler.insert(10, 3, 1, chunk(1, 4)).unwrap();
        assert_eq!(assembler.pending_bytes(), 10);

        let block = assembler.next_full_block(10).unwrap();
        assert_eq!(&block[..], &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3][..]);
        assert_eq!(assembler.pending_bytes(), 0);
        assert_eq!(assembler.next_full_block(10), None);
    }

    #[test]
    fn test_single_chunk_block() {
        let mut assembler = Assembler::new();
        assembler.insert(1, 1, 1, chunk(9, 5)).unwrap();
        assert_eq!(assembler.next_full_block(1).unwrap(), chunk(9, 5));
    }

    #[test]
    fn test_rejects_bad_chunk_numbers() {
        let mut assembler = Assembler::new();
        assert_eq!(
            assembler.insert(1, 3, 0, chunk(0, 1)),
            Err(BadData::ChunkOutOfRange { chunk: 0, total: 3 })
        );
        assert_eq!(
            assembler.insert(1, 3, 4, chunk(0, 1)),
            Err(BadData::ChunkOutOfRange { chunk: 4, total: 3 })
        );
        assert_eq!(
            assembler.insert(1, 0, 0, chunk(0, 1)),
            Err(BadData::ChunkOutOfRange { chunk: 0, total: 0 })
        );
    }

    #[test]
    fn test_rejects_duplicate() {
        let mut assembler = Assembler::new();
        assembler.insert(1, 2, 1, chunk(1, 4)).unwrap();
        assert_eq!(
            assembler.insert(1, 2, 1, chunk(1, 4)),
            Err(BadData::DuplicateChunk { block: 1, chunk: 1 })
        );
        // Accounting unchanged by the rejected insert.
        assert_eq!(assembler.pending_bytes(), 4);
    }

    #[test]
    fn test_rejects_total_mismatch() {
        let mut assembler = Assembler::new();
        assembler.insert(1, 2, 1, chunk(1, 4)).unwrap();
        assert_eq!(
            assembler.insert(1, 3, 2, chunk(2, 4)),
            Err(BadData::TotalMismatch {
                known: 2,
                claimed: 3
            })
        );
    }

    #[test]
    fn test_last_contiguous_chunk() {
        let mut assembler = Assembler::new();
        assert_eq!(assembler.last_contiguous_chunk(7), 0);
        assembler.insert(7, 4, 1, chunk(1, 1)).unwrap();
        assembler.insert(7, 4, 3, chunk(3, 1)).unwrap();
        assert_eq!(assembler.last_contiguous_chunk(7), 1);
        assembler.insert(7, 4, 2, chunk(2, 1)).unwrap();
        assert_eq!(assembler.last_contiguous_chunk(7), 3);
    }

    #[test]
    fn test_reset_for_retry() {
        let mut assembler = Assembler::new();
        // Top block 10 has chunks 1 and 3; block 9 is fully pending.
        assembler.insert(10, 4, 1, chunk(1, 4)).unwrap();
        assembler.insert(10, 4, 3, chunk(3, 4)).unwrap();
        assembler.insert(9, 1, 1, chunk(9, 4)).unwrap();

        assert_eq!(assembler.reset_for_retry(10), 1);
        assert_eq!(assembler.pending_bytes(), 4);
        // The retained prefix completes without duplicate conflicts.
        assembler.insert(10, 4, 2, chunk(2, 4)).unwrap();
        assembler.insert(10, 4, 3, chunk(3, 4)).unwrap();
        assembler.insert(10, 4, 4, chunk(4, 4)).unwrap();
        assert!(assembler.next_full_block(10).is_some());
        // Block 9 was dropped and must be refetched.
        assert!(assembler.next_full_block(9).is_none());
    }

    #[test]
    fn test_clear_up_to() {
        let mut assembler = Assembler::new();
        assembler.insert(10, 1, 1, chunk(1, 4)).unwrap();
        assembler.insert(9, 1, 1, chunk(2, 4)).unwrap();
        assembler.insert(8, 1, 1, chunk(3, 4)).unwrap();
        assembler.clear_up_to(9);
        assert_eq!(assembler.pending_bytes(), 4);
        assert!(assembler.next_full_block(10).is_some());
        assert!(assembler.next_full_block(9).is_none());
        assert!(assembler.next_full_block(8).is_none());
    }

    #[test]
    fn test_clear() {
        let mut assembler = Assembler::new();
        assembler.insert(10, 2, 1, chunk(1, 4)).unwrap();
        assembler.insert(9, 1, 1, chunk(2, 4)).unwrap();
        assembler.clear();
        assert_eq!(assembler.pending_bytes(), 0);
        assert!(assembler.next_full_block(9).is_none());
    }
}
