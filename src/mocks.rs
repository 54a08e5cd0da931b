//! Test doubles for the engine.

use crate::types::{digest_of_block, genesis_digest};
use crate::AppState;
use bytes::{BufMut, Bytes, BytesMut};
use commonware_cryptography::{sha256, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// In-memory block store whose blocks embed their predecessor's digest in
/// the first 32 bytes of the body, forming the hash chain the engine
/// verifies.
#[derive(Clone)]
pub struct Application {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    blocks: BTreeMap<u64, Bytes>,
    pruned_below: u64,
    reject_puts: bool,
}

impl Application {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                blocks: BTreeMap::new(),
                pruned_below: 0,
                reject_puts: false,
            })),
        }
    }

    /// Create an application pre-populated with `chain(count, fill)`.
    pub fn with_chain(count: u64, fill: usize) -> Self {
        let app = Self::new();
        {
            let mut inner = app.inner.lock().unwrap();
            for (index, block) in chain(count, fill).into_iter().enumerate() {
                inner.blocks.insert(index as u64 + 1, block);
            }
        }
        app
    }

    /// Make all subsequent `put_block` calls fail.
    pub fn reject_puts(&self) {
        self.inner.lock().unwrap().reject_puts = true;
    }

    /// Flip the last byte of a stored block (serving it will no longer
    /// match any digest attested for it).
    pub fn corrupt_block(&self, number: u64) {
        let mut inner = self.inner.lock().unwrap();
        let block = inner.blocks.get(&number).expect("block must exist");
        let mut bytes = block.to_vec();
        *bytes.last_mut().unwrap() ^= 0xFF;
        inner.blocks.insert(number, Bytes::from(bytes));
    }

    /// Copy out all stored blocks (to carry state across a simulated
    /// process restart).
    pub fn snapshot(&self) -> Vec<(u64, Bytes)> {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks
            .iter()
            .map(|(number, block)| (*number, block.clone()))
            .collect()
    }

    /// Rebuild an application from a [Application::snapshot].
    pub fn restore(blocks: Vec<(u64, Bytes)>) -> Self {
        let app = Self::new();
        app.inner.lock().unwrap().blocks = blocks.into_iter().collect();
        app
    }

    /// Number of blocks pruned away.
    pub fn pruned_below(&self) -> u64 {
        self.inner.lock().unwrap().pruned_below
    }
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState for Application {
    type Digest = sha256::Digest;

    async fn last_reachable_block(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        let mut last = 0;
        for block in inner.blocks.keys() {
            if *block != last + 1 {
                break;
            }
            last = *block;
        }
        last
    }

    async fn last_block(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.blocks.keys().next_back().copied().unwrap_or(0)
    }

    async fn has_block(&self, number: u64) -> bool {
        self.inner.lock().unwrap().blocks.contains_key(&number)
    }

    async fn get_block(&self, number: u64) -> Option<Bytes> {
        self.inner.lock().unwrap().blocks.get(&number).cloned()
    }

    async fn prev_digest_of_block(&self, number: u64) -> Option<sha256::Digest> {
        let inner = self.inner.lock().unwrap();
        let block = inner.blocks.get(&number)?;
        if block.len() < 32 {
            return None;
        }
        let arr: [u8; 32] = block[..32].try_into().ok()?;
        Some(sha256::Digest::from(arr))
    }

    async fn put_block(&mut self, number: u64, block: Bytes) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.reject_puts {
            return false;
        }
        inner.blocks.insert(number, block);
        true
    }

    async fn prune_below(&mut self, number: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.pruned_below = inner.pruned_below.max(number);
    }
}

/// Build a deterministic hash chain of `count` blocks (numbered from 1).
/// Each block is the predecessor digest followed by `fill` bytes derived
/// from the block number.
pub fn chain(count: u64, fill: usize) -> Vec<Bytes> {
    let mut blocks = Vec::with_capacity(count as usize);
    let mut prev = genesis_digest::<Sha256>();
    for number in 1..=count {
        let mut block = BytesMut::with_capacity(32 + fill);
        block.put_slice(prev.as_ref());
        for offset in 0..fill {
            block.put_u8((number as usize + offset) as u8);
        }
        let block = block.freeze();
        prev = digest_of_block::<Sha256>(number, &block);
        blocks.push(block);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_links() {
        let blocks = chain(3, 8);
        for number in 2..=3u64 {
            let expected = digest_of_block::<Sha256>(
                number - 1,
                &blocks[(number - 2) as usize],
            );
            let arr: [u8; 32] = blocks[(number - 1) as usize][..32].try_into().unwrap();
            let embedded = sha256::Digest::from(arr);
            assert_eq!(embedded, expected);
        }
    }

    #[test]
    fn test_application_reachability() {
        futures::executor::block_on(async {
            let mut app = Application::new();
            let blocks = chain(3, 8);
            assert!(app.put_block(3, blocks[2].clone()).await);
            assert_eq!(app.last_reachable_block().await, 0);
            assert_eq!(app.last_block().await, 3);
            assert!(app.put_block(1, blocks[0].clone()).await);
            assert_eq!(app.last_reachable_block().await, 1);
            assert!(app.put_block(2, blocks[1].clone()).await);
            assert_eq!(app.last_reachable_block().await, 3);
        });
    }
}
