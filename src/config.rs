//! Engine configuration.

use crate::Error;
use commonware_cryptography::PublicKey;
use governor::Quota;
use std::time::Duration;

/// Configuration for an [crate::Engine].
#[derive(Clone)]
pub struct Config<P: PublicKey, A> {
    /// Our identity.
    pub me: P,

    /// All replicas in the set, including us. Must have
    /// `3 * f + 2 * c + 1` members.
    pub participants: Vec<P>,

    /// Maximum number of Byzantine replicas tolerated.
    pub f: u32,

    /// Number of additional slow (but correct) replicas tolerated.
    pub c: u32,

    /// The application block store.
    pub app: A,

    /// Partition for the durable store.
    pub partition: String,

    /// The size of the engine mailbox.
    pub mailbox_size: usize,

    /// Maximum size of an application block in bytes.
    pub max_block_size: usize,

    /// Maximum size of a transferred chunk in bytes.
    pub max_chunk_size: usize,

    /// Maximum chunks a source streams per response burst.
    pub max_chunks_per_batch: usize,

    /// Back-pressure cap on bytes buffered from the current source.
    pub max_pending_data_from_source: usize,

    /// Period of the engine's timeout/status tick.
    pub refresh_interval: Duration,

    /// How long to wait for progress from a source before demoting it and
    /// retransmitting.
    pub retransmission_timeout: Duration,

    /// Fruitless summary retransmissions before the summaries phase is
    /// restarted with all peers preferred.
    pub summaries_reset_count: u32,

    /// Size of the stored-checkpoint window.
    pub max_stored_checkpoints: u64,

    /// Whether reserved pages are in use. When disabled, page operations
    /// are rejected and checkpoints carry an empty pages descriptor.
    pub enable_reserved_pages: bool,

    /// Size of one reserved page in bytes.
    pub page_size: usize,

    /// Number of reserved page slots.
    pub max_pages: u32,

    /// Capacity of the source-side virtual block cache.
    pub max_vblocks_in_cache: usize,

    /// Per-peer rate limit on served fetch requests.
    pub serve_quota: Quota,
}

impl<P: PublicKey, A> Config<P, A> {
    /// Votes required to complete a checkpoint certificate.
    pub fn quorum(&self) -> usize {
        self.f as usize + 1
    }

    /// All replicas other than us.
    pub fn others(&self) -> Vec<P> {
        self.participants
            .iter()
            .filter(|p| **p != self.me)
            .cloned()
            .collect()
    }

    /// Validate the configuration. Violations are fatal: the engine
    /// refuses to start.
    pub fn validate(&self) -> Result<(), Error> {
        let expected = 3 * self.f as usize + 2 * self.c as usize + 1;
        if self.f == 0 {
            return Err(Error::InvalidConfig("f must be at least 1"));
        }
        if self.participants.len() != expected {
            return Err(Error::InvalidConfig("participants must be 3f + 2c + 1"));
        }
        if !self.participants.contains(&self.me) {
            return Err(Error::InvalidConfig("participants must include me"));
        }
        let mut unique = self.participants.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != self.participants.len() {
            return Err(Error::InvalidConfig("duplicate participant"));
        }
        if self.mailbox_size == 0 {
            return Err(Error::InvalidConfig("mailbox_size must be non-zero"));
        }
        if self.max_chunk_size == 0 || self.max_chunk_size > self.max_block_size {
            return Err(Error::InvalidConfig(
                "max_chunk_size must be in 1..=max_block_size",
            ));
        }
        if self.max_chunks_per_batch == 0 {
            return Err(Error::InvalidConfig("max_chunks_per_batch must be non-zero"));
        }
        if self.max_pending_data_from_source < self.max_chunk_size {
            return Err(Error::InvalidConfig(
                "max_pending_data_from_source must hold at least one chunk",
            ));
        }
        if self.summaries_reset_count == 0 {
            return Err(Error::InvalidConfig(
                "summaries_reset_count must be non-zero",
            ));
        }
        if self.max_stored_checkpoints == 0 {
            return Err(Error::InvalidConfig(
                "max_stored_checkpoints must be non-zero",
            ));
        }
        if self.enable_reserved_pages && (self.page_size == 0 || self.max_pages == 0) {
            return Err(Error::InvalidConfig("reserved pages must be non-empty"));
        }
        if self.max_vblocks_in_cache == 0 {
            return Err(Error::InvalidConfig(
                "max_vblocks_in_cache must be non-zero",
            ));
        }
        // A block (or the largest possible vblock) must be expressible as
        // u16-numbered chunks.
        let vblock_entry = 4 + 8 + 64 + 4 + self.page_size;
        let mut max_item = self.max_block_size;
        if self.enable_reserved_pages {
            max_item = max_item.max(4 + self.max_pages as usize * vblock_entry);
        }
        if max_item.div_ceil(self.max_chunk_size) > u16::MAX as usize {
            return Err(Error::InvalidConfig("chunk numbering would overflow u16"));
        }
        Ok(())
    }
}
