//! Synchronize the state of a lagging replica from untrusted peers.
//!
//! `statesync` implements the state-transfer half of a Byzantine
//! fault-tolerant replicated state machine: when a replica falls behind
//! (crash recovery, restart, late join), it catches up to the latest
//! stable checkpoint agreed on by the replica set by fetching application
//! blocks and reserved pages from its peers, despite up to `f` Byzantine
//! peers among `n = 3f + 2c + 1`. Fetched state is indistinguishable from
//! state a correct replica would have computed locally: a checkpoint is
//! only adopted once `f + 1` distinct peers attest to identical summaries,
//! and every block is bound to that attestation through a digest chain.
//!
//! # Architecture
//!
//! The [Engine] is a single task that owns all protocol state. Transport
//! deliveries, clock ticks, and application commands are multiplexed onto
//! it through a bounded mailbox, so no internal locking is required.
//! Progress is persisted through an atomic metadata store, allowing a
//! crashed replica to resume an interrupted transfer in the same phase.
//!
//! Each replica plays both roles: a _destination_ runs the fetching state
//! machine (checkpoint summaries, then missing blocks highest-first, then
//! reserved pages), while a _source_ answers peer requests whenever it is
//! not itself fetching.
//!
//! ```text
//!             +----------+   AskForCheckpointSummaries    +--------+
//!             |          | -----------------------------> |        |
//!             |  dest    | <----- CheckpointSummary ----- | source |
//!             | (engine) | -------- FetchBlocks --------> |(engine)|
//!             |          | <-------- ItemData ----------- |        |
//!             +----------+                                +--------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! let (engine, mailbox) = Engine::init(context, config).await?;
//! engine.start((sender, receiver));
//! mailbox.start_collecting().await;
//! let mut done = mailbox.subscribe().await;
//! let checkpoint = done.next().await.unwrap();
//! ```

use bytes::Bytes;
use commonware_cryptography::Digest;
use std::future::Future;
use thiserror::Error;

mod assembler;
mod cache;
mod certificate;
mod config;
pub mod engine;
mod selector;
mod store;
mod throughput;
pub mod types;
pub mod wire;

#[cfg(test)]
pub(crate) mod mocks;

pub use assembler::Assembler;
pub use cache::VBlockCache;
pub use certificate::{Certificate, Certificates};
pub use config::Config;
pub use engine::{Engine, Mailbox};
pub use selector::Selector;
pub use types::{CheckpointDesc, FetchingState, Status};

/// Errors that can occur during state transfer.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration violated an invariant at construction.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    /// The durable store failed.
    #[error("store: {0}")]
    Store(#[from] commonware_storage::metadata::Error),
    /// The durable store contents are inconsistent with the application
    /// state. Requires operator intervention.
    #[error("inconsistent state: {0}")]
    Inconsistency(String),
    /// The application rejected a block write.
    #[error("application rejected block {0}")]
    BlockRejected(u64),
    /// The requested checkpoint is not stored.
    #[error("unknown checkpoint {0}")]
    UnknownCheckpoint(u64),
    /// The requested reserved page is out of range.
    #[error("unknown reserved page {0}")]
    UnknownPage(u32),
    /// The provided reserved page exceeds the configured page size.
    #[error("page {0} too large: {1}")]
    PageTooLarge(u32, usize),
    /// A checkpoint descriptor would be overwritten with different content.
    #[error("conflicting descriptor for checkpoint {0}")]
    ConflictingCheckpoint(u64),
    /// The engine is shut down.
    #[error("engine closed")]
    Closed,
}

/// The application's block store.
///
/// Blocks are opaque to the engine except for two properties: each block
/// `n > 1` embeds the digest of block `n - 1` in its body (exposed via
/// [AppState::prev_digest_of_block]), and blocks written above
/// `last_reachable_block` stay unreachable until the chain down to it is
/// closed. The engine is the only writer during a transfer.
pub trait AppState: Clone + Send + 'static {
    /// Digest type binding the block chain.
    type Digest: Digest;

    /// Highest block reachable from genesis without gaps.
    fn last_reachable_block(&self) -> impl Future<Output = u64> + Send;

    /// Highest block present, reachable or not.
    fn last_block(&self) -> impl Future<Output = u64> + Send;

    /// Whether block `number` is present.
    fn has_block(&self, number: u64) -> impl Future<Output = bool> + Send;

    /// Read block `number`, if present.
    fn get_block(&self, number: u64) -> impl Future<Output = Option<Bytes>> + Send;

    /// Extract the predecessor digest embedded in block `number`.
    fn prev_digest_of_block(
        &self,
        number: u64,
    ) -> impl Future<Output = Option<Self::Digest>> + Send;

    /// Durably write block `number`.
    ///
    /// Returns `false` if the application rejects the block (fatal to the
    /// transfer).
    fn put_block(&mut self, number: u64, block: Bytes) -> impl Future<Output = bool> + Send;

    /// Allow pruning of blocks below `number` (exclusive).
    fn prune_below(&mut self, number: u64) -> impl Future<Output = ()> + Send;
}
