//! Metrics for the engine.

use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the engine.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Blocks verified and committed to the application.
    pub fetched_blocks: Counter,
    /// Bytes of verified blocks committed to the application.
    pub fetched_bytes: Counter,
    /// Messages dropped as malformed.
    pub invalid_messages: Counter,
    /// Messages dropped as out-of-phase or replayed.
    pub irrelevant_messages: Counter,
    /// Sources demoted (timeout, reject, or bad data).
    pub demotions: Counter,
    /// Sessions completed end-to-end.
    pub sessions_completed: Counter,
    /// Times the summaries phase was restarted.
    pub summary_resets: Counter,
    /// Chunks served to fetching peers.
    pub served_chunks: Counter,
    /// Checkpoint summaries served to peers.
    pub served_summaries: Counter,
    /// Virtual blocks built on demand (cache misses).
    pub built_vblocks: Counter,
    /// Current fetching phase (0 = not fetching, 1 = summaries,
    /// 2 = blocks, 3 = reserved pages).
    pub phase: Gauge,
    /// Bytes of chunks awaiting reassembly.
    pub pending_bytes: Gauge,
    /// Peers currently eligible to serve the session.
    pub preferred_sources: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given
    /// context.
    pub fn init<M: commonware_runtime::Metrics>(context: M) -> Self {
        let metrics = Self::default();
        context.register(
            "fetched_blocks",
            "Blocks verified and committed to the application",
            metrics.fetched_blocks.clone(),
        );
        context.register(
            "fetched_bytes",
            "Bytes of verified blocks committed to the application",
            metrics.fetched_bytes.clone(),
        );
        context.register(
            "invalid_messages",
            "Messages dropped as malformed",
            metrics.invalid_messages.clone(),
        );
        context.register(
            "irrelevant_messages",
            "Messages dropped as out-of-phase or replayed",
            metrics.irrelevant_messages.clone(),
        );
        context.register(
            "demotions",
            "Sources demoted (timeout, reject, or bad data)",
            metrics.demotions.clone(),
        );
        context.register(
            "sessions_completed",
            "Sessions completed end-to-end",
            metrics.sessions_completed.clone(),
        );
        context.register(
            "summary_resets",
            "Times the summaries phase was restarted",
            metrics.summary_resets.clone(),
        );
        context.register(
            "served_chunks",
            "Chunks served to fetching peers",
            metrics.served_chunks.clone(),
        );
        context.register(
            "served_summaries",
            "Checkpoint summaries served to peers",
            metrics.served_summaries.clone(),
        );
        context.register(
            "built_vblocks",
            "Virtual blocks built on demand",
            metrics.built_vblocks.clone(),
        );
        context.register("phase", "Current fetching phase", metrics.phase.clone());
        context.register(
            "pending_bytes",
            "Bytes of chunks awaiting reassembly",
            metrics.pending_bytes.clone(),
        );
        context.register(
            "preferred_sources",
            "Peers currently eligible to serve the session",
            metrics.preferred_sources.clone(),
        );
        metrics
    }
}
