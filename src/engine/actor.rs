//! The state-transfer engine actor.

use super::{ingress, metrics};
use crate::assembler::Assembler;
use crate::cache::VBlockCache;
use crate::certificate::Certificates;
use crate::config::Config;
use crate::selector::Selector;
use crate::store::{PageVersion, Store};
use crate::throughput::Throughput;
use crate::types::{
    digest_of_block, digest_of_page, digest_of_pages_descriptor, genesis_digest, CheckpointDesc,
    FetchingState, PageInfo, Status, VBlock, VBLOCK_ID,
};
use crate::wire::{Message, Payload};
use crate::{AppState, Error};
use bytes::Bytes;
use commonware_codec::{DecodeExt, Encode};
use commonware_cryptography::{Digest, Hasher, PublicKey};
use commonware_macros::select;
use commonware_p2p::{Receiver, Recipients, Sender};
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner, Storage};
use futures::channel::mpsc;
use futures::StreamExt;
use governor::{
    clock::Clock as GClock, middleware::NoOpMiddleware, state::keyed::HashMapStateStore,
    RateLimiter,
};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Ticks between collecting-status log lines while fetching.
const STATUS_LOG_TICKS: u64 = 16;

/// Window over which throughput rates are derived.
const STATS_WINDOW: Duration = Duration::from_secs(10);

/// An in-flight fetch session: the certified target and the downward
/// verification cursor.
struct Session<D: Digest, P: PublicKey> {
    target: CheckpointDesc<D>,
    first_required: u64,
    next_required: u64,
    next_digest: D,
    selector: Selector<P>,
    request_seq: u64,
}

/// Generates per-sender unique, strictly increasing sequence numbers
/// (wall-clock milliseconds with a per-millisecond counter, surviving
/// restarts as long as the clock does not move backwards).
struct SeqGen {
    time: u64,
    count: u64,
}

impl SeqGen {
    fn new() -> Self {
        Self { time: 0, count: 0 }
    }

    fn next(&mut self, now: SystemTime) -> u64 {
        let millis = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        if millis > self.time {
            self.time = millis;
            self.count = 0;
        }
        self.count += 1;
        if self.count == 0xFF {
            self.time += 1;
            self.count = 1;
        }
        (self.time << 8) | self.count
    }
}

/// Runs both halves of the state-transfer protocol: the fetching state
/// machine when this replica is behind and the source role when it is
/// not.
pub struct Engine<
    E: Clock + GClock + Spawner + rand::Rng + RuntimeMetrics + Storage,
    P: PublicKey,
    H: Hasher,
    A: AppState<Digest = H::Digest>,
    NetS: Sender<PublicKey = P>,
    NetR: Receiver<PublicKey = P>,
> {
    context: E,

    // Configuration
    others: Vec<P>,
    quorum: usize,
    max_block_size: usize,
    max_chunk_size: usize,
    max_chunks_per_batch: usize,
    max_pending: usize,
    refresh_interval: Duration,
    retransmission_timeout: Duration,
    summaries_reset_count: u32,
    max_stored_checkpoints: u64,
    page_size: usize,
    max_pages: u32,

    // Collaborators
    app: A,
    store: Store<E, H::Digest>,
    mailbox: mpsc::Receiver<ingress::Message<H::Digest>>,

    // Destination role
    state: FetchingState,
    certs: Certificates<u64, P, CheckpointDesc<H::Digest>>,
    ask_seqs: Vec<u64>,
    summary_retransmissions: u32,
    summary_last_send: SystemTime,
    session: Option<Session<H::Digest, P>>,
    assembler: Assembler,
    throughput: Throughput,

    // Source role
    vblocks: VBlockCache,
    #[allow(clippy::type_complexity)]
    serve_limiter: RateLimiter<P, HashMapStateStore<P>, E, NoOpMiddleware<E::Instant>>,

    // Replay protection
    seqs: SeqGen,
    last_seq: HashMap<P, u64>,

    // Observers
    subscribers: Vec<mpsc::Sender<u64>>,
    metrics: metrics::Metrics,
    ticks: u64,

    _s: PhantomData<NetS>,
    _r: PhantomData<NetR>,
}

impl<
        E: Clock + GClock + Spawner + rand::Rng + RuntimeMetrics + Storage,
        P: PublicKey,
        H: Hasher,
        A: AppState<Digest = H::Digest>,
        NetS: Sender<PublicKey = P>,
        NetR: Receiver<PublicKey = P>,
    > Engine<E, P, H, A, NetS, NetR>
{
    /// Open the durable store, verify its consistency against the
    /// application, and construct the engine.
    ///
    /// Returns the engine and a mailbox to command it. Configuration or
    /// consistency violations are fatal.
    pub async fn init(
        context: E,
        cfg: Config<P, A>,
    ) -> Result<(Self, ingress::Mailbox<H::Digest>), Error> {
        cfg.validate()?;
        let max_pages = if cfg.enable_reserved_pages {
            cfg.max_pages
        } else {
            0
        };
        let store: Store<E, H::Digest> =
            Store::init(context.with_label("store"), cfg.partition.clone(), max_pages).await?;
        Self::check_consistency(&store, &cfg.app, max_pages, cfg.page_size).await?;

        let metrics = metrics::Metrics::init(context.clone());
        let serve_limiter = RateLimiter::hashmap_with_clock(cfg.serve_quota, &context);
        let (tx, rx) = mpsc::channel(cfg.mailbox_size);
        let state = store.fetching_state();
        let quorum = cfg.quorum();
        let engine = Self {
            others: cfg.others(),
            quorum,
            max_block_size: cfg.max_block_size,
            max_chunk_size: cfg.max_chunk_size,
            max_chunks_per_batch: cfg.max_chunks_per_batch,
            max_pending: cfg.max_pending_data_from_source,
            refresh_interval: cfg.refresh_interval,
            retransmission_timeout: cfg.retransmission_timeout,
            summaries_reset_count: cfg.summaries_reset_count,
            max_stored_checkpoints: cfg.max_stored_checkpoints,
            page_size: cfg.page_size,
            max_pages,
            app: cfg.app,
            store,
            mailbox: rx,
            state,
            certs: Certificates::new(quorum),
            ask_seqs: Vec::new(),
            summary_retransmissions: 0,
            summary_last_send: UNIX_EPOCH,
            session: None,
            assembler: Assembler::new(),
            throughput: Throughput::new(STATS_WINDOW),
            vblocks: VBlockCache::new(cfg.max_vblocks_in_cache),
            serve_limiter,
            seqs: SeqGen::new(),
            last_seq: HashMap::new(),
            subscribers: Vec::new(),
            metrics,
            ticks: 0,
            context,
            _s: PhantomData,
            _r: PhantomData,
        };
        Ok((engine, ingress::Mailbox::new(tx)))
    }

    /// Runs the engine until the context is stopped.
    pub fn start(mut self, network: (NetS, NetR)) -> Handle<()> {
        self.context.spawn_ref()(self.run(network))
    }

    async fn run(mut self, network: (NetS, NetR)) {
        let (mut sender, mut receiver) = network;
        let mut shutdown = self.context.stopped();

        // Resume an interrupted session, if any.
        if let Err(err) = self.recover(&mut sender).await {
            error!(?err, "recovery failed");
            return;
        }

        loop {
            self.metrics
                .pending_bytes
                .set(self.assembler.pending_bytes() as i64);
            self.metrics.preferred_sources.set(
                self.session
                    .as_ref()
                    .map(|session| session.selector.len_preferred() as i64)
                    .unwrap_or(0),
            );

            let result = select! {
                _ = &mut shutdown => {
                    debug!("shutdown");
                    if let Err(err) = self.store.commit().await {
                        warn!(?err, "final commit failed");
                    }
                    return;
                },

                command = self.mailbox.next() => {
                    let Some(command) = command else {
                        error!("mailbox closed");
                        return;
                    };
                    self.handle_command(&mut sender, command).await
                },

                message = receiver.recv() => {
                    let (peer, bytes) = match message {
                        Ok(message) => message,
                        Err(err) => {
                            error!(?err, "receiver closed");
                            return;
                        }
                    };
                    match Message::<H::Digest>::decode(bytes) {
                        Ok(message) => self.handle_message(&mut sender, peer, message).await,
                        Err(err) => {
                            debug!(?err, ?peer, "decode failed");
                            self.metrics.invalid_messages.inc();
                            Ok(())
                        }
                    }
                },

                _ = self.context.sleep(self.refresh_interval) => {
                    self.on_tick(&mut sender).await
                },
            };

            // Errors surfacing here are unrecoverable (store failure,
            // application rejection, inconsistency): stop and escalate.
            if let Err(err) = result {
                error!(?err, "fatal, stopping");
                return;
            }
        }
    }

    fn phase_index(&self) -> i64 {
        match self.state {
            FetchingState::NotFetching => 0,
            FetchingState::GettingCheckpointSummaries => 1,
            FetchingState::GettingMissingBlocks => 2,
            FetchingState::GettingMissingResPages => 3,
        }
    }

    async fn transmit(sender: &mut NetS, peer: P, message: Message<H::Digest>) {
        match sender
            .send(Recipients::One(peer.clone()), message.encode().into(), false)
            .await
        {
            Err(err) => warn!(?err, ?peer, "send failed"),
            Ok(to) if to.is_empty() => debug!(?peer, "peer not connected"),
            Ok(_) => {}
        }
    }

    // ---------------------------------------------------------------
    // Recovery and consistency
    // ---------------------------------------------------------------

    /// Rebuild the reserved-pages descriptor for `checkpoint` from the
    /// store, including the zero default for never-written pages.
    fn pages_descriptor(
        store: &Store<E, H::Digest>,
        max_pages: u32,
        page_size: usize,
        checkpoint: u64,
    ) -> Vec<PageInfo<H::Digest>> {
        let zeros = vec![0u8; page_size];
        (0..max_pages)
            .map(|page| match store.page_at(page, checkpoint) {
                Some(version) => PageInfo {
                    page,
                    checkpoint: version.checkpoint,
                    digest: version.digest,
                },
                None => PageInfo {
                    page,
                    checkpoint: 0,
                    digest: digest_of_page::<H>(page, 0, &zeros),
                },
            })
            .collect()
    }

    /// Validate the durable store against the application at init. Any
    /// violation is an operator-level fault.
    async fn check_consistency(
        store: &Store<E, H::Digest>,
        app: &A,
        max_pages: u32,
        page_size: usize,
    ) -> Result<(), Error> {
        let first = store.first_stored_checkpoint();
        let last = store.last_stored_checkpoint();
        if (first == 0) != (last == 0) || first > last {
            return Err(Error::Inconsistency(format!(
                "stored window [{first}, {last}] malformed"
            )));
        }
        if last > 0 {
            for checkpoint in first..=last {
                if store.checkpoint(checkpoint).is_none() {
                    return Err(Error::Inconsistency(format!(
                        "checkpoint {checkpoint} missing from window [{first}, {last}]"
                    )));
                }
            }
        }

        match store.fetching_state() {
            FetchingState::NotFetching => {
                if last == 0 {
                    return Ok(());
                }
                // The newest checkpoint must describe the local state.
                let desc = store.checkpoint(last).unwrap();
                if desc.last_block > 0 {
                    if app.last_reachable_block().await < desc.last_block {
                        return Err(Error::Inconsistency(format!(
                            "checkpoint {last} covers block {} beyond reachable tip",
                            desc.last_block
                        )));
                    }
                    let block = app.get_block(desc.last_block).await.ok_or_else(|| {
                        Error::Inconsistency(format!("block {} missing", desc.last_block))
                    })?;
                    if digest_of_block::<H>(desc.last_block, &block) != desc.digest_of_last_block
                    {
                        return Err(Error::Inconsistency(format!(
                            "block {} diverges from checkpoint {last}",
                            desc.last_block
                        )));
                    }
                }
                let descriptor = Self::pages_descriptor(store, max_pages, page_size, last);
                if digest_of_pages_descriptor::<H>(&descriptor) != desc.digest_of_pages {
                    return Err(Error::Inconsistency(format!(
                        "reserved pages diverge from checkpoint {last}"
                    )));
                }
            }
            FetchingState::GettingCheckpointSummaries => {}
            FetchingState::GettingMissingBlocks => {
                if store.target().is_none()
                    || store.first_required_block().is_none()
                    || store.next_required_block().is_none()
                {
                    return Err(Error::Inconsistency(
                        "fetching blocks without session cursors".into(),
                    ));
                }
            }
            FetchingState::GettingMissingResPages => {
                if store.target().is_none() {
                    return Err(Error::Inconsistency(
                        "fetching pages without a target".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Resume the phase recorded in the store. The preferred set is not
    /// persisted, so recovery widens it to all other replicas; digests
    /// still gate every block.
    async fn recover(&mut self, sender: &mut NetS) -> Result<(), Error> {
        match self.store.fetching_state() {
            FetchingState::NotFetching => Ok(()),
            FetchingState::GettingCheckpointSummaries => {
                info!("resuming summary collection");
                self.enter_summaries(sender).await
            }
            FetchingState::GettingMissingBlocks => {
                let target = self
                    .store
                    .target()
                    .expect("checked by check_consistency");
                let first_required = self.store.first_required_block().unwrap();
                let mut next_required = self.store.next_required_block().unwrap();

                // Blocks written after the last cursor commit are already
                // durable in the application; skip past them.
                while next_required >= first_required && self.app.has_block(next_required).await {
                    next_required -= 1;
                }
                if next_required != self.store.next_required_block().unwrap() {
                    self.store.set_next_required_block(next_required);
                    self.store.commit().await?;
                }
                info!(
                    checkpoint = target.checkpoint,
                    next_required, "resuming block fetch"
                );

                let selector = Selector::new(self.others.clone());
                if next_required < first_required {
                    self.session = Some(Session {
                        target,
                        first_required,
                        next_required,
                        next_digest: genesis_digest::<H>(),
                        selector,
                        request_seq: 0,
                    });
                    return self.enter_pages(sender).await;
                }
                let next_digest = if next_required == target.last_block {
                    target.digest_of_last_block
                } else {
                    self.app
                        .prev_digest_of_block(next_required + 1)
                        .await
                        .ok_or_else(|| {
                            Error::Inconsistency(format!(
                                "block {} lost its chain link",
                                next_required + 1
                            ))
                        })?
                };
                self.session = Some(Session {
                    target,
                    first_required,
                    next_required,
                    next_digest,
                    selector,
                    request_seq: 0,
                });
                self.state = FetchingState::GettingMissingBlocks;
                self.metrics.phase.set(self.phase_index());
                self.send_fetch_blocks(sender, false).await
            }
            FetchingState::GettingMissingResPages => {
                let target = self
                    .store
                    .target()
                    .expect("checked by check_consistency");
                info!(checkpoint = target.checkpoint, "resuming page fetch");
                self.session = Some(Session {
                    target,
                    first_required: 0,
                    next_required: 0,
                    next_digest: genesis_digest::<H>(),
                    selector: Selector::new(self.others.clone()),
                    request_seq: 0,
                });
                self.state = FetchingState::GettingMissingResPages;
                self.metrics.phase.set(self.phase_index());
                self.send_fetch_pages(sender, false).await
            }
        }
    }

    // ---------------------------------------------------------------
    // Phase transitions
    // ---------------------------------------------------------------

    /// Restart (or start) the summaries phase: durably forget any
    /// in-flight session and broadcast for fresh attestations.
    async fn enter_summaries(&mut self, sender: &mut NetS) -> Result<(), Error> {
        self.session = None;
        self.assembler.clear();
        self.certs = Certificates::new(self.quorum);
        self.ask_seqs.clear();
        self.summary_retransmissions = 0;

        self.store
            .set_fetching_state(FetchingState::GettingCheckpointSummaries);
        self.store.clear_session();
        self.store.clear_staged_pages();
        self.store.commit().await?;
        self.state = FetchingState::GettingCheckpointSummaries;
        self.metrics.phase.set(self.phase_index());

        let min = self.store.last_stored_checkpoint() + 1;
        info!(min, "collecting checkpoint summaries");
        self.broadcast_ask(sender, min).await;
        Ok(())
    }

    async fn broadcast_ask(&mut self, sender: &mut NetS, min: u64) {
        let now = self.context.current();
        let seq = self.seqs.next(now);
        self.ask_seqs.push(seq);
        self.summary_last_send = now;
        let message = Message::<H::Digest> {
            seq,
            payload: Payload::AskForCheckpointSummaries {
                min_relevant_checkpoint: min,
            },
        };
        match sender
            .send(
                Recipients::Some(self.others.clone()),
                message.encode().into(),
                false,
            )
            .await
        {
            Err(err) => warn!(?err, "broadcast failed"),
            Ok(to) if to.is_empty() => debug!("no peers connected"),
            Ok(_) => {}
        }
    }

    /// A certificate completed: adopt the attested checkpoint as the
    /// target and start fetching from the replicas that matched it.
    async fn begin_session(
        &mut self,
        sender: &mut NetS,
        target: CheckpointDesc<H::Digest>,
        voters: Vec<P>,
    ) -> Result<(), Error> {
        let last_reachable = self.app.last_reachable_block().await;
        let first_required = last_reachable + 1;
        info!(
            checkpoint = target.checkpoint,
            last_block = target.last_block,
            first_required,
            "checkpoint certified"
        );

        self.certs = Certificates::new(self.quorum);
        self.ask_seqs.clear();
        self.store.set_target(&target);
        self.store.set_first_required_block(first_required);
        self.store.set_next_required_block(target.last_block);
        let next_digest = target.digest_of_last_block;
        self.session = Some(Session {
            target,
            first_required,
            next_required: self.store.next_required_block().unwrap(),
            next_digest,
            selector: Selector::new(voters),
            request_seq: 0,
        });

        let session = self.session.as_ref().unwrap();
        if session.first_required > session.target.last_block {
            // Every required block is already reachable locally; only the
            // reserved pages remain.
            return self.enter_pages(sender).await;
        }
        self.store
            .set_fetching_state(FetchingState::GettingMissingBlocks);
        self.store.commit().await?;
        self.state = FetchingState::GettingMissingBlocks;
        self.metrics.phase.set(self.phase_index());
        self.send_fetch_blocks(sender, false).await
    }

    async fn enter_pages(&mut self, sender: &mut NetS) -> Result<(), Error> {
        self.store
            .set_fetching_state(FetchingState::GettingMissingResPages);
        self.store.commit().await?;
        self.state = FetchingState::GettingMissingResPages;
        self.metrics.phase.set(self.phase_index());
        self.assembler.clear();
        self.send_fetch_pages(sender, false).await
    }

    /// (Re)issue the outstanding block fetch, optionally demoting the
    /// current source first. Falls back to the summaries phase when the
    /// preferred set is exhausted.
    async fn send_fetch_blocks(&mut self, sender: &mut NetS, demote: bool) -> Result<(), Error> {
        let exhausted = {
            let Some(session) = self.session.as_mut() else {
                return Ok(());
            };
            let _ = session.selector.pick(&mut self.context, demote);
            session.selector.is_exhausted()
        };
        if exhausted {
            warn!("preferred sources exhausted");
            return self.enter_summaries(sender).await;
        }

        let now = self.context.current();
        let seq = self.seqs.next(now);
        let session = self.session.as_mut().unwrap();
        let last_known_chunk = self.assembler.reset_for_retry(session.next_required);
        session.request_seq = seq;
        session.selector.on_send(now);
        let peer = session.selector.current().unwrap().clone();
        let message = Message {
            seq,
            payload: Payload::FetchBlocks {
                min_block: session.first_required,
                max_block: session.next_required,
                last_known_chunk,
            },
        };
        debug!(
            ?peer,
            min = session.first_required,
            max = session.next_required,
            last_known_chunk,
            "fetching blocks"
        );
        Self::transmit(sender, peer, message).await;
        Ok(())
    }

    /// (Re)issue the outstanding reserved-pages fetch.
    async fn send_fetch_pages(&mut self, sender: &mut NetS, demote: bool) -> Result<(), Error> {
        let exhausted = {
            let Some(session) = self.session.as_mut() else {
                return Ok(());
            };
            let _ = session.selector.pick(&mut self.context, demote);
            session.selector.is_exhausted()
        };
        if exhausted {
            warn!("preferred sources exhausted");
            return self.enter_summaries(sender).await;
        }

        let now = self.context.current();
        let seq = self.seqs.next(now);
        let last_stored = self.store.last_stored_checkpoint();
        let session = self.session.as_mut().unwrap();
        let last_known_chunk = self.assembler.reset_for_retry(VBLOCK_ID);
        session.request_seq = seq;
        session.selector.on_send(now);
        let peer = session.selector.current().unwrap().clone();
        let message = Message {
            seq,
            payload: Payload::FetchResPages {
                last_known_checkpoint: last_stored,
                required_checkpoint: session.target.checkpoint,
                last_known_chunk,
            },
        };
        debug!(
            ?peer,
            required = session.target.checkpoint,
            last_known = last_stored,
            "fetching reserved pages"
        );
        Self::transmit(sender, peer, message).await;
        Ok(())
    }

    /// Demote the current source and move the outstanding fetch to the
    /// next preferred replica.
    async fn rotate_source(&mut self, sender: &mut NetS) -> Result<(), Error> {
        self.metrics.demotions.inc();
        match self.state {
            FetchingState::GettingMissingBlocks => self.send_fetch_blocks(sender, true).await,
            FetchingState::GettingMissingResPages => self.send_fetch_pages(sender, true).await,
            _ => Ok(()),
        }
    }

    /// The current source sent data a correct replica never would: drop
    /// the tainted chunks and move on.
    async fn on_bad_data(&mut self, sender: &mut NetS, up_to: u64) -> Result<(), Error> {
        self.metrics.invalid_messages.inc();
        self.assembler.clear_up_to(up_to);
        self.rotate_source(sender).await
    }

    // ---------------------------------------------------------------
    // Commands
    // ---------------------------------------------------------------

    async fn handle_command(
        &mut self,
        sender: &mut NetS,
        command: ingress::Message<H::Digest>,
    ) -> Result<(), Error> {
        match command {
            ingress::Message::StartCollecting => {
                if self.state == FetchingState::NotFetching {
                    self.enter_summaries(sender).await?;
                } else {
                    debug!("already collecting");
                }
                Ok(())
            }
            ingress::Message::IsCollecting { responder } => {
                let _ = responder.send(self.state != FetchingState::NotFetching);
                Ok(())
            }
            ingress::Message::CreateCheckpoint {
                checkpoint,
                responder,
            } => {
                let result = self.create_checkpoint(checkpoint).await;
                let fatal = matches!(result, Err(Error::Store(_)));
                let _ = responder.send(result);
                if fatal {
                    return Err(Error::Inconsistency("checkpoint commit failed".into()));
                }
                Ok(())
            }
            ingress::Message::MarkStable {
                checkpoint,
                responder,
            } => {
                let result = self.mark_stable(checkpoint).await;
                let _ = responder.send(result);
                Ok(())
            }
            ingress::Message::DigestOfCheckpoint {
                checkpoint,
                responder,
            } => {
                let digest = self.store.checkpoint(checkpoint).map(|desc| {
                    let mut hasher = H::new();
                    hasher.update(&desc.encode());
                    hasher.finalize()
                });
                let _ = responder.send(digest);
                Ok(())
            }
            ingress::Message::LoadPage { page, responder } => {
                let _ = responder.send(self.load_page(page));
                Ok(())
            }
            ingress::Message::SavePage {
                page,
                data,
                responder,
            } => {
                let result = self.save_page(page, &data).await;
                let _ = responder.send(result);
                Ok(())
            }
            ingress::Message::ZeroPage { page, responder } => {
                let zeros = vec![0u8; self.page_size];
                let result = self.save_page(page, &zeros).await;
                let _ = responder.send(result);
                Ok(())
            }
            ingress::Message::Subscribe { responder } => {
                let (tx, rx) = mpsc::channel(8);
                self.subscribers.push(tx);
                let _ = responder.send(rx);
                Ok(())
            }
            ingress::Message::SetEraseFlag { responder } => {
                self.store.set_erase_flag();
                let result = self.store.commit().await;
                let _ = responder.send(result);
                Ok(())
            }
            ingress::Message::Status { responder } => {
                let status = self.status();
                let _ = responder.send(status);
                Ok(())
            }
        }
    }

    /// Snapshot the reserved pages and block tip as `checkpoint` (driven
    /// by the consensus layer once the corresponding sequence number is
    /// executed).
    async fn create_checkpoint(&mut self, checkpoint: u64) -> Result<(), Error> {
        if self.state != FetchingState::NotFetching {
            return Err(Error::Inconsistency(
                "cannot checkpoint while fetching".into(),
            ));
        }
        let last = self.store.last_stored_checkpoint();
        if checkpoint == 0 || (last > 0 && checkpoint != last + 1) || (last == 0 && checkpoint != 1)
        {
            return Err(Error::ConflictingCheckpoint(checkpoint));
        }

        // Promote working pages to versions at this checkpoint.
        for page in self.store.working_pages() {
            let data = self.store.working_page(page).unwrap();
            let digest = digest_of_page::<H>(page, checkpoint, &data);
            self.store.put_page_version(
                page,
                PageVersion {
                    checkpoint,
                    digest,
                    data,
                },
            );
        }
        self.store.clear_working_pages();

        let descriptor =
            Self::pages_descriptor(&self.store, self.max_pages, self.page_size, checkpoint);
        let digest_of_pages = digest_of_pages_descriptor::<H>(&descriptor);
        let last_block = self.app.last_reachable_block().await;
        let digest_of_last_block = if last_block == 0 {
            genesis_digest::<H>()
        } else {
            let block = self.app.get_block(last_block).await.ok_or_else(|| {
                Error::Inconsistency(format!("reachable block {last_block} missing"))
            })?;
            digest_of_block::<H>(last_block, &block)
        };
        let desc = CheckpointDesc {
            checkpoint,
            last_block,
            digest_of_last_block,
            digest_of_pages,
        };
        self.store.set_checkpoint(&desc)?;

        // Advance the window, pruning past it.
        let first = if last == 0 {
            checkpoint
        } else {
            self.store.first_stored_checkpoint()
        };
        let new_first = if checkpoint - first + 1 > self.max_stored_checkpoints {
            checkpoint + 1 - self.max_stored_checkpoints
        } else {
            first
        };
        if new_first > first {
            self.store.delete_checkpoints_below(new_first);
            self.store.prune_page_versions(new_first);
        }
        self.store.set_stored_window(new_first, checkpoint);
        self.store.commit().await?;
        debug!(checkpoint, last_block, "checkpoint created");
        Ok(())
    }

    async fn mark_stable(&mut self, checkpoint: u64) -> Result<(), Error> {
        if self.store.checkpoint(checkpoint).is_none() {
            return Err(Error::UnknownCheckpoint(checkpoint));
        }
        let current = self.store.last_stable_checkpoint();
        self.store.set_last_stable_checkpoint(current.max(checkpoint));
        self.store.commit().await?;

        // Blocks older than the oldest stored checkpoint are prunable.
        let first = self.store.first_stored_checkpoint();
        if let Some(desc) = self.store.checkpoint(first) {
            if desc.last_block > 0 {
                self.app.prune_below(desc.last_block).await;
            }
        }
        Ok(())
    }

    fn load_page(&self, page: u32) -> Result<Bytes, Error> {
        if page >= self.max_pages {
            return Err(Error::UnknownPage(page));
        }
        if let Some(data) = self.store.working_page(page) {
            return Ok(data);
        }
        if let Some(version) = self.store.page_at(page, u64::MAX) {
            return Ok(version.data);
        }
        Ok(Bytes::from(vec![0u8; self.page_size]))
    }

    async fn save_page(&mut self, page: u32, data: &[u8]) -> Result<(), Error> {
        if page >= self.max_pages {
            return Err(Error::UnknownPage(page));
        }
        if data.len() > self.page_size {
            return Err(Error::PageTooLarge(page, data.len()));
        }
        self.store.set_working_page(page, data);
        self.store.commit().await
    }

    fn status(&mut self) -> Status<H::Digest> {
        let now = self.context.current();
        let (blocks_per_second, bytes_per_second) = self.throughput.rates(now);
        Status {
            state: self.state,
            last_stored_checkpoint: self.store.last_stored_checkpoint(),
            target: self.session.as_ref().map(|session| session.target),
            first_required_block: self
                .session
                .as_ref()
                .map(|session| session.first_required)
                .unwrap_or(0),
            next_required_block: self
                .session
                .as_ref()
                .map(|session| session.next_required)
                .unwrap_or(0),
            pending_bytes: self.assembler.pending_bytes(),
            preferred_sources: self
                .session
                .as_ref()
                .map(|session| {
                    session.selector.len_preferred()
                        + usize::from(session.selector.current().is_some())
                })
                .unwrap_or(0),
            blocks_per_second,
            bytes_per_second,
        }
    }

    // ---------------------------------------------------------------
    // Timer
    // ---------------------------------------------------------------

    async fn on_tick(&mut self, sender: &mut NetS) -> Result<(), Error> {
        self.ticks += 1;
        let now = self.context.current();
        match self.state {
            FetchingState::NotFetching => {}
            FetchingState::GettingCheckpointSummaries => {
                if let Some((_, target, voters)) = self.certs.best() {
                    let target = *target;
                    let voters = voters.to_vec();
                    return self.begin_session(sender, target, voters).await;
                }
                let elapsed = now
                    .duration_since(self.summary_last_send)
                    .unwrap_or_default();
                if elapsed >= self.retransmission_timeout {
                    self.summary_retransmissions += 1;
                    if self.summary_retransmissions > self.summaries_reset_count {
                        info!("no certificate, restarting summary collection");
                        self.metrics.summary_resets.inc();
                        return self.enter_summaries(sender).await;
                    }
                    let min = self.store.last_stored_checkpoint() + 1;
                    debug!(
                        min,
                        retransmission = self.summary_retransmissions,
                        "retransmitting summary request"
                    );
                    self.broadcast_ask(sender, min).await;
                }
            }
            FetchingState::GettingMissingBlocks | FetchingState::GettingMissingResPages => {
                let stalled = {
                    let session = self.session.as_ref().expect("fetching without session");
                    session.selector.current().is_none()
                        || session
                            .selector
                            .has_timed_out(now, self.retransmission_timeout)
                };
                if stalled {
                    debug!("source stalled");
                    self.rotate_source(sender).await?;
                }
            }
        }

        if self.state != FetchingState::NotFetching && self.ticks % STATUS_LOG_TICKS == 0 {
            let status = self.status();
            info!(
                state = ?status.state,
                target = status.target.map(|t| t.checkpoint),
                next_required = status.next_required_block,
                pending_bytes = status.pending_bytes,
                blocks_per_second = status.blocks_per_second,
                "collecting"
            );
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------

    async fn handle_message(
        &mut self,
        sender: &mut NetS,
        peer: P,
        message: Message<H::Digest>,
    ) -> Result<(), Error> {
        // Unknown senders and replays are dropped before any dispatch.
        if !self.others.contains(&peer) {
            self.metrics.irrelevant_messages.inc();
            return Ok(());
        }
        let last = self.last_seq.get(&peer).copied().unwrap_or(0);
        if message.seq <= last {
            debug!(?peer, seq = message.seq, "stale sequence");
            self.metrics.irrelevant_messages.inc();
            return Ok(());
        }
        self.last_seq.insert(peer.clone(), message.seq);

        match message.payload {
            Payload::AskForCheckpointSummaries {
                min_relevant_checkpoint,
            } => {
                self.serve_summaries(sender, peer, min_relevant_checkpoint, message.seq)
                    .await;
                Ok(())
            }
            Payload::CheckpointSummary {
                checkpoint,
                last_block,
                digest_of_last_block,
                digest_of_pages,
                request_seq,
            } => {
                self.on_summary(
                    peer,
                    CheckpointDesc {
                        checkpoint,
                        last_block,
                        digest_of_last_block,
                        digest_of_pages,
                    },
                    request_seq,
                );
                Ok(())
            }
            Payload::FetchBlocks {
                min_block,
                max_block,
                last_known_chunk,
            } => {
                self.serve_blocks(sender, peer, min_block, max_block, last_known_chunk, message.seq)
                    .await;
                Ok(())
            }
            Payload::FetchResPages {
                last_known_checkpoint,
                required_checkpoint,
                last_known_chunk,
            } => {
                self.serve_pages(
                    sender,
                    peer,
                    last_known_checkpoint,
                    required_checkpoint,
                    last_known_chunk,
                    message.seq,
                )
                .await;
                Ok(())
            }
            Payload::RejectFetching { request_seq } => {
                self.on_reject(sender, peer, request_seq).await
            }
            Payload::ItemData {
                request_seq,
                block,
                total_chunks,
                chunk,
                last_in_batch,
                data,
            } => {
                self.on_item_data(
                    sender,
                    peer,
                    request_seq,
                    block,
                    total_chunks,
                    chunk,
                    last_in_batch,
                    data,
                )
                .await
            }
        }
    }

    fn on_summary(&mut self, peer: P, desc: CheckpointDesc<H::Digest>, request_seq: u64) {
        if self.state != FetchingState::GettingCheckpointSummaries
            || !self.ask_seqs.contains(&request_seq)
        {
            self.metrics.irrelevant_messages.inc();
            return;
        }
        let min = self.store.last_stored_checkpoint() + 1;
        if desc.checkpoint < min || desc.last_block == VBLOCK_ID {
            debug!(?peer, checkpoint = desc.checkpoint, "unusable summary");
            self.metrics.invalid_messages.inc();
            return;
        }
        // Completed certificates are adopted at the next tick, not here:
        // summaries for higher checkpoints may still be in flight, and
        // the highest complete certificate wins.
        if self.certs.add(desc.checkpoint, peer.clone(), desc) {
            debug!(checkpoint = desc.checkpoint, "certificate complete");
        }
    }

    async fn on_reject(
        &mut self,
        sender: &mut NetS,
        peer: P,
        request_seq: u64,
    ) -> Result<(), Error> {
        let relevant = matches!(
            self.state,
            FetchingState::GettingMissingBlocks | FetchingState::GettingMissingResPages
        ) && self
            .session
            .as_ref()
            .map(|session| {
                session.selector.current() == Some(&peer) && session.request_seq == request_seq
            })
            .unwrap_or(false);
        if !relevant {
            self.metrics.irrelevant_messages.inc();
            return Ok(());
        }
        debug!(?peer, "source rejected fetch");
        self.rotate_source(sender).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_item_data(
        &mut self,
        sender: &mut NetS,
        peer: P,
        request_seq: u64,
        block: u64,
        total_chunks: u16,
        chunk: u16,
        last_in_batch: bool,
        data: Bytes,
    ) -> Result<(), Error> {
        // Data from anyone but the current source never mutates state.
        let expected_block = match self.state {
            FetchingState::GettingMissingBlocks => None,
            FetchingState::GettingMissingResPages => Some(VBLOCK_ID),
            _ => {
                self.metrics.irrelevant_messages.inc();
                return Ok(());
            }
        };
        {
            let session = self.session.as_ref().expect("fetching without session");
            if session.selector.current() != Some(&peer) || session.request_seq != request_seq {
                self.metrics.irrelevant_messages.inc();
                return Ok(());
            }
            let in_range = match expected_block {
                Some(expected) => block == expected,
                None => block >= session.first_required && block <= session.next_required,
            };
            if !in_range {
                debug!(?peer, block, "chunk outside required range");
                self.metrics.invalid_messages.inc();
                return Ok(());
            }
        }
        if data.len() > self.max_chunk_size {
            warn!(?peer, block, "oversized chunk");
            return self.on_bad_data(sender, block).await;
        }
        if self.assembler.pending_bytes() + data.len() > self.max_pending {
            // The source outran the verifier; push back on it, not on the
            // handoff queue.
            warn!(?peer, "source is too fast");
            return self.rotate_source(sender).await;
        }
        if let Err(err) = self.assembler.insert(block, total_chunks, chunk, data) {
            warn!(?peer, %err, "inconsistent chunk");
            return self.on_bad_data(sender, block).await;
        }
        let now = self.context.current();
        let session = self.session.as_mut().unwrap();
        session.selector.on_good_reply(&peer, now);
        let seq_before = session.request_seq;

        match self.state {
            FetchingState::GettingMissingBlocks => self.process_blocks(sender).await?,
            FetchingState::GettingMissingResPages => self.process_pages(sender).await?,
            _ => unreachable!(),
        }

        // A terminated batch is acknowledged by re-requesting at the
        // current floor (also how the next burst is solicited).
        let still_outstanding = self
            .session
            .as_ref()
            .map(|session| session.request_seq == seq_before)
            .unwrap_or(false);
        if last_in_batch && still_outstanding {
            match self.state {
                FetchingState::GettingMissingBlocks => {
                    self.send_fetch_blocks(sender, false).await?
                }
                FetchingState::GettingMissingResPages => {
                    self.send_fetch_pages(sender, false).await?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Drain fully-assembled blocks downward, verifying the digest chain
    /// and committing progress per block.
    async fn process_blocks(&mut self, sender: &mut NetS) -> Result<(), Error> {
        loop {
            let (next_required, expected) = {
                let session = self.session.as_ref().unwrap();
                (session.next_required, session.next_digest)
            };
            let Some(bytes) = self.assembler.next_full_block(next_required) else {
                return Ok(());
            };
            if bytes.len() > self.max_block_size
                || digest_of_block::<H>(next_required, &bytes) != expected
            {
                warn!(block = next_required, "block digest mismatch");
                return self.on_bad_data(sender, next_required).await;
            }

            // The block is certified; commit it.
            if !self.app.put_block(next_required, bytes.clone()).await {
                return Err(Error::BlockRejected(next_required));
            }
            let now = self.context.current();
            self.throughput.record(now, bytes.len());
            self.metrics.fetched_blocks.inc();
            self.metrics.fetched_bytes.inc_by(bytes.len() as u64);

            let session = self.session.as_mut().unwrap();
            if session.next_required > session.first_required {
                // Chain downward through the predecessor digest embedded
                // in the block just committed.
                let prev = self
                    .app
                    .prev_digest_of_block(session.next_required)
                    .await;
                let Some(prev) = prev else {
                    warn!(block = session.next_required, "block missing chain link");
                    let up_to = session.next_required;
                    return self.on_bad_data(sender, up_to).await;
                };
                session.next_digest = prev;
                session.next_required -= 1;
                let next = session.next_required;
                self.store.set_next_required_block(next);
                self.store.commit().await?;
                continue;
            }

            // The bottom block landed; its embedded predecessor digest
            // must close the chain onto local state.
            let first = session.first_required;
            let embedded = self.app.prev_digest_of_block(first).await.ok_or_else(|| {
                Error::Inconsistency(format!("block {first} missing chain link"))
            })?;
            let local = if first == 1 {
                genesis_digest::<H>()
            } else {
                let below = self.app.get_block(first - 1).await.ok_or_else(|| {
                    Error::Inconsistency(format!("block {} missing", first - 1))
                })?;
                digest_of_block::<H>(first - 1, &below)
            };
            if embedded != local {
                // The certified chain disagrees with blocks we already
                // held; this is not a lying source.
                return Err(Error::Inconsistency(format!(
                    "fetched chain does not close onto block {}",
                    first.saturating_sub(1)
                )));
            }
            self.store.set_next_required_block(first - 1);
            info!(
                first,
                last = session.target.last_block,
                "all missing blocks fetched"
            );
            return self.enter_pages(sender).await;
        }
    }

    /// Verify and apply a fully-assembled virtual block, completing the
    /// session.
    async fn process_pages(&mut self, sender: &mut NetS) -> Result<(), Error> {
        let Some(bytes) = self.assembler.next_full_block(VBLOCK_ID) else {
            return Ok(());
        };
        let target = self.session.as_ref().unwrap().target;
        let vblock = match VBlock::<H::Digest>::decode(bytes) {
            Ok(vblock) => vblock,
            Err(err) => {
                warn!(?err, "undecodable virtual block");
                return self.on_bad_data(sender, VBLOCK_ID).await;
            }
        };

        // Every entry must be internally consistent...
        for entry in &vblock.entries {
            if entry.page >= self.max_pages
                || entry.data.len() > self.page_size
                || entry.checkpoint > target.checkpoint
                || digest_of_page::<H>(entry.page, entry.checkpoint, &entry.data) != entry.digest
            {
                warn!(page = entry.page, "invalid virtual block entry");
                return self.on_bad_data(sender, VBLOCK_ID).await;
            }
        }

        // ...and the merged descriptor must match the certified digest.
        let zeros = vec![0u8; self.page_size];
        let mut entries = vblock.entries.iter().peekable();
        let mut descriptor = Vec::with_capacity(self.max_pages as usize);
        for page in 0..self.max_pages {
            if let Some(entry) = entries.peek() {
                if entry.page == page {
                    let entry = entries.next().unwrap();
                    descriptor.push(PageInfo {
                        page,
                        checkpoint: entry.checkpoint,
                        digest: entry.digest,
                    });
                    continue;
                }
            }
            descriptor.push(match self.store.page_at(page, target.checkpoint) {
                Some(version) => PageInfo {
                    page,
                    checkpoint: version.checkpoint,
                    digest: version.digest,
                },
                None => PageInfo {
                    page,
                    checkpoint: 0,
                    digest: digest_of_page::<H>(page, 0, &zeros),
                },
            });
        }
        if digest_of_pages_descriptor::<H>(&descriptor) != target.digest_of_pages {
            warn!("virtual block does not match certified descriptor");
            return self.on_bad_data(sender, VBLOCK_ID).await;
        }

        // Stage the pages, then associate them with the target in a
        // single commit: the linearization point of the session. A crash
        // between the two commits re-runs this handler idempotently.
        for entry in &vblock.entries {
            self.store.stage_page(
                entry.page,
                PageVersion {
                    checkpoint: entry.checkpoint,
                    digest: entry.digest,
                    data: entry.data.clone(),
                },
            );
        }
        self.store.commit().await?;

        for (page, version) in self.store.staged_pages() {
            self.store.put_page_version(page, version);
        }
        self.store.clear_staged_pages();
        self.store.clear_working_pages();
        self.store.set_checkpoint(&target)?;
        self.store.delete_checkpoints_below(target.checkpoint);
        self.store
            .set_stored_window(target.checkpoint, target.checkpoint);
        self.store.prune_page_versions(target.checkpoint);
        self.store.set_fetching_state(FetchingState::NotFetching);
        self.store.clear_session();
        self.store.commit().await?;

        info!(checkpoint = target.checkpoint, "state transfer complete");
        self.metrics.sessions_completed.inc();
        self.state = FetchingState::NotFetching;
        self.metrics.phase.set(self.phase_index());
        self.session = None;
        self.assembler.clear();
        self.throughput.reset();
        self.vblocks.invalidate_from(0);

        // Completion observers may lag or disappear; never block on them.
        for subscriber in &mut self.subscribers {
            let _ = subscriber.try_send(target.checkpoint);
        }
        self.subscribers.retain(|subscriber| !subscriber.is_closed());
        Ok(())
    }

    // ---------------------------------------------------------------
    // Source role
    // ---------------------------------------------------------------

    /// Whether a peer request should be served now. A fetching replica
    /// has no authoritative state to serve.
    fn can_serve(&mut self, peer: &P) -> bool {
        if self.state != FetchingState::NotFetching {
            return false;
        }
        if self.serve_limiter.check_key(peer).is_err() {
            debug!(?peer, "serve rate limited");
            self.metrics.irrelevant_messages.inc();
            return false;
        }
        true
    }

    async fn serve_summaries(&mut self, sender: &mut NetS, peer: P, min: u64, request_seq: u64) {
        if !self.can_serve(&peer) {
            return;
        }
        let first = self.store.first_stored_checkpoint();
        let last = self.store.last_stored_checkpoint();
        if last == 0 || min > last {
            debug!(?peer, min, "no summaries to serve");
            return;
        }
        // Highest first: the newest checkpoint is the one the requester
        // will adopt.
        for checkpoint in (min.max(first)..=last).rev() {
            let Some(desc) = self.store.checkpoint(checkpoint) else {
                continue;
            };
            let now = self.context.current();
            let message = Message {
                seq: self.seqs.next(now),
                payload: Payload::CheckpointSummary {
                    checkpoint: desc.checkpoint,
                    last_block: desc.last_block,
                    digest_of_last_block: desc.digest_of_last_block,
                    digest_of_pages: desc.digest_of_pages,
                    request_seq,
                },
            };
            Self::transmit(sender, peer.clone(), message).await;
            self.metrics.served_summaries.inc();
        }
    }

    async fn serve_blocks(
        &mut self,
        sender: &mut NetS,
        peer: P,
        min: u64,
        max: u64,
        last_known_chunk: u16,
        request_seq: u64,
    ) {
        if self.state != FetchingState::NotFetching {
            // Redirect the requester quickly rather than letting it time
            // out on us.
            let now = self.context.current();
            let message = Message {
                seq: self.seqs.next(now),
                payload: Payload::<H::Digest>::RejectFetching { request_seq },
            };
            Self::transmit(sender, peer, message).await;
            return;
        }
        if !self.can_serve(&peer) {
            return;
        }
        if min == 0 || min > max || max == VBLOCK_ID {
            debug!(?peer, min, max, "malformed block fetch");
            self.metrics.invalid_messages.inc();
            return;
        }
        if max > self.app.last_reachable_block().await {
            let now = self.context.current();
            let message = Message {
                seq: self.seqs.next(now),
                payload: Payload::<H::Digest>::RejectFetching { request_seq },
            };
            Self::transmit(sender, peer, message).await;
            return;
        }

        // Stream high-to-low so the requester can verify the chain as it
        // goes, up to one burst.
        let mut batch = Vec::with_capacity(self.max_chunks_per_batch);
        'collect: for block in (min..=max).rev() {
            let Some(bytes) = self.app.get_block(block).await else {
                warn!(block, "reachable block missing");
                break;
            };
            let total = chunks_in(bytes.len(), self.max_chunk_size);
            let start = if block == max {
                last_known_chunk.saturating_add(1)
            } else {
                1
            };
            for chunk in start..=total {
                let lo = (chunk - 1) as usize * self.max_chunk_size;
                let hi = (lo + self.max_chunk_size).min(bytes.len());
                batch.push((block, total, chunk, bytes.slice(lo..hi)));
                if batch.len() == self.max_chunks_per_batch {
                    break 'collect;
                }
            }
        }
        let count = batch.len();
        for (index, (block, total, chunk, data)) in batch.into_iter().enumerate() {
            let now = self.context.current();
            let message = Message {
                seq: self.seqs.next(now),
                payload: Payload::ItemData {
                    request_seq,
                    block,
                    total_chunks: total,
                    chunk,
                    last_in_batch: index + 1 == count,
                    data,
                },
            };
            Self::transmit(sender, peer.clone(), message).await;
            self.metrics.served_chunks.inc();
        }
    }

    async fn serve_pages(
        &mut self,
        sender: &mut NetS,
        peer: P,
        last_known: u64,
        required: u64,
        last_known_chunk: u16,
        request_seq: u64,
    ) {
        if !self.can_serve(&peer) {
            return;
        }
        let first = self.store.first_stored_checkpoint();
        let last = self.store.last_stored_checkpoint();
        if required == 0 || required < first || required > last || last_known >= required {
            debug!(?peer, required, last_known, "cannot serve pages");
            let now = self.context.current();
            let message = Message {
                seq: self.seqs.next(now),
                payload: Payload::<H::Digest>::RejectFetching { request_seq },
            };
            Self::transmit(sender, peer, message).await;
            return;
        }

        // Look up or materialize the virtual block.
        let key = (required, last_known);
        let bytes = match self.vblocks.get(&key) {
            Some(bytes) => bytes,
            None => {
                let mut entries = Vec::new();
                for page in 0..self.max_pages {
                    let Some(version) = self.store.page_at(page, required) else {
                        continue;
                    };
                    if version.checkpoint <= last_known {
                        continue;
                    }
                    entries.push(crate::types::VBlockEntry {
                        page,
                        checkpoint: version.checkpoint,
                        digest: version.digest,
                        data: version.data,
                    });
                }
                let bytes: Bytes = VBlock { entries }.encode().into();
                self.vblocks.put(key, bytes.clone());
                self.metrics.built_vblocks.inc();
                bytes
            }
        };

        let total = chunks_in(bytes.len(), self.max_chunk_size);
        let start = last_known_chunk.saturating_add(1);
        let burst = self.max_chunks_per_batch.min(u16::MAX as usize) as u16;
        let end = total.min(last_known_chunk.saturating_add(burst));
        for chunk in start..=end {
            let lo = (chunk - 1) as usize * self.max_chunk_size;
            let hi = (lo + self.max_chunk_size).min(bytes.len());
            let now = self.context.current();
            let message = Message {
                seq: self.seqs.next(now),
                payload: Payload::ItemData {
                    request_seq,
                    block: VBLOCK_ID,
                    total_chunks: total,
                    chunk,
                    last_in_batch: chunk == end,
                    data: bytes.slice(lo..hi),
                },
            };
            Self::transmit(sender, peer.clone(), message).await;
            self.metrics.served_chunks.inc();
        }
    }
}

/// Number of chunks needed for `len` bytes (an empty item still occupies
/// one chunk).
fn chunks_in(len: usize, chunk_size: usize) -> u16 {
    len.div_ceil(chunk_size).max(1) as u16
}
