//! Durable state backing the engine across crash-restart.
//!
//! All persistence goes through a single
//! [commonware_storage::metadata::Metadata] partition: mutations stage in
//! memory and [Store::commit] flushes them as one atomic, CRC-protected
//! write. A crash before commit discards the staged group, which is the
//! transaction contract the protocol relies on (e.g. the reserved-pages
//! association at session completion is a single commit).
//!
//! The `u64` key space is carved with a tag in the top byte:
//!
//! ```text
//! 0x00 | field      control fields (fetching state, cursors, window)
//! 0x01 | checkpoint stored checkpoint descriptors
//! 0x02 | page       page versions (ascending by checkpoint)
//! 0x03 | page       pages staged during GettingMissingResPages
//! 0x04 | page       working copies written since the last checkpoint
//! ```

use crate::types::{CheckpointDesc, FetchingState};
use crate::Error;
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{DecodeExt, EncodeSize, Error as CodecError, Read, ReadExt, Write};
use commonware_cryptography::Digest;
use commonware_runtime::{Clock, Metrics, Storage};
use commonware_storage::metadata::{Config as MetadataConfig, Metadata};
use commonware_utils::sequence::U64;
use std::marker::PhantomData;
use tracing::warn;

const TAG_CONTROL: u64 = 0x00u64 << 56;
const TAG_CHECKPOINT: u64 = 0x01u64 << 56;
const TAG_PAGE: u64 = 0x02u64 << 56;
const TAG_STAGED: u64 = 0x03u64 << 56;
const TAG_WORKING: u64 = 0x04u64 << 56;

const FIELD_FETCHING_STATE: u64 = 0;
const FIELD_TARGET: u64 = 1;
const FIELD_FIRST_REQUIRED: u64 = 2;
const FIELD_NEXT_REQUIRED: u64 = 3;
const FIELD_FIRST_STORED: u64 = 4;
const FIELD_LAST_STORED: u64 = 5;
const FIELD_ERASE: u64 = 6;
const FIELD_LAST_STABLE: u64 = 7;

fn control(field: u64) -> U64 {
    U64::new(TAG_CONTROL | field)
}

fn checkpoint_key(checkpoint: u64) -> U64 {
    U64::new(TAG_CHECKPOINT | checkpoint)
}

fn page_key(tag: u64, page: u32) -> U64 {
    U64::new(tag | page as u64)
}

fn encode<T: Write + EncodeSize>(value: &T) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.encode_size());
    value.write(&mut buf);
    buf
}

/// One version of a reserved page: its contents as last written at
/// `checkpoint`, and the digest binding the two.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageVersion<D: Digest> {
    pub checkpoint: u64,
    pub digest: D,
    pub data: Bytes,
}

impl<D: Digest> Write for PageVersion<D> {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.checkpoint);
        self.digest.write(buf);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }
}

impl<D: Digest> EncodeSize for PageVersion<D> {
    fn encode_size(&self) -> usize {
        8 + self.digest.encode_size() + 4 + self.data.len()
    }
}

impl<D: Digest> Read for PageVersion<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let checkpoint = u64::read(buf)?;
        let digest = D::read(buf)?;
        let len = u32::read(buf)? as usize;
        if buf.remaining() < len {
            return Err(CodecError::EndOfBuffer);
        }
        let data = buf.copy_to_bytes(len);
        Ok(Self {
            checkpoint,
            digest,
            data,
        })
    }
}

/// Retained versions of one page, ascending by checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct PageVersions<D: Digest>(Vec<PageVersion<D>>);

impl<D: Digest> Write for PageVersions<D> {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.0.len() as u32);
        for version in &self.0 {
            version.write(buf);
        }
    }
}

impl<D: Digest> EncodeSize for PageVersions<D> {
    fn encode_size(&self) -> usize {
        4 + self.0.iter().map(EncodeSize::encode_size).sum::<usize>()
    }
}

impl<D: Digest> Read for PageVersions<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let count = u32::read(buf)? as usize;
        let mut versions = Vec::new();
        for _ in 0..count {
            versions.push(PageVersion::read(buf)?);
        }
        Ok(Self(versions))
    }
}

/// The engine's durable store.
pub struct Store<E: Storage + Metrics + Clock, D: Digest> {
    metadata: Metadata<E, U64, Vec<u8>>,
    max_pages: u32,
    _digest: PhantomData<D>,
}

impl<E: Storage + Metrics + Clock, D: Digest> Store<E, D> {
    /// Open (or create) the store in `partition`.
    ///
    /// If a previous run requested an erase, the partition is destroyed
    /// and recreated empty before returning.
    pub async fn init(context: E, partition: String, max_pages: u32) -> Result<Self, Error> {
        let cfg = MetadataConfig {
            partition: partition.clone(),
            codec_config: ((0..).into(), ()),
        };
        let mut metadata = Metadata::init(context.clone(), cfg.clone()).await?;
        if metadata.get(&control(FIELD_ERASE)).is_some() {
            warn!(partition, "erase flag set, wiping store");
            metadata.destroy().await?;
            metadata = Metadata::init(context, cfg).await?;
        }
        Ok(Self {
            metadata,
            max_pages,
            _digest: PhantomData,
        })
    }

    fn get<T: Read<Cfg = ()>>(&self, key: &U64) -> Option<T> {
        let value = self.metadata.get(key)?;
        match T::decode(value.as_slice()) {
            Ok(value) => Some(value),
            Err(err) => {
                // A committed value that fails to decode is corruption the
                // CRC cannot catch; surface it loudly and treat as absent.
                warn!(?err, "undecodable store value");
                None
            }
        }
    }

    fn get_u64(&self, field: u64) -> Option<u64> {
        self.get::<u64>(&control(field))
    }

    fn put_u64(&mut self, field: u64, value: u64) {
        self.metadata.put(control(field), encode(&value));
    }

    /// Current durable phase.
    pub fn fetching_state(&self) -> FetchingState {
        self.get(&control(FIELD_FETCHING_STATE))
            .unwrap_or(FetchingState::NotFetching)
    }

    /// Stage the durable phase.
    pub fn set_fetching_state(&mut self, state: FetchingState) {
        self.metadata.put(control(FIELD_FETCHING_STATE), encode(&state));
    }

    /// The checkpoint being fetched, present iff a session is in flight.
    pub fn target(&self) -> Option<CheckpointDesc<D>> {
        self.get(&control(FIELD_TARGET))
    }

    /// Stage the target descriptor of a new session.
    pub fn set_target(&mut self, desc: &CheckpointDesc<D>) {
        self.metadata.put(control(FIELD_TARGET), encode(desc));
    }

    /// Stage removal of the session cursors (session completion or reset).
    pub fn clear_session(&mut self) {
        self.metadata.remove(&control(FIELD_TARGET));
        self.metadata.remove(&control(FIELD_FIRST_REQUIRED));
        self.metadata.remove(&control(FIELD_NEXT_REQUIRED));
    }

    /// Lowest block the session must fetch.
    pub fn first_required_block(&self) -> Option<u64> {
        self.get_u64(FIELD_FIRST_REQUIRED)
    }

    /// Stage the session's lower block cursor.
    pub fn set_first_required_block(&mut self, block: u64) {
        self.put_u64(FIELD_FIRST_REQUIRED, block);
    }

    /// Next block the session will verify.
    pub fn next_required_block(&self) -> Option<u64> {
        self.get_u64(FIELD_NEXT_REQUIRED)
    }

    /// Stage the session's verification cursor.
    pub fn set_next_required_block(&mut self, block: u64) {
        self.put_u64(FIELD_NEXT_REQUIRED, block);
    }

    /// Oldest stored checkpoint (0 if none).
    pub fn first_stored_checkpoint(&self) -> u64 {
        self.get_u64(FIELD_FIRST_STORED).unwrap_or(0)
    }

    /// Newest stored checkpoint (0 if none).
    pub fn last_stored_checkpoint(&self) -> u64 {
        self.get_u64(FIELD_LAST_STORED).unwrap_or(0)
    }

    /// Stage the stored-checkpoint window bounds.
    pub fn set_stored_window(&mut self, first: u64, last: u64) {
        self.put_u64(FIELD_FIRST_STORED, first);
        self.put_u64(FIELD_LAST_STORED, last);
    }

    /// Newest checkpoint marked stable by the consensus layer (0 if
    /// none).
    pub fn last_stable_checkpoint(&self) -> u64 {
        self.get_u64(FIELD_LAST_STABLE).unwrap_or(0)
    }

    /// Stage the stability mark.
    pub fn set_last_stable_checkpoint(&mut self, checkpoint: u64) {
        self.put_u64(FIELD_LAST_STABLE, checkpoint);
    }

    /// Read a stored checkpoint descriptor.
    pub fn checkpoint(&self, checkpoint: u64) -> Option<CheckpointDesc<D>> {
        self.get(&checkpoint_key(checkpoint))
    }

    /// Stage a checkpoint descriptor. Overwriting an existing checkpoint
    /// with different content is rejected.
    pub fn set_checkpoint(&mut self, desc: &CheckpointDesc<D>) -> Result<(), Error> {
        if let Some(existing) = self.checkpoint(desc.checkpoint) {
            if existing != *desc {
                return Err(Error::ConflictingCheckpoint(desc.checkpoint));
            }
            return Ok(());
        }
        self.metadata.put(checkpoint_key(desc.checkpoint), encode(desc));
        Ok(())
    }

    /// Stage removal of every checkpoint descriptor strictly below
    /// `checkpoint`, returning the new window floor.
    pub fn delete_checkpoints_below(&mut self, checkpoint: u64) {
        let first = self.first_stored_checkpoint();
        if first == 0 {
            return;
        }
        for old in first..checkpoint.min(self.last_stored_checkpoint() + 1) {
            self.metadata.remove(&checkpoint_key(old));
        }
    }

    /// All retained versions of `page`, ascending by checkpoint.
    pub fn page_versions(&self, page: u32) -> Vec<PageVersion<D>> {
        self.get::<PageVersions<D>>(&page_key(TAG_PAGE, page))
            .map(|versions| versions.0)
            .unwrap_or_default()
    }

    /// Newest version of `page` written at or before `checkpoint`.
    pub fn page_at(&self, page: u32, checkpoint: u64) -> Option<PageVersion<D>> {
        self.page_versions(page)
            .into_iter()
            .rev()
            .find(|version| version.checkpoint <= checkpoint)
    }

    /// Stage a new version of `page`. Versions must arrive in checkpoint
    /// order; re-staging an existing checkpoint replaces it.
    pub fn put_page_version(&mut self, page: u32, version: PageVersion<D>) {
        let mut versions = self.page_versions(page);
        versions.retain(|existing| existing.checkpoint != version.checkpoint);
        let at = versions
            .iter()
            .position(|existing| existing.checkpoint > version.checkpoint)
            .unwrap_or(versions.len());
        versions.insert(at, version);
        self.metadata
            .put(page_key(TAG_PAGE, page), encode(&PageVersions(versions)));
    }

    /// Stage pruning of page versions: for each page keep versions at or
    /// above `floor` plus the newest one below it (the base state every
    /// retained checkpoint builds on).
    pub fn prune_page_versions(&mut self, floor: u64) {
        for page in 0..self.max_pages {
            let versions = self.page_versions(page);
            if versions.is_empty() {
                continue;
            }
            let base = versions
                .iter()
                .rev()
                .find(|version| version.checkpoint < floor)
                .cloned();
            let mut kept: Vec<_> = versions
                .into_iter()
                .filter(|version| version.checkpoint >= floor)
                .collect();
            if let Some(base) = base {
                kept.insert(0, base);
            }
            self.metadata
                .put(page_key(TAG_PAGE, page), encode(&PageVersions(kept)));
        }
    }

    /// Stage a page received in a virtual block, not yet associated with
    /// the target checkpoint.
    pub fn stage_page(&mut self, page: u32, version: PageVersion<D>) {
        self.metadata.put(page_key(TAG_STAGED, page), encode(&version));
    }

    /// All staged pages.
    pub fn staged_pages(&self) -> Vec<(u32, PageVersion<D>)> {
        (0..self.max_pages)
            .filter_map(|page| {
                self.get::<PageVersion<D>>(&page_key(TAG_STAGED, page))
                    .map(|version| (page, version))
            })
            .collect()
    }

    /// Stage removal of all staged pages.
    pub fn clear_staged_pages(&mut self) {
        for page in 0..self.max_pages {
            self.metadata.remove(&page_key(TAG_STAGED, page));
        }
    }

    /// The working (post-checkpoint) copy of `page`, if written.
    pub fn working_page(&self, page: u32) -> Option<Bytes> {
        self.metadata
            .get(&page_key(TAG_WORKING, page))
            .map(|data| Bytes::from(data.clone()))
    }

    /// Stage a working copy of `page`.
    pub fn set_working_page(&mut self, page: u32, data: &[u8]) {
        self.metadata.put(page_key(TAG_WORKING, page), data.to_vec());
    }

    /// Page ids with a working copy.
    pub fn working_pages(&self) -> Vec<u32> {
        (0..self.max_pages)
            .filter(|page| self.metadata.get(&page_key(TAG_WORKING, *page)).is_some())
            .collect()
    }

    /// Stage removal of all working copies (they are superseded by
    /// checkpointed or transferred versions).
    pub fn clear_working_pages(&mut self) {
        for page in 0..self.max_pages {
            self.metadata.remove(&page_key(TAG_WORKING, page));
        }
    }

    /// Stage the erase flag: the next [Store::init] wipes the partition.
    pub fn set_erase_flag(&mut self) {
        self.metadata.put(control(FIELD_ERASE), encode(&1u64));
    }

    /// Atomically persist all staged mutations.
    pub async fn commit(&mut self) -> Result<(), Error> {
        self.metadata.sync().await?;
        Ok(())
    }

    /// Persist and close the underlying partition.
    pub async fn close(self) -> Result<(), Error> {
        self.metadata.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::digest_of_page;
    use commonware_cryptography::{sha256, Sha256};
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};

    type TestStore = Store<deterministic::Context, sha256::Digest>;

    fn desc(checkpoint: u64) -> CheckpointDesc<sha256::Digest> {
        CheckpointDesc {
            checkpoint,
            last_block: checkpoint * 100,
            digest_of_last_block: sha256::hash(&checkpoint.to_be_bytes()),
            digest_of_pages: sha256::hash(b"pages"),
        }
    }

    fn version(checkpoint: u64, data: &'static [u8]) -> PageVersion<sha256::Digest> {
        PageVersion {
            checkpoint,
            digest: digest_of_page::<Sha256>(0, checkpoint, data),
            data: Bytes::from_static(data),
        }
    }

    #[test_traced]
    fn test_control_roundtrip() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut store = TestStore::init(context.clone(), "test".into(), 4)
                .await
                .unwrap();
            assert_eq!(store.fetching_state(), FetchingState::NotFetching);
            assert!(store.target().is_none());

            store.set_fetching_state(FetchingState::GettingMissingBlocks);
            store.set_target(&desc(5));
            store.set_first_required_block(1);
            store.set_next_required_block(500);
            store.commit().await.unwrap();
            store.close().await.unwrap();

            let store = TestStore::init(context, "test".into(), 4).await.unwrap();
            assert_eq!(
                store.fetching_state(),
                FetchingState::GettingMissingBlocks
            );
            assert_eq!(store.target().unwrap(), desc(5));
            assert_eq!(store.first_required_block(), Some(1));
            assert_eq!(store.next_required_block(), Some(500));
        });
    }

    #[test_traced]
    fn test_uncommitted_writes_discarded() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut store = TestStore::init(context.clone(), "test".into(), 4)
                .await
                .unwrap();
            store.set_fetching_state(FetchingState::GettingCheckpointSummaries);
            store.commit().await.unwrap();

            // Stage a phase change and "crash" without committing.
            store.set_fetching_state(FetchingState::GettingMissingResPages);
            store.set_target(&desc(9));
            drop(store);

            let store = TestStore::init(context, "test".into(), 4).await.unwrap();
            assert_eq!(
                store.fetching_state(),
                FetchingState::GettingCheckpointSummaries
            );
            assert!(store.target().is_none());
        });
    }

    #[test_traced]
    fn test_checkpoint_window() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut store = TestStore::init(context, "test".into(), 4).await.unwrap();
            for checkpoint in 1..=3 {
                store.set_checkpoint(&desc(checkpoint)).unwrap();
            }
            store.set_stored_window(1, 3);

            // Identical overwrite is fine, conflicting is not.
            store.set_checkpoint(&desc(2)).unwrap();
            let mut conflicting = desc(2);
            conflicting.last_block += 1;
            assert!(matches!(
                store.set_checkpoint(&conflicting),
                Err(Error::ConflictingCheckpoint(2))
            ));

            store.delete_checkpoints_below(3);
            store.set_stored_window(3, 3);
            store.commit().await.unwrap();
            assert!(store.checkpoint(1).is_none());
            assert!(store.checkpoint(2).is_none());
            assert_eq!(store.checkpoint(3).unwrap(), desc(3));
        });
    }

    #[test_traced]
    fn test_page_versions() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut store = TestStore::init(context, "test".into(), 4).await.unwrap();
            store.put_page_version(0, version(3, b"three"));
            store.put_page_version(0, version(1, b"one"));
            store.put_page_version(0, version(5, b"five"));

            let versions = store.page_versions(0);
            let checkpoints: Vec<_> = versions.iter().map(|v| v.checkpoint).collect();
            assert_eq!(checkpoints, [1, 3, 5]);

            assert_eq!(store.page_at(0, 4).unwrap().checkpoint, 3);
            assert_eq!(store.page_at(0, 5).unwrap().checkpoint, 5);
            assert!(store.page_at(1, 5).is_none());

            // Pruning keeps the base version below the floor.
            store.prune_page_versions(4);
            let checkpoints: Vec<_> = store
                .page_versions(0)
                .iter()
                .map(|v| v.checkpoint)
                .collect();
            assert_eq!(checkpoints, [3, 5]);
        });
    }

    #[test_traced]
    fn test_staged_and_working_pages() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut store = TestStore::init(context, "test".into(), 4).await.unwrap();
            store.stage_page(2, version(5, b"staged"));
            assert_eq!(store.staged_pages().len(), 1);
            store.clear_staged_pages();
            assert!(store.staged_pages().is_empty());

            store.set_working_page(1, b"working");
            assert_eq!(store.working_page(1).unwrap(), Bytes::from_static(b"working"));
            assert_eq!(store.working_pages(), [1]);
            store.clear_working_pages();
            assert!(store.working_page(1).is_none());
        });
    }

    #[test_traced]
    fn test_erase_flag_wipes_on_init() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let mut store = TestStore::init(context.clone(), "test".into(), 4)
                .await
                .unwrap();
            store.set_checkpoint(&desc(1)).unwrap();
            store.set_stored_window(1, 1);
            store.set_erase_flag();
            store.commit().await.unwrap();
            store.close().await.unwrap();

            let store = TestStore::init(context, "test".into(), 4).await.unwrap();
            assert!(store.checkpoint(1).is_none());
            assert_eq!(store.last_stored_checkpoint(), 0);
        });
    }
}
