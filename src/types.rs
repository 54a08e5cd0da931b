//! Core types shared by the wire format, the durable store, and the engine.

use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};
use commonware_cryptography::{Digest, Hasher};

/// Pseudo-block number used when streaming a reserved-pages virtual block.
///
/// Never collides with a real block number: the configuration rejects
/// applications claiming `u64::MAX` blocks.
pub const VBLOCK_ID: u64 = u64::MAX;

/// The predecessor digest of block 1 (there is no block 0).
pub fn genesis_digest<H: Hasher>() -> H::Digest {
    let mut hasher = H::new();
    hasher.finalize()
}

/// Compute the digest binding block `number` to its contents.
pub fn digest_of_block<H: Hasher>(number: u64, block: &[u8]) -> H::Digest {
    let mut hasher = H::new();
    hasher.update(&number.to_be_bytes());
    hasher.update(block);
    hasher.finalize()
}

/// Compute the digest of a reserved page as written at `checkpoint`.
pub fn digest_of_page<H: Hasher>(page: u32, checkpoint: u64, data: &[u8]) -> H::Digest {
    let mut hasher = H::new();
    hasher.update(&page.to_be_bytes());
    hasher.update(&checkpoint.to_be_bytes());
    hasher.update(data);
    hasher.finalize()
}

/// Compute the digest of an ordered reserved-pages descriptor.
///
/// The descriptor must be sorted by page id; every replica derives the
/// same digest for the same page state regardless of write order.
pub fn digest_of_pages_descriptor<H: Hasher>(descriptor: &[PageInfo<H::Digest>]) -> H::Digest {
    let mut hasher = H::new();
    for entry in descriptor {
        hasher.update(&entry.page.to_be_bytes());
        hasher.update(&entry.checkpoint.to_be_bytes());
        hasher.update(entry.digest.as_ref());
    }
    hasher.finalize()
}

/// One entry of a reserved-pages descriptor: the page, the checkpoint that
/// last wrote it, and the digest of its contents at that write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInfo<D: Digest> {
    pub page: u32,
    pub checkpoint: u64,
    pub digest: D,
}

impl<D: Digest> Write for PageInfo<D> {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.page);
        buf.put_u64(self.checkpoint);
        self.digest.write(buf);
    }
}

impl<D: Digest> EncodeSize for PageInfo<D> {
    fn encode_size(&self) -> usize {
        4 + 8 + self.digest.encode_size()
    }
}

impl<D: Digest> Read for PageInfo<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let page = u32::read(buf)?;
        let checkpoint = u64::read(buf)?;
        let digest = D::read(buf)?;
        Ok(Self {
            page,
            checkpoint,
            digest,
        })
    }
}

/// Durable description of a replicated snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointDesc<D: Digest> {
    /// The checkpoint number.
    pub checkpoint: u64,
    /// The last application block covered by the checkpoint.
    pub last_block: u64,
    /// Digest of `last_block` (the tip of the certified chain).
    pub digest_of_last_block: D,
    /// Digest of the reserved-pages descriptor at the checkpoint.
    pub digest_of_pages: D,
}

impl<D: Digest> Write for CheckpointDesc<D> {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.checkpoint);
        buf.put_u64(self.last_block);
        self.digest_of_last_block.write(buf);
        self.digest_of_pages.write(buf);
    }
}

impl<D: Digest> EncodeSize for CheckpointDesc<D> {
    fn encode_size(&self) -> usize {
        8 + 8 + self.digest_of_last_block.encode_size() + self.digest_of_pages.encode_size()
    }
}

impl<D: Digest> Read for CheckpointDesc<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let checkpoint = u64::read(buf)?;
        let last_block = u64::read(buf)?;
        let digest_of_last_block = D::read(buf)?;
        let digest_of_pages = D::read(buf)?;
        Ok(Self {
            checkpoint,
            last_block,
            digest_of_last_block,
            digest_of_pages,
        })
    }
}

/// One reserved page as transferred in a virtual block: the page contents
/// a requester needs to advance to the target checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VBlockEntry<D: Digest> {
    pub page: u32,
    pub checkpoint: u64,
    pub digest: D,
    pub data: Bytes,
}

impl<D: Digest> Write for VBlockEntry<D> {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.page);
        buf.put_u64(self.checkpoint);
        self.digest.write(buf);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }
}

impl<D: Digest> EncodeSize for VBlockEntry<D> {
    fn encode_size(&self) -> usize {
        4 + 8 + self.digest.encode_size() + 4 + self.data.len()
    }
}

impl<D: Digest> Read for VBlockEntry<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let page = u32::read(buf)?;
        let checkpoint = u64::read(buf)?;
        let digest = D::read(buf)?;
        let len = u32::read(buf)? as usize;
        if buf.remaining() < len {
            return Err(Error::EndOfBuffer);
        }
        let data = buf.copy_to_bytes(len);
        Ok(Self {
            page,
            checkpoint,
            digest,
            data,
        })
    }
}

/// A virtual block: the serialized reserved-pages delta advancing a
/// requester from its last known checkpoint to the target checkpoint.
///
/// Entries are sorted by page id.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct VBlock<D: Digest> {
    pub entries: Vec<VBlockEntry<D>>,
}

impl<D: Digest> Write for VBlock<D> {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.entries.len() as u32);
        for entry in &self.entries {
            entry.write(buf);
        }
    }
}

impl<D: Digest> EncodeSize for VBlock<D> {
    fn encode_size(&self) -> usize {
        4 + self
            .entries
            .iter()
            .map(EncodeSize::encode_size)
            .sum::<usize>()
    }
}

impl<D: Digest> Read for VBlock<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let count = u32::read(buf)? as usize;
        let mut entries = Vec::new();
        let mut last: Option<u32> = None;
        for _ in 0..count {
            // Each entry occupies at least its fixed header, so `count`
            // cannot force an allocation beyond the buffer size.
            let entry = VBlockEntry::<D>::read(buf)?;
            if let Some(last) = last {
                if entry.page <= last {
                    return Err(Error::Invalid("VBlock", "unsorted pages"));
                }
            }
            last = Some(entry.page);
            entries.push(entry);
        }
        Ok(Self { entries })
    }
}

/// The durable phase of the catch-up state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchingState {
    /// Not transferring; the source role is active.
    NotFetching,
    /// Broadcasting for checkpoint summaries and collecting certificates.
    GettingCheckpointSummaries,
    /// Fetching missing blocks, highest first.
    GettingMissingBlocks,
    /// Fetching the reserved-pages virtual block.
    GettingMissingResPages,
}

impl Write for FetchingState {
    fn write(&self, buf: &mut impl BufMut) {
        let tag: u8 = match self {
            Self::NotFetching => 0,
            Self::GettingCheckpointSummaries => 1,
            Self::GettingMissingBlocks => 2,
            Self::GettingMissingResPages => 3,
        };
        buf.put_u8(tag);
    }
}

impl EncodeSize for FetchingState {
    fn encode_size(&self) -> usize {
        1
    }
}

impl Read for FetchingState {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        match u8::read(buf)? {
            0 => Ok(Self::NotFetching),
            1 => Ok(Self::GettingCheckpointSummaries),
            2 => Ok(Self::GettingMissingBlocks),
            3 => Ok(Self::GettingMissingResPages),
            _ => Err(Error::Invalid("FetchingState", "invalid tag")),
        }
    }
}

/// A point-in-time view of the engine, for operators.
#[derive(Clone, Debug)]
pub struct Status<D: Digest> {
    /// Current phase.
    pub state: FetchingState,
    /// Last stored checkpoint (0 if none).
    pub last_stored_checkpoint: u64,
    /// Target checkpoint of the in-flight session, if any.
    pub target: Option<CheckpointDesc<D>>,
    /// Lowest block the session must fetch.
    pub first_required_block: u64,
    /// Next block the session will verify (fetching proceeds downward).
    pub next_required_block: u64,
    /// Bytes of chunks awaiting reassembly.
    pub pending_bytes: usize,
    /// Peers currently eligible to serve the session.
    pub preferred_sources: usize,
    /// Blocks committed per second over the stats window.
    pub blocks_per_second: f64,
    /// Bytes committed per second over the stats window.
    pub bytes_per_second: f64,
}
