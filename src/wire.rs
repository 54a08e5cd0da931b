//! Messages exchanged between replicas during state transfer.

use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error, Read, ReadExt, Write};
use commonware_cryptography::Digest;

/// Represents a message sent between replicas.
///
/// Sender identity is bound by the authenticated transport and is not
/// repeated in-band. `seq` is per-sender monotonic and not cryptographic;
/// replay is prevented by monotonic acceptance at the receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message<D: Digest> {
    /// Per-sender sequence number. Responses echo the sequence number of
    /// the request they answer in their payload.
    pub seq: u64,

    /// Payload is the protocol content of the message.
    pub payload: Payload<D>,
}

impl<D: Digest> Write for Message<D> {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.seq);
        self.payload.write(buf);
    }
}

impl<D: Digest> EncodeSize for Message<D> {
    fn encode_size(&self) -> usize {
        8 + self.payload.encode_size()
    }
}

impl<D: Digest> Read for Message<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        let seq = u64::read(buf)?;
        let payload = Payload::read(buf)?;
        Ok(Self { seq, payload })
    }
}

/// Represents the contents of a message sent between replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload<D: Digest> {
    /// Ask every peer for summaries of checkpoints at or above
    /// `min_relevant_checkpoint`.
    AskForCheckpointSummaries { min_relevant_checkpoint: u64 },

    /// A source's attestation of a stored checkpoint.
    CheckpointSummary {
        checkpoint: u64,
        last_block: u64,
        digest_of_last_block: D,
        digest_of_pages: D,
        /// Sequence number of the ask being answered.
        request_seq: u64,
    },

    /// Request blocks `[min_block, max_block]` from the current source.
    FetchBlocks {
        min_block: u64,
        max_block: u64,
        /// Highest chunk of `max_block` already held (0 if none), so a
        /// source resumes mid-block.
        last_known_chunk: u16,
    },

    /// Request the reserved-pages virtual block advancing us from
    /// `last_known_checkpoint` to `required_checkpoint`.
    FetchResPages {
        last_known_checkpoint: u64,
        required_checkpoint: u64,
        last_known_chunk: u16,
    },

    /// The source cannot serve the request (e.g. blocks beyond its
    /// reachable tip). Lets the requester move on faster than a timeout.
    RejectFetching { request_seq: u64 },

    /// One chunk of a block (or of the virtual block, under
    /// [crate::types::VBLOCK_ID]).
    ItemData {
        request_seq: u64,
        block: u64,
        total_chunks: u16,
        chunk: u16,
        last_in_batch: bool,
        data: Bytes,
    },
}

impl<D: Digest> Payload<D> {
    /// Human-readable name for logging and metrics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::AskForCheckpointSummaries { .. } => "AskForCheckpointSummaries",
            Self::CheckpointSummary { .. } => "CheckpointSummary",
            Self::FetchBlocks { .. } => "FetchBlocks",
            Self::FetchResPages { .. } => "FetchResPages",
            Self::RejectFetching { .. } => "RejectFetching",
            Self::ItemData { .. } => "ItemData",
        }
    }
}

impl<D: Digest> Write for Payload<D> {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::AskForCheckpointSummaries {
                min_relevant_checkpoint,
            } => {
                buf.put_u8(0);
                buf.put_u64(*min_relevant_checkpoint);
            }
            Self::CheckpointSummary {
                checkpoint,
                last_block,
                digest_of_last_block,
                digest_of_pages,
                request_seq,
            } => {
                buf.put_u8(1);
                buf.put_u64(*checkpoint);
                buf.put_u64(*last_block);
                digest_of_last_block.write(buf);
                digest_of_pages.write(buf);
                buf.put_u64(*request_seq);
            }
            Self::FetchBlocks {
                min_block,
                max_block,
                last_known_chunk,
            } => {
                buf.put_u8(2);
                buf.put_u64(*min_block);
                buf.put_u64(*max_block);
                buf.put_u16(*last_known_chunk);
            }
            Self::FetchResPages {
                last_known_checkpoint,
                required_checkpoint,
                last_known_chunk,
            } => {
                buf.put_u8(3);
                buf.put_u64(*last_known_checkpoint);
                buf.put_u64(*required_checkpoint);
                buf.put_u16(*last_known_chunk);
            }
            Self::RejectFetching { request_seq } => {
                buf.put_u8(4);
                buf.put_u64(*request_seq);
            }
            Self::ItemData {
                request_seq,
                block,
                total_chunks,
                chunk,
                last_in_batch,
                data,
            } => {
                buf.put_u8(5);
                buf.put_u64(*request_seq);
                buf.put_u64(*block);
                buf.put_u16(*total_chunks);
                buf.put_u16(*chunk);
                buf.put_u8(u8::from(*last_in_batch));
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
        }
    }
}

impl<D: Digest> EncodeSize for Payload<D> {
    fn encode_size(&self) -> usize {
        1 + match self {
            Self::AskForCheckpointSummaries { .. } => 8,
            Self::CheckpointSummary {
                digest_of_last_block,
                digest_of_pages,
                ..
            } => 8 + 8 + digest_of_last_block.encode_size() + digest_of_pages.encode_size() + 8,
            Self::FetchBlocks { .. } => 8 + 8 + 2,
            Self::FetchResPages { .. } => 8 + 8 + 2,
            Self::RejectFetching { .. } => 8,
            Self::ItemData { data, .. } => 8 + 8 + 2 + 2 + 1 + 4 + data.len(),
        }
    }
}

impl<D: Digest> Read for Payload<D> {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        match u8::read(buf)? {
            0 => {
                let min_relevant_checkpoint = u64::read(buf)?;
                Ok(Self::AskForCheckpointSummaries {
                    min_relevant_checkpoint,
                })
            }
            1 => {
                let checkpoint = u64::read(buf)?;
                let last_block = u64::read(buf)?;
                let digest_of_last_block = D::read(buf)?;
                let digest_of_pages = D::read(buf)?;
                let request_seq = u64::read(buf)?;
                Ok(Self::CheckpointSummary {
                    checkpoint,
                    last_block,
                    digest_of_last_block,
                    digest_of_pages,
                    request_seq,
                })
            }
            2 => {
                let min_block = u64::read(buf)?;
                let max_block = u64::read(buf)?;
                let last_known_chunk = u16::read(buf)?;
                Ok(Self::FetchBlocks {
                    min_block,
                    max_block,
                    last_known_chunk,
                })
            }
            3 => {
                let last_known_checkpoint = u64::read(buf)?;
                let required_checkpoint = u64::read(buf)?;
                let last_known_chunk = u16::read(buf)?;
                Ok(Self::FetchResPages {
                    last_known_checkpoint,
                    required_checkpoint,
                    last_known_chunk,
                })
            }
            4 => {
                let request_seq = u64::read(buf)?;
                Ok(Self::RejectFetching { request_seq })
            }
            5 => {
                let request_seq = u64::read(buf)?;
                let block = u64::read(buf)?;
                let total_chunks = u16::read(buf)?;
                let chunk = u16::read(buf)?;
                let last_in_batch = match u8::read(buf)? {
                    0 => false,
                    1 => true,
                    _ => return Err(Error::Invalid("ItemData", "invalid flag")),
                };
                let len = u32::read(buf)? as usize;
                // The transport already bounds message size; a length
                // beyond the buffer fails without allocating.
                if buf.remaining() < len {
                    return Err(Error::EndOfBuffer);
                }
                let data = buf.copy_to_bytes(len);
                Ok(Self::ItemData {
                    request_seq,
                    block,
                    total_chunks,
                    chunk,
                    last_in_batch,
                    data,
                })
            }
            _ => Err(Error::Invalid("Payload", "invalid payload type")),
        }
    }
}
