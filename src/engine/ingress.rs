//! Commands the application layer sends to the engine.

use crate::types::Status;
use crate::Error;
use bytes::Bytes;
use commonware_cryptography::Digest;
use futures::channel::{mpsc, oneshot};
use futures::SinkExt;

/// Messages that can be sent to the engine actor.
pub enum Message<D: Digest> {
    /// Begin catching up to the replica set's latest checkpoint.
    StartCollecting,
    /// Whether a catch-up session is in flight.
    IsCollecting {
        responder: oneshot::Sender<bool>,
    },
    /// Snapshot the current reserved pages and block tip as `checkpoint`.
    CreateCheckpoint {
        checkpoint: u64,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    /// Record that `checkpoint` is stable; older blocks may be pruned.
    MarkStable {
        checkpoint: u64,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    /// Digest identifying a stored checkpoint.
    DigestOfCheckpoint {
        checkpoint: u64,
        responder: oneshot::Sender<Option<D>>,
    },
    /// Read a reserved page (zeroes if never written).
    LoadPage {
        page: u32,
        responder: oneshot::Sender<Result<Bytes, Error>>,
    },
    /// Write a reserved page.
    SavePage {
        page: u32,
        data: Bytes,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    /// Zero a reserved page.
    ZeroPage {
        page: u32,
        responder: oneshot::Sender<Result<(), Error>>,
    },
    /// Subscribe to transfer completions (the completed checkpoint number
    /// is delivered on the returned channel).
    Subscribe {
        responder: oneshot::Sender<mpsc::Receiver<u64>>,
    },
    /// Wipe the durable store at next init.
    SetEraseFlag {
        responder: oneshot::Sender<Result<(), Error>>,
    },
    /// A point-in-time view of the engine.
    Status {
        responder: oneshot::Sender<Status<D>>,
    },
}

/// A way to send commands to the engine actor.
#[derive(Clone)]
pub struct Mailbox<D: Digest> {
    sender: mpsc::Sender<Message<D>>,
}

impl<D: Digest> Mailbox<D> {
    pub(super) const fn new(sender: mpsc::Sender<Message<D>>) -> Self {
        Self { sender }
    }

    async fn send(&mut self, message: Message<D>) {
        // The engine outliving its callers is a shutdown race, not a bug;
        // commands to a stopped engine are dropped.
        let _ = self.sender.send(message).await;
    }

    /// Begin catching up to the replica set's latest checkpoint. A no-op
    /// if a session is already in flight.
    pub async fn start_collecting(&mut self) {
        self.send(Message::StartCollecting).await;
    }

    /// Whether a catch-up session is in flight.
    pub async fn is_collecting(&mut self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.send(Message::IsCollecting { responder: tx }).await;
        rx.await.unwrap_or(false)
    }

    /// Snapshot the current reserved pages and block tip as `checkpoint`.
    pub async fn create_checkpoint(&mut self, checkpoint: u64) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::CreateCheckpoint {
            checkpoint,
            responder: tx,
        })
        .await;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Record that `checkpoint` is stable.
    pub async fn mark_checkpoint_stable(&mut self, checkpoint: u64) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::MarkStable {
            checkpoint,
            responder: tx,
        })
        .await;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Digest identifying a stored checkpoint.
    pub async fn digest_of_checkpoint(&mut self, checkpoint: u64) -> Option<D> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::DigestOfCheckpoint {
            checkpoint,
            responder: tx,
        })
        .await;
        rx.await.ok().flatten()
    }

    /// Read a reserved page.
    pub async fn load_reserved_page(&mut self, page: u32) -> Result<Bytes, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::LoadPage {
            page,
            responder: tx,
        })
        .await;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Write a reserved page.
    pub async fn save_reserved_page(&mut self, page: u32, data: Bytes) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::SavePage {
            page,
            data,
            responder: tx,
        })
        .await;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Zero a reserved page.
    pub async fn zero_reserved_page(&mut self, page: u32) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::ZeroPage {
            page,
            responder: tx,
        })
        .await;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Subscribe to transfer completions.
    ///
    /// Subscribers are observers: a full or dropped subscription never
    /// blocks the engine.
    pub async fn subscribe(&mut self) -> mpsc::Receiver<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::Subscribe { responder: tx }).await;
        match rx.await {
            Ok(receiver) => receiver,
            // Engine already stopped: hand back a channel that never
            // yields.
            Err(_) => mpsc::channel(1).1,
        }
    }

    /// Wipe the durable store at next init.
    pub async fn set_erase_flag(&mut self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::SetEraseFlag { responder: tx }).await;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// A point-in-time view of the engine.
    pub async fn status(&mut self) -> Result<Status<D>, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Message::Status { responder: tx }).await;
        rx.await.map_err(|_| Error::Closed)
    }
}
