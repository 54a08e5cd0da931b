//! The state-transfer engine: a single actor running the fetching state
//! machine and the source role, commanded through a [Mailbox].

mod actor;
mod ingress;
mod metrics;

pub use actor::Engine;
pub use ingress::{Mailbox, Message};
