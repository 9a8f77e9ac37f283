//! Mailbox Endpoint
//!
//! The send-only capability a mailbox hands to its peers. It cannot touch
//! the handler chain, the logs or the lifecycle of the mailbox behind it.

use crate::error::Result;
use crate::message::{Envelope, Message};
use crate::processor::MailboxCore;
use std::fmt;
use std::sync::Arc;

/// Send-only handle to a mailbox
#[derive(Clone)]
pub struct Endpoint {
    core: Arc<MailboxCore>,
}

impl Endpoint {
    pub(crate) fn new(core: Arc<MailboxCore>) -> Self {
        Self { core }
    }

    /// Enqueue a message, applying the target's backpressure policy.
    /// Never runs the target's handlers on the caller's task.
    pub async fn send<M: Message>(&self, message: M) -> Result<()> {
        self.core.enqueue(Envelope::new(message)).await
    }

    /// Enqueue without waiting; a full queue is rejected
    pub fn try_send<M: Message>(&self, message: M) -> Result<()> {
        self.core.try_enqueue(Envelope::new(message))
    }

    /// Forward an already-enveloped message
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.core.enqueue(envelope).await
    }

    pub fn try_send_envelope(&self, envelope: Envelope) -> Result<()> {
        self.core.try_enqueue(envelope)
    }

    /// Name of the mailbox behind this endpoint, for logs
    pub fn target(&self) -> &str {
        self.core.name()
    }

    /// True if both endpoints feed the same mailbox
    pub fn same_target(&self, other: &Endpoint) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("target", &self.core.name())
            .finish()
    }
}
