//! Typed Dispatch Chain
//!
//! A [`Handler`] erases a typed callback `FnMut(&T)` into a uniform
//! try-handle over [`Envelope`]. A [`HandlerChain`] keeps handlers in
//! registration order with at most one handler per concrete type and the
//! catch-all (if any) always last, so dispatch is first-match-wins.

use crate::error::{MailboxError, Result};
use crate::message::{Envelope, Message};
use std::any::TypeId;
use std::fmt;

/// Type label reported for the catch-all handler
pub const CATCH_ALL: &str = "*";

type Action = Box<dyn FnMut(&Envelope) -> anyhow::Result<()> + Send>;

/// What a handler is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    /// Exactly one concrete message type
    Type(TypeId),
    /// Every message
    CatchAll,
}

/// One entry of a dispatch chain
pub struct Handler {
    key: HandlerKey,
    type_name: &'static str,
    action: Action,
}

impl Handler {
    /// Handler for messages of type `M`
    pub fn create<M, F>(mut action: F) -> Self
    where
        M: Message,
        F: FnMut(&M) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            key: HandlerKey::Type(TypeId::of::<M>()),
            type_name: std::any::type_name::<M>(),
            action: Box::new(move |envelope: &Envelope| match envelope.downcast_ref::<M>() {
                Some(message) => action(message),
                None => Ok(()),
            }),
        }
    }

    /// Handler matching every message
    pub fn catch_all<F>(action: F) -> Self
    where
        F: FnMut(&Envelope) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            key: HandlerKey::CatchAll,
            type_name: CATCH_ALL,
            action: Box::new(action),
        }
    }

    pub fn key(&self) -> HandlerKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is_catch_all(&self) -> bool {
        self.key == HandlerKey::CatchAll
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        match self.key {
            HandlerKey::Type(type_id) => envelope.type_id() == type_id,
            HandlerKey::CatchAll => true,
        }
    }

    /// Invoke the action if the envelope matches.
    ///
    /// `Ok(false)` means no match and no side effects. Action errors are
    /// returned unchanged.
    pub fn handle(&mut self, envelope: &Envelope) -> anyhow::Result<bool> {
        if !self.matches(envelope) {
            return Ok(false);
        }
        (self.action)(envelope)?;
        Ok(true)
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("type", &self.type_name)
            .finish()
    }
}

/// Result of running one envelope through the chain
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Handled by the handler registered for this type name
    Handled(&'static str),
    /// No handler matched
    Unmatched,
    /// The matching handler failed
    Failed {
        handler: &'static str,
        error: anyhow::Error,
    },
}

/// Ordered handlers of one mailbox
#[derive(Debug, Default)]
pub struct HandlerChain {
    handlers: Vec<Handler>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler. A second handler for the same key is rejected and
    /// the chain is left untouched.
    pub fn register(&mut self, handler: Handler) -> Result<()> {
        if self.handlers.iter().any(|existing| *existing == handler) {
            return Err(MailboxError::configuration(
                format!("Handler for {} is already registered", handler.type_name()),
                Some("handler"),
            ));
        }
        self.handlers.push(handler);
        // stable: typed handlers keep registration order
        self.handlers.sort_by_key(Handler::is_catch_all);
        Ok(())
    }

    pub fn contains(&self, key: HandlerKey) -> bool {
        self.handlers.iter().any(|handler| handler.key() == key)
    }

    /// Registered keys in dispatch order
    pub fn keys(&self) -> Vec<HandlerKey> {
        self.handlers.iter().map(Handler::key).collect()
    }

    /// Registered type names in dispatch order
    pub fn types(&self) -> Vec<&'static str> {
        self.handlers.iter().map(Handler::type_name).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// First matching handler wins; later handlers are not consulted
    pub fn dispatch(&mut self, envelope: &Envelope) -> DispatchOutcome {
        for handler in self.handlers.iter_mut() {
            match handler.handle(envelope) {
                Ok(true) => return DispatchOutcome::Handled(handler.type_name()),
                Ok(false) => continue,
                Err(error) => {
                    return DispatchOutcome::Failed {
                        handler: handler.type_name(),
                        error,
                    }
                }
            }
        }
        DispatchOutcome::Unmatched
    }
}
