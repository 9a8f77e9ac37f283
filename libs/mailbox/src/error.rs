//! Mailbox Error Types
//!
//! Error taxonomy for wiring, dispatch, routing, backpressure and lifecycle
//! failures of the mailbox runtime.

use crate::address::Address;
use crate::lifecycle::LifecycleState;
use thiserror::Error;
use uuid::Uuid;

/// Main mailbox runtime error type
#[derive(Error, Debug, Clone)]
pub enum MailboxError {
    /// Wiring-time errors (duplicate handler, duplicate address, bad config).
    /// Fatal: startup must abort.
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// A handler invocation failed and the exception policy escalated it
    #[error("Dispatch error in mailbox '{mailbox}': {message_type} ({message_id}): {reason}")]
    Dispatch {
        mailbox: String,
        message_id: Uuid,
        message_type: &'static str,
        reason: String,
    },

    /// No endpoint registered for the requested address
    #[error("Address not found: {address}")]
    AddressNotFound { address: Address },

    /// Queue is at capacity and the backpressure policy rejects
    #[error("Capacity exceeded: mailbox '{mailbox}' is full ({capacity} messages)")]
    CapacityExceeded { mailbox: String, capacity: usize },

    /// Send or control operation attempted in a state that forbids it
    #[error("Lifecycle error: mailbox '{mailbox}' is {state}")]
    Lifecycle {
        mailbox: String,
        state: LifecycleState,
    },

    /// Worker could not be spawned or joined
    #[error("Runtime error: {message}")]
    Runtime { message: String },
}

/// Result type alias for mailbox operations
pub type Result<T> = std::result::Result<T, MailboxError>;

impl MailboxError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a dispatch error
    pub fn dispatch(
        mailbox: impl Into<String>,
        message_id: Uuid,
        message_type: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::Dispatch {
            mailbox: mailbox.into(),
            message_id,
            message_type,
            reason: reason.into(),
        }
    }

    /// Create an address-not-found routing error
    pub fn address_not_found(address: Address) -> Self {
        Self::AddressNotFound { address }
    }

    /// Create a capacity error
    pub fn capacity_exceeded(mailbox: impl Into<String>, capacity: usize) -> Self {
        Self::CapacityExceeded {
            mailbox: mailbox.into(),
            capacity,
        }
    }

    /// Create a lifecycle error
    pub fn lifecycle(mailbox: impl Into<String>, state: LifecycleState) -> Self {
        Self::Lifecycle {
            mailbox: mailbox.into(),
            state,
        }
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Short category label for structured logs
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Dispatch { .. } => "dispatch",
            Self::AddressNotFound { .. } => "routing",
            Self::CapacityExceeded { .. } => "capacity",
            Self::Lifecycle { .. } => "lifecycle",
            Self::Runtime { .. } => "runtime",
        }
    }

    /// Configuration errors must abort startup; everything else is returned
    /// to the caller to decide.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Errors a sender may retry later (the target may drain)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
