//! Typed Mailbox Runtime
//!
//! In-process message runtime for the trading platform. Every component owns
//! one mailbox: a bounded FIFO queue drained by a dedicated tokio task that
//! dispatches each message to the first matching handler. Components talk to
//! each other only through send-only [`Endpoint`]s, resolved by [`Address`]
//! through an immutable [`Switchboard`] that the [`MessageBus`] can swap as a
//! whole.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────────┐  send   ┌──────────────────────────────┐
//!  │  Endpoint  │────────►│  bounded queue (FIFO)        │
//!  └────────────┘         │            │                 │
//!        ▲                │            ▼                 │
//!        │ resolve        │  worker task ─► HandlerChain │
//!  ┌────────────┐         │  (one message at a time)     │
//!  │ Switchboard│         └──────────────────────────────┘
//!  └────────────┘                 MessageProcessor
//! ```
//!
//! # Guarantees
//!
//! - Messages of one mailbox are handled in enqueue order, never concurrently
//! - Sends never run the target's handlers on the sender's task
//! - A handler error stops the mailbox (fail-fast) unless the exception
//!   policy says to resume
//!
//! # Example
//!
//! ```rust
//! use mailbox::{impl_message, MailboxConfig, MessageHeader, MessageProcessor};
//!
//! #[derive(Debug)]
//! struct Fill {
//!     header: MessageHeader,
//!     quantity: u32,
//! }
//! impl_message!(Fill);
//!
//! # async fn run() -> anyhow::Result<()> {
//! let portfolio = MessageProcessor::new("portfolio", MailboxConfig::default())?;
//! portfolio.register_handler::<Fill, _>(|fill| {
//!     tracing::info!(quantity = fill.quantity, "fill booked");
//!     Ok(())
//! })?;
//!
//! let endpoint = portfolio.endpoint();
//! endpoint
//!     .send(Fill { header: MessageHeader::event(), quantity: 100 })
//!     .await?;
//! portfolio.graceful_stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod bus;
pub mod config;
pub mod diagnostics;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod message;
pub mod processor;
pub mod switchboard;

pub use address::Address;
pub use bus::{MessageBus, RouteMessage};
pub use config::{BackpressurePolicy, MailboxConfig, RuntimeConfig, DEFAULT_MAILBOX_CAPACITY};
pub use diagnostics::{DispatchFault, MailboxStats};
pub use endpoint::Endpoint;
pub use error::{MailboxError, Result};
pub use handler::{DispatchOutcome, Handler, HandlerChain, HandlerKey, CATCH_ALL};
pub use lifecycle::{Component, LifecycleController, LifecycleState, MailboxFaulted};
pub use message::{Envelope, Message, MessageHeader, MessageKind};
pub use processor::{FaultDirective, MessageProcessor};
pub use switchboard::{ActiveSwitchboard, ReinitializeSwitchboard, Switchboard};
