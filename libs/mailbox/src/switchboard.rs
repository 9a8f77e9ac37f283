//! Switchboard
//!
//! Immutable `Address -> Endpoint` routing table. Built once at wiring time;
//! never edited in place. Re-wiring builds a fresh table and swaps it into
//! the [`ActiveSwitchboard`] held by the bus as one atomic step.

use crate::address::Address;
use crate::endpoint::Endpoint;
use crate::error::{MailboxError, Result};
use crate::message::{Envelope, Message, MessageHeader};
use crate::impl_message;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Address routing table
#[derive(Debug, Clone)]
pub struct Switchboard {
    routes: Arc<BTreeMap<Address, Endpoint>>,
    version: u64,
    built_at: DateTime<Utc>,
}

impl Switchboard {
    /// Build from `(address, endpoint)` pairs. A repeated address is a
    /// configuration error.
    pub fn build<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Address, Endpoint)>,
    {
        let mut routes = BTreeMap::new();
        for (address, endpoint) in pairs {
            if routes.contains_key(&address) {
                warn!(address = %address, "Duplicate address in switchboard");
                return Err(MailboxError::configuration(
                    format!("Address '{}' is wired more than once", address),
                    Some("address"),
                ));
            }
            routes.insert(address, endpoint);
        }

        let switchboard = Self {
            routes: Arc::new(routes),
            version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed),
            built_at: Utc::now(),
        };
        debug!(
            version = switchboard.version,
            routes = switchboard.len(),
            "Switchboard built"
        );
        Ok(switchboard)
    }

    /// Table with no routes
    pub fn empty() -> Self {
        Self {
            routes: Arc::new(BTreeMap::new()),
            version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed),
            built_at: Utc::now(),
        }
    }

    pub fn resolve(&self, address: &Address) -> Result<&Endpoint> {
        self.routes
            .get(address)
            .ok_or_else(|| MailboxError::address_not_found(*address))
    }

    /// Resolve and send; `AddressNotFound` if the address is not wired
    pub async fn send_to_address<M: Message>(&self, address: Address, message: M) -> Result<()> {
        self.resolve(&address)?.send(message).await
    }

    pub fn try_send_to_address<M: Message>(&self, address: Address, message: M) -> Result<()> {
        self.resolve(&address)?.try_send(message)
    }

    pub async fn forward(&self, address: Address, envelope: Envelope) -> Result<()> {
        self.resolve(&address)?.send_envelope(envelope).await
    }

    pub fn try_forward(&self, address: Address, envelope: Envelope) -> Result<()> {
        self.resolve(&address)?.try_send_envelope(envelope)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.routes.contains_key(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.routes.keys()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Build sequence number, increasing across the process
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }
}

/// The switchboard currently in force. Readers take a snapshot; a swap
/// replaces the whole table at once, so no reader ever sees a mix of old
/// and new routes.
#[derive(Debug, Clone)]
pub struct ActiveSwitchboard {
    current: Arc<RwLock<Arc<Switchboard>>>,
}

impl ActiveSwitchboard {
    pub fn new(initial: Switchboard) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn current(&self) -> Arc<Switchboard> {
        Arc::clone(&self.current.read())
    }

    /// Install `next`, returning the table it replaced
    pub fn replace(&self, next: Switchboard) -> Arc<Switchboard> {
        let next = Arc::new(next);
        let previous = std::mem::replace(&mut *self.current.write(), Arc::clone(&next));
        info!(
            previous_version = previous.version(),
            version = next.version(),
            routes = next.len(),
            "Switchboard swapped"
        );
        previous
    }
}

/// Command asking the bus to install a new switchboard
#[derive(Debug, Clone)]
pub struct ReinitializeSwitchboard {
    pub header: MessageHeader,
    pub switchboard: Switchboard,
}

impl ReinitializeSwitchboard {
    pub fn new(switchboard: Switchboard) -> Self {
        Self {
            header: MessageHeader::command(),
            switchboard,
        }
    }
}

impl_message!(ReinitializeSwitchboard);
