//! Message Bus
//!
//! Component that owns the active switchboard. It routes Commands, Events
//! and Documents to component addresses and installs a new switchboard when
//! it receives [`ReinitializeSwitchboard`]. Re-wiring goes through the bus
//! mailbox, so it is ordered with respect to the routing requests queued
//! before it.

use crate::address::Address;
use crate::config::MailboxConfig;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::lifecycle::Component;
use crate::message::{Envelope, Message, MessageHeader};
use crate::processor::{FaultDirective, MessageProcessor};
use crate::switchboard::{ActiveSwitchboard, ReinitializeSwitchboard, Switchboard};
use crate::impl_message;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Command asking the bus to deliver `envelope` to `address`
#[derive(Debug, Clone)]
pub struct RouteMessage {
    pub header: MessageHeader,
    pub address: Address,
    pub envelope: Envelope,
}

impl RouteMessage {
    pub fn new<M: Message>(address: Address, message: M) -> Self {
        Self {
            header: MessageHeader::command(),
            address,
            envelope: Envelope::new(message),
        }
    }
}

impl_message!(RouteMessage);

/// Routing component holding the active switchboard
pub struct MessageBus {
    processor: MessageProcessor,
    active: ActiveSwitchboard,
}

impl MessageBus {
    pub fn new(config: MailboxConfig, initial: Switchboard) -> Result<Self> {
        let processor = MessageProcessor::new(Address::Bus.as_str(), config)?;
        let active = ActiveSwitchboard::new(initial);

        let table = active.clone();
        processor.register_handler::<ReinitializeSwitchboard, _>(move |command| {
            table.replace(command.switchboard.clone());
            Ok(())
        })?;

        let table = active.clone();
        processor.register_handler::<RouteMessage, _>(move |route| {
            table
                .current()
                .try_forward(route.address, route.envelope.clone())?;
            Ok(())
        })?;

        // a bad route must not take the bus down
        processor.register_exception_handler(|envelope, error| {
            warn!(
                message_id = %envelope.id(),
                message_type = envelope.type_name(),
                error = %error,
                "Bus routing failed"
            );
            FaultDirective::Resume
        })?;

        info!(routes = active.current().len(), "Message bus created");
        Ok(Self { processor, active })
    }

    /// Endpoint of the bus mailbox
    pub fn endpoint(&self) -> Endpoint {
        self.processor.endpoint()
    }

    /// Snapshot of the switchboard in force
    pub fn switchboard(&self) -> Arc<Switchboard> {
        self.active.current()
    }

    /// Route directly through the current table, bypassing the bus queue
    pub async fn route<M: Message>(&self, address: Address, message: M) -> Result<()> {
        debug!(address = %address, "Routing message");
        self.active.current().send_to_address(address, message).await
    }

    /// Queue a routing request behind everything already sent to the bus
    pub async fn route_queued<M: Message>(&self, address: Address, message: M) -> Result<()> {
        self.processor.send(RouteMessage::new(address, message)).await
    }

    /// Queue a re-initialization command carrying `switchboard`
    pub async fn reinitialize(&self, switchboard: Switchboard) -> Result<()> {
        info!(
            version = switchboard.version(),
            routes = switchboard.len(),
            "Switchboard re-initialization requested"
        );
        self.processor
            .send(ReinitializeSwitchboard::new(switchboard))
            .await
    }
}

#[async_trait]
impl Component for MessageBus {
    fn name(&self) -> &str {
        self.processor.name()
    }

    fn processor(&self) -> &MessageProcessor {
        &self.processor
    }
}
