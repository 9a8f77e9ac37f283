//! Mailbox and Component Lifecycle
//!
//! ```text
//! Created ──► Running ──► Stopping ──► Stopped
//!    │           │            │
//!    │           ├────────────┴──► Faulted   (escalated dispatch error)
//!    └───────────┴────────────┴──► Killed
//! ```
//!
//! Transitions only move forward; `Stopped`, `Killed` and `Faulted` are
//! terminal.

use crate::error::{MailboxError, Result};
use crate::message::MessageHeader;
use crate::processor::MessageProcessor;
use crate::impl_message;
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Mailbox lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Running,
    Stopping,
    Stopped,
    Killed,
    Faulted,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Stopped | LifecycleState::Killed | LifecycleState::Faulted
        )
    }

    /// Whether `self -> next` is a legal forward transition
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (*self, next) {
            (Created, Running) => true,
            (Running, Stopping) => true,
            (Stopping, Stopped) => true,
            (Running | Stopping, Faulted) => true,
            (Created | Running | Stopping, Killed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Killed => "killed",
            LifecycleState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Event sent to a supervisor endpoint when a mailbox worker fails fast
#[derive(Debug, Clone)]
pub struct MailboxFaulted {
    pub header: MessageHeader,
    pub mailbox: String,
    pub message_id: Uuid,
    pub message_type: &'static str,
    pub error: String,
}

impl MailboxFaulted {
    pub fn new(
        mailbox: impl Into<String>,
        message_id: Uuid,
        message_type: &'static str,
        error: impl Into<String>,
    ) -> Self {
        Self {
            header: MessageHeader::event(),
            mailbox: mailbox.into(),
            message_id,
            message_type,
            error: error.into(),
        }
    }
}

impl_message!(MailboxFaulted);

/// A platform component built on a mailbox
#[async_trait]
pub trait Component: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// The component's own mailbox
    fn processor(&self) -> &MessageProcessor;

    /// Called before the mailbox starts processing
    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called after the mailbox has drained
    async fn on_stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Starts components in registration order and stops them in reverse
#[derive(Default)]
pub struct LifecycleController {
    components: Vec<Arc<dyn Component>>,
    names: HashSet<String>,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, component: Arc<dyn Component>) -> Result<()> {
        let name = component.name().to_string();
        if !self.names.insert(name.clone()) {
            return Err(MailboxError::configuration(
                format!("Component '{}' is already registered", name),
                Some("component"),
            ));
        }
        debug!(component = %name, "Registered component");
        self.components.push(component);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// `on_start` then mailbox start, for each component in order.
    /// The first failure aborts startup.
    pub async fn start_all(&self) -> anyhow::Result<()> {
        for component in &self.components {
            let started = Instant::now();
            component.on_start().await.map_err(|e| {
                error!(component = component.name(), error = %e, "Component failed to start");
                e
            })?;
            component.processor().start()?;
            info!(
                component = component.name(),
                startup_duration_ms = started.elapsed().as_millis(),
                "Component started"
            );
        }
        Ok(())
    }

    /// Drain and stop every component in reverse order. All components are
    /// stopped even if some fail; the first error is returned.
    pub async fn stop_all(&self) -> anyhow::Result<()> {
        let mut first_error: Option<anyhow::Error> = None;

        for component in self.components.iter().rev() {
            if let Err(e) = component.processor().graceful_stop().await {
                warn!(component = component.name(), error = %e, "Mailbox drain failed");
                first_error.get_or_insert(e.into());
            }
            if let Err(e) = component.on_stop().await {
                warn!(component = component.name(), error = %e, "Component on_stop failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(components = self.components.len(), "All components stopped");
                Ok(())
            }
        }
    }

    /// Kill every mailbox at once
    pub async fn kill_all(&self) {
        join_all(
            self.components
                .iter()
                .map(|component| component.processor().kill()),
        )
        .await;
        warn!(components = self.components.len(), "All components killed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailboxConfig;
    use parking_lot::Mutex;

    #[test]
    fn test_transitions_are_monotonic() {
        use LifecycleState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Faulted));
        assert!(Created.can_transition_to(Killed));

        for terminal in [Stopped, Killed, Faulted] {
            assert!(terminal.is_terminal());
            for next in [Created, Running, Stopping, Stopped, Killed, Faulted] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Stopping.can_transition_to(Running));
    }

    struct Probe {
        name: String,
        processor: MessageProcessor,
        journal: Arc<Mutex<Vec<String>>>,
    }

    impl Probe {
        fn new(name: &str, journal: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                processor: MessageProcessor::new(name, MailboxConfig::default()).unwrap(),
                journal,
            })
        }
    }

    #[async_trait]
    impl Component for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        fn processor(&self) -> &MessageProcessor {
            &self.processor
        }

        async fn on_start(&self) -> anyhow::Result<()> {
            self.journal.lock().push(format!("start:{}", self.name));
            Ok(())
        }

        async fn on_stop(&self) -> anyhow::Result<()> {
            self.journal.lock().push(format!("stop:{}", self.name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_controller_orders_start_and_stop() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let market_data = Probe::new("market_data", journal.clone());
        let execution = Probe::new("execution", journal.clone());

        let mut controller = LifecycleController::new();
        controller.register(market_data.clone()).unwrap();
        controller.register(execution.clone()).unwrap();

        controller.start_all().await.unwrap();
        assert_eq!(market_data.processor().state(), LifecycleState::Running);

        controller.stop_all().await.unwrap();
        assert_eq!(execution.processor().state(), LifecycleState::Stopped);
        assert_eq!(
            *journal.lock(),
            vec![
                "start:market_data",
                "start:execution",
                "stop:execution",
                "stop:market_data"
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_component_rejected() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut controller = LifecycleController::new();
        controller.register(Probe::new("broker", journal.clone())).unwrap();
        let err = controller.register(Probe::new("broker", journal)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(controller.len(), 1);
    }

    #[tokio::test]
    async fn test_kill_all() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let probe = Probe::new("publisher", journal);
        let mut controller = LifecycleController::new();
        controller.register(probe.clone()).unwrap();
        controller.start_all().await.unwrap();

        controller.kill_all().await;
        assert_eq!(probe.processor().state(), LifecycleState::Killed);
    }
}
