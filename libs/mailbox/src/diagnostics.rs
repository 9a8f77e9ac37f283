//! Mailbox Diagnostics
//!
//! Counters and logs of a single mailbox. Written only by the mailbox's own
//! worker (and by senders for the queue depth), readable from any thread.

use crate::handler::HandlerKey;
use crate::message::Envelope;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// A recorded handler failure
#[derive(Debug, Clone)]
pub struct DispatchFault {
    pub message_id: Uuid,
    pub message_type: &'static str,
    pub handler: &'static str,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// Point-in-time view of mailbox counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MailboxStats {
    pub input_count: usize,
    pub processed_count: u64,
    pub handled_count: u64,
    pub unhandled_count: u64,
    pub failed_count: u64,
    pub rejected_sends: u64,
    pub avg_processing_time_ns: f64,
}

#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    queued: AtomicUsize,
    processed: AtomicU64,
    handled: AtomicU64,
    unhandled: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    total_processing_time_ns: AtomicU64,
    handler_types: RwLock<Vec<&'static str>>,
    handler_keys: RwLock<Vec<HandlerKey>>,
    unhandled_log: RwLock<Vec<Envelope>>,
    exception_log: RwLock<Vec<DispatchFault>>,
}

impl Diagnostics {
    /// Reserve a queue slot before handing the message to the channel
    pub fn record_enqueue(&self) {
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    /// Give back a reserved slot after a failed send
    pub fn record_send_rejected(&self, counted_as_rejection: bool) {
        self.release_slot();
        if counted_as_rejection {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dequeue(&self) {
        self.release_slot();
    }

    // saturating: a reset may have zeroed the depth under a pending sender
    fn release_slot(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                Some(depth.saturating_sub(1))
            });
    }

    pub fn record_processed(&self, duration: Duration) {
        self.processed.fetch_add(1, Ordering::AcqRel);
        self.total_processing_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unhandled(&self, envelope: &Envelope) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
        self.unhandled_log.write().push(envelope.clone());
    }

    /// Counts an unmatched message whose policy was overridden (no log entry)
    pub fn record_unmatched(&self) {
        self.unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self, fault: DispatchFault) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.exception_log.write().push(fault);
    }

    /// Mirror of the chain, readable after the worker has taken it
    pub fn set_handlers(&self, types: Vec<&'static str>, keys: Vec<HandlerKey>) {
        *self.handler_types.write() = types;
        *self.handler_keys.write() = keys;
    }

    /// Messages abandoned in the queue (kill or fault)
    pub fn reset_queue_depth(&self) {
        self.queued.store(0, Ordering::Release);
    }

    pub fn input_count(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub fn handler_types(&self) -> Vec<&'static str> {
        self.handler_types.read().clone()
    }

    pub fn has_handler(&self, key: HandlerKey) -> bool {
        self.handler_keys.read().contains(&key)
    }

    pub fn unhandled_log(&self) -> Vec<Envelope> {
        self.unhandled_log.read().clone()
    }

    pub fn exception_log(&self) -> Vec<DispatchFault> {
        self.exception_log.read().clone()
    }

    pub fn avg_processing_time_ns(&self) -> f64 {
        let count = self.processed.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_processing_time_ns.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    pub fn snapshot(&self) -> MailboxStats {
        MailboxStats {
            input_count: self.input_count(),
            processed_count: self.processed_count(),
            handled_count: self.handled.load(Ordering::Relaxed),
            unhandled_count: self.unhandled.load(Ordering::Relaxed),
            failed_count: self.failed.load(Ordering::Relaxed),
            rejected_sends: self.rejected.load(Ordering::Relaxed),
            avg_processing_time_ns: self.avg_processing_time_ns(),
        }
    }
}
