//! Mailbox Integration Tests
//!
//! End-to-end behaviour of a single mailbox: dispatch order, catch-all
//! fallback, fail-fast vs. resume on handler errors, and draining.

use mailbox::{
    impl_message, Envelope, FaultDirective, LifecycleState, MailboxConfig, MailboxError,
    MessageHeader, MessageProcessor, CATCH_ALL,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct Quote {
    header: MessageHeader,
    seq: usize,
}

#[derive(Debug)]
struct Trade {
    header: MessageHeader,
    seq: usize,
}

impl_message!(Quote, Trade);

fn quote(seq: usize) -> Quote {
    Quote {
        header: MessageHeader::document(),
        seq,
    }
}

fn trade(seq: usize) -> Trade {
    Trade {
        header: MessageHeader::event(),
        seq,
    }
}

/// Initialize tracing for tests (call once per test)
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn manual(name: &str) -> MessageProcessor {
    MessageProcessor::new(name, MailboxConfig::default().with_auto_start(false)).unwrap()
}

#[tokio::test]
async fn test_unmatched_type_falls_through_to_catch_all() {
    init_tracing();
    let processor = manual("strategy");
    let quotes = Arc::new(AtomicUsize::new(0));
    let fallback = Arc::new(Mutex::new(Vec::new()));

    let counter = quotes.clone();
    processor
        .register_handler::<Quote, _>(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    let sink = fallback.clone();
    processor
        .register_catch_all(move |envelope: &Envelope| {
            sink.lock().push(envelope.downcast_ref::<Trade>().map(|t| t.seq));
            Ok(())
        })
        .unwrap();

    processor.try_send(trade(7)).unwrap();
    processor.graceful_stop().await.unwrap();

    assert_eq!(quotes.load(Ordering::SeqCst), 0);
    assert_eq!(*fallback.lock(), vec![Some(7)]);
    assert!(processor.unhandled_messages().is_empty());
    assert_eq!(processor.processed_count(), 1);
}

#[tokio::test]
async fn test_catch_all_registered_first_still_runs_last() {
    let processor = manual("broker");
    let journal = Arc::new(Mutex::new(Vec::new()));

    let sink = journal.clone();
    processor
        .register_catch_all(move |_| {
            sink.lock().push("catch_all");
            Ok(())
        })
        .unwrap();
    let sink = journal.clone();
    processor
        .register_handler::<Quote, _>(move |_| {
            sink.lock().push("quote");
            Ok(())
        })
        .unwrap();

    assert_eq!(processor.handler_types().last(), Some(&CATCH_ALL));
    assert!(processor.has_handler::<Quote>());
    assert!(!processor.has_handler::<Trade>());

    processor.try_send(quote(0)).unwrap();
    processor.try_send(trade(1)).unwrap();
    processor.graceful_stop().await.unwrap();

    assert_eq!(*journal.lock(), vec!["quote", "catch_all"]);
}

#[tokio::test]
async fn test_thousand_messages_drain_in_order() {
    init_tracing();
    let processor = MessageProcessor::new("market_data", MailboxConfig::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::with_capacity(1000)));

    let sink = seen.clone();
    processor
        .register_handler::<Quote, _>(move |q| {
            sink.lock().push(q.seq);
            Ok(())
        })
        .unwrap();

    let endpoint = processor.endpoint();
    for seq in 0..1000 {
        endpoint.send(quote(seq)).await.unwrap();
    }
    processor.graceful_stop().await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 1000);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(processor.processed_count(), 1000);
    assert_eq!(processor.input_count(), 0);
    assert_eq!(processor.state(), LifecycleState::Stopped);

    let stats = processor.stats();
    assert_eq!(stats.handled_count, 1000);
    assert_eq!(stats.failed_count, 0);
}

fn failing_on_fifth(processor: &MessageProcessor) -> Arc<Mutex<Vec<usize>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    processor
        .register_handler::<Quote, _>(move |q| {
            sink.lock().push(q.seq);
            if q.seq == 5 {
                anyhow::bail!("stale quote {}", q.seq);
            }
            Ok(())
        })
        .unwrap();
    seen
}

#[tokio::test]
async fn test_handler_error_fails_fast_by_default() {
    init_tracing();
    let processor = manual("execution");
    let seen = failing_on_fifth(&processor);

    for seq in 1..=10 {
        processor.try_send(quote(seq)).unwrap();
    }
    processor.start().unwrap();

    let err = processor.graceful_stop().await.unwrap_err();
    assert!(matches!(err, MailboxError::Dispatch { .. }));
    assert_eq!(processor.state(), LifecycleState::Faulted);
    assert_eq!(processor.wait_terminated().await, LifecycleState::Faulted);

    // #6..#10 never reach the handler
    assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
    assert_eq!(processor.processed_count(), 5);

    let unhandled = processor.unhandled_messages();
    assert_eq!(unhandled.len(), 1);
    assert_eq!(unhandled[0].downcast_ref::<Quote>().map(|q| q.seq), Some(5));
    assert_eq!(processor.exceptions().len(), 1);
    assert!(processor.exceptions()[0].error.contains("stale quote 5"));

    assert!(processor.try_send(quote(11)).is_err());
}

#[tokio::test]
async fn test_swallow_policy_keeps_processing() {
    let processor = manual("execution");
    let seen = failing_on_fifth(&processor);
    let swallowed = Arc::new(AtomicUsize::new(0));
    let counter = swallowed.clone();
    processor
        .register_exception_handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            FaultDirective::Resume
        })
        .unwrap();

    for seq in 1..=10 {
        processor.try_send(quote(seq)).unwrap();
    }
    processor.graceful_stop().await.unwrap();

    assert_eq!(*seen.lock(), (1..=10).collect::<Vec<_>>());
    assert_eq!(processor.processed_count(), 10);
    assert_eq!(swallowed.load(Ordering::SeqCst), 1);
    assert_eq!(processor.state(), LifecycleState::Stopped);
    assert_eq!(processor.stats().failed_count, 1);
}

#[tokio::test]
async fn test_graceful_stop_on_empty_mailbox_twice() {
    let processor = manual("scheduler");
    processor.graceful_stop().await.unwrap();
    processor.graceful_stop().await.unwrap();
    assert_eq!(processor.state(), LifecycleState::Stopped);
    assert_eq!(processor.processed_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_never_overlap_handlers() {
    init_tracing();
    let processor = MessageProcessor::new("portfolio", MailboxConfig::default()).unwrap();
    let in_flight = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let per_producer = Arc::new(Mutex::new(vec![Vec::new(); 4]));

    let (flag, overlap, sink) = (in_flight.clone(), overlaps.clone(), per_producer.clone());
    processor
        .register_handler::<Trade, _>(move |t| {
            if flag.swap(true, Ordering::SeqCst) {
                overlap.fetch_add(1, Ordering::SeqCst);
            }
            sink.lock()[t.seq / 1000].push(t.seq % 1000);
            flag.store(false, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    processor.start().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let endpoint = processor.endpoint();
            tokio::spawn(async move {
                for i in 0..250 {
                    endpoint.send(trade(producer * 1000 + i)).await.unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }
    processor.graceful_stop().await.unwrap();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(processor.processed_count(), 1000);
    for sequence in per_producer.lock().iter() {
        assert_eq!(*sequence, (0..250).collect::<Vec<_>>());
    }
}

proptest! {
    #[test]
    fn prop_unhandled_log_preserves_order(kinds in prop::collection::vec(any::<bool>(), 0..64)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (handled, unhandled, processed) = runtime.block_on(async {
            let processor = manual("prop");
            let handled = Arc::new(Mutex::new(Vec::new()));
            let sink = handled.clone();
            processor
                .register_handler::<Quote, _>(move |q| {
                    sink.lock().push(q.seq);
                    Ok(())
                })
                .unwrap();

            for (seq, is_quote) in kinds.iter().enumerate() {
                if *is_quote {
                    processor.try_send(quote(seq)).unwrap();
                } else {
                    processor.try_send(trade(seq)).unwrap();
                }
            }
            processor.graceful_stop().await.unwrap();

            let unhandled: Vec<usize> = processor
                .unhandled_messages()
                .iter()
                .filter_map(|e| e.downcast_ref::<Trade>().map(|t| t.seq))
                .collect();
            let handled = handled.lock().clone();
            (handled, unhandled, processor.processed_count())
        });

        let expected_handled: Vec<usize> =
            kinds.iter().enumerate().filter(|(_, q)| **q).map(|(i, _)| i).collect();
        let expected_unhandled: Vec<usize> =
            kinds.iter().enumerate().filter(|(_, q)| !**q).map(|(i, _)| i).collect();

        prop_assert_eq!(handled, expected_handled);
        prop_assert_eq!(unhandled, expected_unhandled);
        prop_assert_eq!(processed as usize, kinds.len());
    }
}
