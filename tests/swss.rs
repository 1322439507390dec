//! Simulated database tests: ordering, acknowledgments and concurrency.

mod common;

use p4rt_harness::sonic::adapters::{
    ConsumerNotifierAdapter, DbConnectorAdapter, ProducerStateTableAdapter,
};
use p4rt_harness::swss::{
    AckChannel, Applier, ApplyWorker, FakeConsumerNotifier, FakeDbConnector,
    FakeProducerStateTable, Mutation, MutationQueue, ResponseCode, SonicDbTable, WaitOutcome,
};
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

fn applier(name: &str) -> Applier {
    Applier::new(
        SonicDbTable::new(name),
        MutationQueue::new(name),
        AckChannel::new(name),
    )
}

fn row(value: &str) -> Vec<(String, String)> {
    vec![("value".to_string(), value.to_string())]
}

/// Mutations applied to a plain map, for comparison.
fn replay(mutations: &[Mutation]) -> BTreeMap<String, Vec<(String, String)>> {
    let mut rows = BTreeMap::new();
    for m in mutations {
        match m {
            Mutation::Set { key, fields } => {
                rows.insert(key.clone(), fields.clone());
            }
            Mutation::Delete { key } => {
                rows.remove(key);
            }
        }
    }
    rows
}

fn snapshot(table: &SonicDbTable) -> BTreeMap<String, Vec<(String, String)>> {
    table.entries().into_iter().collect()
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn every_prefix_of_applied_mutations_is_observable() {
    common::init_tracing();
    let applier = applier("P4RT");
    let mutations = vec![
        Mutation::set("a", row("1")),
        Mutation::set("b", row("2")),
        Mutation::set("a", row("3")),
        Mutation::delete("b"),
        Mutation::delete("missing"),
        Mutation::set("c", row("4")),
    ];
    for m in &mutations {
        applier.queue().enqueue(m.clone()).unwrap();
    }

    for k in 1..=mutations.len() {
        applier.apply_next().unwrap();
        assert_eq!(snapshot(applier.table()), replay(&mutations[..k]), "after {} applies", k);
    }
    assert!(applier.apply_next().is_none());
}

#[test]
fn deleting_an_absent_key_acknowledges_success() {
    let applier = applier("P4RT");
    applier.queue().enqueue(Mutation::delete("nothing")).unwrap();

    let ack = applier.apply_next().unwrap();
    assert_eq!(ack.key, "nothing");
    assert_eq!(ack.code, ResponseCode::Success);
    assert!(applier.table().is_empty());
}

#[test]
fn later_set_on_same_key_wins() {
    let applier = applier("P4RT");
    applier.queue().enqueue(Mutation::set("k", row("first"))).unwrap();
    applier.queue().enqueue(Mutation::set("k", row("second"))).unwrap();

    assert_eq!(applier.apply_pending(), 2);
    assert_eq!(applier.table().get("k").unwrap(), row("second"));
    assert_eq!(applier.acks().pending(), 2);
}

#[test]
fn acknowledgments_follow_enqueue_order() {
    let applier = applier("P4RT");
    let producer = FakeProducerStateTable::new(applier.queue().clone());
    let notifier = FakeConsumerNotifier::new(applier.acks().clone());
    for key in ["x", "y", "z"] {
        producer.set(key, row(key)).unwrap();
    }
    applier.apply_pending();

    for key in ["x", "y", "z"] {
        match notifier.wait_for_notification(Duration::from_millis(100)) {
            WaitOutcome::Ready(ack) => assert_eq!(ack.key, key),
            WaitOutcome::TimedOut => panic!("missing acknowledgment for {}", key),
        }
    }
}

#[test]
fn tables_are_independent() {
    let p4rt = applier("P4RT");
    let vrf = applier("VRF_TABLE");
    let mut p4rt_log = Vec::new();
    let mut vrf_log = Vec::new();
    for i in 0..10 {
        let m = Mutation::set(format!("p{}", i % 3), row(&i.to_string()));
        p4rt.queue().enqueue(m.clone()).unwrap();
        p4rt_log.push(m);
        let m = Mutation::set(format!("v{}", i % 4), row(&i.to_string()));
        vrf.queue().enqueue(m.clone()).unwrap();
        vrf_log.push(m);
    }

    // Interleave unevenly across the two tables.
    let (mut applied_p, mut applied_v) = (0, 0);
    for round in 0..10 {
        if round % 3 != 0 {
            p4rt.apply_next().unwrap();
            applied_p += 1;
        }
        vrf.apply_next().unwrap();
        applied_v += 1;
        assert_eq!(snapshot(p4rt.table()), replay(&p4rt_log[..applied_p]));
        assert_eq!(snapshot(vrf.table()), replay(&vrf_log[..applied_v]));
    }
}

// ============================================================================
// Waiting
// ============================================================================

#[test]
fn wait_times_out_after_the_full_duration() {
    let notifier = FakeConsumerNotifier::new(AckChannel::new("P4RT"));
    let timeout = Duration::from_millis(80);

    let start = Instant::now();
    let outcome = notifier.wait_for_notification(timeout);
    let elapsed = start.elapsed();

    assert!(outcome.is_timed_out());
    assert!(elapsed >= timeout, "returned after {:?}", elapsed);
    assert!(elapsed < timeout * 20, "returned after {:?}", elapsed);
}

#[test]
fn blocked_consumer_is_woken_by_the_worker() {
    let applier = applier("P4RT");
    let notifier = FakeConsumerNotifier::new(applier.acks().clone());
    let mut worker = ApplyWorker::spawn(applier.clone()).unwrap();

    let waiter = thread::spawn(move || notifier.wait_for_notification(Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(20));
    applier.queue().enqueue(Mutation::set("k", row("v"))).unwrap();

    let ack = waiter.join().unwrap().into_notification().unwrap();
    assert_eq!(ack.key, "k");
    worker.stop();
    assert!(applier.queue().is_closed());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_producers_lose_nothing() {
    let applier = applier("P4RT");
    let mut worker = ApplyWorker::spawn(applier.clone()).unwrap();
    let producers: Vec<_> = (0..4)
        .map(|p| {
            let producer = FakeProducerStateTable::new(applier.queue().clone());
            thread::spawn(move || {
                for i in 0..50 {
                    producer.set(&format!("{}-{}", p, i), row("x")).unwrap();
                }
            })
        })
        .collect();
    for handle in producers {
        handle.join().unwrap();
    }

    assert!(common::wait_until(Duration::from_secs(5), || {
        applier.acks().posted() == 200
    }));
    worker.stop();
    assert_eq!(applier.table().len(), 200);
    assert_eq!(applier.table().applied(), 200);
}

#[test]
fn inspection_during_apply_sees_whole_rows() {
    let applier = applier("P4RT");
    let fields_a = vec![
        ("f1".to_string(), "a".to_string()),
        ("f2".to_string(), "a".to_string()),
    ];
    let fields_b = vec![
        ("f1".to_string(), "b".to_string()),
        ("f2".to_string(), "b".to_string()),
    ];
    for i in 0..200 {
        let fields = if i % 2 == 0 { &fields_a } else { &fields_b };
        applier.queue().enqueue(Mutation::set("k", fields.clone())).unwrap();
    }
    let mut worker = ApplyWorker::spawn(applier.clone()).unwrap();

    let drained = common::wait_until(Duration::from_secs(5), || {
        if let Some(row) = applier.table().get("k") {
            assert!(row == fields_a || row == fields_b, "torn row: {:?}", row);
        }
        applier.acks().posted() == 200
    });
    worker.stop();
    assert!(drained, "worker applied {} of 200", applier.acks().posted());
}

#[test]
fn closed_queue_rejects_producers() {
    let queue = MutationQueue::new("VRF_TABLE");
    let producer = FakeProducerStateTable::new(queue.clone());
    producer.set("vrf-1", row("x")).unwrap();
    queue.close();

    assert!(producer.del("vrf-1").is_err());
    assert_eq!(queue.len(), 1);
}

// ============================================================================
// Connectors
// ============================================================================

#[test]
fn connector_reads_through_to_shared_tables() {
    let table = SonicDbTable::new("P4RT");
    let mut db = FakeDbConnector::new("APPL_DB");
    db.add_table("P4RT", table.clone()).unwrap();
    table.set("k", row("v"));

    assert!(db.has_table("P4RT"));
    assert!(db.exists("P4RT", "k").unwrap());
    assert_eq!(db.keys("P4RT").unwrap(), vec!["k".to_string()]);
    assert_eq!(db.get("P4RT", "k").unwrap(), Some(row("v")));
    assert!(db.get("VRF_TABLE", "k").is_err());
}
