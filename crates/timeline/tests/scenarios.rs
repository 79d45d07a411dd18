//! Event log + reconstruction scenarios at realistic sizes.

use chronostate_common::{Value, path};
use chronostate_patch::PatchOp;
use chronostate_timeline::{EventLog, EventLogConfig, EventQuery, EventType, NewEvent, ReconstructOptions};

fn counter_log(events: u64, interval: u64) -> EventLog {
    let mut log = EventLog::new(EventLogConfig {
        max_events: 10_000,
        snapshot_interval: interval,
        persist_events: false,
    });
    for i in 1..=events {
        log.append(NewEvent::value_set(format!("k{}", i % 3), Value::Int(i as i64)));
    }
    log
}

#[test]
fn thousand_events_produce_ten_snapshots() {
    let log = counter_log(1000, 100);
    let seqs: Vec<u64> = log.snapshots().iter().map(|s| s.seq).collect();
    assert_eq!(seqs, (1..=10).map(|i| i * 100).collect::<Vec<_>>());
}

#[test]
fn seqs_strictly_increase_without_gaps() {
    let log = counter_log(500, 100);
    let events = log.get_events(&EventQuery::default());
    assert_eq!(events.len(), 500);
    for pair in events.windows(2) {
        assert_eq!(pair[1].seq, pair[0].seq + 1);
    }
    assert_eq!(events[0].seq, 1);
}

#[test]
fn reconstruct_uses_nearest_preceding_snapshot() {
    let log = counter_log(300, 100);
    let r = log.reconstruct(&ReconstructOptions::at(250).with_state()).unwrap();
    assert_eq!(r.base_snapshot, Some(200));
    assert_eq!(r.replayed, 50);
    assert_eq!(r.seq, 250);
    let state = r.state.unwrap();
    // last writes at or before 250 for each key
    assert_eq!(state["k0"], Value::Int(249));
    assert_eq!(state["k1"], Value::Int(250));
    assert_eq!(state["k2"], Value::Int(248));
}

#[test]
fn target_past_latest_clamps() {
    let log = counter_log(120, 100);
    let r = log.reconstruct(&ReconstructOptions::at(10_000).with_state()).unwrap();
    assert_eq!(r.seq, 120);
    assert_eq!(r.base_snapshot, Some(100));
    assert_eq!(r.replayed, 20);
}

#[test]
fn todo_list_history() {
    let mut log = EventLog::new(EventLogConfig {
        snapshot_interval: 3,
        ..EventLogConfig::default()
    });
    log.append(NewEvent::value_set("todos", Value::list()));
    log.append(NewEvent::transaction_begin("add two"));
    log.append(NewEvent::value_patched("todos", vec![PatchOp::set(path![0usize], "a")]));
    log.append(NewEvent::value_patched("todos", vec![PatchOp::set(path![1usize], "b")]));
    log.append(NewEvent::transaction_commit("add two"));
    log.append(NewEvent::dispatched("clear_done", Value::Null));
    log.append(NewEvent::value_patched("todos", vec![PatchOp::delete(path![0usize])]));

    assert_eq!(
        log.get_state_at(4, None).unwrap()["todos"],
        Value::List(vec![Value::from("a"), Value::from("b")])
    );
    assert_eq!(
        log.get_state_at(7, None).unwrap()["todos"],
        Value::List(vec![Value::from("b")])
    );
    let dispatches = log.get_events(&EventQuery {
        kind: Some(EventType::Dispatched),
        ..EventQuery::default()
    });
    assert_eq!(dispatches.len(), 1);

    let changes = log.changes_between(4, 7, None).unwrap();
    assert!(changes.contains_key("todos"));
}
