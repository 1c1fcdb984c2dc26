//! End-to-end coverage of the worker lifecycle against a real Redis.
//! Needs `--features test_redis` (or `test_all`) and a reachable
//! `REDIS_URL`, same gating convention as the teacher's queue test suite.

#![cfg(feature = "test_redis")]

use redqueue::envelope::{generate_id, Envelope};
use redqueue::error::Error;
use redqueue::events::EventBus;
use redqueue::factory::{Factory, Handler};
use redqueue::queue::{Matcher, QueueOps};
use redqueue::redis_gateway::RedisGateway;
use redqueue::registry::{ProcessingPointer, Registry, WorkerId};
use redqueue::signals::SignalWatcher;
use redqueue::stats::Stats;
use redqueue::status::{JobState, StatusTracker};
use redqueue::supervisor::{Outcome, Supervisor};
use serde_json::{json, Value};

struct Echo;
impl Handler for Echo {
    fn perform(&mut self) -> std::result::Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Some(json!({"echoed": true})))
    }
}

struct Boom;
impl Handler for Boom {
    fn perform(&mut self) -> std::result::Result<Option<Value>, Box<dyn std::error::Error + Send + Sync>> {
        Err("boom".into())
    }
}

fn test_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

/// Runs `test` against a fresh gateway under a random prefix, then scans
/// and deletes every key under that prefix regardless of outcome, the
/// same cleanup-by-`SCAN` pattern the teacher's queue tests use.
fn run_with_test_prefix(test: impl FnOnce(&mut RedisGateway) -> Result<(), Error>) {
    dotenv::dotenv().ok();
    let prefix = format!("redqueue-test-{}", generate_id());
    let mut gateway = RedisGateway::new(test_url(), prefix.clone()).expect("connecting to Redis");

    let result = test(&mut gateway);

    let client = redis::Client::open(test_url()).expect("reopening client for cleanup");
    let mut conn = client.get_connection().expect("cleanup connection");
    let mut cursor = 0u64;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(format!("{}:*", prefix))
            .arg("COUNT")
            .arg(200)
            .query(&mut conn)
            .expect("scanning keyspace");
        if !keys.is_empty() {
            let mut del = redis::cmd("DEL");
            for k in &keys {
                del.arg(k);
            }
            let _: () = del.query(&mut conn).expect("deleting test keys");
        }
        cursor = next;
        if cursor == 0 {
            break;
        }
    }

    result.expect("test returned an error");
}

#[test]
fn single_enqueue_is_reserved_and_executed() {
    run_with_test_prefix(|gateway| {
        let events = EventBus::new();
        let mut factory = Factory::new();
        factory.register("Echo", |_args, _queue| Box::new(Echo));

        let prefix = gateway.prefix().to_string();
        let id = QueueOps::new(gateway, &events)
            .enqueue("default", "Echo", json!({"x": 1}), true, &prefix)?
            .expect("not vetoed");

        let popped = QueueOps::new(gateway, &events)
            .pop("default")?
            .expect("job should be present");
        assert_eq!(popped.id, id);
        assert_eq!(popped.class, "Echo");

        let status = StatusTracker::new(gateway).get(&id)?.expect("tracked");
        assert_eq!(status.status, JobState::Waiting);

        let mut handler = factory.create(&popped.class, popped.argument().clone(), "default")?;
        assert!(handler.perform().is_ok());

        Ok(())
    });
}

#[test]
fn handler_exception_is_recorded_as_failed() {
    run_with_test_prefix(|gateway| {
        let events = EventBus::new();
        let mut factory = Factory::new();
        factory.register("Boom", |_args, _queue| Box::new(Boom));

        let id = QueueOps::new(gateway, &events)
            .enqueue("default", "Boom", Value::Null, true, "")?
            .expect("not vetoed");

        let envelope = QueueOps::new(gateway, &events).pop("default")?.expect("job present");
        assert_eq!(envelope.id, id);

        let mut handler = factory.create("Boom", Value::Null, "default")?;
        assert!(handler.perform().is_err());

        StatusTracker::new(gateway).update(&id, JobState::Failed, Some(json!({"error": "boom"})))?;
        let status = StatusTracker::new(gateway).get(&id)?.expect("tracked");
        assert_eq!(status.status, JobState::Failed);

        Ok(())
    });
}

#[test]
fn supervisor_forks_a_throwing_handler_and_records_it_failed() {
    run_with_test_prefix(|gateway| {
        let events = EventBus::new();
        let mut factory = Factory::new();
        factory.register("Boom", |_args, _queue| Box::new(Boom));

        let envelope = Envelope::new("Boom", json!({"n": 1}), "");
        StatusTracker::new(gateway).create(&envelope.id)?;

        let worker_id = WorkerId::new("thishost", std::process::id(), &["default".to_string()]);
        let mut signals = SignalWatcher::install().expect("installing signal handlers");

        let (outcome, _) = Supervisor::execute(
            gateway,
            &events,
            &factory,
            &worker_id,
            "default",
            &envelope,
            &mut signals,
        )?;
        assert_eq!(outcome, Outcome::Failed);

        let status = StatusTracker::new(gateway).get(&envelope.id)?.expect("tracked");
        assert_eq!(status.status, JobState::Failed);

        let failed = gateway.lrange("failed", 0, -1)?;
        assert_eq!(failed.len(), 1);
        let record: Value = serde_json::from_str(&failed[0]).map_err(Error::Json)?;
        assert_eq!(record["exception"], "HandlerException");
        assert_eq!(record["payload"]["class"], "Boom");
        assert_eq!(record["payload"]["id"], envelope.id);

        let failed_count = Stats::new(gateway).get("failed")?;
        assert_eq!(failed_count, 1);

        assert!(Registry::new(gateway).get_processing(&worker_id.to_string())?.is_none());

        Ok(())
    });
}

#[test]
fn blocking_multi_queue_reservation_returns_the_ready_queue() {
    run_with_test_prefix(|gateway| {
        let events = EventBus::new();
        QueueOps::new(gateway, &events).enqueue("b", "Echo", json!(null), false, "")?;

        let queues = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let (queue, envelope) = QueueOps::new(gateway, &events)
            .blocking_pop(&queues, 1)?
            .expect("job should be available on queue b");
        assert_eq!(queue, "b");
        assert_eq!(envelope.class, "Echo");

        Ok(())
    });
}

#[test]
fn selective_remove_drops_matching_jobs_and_preserves_order() {
    run_with_test_prefix(|gateway| {
        let events = EventBus::new();
        let mut ops = QueueOps::new(gateway, &events);
        ops.enqueue("q", "Keep", json!({"n": 1}), false, "")?;
        ops.enqueue("q", "Drop", json!({"n": 2}), false, "")?;
        ops.enqueue("q", "Keep", json!({"n": 3}), false, "")?;

        let removed = ops.selective_remove("q", &[Matcher::ClassOnly("Drop".to_string())])?;
        assert_eq!(removed, 1);

        let remaining = ops.list_jobs("q")?;
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].argument(), &json!({"n": 1}));
        assert_eq!(remaining[1].argument(), &json!({"n": 3}));

        Ok(())
    });
}

#[test]
fn prune_reaps_a_dead_sibling_and_records_its_orphan_job() {
    run_with_test_prefix(|gateway| {
        let dead = WorkerId::new("thishost", 999_999, &["default".to_string()]);
        Registry::new(gateway).register(&dead)?;
        Registry::new(gateway).set_processing(
            &dead,
            &ProcessingPointer {
                queue: "default".to_string(),
                run_at: chrono::Utc::now(),
                payload: json!({"class": "Echo", "args": [null]}),
            },
        )?;

        let pruned = Registry::new(gateway).prune("thishost")?;
        assert_eq!(pruned, 1);

        let remaining = Registry::new(gateway).all()?;
        assert!(!remaining.contains(&dead.to_string()));

        Ok(())
    });
}

#[test]
fn envelope_survives_a_round_trip_through_redis() {
    run_with_test_prefix(|gateway| {
        let original = Envelope::new("Echo", json!({"a": 1}), "");
        gateway.rpush("queue:roundtrip", &original.to_json().map_err(Error::Json)?)?;
        let raw = gateway.lpop("queue:roundtrip")?.expect("present");
        let decoded = Envelope::from_json(&raw).map_err(Error::Json)?;
        assert_eq!(decoded.class, original.class);
        assert_eq!(decoded.argument(), original.argument());
        Ok(())
    });
}
