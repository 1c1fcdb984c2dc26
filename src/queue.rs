//! Enqueue, pop, blocking multi-pop, size, list, remove-queue, and
//! selective-remove. Maintains the `queues` set as a side effect of
//! enqueue.

use serde_json::{json, Map, Value};
use tracing::{event, Level};

use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::events::{self, EventBus};
use crate::redis_gateway::RedisGateway;
use crate::status::StatusTracker;

const QUEUES_SET_KEY: &str = "queues";

fn queue_list_key(queue: &str) -> String {
    format!("queue:{}", queue)
}

/// A matcher for `selective_remove`: a bare class name, a class plus exact
/// job id, or a class plus a partial-match argument object.
#[derive(Debug, Clone)]
pub enum Matcher {
    ClassOnly(String),
    ClassAndId { class: String, id: String },
    ClassAndArgs { class: String, args: Map<String, Value> },
}

impl Matcher {
    pub fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            Matcher::ClassOnly(class) => &envelope.class == class,
            Matcher::ClassAndId { class, id } => {
                &envelope.class == class && &envelope.id == id
            }
            Matcher::ClassAndArgs { class, args } => {
                if args.is_empty() || &envelope.class != class {
                    return false;
                }
                let job_args = match envelope.argument().as_object() {
                    Some(obj) => obj,
                    None => return false,
                };
                args.iter()
                    .all(|(k, v)| job_args.get(k).map(|jv| jv == v).unwrap_or(false))
            }
        }
    }
}

pub struct QueueOps<'a> {
    gateway: &'a mut RedisGateway,
    events: &'a EventBus,
}

impl<'a> QueueOps<'a> {
    pub fn new(gateway: &'a mut RedisGateway, events: &'a EventBus) -> Self {
        QueueOps { gateway, events }
    }

    /// Enqueue a job. Returns the generated job id, or `None` if a
    /// `beforeEnqueue` listener vetoed creation.
    pub fn enqueue(
        &mut self,
        queue: &str,
        class: &str,
        args: Value,
        track_status: bool,
        prefix: &str,
    ) -> Result<Option<String>> {
        let envelope = Envelope::new(class, args.clone(), prefix);
        let hook_payload = json!({
            "class": class,
            "args": args,
            "queue": queue,
            "id": envelope.id,
        });

        if self.events.trigger(events::BEFORE_ENQUEUE, &hook_payload) == events::Decision::Veto {
            return Ok(None);
        }

        self.gateway.sadd(QUEUES_SET_KEY, queue)?;
        self.gateway
            .rpush(&queue_list_key(queue), &envelope.to_json()?)?;

        if track_status {
            StatusTracker::new(self.gateway).create(&envelope.id)?;
        }

        self.events.trigger(events::AFTER_ENQUEUE, &hook_payload);

        Ok(Some(envelope.id))
    }

    pub fn pop(&mut self, queue: &str) -> Result<Option<Envelope>> {
        match self.gateway.lpop(&queue_list_key(queue))? {
            Some(raw) => Ok(Some(decode_or_log(&raw, queue)?)),
            None => Ok(None),
        }
    }

    /// `BLPOP` across several queues at once; returns the queue the job
    /// came from alongside the envelope, preserving Redis's native
    /// fairness across the list of keys.
    pub fn blocking_pop(
        &mut self,
        queues: &[String],
        timeout_secs: u64,
    ) -> Result<Option<(String, Envelope)>> {
        match self.gateway.blpop(queues, timeout_secs)? {
            Some((queue, raw)) => Ok(Some((queue.clone(), decode_or_log(&raw, &queue)?))),
            None => Ok(None),
        }
    }

    pub fn size(&mut self, queue: &str) -> Result<usize> {
        self.gateway.llen(&queue_list_key(queue))
    }

    pub fn list_queues(&mut self) -> Result<Vec<String>> {
        self.gateway.smembers(QUEUES_SET_KEY)
    }

    pub fn list_jobs(&mut self, queue: &str) -> Result<Vec<Envelope>> {
        self.gateway
            .lrange(&queue_list_key(queue), 0, -1)?
            .iter()
            .map(|raw| decode_or_log(raw, queue))
            .collect()
    }

    pub fn remove_queue(&mut self, queue: &str) -> Result<()> {
        self.gateway.del(&queue_list_key(queue))?;
        self.gateway.srem(QUEUES_SET_KEY, queue)?;
        Ok(())
    }

    /// Best-effort operator tool, not a filter: the temp-list shuffle is
    /// non-atomic, so a concurrent enqueue during the shuffle lands after
    /// the restored elements and is not examined. Preserves the relative
    /// order of everything that isn't removed.
    pub fn selective_remove(&mut self, queue: &str, matchers: &[Matcher]) -> Result<usize> {
        let source = queue_list_key(queue);
        let temp = format!("{}:selective-remove-temp", source);
        let requeue = format!("{}:selective-remove-requeue", source);
        let mut removed = 0usize;

        loop {
            let raw = match self.gateway.rpoplpush(&source, &temp)? {
                Some(raw) => raw,
                None => break,
            };

            let should_drop = match Envelope::from_json(&raw) {
                Ok(envelope) => matchers.iter().any(|m| m.matches(&envelope)),
                Err(e) => {
                    event!(Level::ERROR, error=%e, queue=%queue, "Dropping unparseable queue element during selective remove");
                    true
                }
            };

            if should_drop {
                self.gateway.lpop(&temp)?;
                removed += 1;
            } else {
                self.gateway.rpoplpush(&temp, &requeue)?;
            }
        }

        while self.gateway.rpoplpush(&requeue, &source)?.is_some() {}

        self.gateway.del(&temp)?;
        self.gateway.del(&requeue)?;

        Ok(removed)
    }
}

/// A malformed element popped off a queue can't just be propagated as a
/// generic JSON error: the spec'd handling is to drop it, count it as a
/// failure, and log the raw payload, which needs the raw string and the
/// originating queue name to survive past this call.
fn decode_or_log(raw: &str, queue: &str) -> Result<Envelope> {
    Envelope::from_json(raw).map_err(|e| {
        event!(Level::ERROR, error=%e, queue=%queue, "Failed to decode queue envelope");
        Error::MalformedEnvelope {
            queue: queue.to_string(),
            raw: raw.to_string(),
            source: e,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(class: &str, args: Value, id: &str) -> Envelope {
        let mut e = Envelope::new(class, args, "");
        e.id = id.to_string();
        e
    }

    #[test]
    fn class_only_matcher() {
        let m = Matcher::ClassOnly("A".to_string());
        assert!(m.matches(&job("A", json!(null), "1")));
        assert!(!m.matches(&job("B", json!(null), "1")));
    }

    #[test]
    fn class_and_id_matcher_requires_both() {
        let m = Matcher::ClassAndId {
            class: "A".to_string(),
            id: "1".to_string(),
        };
        assert!(m.matches(&job("A", json!(null), "1")));
        assert!(!m.matches(&job("A", json!(null), "2")));
        assert!(!m.matches(&job("B", json!(null), "1")));
    }

    #[test]
    fn class_and_args_matcher_is_a_subset_match() {
        let mut args = Map::new();
        args.insert("user_id".to_string(), json!(5));
        let m = Matcher::ClassAndArgs {
            class: "A".to_string(),
            args,
        };
        assert!(m.matches(&job("A", json!({"user_id": 5, "extra": "ignored"}), "1")));
        assert!(!m.matches(&job("A", json!({"user_id": 6}), "1")));
        assert!(!m.matches(&job("B", json!({"user_id": 5}), "1")));
    }

    #[test]
    fn class_and_args_matcher_is_never_vacuously_true() {
        let m = Matcher::ClassAndArgs {
            class: "A".to_string(),
            args: Map::new(),
        };
        assert!(!m.matches(&job("A", json!({"user_id": 5}), "1")));
    }
}
