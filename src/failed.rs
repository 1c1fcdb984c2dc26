//! Append-only log of failure records. Two entry points exist because
//! exceptions raised by handler code and lower-level faults (OS-level
//! kills, forced termination) are typically unrecoverable in different
//! ways, but both land in the same Redis list.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::redis_gateway::RedisGateway;

const FAILED_LIST_KEY: &str = "failed";

#[derive(Debug, Serialize)]
struct FailedRecord<'a> {
    failed_at: String,
    payload: &'a Value,
    exception: &'a str,
    error: &'a str,
    backtrace: &'a [String],
    worker: &'a str,
    queue: &'a str,
}

pub struct FailedLog<'a> {
    gateway: &'a mut RedisGateway,
}

impl<'a> FailedLog<'a> {
    pub fn new(gateway: &'a mut RedisGateway) -> Self {
        FailedLog { gateway }
    }

    /// Record a failure raised by handler code.
    pub fn record_exception(
        &mut self,
        payload: &Value,
        exception_kind: &str,
        message: &str,
        backtrace: &[String],
        worker_id: &str,
        queue: &str,
    ) -> Result<()> {
        self.append(payload, exception_kind, message, backtrace, worker_id, queue)
    }

    /// Record a lower-level fault: a child that exited nonzero or was
    /// killed by a signal, synthesized by the parent because the child
    /// never got the chance to record its own failure.
    pub fn record_fault(
        &mut self,
        payload: &Value,
        message: &str,
        worker_id: &str,
        queue: &str,
    ) -> Result<()> {
        self.append(payload, "HandlerFault", message, &[], worker_id, queue)
    }

    fn append(
        &mut self,
        payload: &Value,
        exception_kind: &str,
        message: &str,
        backtrace: &[String],
        worker_id: &str,
        queue: &str,
    ) -> Result<()> {
        let record = FailedRecord {
            failed_at: Utc::now().to_rfc3339(),
            payload,
            exception: exception_kind,
            error: message,
            backtrace,
            worker: worker_id,
            queue,
        };
        self.gateway
            .rpush(FAILED_LIST_KEY, &serde_json::to_string(&record)?)?;
        Ok(())
    }
}
