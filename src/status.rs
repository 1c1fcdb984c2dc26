//! Per-job status record, enabled only when the producer opts in.
//! `WAITING -> RUNNING -> {COMPLETE, FAILED}`. Terminal states get a 24h
//! TTL; a job never tracked has no record at all, and `update` on an
//! untracked job silently no-ops rather than creating one (matching the
//! original's behavior, so opting out of tracking stays opted out).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::redis_gateway::RedisGateway;

const TERMINAL_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Running,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: JobState,
    pub updated: DateTime<Utc>,
    pub started: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

pub struct StatusTracker<'a> {
    gateway: &'a mut RedisGateway,
}

impl<'a> StatusTracker<'a> {
    pub fn new(gateway: &'a mut RedisGateway) -> Self {
        StatusTracker { gateway }
    }

    fn key(id: &str) -> String {
        format!("job:{}:status", id)
    }

    pub fn create(&mut self, id: &str) -> Result<()> {
        let now = Utc::now();
        let record = StatusRecord {
            status: JobState::Waiting,
            updated: now,
            started: now,
            result: None,
        };
        self.gateway.set(&Self::key(id), &serde_json::to_string(&record)?)?;
        Ok(())
    }

    /// No-op if there is no existing record for `id` — a job that was
    /// never tracked stays untracked.
    pub fn update(&mut self, id: &str, new_status: JobState, result: Option<Value>) -> Result<()> {
        let key = Self::key(id);
        let existing = match self.gateway.get(&key)? {
            Some(raw) => raw,
            None => return Ok(()),
        };
        let mut record: StatusRecord = serde_json::from_str(&existing)?;
        record.status = new_status;
        record.updated = Utc::now();
        if new_status.is_terminal() {
            record.result = result;
        }
        self.gateway.set(&key, &serde_json::to_string(&record)?)?;
        if new_status.is_terminal() {
            self.gateway.expire(&key, TERMINAL_TTL_SECS)?;
        }
        Ok(())
    }

    pub fn get(&mut self, id: &str) -> Result<Option<StatusRecord>> {
        match self.gateway.get(&Self::key(id))? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn is_tracking(&mut self, id: &str) -> Result<bool> {
        Ok(self.gateway.get(&Self::key(id))?.is_some())
    }
}
