//! Set of live worker identities; per-worker processing pointer, PID
//! record, and started-at. Also the startup prune scan that reaps
//! registrations for workers whose OS process no longer exists on this
//! host.

use chrono::Utc;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{event, Level};

use crate::error::Result;
use crate::failed::FailedLog;
use crate::redis_gateway::RedisGateway;
use crate::stats::Stats;

const WORKERS_SET_KEY: &str = "workers";

/// A worker id uniquely identifies a (host, os-process, queue-list)
/// triple for its lifetime: `<host>:<pid>:<queues-joined-by-comma>`, or
/// `*` in place of the queue list when watching all queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerId {
    pub host: String,
    pub pid: u32,
    pub queues_suffix: String,
}

impl WorkerId {
    pub fn new(host: impl Into<String>, pid: u32, queues: &[String]) -> Self {
        let queues_suffix = if queues.is_empty() {
            "*".to_string()
        } else {
            queues.join(",")
        };
        WorkerId {
            host: host.into(),
            pid,
            queues_suffix,
        }
    }

    pub fn current_host() -> String {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn host_from_str(s: &str) -> Option<&str> {
        s.split(':').next()
    }

    pub fn pid_from_str(s: &str) -> Option<u32> {
        s.split(':').nth(1).and_then(|p| p.parse().ok())
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.pid, self.queues_suffix)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingPointer {
    pub queue: String,
    pub run_at: chrono::DateTime<Utc>,
    pub payload: Value,
}

pub struct Registry<'a> {
    gateway: &'a mut RedisGateway,
}

impl<'a> Registry<'a> {
    pub fn new(gateway: &'a mut RedisGateway) -> Self {
        Registry { gateway }
    }

    pub fn register(&mut self, id: &WorkerId) -> Result<()> {
        let id_str = id.to_string();
        self.gateway.sadd(WORKERS_SET_KEY, &id_str)?;
        self.gateway
            .set(&started_key(&id_str), &Utc::now().to_rfc3339())?;
        Ok(())
    }

    pub fn unregister(&mut self, id: &WorkerId) -> Result<()> {
        let id_str = id.to_string();
        self.clear_processing(&id_str)?;
        self.gateway.srem(WORKERS_SET_KEY, &id_str)?;
        self.gateway.del(&started_key(&id_str))?;
        self.gateway.del(&id_str)?;
        self.gateway.del(&pid_key(&id_str))?;
        self.gateway.del(&format!("stat:processed:{}", id_str))?;
        self.gateway.del(&format!("stat:failed:{}", id_str))?;
        Ok(())
    }

    pub fn all(&mut self) -> Result<Vec<String>> {
        self.gateway.smembers(WORKERS_SET_KEY)
    }

    pub fn set_processing(&mut self, id: &WorkerId, pointer: &ProcessingPointer) -> Result<()> {
        self.gateway
            .set(&id.to_string(), &serde_json::to_string(pointer)?)?;
        Ok(())
    }

    pub fn clear_processing(&mut self, id_str: &str) -> Result<()> {
        self.gateway.del(id_str)?;
        Ok(())
    }

    pub fn get_processing(&mut self, id_str: &str) -> Result<Option<ProcessingPointer>> {
        match self.gateway.get(id_str)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_pid(&mut self, id: &WorkerId, pid: u32) -> Result<()> {
        self.gateway.set(&pid_key(&id.to_string()), &pid.to_string())
    }

    pub fn clear_pid(&mut self, id: &WorkerId) -> Result<()> {
        self.gateway.del(&pid_key(&id.to_string()))
    }

    pub fn get_pid(&mut self, id_str: &str) -> Result<Option<u32>> {
        match self.gateway.get(&pid_key(id_str))? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// At startup, enumerate all registered workers whose host matches
    /// ours. For each one whose PID no longer refers to a live process,
    /// treat the entry as dead: if it has a processing pointer, record a
    /// failure for the orphan job, then unregister it. Returns the number
    /// of dead siblings pruned.
    pub fn prune(&mut self, current_host: &str) -> Result<usize> {
        let mut pruned = 0;
        for id_str in self.all()? {
            let host = match WorkerId::host_from_str(&id_str) {
                Some(h) => h,
                None => continue,
            };
            if host != current_host {
                continue;
            }

            let pid = self.get_pid(&id_str)?;
            let alive = pid.map(process_is_alive).unwrap_or(false);
            if alive {
                continue;
            }

            event!(Level::INFO, worker=%id_str, "Pruning dead worker");

            if let Some(pointer) = self.get_processing(&id_str)? {
                FailedLog::new(self.gateway).record_fault(
                    &pointer.payload,
                    "worker vanished",
                    &id_str,
                    &pointer.queue,
                )?;
                Stats::new(self.gateway).record_failed(&id_str)?;
            }

            self.clear_processing(&id_str)?;
            self.gateway.srem(WORKERS_SET_KEY, &id_str)?;
            self.gateway.del(&started_key(&id_str))?;
            self.gateway.del(&pid_key(&id_str))?;
            pruned += 1;
        }
        Ok(pruned)
    }
}

fn started_key(id_str: &str) -> String {
    format!("worker:{}:started", id_str)
}

fn pid_key(id_str: &str) -> String {
    format!("worker:{}:pid", id_str)
}

/// `true` unless the `kill(pid, 0)`-equivalent probe fails with `ESRCH`
/// (no such process). Any other failure (e.g. permission denied for a
/// PID owned by another user) is treated as "still alive" since we can't
/// prove otherwise.
pub fn process_is_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::Error::ESRCH) => false,
        Err(_) => true,
    }
}
