//! Named monotonic counters. The core only ever `INCR`s; nothing resets a
//! stat once written.

use crate::error::Result;
use crate::redis_gateway::RedisGateway;

pub struct Stats<'a> {
    gateway: &'a mut RedisGateway,
}

impl<'a> Stats<'a> {
    pub fn new(gateway: &'a mut RedisGateway) -> Self {
        Stats { gateway }
    }

    fn key(name: &str) -> String {
        format!("stat:{}", name)
    }

    pub fn incr(&mut self, name: &str) -> Result<i64> {
        self.gateway.incr(&Self::key(name), 1)
    }

    pub fn get(&mut self, name: &str) -> Result<i64> {
        Ok(self
            .gateway
            .get(&Self::key(name))?
            .map(|v| v.parse::<i64>())
            .transpose()?
            .unwrap_or(0))
    }

    /// `INCR stat:processed` and `stat:processed:<worker_id>` together, as
    /// done whenever a job completes successfully.
    pub fn record_processed(&mut self, worker_id: &str) -> Result<()> {
        self.incr("processed")?;
        self.incr(&format!("processed:{}", worker_id))?;
        Ok(())
    }

    /// `INCR stat:failed` and `stat:failed:<worker_id>` together.
    pub fn record_failed(&mut self, worker_id: &str) -> Result<()> {
        self.incr("failed")?;
        self.incr(&format!("failed:{}", worker_id))?;
        Ok(())
    }
}
