//! Thin adapter over the synchronous `redis` client: key-prefixing,
//! reconnect-after-fork, and typed wrappers for the commands the core uses.
//!
//! The worker is single-threaded and blocking by design (see
//! `supervisor::Supervisor`): forking a process that holds a live socket
//! shared with another thread/task would corrupt both ends, so the whole
//! crate uses the blocking `redis` API instead of `ergo`'s `tokio-comp`
//! one, and the connection is torn down and rebuilt explicitly at the
//! fork boundary rather than pooled.

use std::time::Duration;

use backoff::{backoff::Backoff, ExponentialBackoff};
use redis::Commands;
use tracing::{event, Level};

use crate::error::{Error, Result};

/// A single Redis connection plus the key prefix this worker was configured
/// with. Connections are never shared across `fork()`: the parent drops its
/// connection with `disconnect()` before forking, and the child calls
/// `reconnect()` to open its own.
pub struct RedisGateway {
    url: String,
    prefix: String,
    conn: Option<redis::Connection>,
}

impl RedisGateway {
    pub fn new(url: impl Into<String>, prefix: impl Into<String>) -> Result<Self> {
        let mut gateway = RedisGateway {
            url: url.into(),
            prefix: prefix.into(),
            conn: None,
        };
        gateway.reconnect()?;
        Ok(gateway)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `queue:<name>` style keys get the worker's configured prefix glued on
    /// front, e.g. `myapp:queue:default`.
    pub fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.prefix, key)
        }
    }

    /// Discard the current connection. Must be called in the parent
    /// immediately before `fork()`.
    pub fn disconnect(&mut self) {
        self.conn = None;
    }

    /// (Re)establish the connection. Called in the child right after
    /// `fork()`, and by the reconnect-with-backoff path after a connection
    /// fault.
    pub fn reconnect(&mut self) -> Result<()> {
        let client = redis::Client::open(self.url.as_str())?;
        self.conn = Some(client.get_connection()?);
        Ok(())
    }

    fn conn(&mut self) -> Result<&mut redis::Connection> {
        self.conn.as_mut().ok_or(Error::NotConnected)
    }

    /// Retry `reconnect` with exponential backoff, as spec'd for handling a
    /// Redis disconnect mid-loop. Gives up (and surfaces the last error)
    /// once the backoff schedule is exhausted.
    pub fn reconnect_with_backoff(&mut self) -> Result<()> {
        let mut backoff = Self::default_backoff();
        loop {
            match self.reconnect() {
                Ok(()) => return Ok(()),
                Err(e) => match backoff.next_backoff() {
                    Some(delay) => {
                        event!(Level::ERROR, error=%e, delay=?delay, "Redis reconnect failed, backing off");
                        std::thread::sleep(delay);
                    }
                    None => return Err(e),
                },
            }
        }
    }

    pub fn default_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: Duration::from_millis(100),
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        }
    }

    // -- typed command wrappers -------------------------------------------------

    pub fn rpush(&mut self, key: &str, value: &str) -> Result<()> {
        let key = self.prefixed_key(key);
        self.conn()?.rpush(&key, value)?;
        Ok(())
    }

    pub fn lpop(&mut self, key: &str) -> Result<Option<String>> {
        let key = self.prefixed_key(key);
        Ok(self.conn()?.lpop(&key, None)?)
    }

    /// `BLPOP` across several prefixed queue keys. Returns the bare
    /// (unprefixed, `queue:`-stripped) queue name and the raw element.
    pub fn blpop(
        &mut self,
        queue_names: &[String],
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>> {
        let keys: Vec<String> = queue_names
            .iter()
            .map(|q| self.prefixed_key(&format!("queue:{}", q)))
            .collect();
        let mut cmd = redis::cmd("BLPOP");
        for k in &keys {
            cmd.arg(k);
        }
        cmd.arg(timeout_secs);
        let result: Option<(String, String)> = cmd.query(self.conn()?)?;
        match result {
            Some((key, value)) => Ok(Some((self.strip_queue_key(&key), value))),
            None => Ok(None),
        }
    }

    /// Strip the client's configured prefix and the literal `queue:` segment
    /// to recover the bare queue name BLPOP returned.
    fn strip_queue_key(&self, key: &str) -> String {
        let key = if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&format!("{}:", self.prefix)).unwrap_or(key)
        };
        key.strip_prefix("queue:").unwrap_or(key).to_string()
    }

    pub fn llen(&mut self, key: &str) -> Result<usize> {
        let key = self.prefixed_key(key);
        Ok(self.conn()?.llen(&key)?)
    }

    pub fn lrange(&mut self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let key = self.prefixed_key(key);
        Ok(self.conn()?.lrange(&key, start, stop)?)
    }

    pub fn del(&mut self, key: &str) -> Result<()> {
        let key = self.prefixed_key(key);
        self.conn()?.del(&key)?;
        Ok(())
    }

    pub fn sadd(&mut self, key: &str, member: &str) -> Result<()> {
        let key = self.prefixed_key(key);
        self.conn()?.sadd(&key, member)?;
        Ok(())
    }

    pub fn srem(&mut self, key: &str, member: &str) -> Result<()> {
        let key = self.prefixed_key(key);
        self.conn()?.srem(&key, member)?;
        Ok(())
    }

    pub fn smembers(&mut self, key: &str) -> Result<Vec<String>> {
        let key = self.prefixed_key(key);
        Ok(self.conn()?.smembers(&key)?)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let key = self.prefixed_key(key);
        self.conn()?.set(&key, value)?;
        Ok(())
    }

    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        let key = self.prefixed_key(key);
        Ok(self.conn()?.get(&key)?)
    }

    pub fn expire(&mut self, key: &str, seconds: i64) -> Result<()> {
        let key = self.prefixed_key(key);
        self.conn()?.expire(&key, seconds as usize)?;
        Ok(())
    }

    pub fn incr(&mut self, key: &str, by: i64) -> Result<i64> {
        let key = self.prefixed_key(key);
        Ok(self.conn()?.incr(&key, by)?)
    }

    pub fn decr(&mut self, key: &str, by: i64) -> Result<i64> {
        let key = self.prefixed_key(key);
        Ok(self.conn()?.decr(&key, by)?)
    }

    pub fn rpoplpush(&mut self, src: &str, dst: &str) -> Result<Option<String>> {
        let src = self.prefixed_key(src);
        let dst = self.prefixed_key(dst);
        Ok(self.conn()?.rpoplpush(&src, &dst)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with_prefix(prefix: &str) -> RedisGateway {
        RedisGateway {
            url: String::new(),
            prefix: prefix.to_string(),
            conn: None,
        }
    }

    #[test]
    fn prefixed_key_with_prefix() {
        let gw = gateway_with_prefix("myapp");
        assert_eq!(gw.prefixed_key("queue:default"), "myapp:queue:default");
    }

    #[test]
    fn prefixed_key_without_prefix() {
        let gw = gateway_with_prefix("");
        assert_eq!(gw.prefixed_key("queue:default"), "queue:default");
    }

    #[test]
    fn strip_queue_key_with_prefix() {
        let gw = gateway_with_prefix("myapp");
        assert_eq!(gw.strip_queue_key("myapp:queue:default"), "default");
    }

    #[test]
    fn strip_queue_key_without_prefix() {
        let gw = gateway_with_prefix("");
        assert_eq!(gw.strip_queue_key("queue:default"), "default");
    }

    #[test]
    fn not_connected_errors_before_reconnect() {
        let mut gw = gateway_with_prefix("");
        match gw.llen("queues") {
            Err(Error::NotConnected) => {}
            other => panic!("expected NotConnected, got {:?}", other),
        }
    }
}
