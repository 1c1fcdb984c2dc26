//! The top-level state machine: reserve a job, hand it to the execution
//! supervisor, record the outcome, repeat; honors the operator signals
//! mapped in `signals`, prunes dead siblings at startup, and unregisters
//! cleanly at shutdown.

use std::thread;

use serde_json::Value;
use tracing::{event, Level};

use crate::config::Config;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::events::{self, EventBus};
use crate::factory::Factory;
use crate::failed::FailedLog;
use crate::queue::QueueOps;
use crate::redis_gateway::RedisGateway;
use crate::registry::{Registry, WorkerId};
use crate::shutdown::GracefulShutdown;
use crate::signals::{PendingSignals, SignalWatcher};
use crate::stats::Stats;
use crate::supervisor::Supervisor;

enum LoopControl {
    Continue,
    Stop,
}

pub struct Worker {
    gateway: RedisGateway,
    events: EventBus,
    factory: Factory,
    config: Config,
    id: WorkerId,
    signals: SignalWatcher,
    shutdown: GracefulShutdown,
    paused: bool,
    fired_before_first_fork: bool,
    /// Signals observed by the supervisor while waiting on a child, not
    /// yet acted on because the job hadn't finished. Folded into the next
    /// iteration's poll so a TERM that lands mid-job isn't lost.
    carried: PendingSignals,
}

impl Worker {
    pub fn new(gateway: RedisGateway, events: EventBus, factory: Factory, config: Config) -> Result<Self> {
        let host = WorkerId::current_host();
        let queues = config.queues.clone().unwrap_or_default();
        let id = WorkerId::new(host, std::process::id(), &queues);
        Ok(Worker {
            gateway,
            events,
            factory,
            config,
            id,
            signals: SignalWatcher::install()?,
            shutdown: GracefulShutdown::new(),
            paused: false,
            fired_before_first_fork: false,
            carried: PendingSignals::default(),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn run(&mut self) -> Result<()> {
        self.startup()?;
        loop {
            match self.tick()? {
                LoopControl::Continue => continue,
                LoopControl::Stop => break,
            }
        }
        self.shutdown_cleanly()
    }

    fn startup(&mut self) -> Result<()> {
        Registry::new(&mut self.gateway).register(&self.id)?;
        let pruned = Registry::new(&mut self.gateway).prune(&self.id.host)?;
        if pruned > 0 {
            event!(Level::INFO, count = pruned, "Pruned dead sibling workers on this host");
        }
        event!(Level::INFO, worker = %self.id, "Worker started");
        Ok(())
    }

    fn shutdown_cleanly(&mut self) -> Result<()> {
        event!(Level::INFO, worker = %self.id, "Worker shutting down");
        Registry::new(&mut self.gateway).unregister(&self.id)?;
        self.gateway.disconnect();
        Ok(())
    }

    fn tick(&mut self) -> Result<LoopControl> {
        let mut pending = self.signals.poll();
        pending.merge(self.carried);
        self.carried = PendingSignals::default();

        if pending.reconnect {
            event!(Level::WARN, "Reconnecting to Redis after SIGPIPE");
            self.gateway.reconnect_with_backoff()?;
        }
        if pending.pause {
            event!(Level::INFO, worker = %self.id, "Pausing reservation");
            self.paused = true;
        }
        if pending.resume {
            event!(Level::INFO, worker = %self.id, "Resuming reservation");
            self.paused = false;
        }
        if pending.shutdown_now {
            event!(Level::WARN, worker = %self.id, "Shutting down immediately on operator signal");
            return Ok(LoopControl::Stop);
        }
        if pending.shutdown_graceful {
            self.shutdown.signal();
        }
        if self.shutdown.consumer().is_shutting_down() {
            return Ok(LoopControl::Stop);
        }

        if self.paused {
            thread::sleep(self.config.interval);
            return Ok(LoopControl::Continue);
        }

        let reservation = self.reserve()?;
        let (queue, envelope) = match reservation {
            Some(r) => r,
            None => {
                if !self.config.blocking {
                    thread::sleep(self.config.interval);
                }
                return Ok(LoopControl::Continue);
            }
        };

        if !self.fired_before_first_fork {
            self.events.trigger(events::BEFORE_FIRST_FORK, &Value::Null);
            self.fired_before_first_fork = true;
        }

        let (outcome, mid_wait_signals) = Supervisor::execute(
            &mut self.gateway,
            &self.events,
            &self.factory,
            &self.id,
            &queue,
            &envelope,
            &mut self.signals,
        )?;
        self.carried = mid_wait_signals;

        event!(Level::INFO, job = %envelope.id, class = %envelope.class, queue = %queue, outcome = ?outcome, "Job finished");

        Ok(LoopControl::Continue)
    }

    /// Resolves the queue list to reserve from this iteration (re-reading
    /// and sorting the live queue set when configured as `*`), then
    /// reserves according to the configured blocking mode. A malformed
    /// element is recorded as a failure and swallowed rather than
    /// propagated, so one bad payload doesn't bring the whole loop down.
    fn reserve(&mut self) -> Result<Option<(String, Envelope)>> {
        let queues = self.resolve_queues()?;
        if queues.is_empty() {
            return Ok(None);
        }

        let popped = if self.config.blocking {
            let timeout = self.config.interval.as_secs().max(1);
            QueueOps::new(&mut self.gateway, &self.events).blocking_pop(&queues, timeout)
        } else {
            let mut result = Ok(None);
            for queue in &queues {
                match QueueOps::new(&mut self.gateway, &self.events).pop(queue) {
                    Ok(Some(envelope)) => {
                        result = Ok(Some((queue.clone(), envelope)));
                        break;
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                }
            }
            result
        };

        match popped {
            Ok(found) => Ok(found),
            Err(Error::MalformedEnvelope { queue, raw, .. }) => {
                self.record_malformed(&queue, &raw)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn record_malformed(&mut self, queue: &str, raw: &str) -> Result<()> {
        let worker_id = self.id.to_string();
        event!(Level::ERROR, queue = %queue, "Dropping malformed queue element");
        FailedLog::new(&mut self.gateway).record_fault(
            &Value::String(raw.to_string()),
            "malformed queue element (invalid JSON)",
            &worker_id,
            queue,
        )?;
        Stats::new(&mut self.gateway).record_failed(&worker_id)?;
        Ok(())
    }

    fn resolve_queues(&mut self) -> Result<Vec<String>> {
        match &self.config.queues {
            Some(queues) => Ok(queues.clone()),
            None => {
                let mut all = QueueOps::new(&mut self.gateway, &self.events).list_queues()?;
                all.sort();
                Ok(all)
            }
        }
    }
}
