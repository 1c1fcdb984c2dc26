//! Runs exactly one job by forking the current process: the child performs
//! the handler in isolation and exits; the parent waits, interprets the
//! exit status, and reconciles Redis bookkeeping either way.
//!
//! This is the one place the transformed worker diverges from the
//! teacher's own concurrency model. `ergo-queues` runs jobs as async tasks
//! under `tokio` and coordinates state transitions with Lua scripts; this
//! worker instead forks a fresh OS process per job and is forbidden from
//! Lua/`MULTI`/`EXEC`, so the connection has to be torn down before
//! `fork()` and rebuilt on each side, and "did the job crash" is read off
//! a real exit status rather than an async `Result`.

use std::process;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult};
use serde_json::json;
use tracing::{event, Level};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::events::{self, Decision, EventBus};
use crate::factory::Factory;
use crate::failed::FailedLog;
use crate::redis_gateway::RedisGateway;
use crate::registry::{ProcessingPointer, Registry, WorkerId};
use crate::signals::{PendingSignals, SignalWatcher};
use crate::stats::Stats;
use crate::status::{JobState, StatusTracker};

/// What became of a job once its supervising fork finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Processed,
    Failed,
    /// A `beforePerform` listener vetoed the run before any fork happened.
    Skipped,
}

pub struct Supervisor;

impl Supervisor {
    /// Fork, run, wait, and reconcile. `signals` is polled (non-blockingly)
    /// while waiting on the child so a `USR1`/`TERM` arriving mid-job can
    /// still kill it promptly; any signals observed are folded into the
    /// returned `PendingSignals` so the caller's control loop doesn't miss
    /// them just because they landed during a wait instead of at the top
    /// of the loop.
    pub fn execute(
        gateway: &mut RedisGateway,
        events: &EventBus,
        factory: &Factory,
        worker_id: &WorkerId,
        queue: &str,
        envelope: &Envelope,
        signals: &mut SignalWatcher,
    ) -> Result<(Outcome, PendingSignals)> {
        let hook_payload = json!({
            "class": envelope.class,
            "args": envelope.argument(),
            "queue": queue,
            "id": envelope.id,
        });

        if events.trigger(events::BEFORE_PERFORM, &hook_payload) == Decision::Veto {
            Registry::new(gateway).clear_processing(&worker_id.to_string())?;
            return Ok((Outcome::Skipped, PendingSignals::default()));
        }

        let pointer = ProcessingPointer {
            queue: queue.to_string(),
            run_at: chrono::Utc::now(),
            payload: serde_json::to_value(envelope)?,
        };
        Registry::new(gateway).set_processing(worker_id, &pointer)?;
        StatusTracker::new(gateway).update(&envelope.id, JobState::Running, None)?;

        events.trigger(events::BEFORE_FORK, &hook_payload);

        // The connection must be dropped before forking: a duplicated
        // socket fd shared between parent and child corrupts both ends the
        // instant either side writes to it.
        gateway.disconnect();

        match unsafe { fork() }? {
            ForkResult::Child => {
                gateway
                    .reconnect()
                    .expect("reconnecting to Redis in the forked child");
                if let Err(e) = Registry::new(gateway).set_pid(worker_id, process::id()) {
                    event!(Level::ERROR, error=%e, "failed to record child pid");
                }
                set_process_title(queue, pointer.run_at);

                let success = run_handler(gateway, events, factory, worker_id, queue, envelope, &hook_payload);
                process::exit(if success { 0 } else { 1 });
            }
            ForkResult::Parent { child } => {
                events.trigger(events::AFTER_FORK, &hook_payload);

                let mut accumulated = PendingSignals::default();
                let status = loop {
                    let pending = signals.poll();
                    accumulated.merge(pending);
                    if pending.shutdown_now || pending.kill_child {
                        event!(Level::WARN, pid=%child, "Killing job child on operator signal");
                        let _ = kill(child, Signal::SIGKILL);
                    }

                    match waitpid(child, Some(WaitPidFlag::WNOHANG))? {
                        WaitStatus::StillAlive => {
                            std::thread::sleep(Duration::from_millis(50));
                            continue;
                        }
                        status => break status,
                    }
                };

                let outcome = interpret_status(status, gateway, worker_id, queue, envelope)?;
                Registry::new(gateway).clear_processing(&worker_id.to_string())?;
                Registry::new(gateway).clear_pid(worker_id)?;
                Ok((outcome, accumulated))
            }
        }
    }
}

/// Runs in the forked child only. Returns whether the handler succeeded;
/// the child always reports the outcome to Redis itself before exiting,
/// since an OS-level exit status alone can't carry a result value or
/// error message back to the parent.
fn run_handler(
    gateway: &mut RedisGateway,
    events: &EventBus,
    factory: &Factory,
    worker_id: &WorkerId,
    queue: &str,
    envelope: &Envelope,
    hook_payload: &serde_json::Value,
) -> bool {
    let outcome: std::result::Result<Option<serde_json::Value>, (&'static str, String)> = (|| {
        let mut handler = factory
            .create(&envelope.class, envelope.argument().clone(), queue)
            .map_err(|e| ("FactoryError", e.to_string()))?;
        handler
            .set_up()
            .map_err(|e| ("SetupError", e.to_string()))?;
        let result = handler.perform().map_err(|e| ("HandlerException", e.to_string()));
        let _ = handler.tear_down();
        result
    })();

    match outcome {
        Ok(result) => {
            if let Err(e) = StatusTracker::new(gateway).update(&envelope.id, JobState::Complete, result) {
                event!(Level::ERROR, error=%e, "failed to record completion status");
            }
            events.trigger(events::AFTER_PERFORM, hook_payload);
            true
        }
        Err((kind, message)) => {
            if let Err(e) = record_failure(gateway, events, worker_id, queue, envelope, kind, &message) {
                event!(Level::ERROR, error=%e, "failed to record job failure");
            }
            false
        }
    }
}

fn record_failure(
    gateway: &mut RedisGateway,
    events: &EventBus,
    worker_id: &WorkerId,
    queue: &str,
    envelope: &Envelope,
    kind: &str,
    message: &str,
) -> Result<()> {
    StatusTracker::new(gateway).update(
        &envelope.id,
        JobState::Failed,
        Some(json!({"exception": kind, "error": message})),
    )?;

    let failure_payload = json!({
        "class": envelope.class,
        "args": envelope.argument(),
        "queue": queue,
        "id": envelope.id,
        "exception": kind,
        "error": message,
    });
    events.trigger(events::ON_FAILURE, &failure_payload);

    FailedLog::new(gateway).record_exception(
        &serde_json::to_value(envelope)?,
        kind,
        message,
        &[],
        &worker_id.to_string(),
        queue,
    )?;
    Stats::new(gateway).record_failed(&worker_id.to_string())?;
    Ok(())
}

/// Interprets the parent's view of how the child died. Exit code `0` is
/// success; exit code `1` means the child already recorded its own
/// failure before exiting cleanly. Any other exit code, or death by
/// signal, means the child never got a chance to record anything (a panic
/// abort, an OOM kill, an operator `SIGKILL`) and the parent must
/// synthesize the failure record itself.
fn interpret_status(
    status: WaitStatus,
    gateway: &mut RedisGateway,
    worker_id: &WorkerId,
    queue: &str,
    envelope: &Envelope,
) -> Result<Outcome> {
    match status {
        WaitStatus::Exited(_, 0) => {
            Stats::new(gateway).record_processed(&worker_id.to_string())?;
            Ok(Outcome::Processed)
        }
        WaitStatus::Exited(_, 1) => Ok(Outcome::Failed),
        WaitStatus::Exited(_, code) => {
            let message = format!("job process exited with status {}", code);
            event!(Level::ERROR, job=%envelope.id, %message, "Job child died without recording a failure");
            synthesize_failure(gateway, worker_id, queue, envelope, &message)?;
            Ok(Outcome::Failed)
        }
        WaitStatus::Signaled(_, signal, _) => {
            let message = format!("job process was killed by signal {}", signal as i32);
            event!(Level::ERROR, job=%envelope.id, %message, "Job child died without recording a failure");
            synthesize_failure(gateway, worker_id, queue, envelope, &message)?;
            Ok(Outcome::Failed)
        }
        other => {
            let message = format!("job process ended in unexpected wait status: {:?}", other);
            synthesize_failure(gateway, worker_id, queue, envelope, &message)?;
            Ok(Outcome::Failed)
        }
    }
}

fn synthesize_failure(
    gateway: &mut RedisGateway,
    worker_id: &WorkerId,
    queue: &str,
    envelope: &Envelope,
    message: &str,
) -> Result<()> {
    StatusTracker::new(gateway).update(
        &envelope.id,
        JobState::Failed,
        Some(json!({"exception": "HandlerFault", "error": message})),
    )?;
    FailedLog::new(gateway).record_fault(
        &serde_json::to_value(envelope)?,
        message,
        &worker_id.to_string(),
        queue,
    )?;
    Stats::new(gateway).record_failed(&worker_id.to_string())?;
    Ok(())
}

/// Best-effort `argv[0]`-style rewrite, named the way the original
/// process-title convention this is modeled on does it:
/// `redqueue-<ver>: Processing <queue> since <ts>`. Only implemented on
/// Linux, where `prctl(PR_SET_NAME, ...)` is cheap and doesn't require
/// touching the process's environment block; elsewhere this is a no-op
/// rather than something worth pulling in a platform shim for. The kernel
/// truncates thread names to 15 bytes regardless of what we hand it.
fn set_process_title(queue: &str, since: chrono::DateTime<chrono::Utc>) {
    #[cfg(target_os = "linux")]
    {
        let title = format!(
            "redqueue-{}: Processing {} since {}",
            env!("CARGO_PKG_VERSION"),
            queue,
            since.to_rfc3339()
        );
        let mut bytes: Vec<u8> = title.into_bytes();
        bytes.truncate(15);
        bytes.push(0);
        unsafe {
            libc::prctl(libc::PR_SET_NAME, bytes.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (queue, since);
    }
}
