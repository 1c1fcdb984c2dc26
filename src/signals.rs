//! Maps the logical operator signals spec'd for the worker control loop
//! onto real POSIX signals, using `signal-hook`'s non-blocking iterator so
//! that each of the three suspension points (`BLPOP`, the poll sleep, and
//! `waitpid`) can drain pending signals and surface back to the control
//! loop's top without racing a signal handler directly.

use signal_hook::consts::{SIGCONT, SIGINT, SIGPIPE, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;

use crate::error::Result;

#[derive(Debug, Default, Clone, Copy)]
pub struct PendingSignals {
    /// TERM / INT: shut down immediately, killing any running child first.
    pub shutdown_now: bool,
    /// QUIT: finish the current job, then exit.
    pub shutdown_graceful: bool,
    /// USR1: kill the current child now, then keep looping.
    pub kill_child: bool,
    /// USR2: stop reserving new jobs.
    pub pause: bool,
    /// CONT: resume reserving.
    pub resume: bool,
    /// PIPE: reconnect to Redis.
    pub reconnect: bool,
}

impl PendingSignals {
    /// OR each field of `other` into `self`, so a caller that needs to poll
    /// repeatedly across a blocking wait doesn't lose earlier signals.
    pub fn merge(&mut self, other: PendingSignals) {
        self.shutdown_now |= other.shutdown_now;
        self.shutdown_graceful |= other.shutdown_graceful;
        self.kill_child |= other.kill_child;
        self.pause |= other.pause;
        self.resume |= other.resume;
        self.reconnect |= other.reconnect;
    }
}

pub struct SignalWatcher {
    signals: Signals,
}

impl SignalWatcher {
    pub fn install() -> Result<Self> {
        let signals = Signals::new([
            SIGTERM, SIGINT, SIGQUIT, SIGUSR1, SIGUSR2, SIGCONT, SIGPIPE,
        ])?;
        Ok(SignalWatcher { signals })
    }

    /// Drain every signal that has arrived since the last call, folding
    /// them into a `PendingSignals` summary. Non-blocking.
    pub fn poll(&mut self) -> PendingSignals {
        let mut pending = PendingSignals::default();
        for signal in self.signals.pending() {
            match signal {
                SIGTERM | SIGINT => pending.shutdown_now = true,
                SIGQUIT => pending.shutdown_graceful = true,
                SIGUSR1 => pending.kill_child = true,
                SIGUSR2 => pending.pause = true,
                SIGCONT => pending.resume = true,
                SIGPIPE => pending.reconnect = true,
                _ => {}
            }
        }
        pending
    }
}
