//! A broadcast-style shutdown signal, reimplemented over `std::sync::mpsc`
//! rather than the teacher's `tokio::sync::watch`-based
//! `GracefulShutdown`/`GracefulShutdownConsumer` pair, since this worker's
//! control loop is synchronous. The shape is the same: one producer, many
//! cloneable consumers, each of which can check or block on "has shutdown
//! been requested".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct GracefulShutdown {
    flag: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct GracefulShutdownConsumer {
    flag: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        GracefulShutdown {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn consumer(&self) -> GracefulShutdownConsumer {
        GracefulShutdownConsumer {
            flag: self.flag.clone(),
        }
    }

    pub fn signal(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdownConsumer {
    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_sees_the_signal() {
        let shutdown = GracefulShutdown::new();
        let consumer = shutdown.consumer();
        assert!(!consumer.is_shutting_down());
        shutdown.signal();
        assert!(consumer.is_shutting_down());
    }

    #[test]
    fn multiple_consumers_all_observe_the_same_signal() {
        let shutdown = GracefulShutdown::new();
        let a = shutdown.consumer();
        let b = shutdown.consumer();
        shutdown.signal();
        assert!(a.is_shutting_down());
        assert!(b.is_shutting_down());
    }
}
