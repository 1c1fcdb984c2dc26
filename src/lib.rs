pub mod config;
pub mod envelope;
pub mod error;
pub mod events;
pub mod factory;
pub mod failed;
pub mod queue;
pub mod redis_gateway;
pub mod registry;
pub mod shutdown;
pub mod signals;
pub mod stats;
pub mod status;
pub mod supervisor;
pub mod tracing_config;
pub mod worker;
