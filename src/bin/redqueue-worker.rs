use redqueue::config::Config;
use redqueue::error::Result;
use redqueue::events::EventBus;
use redqueue::factory::Factory;
use redqueue::redis_gateway::RedisGateway;
use redqueue::worker::Worker;
use structopt::StructOpt;
use tracing::{event, Level};

#[derive(Debug, StructOpt)]
struct Args {
    #[structopt(
        long,
        help = "Comma-separated queue list, or `*` for all queues; overrides QUEUE"
    )]
    queues: Option<String>,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    redqueue::tracing_config::configure("redqueue-worker");

    let args = Args::from_args();
    let mut config = Config::from_env();
    if let Some(raw) = args.queues {
        config.queues = if raw == "*" {
            None
        } else {
            Some(
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )
        };
    }

    let gateway = RedisGateway::new(config.redis_url.clone(), config.prefix.clone())?;
    let events = EventBus::new();
    // Handler registration is left to the embedding application; this
    // binary ships no handlers of its own, so an empty factory will fail
    // every job it reserves until one is wired up here.
    let factory = Factory::new();

    let mut worker = Worker::new(gateway, events, factory, config)?;
    event!(Level::INFO, worker = %worker.id(), "Starting worker");
    worker.run()
}
