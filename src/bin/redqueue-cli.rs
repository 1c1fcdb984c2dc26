//! Operator tool for inspecting and administering queues directly, the
//! same role `erq` plays for the teacher's queue system: add a job, show
//! what's pending, remove matching jobs, or read back stats and the
//! failed log.

use serde_json::{Map, Value};
use structopt::StructOpt;

use redqueue::config::Config;
use redqueue::error::{Error, Result};
use redqueue::events::EventBus;
use redqueue::queue::{Matcher, QueueOps};
use redqueue::redis_gateway::RedisGateway;
use redqueue::stats::Stats;
use redqueue::status::StatusTracker;

#[derive(Debug, StructOpt)]
struct Args {
    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, StructOpt)]
enum Cmd {
    /// Enqueue a job.
    Enqueue {
        queue: String,
        class: String,
        /// JSON-encoded argument object, e.g. '{"user_id":5}'
        args: String,
        #[structopt(long)]
        track_status: bool,
    },
    /// List every job currently sitting in a queue.
    Show { queue: String },
    /// Show the size of every known queue.
    Queues,
    /// Show the status record for a tracked job.
    ShowJob { id: String },
    /// Remove matching jobs from a queue.
    Remove {
        queue: String,
        class: String,
        #[structopt(long, conflicts_with = "args")]
        id: Option<String>,
        #[structopt(long, conflicts_with = "id")]
        args: Option<String>,
    },
    /// Print the most recent entries in the failed job log.
    Failed {
        #[structopt(long, default_value = "10")]
        count: isize,
    },
    /// Print a named stats counter.
    Stat { name: String },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    redqueue::tracing_config::configure("redqueue-cli");

    let args = Args::from_args();
    let config = Config::from_env();
    let mut gateway = RedisGateway::new(config.redis_url.clone(), config.prefix.clone())?;
    let events = EventBus::new();

    match args.cmd {
        Cmd::Enqueue {
            queue,
            class,
            args,
            track_status,
        } => {
            let parsed: Value = serde_json::from_str(&args)?;
            let id = QueueOps::new(&mut gateway, &events).enqueue(
                &queue,
                &class,
                parsed,
                track_status,
                gateway.prefix(),
            )?;
            match id {
                Some(id) => println!("{}", id),
                None => eprintln!("enqueue refused by a beforeEnqueue listener"),
            }
        }
        Cmd::Show { queue } => {
            let jobs = QueueOps::new(&mut gateway, &events).list_jobs(&queue)?;
            for job in jobs {
                println!("{}", job.to_json()?);
            }
        }
        Cmd::Queues => {
            for queue in QueueOps::new(&mut gateway, &events).list_queues()? {
                let size = QueueOps::new(&mut gateway, &events).size(&queue)?;
                println!("{}\t{}", queue, size);
            }
        }
        Cmd::ShowJob { id } => match StatusTracker::new(&mut gateway).get(&id)? {
            Some(record) => println!("{}", serde_json::to_string(&record)?),
            None => eprintln!("no status recorded for job {}", id),
        },
        Cmd::Remove {
            queue,
            class,
            id,
            args,
        } => {
            let matcher = match (id, args) {
                (Some(id), None) => Matcher::ClassAndId { class, id },
                (None, Some(raw)) => {
                    let parsed: Value = serde_json::from_str(&raw)?;
                    let map: Map<String, Value> = parsed
                        .as_object()
                        .cloned()
                        .ok_or_else(|| Error::JobError("--args must be a JSON object".to_string()))?;
                    Matcher::ClassAndArgs { class, args: map }
                }
                (None, None) => Matcher::ClassOnly(class),
                (Some(_), Some(_)) => unreachable!("structopt enforces --id/--args are exclusive"),
            };
            let removed = QueueOps::new(&mut gateway, &events).selective_remove(&queue, &[matcher])?;
            println!("removed {} job(s)", removed);
        }
        Cmd::Failed { count } => {
            let start = if count <= 0 { 0 } else { -count };
            for raw in gateway.lrange("failed", start, -1)? {
                println!("{}", raw);
            }
        }
        Cmd::Stat { name } => {
            println!("{}", Stats::new(&mut gateway).get(&name)?);
        }
    }

    Ok(())
}
