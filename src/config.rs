use std::env;
use std::time::Duration;

/// Worker configuration, read once at process start. Mirrors the CLI/env
/// surface documented for this system: `QUEUE`, `COUNT`, `INTERVAL`,
/// `BLOCKING`, `PREFIX`, `REDIS_URL`, `APP_INCLUDE`, `PIDFILE`.
#[derive(Clone, Debug)]
pub struct Config {
    pub redis_url: String,
    pub prefix: String,

    /// Ordered queue list, or `None` to mean "watch all queues" (`QUEUE=*`).
    pub queues: Option<Vec<String>>,

    /// Number of worker processes the launcher should fork at startup.
    /// The core worker loop itself always runs as a single process; this
    /// is read by the CLI entrypoint only.
    pub count: u32,

    pub interval: Duration,
    pub blocking: bool,

    /// Path to a file containing the handler loader's module list. Stored
    /// but unused by the core — handler resolution is the Factory's
    /// business and is out of scope here.
    pub app_include: Option<String>,

    pub pidfile: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let queues = match env::var("QUEUE") {
            Ok(v) if v == "*" => None,
            Ok(v) => Some(
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            Err(_) => Some(vec!["default".to_string()]),
        };

        let interval = env::var("INTERVAL")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or_else(|| Duration::from_secs(5));

        let blocking = env::var("BLOCKING")
            .map(|v| truthy(&v))
            .unwrap_or(false);

        let count = env::var("COUNT")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1);

        Config {
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string()),
            prefix: env::var("PREFIX").unwrap_or_default(),
            queues,
            count,
            interval,
            blocking,
            app_include: env::var("APP_INCLUDE").ok(),
            pidfile: env::var("PIDFILE").ok(),
        }
    }
}

fn truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        assert!(truthy("1"));
        assert!(truthy("true"));
        assert!(truthy("YES"));
        assert!(!truthy("0"));
        assert!(!truthy(""));
    }
}
