//! Configuration for the tester worker

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment (development, staging, production)
    pub environment: String,

    /// Prometheus metrics port
    pub metrics_port: u16,

    /// Queue settings
    pub queue: QueueConfig,

    /// Working directory layout
    pub storage: StorageConfig,

    /// Execution limits
    pub execution: ExecutionConfig,
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Worker ID for consumer group
    pub worker_id: String,

    /// Consumer group name
    pub consumer_group: String,

    /// Stream jobs are consumed from
    pub job_stream: String,

    /// Stream asking the sync agent to deliver a job's files
    pub sync_stream: String,

    /// Stream asking the sync agent to collect a job's results
    pub fetch_stream: String,

    /// Block timeout for XREADGROUP (milliseconds)
    pub block_timeout_ms: usize,

    /// Pending messages idle longer than this are claimed at startup
    pub claim_idle_ms: u64,

    /// How long to wait for a completion sentinel before giving up
    pub sentinel_timeout: Duration,

    /// Sentinel polling interval
    pub sentinel_poll: Duration,
}

/// Storage path configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Per-worker working directory, wiped at the start of every job
    pub working_dir: PathBuf,
}

/// Execution limits configuration
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Default time limit in milliseconds
    pub default_time_limit_ms: u64,

    /// Command-prefix overrides of the time limit, first match wins
    pub time_limit_overrides: Vec<(String, u64)>,

    /// Commands looked up on PATH instead of the sources directory
    pub interpreters: Vec<String>,

    /// Hard ceiling on captured output in bytes
    pub capture_limit_bytes: u64,

    /// Stored output beyond this is truncated
    pub output_truncate_bytes: u64,

    /// Truncation cap for image outputs
    pub image_truncate_bytes: u64,

    /// Build command run from the working directory when a Makefile exists
    pub build_command: Vec<String>,

    /// Build time limit in seconds
    pub build_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            worker_id: format!(
                "tester_worker_{}",
                uuid::Uuid::new_v4()
                    .to_string()
                    .split('-')
                    .next()
                    .unwrap_or_default()
            ),
            consumer_group: "tester_group".to_string(),
            job_stream: "queue_tell_worker".to_string(),
            sync_stream: "queue_sync_files".to_string(),
            fetch_stream: "queue_fetch_results".to_string(),
            block_timeout_ms: 5000,
            claim_idle_ms: 60000,
            sentinel_timeout: Duration::from_secs(600),
            sentinel_poll: Duration::from_secs(1),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("/var/lib/tester/work"),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_time_limit_ms: 3000,
            time_limit_overrides: vec![
                ("java".to_string(), 10000),
                ("valgrind".to_string(), 20000),
            ],
            interpreters: [
                "bash", "sh", "python", "python2", "python3", "perl", "ruby", "java", "node",
                "valgrind",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            capture_limit_bytes: 16 * 1024 * 1024, // 16 MB
            output_truncate_bytes: 64 * 1024,      // 64 KB
            image_truncate_bytes: 2 * 1024 * 1024, // 2 MB
            build_command: ["make", "-f", "../Makefile", "-C", "src"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            build_timeout_secs: 300,
        }
    }
}

impl ExecutionConfig {
    /// Time limit for a command line
    pub fn time_limit_for(&self, command_line: &str) -> Duration {
        let ms = self
            .time_limit_overrides
            .iter()
            .find(|(prefix, _)| command_line.starts_with(prefix.as_str()))
            .map(|(_, ms)| *ms)
            .unwrap_or(self.default_time_limit_ms);
        Duration::from_millis(ms)
    }
}

/// Parse `prefix=ms` pairs separated by commas; malformed pairs are skipped.
pub fn parse_overrides(value: &str) -> Vec<(String, u64)> {
    value
        .split(',')
        .filter_map(|pair| {
            let (prefix, ms) = pair.split_once('=')?;
            let prefix = prefix.trim();
            if prefix.is_empty() {
                return None;
            }
            Some((prefix.to_string(), ms.trim().parse().ok()?))
        })
        .collect()
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, separator: char, default: Vec<String>) -> Vec<String> {
    match env::var(key) {
        Ok(v) => v
            .split(separator)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let queue = QueueConfig::default();
        let storage = StorageConfig::default();
        let execution = ExecutionConfig::default();

        Self {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            metrics_port: env_parse("METRICS_PORT", 9092),
            queue: QueueConfig {
                redis_url: env::var("REDIS_URL").unwrap_or(queue.redis_url),
                worker_id: env::var("WORKER_ID").unwrap_or(queue.worker_id),
                consumer_group: env::var("CONSUMER_GROUP").unwrap_or(queue.consumer_group),
                job_stream: env::var("JOB_STREAM").unwrap_or(queue.job_stream),
                sync_stream: env::var("SYNC_STREAM").unwrap_or(queue.sync_stream),
                fetch_stream: env::var("FETCH_STREAM").unwrap_or(queue.fetch_stream),
                block_timeout_ms: env_parse("BLOCK_TIMEOUT_MS", queue.block_timeout_ms),
                claim_idle_ms: env_parse("CLAIM_IDLE_MS", queue.claim_idle_ms),
                sentinel_timeout: Duration::from_secs(env_parse(
                    "SENTINEL_TIMEOUT_SECS",
                    queue.sentinel_timeout.as_secs(),
                )),
                sentinel_poll: Duration::from_millis(env_parse(
                    "SENTINEL_POLL_MS",
                    queue.sentinel_poll.as_millis() as u64,
                )),
            },
            storage: StorageConfig {
                working_dir: env::var("WORKING_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(storage.working_dir),
            },
            execution: ExecutionConfig {
                default_time_limit_ms: env_parse(
                    "DEFAULT_TIME_LIMIT_MS",
                    execution.default_time_limit_ms,
                ),
                time_limit_overrides: env::var("TIME_LIMIT_OVERRIDES")
                    .map(|v| parse_overrides(&v))
                    .unwrap_or(execution.time_limit_overrides),
                interpreters: env_list("INTERPRETERS", ',', execution.interpreters),
                capture_limit_bytes: env_parse("CAPTURE_LIMIT_BYTES", execution.capture_limit_bytes),
                output_truncate_bytes: env_parse(
                    "OUTPUT_TRUNCATE_BYTES",
                    execution.output_truncate_bytes,
                ),
                image_truncate_bytes: env_parse(
                    "IMAGE_TRUNCATE_BYTES",
                    execution.image_truncate_bytes,
                ),
                build_command: env_list("BUILD_COMMAND", ' ', execution.build_command),
                build_timeout_secs: env_parse("BUILD_TIMEOUT_SECS", execution.build_timeout_secs),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let parsed = parse_overrides("java=10000, valgrind=20000,broken,=5,x=y");
        assert_eq!(
            parsed,
            vec![("java".to_string(), 10000), ("valgrind".to_string(), 20000)]
        );
    }

    #[test]
    fn test_time_limit_first_match_wins() {
        let execution = ExecutionConfig {
            time_limit_overrides: vec![("java".to_string(), 10000), ("ja".to_string(), 1)],
            ..ExecutionConfig::default()
        };
        assert_eq!(
            execution.time_limit_for("java Main"),
            Duration::from_millis(10000)
        );
        assert_eq!(
            execution.time_limit_for("./a.out"),
            Duration::from_millis(3000)
        );
    }

    #[test]
    fn test_defaults() {
        let execution = ExecutionConfig::default();
        assert!(execution.interpreters.iter().any(|i| i == "python3"));
        assert_eq!(execution.build_command.join(" "), "make -f ../Makefile -C src");
        assert!(QueueConfig::default().worker_id.starts_with("tester_worker_"));
    }
}
