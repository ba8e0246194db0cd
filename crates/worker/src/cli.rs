use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use newsflow_ai::LlmClientConfig;
use newsflow_infra::ingest::ConsumerConfig;
use newsflow_infra::jobs::WorkerConfig;
use newsflow_infra::queue::DEFAULT_QUEUE_NAME;
use newsflow_observability::LogFormat;

#[derive(Debug, Parser)]
#[command(name = "newsflow-worker", about = "News ingestion and analysis workers")]
pub struct Cli {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormatArg::Json, global = true)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Json,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Claim and process analysis jobs
    Jobs(JobsArgs),
    /// Drain the ingest queue into the news event store
    Store(StoreArgs),
}

#[derive(Debug, Args)]
pub struct DatabaseArgs {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,
}

#[derive(Debug, Args)]
pub struct JobsArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,

    /// Seconds between polls that found no work
    #[arg(long, default_value_t = 3)]
    pub poll_interval: u64,

    /// Jobs to claim per poll
    #[arg(long, default_value_t = 10)]
    pub batch_size: usize,

    /// Process currently eligible jobs once and exit
    #[arg(long)]
    pub once: bool,

    /// Identity used for job leases (default `<host>:<pid>`)
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 30 * 60)]
    pub lease_timeout_secs: u64,

    #[command(flatten)]
    pub llm: LlmArgs,
}

impl JobsArgs {
    pub fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::default()
            .with_poll_interval(Duration::from_secs(self.poll_interval))
            .with_batch_size(self.batch_size)
            .with_max_attempts(self.max_attempts)
            .with_lease_timeout(Duration::from_secs(self.lease_timeout_secs));
        if let Some(worker_id) = &self.worker_id {
            config = config.with_worker_id(worker_id.clone());
        }
        config
    }
}

#[derive(Debug, Args)]
pub struct LlmArgs {
    /// OpenAI-compatible API base URL
    #[arg(long, env = "LLM_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub llm_base_url: String,

    #[arg(long, env = "LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub llm_api_key: String,

    #[arg(long, default_value_t = 30)]
    pub llm_timeout_secs: u64,

    #[arg(long, default_value_t = 2)]
    pub llm_max_retries: u32,
}

impl LlmArgs {
    pub fn client_config(&self) -> LlmClientConfig {
        LlmClientConfig::default()
            .with_timeout(Duration::from_secs(self.llm_timeout_secs))
            .with_max_retries(self.llm_max_retries)
    }
}

#[derive(Debug, Args)]
pub struct StoreArgs {
    #[command(flatten)]
    pub database: DatabaseArgs,

    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Queue (Redis list) to drain
    #[arg(long, env = "NEWS_QUEUE", default_value = DEFAULT_QUEUE_NAME)]
    pub queue: String,

    /// Longest single pop wait, in seconds
    #[arg(long, default_value_t = 5)]
    pub pop_wait_secs: u64,

    /// Publish an `llm_analysis` job for every newly stored event
    #[arg(long)]
    pub publish_jobs: bool,
}

impl StoreArgs {
    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig::default().with_pop_wait(Duration::from_secs(self.pop_wait_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_flags_map_onto_worker_config() {
        let cli = Cli::try_parse_from([
            "newsflow-worker",
            "jobs",
            "--database-url",
            "postgres://localhost/news",
            "--llm-api-key",
            "sk-test",
            "--batch-size",
            "4",
            "--once",
            "--worker-id",
            "w-1",
            "--lease-timeout-secs",
            "60",
        ])
        .unwrap();

        let Command::Jobs(args) = cli.command else {
            panic!("expected jobs subcommand");
        };
        assert!(args.once);
        let config = args.worker_config();
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.lease_timeout, Duration::from_secs(60));
        assert_eq!(args.llm.llm_model, "gpt-4o-mini");
        assert_eq!(args.llm.client_config().max_retries, 2);
    }

    #[test]
    fn log_format_is_accepted_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "newsflow-worker",
            "store",
            "--database-url",
            "postgres://localhost/news",
            "--log-format",
            "pretty",
        ])
        .unwrap();
        assert_eq!(LogFormat::from(cli.log_format), LogFormat::Pretty);
    }

    #[test]
    fn store_defaults_to_the_shared_queue() {
        let cli = Cli::try_parse_from([
            "newsflow-worker",
            "store",
            "--database-url",
            "postgres://localhost/news",
        ])
        .unwrap();

        let Command::Store(args) = cli.command else {
            panic!("expected store subcommand");
        };
        assert_eq!(cli.log_format, LogFormatArg::Json);
        assert_eq!(args.queue, "news_ingest_queue");
        assert!(!args.publish_jobs);
        assert_eq!(args.consumer_config().pop_wait, Duration::from_secs(5));
    }
}
