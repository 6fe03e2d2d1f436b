use chainview_core::AggregatorConfig;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "chainview-watch")]
#[command(about = "Attach to a pipeline event stream and print the reconciled view", long_about = None)]
pub struct Args {
    /// Server-sent events endpoint of the pipeline.
    #[arg(long, env = "CHAINVIEW_STREAM_URL")]
    pub url: String,
    #[arg(long, env = "CHAINVIEW_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    #[arg(long, env = "CHAINVIEW_RETRY_DELAY_MS", default_value_t = DEFAULT_RETRY_DELAY_MS)]
    pub retry_delay_ms: u64,
    #[arg(long, env = "CHAINVIEW_OUTPUT", value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
    #[arg(long, env = "CHAINVIEW_LOG_DIR", default_value = "")]
    pub log_dir: String,
    /// Mirror log lines to stderr.
    #[arg(long, env = "CHAINVIEW_LOG_STDERR")]
    pub log_stderr: bool,
    /// TOML file with an `[aggregator]` table.
    #[arg(long, env = "CHAINVIEW_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub dedup_capacity: Option<usize>,
    #[arg(long)]
    pub default_region: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid stream url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported stream url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid aggregator settings: {0}")]
    Aggregator(#[from] chainview_core::ConfigError),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    aggregator: AggregatorConfig,
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub stream_url: Url,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub output: OutputFormat,
    pub log_dir: String,
    pub log_stderr: bool,
    pub aggregator: AggregatorConfig,
}

impl WatchConfig {
    /// Config with defaults for everything but the endpoint.
    pub fn new(stream_url: Url) -> Self {
        Self {
            stream_url,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            output: OutputFormat::Text,
            log_dir: String::new(),
            log_stderr: false,
            aggregator: AggregatorConfig::default(),
        }
    }

    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let stream_url = parse_stream_url(&args.url)?;

        let mut aggregator = match args.config.as_deref() {
            Some(path) => load_file(path)?.aggregator,
            None => AggregatorConfig::default(),
        };
        if let Some(capacity) = args.dedup_capacity {
            aggregator.dedup_capacity = capacity;
        }
        if let Some(region) = args.default_region.as_deref() {
            aggregator.default_region = region.trim().to_string();
        }
        aggregator.validate()?;

        Ok(Self {
            stream_url,
            max_retries: args.max_retries,
            retry_delay: Duration::from_millis(args.retry_delay_ms),
            output: args.output,
            log_dir: args.log_dir.trim().to_string(),
            log_stderr: args.log_stderr,
            aggregator,
        })
    }
}

pub fn parse_stream_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme(other.to_string())),
    }
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
