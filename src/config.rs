use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::connectors::{
    classifier::{DEFAULT_OPENAI_BASE, DEFAULT_OPENAI_MODEL},
    drive::DEFAULT_DRIVE_API_BASE,
    ocr::DEFAULT_VISION_ENDPOINT,
};
use crate::models::channel::CHANNEL_TTL_SECS;

const ENV_PREFIX: &str = "DROPFOLDER_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Public URL of `POST /webhook`, handed to Drive when opening channels.
    pub webhook_url: String,
    pub refresh_interval: Duration,
    pub maintenance_interval: Duration,
    pub call_timeout: Duration,
    pub maintenance_concurrency: usize,
    pub drive_api_base: String,
    pub vision_endpoint: String,
    pub vision_api_key: Option<String>,
    pub openai_base: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub pdftoppm: PathBuf,
    pub pdf_dpi: u32,
    pub scratch_dir: PathBuf,
    /// Key required on `/installations*`; administration is closed when unset.
    pub admin_api_key: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-tenant Drive intake and classification service")]
pub struct Args {
    /// Host to bind to (overrides DROPFOLDER_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (overrides DROPFOLDER_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Database URL (overrides DROPFOLDER_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Public webhook URL (overrides DROPFOLDER_WEBHOOK_URL)
    #[arg(long, global = true)]
    pub webhook_url: Option<String>,

    /// Seconds between channel refreshes (overrides DROPFOLDER_REFRESH_INTERVAL_SECS)
    #[arg(long, global = true)]
    pub refresh_interval_secs: Option<u64>,

    /// Seconds between maintenance batches (overrides DROPFOLDER_MAINTENANCE_INTERVAL_SECS)
    #[arg(long, global = true)]
    pub maintenance_interval_secs: Option<u64>,

    /// Per-call timeout in seconds (overrides DROPFOLDER_CALL_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub call_timeout_secs: Option<u64>,

    /// Directory for transient downloads (overrides DROPFOLDER_SCRATCH_DIR)
    #[arg(long, global = true)]
    pub scratch_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP server and the maintenance scheduler (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
    /// Run one maintenance pass over one or all installations
    Maintain {
        #[arg(long)]
        installation: Option<i64>,
    },
    /// Register a new installation
    CreateInstallation {
        #[arg(long)]
        creator: String,
        #[arg(long)]
        root_folder_id: String,
        #[arg(long)]
        credentials: String,
    },
    /// List installations
    ListInstallations {
        /// Include terminated installations
        #[arg(long)]
        all: bool,
    },
    /// Flag an installation for teardown on the next maintenance pass
    MarkForTermination { installation: i64 },
    /// Create or adopt a bucket folder under an installation's root
    CreateBucket {
        installation: i64,
        name: String,
        #[arg(long, default_value = "none")]
        action: String,
        /// Rename a conflicting non-folder file instead of failing
        #[arg(long)]
        rename_existing: bool,
    },
    /// List an installation's buckets
    ListBuckets { installation: i64 },
    /// Create every bucket listed in a JSON pattern file
    ApplyPattern { installation: i64, file: PathBuf },
    /// Cancel an installation's channels and delete its record
    Teardown { installation: i64 },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the
    /// command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        let command = args.command.clone().unwrap_or(Command::Serve);
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, command))
    }

    /// Merge `args` over the variables visible through `lookup`.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());

        let host = args
            .host
            .or_else(|| var("HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&var, "PORT")?.unwrap_or(3000),
        };
        let webhook_url = args
            .webhook_url
            .or_else(|| var("WEBHOOK_URL"))
            .unwrap_or_else(|| format!("http://{}:{}/webhook", host, port));

        let secs = |arg: Option<u64>, name: &str, default: u64| -> Result<Duration> {
            let value = match arg {
                Some(v) => v,
                None => parse_var(&var, name)?.unwrap_or(default),
            };
            Ok(Duration::from_secs(value))
        };
        let refresh_interval = secs(args.refresh_interval_secs, "REFRESH_INTERVAL_SECS", 12 * 60 * 60)?;
        let maintenance_interval = secs(args.maintenance_interval_secs, "MAINTENANCE_INTERVAL_SECS", 15 * 60)?;
        let call_timeout = secs(args.call_timeout_secs, "CALL_TIMEOUT_SECS", 60)?;
        anyhow::ensure!(
            refresh_interval.as_secs() < CHANNEL_TTL_SECS,
            "refresh interval ({}s) must be shorter than the channel lifetime ({}s)",
            refresh_interval.as_secs(),
            CHANNEL_TTL_SECS
        );

        Ok(Self {
            database_url: args
                .database_url
                .or_else(|| var("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/dropfolder.db".into()),
            webhook_url,
            refresh_interval,
            maintenance_interval,
            call_timeout,
            maintenance_concurrency: parse_var(&var, "MAINTENANCE_CONCURRENCY")?.unwrap_or(4),
            drive_api_base: var("DRIVE_API_BASE").unwrap_or_else(|| DEFAULT_DRIVE_API_BASE.into()),
            vision_endpoint: var("VISION_ENDPOINT").unwrap_or_else(|| DEFAULT_VISION_ENDPOINT.into()),
            vision_api_key: var("VISION_API_KEY"),
            openai_base: var("OPENAI_BASE").unwrap_or_else(|| DEFAULT_OPENAI_BASE.into()),
            openai_api_key: var("OPENAI_API_KEY"),
            openai_model: var("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.into()),
            pdftoppm: var("PDFTOPPM").map(PathBuf::from).unwrap_or_else(|| "pdftoppm".into()),
            pdf_dpi: parse_var(&var, "PDF_DPI")?.unwrap_or(150),
            scratch_dir: args
                .scratch_dir
                .or_else(|| var("SCRATCH_DIR").map(PathBuf::from))
                .unwrap_or_else(env::temp_dir),
            admin_api_key: var("ADMIN_API_KEY"),
            host,
            port,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn refresh_interval_delta(&self) -> Result<TimeDelta> {
        TimeDelta::from_std(self.refresh_interval).context("refresh interval out of range")
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{}`", value))
        })
        .transpose()
}
