use crate::{
    models::object::RestorePriority,
    services::{
        controller::MigrationSettings,
        restore::RestoreSettings,
        retry::{PollSchedule, RetryPolicy},
        transfer::TransferSettings,
        verifier::VerifySettings,
    },
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{collections::BTreeSet, env, path::PathBuf, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "BUCKET_MIGRATE_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub state_db: PathBuf,
    pub destination: PathBuf,
    pub exclude: BTreeSet<String>,
    pub restore_days: i32,
    pub restore_tier: RestorePriority,
    pub max_restores_in_flight: usize,
    pub restore_poll_secs: u64,
    pub verify_concurrency: usize,
    pub transfer_concurrency: usize,
    pub transfer_buffer_kib: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Migrate object-store buckets to local disk, verify them, then delete them remotely"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// SQLite state file (overrides BUCKET_MIGRATE_STATE_DB)
    #[arg(long, global = true)]
    pub state_db: Option<PathBuf>,

    /// Local root the buckets are mirrored under (overrides BUCKET_MIGRATE_DESTINATION)
    #[arg(long, global = true)]
    pub destination: Option<PathBuf>,

    /// Bucket to leave alone; repeat or comma-separate (overrides BUCKET_MIGRATE_EXCLUDE)
    #[arg(long, global = true, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Days a restored cold-tier copy stays readable (overrides BUCKET_MIGRATE_RESTORE_DAYS)
    #[arg(long, global = true)]
    pub restore_days: Option<i32>,

    /// expedited, standard or bulk; deep archive always uses bulk (overrides BUCKET_MIGRATE_RESTORE_TIER)
    #[arg(long, global = true)]
    pub restore_tier: Option<RestorePriority>,

    /// Concurrent restore requests (overrides BUCKET_MIGRATE_MAX_RESTORES_IN_FLIGHT)
    #[arg(long, global = true)]
    pub max_restores_in_flight: Option<usize>,

    /// Seconds between restore status checks (overrides BUCKET_MIGRATE_RESTORE_POLL_SECS)
    #[arg(long, global = true)]
    pub restore_poll_secs: Option<u64>,

    /// Files hashed concurrently during verification (overrides BUCKET_MIGRATE_VERIFY_CONCURRENCY)
    #[arg(long, global = true)]
    pub verify_concurrency: Option<usize>,

    /// Concurrent downloads within one bucket (overrides BUCKET_MIGRATE_TRANSFER_CONCURRENCY)
    #[arg(long, global = true)]
    pub transfer_concurrency: Option<usize>,

    /// Copy buffer per download in KiB (overrides BUCKET_MIGRATE_TRANSFER_BUFFER_KIB)
    #[arg(long, global = true)]
    pub transfer_buffer_kib: Option<usize>,

    /// Attempts per remote call before giving up (overrides BUCKET_MIGRATE_RETRY_ATTEMPTS)
    #[arg(long, global = true)]
    pub retry_attempts: Option<u32>,

    /// First backoff delay in milliseconds (overrides BUCKET_MIGRATE_RETRY_BASE_DELAY_MS)
    #[arg(long, global = true)]
    pub retry_base_delay_ms: Option<u64>,

    /// Provider region (overrides BUCKET_MIGRATE_REGION)
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Custom S3-compatible endpoint (overrides BUCKET_MIGRATE_ENDPOINT_URL)
    #[arg(long, global = true)]
    pub endpoint_url: Option<String>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Advance through the migration phases, resuming from saved state (default)
    Run,
    /// Print the current phase, bucket flags and verification counters
    Status {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Destroy all saved state so the next run starts with a fresh scan
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Run the whole pipeline against an in-memory fixture
    SelfTest,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        // Parse CLI once
        let args = Args::parse();
        let command = args.command.clone().unwrap_or(Command::Run);
        let cfg = Self::merge(args, |name| env::var(name).ok())?;
        Ok((cfg, command))
    }

    /// CLI flag first, then `BUCKET_MIGRATE_*`, then the built-in default.
    fn merge(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let exclude = if args.exclude.is_empty() {
            var("EXCLUDE")
                .map(|value| split_list(&value))
                .unwrap_or_default()
        } else {
            args.exclude.iter().map(|s| s.trim().to_string()).collect()
        };

        Ok(Self {
            state_db: args
                .state_db
                .or_else(|| var("STATE_DB").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("./data/migration_state.db")),
            destination: args
                .destination
                .or_else(|| var("DESTINATION").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("./data/buckets")),
            exclude: exclude.into_iter().filter(|s| !s.is_empty()).collect(),
            restore_days: pick(args.restore_days, &var, "RESTORE_DAYS", 90)?,
            restore_tier: pick(
                args.restore_tier,
                &var,
                "RESTORE_TIER",
                RestorePriority::Standard,
            )?,
            max_restores_in_flight: pick(
                args.max_restores_in_flight,
                &var,
                "MAX_RESTORES_IN_FLIGHT",
                32,
            )?,
            restore_poll_secs: pick(args.restore_poll_secs, &var, "RESTORE_POLL_SECS", 300)?,
            verify_concurrency: pick(args.verify_concurrency, &var, "VERIFY_CONCURRENCY", 4)?,
            transfer_concurrency: pick(
                args.transfer_concurrency,
                &var,
                "TRANSFER_CONCURRENCY",
                8,
            )?,
            transfer_buffer_kib: pick(
                args.transfer_buffer_kib,
                &var,
                "TRANSFER_BUFFER_KIB",
                1024,
            )?,
            retry_attempts: pick(args.retry_attempts, &var, "RETRY_ATTEMPTS", 5)?,
            retry_base_delay_ms: pick(
                args.retry_base_delay_ms,
                &var,
                "RETRY_BASE_DELAY_MS",
                500,
            )?,
            region: args.region.or_else(|| var("REGION")),
            endpoint_url: args.endpoint_url.or_else(|| var("ENDPOINT_URL")),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn migration_settings(&self) -> MigrationSettings {
        MigrationSettings {
            exclude: self.exclude.clone(),
            retry: self.retry_policy(),
            restore: RestoreSettings {
                days: self.restore_days,
                priority: self.restore_tier,
                max_in_flight: self.max_restores_in_flight.max(1),
                poll: PollSchedule::every(Duration::from_secs(self.restore_poll_secs)),
            },
            transfer: TransferSettings {
                concurrency: self.transfer_concurrency.max(1),
                buffer_bytes: self.transfer_buffer_kib.saturating_mul(1024),
            },
            verify: VerifySettings {
                concurrency: self.verify_concurrency.max(1),
                chunk_bytes: self.transfer_buffer_kib.saturating_mul(1024),
            },
        }
    }
}

fn pick<T>(
    cli: Option<T>,
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match var(name) {
        Some(raw) => raw.trim().parse::<T>().map_err(|err| {
            anyhow::anyhow!("{err}").context(format!("parsing {ENV_PREFIX}{name} value `{raw}`"))
        }),
        None => Ok(default),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(|s| s.trim().to_string()).collect()
}
