//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `FLOWMASTER_DATABASE_URL`: PostgreSQL connection string (optional, in-memory backend otherwise)
//! - `FLOWMASTER_LISTEN_ADDR`: RPC listen address (default: 127.0.0.1:5678)
//! - `FLOWMASTER_ADVERTISE_ADDR`: Address registered for this master (default: the listen address)
//! - `FLOWMASTER_RPC_SERVER_ENABLED`: Serve inbound RPC over TCP (default: true)
//! - `FLOWMASTER_DISPATCH_TASK_NUMBER`: Max in-flight task dispatches (default: num_cpus * 2)
//! - `FLOWMASTER_HOST_SELECTOR`: `ROUND_ROBIN`, `RANDOM` or `LOWER_WEIGHT` (default: LOWER_WEIGHT)
//! - `FLOWMASTER_LOAD_PROTECTION_ENABLED`: Skip command fetching while overloaded (default: true)
//! - `FLOWMASTER_MAX_SYSTEM_CPU_USAGE`: Overload threshold in [0, 1] (default: 0.7)
//! - `FLOWMASTER_MAX_PROCESS_CPU_USAGE`: Overload threshold in [0, 1] (default: 0.7)
//! - `FLOWMASTER_MAX_SYSTEM_MEMORY_USAGE`: Overload threshold in [0, 1] (default: 0.7)
//! - `FLOWMASTER_MAX_DISK_USAGE`: Overload threshold in [0, 1] (default: 0.7)
//! - `FLOWMASTER_COMMAND_FETCH_STRATEGY`: Only `ID_SLOT_BASED` (default)
//! - `FLOWMASTER_COMMAND_ID_STEP` / `FLOWMASTER_COMMAND_SLOT_INDEX`: Fixed slot; both or neither
//!   (default: derived from the live master list)
//! - `FLOWMASTER_COMMAND_FETCH_SIZE`: Commands per poll (default: 16)
//! - `FLOWMASTER_COMMAND_POLL_INTERVAL_MS`: Command poll interval (default: 1000)
//! - `FLOWMASTER_RPC_TIMEOUT_MS`: Timeout for outbound RPC calls (default: 10000)
//! - `FLOWMASTER_RPC_SWEEP_INTERVAL_MS`: Expired request sweep interval (default: 1000)
//! - `FLOWMASTER_EVENT_SHARDS`: State event pipeline shards (default: num_cpus)
//! - `FLOWMASTER_HOST_REFRESH_INTERVAL_MS`: Registry refresh and master heartbeat interval (default: 5000)
//! - `FLOWMASTER_DISPATCH_RETRY_INTERVAL_MS`: Delay before re-dispatching undispatched tasks (default: 1000)

use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};

use crate::command::{LoadProtectionConfig, SlotPredicate};
use crate::dispatch::HostSelectorKind;

/// Default RPC listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5678";

/// Capacity of each state event shard queue.
pub const EVENT_SHARD_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandFetchStrategy {
    #[default]
    IdSlotBased,
}

impl FromStr for CommandFetchStrategy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ID_SLOT_BASED" => Ok(CommandFetchStrategy::IdSlotBased),
            other => bail!("unknown command fetch strategy {other}"),
        }
    }
}

/// Command intake settings
#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub strategy: CommandFetchStrategy,
    pub id_step: Option<i64>,
    pub slot_index: Option<i64>,
    pub fetch_size: usize,
    pub poll_interval: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            strategy: CommandFetchStrategy::IdSlotBased,
            id_step: None,
            slot_index: None,
            fetch_size: 16,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl CommandConfig {
    /// Fixed slot when both `id_step` and `slot_index` are configured.
    pub fn static_slot(&self) -> Result<Option<SlotPredicate>> {
        match (self.id_step, self.slot_index) {
            (Some(id_step), Some(slot_index)) => Ok(Some(SlotPredicate::new(id_step, slot_index)?)),
            (None, None) => Ok(None),
            _ => bail!(
                "FLOWMASTER_COMMAND_ID_STEP and FLOWMASTER_COMMAND_SLOT_INDEX must be set together"
            ),
        }
    }
}

/// Master configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; `None` runs on the in-memory backend
    pub database_url: Option<String>,

    pub listen_addr: SocketAddr,

    /// Address other masters and workers use to reach this master
    pub advertise_addr: String,

    pub rpc_server_enabled: bool,

    pub dispatch_task_number: usize,

    pub host_selector: HostSelectorKind,

    pub load_protection: LoadProtectionConfig,

    pub command: CommandConfig,

    pub rpc_timeout: Duration,

    pub rpc_sweep_interval: Duration,

    pub event_shards: usize,

    pub host_refresh_interval: Duration,

    pub dispatch_retry_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let listen_addr = SocketAddr::from(([127, 0, 0, 1], 5678));
        Self {
            database_url: None,
            listen_addr,
            advertise_addr: listen_addr.to_string(),
            rpc_server_enabled: true,
            dispatch_task_number: num_cpus::get().max(1) * 2,
            host_selector: HostSelectorKind::default(),
            load_protection: LoadProtectionConfig::default(),
            command: CommandConfig::default(),
            rpc_timeout: Duration::from_secs(10),
            rpc_sweep_interval: Duration::from_secs(1),
            event_shards: num_cpus::get().max(1),
            host_refresh_interval: Duration::from_secs(5),
            dispatch_retry_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let database_url = lookup("FLOWMASTER_DATABASE_URL").filter(|url| !url.trim().is_empty());

        let listen_addr = parse(&lookup, "FLOWMASTER_LISTEN_ADDR")?
            .unwrap_or_else(|| defaults.listen_addr);
        let advertise_addr =
            lookup("FLOWMASTER_ADVERTISE_ADDR").unwrap_or_else(|| listen_addr.to_string());
        let rpc_server_enabled = flag(&lookup, "FLOWMASTER_RPC_SERVER_ENABLED")?
            .unwrap_or(defaults.rpc_server_enabled);

        let dispatch_task_number = parse(&lookup, "FLOWMASTER_DISPATCH_TASK_NUMBER")?
            .unwrap_or(defaults.dispatch_task_number);
        let host_selector =
            parse(&lookup, "FLOWMASTER_HOST_SELECTOR")?.unwrap_or(defaults.host_selector);

        let load_defaults = defaults.load_protection;
        let load_protection = LoadProtectionConfig {
            enabled: flag(&lookup, "FLOWMASTER_LOAD_PROTECTION_ENABLED")?
                .unwrap_or(load_defaults.enabled),
            max_system_cpu_usage: parse(&lookup, "FLOWMASTER_MAX_SYSTEM_CPU_USAGE")?
                .unwrap_or(load_defaults.max_system_cpu_usage),
            max_process_cpu_usage: parse(&lookup, "FLOWMASTER_MAX_PROCESS_CPU_USAGE")?
                .unwrap_or(load_defaults.max_process_cpu_usage),
            max_system_memory_usage: parse(&lookup, "FLOWMASTER_MAX_SYSTEM_MEMORY_USAGE")?
                .unwrap_or(load_defaults.max_system_memory_usage),
            max_disk_usage: parse(&lookup, "FLOWMASTER_MAX_DISK_USAGE")?
                .unwrap_or(load_defaults.max_disk_usage),
        };

        let command_defaults = defaults.command;
        let command = CommandConfig {
            strategy: parse(&lookup, "FLOWMASTER_COMMAND_FETCH_STRATEGY")?
                .unwrap_or(command_defaults.strategy),
            id_step: parse(&lookup, "FLOWMASTER_COMMAND_ID_STEP")?,
            slot_index: parse(&lookup, "FLOWMASTER_COMMAND_SLOT_INDEX")?,
            fetch_size: parse(&lookup, "FLOWMASTER_COMMAND_FETCH_SIZE")?
                .unwrap_or(command_defaults.fetch_size),
            poll_interval: millis(&lookup, "FLOWMASTER_COMMAND_POLL_INTERVAL_MS")?
                .unwrap_or(command_defaults.poll_interval),
        };

        let config = Self {
            database_url,
            listen_addr,
            advertise_addr,
            rpc_server_enabled,
            dispatch_task_number,
            host_selector,
            load_protection,
            command,
            rpc_timeout: millis(&lookup, "FLOWMASTER_RPC_TIMEOUT_MS")?
                .unwrap_or(defaults.rpc_timeout),
            rpc_sweep_interval: millis(&lookup, "FLOWMASTER_RPC_SWEEP_INTERVAL_MS")?
                .unwrap_or(defaults.rpc_sweep_interval),
            event_shards: parse(&lookup, "FLOWMASTER_EVENT_SHARDS")?
                .unwrap_or(defaults.event_shards),
            host_refresh_interval: millis(&lookup, "FLOWMASTER_HOST_REFRESH_INTERVAL_MS")?
                .unwrap_or(defaults.host_refresh_interval),
            dispatch_retry_interval: millis(&lookup, "FLOWMASTER_DISPATCH_RETRY_INTERVAL_MS")?
                .unwrap_or(defaults.dispatch_retry_interval),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("FLOWMASTER_MAX_SYSTEM_CPU_USAGE", self.load_protection.max_system_cpu_usage),
            ("FLOWMASTER_MAX_PROCESS_CPU_USAGE", self.load_protection.max_process_cpu_usage),
            ("FLOWMASTER_MAX_SYSTEM_MEMORY_USAGE", self.load_protection.max_system_memory_usage),
            ("FLOWMASTER_MAX_DISK_USAGE", self.load_protection.max_disk_usage),
        ];
        for (key, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                bail!("{key} must be within [0, 1], got {value}");
            }
        }
        if self.command.fetch_size < 1 {
            bail!("FLOWMASTER_COMMAND_FETCH_SIZE must be at least 1");
        }
        if self.dispatch_task_number < 1 {
            bail!("FLOWMASTER_DISPATCH_TASK_NUMBER must be at least 1");
        }
        if self.event_shards < 1 {
            bail!("FLOWMASTER_EVENT_SHARDS must be at least 1");
        }
        self.command.static_slot()?;
        Ok(())
    }
}

/// Get the database URL from environment, if configured
pub fn database_url() -> Option<String> {
    dotenvy::dotenv().ok();
    env::var("FLOWMASTER_DATABASE_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|err| anyhow::anyhow!("{err}"))
                .with_context(|| format!("invalid {key} value {raw:?}"))
        })
        .transpose()
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    lookup(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => bail!("invalid {key} value {raw:?}"),
        })
        .transpose()
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}
