use crate::server::pool::manager::DispatcherConfig;
use anyhow::bail;
use clap::Parser;
use core::time::Duration;

/// Runtime configuration for the `parkline-server` binary.
///
/// These settings control the size and elasticity of the worker pool and the
/// limits of the TCP package listener. All values are parsed from CLI
/// arguments or environment variables (a `.env` file is loaded first), with
/// defaults suitable for a single-node deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "parkline-server",
    version,
    about = "A TCP package ingestion service with a capacity-aware worker pool"
)]
pub struct CliArgs {
    /// Number of workers created at startup.
    ///
    /// More workers are created on demand when every worker is saturated, so
    /// this is a floor, not a ceiling.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Concurrent operations a single worker accepts before it counts as
    /// saturated.
    ///
    /// Environment variable: `WORKER_CAPACITY`
    #[arg(long, env = "WORKER_CAPACITY", default_value_t = 8)]
    pub worker_capacity: usize,

    /// How long, in milliseconds, the dispatcher waits on each saturated
    /// worker before growing the pool.
    ///
    /// Environment variable: `PROBE_TIMEOUT_MS`
    #[arg(long, env = "PROBE_TIMEOUT_MS", default_value_t = 100)]
    pub probe_timeout_ms: u64,

    /// Optional upper bound on the number of workers.
    ///
    /// When unset, the pool grows without limit under sustained overload.
    /// When set and reached, packages that find no free worker are dropped
    /// and logged.
    ///
    /// Environment variable: `MAX_WORKERS`
    #[arg(long, env = "MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Address to listen on.
    ///
    /// Example: "0.0.0.0:6600"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:6600"))]
    pub server_addr: String,

    /// Maximum number of concurrently open connections.
    ///
    /// Environment variable: `MAX_CONNECTIONS`
    #[arg(long, env = "MAX_CONNECTIONS", default_value_t = 1024)]
    pub max_connections: usize,

    /// Largest accepted package payload, in bytes.
    ///
    /// Environment variable: `MAX_PACKAGE_BYTES`
    #[arg(long, env = "MAX_PACKAGE_BYTES", default_value_t = 1024 * 1024)]
    pub max_package_bytes: usize,

    /// Seconds to wait for each worker to acknowledge shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub num_workers: usize,
    pub worker_capacity: usize,
    pub probe_timeout: Duration,
    pub max_workers: Option<usize>,
    pub server_addr: String,
    pub max_connections: usize,
    pub max_package_bytes: usize,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.worker_capacity == 0 {
            bail!("WORKER_CAPACITY must be greater than 0");
        }

        if u32::try_from(args.worker_capacity).is_err() {
            bail!(
                "WORKER_CAPACITY ({}) exceeds the maximum of {}",
                args.worker_capacity,
                u32::MAX
            );
        }

        if let Some(max_workers) = args.max_workers {
            if max_workers < args.num_workers {
                bail!(
                    "MAX_WORKERS ({max_workers}) must not be less than NUM_WORKERS ({})",
                    args.num_workers
                );
            }
        }

        if args.max_connections == 0 {
            bail!("MAX_CONNECTIONS must be greater than 0");
        }

        if args.max_package_bytes == 0 || u32::try_from(args.max_package_bytes).is_err() {
            bail!(
                "MAX_PACKAGE_BYTES must be between 1 and {} (got {})",
                u32::MAX,
                args.max_package_bytes
            );
        }

        Ok(Self {
            num_workers: args.num_workers,
            worker_capacity: args.worker_capacity,
            probe_timeout: Duration::from_millis(args.probe_timeout_ms),
            max_workers: args.max_workers,
            server_addr: args.server_addr,
            max_connections: args.max_connections,
            max_package_bytes: args.max_package_bytes,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
        })
    }
}

impl From<&ServerConfig> for DispatcherConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            initial_workers: config.num_workers,
            worker_capacity: config.worker_capacity,
            probe_timeout: config.probe_timeout,
            max_workers: config.max_workers,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let args = CliArgs::try_parse_from(core::iter::once("parkline-server").chain(args.iter().copied()))?;
        ServerConfig::try_from(args)
    }

    #[test]
    fn flags_resolve_into_dispatcher_config() {
        let config = parse(&[
            "--num-workers",
            "2",
            "--worker-capacity",
            "3",
            "--probe-timeout-ms",
            "50",
            "--max-workers",
            "6",
        ])
        .unwrap();

        let dispatcher = DispatcherConfig::from(&config);
        assert_eq!(dispatcher.initial_workers, 2);
        assert_eq!(dispatcher.worker_capacity, 3);
        assert_eq!(dispatcher.probe_timeout, Duration::from_millis(50));
        assert_eq!(dispatcher.max_workers, Some(6));
    }

    #[test]
    fn rejects_zero_capacity() {
        assert!(parse(&["--worker-capacity", "0"]).is_err());
        assert!(parse(&["--num-workers", "0"]).is_err());
    }

    #[test]
    fn rejects_cap_below_initial_pool() {
        assert!(parse(&["--num-workers", "4", "--max-workers", "2"]).is_err());
    }
}
