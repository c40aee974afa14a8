use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use crate::{lifecycle::LifecycleConfig, origin::OriginPolicy, registry::RegistryConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-relay",
    author,
    version,
    about = "Beach WebSocket signaling relay"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "BEACH_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:4000")]
    pub listen_addr: String,

    /// Deployment environment.
    #[arg(long, env = "BEACH_RELAY_ENV", value_enum, default_value = "development")]
    pub env: Environment,

    /// Longest a connection may stay silent before it is closed.
    #[arg(long, env = "BEACH_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 10)]
    pub idle_timeout_secs: u64,

    /// Deadline for each write to a peer.
    #[arg(long, env = "BEACH_RELAY_WRITE_TIMEOUT_SECS", default_value_t = 5)]
    pub write_timeout_secs: u64,

    /// Time in-flight connections get to drain during shutdown.
    #[arg(long, env = "BEACH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Origins allowed to open a websocket (host, host:port or *.domain).
    /// Without any, only same-host origins are accepted.
    #[arg(
        long = "allowed-origin",
        env = "BEACH_RELAY_ALLOWED_ORIGINS",
        value_delimiter = ','
    )]
    pub allowed_origins: Vec<String>,

    /// Accept upgrades from any origin (development only).
    #[arg(
        long,
        env = "BEACH_RELAY_INSECURE_SKIP_ORIGIN_CHECK",
        default_value_t = false
    )]
    pub insecure_skip_origin_check: bool,

    /// Drop a peer after this many consecutive failed deliveries (0 = never).
    #[arg(long, env = "BEACH_RELAY_REAP_AFTER_FAILURES", default_value_t = 0)]
    pub reap_after_failures: u32,

    /// Log output format.
    #[arg(long, env = "BEACH_RELAY_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub environment: Environment,
    pub origin_policy: OriginPolicy,
    pub registry: RegistryConfig,
    pub lifecycle: LifecycleConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        if cli.idle_timeout_secs == 0 {
            bail!("idle timeout must be greater than zero");
        }
        if cli.write_timeout_secs == 0 {
            bail!("write timeout must be greater than zero");
        }

        let origin_policy = if cli.insecure_skip_origin_check {
            if cli.env == Environment::Production {
                bail!("--insecure-skip-origin-check is not allowed in production");
            }
            OriginPolicy::Disabled
        } else {
            OriginPolicy::allow(cli.allowed_origins)
        };

        let write_timeout = Duration::from_secs(cli.write_timeout_secs);
        Ok(ServerConfig {
            listen_addr,
            environment: cli.env,
            origin_policy,
            registry: RegistryConfig {
                write_timeout,
                reap_after_failures: cli.reap_after_failures,
            },
            lifecycle: LifecycleConfig {
                idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
                close_timeout: write_timeout,
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig> {
        let mut argv = vec!["beach-relay"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_follow_reference_timeouts() {
        let config = parse(&[]).expect("defaults are valid");
        assert_eq!(config.listen_addr, "0.0.0.0:4000".parse().unwrap());
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.lifecycle.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.registry.write_timeout, Duration::from_secs(5));
        assert_eq!(config.registry.reap_after_failures, 0);
        assert!(matches!(config.origin_policy, OriginPolicy::SameHostOr(ref list) if list.is_empty()));
    }

    #[test]
    fn skipping_origin_check_is_refused_in_production() {
        let err = parse(&["--env", "production", "--insecure-skip-origin-check"])
            .expect_err("production rejects insecure origin policy");
        assert!(err.to_string().contains("not allowed in production"));

        let config = parse(&["--env", "development", "--insecure-skip-origin-check"])
            .expect("development may opt in");
        assert!(matches!(config.origin_policy, OriginPolicy::Disabled));
    }

    #[test]
    fn allowed_origins_accept_comma_lists() {
        let config = parse(&["--allowed-origin", "app.example.com,*.beach.dev"]).expect("valid");
        match config.origin_policy {
            OriginPolicy::SameHostOr(list) => {
                assert_eq!(list, vec!["app.example.com", "*.beach.dev"]);
            }
            other => panic!("unexpected policy {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse(&["--listen-addr", "not-an-addr"]).is_err());
        assert!(parse(&["--idle-timeout-secs", "0"]).is_err());
        assert!(parse(&["--write-timeout-secs", "0"]).is_err());
    }
}
