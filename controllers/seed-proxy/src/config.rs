//! Controller configuration.
//!
//! Read once from the environment at startup. Unset variables fall back to
//! their defaults; set but unparsable values are fatal.

use crate::error::ControllerError;
use control_loop::{ControllerOptions, ExponentialBackoff};
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SEEDS_FILE: &str = "/etc/kubermatic/seeds.yaml";
const DEFAULT_PROXY_IMAGE: &str = "bitnami/kubectl:1.30";

/// Runtime configuration of the seed-proxy controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Number of seeds reconciled concurrently (`WORKER_COUNT`)
    pub worker_count: usize,
    /// YAML file listing the seeds (`SEEDS_FILE`)
    pub seeds_file: PathBuf,
    /// Image running `kubectl proxy` (`PROXY_IMAGE`)
    pub proxy_image: String,
    /// Listen address of the metrics and probes server (`METRICS_BIND_ADDRESS`)
    pub metrics_bind_address: SocketAddr,
    /// Time in-flight reconciliations get on shutdown (`SHUTDOWN_GRACE_SECONDS`)
    pub shutdown_grace: Duration,
    /// Time the caches get to sync on startup (`CACHE_SYNC_TIMEOUT_SECONDS`)
    pub cache_sync_timeout: Duration,
    /// First retry delay of a failed seed (`BACKOFF_BASE_MILLIS`)
    pub backoff_base: Duration,
    /// Retry delay cap (`BACKOFF_MAX_SECONDS`)
    pub backoff_max: Duration,
}

impl ControllerConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of
    /// a variable or `None` when it is unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let worker_count: usize = parse_or(&lookup, "WORKER_COUNT", 1)?;
        if worker_count == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKER_COUNT must be at least 1".to_string(),
            ));
        }

        let backoff_base = Duration::from_millis(parse_or(&lookup, "BACKOFF_BASE_MILLIS", 5)?);
        let backoff_max = Duration::from_secs(parse_or(&lookup, "BACKOFF_MAX_SECONDS", 1000)?);
        if backoff_base.is_zero() || backoff_base > backoff_max {
            return Err(ControllerError::InvalidConfig(format!(
                "BACKOFF_BASE_MILLIS must be positive and not exceed BACKOFF_MAX_SECONDS (got {backoff_base:?} and {backoff_max:?})"
            )));
        }

        let proxy_image = lookup("PROXY_IMAGE").unwrap_or_else(|| DEFAULT_PROXY_IMAGE.to_string());
        if proxy_image.trim().is_empty() {
            return Err(ControllerError::InvalidConfig(
                "PROXY_IMAGE must not be empty".to_string(),
            ));
        }

        Ok(Self {
            worker_count,
            seeds_file: lookup("SEEDS_FILE")
                .map_or_else(|| PathBuf::from(DEFAULT_SEEDS_FILE), PathBuf::from),
            proxy_image,
            metrics_bind_address: parse_or(
                &lookup,
                "METRICS_BIND_ADDRESS",
                SocketAddr::from(([0, 0, 0, 0], 8085)),
            )?,
            shutdown_grace: Duration::from_secs(parse_or(&lookup, "SHUTDOWN_GRACE_SECONDS", 30)?),
            cache_sync_timeout: Duration::from_secs(parse_or(
                &lookup,
                "CACHE_SYNC_TIMEOUT_SECONDS",
                60,
            )?),
            backoff_base,
            backoff_max,
        })
    }

    /// Worker pool options derived from this configuration
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            concurrency: self.worker_count,
            backoff: ExponentialBackoff::new(self.backoff_base, self.backoff_max),
            shutdown_grace: self.shutdown_grace,
            cache_sync_timeout: self.cache_sync_timeout,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            seeds_file: PathBuf::from(DEFAULT_SEEDS_FILE),
            proxy_image: DEFAULT_PROXY_IMAGE.to_string(),
            metrics_bind_address: SocketAddr::from(([0, 0, 0, 0], 8085)),
            shutdown_grace: Duration::from_secs(30),
            cache_sync_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ControllerError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("{key}={raw:?} is invalid: {e}"))
        }),
    }
}
