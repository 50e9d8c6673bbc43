// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! Command line and environment configuration for the `svcat` binary.
//!
//! Every flag can also be set through an `SVCAT_*` environment variable.
//! [`RunArgs::validate`] rejects combinations the engine cannot run with,
//! so bad configuration fails startup instead of the first reconcile.

use crate::constants::{
    DEFAULT_CONCURRENCY, DEFAULT_LEASE_DURATION_SECS, DEFAULT_LEASE_GRACE_SECS,
    DEFAULT_LEASE_NAME, DEFAULT_LISTEN_ADDRESS, DEFAULT_METRICS_PORT, DEFAULT_OSB_API_VERSION,
    DEFAULT_OSB_TIMEOUT_SECS, DEFAULT_ORPHAN_MITIGATION_ATTEMPTS, DEFAULT_POLL_INITIAL_SECS,
    DEFAULT_POLL_MAX_SECS, DEFAULT_RECONCILE_TIMEOUT_SECS,
    DEFAULT_RECONCILIATION_RETRY_DURATION_SECS,
};
use crate::context::Settings;
use crate::engine::EngineConfig;
use crate::reconcilers::generate_external_id;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

/// Namespace used for the lease when neither the flag nor `POD_NAMESPACE` is set.
pub const DEFAULT_LEASE_NAMESPACE: &str = "svcat-system";

/// svcat - Open Service Broker catalog controller for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "svcat", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the controller (default)
    Run,
    /// Print shell completions and exit
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Flags for the controller process.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct RunArgs {
    /// Address the admission webhook listens on
    #[arg(long, env = "SVCAT_LISTEN_ADDRESS", default_value = DEFAULT_LISTEN_ADDRESS)]
    pub listen_address: String,

    /// Port serving /metrics and /healthz
    #[arg(long, env = "SVCAT_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    #[arg(long, env = "SVCAT_BROKER_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub broker_concurrency: usize,

    #[arg(long, env = "SVCAT_INSTANCE_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub instance_concurrency: usize,

    #[arg(long, env = "SVCAT_BINDING_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub binding_concurrency: usize,

    /// Timeout for one OSB HTTP call
    #[arg(long, env = "SVCAT_OSB_TIMEOUT_SECS", default_value_t = DEFAULT_OSB_TIMEOUT_SECS)]
    pub osb_timeout_secs: u64,

    /// Timeout for one reconcile pass
    #[arg(long, env = "SVCAT_RECONCILE_TIMEOUT_SECS", default_value_t = DEFAULT_RECONCILE_TIMEOUT_SECS)]
    pub reconcile_timeout_secs: u64,

    #[arg(long, env = "SVCAT_POLL_INITIAL_SECS", default_value_t = DEFAULT_POLL_INITIAL_SECS)]
    pub poll_initial_secs: u64,

    #[arg(long, env = "SVCAT_POLL_MAX_SECS", default_value_t = DEFAULT_POLL_MAX_SECS)]
    pub poll_max_secs: u64,

    /// Deprovision or unbind attempts before orphan mitigation gives up
    #[arg(
        long,
        env = "SVCAT_ORPHAN_MITIGATION_ATTEMPTS",
        default_value_t = DEFAULT_ORPHAN_MITIGATION_ATTEMPTS
    )]
    pub orphan_mitigation_attempts: u32,

    /// How long an operation may keep failing before it is abandoned
    #[arg(
        long,
        env = "SVCAT_RECONCILIATION_RETRY_DURATION_SECS",
        default_value_t = DEFAULT_RECONCILIATION_RETRY_DURATION_SECS
    )]
    pub reconciliation_retry_duration_secs: u64,

    /// Cluster identifier sent to brokers; generated when empty
    #[arg(long, env = "SVCAT_CLUSTER_ID", default_value = "")]
    pub cluster_id: String,

    #[arg(long, env = "SVCAT_OSB_API_VERSION", default_value = DEFAULT_OSB_API_VERSION)]
    pub osb_api_version: String,

    /// Only the lease holder runs reconcilers
    #[arg(long, env = "SVCAT_ENABLE_LEADER_ELECTION", default_value_t = false)]
    pub enable_leader_election: bool,

    #[arg(long, env = "SVCAT_LEASE_NAME", default_value = DEFAULT_LEASE_NAME)]
    pub lease_name: String,

    /// Defaults to `POD_NAMESPACE`, then `svcat-system`
    #[arg(long, env = "SVCAT_LEASE_NAMESPACE")]
    pub lease_namespace: Option<String>,

    #[arg(long, env = "SVCAT_LEASE_DURATION_SECS", default_value_t = DEFAULT_LEASE_DURATION_SECS)]
    pub lease_duration_secs: u64,

    #[arg(long, env = "SVCAT_LEASE_GRACE_SECS", default_value_t = DEFAULT_LEASE_GRACE_SECS)]
    pub lease_grace_secs: u64,

    /// Watch namespaced kinds in this namespace only
    #[arg(long, env = "SVCAT_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,
}

/// Configuration rejected at startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--{0} must be at least 1")]
    ZeroValue(&'static str),

    #[error("--poll-max-secs ({max}) must not be below --poll-initial-secs ({initial})")]
    PollBounds { initial: u64, max: u64 },

    #[error("--lease-grace-secs ({grace}) must be below --lease-duration-secs ({duration})")]
    LeaseBounds { duration: u64, grace: u64 },

    #[error("invalid --listen-address {0:?}: {1}")]
    ListenAddress(String, String),
}

/// Leader election parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    pub duration_secs: u64,
    pub grace_secs: u64,
}

impl RunArgs {
    /// Check bounds that clap cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("broker-concurrency", self.broker_concurrency as u64),
            ("instance-concurrency", self.instance_concurrency as u64),
            ("binding-concurrency", self.binding_concurrency as u64),
            ("osb-timeout-secs", self.osb_timeout_secs),
            ("reconcile-timeout-secs", self.reconcile_timeout_secs),
            ("poll-initial-secs", self.poll_initial_secs),
            ("lease-duration-secs", self.lease_duration_secs),
        ];
        if let Some((flag, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue(*flag));
        }
        if self.poll_max_secs < self.poll_initial_secs {
            return Err(ConfigError::PollBounds {
                initial: self.poll_initial_secs,
                max: self.poll_max_secs,
            });
        }
        if self.enable_leader_election && self.lease_grace_secs >= self.lease_duration_secs {
            return Err(ConfigError::LeaseBounds {
                duration: self.lease_duration_secs,
                grace: self.lease_grace_secs,
            });
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Parsed webhook listen address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ListenAddress`] when the value is not `host:port`.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_address
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                ConfigError::ListenAddress(self.listen_address.clone(), e.to_string())
            })
    }

    #[must_use]
    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }

    /// Engine settings; an empty cluster ID is replaced by a random one.
    #[must_use]
    pub fn settings(&self) -> Settings {
        let cluster_id = if self.cluster_id.is_empty() {
            generate_external_id()
        } else {
            self.cluster_id.clone()
        };
        Settings {
            cluster_id,
            osb_api_version: self.osb_api_version.clone(),
            osb_timeout: Duration::from_secs(self.osb_timeout_secs),
            poll_initial: Duration::from_secs(self.poll_initial_secs),
            poll_max: Duration::from_secs(self.poll_max_secs),
            orphan_mitigation_attempts: self.orphan_mitigation_attempts,
            reconciliation_retry_duration: Duration::from_secs(
                self.reconciliation_retry_duration_secs,
            ),
            ..Settings::default()
        }
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            broker_concurrency: self.broker_concurrency,
            instance_concurrency: self.instance_concurrency,
            binding_concurrency: self.binding_concurrency,
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            watch_namespace: self.watch_namespace.clone(),
        }
    }

    /// Lease parameters, or `None` when leader election is off.
    #[must_use]
    pub fn lease(&self) -> Option<LeaseConfig> {
        if !self.enable_leader_election {
            return None;
        }
        let namespace = self
            .lease_namespace
            .clone()
            .or_else(|| std::env::var("POD_NAMESPACE").ok())
            .unwrap_or_else(|| DEFAULT_LEASE_NAMESPACE.to_string());
        Some(LeaseConfig {
            name: self.lease_name.clone(),
            namespace,
            duration_secs: self.lease_duration_secs,
            grace_secs: self.lease_grace_secs,
        })
    }
}

/// Write completions for `shell` to `out`.
pub fn write_completions(shell: Shell, out: &mut dyn Write) {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "svcat", out);
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod config_tests;
