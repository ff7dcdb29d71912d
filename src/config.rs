//! Configuration for Agora
//!
//! CLI arguments and environment variable handling using clap. [`NodeConfig`]
//! is the part the library needs; tests build it directly.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use uuid::Uuid;

use crate::directory::well_known::WellKnownConfig;
use crate::methods::MethodConfig;

/// Agora - federated social index node
#[derive(Parser, Debug, Clone)]
#[command(name = "agora")]
#[command(about = "Federated social index node")]
pub struct Args {
    /// Unique identifier of this node instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Domain users of this node live under (`name@domain`)
    #[arg(long, env = "DOMAIN", default_value = "localhost:3000")]
    pub domain: String,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// Enable development mode (seeds a demo citizen)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Delay between method result polls
    #[arg(long, env = "METHOD_POLL_INTERVAL_MS", default_value = "5000")]
    pub method_poll_interval_ms: u64,

    /// Lower bound of a method result wait
    #[arg(long, env = "METHOD_TIMEOUT_MIN_MS", default_value = "5000")]
    pub method_timeout_min_ms: u64,

    /// Upper bound of a method result wait
    #[arg(long, env = "METHOD_TIMEOUT_MAX_MS", default_value = "60000")]
    pub method_timeout_max_ms: u64,

    /// How long resolved remote users stay cached
    #[arg(long, env = "DIRECTORY_CACHE_TTL_SECS", default_value = "300")]
    pub directory_cache_ttl_secs: u64,

    /// Timeout of outgoing federation requests
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "5000")]
    pub request_timeout_ms: u64,

    /// Talk to other nodes over plain http (local testing only)
    #[arg(long, env = "INSECURE_FEDERATION", default_value = "false")]
    pub insecure_federation: bool,
}

impl Args {
    pub fn federation_scheme(&self) -> &'static str {
        if self.insecure_federation {
            "http"
        } else {
            "https"
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.domain.trim().is_empty() || self.domain.contains('@') || self.domain.contains('/') {
            return Err(format!("DOMAIN is not a valid host: {:?}", self.domain));
        }
        if self.method_poll_interval_ms == 0 {
            return Err("METHOD_POLL_INTERVAL_MS must be greater than zero".to_string());
        }
        if self.method_timeout_min_ms > self.method_timeout_max_ms {
            return Err(
                "METHOD_TIMEOUT_MIN_MS must be less than or equal to METHOD_TIMEOUT_MAX_MS"
                    .to_string(),
            );
        }
        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }
        if self.insecure_federation && !self.dev_mode {
            return Err("INSECURE_FEDERATION requires DEV_MODE".to_string());
        }
        Ok(())
    }

    pub fn well_known_config(&self) -> WellKnownConfig {
        WellKnownConfig {
            cache_ttl: Duration::from_secs(self.directory_cache_ttl_secs),
            request_timeout: self.request_timeout(),
            scheme: self.federation_scheme(),
            ..Default::default()
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            node_id: self.node_id,
            domain: self.domain.clone(),
            method: MethodConfig {
                poll_interval: Duration::from_millis(self.method_poll_interval_ms),
                timeout_min: Duration::from_millis(self.method_timeout_min_ms),
                timeout_max: Duration::from_millis(self.method_timeout_max_ms),
            },
            watch_changes: true,
        }
    }
}

/// What a [`crate::node::Node`] needs to start.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: Uuid,
    pub domain: String,
    pub method: MethodConfig,
    /// Spawn a watcher per database so indexes follow writes on their own.
    pub watch_changes: bool,
}

impl NodeConfig {
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ..Default::default()
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4(),
            domain: "localhost".to_string(),
            method: MethodConfig::default(),
            watch_changes: false,
        }
    }
}
