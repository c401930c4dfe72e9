//! Configuration surface consumed at construction.

use std::{net::IpAddr, time::Duration};

use serde::{Deserialize, Serialize};

/// Ref ids below this value are never handed out.
pub const INITIAL_REF_ID: i64 = 0xffff_ffff + 1;

/// Coordination-service and allocation settings for one cluster member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Node group id. Masters and slaves of the same group share it.
    pub node_id: i16,
    /// Connection string of the backing coordination service (e.g. `host1:2181,host2:2181`)
    pub connect_string: String,
    /// Root path of this grid in the coordination tree
    #[serde(default = "default_root")]
    pub root: String,
    /// Upper bound on closing the coordination session; the store expires
    /// the session on its own after this long
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Address advertised to peers. Resolved from the local interface when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<IpAddr>,
    #[serde(default = "default_initial_ref_id")]
    pub initial_ref_id: i64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ClusterConfig {
    pub fn new(node_id: i16, connect_string: impl Into<String>) -> Self {
        Self {
            node_id,
            connect_string: connect_string.into(),
            root: default_root(),
            session_timeout_ms: default_session_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            host_ip: None,
            initial_ref_id: default_initial_ref_id(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_host_ip(mut self, ip: IpAddr) -> Self {
        self.host_ip = Some(ip);
        self
    }

    pub fn with_initial_ref_id(mut self, initial_ref_id: i64) -> Self {
        self.initial_ref_id = initial_ref_id;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn node_names_path(&self) -> String {
        format!("{}/node_names", self.root)
    }

    pub fn ref_counter_path(&self) -> String {
        format!("{}/ref_counter", self.root)
    }

    pub fn root_lock_path(&self, id: i32) -> String {
        format!("{}/root_locks/{}", self.root, id)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.connect_string.trim().is_empty() {
            return Err("connect_string should not be empty".to_string());
        }
        if !self.root.starts_with('/') || self.root.ends_with('/') {
            return Err(format!(
                "root must be an absolute path without trailing slash, got {}",
                self.root
            ));
        }
        if self.node_id < 0 {
            return Err(format!("node_id must not be negative, got {}", self.node_id));
        }
        if self.initial_ref_id <= 0 {
            return Err("initial_ref_id must be positive".to_string());
        }
        if self.session_timeout_ms == 0 || self.connection_timeout_ms == 0 {
            return Err("timeouts must be greater than zero".to_string());
        }
        self.retry.validate()
    }
}

fn default_root() -> String {
    "/grid".to_string()
}

fn default_session_timeout_ms() -> u64 {
    15_000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_initial_ref_id() -> i64 {
    INITIAL_REF_ID
}

/// Retry parameters for coordination-service calls and the counter loops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Base delay of the exponential backoff applied to transient store failures
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Retries after the first attempt for transient store failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed sleep between counter compare-and-set attempts
    #[serde(default = "default_cas_interval_ms")]
    pub cas_interval_ms: u64,
    #[serde(default = "default_cas_max_attempts")]
    pub cas_max_attempts: u32,
    /// Fixed delay between readiness polls of the ref counter
    #[serde(default = "default_counter_poll_ms")]
    pub counter_poll_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_retries: default_max_retries(),
            cas_interval_ms: default_cas_interval_ms(),
            cas_max_attempts: default_cas_max_attempts(),
            counter_poll_ms: default_counter_poll_ms(),
        }
    }
}

impl RetryConfig {
    pub fn cas_interval(&self) -> Duration {
        Duration::from_millis(self.cas_interval_ms)
    }

    pub fn counter_poll(&self) -> Duration {
        Duration::from_millis(self.counter_poll_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err(format!(
                "base_delay_ms ({}) must not exceed max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            ));
        }
        if self.cas_max_attempts == 0 {
            return Err("cas_max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

fn default_base_delay_ms() -> u64 {
    20
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    20
}

fn default_cas_interval_ms() -> u64 {
    500
}

fn default_cas_max_attempts() -> u32 {
    120
}

fn default_counter_poll_ms() -> u64 {
    500
}

/// Bind/advertise settings for the node transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Listening port of the server role. `0` lets the OS pick one; the bound
    /// port is what gets published.
    #[serde(default)]
    pub server_port: u16,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Delay between attempts of a client connecting to its server
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            server_port: 0,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_frame_bytes < 64 {
            return Err("max_frame_bytes must be at least 64".to_string());
        }
        if self.handshake_timeout_ms == 0 {
            return Err("handshake_timeout_ms must be greater than zero".to_string());
        }
        if self.reconnect_interval_ms == 0 {
            return Err("reconnect_interval_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_reconnect_interval_ms() -> u64 {
    1_000
}

/// Top-level configuration of one grid member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshConfig {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl MeshConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.cluster.validate()?;
        self.transport.validate()
    }
}
