//! Configuration for sdlkv
//!
//! Resolves the store endpoints, optional sentinel discovery endpoints and
//! the backend selection. Centralized configuration with sensible defaults.

use std::fmt;

use crate::error::{Result, SdlError};

/// Port used when an address has no configured port
pub const DEFAULT_PORT: u16 = 6379;

/// Main configuration for a storage instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Backend Selection
    // -------------------------------------------------------------------------
    /// Which backend variant serves the facade, chosen once at construction
    pub backend: BackendType,

    // -------------------------------------------------------------------------
    // Endpoint Configuration
    // -------------------------------------------------------------------------
    /// Single service host, used as the only address when `addrs` is empty
    pub host: String,

    /// Store addresses; each address is one shard
    pub addrs: Vec<String>,

    /// Store ports, positionally matched with `addrs`
    pub ports: Vec<u16>,

    /// Sentinel ports; when non-empty, masters are discovered through sentinels
    pub sentinel_ports: Vec<u16>,

    /// Sentinel master names, positionally matched with `addrs`
    pub sentinel_master_names: Vec<String>,

    // -------------------------------------------------------------------------
    // Connection Configuration
    // -------------------------------------------------------------------------
    /// Max pooled connections per endpoint
    pub max_connections: u32,

    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Read timeout of the pub/sub reader between control checks (milliseconds)
    pub subscriber_poll_ms: u64,
}

/// Backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Networked store, coherent across processes
    Remote,

    /// Process-local double for tests and offline development
    InMemory,
}

impl BackendType {
    /// Parse the value of `SDL_BACKEND`
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "remote" | "redis" => Ok(BackendType::Remote),
            "inmemory" | "in-memory" | "memory" | "dict" => Ok(BackendType::InMemory),
            other => Err(SdlError::Config(format!(
                "unsupported backend '{}', expected 'remote' or 'inmemory'",
                other
            ))),
        }
    }
}

/// One resolved store endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Connect straight to the store
    Direct { host: String, port: u16 },

    /// Ask the sentinel at `host:port` for the master named `master_name`
    Sentinel {
        host: String,
        port: u16,
        master_name: String,
    },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Direct { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Sentinel {
                host,
                port,
                master_name,
            } => write!(f, "sentinel {}:{} master '{}'", host, port, master_name),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendType::Remote,
            host: String::new(),
            addrs: Vec::new(),
            ports: Vec::new(),
            sentinel_ports: Vec::new(),
            sentinel_master_names: Vec::new(),
            max_connections: 20,
            connect_timeout_ms: 5000,
            subscriber_poll_ms: 50,
        }
    }
}

impl Config {
    // =========================================================================
    // Environment Variable Names
    // =========================================================================
    pub const ENV_HOST: &'static str = "DBAAS_SERVICE_HOST";
    pub const ENV_PORTS: &'static str = "DBAAS_SERVICE_PORT";
    pub const ENV_SENTINEL_PORTS: &'static str = "DBAAS_SERVICE_SENTINEL_PORT";
    pub const ENV_MASTER_NAMES: &'static str = "DBAAS_MASTER_NAME";
    pub const ENV_ADDRS: &'static str = "DBAAS_CLUSTER_ADDR_LIST";
    pub const ENV_BACKEND: &'static str = "SDL_BACKEND";

    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Config selecting the in-memory backend
    pub fn in_memory() -> Self {
        Self {
            backend: BackendType::InMemory,
            ..Self::default()
        }
    }

    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = match lookup(Self::ENV_BACKEND) {
            Some(value) if !value.is_empty() => BackendType::parse(&value)?,
            _ => BackendType::Remote,
        };

        let list = |name: &str| -> Vec<String> {
            lookup(name)
                .map(|value| value.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default()
        };

        let host = lookup(Self::ENV_HOST).unwrap_or_default();
        let ports = parse_ports(Self::ENV_PORTS, &list(Self::ENV_PORTS))?;
        let sentinel_ports = parse_ports(Self::ENV_SENTINEL_PORTS, &list(Self::ENV_SENTINEL_PORTS))?;

        let mut builder = Config::builder()
            .backend(backend)
            .host(host)
            .ports(ports)
            .sentinel_ports(sentinel_ports)
            .sentinel_master_names(list(Self::ENV_MASTER_NAMES));

        for addr in list(Self::ENV_ADDRS) {
            builder = builder.addr(addr);
        }

        Ok(builder.build())
    }

    /// Resolve one endpoint per store address
    ///
    /// Applies the completion rules:
    /// 1. No addresses but a host: the host is the only address
    /// 2. Without sentinels: pad a non-empty port list by repeating its last
    ///    port, default the rest to 6379
    /// 3. With sentinels: pad sentinel ports, and a non-empty master-name list,
    ///    the same way
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut addrs: Vec<String> = self
            .addrs
            .iter()
            .filter(|addr| !addr.is_empty())
            .cloned()
            .collect();
        if addrs.is_empty() && !self.host.is_empty() {
            addrs.push(self.host.clone());
        }

        if self.sentinel_ports.is_empty() {
            let ports = pad_to(&self.ports, addrs.len());
            addrs
                .into_iter()
                .enumerate()
                .map(|(i, host)| Endpoint::Direct {
                    host,
                    port: ports.get(i).copied().unwrap_or(DEFAULT_PORT),
                })
                .collect()
        } else {
            let ports = pad_to(&self.sentinel_ports, addrs.len());
            let names = pad_to(&self.sentinel_master_names, addrs.len());
            addrs
                .into_iter()
                .enumerate()
                .map(|(i, host)| Endpoint::Sentinel {
                    host,
                    port: ports[i],
                    master_name: names.get(i).cloned().unwrap_or_default(),
                })
                .collect()
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoints: Vec<String> = self.endpoints().iter().map(|e| e.to_string()).collect();
        write!(
            f,
            "backend={:?} host='{}' endpoints=[{}] max_connections={}",
            self.backend,
            self.host,
            endpoints.join(", "),
            self.max_connections
        )
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Select the backend variant
    pub fn backend(mut self, backend: BackendType) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set the single service host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Append a store address
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addrs.push(addr.into());
        self
    }

    /// Set the store ports
    pub fn ports(mut self, ports: Vec<u16>) -> Self {
        self.config.ports = ports;
        self
    }

    /// Set the sentinel ports
    pub fn sentinel_ports(mut self, ports: Vec<u16>) -> Self {
        self.config.sentinel_ports = ports;
        self
    }

    /// Set the sentinel master names
    pub fn sentinel_master_names(mut self, names: Vec<String>) -> Self {
        self.config.sentinel_master_names = names;
        self
    }

    /// Set the pool size per endpoint
    pub fn max_connections(mut self, count: u32) -> Self {
        self.config.max_connections = count;
        self
    }

    /// Set the connect timeout (in milliseconds)
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    /// Set the pub/sub read timeout (in milliseconds)
    pub fn subscriber_poll_ms(mut self, ms: u64) -> Self {
        self.config.subscriber_poll_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn parse_ports(var: &str, values: &[String]) -> Result<Vec<u16>> {
    values
        .iter()
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<u16>()
                .map_err(|_| SdlError::Config(format!("invalid port '{}' in {}", v, var)))
        })
        .collect()
}

/// Pad `values` to `len` by repeating its last element; empty stays empty
fn pad_to<T: Clone>(values: &[T], len: usize) -> Vec<T> {
    let mut out = values.to_vec();
    if let Some(last) = values.last() {
        while out.len() < len {
            out.push(last.clone());
        }
    }
    out
}
