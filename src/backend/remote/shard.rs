//! One store endpoint: connection pool, pub/sub reader and event dispatcher

use std::time::Duration;

use parking_lot::Mutex;
use r2d2::{ManageConnection, Pool, PooledConnection};
use redis::sentinel::{SentinelClient, SentinelServerType};
use redis::{Client, Connection, ConnectionLike, RedisError};

use crate::config::{Config, Endpoint};
use crate::error::{Result, SdlError};
use crate::events::EventDispatcher;

use super::subscriber::{ReadTimeouts, Subscriber};

/// Keys requested per SCAN round trip
const SCAN_COUNT: usize = 1000;

// =============================================================================
// Connection Manager
// =============================================================================

enum Source {
    Direct(Client),
    // SentinelClient::get_connection takes &mut self
    Sentinel(Mutex<SentinelClient>),
}

/// Opens connections to one endpoint, resolving the master through the
/// sentinel on every connect so a failover is picked up by new connections
pub struct EndpointManager {
    source: Source,
    connect_timeout: Duration,
}

impl EndpointManager {
    pub fn new(endpoint: &Endpoint, connect_timeout: Duration) -> Result<Self> {
        let source = match endpoint {
            Endpoint::Direct { host, port } => {
                let client = Client::open(format!("redis://{}:{}/0", host, port))
                    .map_err(|e| SdlError::Config(format!("invalid endpoint {}: {}", endpoint, e)))?;
                Source::Direct(client)
            }
            Endpoint::Sentinel {
                host,
                port,
                master_name,
            } => {
                let client = SentinelClient::build(
                    vec![format!("redis://{}:{}", host, port)],
                    master_name.clone(),
                    None,
                    SentinelServerType::Master,
                )
                .map_err(|e| SdlError::Config(format!("invalid endpoint {}: {}", endpoint, e)))?;
                Source::Sentinel(Mutex::new(client))
            }
        };
        Ok(Self {
            source,
            connect_timeout,
        })
    }
}

impl ManageConnection for EndpointManager {
    type Connection = Connection;
    type Error = RedisError;

    fn connect(&self) -> std::result::Result<Connection, RedisError> {
        match &self.source {
            Source::Direct(client) => client.get_connection_with_timeout(self.connect_timeout),
            Source::Sentinel(client) => client.lock().get_connection(),
        }
    }

    fn is_valid(&self, conn: &mut Connection) -> std::result::Result<(), RedisError> {
        redis::cmd("PING").query::<()>(conn)
    }

    fn has_broken(&self, conn: &mut Connection) -> bool {
        !conn.is_open()
    }
}

// =============================================================================
// Shard
// =============================================================================

/// Everything bound to one endpoint
pub struct Shard {
    pub endpoint: Endpoint,
    pool: Pool<EndpointManager>,
    pub dispatcher: EventDispatcher,
    pub subscriber: Subscriber,
}

impl Shard {
    /// Prepare a shard without touching the network
    ///
    /// Connections are opened on first use, so construction succeeds while
    /// the store is still unreachable.
    pub fn new(index: usize, endpoint: Endpoint, config: &Config) -> Result<Self> {
        let connect_timeout = Duration::from_millis(config.connect_timeout_ms.max(1));

        let pool = Pool::builder()
            .max_size(config.max_connections.max(1))
            .min_idle(Some(0))
            .test_on_check_out(false)
            .connection_timeout(connect_timeout)
            .build_unchecked(EndpointManager::new(&endpoint, connect_timeout)?);

        let label = format!("shard{}", index);
        let dispatcher = EventDispatcher::new(label.clone());
        let subscriber = Subscriber::new(
            label,
            EndpointManager::new(&endpoint, connect_timeout)?,
            dispatcher.sender(),
            read_timeouts(config),
        );

        Ok(Self {
            endpoint,
            pool,
            dispatcher,
            subscriber,
        })
    }

    /// Check out a pooled connection
    pub fn conn(&self) -> Result<PooledConnection<EndpointManager>> {
        self.pool.get().map_err(|e| {
            tracing::warn!(endpoint = %self.endpoint, "no connection: {}", e);
            SdlError::NotConnected(format!("{}: {}", self.endpoint, e))
        })
    }

    /// Whether the endpoint answers a PING
    pub fn ping(&self) -> Result<bool> {
        let mut conn = self.conn()?;
        let reply: String = redis::cmd("PING").query(&mut *conn)?;
        Ok(reply == "PONG")
    }

    /// Stop the pub/sub reader and the delivery thread
    pub fn close(&self) {
        self.subscriber.shutdown();
        self.dispatcher.shutdown();
    }
}

/// Collect every key matching `pattern` with a cursor-driven SCAN
///
/// SCAN may report a key more than once; the result is sorted and deduplicated.
pub fn scan_keys(conn: &mut Connection, pattern: &str) -> Result<Vec<String>> {
    let mut cursor: u64 = 0;
    let mut keys = Vec::new();
    loop {
        let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query(&mut *conn)?;
        keys.extend(batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
}

/// Index of the shard owning a namespace
pub fn shard_index(ns: &str, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    crc32fast::hash(ns.as_bytes()) as usize % shard_count
}

/// Reader timeouts: the configured poll interval for messages, the connect
/// timeout for subscription confirmations
fn read_timeouts(config: &Config) -> ReadTimeouts {
    ReadTimeouts {
        poll: Duration::from_millis(config.subscriber_poll_ms.max(1)),
        control: Duration::from_millis(config.connect_timeout_ms.max(1)),
    }
}
