//! sdlkv CLI
//!
//! Operator command-line interface over the storage facade.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use crossbeam::channel;
use sdlkv::{BackendType, ChannelsAndEvents, Config, SdlError, SyncStorage};
use tracing_subscriber::{fmt, EnvFilter};

/// sdlkv CLI
#[derive(Parser, Debug)]
#[command(name = "sdlkv-cli")]
#[command(about = "CLI for the sdlkv shared data layer")]
#[command(version)]
struct Args {
    /// Backend: remote or inmemory
    #[arg(short, long, default_value = "remote")]
    backend: String,

    /// Store address (repeat for several shards)
    #[arg(short, long)]
    addr: Vec<String>,

    /// Store port, matched with --addr by position
    #[arg(short, long)]
    port: Vec<u16>,

    /// Read the connection settings from DBAAS_* environment variables
    #[arg(long)]
    from_env: bool,

    /// Namespace the command works in
    #[arg(short, long, default_value = "sdlkv")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that every endpoint answers
    Health,

    /// Get values by key
    Get {
        /// Keys to read
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Set a key-value pair
    Set { key: String, value: String },

    /// Replace a value only if it currently equals OLD
    SetIf { key: String, old: String, new: String },

    /// Set a key only if it does not exist
    SetIfNotExists { key: String, value: String },

    /// Remove keys
    Remove {
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Remove a key only if it currently equals VALUE
    RemoveIf { key: String, value: String },

    /// Find keys (and values) matching a glob pattern
    Find {
        #[arg(default_value = "*")]
        pattern: String,

        /// Print values too
        #[arg(long)]
        values: bool,
    },

    /// Remove every key of the namespace
    RemoveAll,

    /// Add members to a group
    AddMember {
        group: String,
        #[arg(required = true)]
        members: Vec<String>,
    },

    /// Remove members from a group
    RemoveMember {
        group: String,
        #[arg(required = true)]
        members: Vec<String>,
    },

    /// List the members of a group
    Members { group: String },

    /// Set a key and publish events on a channel
    Publish {
        key: String,
        value: String,

        /// Channel to publish on
        #[arg(short, long)]
        channel: String,

        /// Event to publish (repeatable)
        #[arg(short, long, required = true)]
        event: Vec<String>,
    },

    /// Subscribe channels and print events
    Listen {
        #[arg(required = true)]
        channels: Vec<String>,

        /// Stop after this many notifications
        #[arg(short, long)]
        count: Option<usize>,

        /// Stop after this many seconds
        #[arg(short, long)]
        timeout_secs: Option<u64>,
    },

    /// Acquire a lock, hold it, then release it
    Lock {
        name: String,

        /// Lock expiration in milliseconds
        #[arg(short, long, default_value = "10000")]
        expiration_ms: u64,

        /// How long to hold the lock in milliseconds
        #[arg(long, default_value = "1000")]
        hold_ms: u64,

        /// How long to keep retrying in milliseconds
        #[arg(short, long, default_value = "10000")]
        retry_timeout_ms: u64,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sdlkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> sdlkv::Result<()> {
    let config = build_config(&args)?;
    let sdl = SyncStorage::new(&config)?;
    let ns = args.namespace.as_str();

    match args.command {
        Commands::Health => {
            let active = sdl.is_active();
            println!("{}", if active { "healthy" } else { "unreachable" });
            if !active {
                return Err(SdlError::NotConnected(config.to_string()));
            }
        }
        Commands::Get { keys } => {
            for (key, value) in sdl.get(ns, keys)? {
                println!("{} = {}", key, String::from_utf8_lossy(&value));
            }
        }
        Commands::Set { key, value } => {
            sdl.set(ns, &single(key, value))?;
        }
        Commands::SetIf { key, old, new } => {
            println!("{}", sdl.set_if(ns, &key, old.as_bytes(), new.as_bytes())?);
        }
        Commands::SetIfNotExists { key, value } => {
            println!("{}", sdl.set_if_not_exists(ns, &key, value.as_bytes())?);
        }
        Commands::Remove { keys } => {
            sdl.remove(ns, keys)?;
        }
        Commands::RemoveIf { key, value } => {
            println!("{}", sdl.remove_if(ns, &key, value.as_bytes())?);
        }
        Commands::Find { pattern, values } => {
            if values {
                for (key, value) in sdl.find_and_get(ns, &pattern)? {
                    println!("{} = {}", key, String::from_utf8_lossy(&value));
                }
            } else {
                for key in sdl.find_keys(ns, &pattern)? {
                    println!("{}", key);
                }
            }
        }
        Commands::RemoveAll => {
            sdl.remove_all(ns)?;
        }
        Commands::AddMember { group, members } => {
            sdl.add_member(ns, &group, members)?;
        }
        Commands::RemoveMember { group, members } => {
            sdl.remove_member(ns, &group, members)?;
        }
        Commands::Members { group } => {
            let mut members: Vec<String> = sdl
                .get_members(ns, &group)?
                .iter()
                .map(|m| String::from_utf8_lossy(m).into_owned())
                .collect();
            members.sort();
            for member in members {
                println!("{}", member);
            }
        }
        Commands::Publish {
            key,
            value,
            channel,
            event,
        } => {
            let mut channels_and_events = ChannelsAndEvents::new();
            channels_and_events.insert(channel, event);
            sdl.set_and_publish(ns, &channels_and_events, &single(key, value))?;
        }
        Commands::Listen {
            channels,
            count,
            timeout_secs,
        } => listen(&sdl, ns, channels, count, timeout_secs.map(Duration::from_secs))?,
        Commands::Lock {
            name,
            expiration_ms,
            hold_ms,
            retry_timeout_ms,
        } => {
            let lock = sdl.get_lock_resource(ns, &name, Duration::from_millis(expiration_ms))?;
            if !lock.acquire(
                sdlkv::SyncLock::DEFAULT_RETRY_INTERVAL,
                Duration::from_millis(retry_timeout_ms),
            )? {
                return Err(SdlError::RejectedByBackend(format!(
                    "lock '{}' not acquired within {} ms",
                    name, retry_timeout_ms
                )));
            }
            println!("{}", lock);
            std::thread::sleep(Duration::from_millis(hold_ms));
            lock.release()?;
            println!("released");
        }
    }

    sdl.close();
    Ok(())
}

fn build_config(args: &Args) -> sdlkv::Result<Config> {
    if args.from_env {
        return Config::from_env();
    }
    let mut builder = Config::builder()
        .backend(BackendType::parse(&args.backend)?)
        .ports(args.port.clone());
    for addr in &args.addr {
        builder = builder.addr(addr.clone());
    }
    if args.addr.is_empty() {
        builder = builder.host("127.0.0.1");
    }
    Ok(builder.build())
}

fn single(key: String, value: String) -> HashMap<String, Vec<u8>> {
    let mut data = HashMap::with_capacity(1);
    data.insert(key, value.into_bytes());
    data
}

fn listen(
    sdl: &SyncStorage,
    ns: &str,
    channels: Vec<String>,
    count: Option<usize>,
    timeout: Option<Duration>,
) -> sdlkv::Result<()> {
    let (tx, rx) = channel::unbounded::<(String, Vec<String>)>();
    sdl.subscribe_channel(
        ns,
        move |channel: &str, events: &[String]| {
            let _ = tx.send((channel.to_string(), events.to_vec()));
        },
        channels,
    )?;
    sdl.start_event_listener()?;
    tracing::info!(ns, "listening, press Ctrl+C to stop");

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut received = 0usize;
    loop {
        if count.map(|c| received >= c).unwrap_or(false) {
            break;
        }
        let wait = match deadline {
            Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => break,
            },
            None => Duration::from_secs(1),
        };
        if let Ok((channel, events)) = rx.recv_timeout(wait) {
            println!("{}: {}", channel, events.join(", "));
            received += 1;
        }
    }
    Ok(())
}
