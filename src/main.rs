use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;

use strand_db::chunk::MIN_CHUNK_SIZE;
use strand_db::store::{
    DEFAULT_BROKER_CAPACITY, DEFAULT_CHUNK_SIZE, DEFAULT_DEDUP_CAPACITY, DEFAULT_WRITER_QUEUE,
};
use strand_db::{
    ReplicationCheckpoint, RunningStore, StorageFault, Store, StoreConfig, metrics, spawn_writer,
};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

/// Server configuration parsed from environment variables.
///
/// # Environment Variables
///
/// | Variable                 | Required | Default     | Description                         |
/// |--------------------------|----------|-------------|-------------------------------------|
/// | `STRAND_DATA`            | Yes      | --          | Directory holding the chunk files   |
/// | `STRAND_CHUNK_SIZE`      | No       | `268435456` | Data bytes per chunk (min 1024)     |
/// | `STRAND_WRITER_QUEUE`    | No       | `64`        | Queued writer commands              |
/// | `STRAND_DEDUP_CAPACITY`  | No       | `65536`     | Event IDs kept for replay detection |
/// | `STRAND_BROKER_CAPACITY` | No       | `4096`      | Completion broadcast buffer size    |
/// | `STRAND_METRICS_LISTEN`  | No       | --          | Serve `GET /metrics` on this address|
#[derive(Debug, Clone, PartialEq)]
struct Config {
    store: StoreConfig,
    metrics_listen: Option<SocketAddr>,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` naming the variable if `STRAND_DATA` is unset or
    /// any variable that is set fails to parse or is out of range.
    fn from_env() -> Result<Config, String> {
        let data_dir = std::env::var("STRAND_DATA")
            .map(PathBuf::from)
            .map_err(|_| "STRAND_DATA environment variable is required".to_string())?;

        let chunk_size: u64 = parse_var("STRAND_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(format!(
                "STRAND_CHUNK_SIZE must be at least {MIN_CHUNK_SIZE}, got {chunk_size}"
            ));
        }

        let writer_queue: usize = parse_var("STRAND_WRITER_QUEUE", DEFAULT_WRITER_QUEUE)?;
        if writer_queue == 0 {
            return Err("STRAND_WRITER_QUEUE must be nonzero".to_string());
        }

        let dedup_capacity: NonZeroUsize =
            parse_var("STRAND_DEDUP_CAPACITY", DEFAULT_DEDUP_CAPACITY)?;

        let broker_capacity: usize = parse_var("STRAND_BROKER_CAPACITY", DEFAULT_BROKER_CAPACITY)?;
        if broker_capacity == 0 {
            return Err("STRAND_BROKER_CAPACITY must be nonzero".to_string());
        }

        let metrics_listen = match std::env::var("STRAND_METRICS_LISTEN") {
            Ok(val) => Some(val.parse::<SocketAddr>().map_err(|e| {
                format!("STRAND_METRICS_LISTEN is not a valid socket address: {e}")
            })?),
            Err(_) => None,
        };

        Ok(Config {
            store: StoreConfig {
                data_dir,
                chunk_size,
                writer_queue,
                dedup_capacity,
                broker_capacity,
            },
            metrics_listen,
        })
    }
}

/// Value of `name` parsed as `T`, or `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| format!("{name} is not valid: {e}")),
        Err(_) => Ok(default),
    }
}

/// Initialize the global `tracing` subscriber, filtered by `RUST_LOG`
/// (default `info`). A second call is a no-op.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Waits for SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

/// Log how a pipeline task ended. Returns `false` if it ended badly.
fn task_ended(task: &str, result: Result<Result<(), StorageFault>, JoinError>) -> bool {
    match result {
        Ok(Ok(())) => {
            tracing::info!(task, "task stopped");
            true
        }
        Ok(Err(fault)) => {
            tracing::error!(task, error = %fault, "storage fault, stopping the service");
            false
        }
        Err(e) => {
            tracing::error!(task, error = %e, "task panicked");
            false
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        data_dir = %config.store.data_dir.display(),
        chunk_size = config.store.chunk_size,
        writer_queue = config.store.writer_queue,
        dedup_capacity = config.store.dedup_capacity.get(),
        broker_capacity = config.store.broker_capacity,
        "configuration loaded"
    );

    if let Some(addr) = config.metrics_listen {
        let handle = match metrics::install_recorder() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "failed to install metrics recorder");
                std::process::exit(1);
            }
        };
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                metrics::serve_metrics(handle, listener);
            }
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "failed to bind metrics listener");
                std::process::exit(1);
            }
        }
    }

    // On a single node everything flushed to disk counts as replicated.
    let store = match Store::open(config.store.clone(), i64::MAX) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to open store");
            std::process::exit(1);
        }
    };
    let replication = ReplicationCheckpoint::new(store.write_position());

    let shutdown = CancellationToken::new();
    let RunningStore {
        writer,
        writer_checkpoint,
        mut writer_task,
        mut committer_task,
        ..
    } = spawn_writer(store, &replication, shutdown.clone());
    let follower = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { replication.follow(writer_checkpoint, shutdown).await })
    };
    tracing::info!("store running");

    let mut healthy = true;
    let mut writer_done = false;
    let mut committer_done = false;
    tokio::select! {
        _ = shutdown_signal() => tracing::info!("shutting down"),
        result = &mut writer_task => {
            writer_done = true;
            healthy &= task_ended("log writer", result);
        }
        result = &mut committer_task => {
            committer_done = true;
            healthy &= task_ended("index committer", result);
        }
    }

    shutdown.cancel();
    drop(writer);
    if !writer_done {
        healthy &= task_ended("log writer", writer_task.await);
    }
    if !committer_done {
        healthy &= task_ended("index committer", committer_task.await);
    }
    let _ = follower.await;

    if !healthy {
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 6] = [
        "STRAND_DATA",
        "STRAND_CHUNK_SIZE",
        "STRAND_WRITER_QUEUE",
        "STRAND_DEDUP_CAPACITY",
        "STRAND_BROKER_CAPACITY",
        "STRAND_METRICS_LISTEN",
    ];

    /// Reset every variable, then set `data` as `STRAND_DATA` if given.
    fn reset_env(data: Option<&str>) {
        for var in VARS {
            // SAFETY: serial test -- no concurrent env mutation.
            unsafe { std::env::remove_var(var) };
        }
        if let Some(data) = data {
            // SAFETY: serial test -- no concurrent env mutation.
            unsafe { std::env::set_var("STRAND_DATA", data) };
        }
    }

    #[test]
    #[serial]
    fn defaults_when_only_data_set() {
        reset_env(Some("/tmp/strand"));
        let config = Config::from_env().expect("should succeed with STRAND_DATA set");
        assert_eq!(config.store, StoreConfig::new("/tmp/strand"));
        assert_eq!(config.metrics_listen, None);
    }

    #[test]
    #[serial]
    fn missing_data_returns_err() {
        reset_env(None);
        let msg = Config::from_env().expect_err("STRAND_DATA is unset");
        assert!(msg.contains("STRAND_DATA"), "got: {msg}");
    }

    #[test]
    #[serial]
    fn custom_values_are_parsed() {
        reset_env(Some("/tmp/strand"));
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe {
            std::env::set_var("STRAND_CHUNK_SIZE", "4096");
            std::env::set_var("STRAND_WRITER_QUEUE", "8");
            std::env::set_var("STRAND_DEDUP_CAPACITY", "10");
            std::env::set_var("STRAND_BROKER_CAPACITY", "16");
            std::env::set_var("STRAND_METRICS_LISTEN", "127.0.0.1:9100");
        }
        let config = Config::from_env().expect("should succeed");
        assert_eq!(config.store.chunk_size, 4096);
        assert_eq!(config.store.writer_queue, 8);
        assert_eq!(config.store.dedup_capacity.get(), 10);
        assert_eq!(config.store.broker_capacity, 16);
        assert_eq!(
            config.metrics_listen,
            Some("127.0.0.1:9100".parse().expect("valid address"))
        );
    }

    #[test]
    #[serial]
    fn chunk_size_below_minimum_returns_err() {
        reset_env(Some("/tmp/strand"));
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::set_var("STRAND_CHUNK_SIZE", "512") };
        let msg = Config::from_env().expect_err("chunk size too small");
        assert!(msg.contains("STRAND_CHUNK_SIZE"), "got: {msg}");
    }

    #[test]
    #[serial]
    fn zero_dedup_capacity_returns_err() {
        reset_env(Some("/tmp/strand"));
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::set_var("STRAND_DEDUP_CAPACITY", "0") };
        let msg = Config::from_env().expect_err("zero capacity");
        assert!(msg.contains("STRAND_DEDUP_CAPACITY"), "got: {msg}");
    }

    #[test]
    #[serial]
    fn invalid_metrics_address_returns_err() {
        reset_env(Some("/tmp/strand"));
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::set_var("STRAND_METRICS_LISTEN", "not-an-addr") };
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn init_tracing_does_not_panic() {
        init_tracing();
    }
}
