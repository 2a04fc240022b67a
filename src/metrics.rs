//! Prometheus metrics for StrandDB.
//!
//! The write path records through the `metrics` facade. The binary installs
//! a Prometheus recorder once at startup and, when configured, serves the
//! rendered snapshot at `GET /metrics` with axum.

use std::sync::{Arc, OnceLock};

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::response::AppendResponse;

/// Appends answered, labelled by `result`.
pub const APPENDS_TOTAL: &str = "strand_appends_total";
/// Deletes answered, labelled by `result`.
pub const DELETES_TOTAL: &str = "strand_deletes_total";
/// Transactions written to the log, undelete markers included.
pub const TRANSACTIONS_WRITTEN_TOTAL: &str = "strand_transactions_written_total";
/// Soft-deleted streams brought back by a write.
pub const SOFT_UNDELETES_TOTAL: &str = "strand_soft_undeletes_total";
/// Transactions applied to the lookup index.
pub const INDEX_COMMITS_TOTAL: &str = "strand_index_commits_total";
/// Transactions written but not yet indexed.
pub const TRANSACTIONS_PENDING: &str = "strand_transactions_pending";
/// End of the flushed log.
pub const LOG_POSITION: &str = "strand_log_position";

/// Error type for metrics installation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The global metrics recorder has already been installed.
    #[error("metrics recorder already installed")]
    AlreadyInstalled,

    /// The Prometheus recorder could not be built or registered.
    #[error("failed to install metrics recorder: {0}")]
    Install(String),
}

/// Cheaply cloneable handle to the installed recorder.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    inner: Arc<PrometheusHandle>,
}

impl MetricsHandle {
    /// Render the current snapshot in Prometheus text format.
    pub fn render(&self) -> String {
        self.inner.render()
    }
}

static RECORDER_HANDLE: OnceLock<MetricsHandle> = OnceLock::new();

/// Install the global Prometheus recorder and describe every StrandDB metric.
///
/// # Errors
///
/// - [`MetricsError::AlreadyInstalled`] on every call after the first
///   successful one.
/// - [`MetricsError::Install`] if another recorder owns the global slot.
pub fn install_recorder() -> Result<MetricsHandle, MetricsError> {
    if RECORDER_HANDLE.get().is_some() {
        return Err(MetricsError::AlreadyInstalled);
    }
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;
    let handle = MetricsHandle {
        inner: Arc::new(prometheus),
    };
    RECORDER_HANDLE
        .set(handle.clone())
        .map_err(|_| MetricsError::AlreadyInstalled)?;
    describe_metrics();
    Ok(handle)
}

/// The installed handle, if [`install_recorder`] has succeeded.
pub fn get_installed_handle() -> Option<MetricsHandle> {
    RECORDER_HANDLE.get().cloned()
}

fn describe_metrics() {
    metrics::describe_counter!(APPENDS_TOTAL, "Append requests answered, by result");
    metrics::describe_counter!(DELETES_TOTAL, "Delete requests answered, by result");
    metrics::describe_counter!(
        TRANSACTIONS_WRITTEN_TOTAL,
        "Transactions written to the log"
    );
    metrics::describe_counter!(
        SOFT_UNDELETES_TOTAL,
        "Soft-deleted streams undeleted by a write"
    );
    metrics::describe_counter!(
        INDEX_COMMITS_TOTAL,
        "Transactions applied to the lookup index"
    );
    metrics::describe_gauge!(
        TRANSACTIONS_PENDING,
        "Transactions written but not yet indexed"
    );
    metrics::describe_gauge!(LOG_POSITION, "Log position of the last flushed transaction");
}

/// `result` label for an answered (or unanswered) request.
pub fn outcome_label(response: Option<&AppendResponse>) -> &'static str {
    match response {
        None => "no_reply",
        Some(AppendResponse::Success { .. }) => "success",
        Some(AppendResponse::WrongExpectedVersion { .. }) => "wrong_expected_version",
        Some(AppendResponse::StreamDeleted { .. }) => "stream_deleted",
        Some(AppendResponse::InvalidTransaction) => "invalid_transaction",
        Some(AppendResponse::AccessDenied) => "access_denied",
        Some(AppendResponse::Timeout) => "timeout",
    }
}

fn metrics_router(handle: MetricsHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move {
                (
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    handle.render(),
                )
            }
        }),
    )
}

/// Serve `GET /metrics` on an already bound listener, in a spawned task.
pub fn serve_metrics(handle: MetricsHandle, listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "metrics server listening");
        }
        if let Err(e) = axum::serve(listener, metrics_router(handle)).await {
            tracing::error!(error = %e, "metrics server error");
        }
    })
}
