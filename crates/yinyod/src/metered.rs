//! API traffic accounting.
//!
//! Requests that arrived through the cluster's public load balancer carry
//! an `X-Forwarded-For` header; only those count against a run's API
//! network usage. Request and response bodies are wrapped in a counting
//! body, and the totals are recorded once the response body has been
//! fully written (or dropped).

use crate::server::AppState;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use bytes::Bytes;
use http_body::Frame;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::warn;

/// Extract the run id from `/runs/{id}/...` paths.
fn run_id_from_path(path: &str) -> Option<&str> {
    let mut segments = path.split('/');
    if segments.next() != Some("") || segments.next() != Some("runs") {
        return None;
    }
    match segments.next() {
        Some(id) if !id.is_empty() => Some(id),
        _ => None,
    }
}

/// Middleware recording externally transferred bytes per run.
pub async fn record_traffic(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let external = request.headers().contains_key("x-forwarded-for");
    let run_id = run_id_from_path(request.uri().path()).map(str::to_string);

    let (Some(run_id), true) = (run_id, external) else {
        return next.run(request).await;
    };

    let bytes_read = Arc::new(AtomicU64::new(0));
    let bytes_written = Arc::new(AtomicU64::new(0));

    let (parts, body) = request.into_parts();
    let counted = CountingBody::new(body, Arc::clone(&bytes_read), None);
    let request = Request::from_parts(parts, Body::new(counted));

    let response = next.run(request).await;

    let reporter = UsageReporter {
        state,
        run_id,
        bytes_read,
        bytes_written: Arc::clone(&bytes_written),
    };
    let (parts, body) = response.into_parts();
    let counted = CountingBody::new(body, bytes_written, Some(reporter));
    Response::from_parts(parts, Body::new(counted))
}

/// Records the counters against the run once the response is complete.
struct UsageReporter {
    state: Arc<AppState>,
    run_id: String,
    bytes_read: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
}

impl UsageReporter {
    fn report(self) {
        let network_in = self.bytes_read.load(Ordering::Relaxed);
        let network_out = self.bytes_written.load(Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(err) = self
                .state
                .app
                .record_api_network_usage(&self.run_id, network_in, network_out)
                .await
            {
                warn!(run_id = %self.run_id, error = %err, "failed to record API network usage");
            }
        });
    }
}

/// Body wrapper that counts every data byte flowing through it.
struct CountingBody {
    inner: Body,
    counter: Arc<AtomicU64>,
    reporter: Option<UsageReporter>,
}

impl CountingBody {
    fn new(inner: Body, counter: Arc<AtomicU64>, reporter: Option<UsageReporter>) -> Self {
        Self {
            inner,
            counter,
            reporter,
        }
    }

    fn finish(&mut self) {
        if let Some(reporter) = self.reporter.take() {
            reporter.report();
        }
    }
}

impl http_body::Body for CountingBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.counter.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CountingBody {
    fn drop(&mut self) {
        // Covers responses that are dropped before being fully written.
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_extracted_from_per_run_paths() {
        assert_eq!(run_id_from_path("/runs/run-abc/app"), Some("run-abc"));
        assert_eq!(run_id_from_path("/runs/run-abc"), Some("run-abc"));
        assert_eq!(run_id_from_path("/runs"), None);
        assert_eq!(run_id_from_path("/runs/"), None);
        assert_eq!(run_id_from_path("/"), None);
        assert_eq!(run_id_from_path("/other/run-abc"), None);
    }
}
